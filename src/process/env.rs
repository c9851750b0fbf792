//! Host environment helpers for subprocesses

use std::collections::HashMap;
use std::env;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Command;

pub fn env_flag(name: &str) -> bool {
    matches!(
        env::var(name)
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
            .as_str(),
        "1" | "true" | "yes" | "on"
    )
}

pub fn find_in_path(binary: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|entry| entry.join(binary))
        .find(|candidate| candidate.exists())
}

pub fn is_flatpak() -> bool {
    Path::new("/.flatpak-info").exists()
}

/// Build a command for a host program. Inside the Flatpak sandbox Steam and
/// its tools live on the host, so they go through the portal.
pub fn command_for(exe: impl AsRef<OsStr>) -> Command {
    if is_flatpak() {
        let mut cmd = Command::new("flatpak-spawn");
        cmd.arg("--host").arg(exe);
        return cmd;
    }
    Command::new(exe)
}

/// Strip variables injected by a bundled launcher (PyInstaller, AppImage)
/// so child processes see the host's libraries.
pub fn clean_env_from(
    mut vars: HashMap<String, String>,
    extra: &HashMap<String, String>,
) -> HashMap<String, String> {
    vars.retain(|key, _| !key.starts_with("_MEIPASS"));

    if let Some(orig) = vars.remove("LD_LIBRARY_PATH_ORIG") {
        vars.insert("LD_LIBRARY_PATH".to_string(), orig);
    } else if let Some(appdir) = vars.get("APPDIR").cloned() {
        let points_into_bundle = vars
            .get("LD_LIBRARY_PATH")
            .is_some_and(|ld| !appdir.is_empty() && ld.contains(&appdir));
        if points_into_bundle {
            vars.remove("LD_LIBRARY_PATH");
        }
    }

    vars.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
    vars
}

/// Current environment, cleaned, with `extra` merged on top
pub fn clean_subprocess_env(extra: &HashMap<String, String>) -> HashMap<String, String> {
    clean_env_from(env::vars().collect(), extra)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_bundler_vars_removed() {
        let env = vars(&[
            ("_MEIPASS2", "/tmp/_MEI123"),
            ("LD_LIBRARY_PATH", "/tmp/_MEI123"),
            ("LD_LIBRARY_PATH_ORIG", "/usr/lib"),
            ("HOME", "/home/deck"),
        ]);
        let cleaned = clean_env_from(env, &HashMap::new());

        assert!(!cleaned.contains_key("_MEIPASS2"));
        assert!(!cleaned.contains_key("LD_LIBRARY_PATH_ORIG"));
        assert_eq!(cleaned.get("LD_LIBRARY_PATH").map(String::as_str), Some("/usr/lib"));
        assert_eq!(cleaned.get("HOME").map(String::as_str), Some("/home/deck"));
    }

    #[test]
    fn test_appimage_library_path_dropped() {
        let env = vars(&[
            ("APPDIR", "/tmp/.mount_jackify"),
            ("LD_LIBRARY_PATH", "/tmp/.mount_jackify/usr/lib"),
        ]);
        let extra = vars(&[("NEXUS_API_KEY", "abc")]);
        let cleaned = clean_env_from(env, &extra);

        assert!(!cleaned.contains_key("LD_LIBRARY_PATH"));
        assert_eq!(cleaned.get("NEXUS_API_KEY").map(String::as_str), Some("abc"));
    }

    #[test]
    fn test_unrelated_library_path_kept() {
        let env = vars(&[("LD_LIBRARY_PATH", "/opt/lib")]);
        let cleaned = clean_env_from(env, &HashMap::new());
        assert_eq!(cleaned.get("LD_LIBRARY_PATH").map(String::as_str), Some("/opt/lib"));
    }
}
