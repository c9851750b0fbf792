//! Proton runtime resolution
//!
//! Maps a version label ("Proton 9.0", "GE-Proton9-20") to the `wine` shim
//! inside an installed runtime, and reads back which runtime a compatdata
//! prefix was created with.

use std::cmp::Ordering;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use version_compare::Cmp;

use super::paths::SteamPaths;
use crate::logging::{log_info, log_steam, log_warning};

/// Relative location of the wine shim inside a runtime directory
pub const WINE_SHIM: &str = "files/bin/wine";

/// Runtime used when the requested one is not installed
pub const FALLBACK_RUNTIME: &str = "Proton - Experimental";

/// Majors Steam has shipped under both "Proton N.0" and "Proton N.0 (Beta)"
const DUAL_SPELLING_MAJORS: &[&str] = &["9"];

static PROTON_VERSION_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#""SteamClientProtonVersion"="([^"]+)""#).ok());

// ============================================================================
// Types
// ============================================================================

/// An installed runtime that could serve a label
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeCandidate {
    /// Directory name, e.g. "Proton 9.0 (Beta)" or "GE-Proton9-20"
    pub label: String,
    pub install_dir: PathBuf,
    /// Resolved `files/bin/wine`
    pub binary: PathBuf,
    /// Steam's name for it in CompatToolMapping
    pub compat_name: String,
    /// Shipped by Valve in steamapps/common
    pub is_builtin: bool,
}

impl RuntimeCandidate {
    fn from_dir(install_dir: PathBuf, is_builtin: bool) -> Option<Self> {
        let binary = install_dir.join(WINE_SHIM);
        if !binary.is_file() {
            return None;
        }
        let label = install_dir.file_name()?.to_string_lossy().to_string();
        let compat_name = if is_builtin {
            compat_tool_name(&label)
        } else {
            label.clone()
        };
        Some(Self {
            label,
            install_dir,
            binary,
            compat_name,
            is_builtin,
        })
    }

    pub fn is_experimental(&self) -> bool {
        self.label.contains("Experimental")
    }
}

/// Paths belonging to an existing compatdata prefix
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimePaths {
    pub compat_data_dir: PathBuf,
    /// Grand-parent of the binary (`<install>/files`)
    pub runtime_dir: PathBuf,
    pub binary: PathBuf,
    /// Label the prefix reported
    pub label: String,
}

#[derive(Debug)]
pub enum RuntimeError {
    /// No runtime matched the label and the fallback is absent too
    NotFound(String),
    /// No compatdata directory for the app id
    CompatDataNotFound(String),
    /// Neither system.reg nor config_info named a version
    VersionUnknown(PathBuf),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::NotFound(label) => write!(
                f,
                "No Proton runtime found for '{}' (and '{}' is not installed)",
                label, FALLBACK_RUNTIME
            ),
            RuntimeError::CompatDataNotFound(app_id) => {
                write!(f, "No compatdata directory for AppID {}", app_id)
            }
            RuntimeError::VersionUnknown(path) => {
                write!(f, "Could not determine Proton version in {}", path.display())
            }
        }
    }
}

impl std::error::Error for RuntimeError {}

// ============================================================================
// Label helpers
// ============================================================================

/// Turn a raw version string into a runtime label.
/// GE builds are named verbatim; Valve builds get a "Proton " prefix.
pub fn runtime_label_from_version(version: &str) -> String {
    let version = version.trim();
    if version.contains("GE") {
        version.to_string()
    } else {
        format!("Proton {}", version)
    }
}

/// The CompatToolMapping name Steam uses for a runtime label
///
/// "Proton - Experimental" -> "proton_experimental", "Proton 9.0" -> "proton_9",
/// custom tools ("GE-Proton9-20") keep their folder name.
pub fn compat_tool_name(label: &str) -> String {
    if label.contains("Experimental") {
        return "proton_experimental".to_string();
    }
    if let Some(version) = label.strip_prefix("Proton ") {
        let major: String = version.chars().take_while(|c| c.is_ascii_digit()).collect();
        if !major.is_empty() {
            return format!("proton_{}", major);
        }
    }
    label.to_string()
}

/// Read the runtime label recorded in a compatdata directory
pub fn detect_runtime_version(compat_data_dir: &Path) -> Option<String> {
    let system_reg = compat_data_dir.join("pfx/system.reg");
    if let Ok(bytes) = fs::read(&system_reg) {
        let content = String::from_utf8_lossy(&bytes);
        let found = PROTON_VERSION_RE
            .as_ref()
            .and_then(|re| re.captures(&content))
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|v| !v.is_empty());
        if let Some(version) = found {
            let label = runtime_label_from_version(&version);
            log_steam(&format!("Detected Proton version from registry: {}", label));
            return Some(label);
        }
    }

    let config_info = compat_data_dir.join("config_info");
    if let Ok(content) = fs::read_to_string(&config_info) {
        if let Some(first) = content.lines().next().map(str::trim).filter(|l| !l.is_empty()) {
            let label = runtime_label_from_version(first);
            log_steam(&format!("Detected Proton version from config_info: {}", label));
            return Some(label);
        }
    }

    None
}

/// Pull the numeric part out of a runtime name for ordering
/// ("GE-Proton9-20" -> "9.20", "Proton 9.0 (Beta)" -> "9.0")
fn version_key(name: &str) -> String {
    name.chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .map(|c| if c == '-' { '.' } else { c })
        .collect::<String>()
        .trim_end_matches('.')
        .to_string()
}

/// Newest first; names without a comparable version fall back to name order
fn newest_first(a: &str, b: &str) -> Ordering {
    let (ka, kb) = (version_key(a), version_key(b));
    if !ka.is_empty() && !kb.is_empty() {
        if version_compare::compare_to(&ka, &kb, Cmp::Gt).unwrap_or(false) {
            return Ordering::Less;
        }
        if version_compare::compare_to(&ka, &kb, Cmp::Lt).unwrap_or(false) {
            return Ordering::Greater;
        }
    }
    b.cmp(a)
}

/// Directory entries under `dir`, sorted by name
fn sorted_subdirs(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    dirs
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Major version when the label is "Proton <major>" or "Proton <major>.<...>"
fn dual_spelling_major(label: &str) -> Option<&'static str> {
    let rest = label.trim().strip_prefix("Proton ")?;
    DUAL_SPELLING_MAJORS.iter().copied().find(|major| {
        rest.strip_prefix(major)
            .is_some_and(|tail| tail.is_empty() || tail.starts_with('.') || tail.starts_with(' '))
    })
}

// ============================================================================
// Resolver
// ============================================================================

/// Resolves runtime labels against the library roots in a [`SteamPaths`]
pub struct RuntimeResolver<'a> {
    paths: &'a SteamPaths,
}

impl<'a> RuntimeResolver<'a> {
    pub fn new(paths: &'a SteamPaths) -> Self {
        Self { paths }
    }

    /// Every directory a runtime may be installed under, in search order
    fn search_roots(&self) -> Vec<PathBuf> {
        let mut roots = self.paths.common_dirs();
        roots.extend(self.paths.compat_tool_dirs());
        roots.retain(|r| r.is_dir());
        roots
    }

    /// Resolve a label to an installed runtime, falling back to Experimental
    pub fn resolve(&self, label: &str) -> Result<RuntimeCandidate, RuntimeError> {
        let roots = self.search_roots();

        if let Some(found) = self.match_label(&roots, label) {
            log_info(&format!(
                "Resolved '{}' to {}",
                label,
                found.binary.display()
            ));
            return Ok(found);
        }

        for root in &roots {
            if let Some(found) = RuntimeCandidate::from_dir(root.join(FALLBACK_RUNTIME), true) {
                log_warning(&format!(
                    "Requested Proton version '{}' not found. Falling back to '{}'.",
                    label, FALLBACK_RUNTIME
                ));
                return Ok(found);
            }
        }

        Err(RuntimeError::NotFound(label.to_string()))
    }

    /// Path to the wine shim for a label
    pub fn find_runtime_binary(&self, label: &str) -> Result<PathBuf, RuntimeError> {
        self.resolve(label).map(|c| c.binary)
    }

    fn match_label(&self, roots: &[PathBuf], label: &str) -> Option<RuntimeCandidate> {
        if let Some(major) = dual_spelling_major(label) {
            let spellings = [format!("Proton {}.0", major), format!("Proton {}.0 (Beta)", major)];
            let prefix = format!("Proton {}", major);
            for root in roots {
                let is_builtin = self.is_common_dir(root);
                for name in &spellings {
                    if let Some(found) = RuntimeCandidate::from_dir(root.join(name), is_builtin) {
                        return Some(found);
                    }
                }
                for dir in sorted_subdirs(root) {
                    if dir_name(&dir).starts_with(&prefix) {
                        if let Some(found) = RuntimeCandidate::from_dir(dir, is_builtin) {
                            return Some(found);
                        }
                    }
                }
            }
        }

        let mut patterns = vec![label.to_string(), label.replace(' ', "_"), label.replace(' ', "")];
        patterns.dedup();

        for root in roots {
            let is_builtin = self.is_common_dir(root);
            for pattern in &patterns {
                if let Some(found) = RuntimeCandidate::from_dir(root.join(pattern), is_builtin) {
                    return Some(found);
                }
                for dir in sorted_subdirs(root) {
                    if dir_name(&dir).contains(pattern.as_str()) {
                        if let Some(found) = RuntimeCandidate::from_dir(dir, is_builtin) {
                            return Some(found);
                        }
                    }
                }
            }
        }

        None
    }

    fn is_common_dir(&self, root: &Path) -> bool {
        root.ends_with("steamapps/common")
    }

    /// Locate the compatdata prefix for an app id and the runtime it uses
    pub fn get_runtime_paths(&self, app_id: &str) -> Result<RuntimePaths, RuntimeError> {
        log_info(&format!("Getting Proton paths for AppID {}", app_id));

        let compat_data_dir = self
            .paths
            .compatdata_dirs()
            .into_iter()
            .map(|base| base.join(app_id))
            .find(|p| p.is_dir())
            .ok_or_else(|| RuntimeError::CompatDataNotFound(app_id.to_string()))?;

        let label = detect_runtime_version(&compat_data_dir)
            .ok_or_else(|| RuntimeError::VersionUnknown(compat_data_dir.clone()))?;

        let binary = self.find_runtime_binary(&label)?;
        let runtime_dir = binary
            .parent()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| binary.clone());

        Ok(RuntimePaths {
            compat_data_dir,
            runtime_dir,
            binary,
            label,
        })
    }

    /// Every installed runtime with a wine shim.
    /// Experimental first, then newest first.
    pub fn list_runtimes(&self) -> Vec<RuntimeCandidate> {
        let mut found = Vec::new();

        // Steam's built-in runtimes
        for common in self.paths.common_dirs() {
            for dir in sorted_subdirs(&common) {
                if !dir_name(&dir).starts_with("Proton") {
                    continue;
                }
                if let Some(candidate) = RuntimeCandidate::from_dir(dir, true) {
                    found.push(candidate);
                }
            }
        }

        // Custom tools in compatibilitytools.d (user and system)
        for tools in self.paths.compat_tool_dirs() {
            for dir in sorted_subdirs(&tools) {
                let has_manifest = dir.join("proton").exists() || dir.join("compatibilitytool.vdf").exists();
                if !has_manifest {
                    continue;
                }
                match RuntimeCandidate::from_dir(dir.clone(), false) {
                    Some(candidate) => found.push(candidate),
                    None => log_warning(&format!(
                        "Skipping '{}': wine binary not found at {}",
                        dir_name(&dir),
                        WINE_SHIM
                    )),
                }
            }
        }

        found.sort_by(|a, b| {
            if a.is_experimental() != b.is_experimental() {
                return b.is_experimental().cmp(&a.is_experimental());
            }
            newest_first(&a.label, &b.label)
        });
        found.dedup_by(|a, b| a.install_dir == b.install_dir);

        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn install_runtime(common: &Path, name: &str) {
        let bin = common.join(name).join("files/bin");
        fs::create_dir_all(&bin).unwrap();
        fs::write(bin.join("wine"), b"#!/bin/sh\n").unwrap();
    }

    fn steam_with(runtimes: &[&str]) -> (TempDir, SteamPaths) {
        let dir = TempDir::new().unwrap();
        let common = dir.path().join("steamapps/common");
        fs::create_dir_all(&common).unwrap();
        for name in runtimes {
            install_runtime(&common, name);
        }
        let paths = SteamPaths::from_root(dir.path()).without_system_tools();
        (dir, paths)
    }

    #[test]
    fn test_proton_9_resolves_to_beta_spelling() {
        let (_dir, paths) = steam_with(&["Proton 9.0 (Beta)"]);
        let resolver = RuntimeResolver::new(&paths);

        let found = resolver.resolve("Proton 9.0").unwrap();
        assert_eq!(found.label, "Proton 9.0 (Beta)");
        assert!(found.binary.ends_with("Proton 9.0 (Beta)/files/bin/wine"));
    }

    #[test]
    fn test_exact_and_substring_match() {
        let (_dir, paths) = steam_with(&["Proton 8.0", "GE-Proton9-20", "Proton - Experimental"]);
        let resolver = RuntimeResolver::new(&paths);

        assert!(resolver
            .find_runtime_binary("Proton 8.0")
            .unwrap()
            .ends_with("Proton 8.0/files/bin/wine"));
        assert_eq!(resolver.resolve("Proton9-20").unwrap().label, "GE-Proton9-20");
    }

    #[test]
    fn test_falls_back_to_experimental() {
        let (_dir, paths) = steam_with(&["Proton - Experimental"]);
        let resolver = RuntimeResolver::new(&paths);

        let found = resolver.resolve("Proton 7.0").unwrap();
        assert_eq!(found.label, FALLBACK_RUNTIME);
        assert_eq!(found.compat_name, "proton_experimental");
    }

    #[test]
    fn test_not_found_without_fallback() {
        let (_dir, paths) = steam_with(&[]);
        let resolver = RuntimeResolver::new(&paths);
        assert!(matches!(resolver.resolve("Proton 8.0"), Err(RuntimeError::NotFound(_))));
    }

    #[test]
    fn test_label_helpers() {
        assert_eq!(runtime_label_from_version("9.0-3"), "Proton 9.0-3");
        assert_eq!(runtime_label_from_version("GE-Proton9-20"), "GE-Proton9-20");
        assert_eq!(compat_tool_name("Proton 9.0 (Beta)"), "proton_9");
        assert_eq!(compat_tool_name("Proton - Experimental"), "proton_experimental");
        assert_eq!(compat_tool_name("GE-Proton9-20"), "GE-Proton9-20");
    }

    #[test]
    fn test_detect_version_prefers_system_reg() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("pfx")).unwrap();
        fs::write(dir.path().join("config_info"), "8.0-5\n/some/path\n").unwrap();
        assert_eq!(detect_runtime_version(dir.path()).as_deref(), Some("Proton 8.0-5"));

        fs::write(
            dir.path().join("pfx/system.reg"),
            "[Software\\\\Wine] 1700000000\n\"SteamClientProtonVersion\"=\"GE-Proton9-20\"\n",
        )
        .unwrap();
        assert_eq!(detect_runtime_version(dir.path()).as_deref(), Some("GE-Proton9-20"));
    }

    #[test]
    fn test_get_runtime_paths() {
        let (dir, paths) = steam_with(&["Proton 9.0"]);
        let prefix = dir.path().join("steamapps/compatdata/3000000000/pfx");
        fs::create_dir_all(&prefix).unwrap();
        fs::write(prefix.join("system.reg"), "\"SteamClientProtonVersion\"=\"9.0-4\"\n").unwrap();

        let resolver = RuntimeResolver::new(&paths);
        let found = resolver.get_runtime_paths("3000000000").unwrap();
        assert_eq!(found.label, "Proton 9.0-4");
        assert_eq!(found.runtime_dir, dir.path().join("steamapps/common/Proton 9.0/files"));

        assert!(matches!(
            resolver.get_runtime_paths("42"),
            Err(RuntimeError::CompatDataNotFound(_))
        ));
    }

    #[test]
    fn test_list_runtimes_ordering() {
        let (dir, paths) = steam_with(&["Proton 8.0", "Proton 9.0", "Proton - Experimental"]);
        let custom = dir.path().join("compatibilitytools.d");
        install_runtime(&custom, "GE-Proton9-20");
        fs::write(custom.join("GE-Proton9-20/compatibilitytool.vdf"), "").unwrap();

        let resolver = RuntimeResolver::new(&paths);
        let labels: Vec<String> = resolver.list_runtimes().into_iter().map(|c| c.label).collect();

        assert_eq!(labels[0], "Proton - Experimental");
        assert_eq!(labels.len(), 4);
        let pos_8 = labels.iter().position(|l| l == "Proton 8.0").unwrap();
        let pos_9 = labels.iter().position(|l| l == "Proton 9.0").unwrap();
        assert!(pos_9 < pos_8);
    }
}
