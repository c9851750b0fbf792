//! Steam path detection
//!
//! Locates the Steam installation, the active userdata directory and every
//! library root, and bundles them into a [`SteamPaths`] value that the
//! registrar and runtime resolver take as input.

use std::fs;
use std::path::{Path, PathBuf};

use super::vdf::{self, VdfFormat};
use crate::logging::{log_info, log_warning};

const SYSTEM_COMPAT_TOOLS_DIR: &str = "/usr/share/steam/compatibilitytools.d";

// ============================================================================
// Core Path Detection
// ============================================================================

/// Find the Steam installation path.
///
/// Checks common locations for native, Flatpak, and Snap Steam installs.
#[must_use]
pub fn find_steam_path() -> Option<PathBuf> {
    let home = dirs::home_dir()?;

    let candidates = [
        home.join(".steam/steam"),
        home.join(".local/share/Steam"),
        home.join(".var/app/com.valvesoftware.Steam/.steam/steam"),
        home.join(".var/app/com.valvesoftware.Steam/data/Steam"),
        home.join("snap/steam/common/.steam/steam"),
    ];

    candidates.into_iter().find(|p| p.join("steamapps").exists() || p.join("userdata").exists())
}

/// Find the active user's userdata directory under a Steam root.
///
/// Picks the most recently modified numeric user directory. `0` is Steam's
/// anonymous placeholder and is skipped.
#[must_use]
pub fn find_userdata_dir(steam_root: &Path) -> Option<PathBuf> {
    let userdata = steam_root.join("userdata");

    let mut user_dirs: Vec<PathBuf> = fs::read_dir(&userdata)
        .ok()?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .filter(|path| {
            path.file_name()
                .map(|n| n.to_string_lossy().to_string())
                .is_some_and(|name| name != "0" && !name.is_empty() && name.chars().all(|c| c.is_ascii_digit()))
        })
        .collect();

    // Most recent first
    user_dirs.sort_by(|a, b| {
        let a_time = fs::metadata(a).and_then(|m| m.modified()).ok();
        let b_time = fs::metadata(b).and_then(|m| m.modified()).ok();
        b_time.cmp(&a_time)
    });

    user_dirs.into_iter().next()
}

/// Read every library root listed in `libraryfolders.vdf`.
///
/// The Steam root itself is always the first entry.
pub fn read_library_roots(steam_root: &Path) -> Vec<PathBuf> {
    let mut roots = vec![steam_root.to_path_buf()];

    let candidates = [
        steam_root.join("steamapps/libraryfolders.vdf"),
        steam_root.join("config/libraryfolders.vdf"),
    ];

    for file in candidates.iter().filter(|p| p.exists()) {
        let Ok(data) = fs::read(file) else {
            continue;
        };
        let tree = match vdf::decode(&data, VdfFormat::Text) {
            Ok(tree) => tree,
            Err(e) => {
                log_warning(&format!("Could not parse {}: {}", file.display(), e));
                continue;
            }
        };

        let Some(folders) = tree.get_ignore_case("libraryfolders").and_then(|v| v.as_object()) else {
            continue;
        };

        for (key, folder) in folders.iter() {
            // Library entries are numbered; skip "contentstatsid" and friends
            if !key.chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            // Newer layout nests "path"; the old one stores the path directly
            let path = folder.get_str("path").or_else(|| folder.as_str());
            if let Some(path) = path {
                let path = PathBuf::from(path);
                if !roots.contains(&path) {
                    roots.push(path);
                }
            }
        }
    }

    roots
}

/// Whether a Steam root belongs to the Flatpak build
pub fn is_flatpak_root(steam_root: &Path) -> bool {
    steam_root
        .to_string_lossy()
        .contains(".var/app/com.valvesoftware.Steam")
}

// ============================================================================
// SteamPaths
// ============================================================================

/// Every Steam location the engine reads or writes
#[derive(Debug, Clone)]
pub struct SteamPaths {
    pub steam_root: PathBuf,
    /// `userdata/<id>` of the active user
    pub user_dir: Option<PathBuf>,
    /// Library roots (each containing `steamapps/`)
    pub library_roots: Vec<PathBuf>,
    /// Package-managed compatibility tool directories
    pub system_compat_dirs: Vec<PathBuf>,
}

impl SteamPaths {
    /// Detect Steam, honouring an explicit root override
    pub fn detect(root_override: Option<&Path>) -> Option<Self> {
        let root = match root_override {
            Some(root) => root.to_path_buf(),
            None => find_steam_path()?,
        };
        log_info(&format!("Steam detected at: {}", root.display()));
        Some(Self::from_root(&root))
    }

    /// Build paths for a known Steam root
    pub fn from_root(steam_root: &Path) -> Self {
        let system_compat_dirs = if is_flatpak_root(steam_root) {
            // System tools are not visible inside the Flatpak sandbox
            Vec::new()
        } else {
            vec![PathBuf::from(SYSTEM_COMPAT_TOOLS_DIR)]
        };

        Self {
            steam_root: steam_root.to_path_buf(),
            user_dir: find_userdata_dir(steam_root),
            library_roots: read_library_roots(steam_root),
            system_compat_dirs,
        }
    }

    /// Skip system-wide compatibility tools (used for isolated lookups)
    pub fn without_system_tools(mut self) -> Self {
        self.system_compat_dirs.clear();
        self
    }

    /// The active user's `shortcuts.vdf`
    pub fn shortcuts_vdf(&self) -> Option<PathBuf> {
        self.user_dir
            .as_ref()
            .map(|dir| dir.join("config").join(super::store::PERMITTED_STORE_FILE))
    }

    pub fn config_vdf(&self) -> PathBuf {
        self.steam_root.join("config/config.vdf")
    }

    /// `steamapps/common` under every library root
    pub fn common_dirs(&self) -> Vec<PathBuf> {
        self.library_roots
            .iter()
            .map(|root| root.join("steamapps/common"))
            .collect()
    }

    /// `steamapps/compatdata` under every library root
    pub fn compatdata_dirs(&self) -> Vec<PathBuf> {
        self.library_roots
            .iter()
            .map(|root| root.join("steamapps/compatdata"))
            .collect()
    }

    /// User and system `compatibilitytools.d` directories
    pub fn compat_tool_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = vec![self.steam_root.join("compatibilitytools.d")];
        dirs.extend(self.system_compat_dirs.iter().cloned());
        dirs
    }

    /// Where Steam creates the prefix for a non-Steam shortcut.
    /// Always the primary Steam root, regardless of where the exe lives.
    pub fn shortcut_compatdata(&self, app_id: u32) -> PathBuf {
        self.steam_root
            .join("steamapps/compatdata")
            .join(app_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_userdata_skips_anonymous_user() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("userdata/0")).unwrap();
        fs::create_dir_all(dir.path().join("userdata/ac")).unwrap();
        fs::create_dir_all(dir.path().join("userdata/12345/config")).unwrap();

        let user = find_userdata_dir(dir.path()).unwrap();
        assert!(user.ends_with("12345"));
    }

    #[test]
    fn test_userdata_missing() {
        let dir = TempDir::new().unwrap();
        assert!(find_userdata_dir(dir.path()).is_none());
    }

    #[test]
    fn test_library_roots_from_libraryfolders() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("steamapps")).unwrap();
        fs::write(
            root.join("steamapps/libraryfolders.vdf"),
            format!(
                "\"libraryfolders\"\n{{\n\t\"0\"\n\t{{\n\t\t\"path\"\t\t\"{}\"\n\t}}\n\t\"1\"\n\t{{\n\t\t\"path\"\t\t\"/mnt/games/SteamLibrary\"\n\t}}\n}}\n",
                root.display()
            ),
        )
        .unwrap();

        let paths = SteamPaths::from_root(root).without_system_tools();
        assert_eq!(
            paths.library_roots,
            vec![root.to_path_buf(), PathBuf::from("/mnt/games/SteamLibrary")]
        );
        assert_eq!(
            paths.common_dirs()[1],
            PathBuf::from("/mnt/games/SteamLibrary/steamapps/common")
        );
        assert_eq!(paths.compat_tool_dirs(), vec![root.join("compatibilitytools.d")]);
    }

    #[test]
    fn test_shortcuts_vdf_location() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("userdata/777/config")).unwrap();

        let paths = SteamPaths::from_root(dir.path());
        assert_eq!(
            paths.shortcuts_vdf(),
            Some(dir.path().join("userdata/777/config/shortcuts.vdf"))
        );
        assert_eq!(paths.config_vdf(), dir.path().join("config/config.vdf"));
    }

    #[test]
    fn test_flatpak_root_detection() {
        assert!(is_flatpak_root(Path::new(
            "/home/u/.var/app/com.valvesoftware.Steam/.steam/steam"
        )));
        assert!(!is_flatpak_root(Path::new("/home/u/.local/share/Steam")));
    }
}
