use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::logging::log_warning;
use crate::steam::proton::RuntimeResolver;
use crate::steam::SteamPaths;
#[cfg(feature = "shortcuts")]
use crate::steam::shortcuts::{ShortcutRegistrar, DEFAULT_SHORTCUT_TAG};

#[cfg(not(feature = "shortcuts"))]
const DEFAULT_SHORTCUT_TAG: &str = "Jackify";

// ============================================================================
// Main App Config
// ============================================================================

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Logs and other per-user state
    pub data_dir: PathBuf,
    /// Overrides Steam auto-detection
    pub steam_root: Option<PathBuf>,
    /// Runtime label used when none is given, e.g. "Proton - Experimental"
    pub preferred_runtime: Option<String>,
    pub shortcut_tag: String,
    pub debug_mode: bool,
    pub engine_path: Option<PathBuf>,
    pub downloads_dir: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_dir()
                .map(|dir| dir.join("jackify"))
                .unwrap_or_else(|| config_path!().to_path_buf()),
            steam_root: None,
            preferred_runtime: None,
            shortcut_tag: DEFAULT_SHORTCUT_TAG.to_string(),
            debug_mode: false,
            engine_path: None,
            downloads_dir: None,
        }
    }
}

impl AppConfig {
    fn get_path() -> PathBuf {
        config_path!("config.json")
    }

    pub fn load() -> Self {
        Self::load_from(&Self::get_path())
    }

    pub fn load_from(path: &Path) -> Self {
        if path.exists() {
            if let Ok(content) = fs::read_to_string(path) {
                match serde_json::from_str(&content) {
                    Ok(config) => return config,
                    Err(e) => log_warning(&format!("Ignoring unreadable {}: {}", path.display(), e)),
                }
            }
        }
        Self::default()
    }

    pub fn save(&self) -> io::Result<()> {
        self.save_to(&Self::get_path())
    }

    pub fn save_to(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        fs::write(path, json)
    }
}

// ============================================================================
// Engine Config
// ============================================================================

/// Everything the Steam-facing components need, passed explicitly
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub steam: SteamPaths,
    pub preferred_runtime: Option<String>,
    pub shortcut_tag: String,
    pub debug: bool,
}

impl EngineConfig {
    pub fn new(steam: SteamPaths) -> Self {
        Self {
            steam,
            preferred_runtime: None,
            shortcut_tag: DEFAULT_SHORTCUT_TAG.to_string(),
            debug: false,
        }
    }

    /// Detect Steam (honouring the configured root) and carry the
    /// user's preferences over. `None` when no Steam install is found.
    pub fn from_app(app: &AppConfig) -> Option<Self> {
        let steam = SteamPaths::detect(app.steam_root.as_deref())?;
        Some(Self {
            steam,
            preferred_runtime: app.preferred_runtime.clone(),
            shortcut_tag: app.shortcut_tag.clone(),
            debug: app.debug_mode,
        })
    }

    pub fn resolver(&self) -> RuntimeResolver<'_> {
        RuntimeResolver::new(&self.steam)
    }

    #[cfg(feature = "shortcuts")]
    pub fn registrar(&self) -> ShortcutRegistrar<'_> {
        ShortcutRegistrar::new(&self.steam)
            .with_default_tag(&self.shortcut_tag)
            .with_preferred_runtime(self.preferred_runtime.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let config = AppConfig {
            preferred_runtime: Some("Proton 9.0".to_string()),
            debug_mode: true,
            engine_path: Some(PathBuf::from("/opt/jackify-engine")),
            ..Default::default()
        };
        config.save_to(&path).unwrap();

        assert_eq!(AppConfig::load_from(&path), config);
    }

    #[test]
    fn test_partial_and_broken_files_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        fs::write(&path, r#"{"debug_mode": true}"#).unwrap();
        let config = AppConfig::load_from(&path);
        assert!(config.debug_mode);
        assert_eq!(config.shortcut_tag, DEFAULT_SHORTCUT_TAG);

        fs::write(&path, "{not json").unwrap();
        assert_eq!(AppConfig::load_from(&path), AppConfig::default());
        assert_eq!(AppConfig::load_from(&dir.path().join("missing.json")), AppConfig::default());
    }

    #[test]
    fn test_engine_config_from_explicit_root() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("steamapps")).unwrap();

        let app = AppConfig {
            steam_root: Some(dir.path().to_path_buf()),
            preferred_runtime: Some("Proton 9.0".to_string()),
            ..Default::default()
        };
        let engine = EngineConfig::from_app(&app).unwrap();
        assert_eq!(engine.steam.steam_root, dir.path());
        assert_eq!(engine.preferred_runtime.as_deref(), Some("Proton 9.0"));
    }
}
