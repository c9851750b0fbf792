//! Non-Steam shortcut registration
//!
//! Builds shortcut records, allocates their ids, persists them through the
//! store and assigns a compatibility tool in config.vdf.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use rand::Rng;
use walkdir::WalkDir;

use super::config::{set_compat_tool, MappingError};
use super::paths::SteamPaths;
use super::proton::RuntimeResolver;
use super::store::{self, StoreError};
use super::vdf::{VdfFormat, VdfMap, VdfValue};
use crate::logging::{log_info, log_steam, log_warning};

/// Tag applied when the caller gives none
pub const DEFAULT_SHORTCUT_TAG: &str = "Jackify";

/// Compatibility tool used when nothing better can be determined
pub const DEFAULT_COMPAT_TOOL: &str = "proton_experimental";

const SIGNED_ID_RANGE: std::ops::RangeInclusive<i32> = -999_999_999..=-100_000_000;

/// Generate a random signed AppID for a new shortcut.
///
/// Steam re-derives the id on restart; the random value only has to avoid
/// colliding with cached entries from earlier shortcuts.
pub fn generate_signed_app_id() -> i32 {
    rand::rng().random_range(SIGNED_ID_RANGE)
}

/// The unsigned id Steam uses for compatdata and CompatToolMapping.
/// Equal to `signed + 2^32` for every negative id.
pub fn unsigned_app_id(signed: i32) -> u32 {
    signed as u32
}

// ============================================================================
// Shortcut Record
// ============================================================================

/// A non-Steam game shortcut
#[derive(Clone, Debug, PartialEq)]
pub struct ShortcutRecord {
    /// Key under "shortcuts"; assigned when stored
    pub slot: usize,
    pub signed_id: i32,
    pub name: String,
    /// Quoted executable path
    pub exe: String,
    /// Quoted working directory
    pub start_dir: String,
    pub icon: String,
    pub launch_options: String,
    pub installed: bool,
    pub tags: Vec<String>,
}

impl ShortcutRecord {
    /// Create a shortcut for an executable. The start directory defaults to
    /// the executable's directory.
    pub fn new(name: &str, exe_path: &str, start_dir: Option<&str>) -> Self {
        let start_dir = match start_dir {
            Some(dir) => dir.to_string(),
            None => Path::new(exe_path)
                .parent()
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_default(),
        };

        ShortcutRecord {
            slot: 0,
            signed_id: generate_signed_app_id(),
            name: name.to_string(),
            exe: format!("\"{}\"", exe_path),
            start_dir: format!("\"{}\"", start_dir),
            icon: String::new(),
            launch_options: "%command%".to_string(),
            installed: true,
            tags: Vec::new(),
        }
    }

    /// Add a tag to the shortcut (e.g., "Jackify" for filtering)
    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tags.push(tag.to_string());
        self
    }

    /// Set launch options (e.g., "STEAM_COMPAT_MOUNTS=/mnt %command%")
    pub fn with_launch_options(mut self, options: &str) -> Self {
        self.launch_options = options.to_string();
        self
    }

    pub fn with_icon(mut self, icon: &str) -> Self {
        self.icon = icon.to_string();
        self
    }

    pub fn unsigned_id(&self) -> u32 {
        unsigned_app_id(self.signed_id)
    }

    /// Executable path without the surrounding quotes
    pub fn exe_path(&self) -> &str {
        self.exe.trim_matches('"')
    }

    fn to_vdf(&self) -> VdfMap {
        let flag = |b: bool| VdfValue::Int(i32::from(b));

        let mut entry = VdfMap::new();
        entry.insert("appid", VdfValue::Int(self.signed_id));
        entry.insert("AppName", self.name.as_str());
        entry.insert("Exe", self.exe.as_str());
        entry.insert("StartDir", self.start_dir.as_str());
        entry.insert("icon", self.icon.as_str());
        entry.insert("ShortcutPath", "");
        entry.insert("LaunchOptions", self.launch_options.as_str());
        entry.insert("IsHidden", flag(false));
        entry.insert("AllowDesktopConfig", flag(true));
        entry.insert("AllowOverlay", flag(true));
        entry.insert("OpenVR", flag(false));
        entry.insert("Devkit", flag(false));
        entry.insert("DevkitGameID", "");
        entry.insert("DevkitOverrideAppID", VdfValue::Int(0));
        entry.insert("LastPlayTime", VdfValue::Int(0));
        entry.insert("IsInstalled", flag(self.installed));
        entry.insert("FlatpakAppID", "");

        let mut tags = VdfMap::new();
        for (idx, tag) in self.tags.iter().enumerate() {
            tags.insert(idx.to_string(), tag.as_str());
        }
        entry.insert("tags", tags);

        entry
    }

    fn from_vdf(slot: usize, entry: &VdfMap) -> Option<Self> {
        let text = |key: &str| {
            entry
                .get_ignore_case(key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };

        let name = text("AppName");
        if name.is_empty() {
            return None;
        }

        // Steam writes the id as int32; wrap larger values the same way
        let signed_id = entry
            .get_ignore_case("appid")
            .and_then(|v| v.as_i64())
            .map(|v| v as i32)
            .unwrap_or(0);

        let tags: Vec<String> = entry
            .get_ignore_case("tags")
            .and_then(|v| v.as_object())
            .map(|t| t.iter().filter_map(|(_, v)| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        Some(ShortcutRecord {
            slot,
            signed_id,
            name,
            exe: text("Exe"),
            start_dir: text("StartDir"),
            icon: text("icon"),
            launch_options: text("LaunchOptions"),
            installed: entry
                .get_ignore_case("IsInstalled")
                .and_then(|v| v.as_i64())
                .is_some_and(|v| v != 0),
            tags,
        })
    }
}

/// Find an icon for an executable in `<exe dir>/SteamIcons`.
/// `grid-tall.png` wins, otherwise the first png by name.
pub fn discover_icon(exe_path: &Path) -> Option<PathBuf> {
    let icons_dir = exe_path.parent()?.join("SteamIcons");
    if !icons_dir.is_dir() {
        return None;
    }

    let grid_tall = icons_dir.join("grid-tall.png");
    if grid_tall.is_file() {
        return Some(grid_tall);
    }

    WalkDir::new(&icons_dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .flatten()
        .map(|entry| entry.into_path())
        .find(|path| {
            path.is_file()
                && path
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("png"))
        })
}

/// Display name of a stored entry; Steam has written both `AppName` and `appname`
fn shortcut_name(entry: &VdfValue) -> Option<&str> {
    entry.get_ignore_case("AppName").and_then(|n| n.as_str())
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum RegistrarError {
    /// No active Steam user, so no shortcuts.vdf location
    SteamNotFound,
    Store(StoreError),
    /// shortcuts.vdf decoded but "shortcuts" is not a map
    MalformedStore(PathBuf),
    ShortcutNotFound(String),
    Mapping(MappingError),
    /// The shortcut was written but the compatibility tool was not set
    PartialSuccess { unsigned_id: u32, reason: String },
}

impl fmt::Display for RegistrarError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrarError::SteamNotFound => write!(f, "Could not find Steam userdata path"),
            RegistrarError::Store(e) => write!(f, "{}", e),
            RegistrarError::MalformedStore(p) => {
                write!(f, "{} has no usable \"shortcuts\" section", p.display())
            }
            RegistrarError::ShortcutNotFound(name) => write!(f, "Shortcut '{}' not found", name),
            RegistrarError::Mapping(e) => write!(f, "{}", e),
            RegistrarError::PartialSuccess { unsigned_id, reason } => write!(
                f,
                "Shortcut created (AppID {}) but setting the compatibility tool failed: {}",
                unsigned_id, reason
            ),
        }
    }
}

impl std::error::Error for RegistrarError {}

impl From<StoreError> for RegistrarError {
    fn from(err: StoreError) -> Self {
        RegistrarError::Store(err)
    }
}

impl From<MappingError> for RegistrarError {
    fn from(err: MappingError) -> Self {
        RegistrarError::Mapping(err)
    }
}

// ============================================================================
// Registrar
// ============================================================================

/// Creates, lists and removes shortcuts for one Steam user
pub struct ShortcutRegistrar<'a> {
    paths: &'a SteamPaths,
    default_tag: String,
    preferred_runtime: Option<String>,
}

impl<'a> ShortcutRegistrar<'a> {
    pub fn new(paths: &'a SteamPaths) -> Self {
        Self {
            paths,
            default_tag: DEFAULT_SHORTCUT_TAG.to_string(),
            preferred_runtime: None,
        }
    }

    /// Tag applied to shortcuts created without tags
    pub fn with_default_tag(mut self, tag: &str) -> Self {
        self.default_tag = tag.to_string();
        self
    }

    /// Runtime label used when no compatibility tool is given explicitly
    pub fn with_preferred_runtime(mut self, label: Option<&str>) -> Self {
        self.preferred_runtime = label.map(str::to_string);
        self
    }

    fn shortcuts_path(&self) -> Result<PathBuf, RegistrarError> {
        self.paths.shortcuts_vdf().ok_or(RegistrarError::SteamNotFound)
    }

    /// Store a new shortcut and return its unsigned AppID.
    ///
    /// An existing shortcut with the same name is replaced. The new entry
    /// takes the slot after the highest existing one.
    pub fn create_shortcut(&self, mut record: ShortcutRecord) -> Result<u32, RegistrarError> {
        let path = self.shortcuts_path()?;

        if record.tags.is_empty() {
            record.tags.push(self.default_tag.clone());
        }
        if record.icon.is_empty() {
            if let Some(icon) = discover_icon(Path::new(record.exe_path())) {
                log_info(&format!("Using icon from SteamIcons: {}", icon.display()));
                record.icon = icon.to_string_lossy().to_string();
            }
        }

        log_steam(&format!("Creating shortcut '{}' for '{}'", record.name, record.exe_path()));

        let stored = store::update_shortcuts(&path, |tree| {
            let list = tree.object_entry("shortcuts")?;

            let existing: Vec<String> = list
                .iter()
                .filter(|(_, v)| shortcut_name(v) == Some(record.name.as_str()))
                .map(|(k, _)| k.to_string())
                .collect();
            for key in &existing {
                log_warning(&format!("Replacing existing shortcut '{}' (slot {})", record.name, key));
                list.remove(key);
            }

            // Regenerate on collision (extremely rare but possible)
            let taken: HashSet<i64> = list
                .iter()
                .filter_map(|(_, v)| v.get_ignore_case("appid").and_then(|id| id.as_i64()))
                .collect();
            while taken.contains(&i64::from(record.signed_id)) {
                record.signed_id = generate_signed_app_id();
            }

            record.slot = list
                .keys()
                .filter_map(|k| k.parse::<usize>().ok())
                .max()
                .map_or(0, |max| max + 1);

            list.insert(record.slot.to_string(), record.to_vdf());
            Some(record.unsigned_id())
        })?;

        let unsigned_id = stored.ok_or_else(|| RegistrarError::MalformedStore(path.clone()))?;
        log_steam(&format!(
            "Shortcut created at slot {} with AppID {} (signed {})",
            record.slot, unsigned_id, record.signed_id
        ));
        Ok(unsigned_id)
    }

    /// Every stored shortcut, in slot order as written
    pub fn list_shortcuts(&self) -> Result<Vec<ShortcutRecord>, RegistrarError> {
        let path = self.shortcuts_path()?;
        let tree = store::load_or_default(&path, VdfFormat::Binary)?;

        let Some(list) = tree.get("shortcuts").and_then(|v| v.as_object()) else {
            return Ok(Vec::new());
        };

        Ok(list
            .iter()
            .filter_map(|(slot, entry)| {
                let slot = slot.parse().ok()?;
                ShortcutRecord::from_vdf(slot, entry.as_object()?)
            })
            .collect())
    }

    /// Look up a shortcut by display name.
    /// After a Steam restart this returns the id Steam assigned.
    pub fn find_shortcut(&self, name: &str) -> Result<Option<ShortcutRecord>, RegistrarError> {
        Ok(self.list_shortcuts()?.into_iter().find(|s| s.name == name))
    }

    /// Remove the first shortcut with the given name
    pub fn remove_shortcut(&self, name: &str) -> Result<(), RegistrarError> {
        let path = self.shortcuts_path()?;

        let removed = store::update_shortcuts(&path, |tree| {
            let list = tree.object_entry("shortcuts")?;
            let key = list
                .iter()
                .find(|(_, v)| shortcut_name(v) == Some(name))
                .map(|(k, _)| k.to_string())?;
            list.remove(&key)
        })?;

        match removed {
            Some(_) => {
                log_steam(&format!("Removed shortcut '{}'", name));
                Ok(())
            }
            None => {
                log_warning(&format!("Shortcut '{}' not found", name));
                Err(RegistrarError::ShortcutNotFound(name.to_string()))
            }
        }
    }

    /// Map an AppID to a compatibility tool in config.vdf
    pub fn set_compatibility_tool(&self, unsigned_id: u32, runtime_name: &str) -> Result<(), RegistrarError> {
        set_compat_tool(&self.paths.config_vdf(), unsigned_id, runtime_name)?;
        Ok(())
    }

    /// Compatibility tool name for the configured runtime, or the default
    fn auto_compat_tool(&self) -> String {
        let resolver = RuntimeResolver::new(self.paths);

        if let Some(label) = &self.preferred_runtime {
            match resolver.resolve(label) {
                Ok(candidate) => {
                    log_info(&format!("Auto-detected Proton version: {}", candidate.compat_name));
                    return candidate.compat_name;
                }
                Err(e) => log_warning(&format!(
                    "Failed to resolve preferred Proton, falling back to {}: {}",
                    DEFAULT_COMPAT_TOOL, e
                )),
            }
        }

        DEFAULT_COMPAT_TOOL.to_string()
    }

    /// Create a shortcut and assign its compatibility tool.
    ///
    /// If the tool cannot be set the shortcut is kept and
    /// [`RegistrarError::PartialSuccess`] carries its id.
    pub fn create_shortcut_with_compat(
        &self,
        record: ShortcutRecord,
        runtime_name: Option<&str>,
    ) -> Result<u32, RegistrarError> {
        let runtime_name = match runtime_name {
            Some(name) => name.to_string(),
            None => self.auto_compat_tool(),
        };

        log_info(&format!("Creating shortcut with Proton: '{}' -> '{}'", record.name, runtime_name));

        let unsigned_id = self.create_shortcut(record)?;

        if let Err(e) = self.set_compatibility_tool(unsigned_id, &runtime_name) {
            log_warning(&format!("Failed to set Proton version (shortcut still created): {}", e));
            return Err(RegistrarError::PartialSuccess {
                unsigned_id,
                reason: e.to_string(),
            });
        }

        Ok(unsigned_id)
    }
}
