//! Safe load/save of Steam's VDF stores
//!
//! Reading is allowed for any store. Writing is allowed for exactly one file
//! name, `shortcuts.vdf`; everything else Steam owns is refused before a
//! single byte hits the disk. Every write backs the old file up first.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use super::vdf::{self, VdfFormat, VdfMap, VdfParseError};
use crate::logging::{log_error, log_steam, log_warning};

/// The only store file this crate will ever write
pub const PERMITTED_STORE_FILE: &str = "shortcuts.vdf";

/// Steam files that must never be modified
const PROTECTED_FILES: &[&str] = &[
    "libraryfolders.vdf",
    "config.vdf",
    "loginusers.vdf",
    "registry.vdf",
    "localconfig.vdf",
    "remotecache.vdf",
    "sharedconfig.vdf",
    "appinfo.vdf",
    "packageinfo.vdf",
];

/// Directories inside a Steam install whose contents are off limits
const CRITICAL_DIRS: &[&str] = &[
    "appcache",
    "controller_base",
    "config",
    "logs",
    "package",
    "public",
    "resource",
    "steam",
    "steamapps",
    "tenfoot",
];

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum StoreError {
    /// The file does not exist
    NotFound(PathBuf),
    /// The file exists but does not decode in the requested format
    Parse { path: PathBuf, source: VdfParseError },
    /// The OS refused access, or the name is not writable by policy
    PermissionDenied { path: PathBuf, reason: String },
    /// Attempted write to a Steam-owned file
    ProtectedFile(PathBuf),
    Io { path: PathBuf, source: io::Error },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound(p) => write!(f, "VDF file not found: {}", p.display()),
            StoreError::Parse { path, source } => {
                write!(f, "Failed to parse {}: {}", path.display(), source)
            }
            StoreError::PermissionDenied { path, reason } => {
                write!(f, "Permission denied for {}: {}", path.display(), reason)
            }
            StoreError::ProtectedFile(p) => {
                write!(f, "Refusing to modify protected Steam file: {}", p.display())
            }
            StoreError::Io { path, source } => write!(f, "I/O error on {}: {}", path.display(), source),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Parse { source, .. } => Some(source),
            StoreError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl StoreError {
    fn from_io(path: &Path, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound(path.to_path_buf()),
            io::ErrorKind::PermissionDenied => StoreError::PermissionDenied {
                path: path.to_path_buf(),
                reason: err.to_string(),
            },
            _ => StoreError::Io {
                path: path.to_path_buf(),
                source: err,
            },
        }
    }
}

// ============================================================================
// Protection Policy
// ============================================================================

fn file_name_of(path: &Path) -> &str {
    path.file_name().and_then(|n| n.to_str()).unwrap_or("")
}

/// Check whether a path names a Steam file that must never be written.
///
/// `shortcuts.vdf` is always writable even though it lives under
/// `userdata/<id>/config/`.
pub fn is_protected_file(path: &Path) -> bool {
    let name = file_name_of(path);

    if name == PERMITTED_STORE_FILE {
        return false;
    }

    if PROTECTED_FILES.contains(&name) {
        return true;
    }

    if name.starts_with("appmanifest_") && name.ends_with(".acf") {
        return true;
    }

    path.parent()
        .map(|parent| {
            parent.components().any(|c| {
                c.as_os_str()
                    .to_str()
                    .is_some_and(|dir| CRITICAL_DIRS.contains(&dir))
            })
        })
        .unwrap_or(false)
}

fn check_writable(path: &Path) -> Result<(), StoreError> {
    if is_protected_file(path) {
        log_error(&format!(
            "Blocked write to protected Steam file: {}",
            path.display()
        ));
        return Err(StoreError::ProtectedFile(path.to_path_buf()));
    }

    if file_name_of(path) != PERMITTED_STORE_FILE {
        log_error(&format!(
            "Blocked write to {}: only {} may be modified",
            path.display(),
            PERMITTED_STORE_FILE
        ));
        return Err(StoreError::PermissionDenied {
            path: path.to_path_buf(),
            reason: format!("only {} may be written", PERMITTED_STORE_FILE),
        });
    }

    Ok(())
}

// ============================================================================
// Backups
// ============================================================================

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// `<file>.bak`, written only once so it keeps the earliest known-good copy
fn ensure_plain_backup(path: &Path) -> Result<(), StoreError> {
    let backup = sibling_with_suffix(path, ".bak");
    if !backup.exists() {
        fs::copy(path, &backup).map_err(|e| StoreError::from_io(&backup, e))?;
        log_steam(&format!("Created backup {}", backup.display()));
    }
    Ok(())
}

/// `<file>.<mtime secs>.bak` for the copy about to be replaced
fn write_timestamped_backup(path: &Path) -> Result<PathBuf, StoreError> {
    let mtime = fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|e| StoreError::from_io(path, e))?;
    let secs = mtime.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);

    let backup = sibling_with_suffix(path, &format!(".{}.bak", secs));
    fs::copy(path, &backup).map_err(|e| StoreError::from_io(&backup, e))?;
    Ok(backup)
}

// ============================================================================
// Load / Save
// ============================================================================

/// Load and decode a store file.
///
/// Protected files get a `.bak` copy before they are read, so a later
/// mistake elsewhere can always be undone by hand.
pub fn load(path: &Path, format: VdfFormat) -> Result<VdfMap, StoreError> {
    if !path.exists() {
        return Err(StoreError::NotFound(path.to_path_buf()));
    }

    if is_protected_file(path) {
        if let Err(e) = ensure_plain_backup(path) {
            log_warning(&format!("Could not back up {} before reading: {}", path.display(), e));
        }
    }

    let data = fs::read(path).map_err(|e| StoreError::from_io(path, e))?;
    vdf::decode(&data, format).map_err(|source| StoreError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Like [`load`], but an absent file yields an empty tree
pub fn load_or_default(path: &Path, format: VdfFormat) -> Result<VdfMap, StoreError> {
    match load(path, format) {
        Err(StoreError::NotFound(_)) => Ok(VdfMap::new()),
        other => other,
    }
}

/// Encode and write a tree, enforcing the write policy
pub fn save(path: &Path, tree: &VdfMap, format: VdfFormat) -> Result<(), StoreError> {
    check_writable(path)?;

    if path.exists() {
        let backup = write_timestamped_backup(path)?;
        log_steam(&format!("Backed up {} to {}", path.display(), backup.display()));
        ensure_plain_backup(path)?;
    }

    let data = vdf::encode(tree, format);

    // Re-check right before touching the disk
    check_writable(path)?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StoreError::from_io(parent, e))?;
    }
    fs::write(path, &data).map_err(|e| StoreError::from_io(path, e))?;

    log_steam(&format!("Saved {} ({} bytes)", path.display(), data.len()));
    Ok(())
}

/// Load shortcuts.vdf (empty if absent), apply `update`, and save it back.
///
/// Returning `None` from `update` abandons the change; nothing is written.
pub fn update_shortcuts<T, F>(path: &Path, update: F) -> Result<Option<T>, StoreError>
where
    F: FnOnce(&mut VdfMap) -> Option<T>,
{
    check_writable(path)?;

    let mut tree = load_or_default(path, VdfFormat::Binary)?;
    let Some(result) = update(&mut tree) else {
        return Ok(None);
    };
    save(path, &tree, VdfFormat::Binary)?;
    Ok(Some(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steam::vdf::VdfValue;
    use tempfile::TempDir;

    fn shortcuts_tree(name: &str) -> VdfMap {
        let mut entry = VdfMap::new();
        entry.insert("appid", VdfValue::Int(-200_000_000));
        entry.insert("AppName", name);
        let mut list = VdfMap::new();
        list.insert("0", entry);
        let mut root = VdfMap::new();
        root.insert("shortcuts", list);
        root
    }

    #[test]
    fn test_protected_file_classification() {
        assert!(is_protected_file(Path::new("/home/u/.steam/steam/config/config.vdf")));
        assert!(is_protected_file(Path::new("/tmp/libraryfolders.vdf")));
        assert!(is_protected_file(Path::new("/lib/steamapps/appmanifest_489830.acf")));
        assert!(is_protected_file(Path::new("/home/u/.steam/steam/appcache/stats.vdf")));
        assert!(!is_protected_file(Path::new(
            "/home/u/.steam/steam/userdata/1234/config/shortcuts.vdf"
        )));
        assert!(!is_protected_file(Path::new("/tmp/other.vdf")));
    }

    #[test]
    fn test_save_refuses_protected_file_without_touching_it() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.vdf");
        fs::write(&path, b"\"InstallConfigStore\"\n{\n}\n").unwrap();
        let before = fs::read(&path).unwrap();

        let err = save(&path, &VdfMap::new(), VdfFormat::Text).unwrap_err();
        assert!(matches!(err, StoreError::ProtectedFile(_)));
        assert_eq!(fs::read(&path).unwrap(), before);
        assert!(!dir.path().join("config.vdf.bak").exists());
    }

    #[test]
    fn test_save_refuses_non_permitted_name() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("other.vdf");

        let err = save(&path, &VdfMap::new(), VdfFormat::Binary).unwrap_err();
        assert!(matches!(err, StoreError::PermissionDenied { .. }));
        assert!(!path.exists());
    }

    #[test]
    fn test_save_then_load_is_byte_identical() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(PERMITTED_STORE_FILE);

        save(&path, &shortcuts_tree("First"), VdfFormat::Binary).unwrap();
        let written = fs::read(&path).unwrap();

        let tree = load(&path, VdfFormat::Binary).unwrap();
        save(&path, &tree, VdfFormat::Binary).unwrap();
        assert_eq!(fs::read(&path).unwrap(), written);
    }

    #[test]
    fn test_save_backs_up_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(PERMITTED_STORE_FILE);

        save(&path, &shortcuts_tree("First"), VdfFormat::Binary).unwrap();
        let first = fs::read(&path).unwrap();
        save(&path, &shortcuts_tree("Second"), VdfFormat::Binary).unwrap();

        let plain = dir.path().join("shortcuts.vdf.bak");
        assert_eq!(fs::read(&plain).unwrap(), first);

        let stamped = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                name.starts_with("shortcuts.vdf.") && name.ends_with(".bak") && name != "shortcuts.vdf.bak"
            })
            .count();
        assert_eq!(stamped, 1);
    }

    #[test]
    fn test_load_missing_and_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(PERMITTED_STORE_FILE);

        assert!(matches!(load(&path, VdfFormat::Binary), Err(StoreError::NotFound(_))));
        assert!(load_or_default(&path, VdfFormat::Binary).unwrap().is_empty());

        fs::write(&path, [0x00, b's', 0x00, 0x01]).unwrap();
        assert!(matches!(
            load_or_default(&path, VdfFormat::Binary),
            Err(StoreError::Parse { .. })
        ));
    }

    #[test]
    fn test_update_shortcuts_applies_closure() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(PERMITTED_STORE_FILE);

        let len = update_shortcuts(&path, |tree| tree.object_entry("shortcuts").map(|list| list.len())).unwrap();
        assert_eq!(len, Some(0));

        let tree = load(&path, VdfFormat::Binary).unwrap();
        assert!(tree.get("shortcuts").and_then(|v| v.as_object()).is_some());

        // Abandoned updates leave the file alone
        let before = fs::read(&path).unwrap();
        let skipped: Option<()> = update_shortcuts(&path, |_| None).unwrap();
        assert!(skipped.is_none());
        assert_eq!(fs::read(&path).unwrap(), before);

        let other = dir.path().join("localconfig.vdf");
        assert!(update_shortcuts(&other, |_| Some(())).is_err());
    }
}
