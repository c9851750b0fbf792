//! ModOrganizer.ini path rewriting
//!
//! MO2 stores script-extender loader paths as Windows paths. After an
//! install on Linux they hold POSIX paths, which Proton can only see
//! through a drive letter, so each loader entry and its working directory
//! are rewritten to `Z:` (or `D:` on an SD card).

pub mod anchors;

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::logging::{log_debug, log_info, log_warning};
pub use anchors::{strip_removable_media_prefix, AnchorRoot, PathAnchor, DEFAULT_ANCHORS};

pub const MO2_INI: &str = "ModOrganizer.ini";

/// Script-extender loaders MO2 lists as custom executables
pub const DEFAULT_LOADERS: &[&str] = &[
    "skse64_loader.exe",
    "f4se_loader.exe",
    "skse_loader.exe",
    "sksevr_loader.exe",
    "f4sevr_loader.exe",
    "nvse_loader.exe",
    "fose_loader.exe",
    "obse_loader.exe",
];

#[derive(Debug)]
pub enum TranslateError {
    NotFound(PathBuf),
    Io { path: PathBuf, source: io::Error },
}

impl fmt::Display for TranslateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TranslateError::NotFound(path) => write!(f, "{} not found", path.display()),
            TranslateError::Io { path, source } => write!(f, "Failed to rewrite {}: {}", path.display(), source),
        }
    }
}

impl std::error::Error for TranslateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TranslateError::Io { source, .. } => Some(source),
            TranslateError::NotFound(_) => None,
        }
    }
}

/// Where the modlist and its base game live
#[derive(Debug, Clone)]
pub struct RewriteTarget {
    pub install_root: String,
    pub on_removable_media: bool,
    /// Steam library holding the base game (`.../steamapps/...` is trimmed)
    pub library_root: String,
    pub basegame_on_removable_media: bool,
}

/// One loader entry after rewriting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewrittenEntry {
    pub index: String,
    pub anchor: &'static str,
    pub binary: String,
    pub working_directory: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriteReport {
    pub updated: Vec<RewrittenEntry>,
    /// Loader lines no anchor matched; left as they were
    pub skipped: Vec<String>,
}

impl RewriteReport {
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty()
    }
}

/// Back to a plain POSIX path, whatever form the value is in now:
/// `Z:\\home\\x`, `Z:/home/x` and `/home/x` all give `/home/x`.
fn normalize_value(value: &str) -> String {
    let trimmed = value.trim().trim_matches('"');
    let without_drive = match trimmed.as_bytes() {
        [drive, b':', ..] if drive.is_ascii_alphabetic() => &trimmed[2..],
        _ => trimmed,
    };

    let mut path = without_drive.replace('\\', "/");
    while path.contains("//") {
        path = path.replace("//", "/");
    }
    path
}

/// MO2's escaped Windows form: every `/` becomes `\\`
fn to_ini_path(drive: char, posix: &str) -> String {
    format!("{}:{}", drive, posix.replace('/', "\\\\"))
}

fn parent_dir(posix: &str) -> &str {
    match posix.rfind('/') {
        Some(0) => "/",
        Some(idx) => &posix[..idx],
        None => posix,
    }
}

/// Split a line into content and its original terminator
fn split_line_ending(line: &str) -> (&str, &str) {
    if let Some(body) = line.strip_suffix("\r\n") {
        (body, "\r\n")
    } else if let Some(body) = line.strip_suffix('\n') {
        (body, "\n")
    } else {
        (line, "")
    }
}

/// `3\binary` gives `Some("3")`
fn binary_index(key: &str) -> Option<&str> {
    let (index, name) = key.trim().split_once('\\')?;
    (name == "binary" && !index.is_empty()).then_some(index)
}

fn working_dir_index(key: &str) -> Option<&str> {
    let (index, name) = key.trim().split_once('\\')?;
    (name == "workingDirectory" && !index.is_empty()).then_some(index)
}

pub struct PathTranslator {
    loaders: Vec<String>,
    anchors: Vec<PathAnchor>,
}

impl Default for PathTranslator {
    fn default() -> Self {
        Self {
            loaders: DEFAULT_LOADERS.iter().map(|s| s.to_string()).collect(),
            anchors: DEFAULT_ANCHORS.to_vec(),
        }
    }
}

impl PathTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_loaders<I, S>(mut self, loaders: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.loaders = loaders.into_iter().map(Into::into).collect();
        self
    }

    fn is_loader(&self, posix: &str) -> bool {
        let lower = posix.to_ascii_lowercase();
        self.loaders
            .iter()
            .any(|loader| lower.ends_with(&format!("/{}", loader.to_ascii_lowercase())))
    }

    /// New binary/working-directory values for one loader path
    fn translate(&self, posix: &str, target: &RewriteTarget) -> Option<(&'static str, String, String)> {
        let (anchor, suffix) = anchors::classify(&self.anchors, posix)?;

        let (root, removable) = match anchor.root {
            AnchorRoot::Install => {
                let root = if target.on_removable_media {
                    strip_removable_media_prefix(&target.install_root)
                } else {
                    target.install_root.clone()
                };
                (root, target.on_removable_media)
            }
            AnchorRoot::Library => {
                let library = match target.library_root.find("steamapps") {
                    Some(idx) => &target.library_root[..idx],
                    None => target.library_root.as_str(),
                };
                let root = if target.basegame_on_removable_media {
                    strip_removable_media_prefix(library)
                } else {
                    library.to_string()
                };
                (root, target.basegame_on_removable_media)
            }
        };

        let drive = if removable { 'D' } else { 'Z' };
        let full = format!("{}{}", root.trim_end_matches('/'), suffix);

        Some((
            anchor.pattern,
            to_ini_path(drive, &full),
            to_ini_path(drive, parent_dir(&full)),
        ))
    }

    /// Rewrite the loader entries of an INI held in memory
    pub fn rewrite_content(&self, content: &str, target: &RewriteTarget) -> (String, RewriteReport) {
        let lines: Vec<&str> = content.split_inclusive('\n').collect();
        let mut report = RewriteReport::default();

        // Pass 1: work out every pair before touching anything
        for line in &lines {
            let (body, _) = split_line_ending(line);
            let Some((key, value)) = body.split_once('=') else {
                continue;
            };
            let Some(index) = binary_index(key) else {
                continue;
            };

            let posix = normalize_value(value);
            if !self.is_loader(&posix) {
                continue;
            }

            match self.translate(&posix, target) {
                Some((anchor, binary, working_directory)) => {
                    log_debug(&format!("{}\\binary [{}] -> {}", index, anchor, binary));
                    report.updated.push(RewrittenEntry {
                        index: index.to_string(),
                        anchor,
                        binary,
                        working_directory,
                    });
                }
                None => {
                    log_warning(&format!("No known folder in loader path, leaving it: {}", body.trim()));
                    report.skipped.push(body.to_string());
                }
            }
        }

        if report.updated.is_empty() {
            return (content.to_string(), report);
        }

        let entry_for = |index: &str| report.updated.iter().find(|e| e.index == index);

        // Pass 2: rewrite both members of each pair
        let mut out = String::with_capacity(content.len());
        let mut seen_working_dir: Vec<&str> = Vec::new();
        for line in &lines {
            let (body, ending) = split_line_ending(line);
            let Some((key, _)) = body.split_once('=') else {
                out.push_str(line);
                continue;
            };

            if let Some(entry) = binary_index(key).and_then(entry_for) {
                out.push_str(&format!("{}={}{}", key, entry.binary, ending));
            } else if let Some(entry) = working_dir_index(key).and_then(entry_for) {
                out.push_str(&format!("{}={}{}", key, entry.working_directory, ending));
                seen_working_dir.push(entry.index.as_str());
            } else {
                out.push_str(line);
            }
        }

        // A binary without a working directory line would diverge from it
        let missing: Vec<&RewrittenEntry> = report
            .updated
            .iter()
            .filter(|e| !seen_working_dir.contains(&e.index.as_str()))
            .collect();
        if !missing.is_empty() {
            out = insert_missing_working_dirs(&out, &missing);
        }

        (out, report)
    }

    /// Rewrite loader entries in `ini`; the file is written once, only if
    /// something changed.
    pub fn rewrite_binary_paths(&self, ini: &Path, target: &RewriteTarget) -> Result<RewriteReport, TranslateError> {
        if !ini.is_file() {
            return Err(TranslateError::NotFound(ini.to_path_buf()));
        }
        let io_err = |source| TranslateError::Io {
            path: ini.to_path_buf(),
            source,
        };

        let content = fs::read_to_string(ini).map_err(io_err)?;
        let (rewritten, report) = self.rewrite_content(&content, target);

        if report.is_empty() {
            log_info(&format!("No loader entries to rewrite in {}", ini.display()));
            return Ok(report);
        }
        if rewritten != content {
            fs::write(ini, rewritten).map_err(io_err)?;
        }

        log_info(&format!(
            "Rewrote {} loader path(s) in {} ({} skipped)",
            report.updated.len(),
            ini.display(),
            report.skipped.len()
        ));
        Ok(report)
    }
}

/// Add `N\workingDirectory=` right after each `N\binary=` that lacks one
fn insert_missing_working_dirs(content: &str, missing: &[&RewrittenEntry]) -> String {
    let mut out = String::with_capacity(content.len());
    for line in content.split_inclusive('\n') {
        out.push_str(line);
        let (body, ending) = split_line_ending(line);
        let Some((key, _)) = body.split_once('=') else {
            continue;
        };
        if let Some(entry) = binary_index(key).and_then(|i| missing.iter().find(|e| e.index == i)) {
            let ending = if ending.is_empty() { "\n" } else { ending };
            if !line.ends_with('\n') {
                out.push_str(ending);
            }
            let prefix = key.trim().trim_end_matches("binary");
            out.push_str(&format!("{}workingDirectory={}", prefix, entry.working_directory));
            if line.ends_with('\n') {
                out.push_str(ending);
            }
        }
    }
    out
}

/// Convenience over [`PathTranslator::rewrite_binary_paths`] with the
/// default loaders and anchors.
///
/// Only [`DEFAULT_LOADERS`] are rewritten; any other executable (say
/// `mods/Foo/bar.exe`) is left as is. Use [`PathTranslator::with_loaders`]
/// to cover it.
pub fn rewrite_binary_paths(
    ini: &Path,
    install_root: &str,
    on_removable_media: bool,
    library_root: &str,
    basegame_on_removable_media: bool,
) -> Result<RewriteReport, TranslateError> {
    PathTranslator::default().rewrite_binary_paths(
        ini,
        &RewriteTarget {
            install_root: install_root.to_string(),
            on_removable_media,
            library_root: library_root.to_string(),
            basegame_on_removable_media,
        },
    )
}

/// Install roots that must never be used, since installs clean their target
pub fn is_dangerous_install_root(path: &Path) -> bool {
    let normalized = path.to_string_lossy();
    let normalized = match normalized.trim_end_matches('/') {
        "" => "/",
        other => other,
    };
    if matches!(normalized, "/" | "/home" | "/root") {
        return true;
    }
    dirs::home_dir().is_some_and(|home| home.as_path() == Path::new(normalized))
}

/// `ModOrganizer.ini` in the install root, or one folder down
pub fn find_mo2_ini(install_root: &Path) -> Option<PathBuf> {
    let direct = install_root.join(MO2_INI);
    if direct.is_file() {
        return Some(direct);
    }

    WalkDir::new(install_root)
        .min_depth(2)
        .max_depth(2)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .find(|entry| entry.file_type().is_file() && entry.file_name() == MO2_INI)
        .map(|entry| entry.into_path())
}
