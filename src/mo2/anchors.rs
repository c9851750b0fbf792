//! Directory conventions found in MO2 executable paths
//!
//! Every loader path in a modlist's `ModOrganizer.ini` sits under one of a
//! handful of well-known folders. The folder decides which root the path is
//! re-based onto.

/// Which root a matched path is re-based onto
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorRoot {
    /// The modlist install directory
    Install,
    /// The Steam library holding the base game
    Library,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathAnchor {
    /// Folder name as it appears between slashes
    pub pattern: &'static str,
    pub root: AnchorRoot,
}

const fn anchor(pattern: &'static str, root: AnchorRoot) -> PathAnchor {
    PathAnchor { pattern, root }
}

/// Anchors in match order. Longer stock-game spellings come before the
/// shorter ones they contain, and all of them before `mods` and `steamapps`.
pub const DEFAULT_ANCHORS: &[PathAnchor] = &[
    anchor("Stock Game Folder", AnchorRoot::Install),
    anchor("root/Skyrim Special Edition", AnchorRoot::Install),
    anchor("Stock Game", AnchorRoot::Install),
    anchor("STOCK GAME", AnchorRoot::Install),
    anchor("Game Root", AnchorRoot::Install),
    anchor("Stock Folder", AnchorRoot::Install),
    anchor("Skyrim Stock", AnchorRoot::Install),
    anchor("mods", AnchorRoot::Install),
    anchor("steamapps", AnchorRoot::Library),
];

impl PathAnchor {
    /// The part of `path` from this anchor's folder onwards (`/mods/Foo/x.exe`)
    pub fn suffix<'p>(&self, path: &'p str) -> Option<&'p str> {
        let needle = format!("/{}/", self.pattern);
        path.rfind(&needle).map(|idx| &path[idx..])
    }
}

/// First anchor that occurs in `path`, with the anchor-relative suffix
pub fn classify<'a, 'p>(anchors: &'a [PathAnchor], path: &'p str) -> Option<(&'a PathAnchor, &'p str)> {
    anchors
        .iter()
        .find_map(|anchor| anchor.suffix(path).map(|suffix| (anchor, suffix)))
}

const REMOVABLE_MEDIA_PREFIX: &str = "/run/media/";

pub fn is_removable_media(path: &str) -> bool {
    path.starts_with(REMOVABLE_MEDIA_PREFIX)
}

/// Drop the mount point and volume id from a removable-media path:
/// `/run/media/<user>/<volume>/rest` becomes `/rest`. SD cards mounted
/// directly as `/run/media/mmcblk0p1` have no user segment.
pub fn strip_removable_media_prefix(path: &str) -> String {
    let Some(rest) = path.strip_prefix(REMOVABLE_MEDIA_PREFIX) else {
        return path.to_string();
    };

    let skip = if rest.starts_with("mmcblk") { 1 } else { 2 };
    let mut parts = rest.splitn(skip + 1, '/');
    for _ in 0..skip {
        if parts.next().is_none_or(str::is_empty) {
            return path.to_string();
        }
    }

    match parts.next() {
        Some(tail) => format!("/{}", tail),
        None => "/".to_string(),
    }
}
