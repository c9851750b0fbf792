//! VDF (Valve Data Format) tree and codecs
//!
//! Steam keeps two dialects of the same keyed-tree format:
//! - text (`config.vdf`, `libraryfolders.vdf`, `*.acf`)
//! - binary (`shortcuts.vdf`)
//!
//! Both decode into the same ordered [`VdfMap`] so a caller can load a file,
//! touch one section and write it back without reordering anything else.

pub mod binary;
pub mod text;

use std::fmt;

/// Which grammar a store file is encoded with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VdfFormat {
    Binary,
    Text,
}

/// A VDF value - a scalar or a nested map
///
/// The text dialect only knows strings and maps; the binary dialect keeps
/// its integer types so they are written back with the same type byte.
#[derive(Debug, Clone, PartialEq)]
pub enum VdfValue {
    String(String),
    Int(i32),
    Float(f32),
    Pointer(i32),
    Color(i32),
    UInt64(u64),
    Int64(i64),
    Object(VdfMap),
}

impl VdfValue {
    /// Get as string reference
    pub fn as_str(&self) -> Option<&str> {
        match self {
            VdfValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get as object reference
    pub fn as_object(&self) -> Option<&VdfMap> {
        match self {
            VdfValue::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Get as mutable object reference
    pub fn as_object_mut(&mut self) -> Option<&mut VdfMap> {
        match self {
            VdfValue::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Integer view of a scalar. Strings are parsed, since the text dialect
    /// stores every number as a string.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            VdfValue::Int(v) | VdfValue::Pointer(v) | VdfValue::Color(v) => Some(i64::from(*v)),
            VdfValue::UInt64(v) => i64::try_from(*v).ok(),
            VdfValue::Int64(v) => Some(*v),
            VdfValue::String(s) => s.trim().parse().ok(),
            VdfValue::Float(_) | VdfValue::Object(_) => None,
        }
    }

    /// Get a nested value by key
    pub fn get(&self, key: &str) -> Option<&VdfValue> {
        self.as_object()?.get(key)
    }

    /// Get a nested value by key, ignoring ASCII case
    pub fn get_ignore_case(&self, key: &str) -> Option<&VdfValue> {
        self.as_object()?.get_ignore_case(key)
    }

    /// Get a string value by key
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key)?.as_str()
    }

    /// Render a scalar the way the text dialect stores it
    pub(crate) fn to_text_scalar(&self) -> Option<String> {
        match self {
            VdfValue::String(s) => Some(s.clone()),
            VdfValue::Int(v) | VdfValue::Pointer(v) | VdfValue::Color(v) => Some(v.to_string()),
            VdfValue::Float(v) => Some(v.to_string()),
            VdfValue::UInt64(v) => Some(v.to_string()),
            VdfValue::Int64(v) => Some(v.to_string()),
            VdfValue::Object(_) => None,
        }
    }
}

impl From<&str> for VdfValue {
    fn from(s: &str) -> Self {
        VdfValue::String(s.to_string())
    }
}

impl From<String> for VdfValue {
    fn from(s: String) -> Self {
        VdfValue::String(s)
    }
}

impl From<i32> for VdfValue {
    fn from(v: i32) -> Self {
        VdfValue::Int(v)
    }
}

impl From<VdfMap> for VdfValue {
    fn from(m: VdfMap) -> Self {
        VdfValue::Object(m)
    }
}

/// Insertion-ordered key/value map.
///
/// Keys are matched exactly; Steam is inconsistent about case (`appid` vs
/// `AppName`) so callers that need a case-insensitive lookup use
/// [`VdfMap::get_ignore_case`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VdfMap {
    entries: Vec<(String, VdfValue)>,
}

impl VdfMap {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&VdfValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut VdfValue> {
        self.entries.iter_mut().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_ignore_case(&self, key: &str) -> Option<&VdfValue> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Insert or replace. A replaced key keeps its original position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<VdfValue>) -> Option<VdfValue> {
        let key = key.into();
        let value = value.into();
        if let Some(slot) = self.get_mut(&key) {
            return Some(std::mem::replace(slot, value));
        }
        self.entries.push((key, value));
        None
    }

    pub fn remove(&mut self, key: &str) -> Option<VdfValue> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(pos).1)
    }

    /// Get the child map under `key`, creating an empty one if missing
    pub fn object_entry(&mut self, key: &str) -> Option<&mut VdfMap> {
        if !self.contains_key(key) {
            self.entries.push((key.to_string(), VdfValue::Object(VdfMap::new())));
        }
        self.get_mut(key)?.as_object_mut()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &VdfValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Merge a duplicate key the way Steam's own reader does: nested maps are
    /// merged, scalars are overwritten.
    pub(crate) fn merge_insert(&mut self, key: String, value: VdfValue) {
        if let Some(slot) = self.get_mut(&key) {
            match (slot, value) {
                (VdfValue::Object(existing), VdfValue::Object(incoming)) => {
                    for (k, v) in incoming.entries {
                        existing.merge_insert(k, v);
                    }
                }
                (slot, value) => *slot = value,
            }
            return;
        }
        self.entries.push((key, value));
    }
}

impl<'a> IntoIterator for &'a VdfMap {
    type Item = &'a (String, VdfValue);
    type IntoIter = std::slice::Iter<'a, (String, VdfValue)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Decode failure with the byte/char offset it was detected at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VdfParseError {
    pub offset: usize,
    pub reason: String,
}

impl VdfParseError {
    pub(crate) fn new(offset: usize, reason: impl Into<String>) -> Self {
        Self {
            offset,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for VdfParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VDF parse error at offset {}: {}", self.offset, self.reason)
    }
}

impl std::error::Error for VdfParseError {}

/// Decode bytes in the given format
pub fn decode(data: &[u8], format: VdfFormat) -> Result<VdfMap, VdfParseError> {
    match format {
        VdfFormat::Binary => binary::parse(data),
        VdfFormat::Text => {
            let content = std::str::from_utf8(data)
                .map_err(|e| VdfParseError::new(e.valid_up_to(), "text VDF is not valid UTF-8"))?;
            text::parse(content)
        }
    }
}

/// Encode a tree in the given format
pub fn encode(tree: &VdfMap, format: VdfFormat) -> Vec<u8> {
    match format {
        VdfFormat::Binary => binary::dump(tree),
        VdfFormat::Text => text::dump(tree).into_bytes(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_keeps_position() {
        let mut map = VdfMap::new();
        map.insert("a", "1");
        map.insert("b", "2");
        map.insert("a", "3");

        let keys: Vec<&str> = map.keys().collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(map.get("a").and_then(|v| v.as_str()), Some("3"));
    }

    #[test]
    fn test_merge_insert_merges_objects() {
        let mut first = VdfMap::new();
        first.insert("x", "1");
        let mut second = VdfMap::new();
        second.insert("y", "2");

        let mut root = VdfMap::new();
        root.merge_insert("section".into(), VdfValue::Object(first));
        root.merge_insert("section".into(), VdfValue::Object(second));

        let section = root.get("section").and_then(|v| v.as_object()).unwrap();
        assert_eq!(section.len(), 2);
    }

    #[test]
    fn test_as_i64_reads_text_numbers() {
        assert_eq!(VdfValue::from("42").as_i64(), Some(42));
        assert_eq!(VdfValue::Int(-7).as_i64(), Some(-7));
        assert_eq!(VdfValue::from("abc").as_i64(), None);
    }
}
