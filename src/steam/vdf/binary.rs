//! Binary VDF parser and writer (shortcuts.vdf)
//!
//! Layout: every entry is `<type byte><key>\0<value>`, a map is closed by
//! 0x08. The root map's closing 0x08 is the last byte of the file.

use super::{VdfMap, VdfParseError, VdfValue};

const TYPE_MAP: u8 = 0x00;
const TYPE_STRING: u8 = 0x01;
const TYPE_INT32: u8 = 0x02;
const TYPE_FLOAT: u8 = 0x03;
const TYPE_POINTER: u8 = 0x04;
const TYPE_COLOR: u8 = 0x06;
const TYPE_UINT64: u8 = 0x07;
const TYPE_END: u8 = 0x08;
const TYPE_INT64: u8 = 0x0A;

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn byte(&mut self) -> Result<u8, VdfParseError> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| VdfParseError::new(self.pos, "unexpected end of data"))?;
        self.pos += 1;
        Ok(b)
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], VdfParseError> {
        let end = self.pos + N;
        let slice = self
            .data
            .get(self.pos..end)
            .ok_or_else(|| VdfParseError::new(self.pos, format!("need {} bytes, data truncated", N)))?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        self.pos = end;
        Ok(out)
    }

    /// Read a null-terminated string
    fn cstring(&mut self) -> Result<String, VdfParseError> {
        let start = self.pos;
        let len = self.data[start..]
            .iter()
            .position(|&b| b == 0x00)
            .ok_or_else(|| VdfParseError::new(start, "unterminated string"))?;
        let s = String::from_utf8_lossy(&self.data[start..start + len]).into_owned();
        self.pos = start + len + 1;
        Ok(s)
    }
}

/// Parse a binary VDF buffer into its root map
pub fn parse(data: &[u8]) -> Result<VdfMap, VdfParseError> {
    let mut reader = Reader { data, pos: 0 };
    let root = parse_map(&mut reader, 0)?;

    if !reader.at_end() {
        return Err(VdfParseError::new(
            reader.pos,
            format!("{} trailing bytes after root map", data.len() - reader.pos),
        ));
    }

    Ok(root)
}

fn parse_map(reader: &mut Reader<'_>, depth: usize) -> Result<VdfMap, VdfParseError> {
    let mut map = VdfMap::new();

    loop {
        // A root map without its closing byte is accepted; nested maps must close
        if reader.at_end() {
            if depth == 0 {
                return Ok(map);
            }
            return Err(VdfParseError::new(reader.pos, "unexpected end of data inside map"));
        }

        let type_pos = reader.pos;
        let value_type = reader.byte()?;
        if value_type == TYPE_END {
            return Ok(map);
        }

        let key = reader.cstring()?;
        let value = match value_type {
            TYPE_MAP => VdfValue::Object(parse_map(reader, depth + 1)?),
            TYPE_STRING => VdfValue::String(reader.cstring()?),
            TYPE_INT32 => VdfValue::Int(i32::from_le_bytes(reader.take::<4>()?)),
            TYPE_FLOAT => VdfValue::Float(f32::from_le_bytes(reader.take::<4>()?)),
            TYPE_POINTER => VdfValue::Pointer(i32::from_le_bytes(reader.take::<4>()?)),
            TYPE_COLOR => VdfValue::Color(i32::from_le_bytes(reader.take::<4>()?)),
            TYPE_UINT64 => VdfValue::UInt64(u64::from_le_bytes(reader.take::<8>()?)),
            TYPE_INT64 => VdfValue::Int64(i64::from_le_bytes(reader.take::<8>()?)),
            other => {
                return Err(VdfParseError::new(
                    type_pos,
                    format!("unknown type byte 0x{:02x} for key \"{}\"", other, key),
                ))
            }
        };

        map.insert(key, value);
    }
}

/// Serialize a tree into binary VDF
pub fn dump(tree: &VdfMap) -> Vec<u8> {
    let mut data = Vec::new();
    write_map(&mut data, tree);
    data
}

fn write_key(data: &mut Vec<u8>, value_type: u8, key: &str) {
    data.push(value_type);
    data.extend_from_slice(key.as_bytes());
    data.push(0x00);
}

fn write_map(data: &mut Vec<u8>, map: &VdfMap) {
    for (key, value) in map {
        match value {
            VdfValue::Object(child) => {
                write_key(data, TYPE_MAP, key);
                write_map(data, child);
            }
            VdfValue::String(s) => {
                write_key(data, TYPE_STRING, key);
                data.extend_from_slice(s.as_bytes());
                data.push(0x00);
            }
            VdfValue::Int(v) => {
                write_key(data, TYPE_INT32, key);
                data.extend_from_slice(&v.to_le_bytes());
            }
            VdfValue::Float(v) => {
                write_key(data, TYPE_FLOAT, key);
                data.extend_from_slice(&v.to_le_bytes());
            }
            VdfValue::Pointer(v) => {
                write_key(data, TYPE_POINTER, key);
                data.extend_from_slice(&v.to_le_bytes());
            }
            VdfValue::Color(v) => {
                write_key(data, TYPE_COLOR, key);
                data.extend_from_slice(&v.to_le_bytes());
            }
            VdfValue::UInt64(v) => {
                write_key(data, TYPE_UINT64, key);
                data.extend_from_slice(&v.to_le_bytes());
            }
            VdfValue::Int64(v) => {
                write_key(data, TYPE_INT64, key);
                data.extend_from_slice(&v.to_le_bytes());
            }
        }
    }
    data.push(TYPE_END);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_shortcuts() -> Vec<u8> {
        let mut data = Vec::new();
        data.push(0x00);
        data.extend_from_slice(b"shortcuts\0");
        data.push(0x00);
        data.extend_from_slice(b"0\0");
        data.push(0x02);
        data.extend_from_slice(b"appid\0");
        data.extend_from_slice(&(-123_456_789i32).to_le_bytes());
        data.push(0x01);
        data.extend_from_slice(b"AppName\0Skyrim Modded\0");
        data.push(0x00);
        data.extend_from_slice(b"tags\0");
        data.push(0x01);
        data.extend_from_slice(b"0\0Jackify\0");
        data.push(0x08); // tags
        data.push(0x08); // "0"
        data.push(0x08); // shortcuts
        data.push(0x08); // root
        data
    }

    #[test]
    fn test_parse_shortcuts_file() {
        let root = parse(&sample_shortcuts()).unwrap();
        let entry = root
            .get("shortcuts")
            .and_then(|v| v.get("0"))
            .unwrap();

        assert_eq!(entry.get("appid"), Some(&VdfValue::Int(-123_456_789)));
        assert_eq!(entry.get_str("AppName"), Some("Skyrim Modded"));
        assert_eq!(
            entry.get("tags").and_then(|t| t.get_str("0")),
            Some("Jackify")
        );
    }

    #[test]
    fn test_dump_reproduces_input_bytes() {
        let original = sample_shortcuts();
        let root = parse(&original).unwrap();
        assert_eq!(dump(&root), original);
    }

    #[test]
    fn test_wide_integer_types_survive() {
        let mut root = VdfMap::new();
        root.insert("big", VdfValue::UInt64(u64::MAX - 1));
        root.insert("neg", VdfValue::Int64(-5));
        root.insert("ratio", VdfValue::Float(0.5));

        let parsed = parse(&dump(&root)).unwrap();
        assert_eq!(parsed, root);
    }

    #[test]
    fn test_truncated_data_is_an_error() {
        let data = sample_shortcuts();
        // Cut inside the nested "0" map
        let err = parse(&data[..30]).unwrap_err();
        assert!(err.offset <= 30);

        // Missing the final root terminator is tolerated
        assert!(parse(&data[..data.len() - 1]).is_ok());
    }

    #[test]
    fn test_unknown_type_byte() {
        let data = [0x05, b'k', 0x00, 0x00, 0x08];
        let err = parse(&data).unwrap_err();
        assert!(err.reason.contains("0x05"));
        assert_eq!(err.offset, 0);
    }

    #[test]
    fn test_empty_input_is_empty_tree() {
        assert!(parse(&[]).unwrap().is_empty());
    }
}
