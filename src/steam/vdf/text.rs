//! Text VDF parser and writer
//!
//! Parses files like config.vdf, appmanifest_*.acf and libraryfolders.vdf.
//! The writer produces the tab-indented layout Steam itself writes.

use super::{VdfMap, VdfParseError, VdfValue};

struct Cursor<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    /// Skip whitespace and // comments
    fn skip_trivia(&mut self) {
        loop {
            while self.peek().is_some_and(|c| c.is_whitespace()) {
                self.bump();
            }
            if self.src[self.pos..].starts_with("//") {
                while self.peek().is_some_and(|c| c != '\n') {
                    self.bump();
                }
                continue;
            }
            break;
        }
    }

    /// Parse a quoted string "..."
    fn quoted(&mut self) -> Result<String, VdfParseError> {
        let start = self.pos;
        if self.bump() != Some('"') {
            return Err(VdfParseError::new(start, "expected opening quote"));
        }

        let mut result = String::new();
        loop {
            match self.bump() {
                None => return Err(VdfParseError::new(start, "unterminated string")),
                Some('"') => break,
                Some('\\') => match self.bump() {
                    Some('n') => result.push('\n'),
                    Some('t') => result.push('\t'),
                    Some('\\') => result.push('\\'),
                    Some('"') => result.push('"'),
                    Some(c) => {
                        result.push('\\');
                        result.push(c);
                    }
                    None => return Err(VdfParseError::new(start, "unterminated escape")),
                },
                Some(c) => result.push(c),
            }
        }
        Ok(result)
    }

    /// Unquoted tokens run until whitespace or a structural character
    fn bare(&mut self) -> String {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| !c.is_whitespace() && !matches!(c, '{' | '}' | '"'))
        {
            self.bump();
        }
        self.src[start..self.pos].to_string()
    }

    fn token(&mut self) -> Result<String, VdfParseError> {
        match self.peek() {
            Some('"') => self.quoted(),
            Some(_) => Ok(self.bare()),
            None => Err(VdfParseError::new(self.pos, "unexpected end of input")),
        }
    }

    /// Platform conditionals like [$WIN32] trail a value; they carry no data here
    fn skip_conditional(&mut self) {
        let save = self.pos;
        while self.peek().is_some_and(|c| c == ' ' || c == '\t') {
            self.bump();
        }
        if self.peek() == Some('[') {
            while self.peek().is_some_and(|c| c != ']' && c != '\n') {
                self.bump();
            }
            if self.peek() == Some(']') {
                self.bump();
                return;
            }
        }
        self.pos = save;
    }
}

/// Parse text VDF content into a root map
pub fn parse(content: &str) -> Result<VdfMap, VdfParseError> {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    let mut cursor = Cursor { src: content, pos: 0 };
    parse_object(&mut cursor, 0)
}

fn parse_object(cursor: &mut Cursor<'_>, depth: usize) -> Result<VdfMap, VdfParseError> {
    let mut map = VdfMap::new();

    loop {
        cursor.skip_trivia();

        match cursor.peek() {
            None if depth == 0 => break,
            None => return Err(VdfParseError::new(cursor.pos, "unexpected end of input, missing '}'")),
            Some('}') if depth == 0 => {
                return Err(VdfParseError::new(cursor.pos, "unbalanced '}' at top level"))
            }
            Some('}') => {
                cursor.bump();
                break;
            }
            Some('{') => return Err(VdfParseError::new(cursor.pos, "'{' without a key")),
            Some(_) => {
                let key = cursor.token()?;
                cursor.skip_conditional();
                cursor.skip_trivia();

                match cursor.peek() {
                    Some('{') => {
                        cursor.bump();
                        let value = parse_object(cursor, depth + 1)?;
                        map.merge_insert(key, VdfValue::Object(value));
                    }
                    Some('}') | None => {
                        return Err(VdfParseError::new(
                            cursor.pos,
                            format!("key \"{}\" has no value", key),
                        ))
                    }
                    Some(_) => {
                        let value = cursor.token()?;
                        cursor.skip_conditional();
                        map.merge_insert(key, VdfValue::String(value));
                    }
                }
            }
        }
    }

    Ok(map)
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out
}

/// Write a tree in Steam's tab-indented layout
pub fn dump(tree: &VdfMap) -> String {
    let mut out = String::new();
    dump_into(&mut out, tree, 0);
    out
}

fn dump_into(out: &mut String, map: &VdfMap, level: usize) {
    let indent = "\t".repeat(level);
    for (key, value) in map {
        match value {
            VdfValue::Object(child) => {
                out.push_str(&format!("{indent}\"{}\"\n{indent}{{\n", escape(key)));
                dump_into(out, child, level + 1);
                out.push_str(&format!("{indent}}}\n"));
            }
            scalar => {
                let text = scalar.to_text_scalar().unwrap_or_default();
                out.push_str(&format!("{indent}\"{}\"\t\t\"{}\"\n", escape(key), escape(&text)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_appmanifest() {
        let content = r#"
"AppState"
{
    "appid"         "489830"
    "Universe"      "1"
    "name"          "Skyrim Special Edition"
    "StateFlags"    "4"
    "installdir"    "Skyrim Special Edition"
}
"#;
        let root = parse(content).unwrap();
        let app_state = root.get("AppState").unwrap();
        assert_eq!(app_state.get_str("appid"), Some("489830"));
        assert_eq!(app_state.get_str("installdir"), Some("Skyrim Special Edition"));
    }

    #[test]
    fn test_parse_library_folders_keeps_order() {
        let content = r#"
"libraryfolders"
{
    "0"
    {
        "path"      "/home/user/.local/share/Steam"
        "label"     ""
    }
    // secondary drive
    "1"
    {
        "path"      "/mnt/games/SteamLibrary"
    }
}
"#;
        let root = parse(content).unwrap();
        let folders = root.get("libraryfolders").and_then(|v| v.as_object()).unwrap();
        let keys: Vec<&str> = folders.keys().collect();
        assert_eq!(keys, vec!["0", "1"]);
        assert_eq!(
            folders.get("1").and_then(|v| v.get_str("path")),
            Some("/mnt/games/SteamLibrary")
        );
    }

    #[test]
    fn test_parse_unquoted_and_conditionals() {
        let content = "root\n{\n  key value [$WIN32]\n  \"other\" \"x\"\n}\n";
        let root = parse(content).unwrap();
        let inner = root.get("root").unwrap();
        assert_eq!(inner.get_str("key"), Some("value"));
        assert_eq!(inner.get_str("other"), Some("x"));
    }

    #[test]
    fn test_parse_rejects_truncated_input() {
        let err = parse("\"root\"\n{\n\t\"a\"\t\t\"b\"\n").unwrap_err();
        assert!(err.reason.contains("missing '}'"));

        assert!(parse("\"root\" { \"a\" ").is_err());
        assert!(parse("}").is_err());
    }

    #[test]
    fn test_dump_round_trip_is_byte_identical() {
        let original = "\"InstallConfigStore\"\n{\n\t\"Software\"\n\t{\n\t\t\"Valve\"\n\t\t{\n\t\t\t\"Steam\"\n\t\t\t{\n\t\t\t\t\"path\"\t\t\"C:\\\\Games\"\n\t\t\t\t\"quote\"\t\t\"say \\\"hi\\\"\"\n\t\t\t}\n\t\t}\n\t}\n}\n";
        let tree = parse(original).unwrap();
        assert_eq!(
            tree.get("InstallConfigStore")
                .and_then(|v| v.get("Software"))
                .and_then(|v| v.get("Valve"))
                .and_then(|v| v.get("Steam"))
                .and_then(|v| v.get_str("path")),
            Some("C:\\Games")
        );
        assert_eq!(dump(&tree), original);
    }

    #[test]
    fn test_unknown_escape_keeps_its_value() {
        let tree = parse("\"path\"\t\t\"C:\\Games\"\n").unwrap();
        assert_eq!(tree.get("path").and_then(|v| v.as_str()), Some("C:\\Games"));

        // Written in canonical form; the value survives the trip
        let written = dump(&tree);
        assert_eq!(written, "\"path\"\t\t\"C:\\\\Games\"\n");
        assert_eq!(parse(&written).unwrap(), tree);
    }
}
