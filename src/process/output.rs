//! Incremental splitting of subprocess output
//!
//! Install engines redraw progress with bare `\r` and finish lines with `\n`.
//! [`LineSplitter`] turns an arbitrary stream of byte chunks into both kinds
//! of line, with terminal escape sequences removed.

use std::sync::LazyLock;

use regex::bytes::Regex;

static ANSI_ESCAPE_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\](?-u:[^\x07\x1b])*(?:\x07|\x1b\\)").ok());

/// Which pipe a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// How a line was terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// Ended with `\n` (or `\r\n`)
    Output,
    /// Ended with a bare `\r`; the next one overwrites it
    Progress,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub kind: LineKind,
    pub text: String,
}

/// A line tagged with its source pipe, as handed to output callbacks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputEvent {
    pub stream: OutputStream,
    pub kind: LineKind,
    pub text: String,
}

/// Remove CSI (colours, cursor movement) and OSC (window title) sequences
pub fn strip_ansi(data: &[u8]) -> Vec<u8> {
    match ANSI_ESCAPE_RE.as_ref() {
        Some(re) => re.replace_all(data, &b""[..]).into_owned(),
        None => data.to_vec(),
    }
}

#[derive(Debug, Default)]
pub struct LineSplitter {
    buf: Vec<u8>,
    /// A `\r` was seen; it is a progress break unless `\n` follows
    pending_cr: bool,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    fn emit(&mut self, kind: LineKind, out: &mut Vec<OutputLine>) {
        let cleaned = strip_ansi(&self.buf);
        self.buf.clear();

        let text = String::from_utf8_lossy(&cleaned).into_owned();
        if kind == LineKind::Progress && text.trim().is_empty() {
            return;
        }
        out.push(OutputLine { kind, text });
    }

    /// Feed a chunk; returns every line completed by it
    pub fn push(&mut self, chunk: &[u8]) -> Vec<OutputLine> {
        let mut lines = Vec::new();

        for &byte in chunk {
            if self.pending_cr {
                self.pending_cr = false;
                if byte == b'\n' {
                    self.emit(LineKind::Output, &mut lines);
                    continue;
                }
                self.emit(LineKind::Progress, &mut lines);
            }

            match byte {
                b'\n' => self.emit(LineKind::Output, &mut lines),
                b'\r' => self.pending_cr = true,
                other => self.buf.push(other),
            }
        }

        lines
    }

    /// Flush whatever is left once the stream hits EOF
    pub fn finish(&mut self) -> Option<OutputLine> {
        let mut lines = Vec::new();
        if self.pending_cr {
            self.pending_cr = false;
            self.emit(LineKind::Progress, &mut lines);
        } else if !self.buf.is_empty() {
            self.emit(LineKind::Output, &mut lines);
        }
        lines.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(lines: &[OutputLine]) -> Vec<(LineKind, &str)> {
        lines.iter().map(|l| (l.kind, l.text.as_str())).collect()
    }

    #[test]
    fn test_split_newlines_and_progress() {
        let mut splitter = LineSplitter::new();
        let lines = splitter.push(b"Starting\n10%\r20%\rDone\n");
        assert_eq!(
            texts(&lines),
            vec![
                (LineKind::Output, "Starting"),
                (LineKind::Progress, "10%"),
                (LineKind::Progress, "20%"),
                (LineKind::Output, "Done"),
            ]
        );
    }

    #[test]
    fn test_crlf_is_one_output_line_across_chunks() {
        let mut splitter = LineSplitter::new();
        assert!(splitter.push(b"hello\r").is_empty());
        let lines = splitter.push(b"\nworld");
        assert_eq!(texts(&lines), vec![(LineKind::Output, "hello")]);
        assert_eq!(
            splitter.finish(),
            Some(OutputLine {
                kind: LineKind::Output,
                text: "world".to_string()
            })
        );
    }

    #[test]
    fn test_ansi_stripped() {
        let mut splitter = LineSplitter::new();
        let lines = splitter.push(b"\x1b[32m[INFO]\x1b[0m Downloading \x1b[1;33mfile\x1b[0m\n");
        assert_eq!(texts(&lines), vec![(LineKind::Output, "[INFO] Downloading file")]);
    }

    #[test]
    fn test_osc_title_stripped() {
        let mut splitter = LineSplitter::new();
        let lines = splitter.push(b"\x1b]0;jackify-engine\x07Installing\x1b]2;done\x1b\\ mods\n");
        assert_eq!(texts(&lines), vec![(LineKind::Output, "Installing mods")]);
    }

    #[test]
    fn test_trailing_carriage_return_flushes_as_progress() {
        let mut splitter = LineSplitter::new();
        assert!(splitter.push(b"50%\r").is_empty());
        assert_eq!(splitter.finish().map(|l| l.kind), Some(LineKind::Progress));
        assert_eq!(splitter.finish(), None);
    }
}
