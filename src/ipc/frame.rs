//! STOMP-like text frame codec: a command line, `key:value` headers, a
//! blank line, an opaque body, and a `\0` terminator.
//!
//! **[EXPANSION]** original to this crate: the pack carries the
//! `CommitMessages` catalogue this module serializes, but not the framing
//! primitive itself (`PluginFrame` is referenced only by header, not by
//! source, in `examples/original_source/_INDEX.md`). The shape below follows
//! the teacher crate's general style for a small hand-rolled parser over a
//! growable buffer (explicit state, no external framing crate) rather than
//! any specific teacher file.

use std::io::{BufRead, Read, Write};

use crate::error::IpcError;

/// One STOMP-like frame: `COMMAND\nheader:value\n...\n\n<body>\0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginFrame {
    command: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl PluginFrame {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn add_header(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Returns the first value of `key`, or an empty string if absent — the
    /// teacher's message parsers feed this straight into `str::safe_strtonum`
    /// style conversions, which reject an empty string on their own.
    pub fn get_header(&self, key: &str) -> &str {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .unwrap_or("")
    }

    pub fn has_header(&self, key: &str) -> bool {
        self.headers.iter().any(|(k, _)| k == key)
    }

    pub fn set_body(&mut self, body: Vec<u8>) -> &mut Self {
        self.body = body;
        self
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    /// Serializes the frame, appending a `content-length` header when the
    /// body is non-empty so the reader never has to scan for the
    /// terminator inside binary step data.
    pub fn write_to(&self, w: &mut impl Write) -> Result<(), IpcError> {
        writeln!(w, "{}", self.command)?;
        for (k, v) in &self.headers {
            writeln!(w, "{k}:{v}")?;
        }
        if !self.body.is_empty() {
            writeln!(w, "content-length:{}", self.body.len())?;
        }
        writeln!(w)?;
        w.write_all(&self.body)?;
        w.write_all(&[0u8])?;
        w.flush()?;
        Ok(())
    }

    /// Reads one frame. Returns `Ok(None)` on a clean EOF before any bytes
    /// of a new frame arrive (the normal way a peer signals "no more
    /// messages"); any other truncation is `UnexpectedEof`.
    pub fn read_from(r: &mut impl BufRead) -> Result<Option<Self>, IpcError> {
        let command = match read_line(r)? {
            Some(line) if line.is_empty() => return Err(IpcError::WrongMessageFormat("empty command line".into())),
            Some(line) => line,
            None => return Ok(None),
        };

        let mut headers = Vec::new();
        loop {
            let line = read_line(r)?.ok_or(IpcError::UnexpectedEof)?;
            if line.is_empty() {
                break;
            }
            let (k, v) = line
                .split_once(':')
                .ok_or_else(|| IpcError::WrongMessageFormat(format!("header without ':': {line:?}")))?;
            headers.push((k.to_string(), v.to_string()));
        }

        let body_len: usize = headers
            .iter()
            .find(|(k, _)| k == "content-length")
            .map(|(_, v)| v.parse().map_err(|_| IpcError::WrongMessageFormat("bad content-length".into())))
            .transpose()?
            .unwrap_or(0);

        let mut body = vec![0u8; body_len];
        r.read_exact(&mut body).map_err(|_| IpcError::UnexpectedEof)?;

        let mut terminator = [0u8; 1];
        r.read_exact(&mut terminator).map_err(|_| IpcError::UnexpectedEof)?;
        if terminator[0] != 0 {
            return Err(IpcError::WrongMessageFormat("missing frame terminator".into()));
        }

        Ok(Some(Self { command, headers, body }))
    }
}

/// Reads a single `\n`-terminated text line, stripping a trailing `\r`.
/// `Ok(None)` iff the stream ended with zero bytes read (a clean EOF at a
/// frame boundary).
fn read_line(r: &mut impl BufRead) -> Result<Option<String>, IpcError> {
    let mut buf = Vec::new();
    let n = r.read_until(b'\n', &mut buf)?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
    }
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    String::from_utf8(buf)
        .map(Some)
        .map_err(|_| IpcError::WrongMessageFormat("non-UTF8 frame line".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufReader, Cursor};

    #[test]
    fn round_trips_a_frame_with_binary_body() {
        let mut frame = PluginFrame::new("Commit");
        frame.add_header("stepId", "7");
        frame.set_body(vec![0x00, b'7', 0x00, b'/', b'a', 0x00]);

        let mut buf = Vec::new();
        frame.write_to(&mut buf).unwrap();

        let mut reader = BufReader::new(Cursor::new(buf));
        let parsed = PluginFrame::read_from(&mut reader).unwrap().unwrap();
        assert_eq!(parsed.command(), "Commit");
        assert_eq!(parsed.get_header("stepId"), "7");
        assert_eq!(parsed.body(), frame.body());
    }

    #[test]
    fn frame_without_a_body_has_no_content_length_header() {
        let mut frame = PluginFrame::new("PackageBegin");
        frame.add_header("stepId", "3");
        let mut buf = Vec::new();
        frame.write_to(&mut buf).unwrap();
        assert!(!String::from_utf8_lossy(&buf).contains("content-length"));
    }

    #[test]
    fn clean_eof_at_frame_boundary_returns_none() {
        let mut reader = BufReader::new(Cursor::new(Vec::new()));
        assert!(PluginFrame::read_from(&mut reader).unwrap().is_none());
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let mut reader = BufReader::new(Cursor::new(b"PackageBegin\nstepId:1\n".to_vec()));
        assert!(PluginFrame::read_from(&mut reader).is_err());
    }
}
