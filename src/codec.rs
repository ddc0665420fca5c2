//! The peer wire format: headered, length-framed messages with a method
//! line, a free-form header bag with case-insensitive keys, and an opaque
//! payload. The transport delivers one complete frame at a time; frames can
//! also be embedded back-to-back inside another frame's payload (e.g. the
//! COMMIT sequence inside a SYNCHRONIZE_RESPONSE).
//!
//! Encoding is a simple text format:
//!
//! ```text
//! METHOD\r\n
//! Key: value\r\n
//! Content-Length: N\r\n
//! \r\n
//! <N payload bytes>
//! ```
//!
//! Content-Length is owned by the codec: it is appended on encode and
//! stripped on decode, so the header bag round-trips unchanged.

use crate::error::{Error, Result};

const CRLF: &str = "\r\n";
const CONTENT_LENGTH: &str = "Content-Length";

/// A free-form header bag. Keys are compared case-insensitively, but the
/// original casing and insertion order are preserved for round-tripping.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Creates an empty header bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetches a header value by case-insensitive key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.iter().find(|(k, _)| k.eq_ignore_ascii_case(key)).map(|(_, v)| v.as_str())
    }

    /// Returns true if the header is present, case-insensitively.
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Sets a header, replacing any existing value under a
    /// case-insensitively equal key.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(&key)) {
            entry.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    /// Removes a header by case-insensitive key, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        let index = self.entries.iter().position(|(k, _)| k.eq_ignore_ascii_case(key))?;
        Some(self.entries.remove(index).1)
    }

    /// Iterates over the entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// A single wire frame: method line, header bag, payload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Frame {
    pub method: String,
    pub headers: Headers,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Creates an empty frame with the given method line.
    pub fn new(method: impl Into<String>) -> Self {
        Self { method: method.into(), headers: Headers::new(), payload: Vec::new() }
    }

    /// Fetches a required header, or errors with the standard missing-header
    /// protocol fault.
    pub fn require(&self, key: &str) -> Result<&str> {
        self.headers.get(key).ok_or_else(|| Error::Protocol(format!("missing {key}")))
    }

    /// Fetches a required header parsed as u64.
    pub fn require_u64(&self, key: &str) -> Result<u64> {
        self.require(key)?
            .parse()
            .map_err(|_| Error::Protocol(format!("malformed {key}")))
    }

    /// Fetches a required header parsed as i64.
    pub fn require_i64(&self, key: &str) -> Result<i64> {
        self.require(key)?
            .parse()
            .map_err(|_| Error::Protocol(format!("malformed {key}")))
    }

    /// Returns the payload as UTF-8 text.
    pub fn text(&self) -> Result<String> {
        Ok(String::from_utf8(self.payload.clone())?)
    }

    /// Encodes the frame into bytes, appending a Content-Length header.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = String::new();
        out.push_str(&self.method);
        out.push_str(CRLF);
        for (key, value) in self.headers.iter() {
            if key.eq_ignore_ascii_case(CONTENT_LENGTH) {
                continue;
            }
            out.push_str(key);
            out.push_str(": ");
            out.push_str(value);
            out.push_str(CRLF);
        }
        out.push_str(CONTENT_LENGTH);
        out.push_str(": ");
        out.push_str(&self.payload.len().to_string());
        out.push_str(CRLF);
        out.push_str(CRLF);
        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Decodes one frame from the front of the buffer, returning the frame
    /// and the number of bytes consumed. Errors if the buffer doesn't hold a
    /// complete, well-formed frame.
    pub fn decode(bytes: &[u8]) -> Result<(Frame, usize)> {
        let mut pos = 0;
        let method = read_line(bytes, &mut pos)?;
        if method.is_empty() {
            return Err(Error::Protocol("empty method line".into()));
        }
        let mut headers = Headers::new();
        let mut content_length = 0;
        loop {
            let line = read_line(bytes, &mut pos)?;
            if line.is_empty() {
                break;
            }
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| Error::Protocol(format!("malformed header line: {line}")))?;
            let (key, value) = (key.trim(), value.trim());
            if key.eq_ignore_ascii_case(CONTENT_LENGTH) {
                content_length = value
                    .parse()
                    .map_err(|_| Error::Protocol("malformed Content-Length".into()))?;
            } else {
                headers.set(key, value);
            }
        }
        if bytes.len() < pos + content_length {
            return Err(Error::Protocol("truncated payload".into()));
        }
        let payload = bytes[pos..pos + content_length].to_vec();
        Ok((Frame { method: method.to_string(), headers, payload }, pos + content_length))
    }

    /// Decodes a sequence of back-to-back embedded frames, consuming the
    /// entire buffer.
    pub fn decode_all(mut bytes: &[u8]) -> Result<Vec<Frame>> {
        let mut frames = Vec::new();
        while !bytes.is_empty() {
            let (frame, consumed) = Frame::decode(bytes)?;
            frames.push(frame);
            bytes = &bytes[consumed..];
        }
        Ok(frames)
    }
}

/// Reads a CRLF- or LF-terminated line starting at pos, advancing pos past
/// the terminator. The line itself must be valid UTF-8.
fn read_line<'a>(bytes: &'a [u8], pos: &mut usize) -> Result<&'a str> {
    let rest = &bytes[*pos..];
    let end = rest
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| Error::Protocol("unterminated header line".into()))?;
    let mut line = &rest[..end];
    if line.last() == Some(&b'\r') {
        line = &line[..line.len() - 1];
    }
    *pos += end + 1;
    std::str::from_utf8(line).map_err(|_| Error::Protocol("non-UTF-8 header line".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn frame() -> Frame {
        let mut frame = Frame::new("BEGIN_TRANSACTION");
        frame.headers.set("NewCount", "7");
        frame.headers.set("NewHash", "CAFE");
        frame.payload = b"UPDATE t SET x = 1".to_vec();
        frame
    }

    #[test]
    fn roundtrip() {
        let original = frame();
        let (decoded, consumed) = Frame::decode(&original.encode()).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(consumed, original.encode().len());
    }

    #[test]
    fn roundtrip_empty_payload() {
        let mut original = Frame::new("SYNCHRONIZE");
        original.headers.set("CommitCount", "0");
        let (decoded, _) = Frame::decode(&original.encode()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn case_insensitive_headers() {
        let frame = frame();
        assert_eq!(frame.headers.get("newcount"), Some("7"));
        assert_eq!(frame.headers.get("NEWHASH"), Some("CAFE"));
        assert_eq!(frame.headers.get("missing"), None);

        let mut headers = Headers::new();
        headers.set("Hash", "AA");
        headers.set("HASH", "BB");
        assert_eq!(headers.get("hash"), Some("BB"));
        assert_eq!(headers.iter().count(), 1);
    }

    #[test]
    fn embedded_sequence() {
        let mut buffer = Vec::new();
        let mut frames = Vec::new();
        for i in 1..=3 {
            let mut frame = Frame::new("COMMIT");
            frame.headers.set("CommitIndex", i.to_string());
            frame.headers.set("Hash", format!("H{i}"));
            frame.payload = format!("INSERT {i}").into_bytes();
            buffer.extend_from_slice(&frame.encode());
            frames.push(frame);
        }
        assert_eq!(Frame::decode_all(&buffer).unwrap(), frames);
    }

    #[test]
    fn binary_payload() {
        let mut original = Frame::new("ESCALATE");
        original.headers.set("ID", "cmd1");
        original.payload = vec![0x00, 0xff, 0x80, b'\n', b'\r'];
        let (decoded, _) = Frame::decode(&original.encode()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn malformed_input() {
        assert!(Frame::decode(b"").is_err());
        assert!(Frame::decode(b"\r\n\r\n").is_err());
        assert!(Frame::decode(b"STATE\r\nbroken header\r\n\r\n").is_err());
        assert!(Frame::decode(b"STATE\r\nContent-Length: 10\r\n\r\nshort").is_err());
        assert!(Frame::decode(b"STATE\r\nContent-Length: zzz\r\n\r\n").is_err());
    }

    #[test]
    fn required_headers() {
        let frame = frame();
        assert_eq!(frame.require_u64("NewCount").unwrap(), 7);
        assert_eq!(
            frame.require("CommitCount"),
            Err(Error::Protocol("missing CommitCount".into()))
        );
        assert_eq!(
            Frame { headers: { let mut h = Headers::new(); h.set("NewCount", "x"); h }, ..frame }
                .require_u64("NewCount"),
            Err(Error::Protocol("malformed NewCount".into()))
        );
    }
}
