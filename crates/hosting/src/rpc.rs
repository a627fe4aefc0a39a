//! JSON-RPC 2.0 message shapes and stdio framing for external connector
//! processes.
//!
//! Two framings exist in the wild: one JSON object per newline-terminated
//! line, and HTTP-style `Content-Length: <n>` header framing. A given server
//! speaks one of them, but the bridge cannot know which in advance, so inbound
//! extraction detects the framing per buffer prefix and outbound encoding is a
//! mode the bridge settles on during the initialize handshake.

use serde::Deserialize;
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol revision advertised in the initialize handshake.
pub const PROTOCOL_VERSION: &str = "2025-06-18";

#[derive(Debug, Clone)]
pub struct Request {
    pub id: u64,
    pub method: String,
    pub params: Option<Value>,
}

impl Request {
    #[must_use]
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            id,
            method: method.into(),
            params: Some(params),
        }
    }

    #[must_use]
    pub fn into_value(self) -> Value {
        let mut obj = serde_json::json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": self.id,
            "method": self.method,
        });
        if let Some(params) = self.params {
            obj["params"] = params;
        }
        obj
    }
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

impl Notification {
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    #[must_use]
    pub fn into_value(self) -> Value {
        let mut obj = serde_json::json!({
            "jsonrpc": JSONRPC_VERSION,
            "method": self.method,
        });
        if let Some(params) = self.params {
            obj["params"] = params;
        }
        obj
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcError>,
}

impl Response {
    /// Numeric request id, accepting both number and numeric-string forms.
    #[must_use]
    pub fn numeric_id(&self) -> Option<u64> {
        match self.id.as_ref()? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse::<u64>().ok(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// Outbound wire framing for one bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFraming {
    /// One JSON object per line, `\n`-terminated.
    LineDelimited,
    /// `Content-Length: <n>\r\n\r\n` header followed by exactly `n` body bytes.
    ContentLength,
}

/// Encode one message under the given framing.
#[must_use]
pub fn encode_frame(framing: WireFraming, payload: &Value) -> Vec<u8> {
    let body = payload.to_string();
    match framing {
        WireFraming::LineDelimited => {
            let mut out = body.into_bytes();
            out.push(b'\n');
            out
        }
        WireFraming::ContentLength => {
            let mut out = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
            out.extend_from_slice(body.as_bytes());
            out
        }
    }
}

const CONTENT_LENGTH_PREFIX: &[u8] = b"content-length:";

/// Accumulates inbound child-process bytes and yields complete JSON frames.
///
/// Framing is decided per buffer prefix: a buffer starting with a
/// `Content-Length:` header is consumed as a length-prefixed frame, anything
/// else as newline-delimited. The buffer is capped; overflowing without a
/// complete frame trims the oldest bytes instead of growing unbounded, since
/// a flooding or malformed child is a recoverable condition here (the health
/// probe is what eventually retires it).
#[derive(Debug)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    cap: usize,
}

impl FrameBuffer {
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            buf: Vec::new(),
            cap,
        }
    }

    /// Append inbound bytes. Returns `true` when the cap forced a trim so the
    /// caller can log it.
    pub fn extend(&mut self, bytes: &[u8]) -> bool {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() <= self.cap {
            return false;
        }
        let excess = self.buf.len() - self.cap;
        self.buf.drain(..excess);
        true
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Extract the next complete JSON frame, if any. Malformed frames are
    /// skipped, not fatal.
    pub fn next_frame(&mut self) -> Option<Value> {
        loop {
            // Skip inter-frame newlines.
            let skip = self
                .buf
                .iter()
                .take_while(|b| **b == b'\r' || **b == b'\n')
                .count();
            if skip > 0 {
                self.buf.drain(..skip);
            }
            if self.buf.is_empty() {
                return None;
            }

            if starts_with_content_length(&self.buf) {
                match self.take_length_prefixed() {
                    LengthFramed::Complete(bytes) => {
                        if let Ok(v) = serde_json::from_slice::<Value>(&bytes) {
                            return Some(v);
                        }
                        // Malformed body: drop the frame, keep going.
                        continue;
                    }
                    LengthFramed::Incomplete => return None,
                    LengthFramed::BadHeader => {
                        // Unparseable header line: discard it as a junk line.
                        self.drop_first_line();
                        continue;
                    }
                }
            }

            // Newline-delimited extraction.
            let nl = self.buf.iter().position(|b| *b == b'\n')?;
            let line: Vec<u8> = self.buf.drain(..=nl).collect();
            let trimmed = trim_line(&line);
            if trimmed.is_empty() {
                continue;
            }
            if let Ok(v) = serde_json::from_slice::<Value>(trimmed) {
                return Some(v);
            }
            // Non-JSON line (stray diagnostic on stdout): skip it.
        }
    }

    fn take_length_prefixed(&mut self) -> LengthFramed {
        let Some(header_end) = find_header_terminator(&self.buf) else {
            return LengthFramed::Incomplete;
        };
        let (terminator_at, terminator_len) = header_end;
        let header = &self.buf[..terminator_at];
        let Some(len) = parse_content_length(header) else {
            return LengthFramed::BadHeader;
        };
        let body_start = terminator_at + terminator_len;
        if self.buf.len() < body_start + len {
            return LengthFramed::Incomplete;
        }
        let body = self.buf[body_start..body_start + len].to_vec();
        self.buf.drain(..body_start + len);
        LengthFramed::Complete(body)
    }

    fn drop_first_line(&mut self) {
        match self.buf.iter().position(|b| *b == b'\n') {
            Some(nl) => {
                self.buf.drain(..=nl);
            }
            None => self.buf.clear(),
        }
    }
}

enum LengthFramed {
    Complete(Vec<u8>),
    Incomplete,
    BadHeader,
}

fn starts_with_content_length(buf: &[u8]) -> bool {
    if buf.len() < CONTENT_LENGTH_PREFIX.len() {
        // A short prefix of the header might still be arriving; treat it as
        // length-prefixed only once enough bytes exist to tell.
        return CONTENT_LENGTH_PREFIX.starts_with(&ascii_lower(buf));
    }
    ascii_lower(&buf[..CONTENT_LENGTH_PREFIX.len()]) == CONTENT_LENGTH_PREFIX
}

fn ascii_lower(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().map(u8::to_ascii_lowercase).collect()
}

/// Find the header/body boundary: `\r\n\r\n` or bare `\n\n` both accepted.
fn find_header_terminator(buf: &[u8]) -> Option<(usize, usize)> {
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n");
    let lf = buf.windows(2).position(|w| w == b"\n\n");
    match (crlf, lf) {
        (Some(a), Some(b)) if b + 1 < a => Some((b, 2)),
        (Some(a), _) => Some((a, 4)),
        (None, Some(b)) => Some((b, 2)),
        (None, None) => None,
    }
}

fn parse_content_length(header: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(header).ok()?;
    for line in text.lines() {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            return value.trim().parse::<usize>().ok();
        }
    }
    None
}

fn trim_line(line: &[u8]) -> &[u8] {
    let mut start = 0;
    let mut end = line.len();
    while start < end && (line[start] as char).is_whitespace() {
        start += 1;
    }
    while end > start && (line[end - 1] as char).is_whitespace() {
        end -= 1;
    }
    &line[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn line_delimited_frames_round_trip() {
        let mut fb = FrameBuffer::new(1024);
        fb.extend(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n");
        let v = fb.next_frame().expect("one frame");
        assert_eq!(v["id"], json!(1));
        assert!(fb.next_frame().is_none());
    }

    #[test]
    fn partial_line_waits_for_more_bytes() {
        let mut fb = FrameBuffer::new(1024);
        fb.extend(b"{\"jsonrpc\":\"2.0\",\"id\"");
        assert!(fb.next_frame().is_none());
        fb.extend(b":7,\"result\":null}\n");
        assert_eq!(fb.next_frame().expect("frame")["id"], json!(7));
    }

    #[test]
    fn content_length_frame_is_extracted() {
        let body = r#"{"jsonrpc":"2.0","id":3,"result":{"ok":true}}"#;
        let mut fb = FrameBuffer::new(1024);
        fb.extend(format!("Content-Length: {}\r\n\r\n{}", body.len(), body).as_bytes());
        assert_eq!(fb.next_frame().expect("frame")["id"], json!(3));
        assert!(fb.is_empty());
    }

    #[test]
    fn lf_only_header_terminator_accepted() {
        let body = r#"{"jsonrpc":"2.0","id":4,"result":null}"#;
        let mut fb = FrameBuffer::new(1024);
        fb.extend(format!("Content-Length: {}\n\n{}", body.len(), body).as_bytes());
        assert_eq!(fb.next_frame().expect("frame")["id"], json!(4));
    }

    #[test]
    fn framing_detection_is_per_buffer_prefix() {
        // A length-prefixed frame followed immediately by a line-delimited one
        // must yield both: detection never commits globally.
        let first = r#"{"jsonrpc":"2.0","id":"1","result":{}}"#;
        let second = r#"{"jsonrpc":"2.0","id":2,"result":{}}"#;
        let mut fb = FrameBuffer::new(4096);
        fb.extend(format!("Content-Length: {}\r\n\r\n{}", first.len(), first).as_bytes());
        fb.extend(second.as_bytes());
        fb.extend(b"\n");

        let a = fb.next_frame().expect("length-prefixed frame");
        assert_eq!(a["id"], json!("1"));
        let b = fb.next_frame().expect("line-delimited frame");
        assert_eq!(b["id"], json!(2));
        assert!(fb.next_frame().is_none());
    }

    #[test]
    fn incomplete_content_length_body_waits() {
        let body = r#"{"jsonrpc":"2.0","id":5,"result":null}"#;
        let framed = format!("Content-Length: {}\r\n\r\n{}", body.len(), body);
        let (head, tail) = framed.as_bytes().split_at(framed.len() - 5);
        let mut fb = FrameBuffer::new(1024);
        fb.extend(head);
        assert!(fb.next_frame().is_none());
        fb.extend(tail);
        assert_eq!(fb.next_frame().expect("frame")["id"], json!(5));
    }

    #[test]
    fn junk_lines_are_skipped() {
        let mut fb = FrameBuffer::new(1024);
        fb.extend(b"npm WARN something\n{\"jsonrpc\":\"2.0\",\"id\":9,\"result\":null}\n");
        assert_eq!(fb.next_frame().expect("frame")["id"], json!(9));
    }

    #[test]
    fn overflow_trims_oldest_bytes() {
        let mut fb = FrameBuffer::new(16);
        assert!(!fb.extend(b"0123456789"));
        assert!(fb.extend(b"abcdefghij"));
        assert_eq!(fb.len(), 16);
        // Oldest bytes went first.
        fb.clear();
        assert!(fb.is_empty());
    }

    #[test]
    fn encode_frame_shapes() {
        let msg = json!({"jsonrpc": "2.0", "id": 1, "method": "ping"});
        let line = encode_frame(WireFraming::LineDelimited, &msg);
        assert_eq!(*line.last().expect("byte"), b'\n');

        let framed = encode_frame(WireFraming::ContentLength, &msg);
        let text = String::from_utf8(framed).expect("utf8");
        let body = msg.to_string();
        assert_eq!(text, format!("Content-Length: {}\r\n\r\n{}", body.len(), body));
    }

    #[test]
    fn response_id_accepts_string_and_number() {
        let r: Response =
            serde_json::from_value(json!({"id": "12", "result": null})).expect("parse");
        assert_eq!(r.numeric_id(), Some(12));
        let r: Response = serde_json::from_value(json!({"id": 12, "result": null})).expect("parse");
        assert_eq!(r.numeric_id(), Some(12));
        let r: Response = serde_json::from_value(json!({"result": null})).expect("parse");
        assert_eq!(r.numeric_id(), None);
    }
}
