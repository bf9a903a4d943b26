//! FrameDecoder — turns a chunked, line-delimited byte stream into frames.
//!
//! Two framing conventions share one stream:
//!
//! ```text
//! 2:{"type":"step_running","step":{"name":"fetch"}}   compact: <tag>:<payload>
//! e:"context deadline exceeded"                       compact error frame
//! event: error                                        SSE: event line ...
//! data: upstream unavailable                          ... paired with its data line
//! data: plain log line                                SSE data without event
//! : heartbeat                                         comment, skipped
//! retry: 3000                                         reconnect hint, skipped
//! ```
//!
//! Decoding never fails. Lines that match nothing are logged and skipped so a
//! single bad line cannot end an otherwise healthy stream.

use serde::{Deserialize, Serialize};

/// Lines longer than this are discarded instead of buffered.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// What kind of frame a line produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameTag {
    /// Compact `<c>:<payload>` line
    Char(char),
    /// SSE `event: <name>` followed by `data: <payload>`
    Event(String),
    /// SSE `data: <payload>` with no preceding event line
    Data,
}

/// One decoded unit from the streaming transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub tag: FrameTag,
    pub payload: String,
}

impl Frame {
    pub fn tagged(tag: char, payload: impl Into<String>) -> Self {
        Self {
            tag: FrameTag::Char(tag),
            payload: payload.into(),
        }
    }

    pub fn event(name: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            tag: FrameTag::Event(name.into()),
            payload: payload.into(),
        }
    }

    pub fn data(payload: impl Into<String>) -> Self {
        Self {
            tag: FrameTag::Data,
            payload: payload.into(),
        }
    }
}

/// Incremental decoder. Feed it chunks as they arrive; partial lines are
/// buffered until their newline shows up.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    pending_event: Option<String>,
    discarding: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a whole byte sequence in one go.
    pub fn decode_all(bytes: &[u8]) -> Vec<Frame> {
        let mut decoder = Self::new();
        let mut frames = decoder.push(bytes);
        frames.extend(decoder.finish());
        frames
    }

    /// Feed one chunk and return every frame completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let head = &rest[..pos];
            rest = &rest[pos + 1..];

            if self.discarding {
                self.discarding = false;
                self.buffer.clear();
                continue;
            }
            if self.buffer.len() + head.len() > MAX_LINE_BYTES {
                tracing::debug!(
                    "[FrameDecoder] Dropping line of {} bytes (limit {})",
                    self.buffer.len() + head.len(),
                    MAX_LINE_BYTES
                );
                self.buffer.clear();
                continue;
            }

            self.buffer.extend_from_slice(head);
            let line = std::mem::take(&mut self.buffer);
            self.decode_line(&line, &mut frames);
        }

        if !rest.is_empty() && !self.discarding {
            if self.buffer.len() + rest.len() > MAX_LINE_BYTES {
                tracing::debug!("[FrameDecoder] Line exceeds {} bytes, discarding", MAX_LINE_BYTES);
                self.buffer.clear();
                self.discarding = true;
            } else {
                self.buffer.extend_from_slice(rest);
            }
        }

        frames
    }

    /// Flush the trailing unterminated line at end-of-stream and reset.
    pub fn finish(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        let line = std::mem::take(&mut self.buffer);
        if !self.discarding && !line.is_empty() {
            self.decode_line(&line, &mut frames);
        }
        self.discarding = false;
        if let Some(event) = self.pending_event.take() {
            tracing::debug!("[FrameDecoder] Stream ended after 'event: {}' without data", event);
        }
        frames
    }

    fn decode_line(&mut self, raw: &[u8], out: &mut Vec<Frame>) {
        let text = String::from_utf8_lossy(raw);
        let line = text.strip_suffix('\r').unwrap_or(&text);

        if line.trim().is_empty() {
            self.drop_pending("blank line");
            return;
        }

        let bytes = line.as_bytes();
        if bytes.len() >= 2 && bytes[0].is_ascii_alphanumeric() && bytes[1] == b':' {
            self.drop_pending("compact frame");
            out.push(Frame::tagged(bytes[0] as char, &line[2..]));
            return;
        }

        if let Some(name) = field_value(line, "event") {
            self.drop_pending("another event line");
            self.pending_event = Some(name.trim().to_string());
            return;
        }

        if let Some(payload) = field_value(line, "data") {
            let frame = match self.pending_event.take() {
                Some(name) => Frame::event(name, payload),
                None => Frame::data(payload),
            };
            out.push(frame);
            return;
        }

        if line.starts_with(':') || field_value(line, "retry").is_some() {
            return;
        }

        self.drop_pending("unrecognized line");
        tracing::debug!(
            "[FrameDecoder] Skipping unrecognized line: {}",
            truncate(line, 200)
        );
    }

    fn drop_pending(&mut self, reason: &str) {
        if let Some(event) = self.pending_event.take() {
            tracing::debug!("[FrameDecoder] Dropping 'event: {}' ({} before data)", event, reason);
        }
    }
}

/// `field: value` or `field:value` → `value`.
fn field_value<'a>(line: &'a str, field: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(field)?.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max).collect();
        format!("{}...", head)
    }
}
