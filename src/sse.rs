//! Minimal server-sent-events framing.
//!
//! Only the `data:` field is interpreted. Frames are separated by a blank
//! line; comment lines (leading `:`) and other fields are skipped.

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;

pub const EVENT_STREAM: &str = "text/event-stream";

// `data: <json>\n\n`
pub fn encode_frame<T: Serialize>(payload: &T) -> Result<Bytes, serde_json::Error> {
    let json = serde_json::to_string(payload)?;
    Ok(Bytes::from(format!("data: {json}\n\n")))
}

/// Longest line the decoder will buffer while waiting for its newline.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SseError {
    #[error("event stream line exceeds 1048576 bytes")]
    LineTooLong,
}

/// Incremental decoder for a byte stream that may split frames (and UTF-8
/// sequences) across reads.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
    // bytes of `pending` already known to hold no newline
    scanned: usize,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one network read; returns the data payloads of every frame it
    /// completed, in order.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>, SseError> {
        self.pending.extend_from_slice(bytes);

        let mut frames = Vec::new();
        let mut start = 0;
        let mut cursor = self.scanned;
        while let Some(offset) = self.pending[cursor..].iter().position(|b| *b == b'\n') {
            let end = cursor + offset;
            let mut line = &self.pending[start..end];
            if let [rest @ .., b'\r'] = line {
                line = rest;
            }
            let line = String::from_utf8_lossy(line).into_owned();
            if let Some(frame) = self.feed_line(&line) {
                frames.push(frame);
            }
            start = end + 1;
            cursor = start;
        }

        self.pending.drain(..start);
        self.scanned = self.pending.len();

        if self.pending.len() > MAX_LINE_BYTES {
            self.pending.clear();
            self.scanned = 0;
            return Err(SseError::LineTooLong);
        }
        Ok(frames)
    }

    /// Flush a final frame that was not followed by a blank line.
    pub fn finish(&mut self) -> Option<String> {
        self.scanned = 0;
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            let line = String::from_utf8_lossy(&rest).into_owned();
            if let Some(frame) = self.feed_line(line.trim_end_matches('\r')) {
                return Some(frame);
            }
        }
        self.take_frame()
    }

    fn feed_line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            return self.take_frame();
        }
        if let Some(value) = line.strip_prefix("data:") {
            self.data
                .push(value.strip_prefix(' ').unwrap_or(value).to_string());
        }
        None
    }

    fn take_frame(&mut self) -> Option<String> {
        if self.data.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.data).join("\n"))
    }
}
