//! Incremental decoder for upstream Server-Sent Events.
//!
//! Upstream services stream `data: {"type": "...", "data": ...}` frames and
//! may finish with `data: [DONE]`. Chunks from the network can split lines
//! anywhere, so bytes are buffered until a full line is available and frames
//! are dispatched on the blank line that ends them.
//!
//! Token data is relayed as whatever JSON the upstream sent. An `error`
//! frame that does not carry `{reason}` still ends the session, as an
//! `UpstreamError` holding the raw data.

use serde::Deserialize;
use serde_json::Value;

use crate::models::invocation::{StreamEvent, StreamFailure};

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Event(StreamEvent),
    Done,
}

/// Loose envelope used when a frame does not decode as a [`StreamEvent`].
#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    data: Vec<String>,
    /// Frames that carried data we could not decode.
    skipped: u32,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skipped(&self) -> u32 {
        self.skipped
    }

    /// Feed raw bytes and return every frame they complete.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(frame) = self.push_line(line.trim_end_matches(['\n', '\r'])) {
                frames.push(frame);
            }
        }

        frames
    }

    /// Flush a trailing frame when the upstream closes without a blank line.
    pub fn finish(&mut self) -> Option<Frame> {
        if !self.buf.is_empty() {
            let rest = std::mem::take(&mut self.buf);
            let line = String::from_utf8_lossy(&rest).to_string();
            if let Some(frame) = self.push_line(line.trim_end_matches('\r')) {
                return Some(frame);
            }
        }
        self.dispatch()
    }

    fn push_line(&mut self, line: &str) -> Option<Frame> {
        if line.is_empty() {
            return self.dispatch();
        }
        // Comments / keep-alives
        if line.starts_with(':') {
            return None;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            self.data.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        }
        // `event:`, `id:` and `retry:` fields carry nothing we route on.
        None
    }

    fn dispatch(&mut self) -> Option<Frame> {
        if self.data.is_empty() {
            return None;
        }
        let payload = self.data.join("\n");
        self.data.clear();

        let payload = payload.trim();
        if payload == "[DONE]" {
            return Some(Frame::Done);
        }

        let err = match serde_json::from_str::<StreamEvent>(payload) {
            Ok(event) => return Some(Frame::Event(event)),
            Err(e) => e,
        };
        match serde_json::from_str::<Envelope>(payload) {
            Ok(env) if env.kind == "error" => Some(Frame::Event(StreamEvent::Error(
                StreamFailure::from_upstream(env.data),
            ))),
            _ => {
                self.skipped += 1;
                tracing::warn!(error = %err, "skipping undecodable upstream stream frame");
                None
            }
        }
    }
}
