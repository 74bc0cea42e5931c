//! Event-stream framing.
//!
//! Network reads may split a frame anywhere, including inside a UTF-8 code
//! point, so bytes are buffered raw and only complete frames (terminated by a
//! blank line) are decoded. Whatever follows the last delimiter is carried
//! over to the next read.

use crate::events::StatusEvent;

pub const DONE_SENTINEL: &str = "[DONE]";

/// What a complete frame carried in its `data:` lines.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// No data lines (e.g. a frame holding only `retry:` or `id:`).
    Empty,
    /// Explicit end of stream.
    Done,
    Event(StatusEvent),
    /// Data that did not decode as a status event. Never fatal to the stream.
    Malformed { raw: String, error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub id: Option<String>,
    pub retry_ms: Option<u64>,
    pub payload: Payload,
}

impl Frame {
    pub fn event(&self) -> Option<&StatusEvent> {
        match &self.payload {
            Payload::Event(evt) => Some(evt),
            _ => None,
        }
    }
}

/// Splits `buffer ++ new_bytes` into complete frames plus the carry-over.
///
/// Comment-only frames (keep-alives) produce nothing.
pub fn decode(buffer: Vec<u8>, new_bytes: &[u8]) -> (Vec<Frame>, Vec<u8>) {
    let mut decoder = FrameDecoder { buffer, ..FrameDecoder::default() };
    let frames = decoder.feed(new_bytes);
    (frames, decoder.buffer)
}

/// Stateful decoder for use inside a read loop.
///
/// Remembers how far the carried-over bytes were already scanned, so a large
/// frame arriving in many small reads is scanned once.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    scanned: usize,
    line_start: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(bytes);

        let mut frames = Vec::new();
        let mut line_start = self.line_start;
        let mut consumed = 0;

        for pos in newline_positions(&self.buffer, self.scanned) {
            let line = trim_cr(&self.buffer[line_start..pos]);
            if line.is_empty() {
                if let Some(frame) = parse_frame(&self.buffer[consumed..line_start]) {
                    frames.push(frame);
                }
                consumed = pos + 1;
            }
            line_start = pos + 1;
        }

        self.buffer.drain(..consumed);
        self.scanned = self.buffer.len();
        self.line_start = line_start - consumed;
        frames
    }

    /// Bytes of the trailing partial frame still waiting for a delimiter.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Renders a status event as one frame on the wire.
pub fn encode_event(evt: &StatusEvent) -> Result<String, serde_json::Error> {
    Ok(format!("data: {}\n\n", serde_json::to_string(evt)?))
}

pub fn encode_done() -> &'static str {
    "data: [DONE]\n\n"
}

fn newline_positions(buf: &[u8], from: usize) -> impl Iterator<Item = usize> + '_ {
    buf[from..]
        .iter()
        .enumerate()
        .filter(|(_, b)| **b == b'\n')
        .map(move |(i, _)| from + i)
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn parse_frame(bytes: &[u8]) -> Option<Frame> {
    let text = String::from_utf8_lossy(bytes);

    let mut id = None;
    let mut retry_ms = None;
    let mut data: Option<String> = None;

    for line in text.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => match data.as_mut() {
                Some(buf) => {
                    buf.push('\n');
                    buf.push_str(value);
                }
                None => data = Some(value.to_string()),
            },
            "id" => id = Some(value.to_string()),
            "retry" => retry_ms = value.trim().parse().ok().or(retry_ms),
            _ => {}
        }
    }

    let payload = match data {
        None => Payload::Empty,
        Some(raw) if raw.trim() == DONE_SENTINEL => Payload::Done,
        Some(raw) => match serde_json::from_str::<StatusEvent>(&raw) {
            Ok(evt) => Payload::Event(evt),
            Err(e) => Payload::Malformed { raw, error: e.to_string() },
        },
    };

    if payload == Payload::Empty && id.is_none() && retry_ms.is_none() {
        return None;
    }
    Some(Frame { id, retry_ms, payload })
}
