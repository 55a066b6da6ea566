//! Incremental Server-Sent Events decoder
//!
//! Only `data:` lines matter: each blank-line-delimited event yields its data
//! lines joined by `\n`. Comments and other fields are ignored.

/// Decoder that accepts arbitrary byte chunks of an event stream
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data_lines: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning the data of every event it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(event) = self.take_event() {
                    events.push(event);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            if let Some(rest) = line.strip_prefix("data:") {
                self.data_lines
                    .push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
            }
        }

        events
    }

    /// Flush an event left unterminated at end of stream
    pub fn finish(&mut self) -> Option<String> {
        if !self.buffer.is_empty() {
            let tail = std::mem::take(&mut self.buffer);
            let mut events = self.push(&tail);
            events.extend(self.push(b"\n\n"));
            return events.pop();
        }
        self.take_event()
    }

    fn take_event(&mut self) -> Option<String> {
        if self.data_lines.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.data_lines).join("\n"))
    }
}

/// Decode a complete event-stream body
pub fn decode_sse_events(body: &str) -> Vec<String> {
    let mut decoder = SseDecoder::new();
    let mut events = decoder.push(body.as_bytes());
    events.extend(decoder.finish());
    events
}
