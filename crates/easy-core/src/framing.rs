//! Message framing for stream transports.
//!
//! Two dialects share one rolling buffer:
//!
//! - **Length-prefixed**: `Content-Length: <n>\r\n\r\n` followed by exactly `n`
//!   bytes of JSON (the LSP base protocol).
//! - **Newline-delimited**: one JSON document per line.
//!
//! The dialect is detected per message. Once the first buffered line is
//! complete, a line starting with `Content-` and terminated by CRLF opens a
//! header block; anything else is treated as a newline-delimited line. Child
//! processes routinely print diagnostics on stdout, so newline-mode lines
//! that do not start with `{` or `[` are dropped, and so are JSON-looking
//! lines that fail to parse.
//!
//! Outbound messages always use the length-prefixed form.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::protocol::{JsonRpcError, McpResponse};

/// Header blocks larger than this without a terminator are rejected
pub const MAX_HEADER_BYTES: usize = 8 * 1024;

/// Newline-mode lines longer than this without a terminator are rejected
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Framing failures. Each one ends the message being decoded.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrameError {
    #[error("missing Content-Length header")]
    MissingContentLength,

    #[error("invalid Content-Length value: {0:?}")]
    InvalidContentLength(String),

    #[error("header block exceeds 8192 bytes without a terminator")]
    HeaderTooLarge,

    #[error("line exceeds {} bytes without a newline", MAX_LINE_BYTES)]
    LineTooLong,

    #[error("invalid JSON payload: {0}")]
    InvalidJson(String),
}

impl FrameError {
    /// Parse-error envelope (id = null) reported back to the peer
    pub fn to_response(&self) -> McpResponse {
        McpResponse::error(Value::Null, JsonRpcError::parse_error(self.to_string()))
    }
}

/// Wire dialect of a decoded message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    LengthPrefixed,
    NewlineDelimited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    AwaitingHeaders,
    AwaitingBody { expected: usize },
}

/// Incremental decoder over a rolling byte buffer
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    state: DecodeState,
    last_dialect: Option<Dialect>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            state: DecodeState::AwaitingHeaders,
            last_dialect: None,
        }
    }

    /// Append raw bytes read from the stream
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of bytes retained for the next parse cycle
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Dialect of the most recently decoded message
    pub fn last_dialect(&self) -> Option<Dialect> {
        self.last_dialect
    }

    /// Decode every complete message currently buffered, in order
    pub fn drain(&mut self) -> Vec<Result<Value, FrameError>> {
        let mut out = Vec::new();
        while let Some(frame) = self.next_frame() {
            out.push(frame);
        }
        out
    }

    /// Decode the next complete message, or `None` if more bytes are needed
    pub fn next_frame(&mut self) -> Option<Result<Value, FrameError>> {
        loop {
            match self.state {
                DecodeState::AwaitingBody { expected } => {
                    if self.buffer.len() < expected {
                        return None;
                    }
                    let payload: Vec<u8> = self.buffer.drain(..expected).collect();
                    self.state = DecodeState::AwaitingHeaders;
                    self.last_dialect = Some(Dialect::LengthPrefixed);
                    return Some(
                        serde_json::from_slice(&payload)
                            .map_err(|e| FrameError::InvalidJson(e.to_string())),
                    );
                }
                DecodeState::AwaitingHeaders => {
                    self.skip_blank_prefix();
                    if self.buffer.is_empty() {
                        return None;
                    }

                    if self.starts_header_block() {
                        let Some(end) = find(&self.buffer, HEADER_TERMINATOR) else {
                            if self.buffer.len() > MAX_HEADER_BYTES {
                                self.buffer.clear();
                                return Some(Err(FrameError::HeaderTooLarge));
                            }
                            return None;
                        };

                        let headers = String::from_utf8_lossy(&self.buffer[..end]).into_owned();
                        self.buffer.drain(..end + HEADER_TERMINATOR.len());

                        match content_length(&headers) {
                            Ok(expected) => {
                                self.state = DecodeState::AwaitingBody { expected };
                            }
                            Err(e) => {
                                self.buffer.clear();
                                return Some(Err(e));
                            }
                        }
                        continue;
                    }

                    let Some(newline) = find(&self.buffer, b"\n") else {
                        if self.buffer.len() > MAX_LINE_BYTES {
                            self.buffer.clear();
                            return Some(Err(FrameError::LineTooLong));
                        }
                        return None;
                    };
                    let line: Vec<u8> = self.buffer.drain(..=newline).collect();
                    let text = String::from_utf8_lossy(&line);
                    let trimmed = text.trim();

                    if trimmed.starts_with('{') || trimmed.starts_with('[') {
                        match serde_json::from_str(trimmed) {
                            Ok(value) => {
                                self.last_dialect = Some(Dialect::NewlineDelimited);
                                return Some(Ok(value));
                            }
                            Err(e) => {
                                debug!(error = %e, "Dropping malformed JSON line");
                            }
                        }
                    } else if !trimmed.is_empty() {
                        debug!(line = %trimmed, "Dropping non-JSON line");
                    }
                }
            }
        }
    }

    fn skip_blank_prefix(&mut self) {
        let skip = self
            .buffer
            .iter()
            .take_while(|b| matches!(b, b' ' | b'\t' | b'\r' | b'\n'))
            .count();
        if skip > 0 {
            self.buffer.drain(..skip);
        }
    }

    /// The first buffered line is complete, CRLF-terminated and names a
    /// `Content-*` header.
    fn starts_header_block(&self) -> bool {
        let Some(newline) = find(&self.buffer, b"\n") else {
            return false;
        };
        if newline == 0 || self.buffer[newline - 1] != b'\r' {
            return false;
        }
        let line = &self.buffer[..newline - 1];
        line.len() > 8 && line[..8].eq_ignore_ascii_case(b"content-") && line.contains(&b':')
    }
}

fn content_length(headers: &str) -> Result<usize, FrameError> {
    for line in headers.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            let value = value.trim();
            return value
                .parse::<usize>()
                .map_err(|_| FrameError::InvalidContentLength(value.to_string()));
        }
    }
    Err(FrameError::MissingContentLength)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Serialize a message into its `(header, payload)` pair
pub fn encode_frame<T: Serialize>(message: &T) -> serde_json::Result<(Vec<u8>, Vec<u8>)> {
    let payload = serde_json::to_vec(message)?;
    let header = format!("Content-Length: {}\r\n\r\n", payload.len()).into_bytes();
    Ok((header, payload))
}

/// Write one length-prefixed frame: header first, then payload, then flush
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> crate::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let (header, payload) = encode_frame(message)?;
    writer.write_all(&header).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn framed(value: &Value) -> Vec<u8> {
        let (mut header, payload) = encode_frame(value).unwrap();
        header.extend_from_slice(&payload);
        header
    }

    #[test]
    fn test_header_format() {
        let (header, payload) = encode_frame(&json!({"jsonrpc": "2.0"})).unwrap();
        let header = String::from_utf8(header).unwrap();
        assert_eq!(header, format!("Content-Length: {}\r\n\r\n", payload.len()));
    }

    #[test]
    fn test_single_length_prefixed_message() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"Content-Length: 2\r\n\r\n{}");
        assert_eq!(decoder.next_frame(), Some(Ok(json!({}))));
        assert_eq!(decoder.next_frame(), None);
        assert_eq!(decoder.last_dialect(), Some(Dialect::LengthPrefixed));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_round_trip_across_chunk_sizes() {
        let messages = vec![
            json!({}),
            json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}),
            json!({"jsonrpc": "2.0", "id": 2, "result": {"text": "é ü 漢字".repeat(300)}}),
        ];
        let mut stream = Vec::new();
        for m in &messages {
            stream.extend(framed(m));
        }

        for chunk_size in [1, 2, 3, 7, 64, 1000, stream.len()] {
            let mut decoder = FrameDecoder::new();
            let mut decoded = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                decoder.push(chunk);
                decoded.extend(decoder.drain());
            }
            let decoded: Vec<Value> = decoded.into_iter().map(|r| r.unwrap()).collect();
            assert_eq!(decoded, messages, "chunk size {}", chunk_size);
            assert_eq!(decoder.buffered(), 0);
        }
    }

    #[test]
    fn test_two_messages_in_one_chunk_drain_in_order() {
        let mut chunk = framed(&json!({"id": 1}));
        chunk.extend(framed(&json!({"id": 2})));

        let mut decoder = FrameDecoder::new();
        decoder.push(&chunk);
        let frames = decoder.drain();
        assert_eq!(frames, vec![Ok(json!({"id": 1})), Ok(json!({"id": 2}))]);
    }

    #[test]
    fn test_body_waits_for_full_length() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"Content-Length: 13\r\n\r\n{\"id\":");
        assert_eq!(decoder.next_frame(), None);
        decoder.push(b"12345}");
        assert_eq!(decoder.next_frame(), Some(Ok(json!({"id": 12345}))));
    }

    #[test]
    fn test_leftover_bytes_are_retained() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"Content-Length: 2\r\n\r\n{}Content-Le");
        assert_eq!(decoder.next_frame(), Some(Ok(json!({}))));
        assert_eq!(decoder.next_frame(), None);
        assert_eq!(decoder.buffered(), "Content-Le".len());
        decoder.push(b"ngth: 4\r\n\r\n[1] ");
        assert_eq!(decoder.next_frame(), Some(Ok(json!([1]))));
    }

    #[test]
    fn test_headers_are_case_insensitive() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"content-type: application/json\r\nCONTENT-LENGTH: 2\r\n\r\n{}");
        assert_eq!(decoder.next_frame(), Some(Ok(json!({}))));
    }

    #[test]
    fn test_missing_content_length_discards_buffer() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"Content-Type: application/json\r\n\r\n{}trailing");
        assert_eq!(
            decoder.next_frame(),
            Some(Err(FrameError::MissingContentLength))
        );
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_invalid_content_length() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"Content-Length: -4\r\n\r\n{}");
        assert_eq!(
            decoder.next_frame(),
            Some(Err(FrameError::InvalidContentLength("-4".into())))
        );
        let response = FrameError::InvalidContentLength("-4".into()).to_response();
        assert_eq!(response.id, Value::Null);
        assert_eq!(response.error.unwrap().code, -32700);
    }

    #[test]
    fn test_newline_delimited_messages() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"{\"id\":1}\n{\"id\":2}\r\n{\"id\":");
        assert_eq!(decoder.next_frame(), Some(Ok(json!({"id": 1}))));
        assert_eq!(decoder.next_frame(), Some(Ok(json!({"id": 2}))));
        assert_eq!(decoder.next_frame(), None);
        assert_eq!(decoder.last_dialect(), Some(Dialect::NewlineDelimited));
        decoder.push(b"3}\n");
        assert_eq!(decoder.next_frame(), Some(Ok(json!({"id": 3}))));
    }

    #[test]
    fn test_diagnostic_lines_are_dropped() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"Server listening on stdio\nWarning: deprecated flag\n{broken json\n{\"ok\":true}\n");
        assert_eq!(decoder.drain(), vec![Ok(json!({"ok": true}))]);
    }

    #[test]
    fn test_dialects_can_interleave() {
        let mut stream = b"booting...\n".to_vec();
        stream.extend(framed(&json!({"id": 1})));
        stream.extend(b"{\"id\":2}\n");
        stream.extend(framed(&json!({"id": 3})));

        let mut decoder = FrameDecoder::new();
        decoder.push(&stream);
        let ids: Vec<Value> = decoder
            .drain()
            .into_iter()
            .map(|r| r.unwrap()["id"].clone())
            .collect();
        assert_eq!(ids, vec![json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn test_oversized_header_block() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"Content-Length: 10\r\n");
        decoder.push(&vec![b'x'; MAX_HEADER_BYTES + 1]);
        assert_eq!(decoder.next_frame(), Some(Err(FrameError::HeaderTooLarge)));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_unterminated_line_is_capped() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"{\"jsonrpc\":\"2.0\",\"params\":\"");
        decoder.push(&vec![b'a'; MAX_LINE_BYTES]);
        assert_eq!(decoder.next_frame(), Some(Err(FrameError::LineTooLong)));
        assert_eq!(decoder.buffered(), 0);
        assert_eq!(FrameError::LineTooLong.to_response().error.unwrap().code, -32700);

        // The stream recovers on the next line
        decoder.push(b"{\"jsonrpc\":\"2.0\",\"id\":7}\n");
        assert_eq!(decoder.next_frame().unwrap().unwrap()["id"], 7);
    }

    #[tokio::test]
    async fn test_write_frame_then_decode() {
        let mut out: Vec<u8> = Vec::new();
        let message = json!({"jsonrpc": "2.0", "method": "notifications/progress"});
        write_frame(&mut out, &message).await.unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.push(&out);
        assert_eq!(decoder.next_frame(), Some(Ok(message)));
    }
}
