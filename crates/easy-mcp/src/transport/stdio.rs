//! Stdio Transport
//!
//! Reads length-prefixed (or newline-delimited) JSON-RPC from stdin and
//! writes length-prefixed frames to stdout. Logging goes to stderr so stdout
//! carries protocol bytes only.

use super::{dispatch_value, McpHandler, Transport};
use anyhow::Result;
use easy_core::{write_frame, FrameDecoder};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

const READ_CHUNK: usize = 8 * 1024;

/// Stdio transport - framed JSON-RPC on stdin/stdout
pub struct StdioTransport;

impl StdioTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Transport for StdioTransport {
    async fn serve<H: McpHandler + 'static>(self, handler: Arc<H>) -> Result<()> {
        info!("Starting MCP stdio transport");
        serve_io(handler, tokio::io::stdin(), tokio::io::stdout()).await?;
        info!("Stdio transport shutting down");
        Ok(())
    }
}

/// Serve one framed session over any reader/writer pair until the reader
/// reaches EOF and every in-flight request has been answered.
pub async fn serve_io<H, R, W>(handler: Arc<H>, mut reader: R, writer: W) -> Result<()>
where
    H: McpHandler + 'static,
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();

    // Single writer so frames never interleave
    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(message) = out_rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &message).await {
                error!(error = %e, "Failed to write frame");
                break;
            }
        }
    });

    let pump = handler.notifications().map(|mut notifications| {
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            loop {
                match notifications.recv().await {
                    Ok(note) => {
                        if out_tx.send(note.to_value()).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Stdio client missed notifications");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    });

    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut in_flight = Vec::new();

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        decoder.push(&buf[..n]);

        for frame in decoder.drain() {
            match frame {
                Ok(message) => {
                    debug!("Received frame");
                    let handler = handler.clone();
                    let out_tx = out_tx.clone();
                    in_flight.push(tokio::spawn(async move {
                        if let Some(reply) = dispatch_value(handler.as_ref(), message).await {
                            let _ = out_tx.send(reply);
                        }
                    }));
                }
                Err(e) => {
                    warn!(error = %e, "Framing error");
                    let _ = out_tx.send(e.to_response().to_value());
                }
            }
        }
        in_flight.retain(|task| !task.is_finished());
    }

    debug!(pending = in_flight.len(), "Stdin closed, finishing in-flight requests");
    for task in in_flight {
        let _ = task.await;
    }
    if let Some(pump) = pump {
        pump.abort();
    }
    drop(out_tx);
    let _ = writer_task.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{JsonRpcError, McpRequest, McpResponse};
    use easy_core::encode_frame;
    use serde_json::json;
    use tokio::io::AsyncWriteExt;

    struct Echo;

    #[async_trait::async_trait]
    impl McpHandler for Echo {
        async fn handle_request(&self, request: McpRequest) -> McpResponse {
            if request.method == "ping" {
                McpResponse::success(request.id, json!({}))
            } else {
                McpResponse::error(request.id, JsonRpcError::method_not_found(&request.method))
            }
        }
    }

    fn framed(value: &Value) -> Vec<u8> {
        let (mut header, payload) = encode_frame(value).unwrap();
        header.extend_from_slice(&payload);
        header
    }

    #[tokio::test]
    async fn test_framed_session() {
        let (mut client, server_in) = tokio::io::duplex(4096);
        let (server_out, mut client_out) = tokio::io::duplex(4096);
        let session = tokio::spawn(serve_io(Arc::new(Echo), server_in, server_out));

        let mut input = framed(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}));
        input.extend(b"{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\n");
        input.extend(b"{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"nope\"}\n");
        client.write_all(&input).await.unwrap();
        client.shutdown().await.unwrap();
        drop(client);
        session.await.unwrap().unwrap();

        let mut output = Vec::new();
        client_out.read_to_end(&mut output).await.unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.push(&output);
        let mut replies: Vec<Value> = decoder.drain().into_iter().map(|f| f.unwrap()).collect();
        replies.sort_by_key(|r| r["id"].as_i64());

        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0]["id"], 1);
        assert_eq!(replies[0]["result"], json!({}));
        assert_eq!(replies[1]["error"]["code"], -32601);
        assert!(String::from_utf8_lossy(&output).starts_with("Content-Length: "));
    }

    #[tokio::test]
    async fn test_bad_header_yields_parse_error() {
        let (mut client, server_in) = tokio::io::duplex(4096);
        let (server_out, mut client_out) = tokio::io::duplex(4096);
        let session = tokio::spawn(serve_io(Arc::new(Echo), server_in, server_out));

        client.write_all(b"Content-Length: abc\r\n\r\n{}").await.unwrap();
        client.shutdown().await.unwrap();
        drop(client);
        session.await.unwrap().unwrap();

        let mut output = Vec::new();
        client_out.read_to_end(&mut output).await.unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.push(&output);
        let reply = decoder.next_frame().unwrap().unwrap();
        assert_eq!(reply["error"]["code"], -32700);
        assert_eq!(reply["id"], Value::Null);
    }
}
