use std::{
    pin::Pin,
    task::{Context, Poll},
};

use futures::Stream;
use mcp_core::protocol::JsonRpcMessage;
use pin_project::pin_project;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};

use crate::errors::TransportError;

/// A transport layer that handles line-delimited JSON-RPC messages over a
/// pair of byte streams (stdin/stdout for a server launched by its client).
pub struct ByteTransport<R, W> {
    reader: R,
    writer: W,
}

impl<R, W> ByteTransport<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }

    /// Separate the incoming message stream from the outgoing sink so reads
    /// and writes can proceed independently.
    pub fn split(self) -> (MessageStream<R>, MessageSink<W>) {
        (
            MessageStream::new(self.reader),
            MessageSink {
                writer: self.writer,
            },
        )
    }
}

/// Incoming side of a [`ByteTransport`]: one JSON-RPC message per line.
#[pin_project]
pub struct MessageStream<R> {
    // Lines keeps partially read data across polls, so a message that
    // arrives in several chunks is still assembled into one line
    #[pin]
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead> MessageStream<R> {
    fn new(reader: R) -> Self {
        Self {
            // Default BufReader capacity is 8 * 1024, increase this to 2MB
            // so very large calls are read without repeated reallocation
            lines: BufReader::with_capacity(2 * 1024 * 1024, reader).lines(),
        }
    }
}

fn parse_line(line: &str) -> Result<JsonRpcMessage, TransportError> {
    let value: serde_json::Value = serde_json::from_str(line)?;
    let Some(obj) = value.as_object() else {
        return Err(TransportError::InvalidMessage(
            "Message must be a JSON object".into(),
        ));
    };

    if obj.get("jsonrpc").and_then(|v| v.as_str()) != Some("2.0") {
        return Err(TransportError::InvalidMessage(
            "Missing or invalid jsonrpc version".into(),
        ));
    }

    Ok(serde_json::from_value::<JsonRpcMessage>(value)?)
}

impl<R> Stream for MessageStream<R>
where
    R: AsyncRead + Unpin,
{
    type Item = Result<JsonRpcMessage, TransportError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            return match this.lines.as_mut().poll_next_line(cx) {
                Poll::Ready(Ok(None)) => Poll::Ready(None), // EOF
                Poll::Ready(Ok(Some(line))) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    // Log incoming message here before serde conversion to
                    // track incomplete chunks which are not valid JSON
                    tracing::debug!(json = %line, "incoming message");
                    Poll::Ready(Some(parse_line(&line)))
                }
                Poll::Ready(Err(e)) => Poll::Ready(Some(Err(TransportError::Io(e)))),
                Poll::Pending => Poll::Pending,
            };
        }
    }
}

/// Outgoing side of a [`ByteTransport`].
pub struct MessageSink<W> {
    writer: W,
}

impl<W> MessageSink<W>
where
    W: AsyncWrite + Unpin,
{
    pub async fn write_message(&mut self, msg: &JsonRpcMessage) -> Result<(), TransportError> {
        let json = serde_json::to_string(msg)?;
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }
}
