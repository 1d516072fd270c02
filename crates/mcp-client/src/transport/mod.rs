use async_trait::async_trait;
use mcp_core::protocol::JsonRpcMessage;
use thiserror::Error;
use tokio::sync::mpsc;

pub type BoxError = Box<dyn std::error::Error + Sync + Send>;

/// A message received from the transport, handed back to whoever is waiting on it
pub type TransportMessageRecv = JsonRpcMessage;

/// A generic error type for transport operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport was not connected or is already closed")]
    NotConnected,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unsupported message type. JsonRpcMessage can only be Request or Notification.")]
    UnsupportedMessage,

    #[error("Stdio process error: {0}")]
    StdioProcessError(String),

    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },

    #[error("Streamable HTTP error: {0}")]
    StreamableHttpError(String),

    #[error("Session error: {0}")]
    SessionError(String),
}

/// A generic asynchronous transport trait with channel-based communication
#[async_trait]
pub trait Transport {
    type Handle: TransportHandle;

    /// Start the transport and establish the underlying connection.
    /// Returns the transport handle for sending messages.
    /// The connection lives as long as its handles: once the last clone
    /// is dropped the transport shuts down.
    async fn start(&self) -> Result<Self::Handle, Error>;
}

#[async_trait]
pub trait TransportHandle: Send + Sync + Clone + 'static {
    async fn send(&self, message: JsonRpcMessage) -> Result<(), Error>;
    async fn receive(&self) -> Result<JsonRpcMessage, Error>;
}

pub async fn serialize_and_send(
    sender: &mpsc::Sender<String>,
    message: JsonRpcMessage,
) -> Result<(), Error> {
    match serde_json::to_string(&message).map_err(Error::Serialization) {
        Ok(msg) => sender.send(msg).await.map_err(|_| Error::ChannelClosed),
        Err(e) => {
            tracing::error!(error = ?e, "Error serializing message");
            Err(e)
        }
    }
}

pub mod stdio;
pub use stdio::StdioTransport;

pub mod streamable_http;
pub use streamable_http::StreamableHttpTransport;
