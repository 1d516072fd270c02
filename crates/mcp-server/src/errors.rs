use mcp_core::protocol::{ErrorCode, ErrorData};
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Sync + Send>;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Service error: {0}")]
    Service(String),
}

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),
}

impl From<RouterError> for ErrorData {
    fn from(err: RouterError) -> Self {
        let code = match err {
            RouterError::MethodNotFound(_) => ErrorCode::METHOD_NOT_FOUND,
            RouterError::InvalidParams(_) | RouterError::ToolNotFound(_) => {
                ErrorCode::INVALID_PARAMS
            }
            RouterError::Internal(_) => ErrorCode::INTERNAL_ERROR,
        };
        ErrorData {
            code,
            message: err.to_string().into(),
            data: None,
        }
    }
}

/// Failures of server-initiated requests and notifications sent to the client.
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("The client connection is closed")]
    Closed,

    #[error("Client returned an error: code={code}, message={message}")]
    Rpc { code: i32, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unexpected reply from client: {0}")]
    UnexpectedReply(String),
}
