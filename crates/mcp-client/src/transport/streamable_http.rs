use crate::transport::Error;
use async_trait::async_trait;
use mcp_core::protocol::{
    CancelledParams, ErrorCode, ErrorData, JsonObject, JsonRpcError, JsonRpcMessage,
    JsonRpcVersion2_0, RequestId, METHOD_CANCELLED,
};
use reqwest::Client as HttpClient;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::Duration;
use tracing::{debug, error, warn};
use url::Url;

use super::{serialize_and_send, Transport, TransportHandle};

// Only the connection phase is bounded, a tool call may legitimately run for minutes
const HTTP_CONNECT_TIMEOUT_SECS: u64 = 30;
const MCP_PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";
const MCP_SESSION_ID_HEADER: &str = "Mcp-Session-Id";
const MCP_PROTOCOL_VERSION: &str = "2025-03-26";

fn build_http_client() -> Result<HttpClient, Error> {
    HttpClient::builder()
        .connect_timeout(Duration::from_secs(HTTP_CONNECT_TIMEOUT_SECS))
        .build()
        .map_err(|e| Error::StreamableHttpError(format!("Failed to build HTTP client: {}", e)))
}

/// The Streamable HTTP transport actor that handles:
/// - HTTP POST requests to send messages to the server, one task per message
/// - Optional streaming responses for receiving multiple responses and server-initiated messages
/// - Session management with session IDs
///
/// A `notifications/cancelled` from the client aborts the POST still
/// waiting on the named request before it is forwarded.
pub struct StreamableHttpActor {
    /// Receives messages (requests/notifications) from the handle
    receiver: mpsc::Receiver<String>,
    poster: Poster,
}

/// Everything one POST needs, cloned into each request task.
#[derive(Clone)]
struct Poster {
    /// Sends messages (responses) back to the handle
    sender: mpsc::Sender<JsonRpcMessage>,
    /// MCP endpoint URL
    mcp_endpoint: String,
    /// HTTP client for sending requests
    http_client: HttpClient,
    /// Optional session ID for stateful connections
    session_id: Arc<RwLock<Option<String>>>,
}

impl StreamableHttpActor {
    pub fn new(
        receiver: mpsc::Receiver<String>,
        sender: mpsc::Sender<JsonRpcMessage>,
        mcp_endpoint: String,
        http_client: HttpClient,
    ) -> Self {
        Self {
            receiver,
            poster: Poster {
                sender,
                mcp_endpoint,
                http_client,
                session_id: Arc::new(RwLock::new(None)),
            },
        }
    }

    /// Main entry point for the actor. Outstanding POSTs are aborted when
    /// the last handle goes away.
    pub async fn run(mut self) {
        let mut tasks = JoinSet::new();
        let mut in_flight: HashMap<String, AbortHandle> = HashMap::new();

        loop {
            tokio::select! {
                message = self.receiver.recv() => {
                    let Some(message_str) = message else { break };
                    in_flight.retain(|_, task| !task.is_finished());
                    self.dispatch(message_str, &mut tasks, &mut in_flight);
                }
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        debug!("StreamableHttpActor shut down");
    }

    fn dispatch(
        &self,
        message_str: String,
        tasks: &mut JoinSet<()>,
        in_flight: &mut HashMap<String, AbortHandle>,
    ) {
        let parsed_message: JsonRpcMessage = match serde_json::from_str(&message_str) {
            Ok(message) => message,
            Err(e) => {
                error!("Dropping unserializable outgoing message: {}", e);
                return;
            }
        };

        let request_id = match &parsed_message {
            JsonRpcMessage::Request(request) => Some(request.id.clone()),
            JsonRpcMessage::Notification(notification)
                if notification.notification.method == METHOD_CANCELLED =>
            {
                if let Some(id) = cancelled_request(&notification.notification.params) {
                    if let Some(task) = in_flight.remove(&id) {
                        debug!("Aborting POST for cancelled request {}", id);
                        task.abort();
                    }
                }
                None
            }
            _ => None,
        };

        let poster = self.poster.clone();
        let key = request_id.as_ref().map(|id| id.to_string());
        let task = tasks.spawn(async move {
            if let Err(e) = poster.handle_outgoing_message(message_str, request_id).await {
                error!("Error handling outgoing message: {}", e);
            }
        });
        if let Some(key) = key {
            in_flight.insert(key, task);
        }
    }
}

fn cancelled_request(params: &JsonObject) -> Option<String> {
    let params: CancelledParams =
        serde_json::from_value(serde_json::Value::Object(params.clone())).ok()?;
    Some(params.request_id.to_string())
}

impl Poster {
    /// Handle an outgoing message by sending it via HTTP POST
    async fn handle_outgoing_message(
        &self,
        message_str: String,
        request_id: Option<RequestId>,
    ) -> Result<(), Error> {
        debug!("Sending message to MCP endpoint: {}", message_str);

        match self
            .send_request(&message_str, request_id.is_some())
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                // Whoever waits on this request must hear about the failure,
                // otherwise the call would hang with nothing left to answer it
                if let Some(id) = request_id {
                    let failure = JsonRpcMessage::Error(JsonRpcError {
                        jsonrpc: JsonRpcVersion2_0,
                        id,
                        error: ErrorData {
                            code: ErrorCode::INTERNAL_ERROR,
                            message: e.to_string().into(),
                            data: None,
                        },
                    });
                    let _ = self.sender.send(failure).await;
                }
                Err(e)
            }
        }
    }

    /// Send an HTTP request to the MCP endpoint
    async fn send_request(&self, message_str: &str, expects_response: bool) -> Result<(), Error> {
        let mut request = self
            .http_client
            .post(&self.mcp_endpoint)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .header(MCP_PROTOCOL_VERSION_HEADER, MCP_PROTOCOL_VERSION)
            .body(message_str.to_string());

        if let Some(session_id) = self.session_id.read().await.as_ref() {
            request = request.header(MCP_SESSION_ID_HEADER, session_id);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::StreamableHttpError(format!("HTTP request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            if status.as_u16() == 404 {
                // Session not found - clear our session ID
                *self.session_id.write().await = None;
                return Err(Error::SessionError(
                    "Session expired or not found".to_string(),
                ));
            }
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(Error::HttpError {
                status: status.as_u16(),
                message: error_text,
            });
        }

        if let Some(session_id_header) = response.headers().get(MCP_SESSION_ID_HEADER) {
            if let Ok(session_id) = session_id_header.to_str() {
                debug!("Received session ID: {}", session_id);
                *self.session_id.write().await = Some(session_id.to_string());
            }
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|h| h.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.starts_with("text/event-stream") {
            if expects_response {
                self.handle_streaming_response(response).await?;
            }
        } else if content_type.starts_with("application/json") || expects_response {
            let response_text = response.text().await.map_err(|e| {
                Error::StreamableHttpError(format!("Failed to read response: {}", e))
            })?;

            if !response_text.is_empty() {
                let json_message: JsonRpcMessage =
                    serde_json::from_str(&response_text).map_err(Error::Serialization)?;

                let _ = self.sender.send(json_message).await;
            } else if expects_response {
                return Err(Error::StreamableHttpError(
                    "Empty response body for a request".to_string(),
                ));
            }
        }
        // For notifications and responses, we get 202 Accepted with no body

        Ok(())
    }

    /// Handle a POST answered with `text/event-stream`: the server streams
    /// one or more JSON-RPC messages back as server-sent events.
    async fn handle_streaming_response(&self, response: reqwest::Response) -> Result<(), Error> {
        use futures::StreamExt;
        use tokio::io::AsyncBufReadExt;
        use tokio_util::io::StreamReader;

        let stream = response
            .bytes_stream()
            .map(|result| result.map_err(std::io::Error::other));
        let reader = StreamReader::new(stream);
        let mut lines = tokio::io::BufReader::new(reader).lines();

        let mut event_data = String::new();

        while let Ok(Some(line)) = lines.next_line().await {
            if line.is_empty() {
                if !event_data.is_empty() {
                    match serde_json::from_str::<JsonRpcMessage>(&event_data) {
                        Ok(message) => {
                            debug!("Received streaming HTTP response message: {:?}", message);
                            let _ = self.sender.send(message).await;
                        }
                        Err(err) => {
                            warn!("Failed to parse streaming HTTP response message: {}", err);
                        }
                    }
                }
                event_data.clear();
            } else if let Some(field_data) = line
                .strip_prefix("data: ")
                .or_else(|| line.strip_prefix("data:"))
            {
                if !event_data.is_empty() {
                    event_data.push('\n');
                }
                event_data.push_str(field_data);
            }
            // event/id/retry fields carry nothing we route on
        }

        // a stream that ends without a trailing blank line still carries its last event
        if !event_data.is_empty() {
            match serde_json::from_str::<JsonRpcMessage>(&event_data) {
                Ok(message) => {
                    let _ = self.sender.send(message).await;
                }
                Err(err) => warn!("Failed to parse trailing streaming message: {}", err),
            }
        }

        Ok(())
    }
}

#[derive(Clone)]
pub struct StreamableHttpTransportHandle {
    sender: mpsc::Sender<String>,
    receiver: Arc<Mutex<mpsc::Receiver<JsonRpcMessage>>>,
}

#[async_trait::async_trait]
impl TransportHandle for StreamableHttpTransportHandle {
    async fn send(&self, message: JsonRpcMessage) -> Result<(), Error> {
        serialize_and_send(&self.sender, message).await
    }

    async fn receive(&self) -> Result<JsonRpcMessage, Error> {
        let mut receiver = self.receiver.lock().await;
        receiver.recv().await.ok_or(Error::ChannelClosed)
    }
}

/// Connects to a remotely hosted provider over MCP streamable HTTP.
#[derive(Clone)]
pub struct StreamableHttpTransport {
    mcp_endpoint: String,
}

impl StreamableHttpTransport {
    pub fn new<S: Into<String>>(mcp_endpoint: S) -> Self {
        Self {
            mcp_endpoint: mcp_endpoint.into(),
        }
    }

    /// Validate that the URL is a valid MCP endpoint
    pub fn validate_endpoint(endpoint: &str) -> Result<(), Error> {
        let url = Url::parse(endpoint)
            .map_err(|e| Error::StreamableHttpError(format!("Invalid MCP endpoint URL: {}", e)))?;
        match url.scheme() {
            "http" | "https" => Ok(()),
            other => Err(Error::StreamableHttpError(format!(
                "Unsupported MCP endpoint scheme: {}",
                other
            ))),
        }
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    type Handle = StreamableHttpTransportHandle;

    async fn start(&self) -> Result<Self::Handle, Error> {
        Self::validate_endpoint(&self.mcp_endpoint)?;
        let http_client = build_http_client()?;

        let (tx, rx) = mpsc::channel(32);
        let (otx, orx) = mpsc::channel(32);

        let actor = StreamableHttpActor::new(rx, otx, self.mcp_endpoint.clone(), http_client);
        tokio::spawn(actor.run());

        Ok(StreamableHttpTransportHandle {
            sender: tx,
            receiver: Arc::new(Mutex::new(orx)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_endpoint() {
        assert!(StreamableHttpTransport::validate_endpoint("https://example.com/mcp").is_ok());
        assert!(StreamableHttpTransport::validate_endpoint("http://localhost:8081/storage/mcp").is_ok());
        assert!(StreamableHttpTransport::validate_endpoint("not a url").is_err());
        assert!(StreamableHttpTransport::validate_endpoint("ftp://example.com/mcp").is_err());
    }
}
