use mcp_core::protocol::{
    CallToolResult, ClientCapabilities, Implementation, InitializeParams, InitializeResult,
    JsonObject, JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, JsonRpcVersion2_0, ListToolsResult, Notification, NumberOrString, Request,
    RequestId, ServerCapabilities, LATEST_PROTOCOL_VERSION, METHOD_INITIALIZE,
    METHOD_INITIALIZED, METHOD_NOT_FOUND, METHOD_TOOLS_CALL, METHOD_TOOLS_LIST,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tower::{Service, ServiceExt};

use crate::{McpService, TransportHandle};

pub type BoxError = Box<dyn std::error::Error + Sync + Send>;

/// Error type for MCP client operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(#[from] super::transport::Error),

    #[error("RPC error: code={code}, message={message}")]
    RpcError { code: i32, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unexpected response from server: {0}")]
    UnexpectedResponse(String),

    #[error("Not initialized")]
    NotInitialized,

    #[error("Service not ready")]
    NotReady,

    #[error("Call to '{server}' failed for '{method}'. {source}")]
    McpServerError {
        method: String,
        server: String,
        #[source]
        source: BoxError,
    },
}

impl Error {
    /// True when the connection to the server is gone, as opposed to the
    /// server answering with an error.
    pub fn is_disconnected(&self) -> bool {
        use super::transport::Error as TransportError;
        match self {
            Error::Transport(e) => matches!(
                e,
                TransportError::NotConnected
                    | TransportError::ChannelClosed
                    | TransportError::StdioProcessError(_)
                    | TransportError::Io(_)
            ),
            Error::McpServerError { source, .. } => source
                .downcast_ref::<Error>()
                .is_some_and(Error::is_disconnected),
            _ => false,
        }
    }
}

#[async_trait::async_trait]
pub trait McpClientTrait: Send + Sync {
    async fn initialize(
        &mut self,
        info: Implementation,
        capabilities: ClientCapabilities,
    ) -> Result<InitializeResult, Error>;

    async fn list_tools(&self, next_cursor: Option<String>) -> Result<ListToolsResult, Error>;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, Error>;

    /// The protocol version the server agreed to during `initialize`.
    fn protocol_version(&self) -> Option<&str>;
}

/// The MCP client is the interface for MCP operations.
///
/// Calls are serialized: the underlying service stays locked for the whole
/// round trip of a request, so at most one request is in flight per client.
/// Dropping the client stops its receive loop, which releases the last
/// transport handle and with it the connection.
pub struct McpClient<T>
where
    T: TransportHandle + Send + Sync + 'static,
{
    service: Mutex<McpService<T>>,
    next_id_counter: AtomicU64,
    server_capabilities: Option<ServerCapabilities>,
    server_info: Option<Implementation>,
    protocol_version: Option<String>,
    receive_loop: AbortHandle,
}

impl<T> Drop for McpClient<T>
where
    T: TransportHandle + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.receive_loop.abort();
    }
}

impl<T> McpClient<T>
where
    T: TransportHandle + Send + Sync + 'static,
{
    pub async fn connect(transport: T) -> Result<Self, Error> {
        let service = McpService::new(transport.clone());
        let service_ptr = service.clone();

        let receive_loop = tokio::spawn(async move {
            loop {
                match transport.receive().await {
                    Ok(message) => {
                        tracing::debug!("Received message: {:?}", message);
                        match message {
                            JsonRpcMessage::Response(JsonRpcResponse {
                                id: NumberOrString::Number(id),
                                ..
                            })
                            | JsonRpcMessage::Error(JsonRpcError {
                                id: NumberOrString::Number(id),
                                ..
                            }) => {
                                service_ptr.respond(&id.to_string(), Ok(message)).await;
                            }
                            // providers may send logging or progress
                            // notifications, nothing here consumes them
                            _ => {}
                        }
                    }
                    Err(e) => {
                        service_ptr.hangup(e).await;
                        break;
                    }
                }
            }
        })
        .abort_handle();

        Ok(Self {
            service: Mutex::new(service),
            next_id_counter: AtomicU64::new(1),
            server_capabilities: None,
            server_info: None,
            protocol_version: None,
            receive_loop,
        })
    }

    fn server_name(&self) -> String {
        self.server_info
            .as_ref()
            .map(|s| s.name.clone())
            .unwrap_or_default()
    }

    /// Send a JSON-RPC request and check we don't get an error response.
    async fn send_request<R>(&self, method: &str, params: Value) -> Result<R, Error>
    where
        R: for<'de> Deserialize<'de>,
    {
        let mut service = self.service.lock().await;
        service.ready().await.map_err(|_| Error::NotReady)?;
        let id_num = self.next_id_counter.fetch_add(1, Ordering::SeqCst) as u32;
        let id = RequestId::Number(id_num);

        let mut params = into_object(params);
        params.insert(
            "_meta".to_string(),
            json!({ "progressToken": format!("prog-{}", id) }),
        );

        let request = JsonRpcMessage::Request(JsonRpcRequest {
            jsonrpc: JsonRpcVersion2_0,
            id,
            request: Request {
                method: method.to_string(),
                params,
                extensions: Default::default(),
            },
        });

        let response_msg = service
            .call(request)
            .await
            .map_err(|e| Error::McpServerError {
                server: self.server_name(),
                method: method.to_string(),
                // params are left out on purpose, they can be really large
                source: Box::<Error>::new(e.into()),
            })?;

        let expected_id = RequestId::Number(id_num);
        match response_msg {
            JsonRpcMessage::Response(JsonRpcResponse { id, result, .. }) => {
                if id != expected_id {
                    return Err(Error::UnexpectedResponse(
                        "id mismatch for JsonRpcResponse".to_string(),
                    ));
                }
                Ok(serde_json::from_value(Value::Object(result))?)
            }
            JsonRpcMessage::Error(JsonRpcError { id, error, .. }) => {
                if id != expected_id {
                    return Err(Error::UnexpectedResponse(
                        "id mismatch for JsonRpcError".to_string(),
                    ));
                }
                Err(Error::RpcError {
                    code: error.code.0,
                    message: error.message.to_string(),
                })
            }
            _ => Err(Error::UnexpectedResponse(
                "unexpected message type".to_string(),
            )),
        }
    }

    /// Send a JSON-RPC notification.
    async fn send_notification(&self, method: &str, params: Value) -> Result<(), Error> {
        let mut service = self.service.lock().await;
        service.ready().await.map_err(|_| Error::NotReady)?;

        let notification = JsonRpcMessage::Notification(JsonRpcNotification {
            jsonrpc: JsonRpcVersion2_0,
            notification: Notification {
                method: method.to_string(),
                params: into_object(params),
                extensions: Default::default(),
            },
        });

        service
            .call(notification)
            .await
            .map_err(|e| Error::McpServerError {
                server: self.server_name(),
                method: method.to_string(),
                source: Box::<Error>::new(e.into()),
            })?;

        Ok(())
    }

    fn capabilities(&self) -> Result<&ServerCapabilities, Error> {
        self.server_capabilities
            .as_ref()
            .ok_or(Error::NotInitialized)
    }
}

fn into_object(value: Value) -> JsonObject {
    match value {
        Value::Object(map) => map,
        _ => JsonObject::new(),
    }
}

#[async_trait::async_trait]
impl<T> McpClientTrait for McpClient<T>
where
    T: TransportHandle + Send + Sync + 'static,
{
    async fn initialize(
        &mut self,
        info: Implementation,
        capabilities: ClientCapabilities,
    ) -> Result<InitializeResult, Error> {
        let params = InitializeParams {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            client_info: info,
            capabilities,
        };
        let result: InitializeResult = self
            .send_request(METHOD_INITIALIZE, serde_json::to_value(params)?)
            .await?;

        self.send_notification(METHOD_INITIALIZED, json!({}))
            .await?;

        self.server_capabilities = Some(result.capabilities.clone());
        self.server_info = Some(result.server_info.clone());
        self.protocol_version = Some(result.protocol_version.clone());

        Ok(result)
    }

    async fn list_tools(&self, next_cursor: Option<String>) -> Result<ListToolsResult, Error> {
        // A server without the tools capability simply has nothing to list
        if self.capabilities()?.tools.is_none() {
            return Ok(ListToolsResult {
                tools: vec![],
                next_cursor: None,
            });
        }

        let payload = next_cursor
            .map(|cursor| json!({"cursor": cursor}))
            .unwrap_or_else(|| json!({}));

        self.send_request(METHOD_TOOLS_LIST, payload).await
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, Error> {
        if self.capabilities()?.tools.is_none() {
            return Err(Error::RpcError {
                code: METHOD_NOT_FOUND,
                message: "Server does not support 'tools' capability".to_string(),
            });
        }

        let params = json!({ "name": name, "arguments": arguments });
        self.send_request(METHOD_TOOLS_CALL, params).await
    }

    fn protocol_version(&self) -> Option<&str> {
        self.protocol_version.as_deref()
    }
}
