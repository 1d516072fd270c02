use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use mcp_core::{
    handler::ToolError,
    protocol::{
        CallToolParams, CallToolResult, Implementation, InitializeParams, InitializeResult,
        JsonObject, JsonRpcError, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse,
        JsonRpcVersion2_0, ListToolsResult, ServerCapabilities, ToolsCapability,
        LATEST_PROTOCOL_VERSION, METHOD_INITIALIZE, METHOD_PING, METHOD_TOOLS_CALL,
        METHOD_TOOLS_LIST,
    },
    Tool,
};
use serde::Serialize;
use serde_json::Value;
use tower::Service;

use crate::{BoxError, Peer, RouterError};

/// Protocol revisions a client may ask for and get echoed back.
const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2024-11-05", LATEST_PROTOCOL_VERSION];

/// Builder for configuring and constructing capabilities
pub struct CapabilitiesBuilder {
    tools: Option<ToolsCapability>,
    logging: Option<Value>,
}

impl Default for CapabilitiesBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilitiesBuilder {
    pub fn new() -> Self {
        Self {
            tools: None,
            logging: None,
        }
    }

    /// Add tools capability, `list_changed` announces that the tool set may
    /// change during the session
    pub fn with_tools(mut self, list_changed: bool) -> Self {
        self.tools = Some(ToolsCapability {
            list_changed: Some(list_changed),
        });
        self
    }

    pub fn with_logging(mut self) -> Self {
        self.logging = Some(Value::Object(JsonObject::new()));
        self
    }

    pub fn build(self) -> ServerCapabilities {
        ServerCapabilities {
            tools: self.tools,
            logging: self.logging,
            prompts: None,
            resources: None,
        }
    }
}

/// One request from the client together with the session it arrived on.
pub struct McpRequest {
    pub request: JsonRpcRequest,
    pub peer: Peer,
}

fn to_object<T: Serialize>(value: &T) -> Result<JsonObject, RouterError> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(RouterError::Internal(format!(
            "Expected a JSON object result, got {}",
            other
        ))),
        Err(e) => Err(RouterError::Internal(e.to_string())),
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(req: &JsonRpcRequest) -> Result<T, RouterError> {
    serde_json::from_value(Value::Object(req.request.params.clone()))
        .map_err(|e| RouterError::InvalidParams(e.to_string()))
}

pub trait Router: Send + Sync + 'static {
    fn name(&self) -> String;
    fn version(&self) -> String;
    // in the protocol, instructions are optional but we make it required
    fn instructions(&self) -> String;
    fn capabilities(&self) -> ServerCapabilities;
    fn list_tools(&self) -> Vec<Tool>;
    fn call_tool(
        &self,
        tool_name: &str,
        arguments: Value,
        peer: Peer,
    ) -> Pin<Box<dyn Future<Output = Result<CallToolResult, ToolError>> + Send + 'static>>;

    // Helper method to create base response
    fn create_response(&self, req: &JsonRpcRequest, result: JsonObject) -> JsonRpcResponse {
        JsonRpcResponse {
            jsonrpc: JsonRpcVersion2_0,
            id: req.id.clone(),
            result,
        }
    }

    fn handle_initialize(
        &self,
        req: JsonRpcRequest,
        peer: Peer,
    ) -> impl Future<Output = Result<JsonRpcResponse, RouterError>> + Send {
        async move {
            let params: InitializeParams = parse_params(&req)?;
            tracing::info!(
                client = %params.client_info.name,
                client_version = %params.client_info.version,
                sampling = params.capabilities.supports_sampling(),
                "Client initializing"
            );

            let protocol_version = if SUPPORTED_PROTOCOL_VERSIONS
                .contains(&params.protocol_version.as_str())
            {
                params.protocol_version.clone()
            } else {
                LATEST_PROTOCOL_VERSION.to_string()
            };
            peer.set_client(params.client_info, params.capabilities)
                .await;

            let result = InitializeResult {
                protocol_version,
                capabilities: self.capabilities(),
                server_info: Implementation {
                    name: self.name(),
                    version: self.version(),
                },
                instructions: Some(self.instructions()),
            };

            Ok(self.create_response(&req, to_object(&result)?))
        }
    }

    fn handle_ping(
        &self,
        req: JsonRpcRequest,
    ) -> impl Future<Output = Result<JsonRpcResponse, RouterError>> + Send {
        async move { Ok(self.create_response(&req, JsonObject::new())) }
    }

    fn handle_tools_list(
        &self,
        req: JsonRpcRequest,
    ) -> impl Future<Output = Result<JsonRpcResponse, RouterError>> + Send {
        async move {
            let result = ListToolsResult {
                tools: self.list_tools(),
                next_cursor: None,
            };
            Ok(self.create_response(&req, to_object(&result)?))
        }
    }

    fn handle_tools_call(
        &self,
        req: JsonRpcRequest,
        peer: Peer,
    ) -> impl Future<Output = Result<JsonRpcResponse, RouterError>> + Send {
        async move {
            let params: CallToolParams = parse_params(&req)?;
            let arguments = params
                .arguments
                .unwrap_or_else(|| Value::Object(JsonObject::new()));

            let result = match self.call_tool(&params.name, arguments, peer).await {
                Ok(result) => result,
                Err(ToolError::NotFound(msg)) => return Err(RouterError::ToolNotFound(msg)),
                Err(ToolError::InvalidParameters(msg)) => {
                    return Err(RouterError::InvalidParams(msg))
                }
                Err(ToolError::ExecutionError(msg)) => return Err(RouterError::Internal(msg)),
            };

            Ok(self.create_response(&req, to_object(&result)?))
        }
    }
}

/// Adapts a [`Router`] into a tower service answering one request with
/// either a response or a JSON-RPC error.
#[derive(Clone)]
pub struct RouterService<T>(pub T);

impl<T> Service<McpRequest> for RouterService<T>
where
    T: Router + Clone + Send + Sync + 'static,
{
    type Response = JsonRpcMessage;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: McpRequest) -> Self::Future {
        let this = self.0.clone();

        Box::pin(async move {
            let McpRequest { request, peer } = req;
            let id = request.id.clone();
            let method = request.request.method.clone();

            let result = match method.as_str() {
                METHOD_INITIALIZE => this.handle_initialize(request, peer).await,
                METHOD_PING => this.handle_ping(request).await,
                METHOD_TOOLS_LIST => this.handle_tools_list(request).await,
                METHOD_TOOLS_CALL => this.handle_tools_call(request, peer).await,
                _ => Err(RouterError::MethodNotFound(method.clone())),
            };

            Ok(match result {
                Ok(response) => JsonRpcMessage::Response(response),
                Err(err) => {
                    tracing::warn!(method = %method, error = %err, "Request failed");
                    JsonRpcMessage::Error(JsonRpcError {
                        jsonrpc: JsonRpcVersion2_0,
                        id,
                        error: err.into(),
                    })
                }
            })
        })
    }
}
