use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use mcp_core::protocol::{
    CancelledParams, ErrorCode, ErrorData, JsonRpcError, JsonRpcMessage, JsonRpcVersion2_0,
    RequestId, METHOD_CANCELLED,
};
use serde_json::Value;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, Mutex},
    task::{AbortHandle, JoinSet},
};
use tower::{Service, ServiceExt};

mod errors;
pub use errors::{BoxError, PeerError, RouterError, ServerError, TransportError};

pub mod peer;
pub use peer::Peer;

pub mod router;
pub use router::{McpRequest, Router, RouterService};

pub mod transport;
pub use transport::ByteTransport;

type InFlight = Arc<Mutex<HashMap<String, AbortHandle>>>;

/// The main server type that processes incoming requests
///
/// Every request runs in its own task, so a slow tool call does not hold up
/// the rest of the session. All outgoing messages go through one writer.
pub struct Server<S> {
    service: S,
}

impl<S> Server<S>
where
    S: Service<McpRequest, Response = JsonRpcMessage> + Clone + Send + 'static,
    S::Error: Into<BoxError> + Send,
    S::Future: Send,
{
    pub fn new(service: S) -> Self {
        Self { service }
    }

    pub async fn run<R, W>(self, transport: ByteTransport<R, W>) -> Result<(), ServerError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (mut incoming, mut sink) = transport.split();
        let (outbound, mut outbox) = mpsc::channel::<JsonRpcMessage>(256);

        let writer = tokio::spawn(async move {
            while let Some(message) = outbox.recv().await {
                sink.write_message(&message).await?;
            }
            Ok::<(), TransportError>(())
        });

        let peer = Peer::new(outbound.clone());
        let in_flight: InFlight = Arc::new(Mutex::new(HashMap::new()));
        let mut tasks = JoinSet::new();

        tracing::info!("Server started");
        loop {
            let msg_result = tokio::select! {
                next = incoming.next() => match next {
                    Some(msg_result) => msg_result,
                    None => break,
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        if !e.is_cancelled() {
                            tracing::error!(error = %e, "Request task failed");
                        }
                    }
                    continue;
                }
            };

            match msg_result {
                Ok(JsonRpcMessage::Request(request)) => {
                    let id = request.id.to_string();
                    tracing::info!(method = %request.request.method, id = %id, "Received request");

                    let mut service = self.service.clone();
                    let mcp_request = McpRequest {
                        request,
                        peer: peer.clone(),
                    };
                    let outbound = outbound.clone();
                    let registry = in_flight.clone();
                    let task_id = id.clone();

                    // held across spawn so the task cannot deregister before it is registered
                    let mut running = in_flight.lock().await;
                    let handle = tasks.spawn(async move {
                        let request_id = mcp_request.request.id.clone();
                        let response = match service.ready().await {
                            Ok(ready) => ready.call(mcp_request).await,
                            Err(e) => Err(e),
                        };
                        let message = match response {
                            Ok(message) => message,
                            Err(e) => {
                                let e: BoxError = e.into();
                                let error_msg = e.to_string();
                                tracing::error!(error = %error_msg, "Request processing failed");
                                error_message(request_id, ErrorCode::INTERNAL_ERROR, error_msg)
                            }
                        };
                        registry.lock().await.remove(&task_id);
                        tracing::info!(id = %task_id, "Sending response");
                        let _ = outbound.send(message).await;
                    });
                    running.insert(id, handle);
                }
                Ok(JsonRpcMessage::Notification(notification)) => {
                    let method = notification.notification.method.as_str();
                    if method == METHOD_CANCELLED {
                        cancel(&in_flight, notification.notification.params).await;
                    } else {
                        tracing::debug!(method, "Received notification");
                    }
                }
                Ok(reply @ (JsonRpcMessage::Response(_) | JsonRpcMessage::Error(_))) => {
                    // answers to requests we sent to the client (sampling)
                    peer.handle_reply(reply).await;
                }
                Ok(JsonRpcMessage::BatchRequest(_) | JsonRpcMessage::BatchResponse(_)) => {
                    let error = error_message(
                        RequestId::Number(0),
                        ErrorCode::INVALID_REQUEST,
                        "Batch messages are not supported".to_string(),
                    );
                    if outbound.send(error).await.is_err() {
                        break;
                    }
                }
                Err(TransportError::Io(e)) => {
                    tracing::error!(error = %e, "Failed to read from client");
                    break;
                }
                Err(e) => {
                    // Convert transport error to JSON-RPC error response
                    let code = match e {
                        TransportError::Protocol(_) => ErrorCode::INVALID_REQUEST,
                        _ => ErrorCode::PARSE_ERROR,
                    };
                    tracing::warn!(error = %e, "Unreadable message from client");

                    // Use a default ID for transport errors
                    let error = error_message(RequestId::Number(0), code, e.to_string());
                    if outbound.send(error).await.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Client closed the connection");
        // nothing can answer a sampling request anymore
        peer.hangup().await;
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                if !e.is_cancelled() {
                    tracing::error!(error = %e, "Request task failed");
                }
            }
        }

        drop(peer);
        drop(outbound);
        match writer.await {
            Ok(result) => result.map_err(ServerError::Transport),
            Err(e) => Err(ServerError::Service(e.to_string())),
        }
    }
}

fn error_message(id: RequestId, code: ErrorCode, message: String) -> JsonRpcMessage {
    JsonRpcMessage::Error(JsonRpcError {
        jsonrpc: JsonRpcVersion2_0,
        id,
        error: ErrorData {
            code,
            message: message.into(),
            data: None,
        },
    })
}

async fn cancel(in_flight: &InFlight, params: serde_json::Map<String, Value>) {
    let params: CancelledParams = match serde_json::from_value(Value::Object(params)) {
        Ok(params) => params,
        Err(e) => {
            tracing::warn!(error = %e, "Malformed cancellation");
            return;
        }
    };
    let id = params.request_id.to_string();
    match in_flight.lock().await.remove(&id) {
        Some(handle) => {
            tracing::info!(id = %id, reason = ?params.reason, "Cancelling request");
            handle.abort();
        }
        None => tracing::debug!(id = %id, "Cancellation for a request that is not running"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcp_core::handler::ToolError;
    use mcp_core::protocol::{
        CallToolResult, CreateMessageParams, SamplingMessage, ServerCapabilities,
    };
    use mcp_core::role::Role;
    use mcp_core::{Content, Tool};
    use router::CapabilitiesBuilder;
    use serde_json::json;
    use std::future::Future;
    use std::pin::Pin;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};

    #[derive(Clone)]
    struct TestRouter;

    impl Router for TestRouter {
        fn name(&self) -> String {
            "test".to_string()
        }

        fn version(&self) -> String {
            "0.0.1".to_string()
        }

        fn instructions(&self) -> String {
            String::new()
        }

        fn capabilities(&self) -> ServerCapabilities {
            CapabilitiesBuilder::new().with_tools(false).build()
        }

        fn list_tools(&self) -> Vec<Tool> {
            vec![]
        }

        fn call_tool(
            &self,
            tool_name: &str,
            _arguments: Value,
            peer: Peer,
        ) -> Pin<Box<dyn Future<Output = Result<CallToolResult, ToolError>> + Send + 'static>>
        {
            let tool_name = tool_name.to_string();
            Box::pin(async move {
                match tool_name.as_str() {
                    "fast" => Ok(CallToolResult::success(vec![Content::text("fast done")])),
                    "hang" => {
                        std::future::pending::<()>().await;
                        unreachable!()
                    }
                    "ask" => {
                        let reply = peer
                            .create_message(CreateMessageParams {
                                messages: vec![SamplingMessage {
                                    role: Role::User,
                                    content: Content::text("which?"),
                                }],
                                system_prompt: None,
                                temperature: None,
                                max_tokens: 10,
                            })
                            .await
                            .map_err(|e| ToolError::ExecutionError(e.to_string()))?;
                        Ok(CallToolResult::success(vec![reply.content]))
                    }
                    _ => Err(ToolError::NotFound(tool_name)),
                }
            })
        }
    }

    struct Harness {
        input: DuplexStream,
        output: Lines<BufReader<DuplexStream>>,
        server: tokio::task::JoinHandle<Result<(), ServerError>>,
    }

    impl Harness {
        fn start() -> Self {
            let (input, server_in) = tokio::io::duplex(64 * 1024);
            let (server_out, output) = tokio::io::duplex(64 * 1024);
            let server = tokio::spawn(
                Server::new(RouterService(TestRouter)).run(ByteTransport::new(server_in, server_out)),
            );
            Self {
                input,
                output: BufReader::new(output).lines(),
                server,
            }
        }

        async fn send(&mut self, value: Value) {
            let line = format!("{}\n", value);
            self.input.write_all(line.as_bytes()).await.unwrap();
        }

        async fn recv(&mut self) -> Value {
            let line = self.output.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }
    }

    fn call(id: u32, tool: &str) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "tools/call",
            "params": {"name": tool, "arguments": {}}
        })
    }

    #[tokio::test]
    async fn test_slow_request_does_not_block_others() {
        let mut h = Harness::start();
        h.send(call(1, "hang")).await;
        h.send(call(2, "fast")).await;

        let reply = h.recv().await;
        assert_eq!(reply["id"], json!(2));
        assert_eq!(reply["result"]["content"][0]["text"], json!("fast done"));

        // cancelling the stuck call produces no response for it
        h.send(json!({
            "jsonrpc": "2.0",
            "method": "notifications/cancelled",
            "params": {"requestId": 1, "reason": "user gave up"}
        }))
        .await;
        h.send(json!({"jsonrpc": "2.0", "id": 3, "method": "ping", "params": {}}))
            .await;
        let reply = h.recv().await;
        assert_eq!(reply["id"], json!(3));

        drop(h.input);
        assert!(h.output.next_line().await.unwrap().is_none());
        h.server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_sampling_round_trip_through_client() {
        let mut h = Harness::start();
        h.send(call(1, "ask")).await;

        let request = h.recv().await;
        assert_eq!(request["method"], json!("sampling/createMessage"));
        h.send(json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "result": {
                "role": "assistant",
                "content": {"type": "text", "text": "storage"},
                "model": "m"
            }
        }))
        .await;

        let reply = h.recv().await;
        assert_eq!(reply["id"], json!(1));
        assert_eq!(reply["result"]["content"][0]["text"], json!("storage"));
    }

    #[tokio::test]
    async fn test_parse_error_reported_and_server_keeps_running() {
        let mut h = Harness::start();
        h.input.write_all(b"{not json\n").await.unwrap();
        let reply = h.recv().await;
        assert_eq!(reply["error"]["code"], json!(-32700));

        h.send(json!({"jsonrpc": "2.0", "id": 9, "method": "ping", "params": {}}))
            .await;
        let reply = h.recv().await;
        assert_eq!(reply["id"], json!(9));
    }

    #[tokio::test]
    async fn test_pending_sampling_fails_when_client_leaves() {
        let mut h = Harness::start();
        h.send(call(1, "ask")).await;
        let request = h.recv().await;
        assert_eq!(request["method"], json!("sampling/createMessage"));

        // closing input hangs up the peer, the tool call then errors out
        h.input.shutdown().await.unwrap();
        let reply = h.recv().await;
        assert_eq!(reply["id"], json!(1));
        assert_eq!(reply["error"]["code"], json!(-32603));
        h.server.await.unwrap().unwrap();
    }
}
