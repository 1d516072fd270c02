use futures::future::BoxFuture;
use mcp_core::protocol::{
    CancelledParams, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, JsonRpcVersion2_0,
    RequestId, METHOD_INITIALIZE,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{oneshot, RwLock};
use tower::Service;

use crate::transport::{Error, TransportHandle, TransportMessageRecv};

/// A wrapper service that implements Tower's Service trait for MCP transport
#[derive(Clone)]
pub struct McpService<T: TransportHandle> {
    inner: Arc<T>,
    pending_requests: Arc<PendingRequests>,
}

impl<T: TransportHandle> McpService<T> {
    pub fn new(transport: T) -> Self {
        Self {
            inner: Arc::new(transport),
            pending_requests: Arc::new(PendingRequests::default()),
        }
    }

    pub async fn respond(&self, id: &str, response: Result<TransportMessageRecv, Error>) {
        self.pending_requests.respond(id, response).await
    }

    pub async fn hangup(&self, error: Error) {
        self.pending_requests.broadcast_close(error).await
    }
}

impl<T> Service<JsonRpcMessage> for McpService<T>
where
    T: TransportHandle + Send + Sync + 'static,
{
    type Response = TransportMessageRecv;
    type Error = Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: JsonRpcMessage) -> Self::Future {
        let transport = self.inner.clone();
        let pending_requests = self.pending_requests.clone();

        Box::pin(async move {
            match &request {
                JsonRpcMessage::Request(JsonRpcRequest { id, request: inner, .. }) => {
                    let request_id = id.clone();
                    let key = id.to_string();
                    // initialize must not be cancelled, a dropped handshake just forgets it
                    let notify = inner.method != METHOD_INITIALIZE;
                    let (sender, receiver) = oneshot::channel();
                    pending_requests.insert(key.clone(), sender).await;

                    if let Err(e) = transport.send(request).await {
                        pending_requests.forget(&key).await;
                        return Err(e);
                    }

                    let mut guard = CancelOnDrop {
                        request_id: Some(request_id),
                        notify,
                        transport,
                        pending_requests,
                    };
                    let response = receiver.await;
                    guard.disarm();
                    response.map_err(|_| Error::ChannelClosed)?
                }
                JsonRpcMessage::Notification(_) => {
                    transport.send(request).await?;
                    // Notifications have no response, hand back an empty one
                    let dummy_response: Self::Response =
                        JsonRpcMessage::Response(JsonRpcResponse {
                            jsonrpc: JsonRpcVersion2_0,
                            id: RequestId::Number(0),
                            result: serde_json::Map::new(),
                        });
                    Ok(dummy_response)
                }
                _ => Err(Error::UnsupportedMessage),
            }
        })
    }
}

/// Armed while a caller waits for a response. If the caller goes away first,
/// the pending entry is forgotten and the server is told to stop working on
/// the request.
struct CancelOnDrop<T: TransportHandle> {
    request_id: Option<RequestId>,
    notify: bool,
    transport: Arc<T>,
    pending_requests: Arc<PendingRequests>,
}

impl<T: TransportHandle> CancelOnDrop<T> {
    fn disarm(&mut self) {
        self.request_id = None;
    }
}

impl<T: TransportHandle> Drop for CancelOnDrop<T> {
    fn drop(&mut self) {
        let Some(request_id) = self.request_id.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let notify = self.notify;
        let transport = self.transport.clone();
        let pending_requests = self.pending_requests.clone();
        runtime.spawn(async move {
            pending_requests.forget(&request_id.to_string()).await;
            if !notify {
                return;
            }
            tracing::debug!(id = %request_id, "Cancelling abandoned request");
            let cancelled =
                CancelledParams::new(request_id, "the caller stopped waiting").into_notification();
            if let Err(e) = transport.send(cancelled).await {
                tracing::debug!(error = %e, "Could not deliver cancellation");
            }
        });
    }
}

// A data structure to store pending requests and their response channels
pub struct PendingRequests {
    requests: RwLock<HashMap<String, oneshot::Sender<Result<TransportMessageRecv, Error>>>>,
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            requests: RwLock::new(HashMap::new()),
        }
    }

    pub async fn insert(
        &self,
        id: String,
        sender: oneshot::Sender<Result<TransportMessageRecv, Error>>,
    ) {
        self.requests.write().await.insert(id, sender);
    }

    pub async fn respond(&self, id: &str, response: Result<TransportMessageRecv, Error>) {
        if let Some(tx) = self.requests.write().await.remove(id) {
            let _ = tx.send(response);
        }
    }

    pub async fn forget(&self, id: &str) {
        self.requests.write().await.remove(id);
    }

    pub async fn broadcast_close(&self, error: Error) {
        for (_, tx) in self.requests.write().await.drain() {
            let err = match &error {
                Error::StdioProcessError(s) => Error::StdioProcessError(s.clone()),
                _ => Error::ChannelClosed,
            };
            let _ = tx.send(Err(err));
        }
    }

    pub async fn len(&self) -> usize {
        self.requests.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
