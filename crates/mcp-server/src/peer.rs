use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use mcp_core::protocol::{
    CancelledParams, ClientCapabilities, CreateMessageParams, CreateMessageResult, Implementation, JsonObject,
    JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    JsonRpcVersion2_0, Notification, Request, RequestId, METHOD_SAMPLING_CREATE_MESSAGE,
    METHOD_TOOLS_LIST_CHANGED,
};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};

use crate::errors::PeerError;

/// Handle on the connected client, shared by every request of one session.
///
/// It knows what the client declared during `initialize` and can send
/// server-initiated requests (sampling) and notifications back to it.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

struct PeerInner {
    outbound: mpsc::Sender<JsonRpcMessage>,
    pending: Mutex<HashMap<String, oneshot::Sender<JsonRpcMessage>>>,
    next_id: AtomicU32,
    closed: AtomicBool,
    client_info: RwLock<Option<Implementation>>,
    client_capabilities: RwLock<ClientCapabilities>,
}

impl Peer {
    pub fn new(outbound: mpsc::Sender<JsonRpcMessage>) -> Self {
        Self {
            inner: Arc::new(PeerInner {
                outbound,
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU32::new(1),
                closed: AtomicBool::new(false),
                client_info: RwLock::new(None),
                client_capabilities: RwLock::new(ClientCapabilities::default()),
            }),
        }
    }

    /// Record what the client declared in its `initialize` request.
    pub async fn set_client(&self, info: Implementation, capabilities: ClientCapabilities) {
        *self.inner.client_info.write().await = Some(info);
        *self.inner.client_capabilities.write().await = capabilities;
    }

    pub async fn client_info(&self) -> Option<Implementation> {
        self.inner.client_info.read().await.clone()
    }

    pub async fn client_capabilities(&self) -> ClientCapabilities {
        self.inner.client_capabilities.read().await.clone()
    }

    pub async fn supports_sampling(&self) -> bool {
        self.inner.client_capabilities.read().await.supports_sampling()
    }

    /// Ask the client to run an LLM completion (`sampling/createMessage`).
    pub async fn create_message(
        &self,
        params: CreateMessageParams,
    ) -> Result<CreateMessageResult, PeerError> {
        let result = self
            .send_request(METHOD_SAMPLING_CREATE_MESSAGE, serde_json::to_value(params)?)
            .await?;
        Ok(serde_json::from_value(Value::Object(result))?)
    }

    pub async fn notify_tools_list_changed(&self) -> Result<(), PeerError> {
        self.send_notification(METHOD_TOOLS_LIST_CHANGED, JsonObject::new())
            .await
    }

    pub async fn send_notification(&self, method: &str, params: JsonObject) -> Result<(), PeerError> {
        let message = JsonRpcMessage::Notification(JsonRpcNotification {
            jsonrpc: JsonRpcVersion2_0,
            notification: Notification {
                method: method.to_string(),
                params,
                extensions: Default::default(),
            },
        });
        self.inner
            .outbound
            .send(message)
            .await
            .map_err(|_| PeerError::Closed)
    }

    /// Send a request to the client and wait for its reply.
    pub async fn send_request(&self, method: &str, params: Value) -> Result<JsonObject, PeerError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(PeerError::Closed);
        }

        let id = RequestId::Number(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let key = id.to_string();
        let params = match params {
            Value::Object(map) => map,
            _ => JsonObject::new(),
        };

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(key.clone(), tx);

        let request = JsonRpcMessage::Request(JsonRpcRequest {
            jsonrpc: JsonRpcVersion2_0,
            id: id.clone(),
            request: Request {
                method: method.to_string(),
                params,
                extensions: Default::default(),
            },
        });

        tracing::debug!(method, id = %key, "Sending request to client");
        if self.inner.outbound.send(request).await.is_err() {
            self.inner.pending.lock().await.remove(&key);
            return Err(PeerError::Closed);
        }

        let mut guard = AbandonOnDrop {
            inner: self.inner.clone(),
            id: Some(id),
        };
        let reply = rx.await;
        guard.disarm();

        match reply.map_err(|_| PeerError::Closed)? {
            JsonRpcMessage::Response(JsonRpcResponse { result, .. }) => Ok(result),
            JsonRpcMessage::Error(JsonRpcError { error, .. }) => Err(PeerError::Rpc {
                code: error.code.0,
                message: error.message.to_string(),
            }),
            other => Err(PeerError::UnexpectedReply(format!("{:?}", other))),
        }
    }

    /// Hand a response or error received from the client to whoever sent
    /// the matching request. Returns false when nobody was waiting for it.
    pub async fn handle_reply(&self, message: JsonRpcMessage) -> bool {
        let key = match &message {
            JsonRpcMessage::Response(JsonRpcResponse { id, .. })
            | JsonRpcMessage::Error(JsonRpcError { id, .. }) => id.to_string(),
            _ => return false,
        };

        match self.inner.pending.lock().await.remove(&key) {
            Some(tx) => tx.send(message).is_ok(),
            None => {
                tracing::warn!(id = %key, "Reply from client matches no pending request");
                false
            }
        }
    }

    /// Fail every outstanding request and refuse new ones. Called once the
    /// client side of the connection has gone away.
    pub async fn hangup(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        // dropping the senders wakes the waiters with a closed error
        self.inner.pending.lock().await.clear();
    }
}

/// Armed while a tool task waits for the client's reply. If the task is
/// aborted first, the pending entry goes away and the client is told to stop.
struct AbandonOnDrop {
    inner: Arc<PeerInner>,
    id: Option<RequestId>,
}

impl AbandonOnDrop {
    fn disarm(&mut self) {
        self.id = None;
    }
}

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        let key = id.to_string();
        let cancelled = CancelledParams::new(id, "the request was cancelled").into_notification();
        // best effort, a full outbound queue means the client is not reading anyway
        let _ = self.inner.outbound.try_send(cancelled);

        if let Ok(mut pending) = self.inner.pending.try_lock() {
            pending.remove(&key);
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let inner = self.inner.clone();
            runtime.spawn(async move {
                inner.pending.lock().await.remove(&key);
            });
        }
    }
}
