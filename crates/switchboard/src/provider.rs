use async_trait::async_trait;
use mcp_client::{McpClient, McpClientTrait, TransportHandle};
use mcp_core::protocol::CallToolResult;
use mcp_core::Tool;
use serde_json::Value;

/// A live, initialized connection to one provider.
///
/// Calls on one client are serialized by the underlying MCP client; the
/// client itself can be shared by any number of requests.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn provider_id(&self) -> &str;

    /// Protocol revision agreed on during the handshake.
    fn protocol_version(&self) -> Option<&str>;

    /// The provider's current capability set. Always fetched fresh.
    async fn list_capabilities(&self) -> Result<Vec<Tool>, mcp_client::Error>;

    /// Run one capability with the caller's parameters, untouched.
    async fn invoke(&self, command: &str, parameters: Value)
        -> Result<CallToolResult, mcp_client::Error>;
}

pub struct McpProvider<T>
where
    T: TransportHandle + Send + Sync + 'static,
{
    id: String,
    client: McpClient<T>,
}

impl<T> McpProvider<T>
where
    T: TransportHandle + Send + Sync + 'static,
{
    /// Wrap a client that has already completed `initialize`.
    pub fn new<S: Into<String>>(id: S, client: McpClient<T>) -> Self {
        Self {
            id: id.into(),
            client,
        }
    }
}

#[async_trait]
impl<T> ProviderClient for McpProvider<T>
where
    T: TransportHandle + Send + Sync + 'static,
{
    fn provider_id(&self) -> &str {
        &self.id
    }

    fn protocol_version(&self) -> Option<&str> {
        self.client.protocol_version()
    }

    async fn list_capabilities(&self) -> Result<Vec<Tool>, mcp_client::Error> {
        let mut tools = Vec::new();
        let mut cursor = None;
        loop {
            let page = self.client.list_tools(cursor).await?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(tools)
    }

    async fn invoke(
        &self,
        command: &str,
        parameters: Value,
    ) -> Result<CallToolResult, mcp_client::Error> {
        tracing::debug!(provider = %self.id, command, "Invoking provider command");
        self.client.call_tool(command, parameters).await
    }
}
