use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use mcp_client::{
    McpClient, McpClientTrait, StdioTransport, StreamableHttpTransport, Transport, TransportHandle,
};
use mcp_core::protocol::{ClientCapabilities, Implementation};
use thiserror::Error;

use crate::config::Settings;
use crate::manager::{ExtensionManager, ExtensionManagerError};
use crate::provider::{McpProvider, ProviderClient};
use crate::registry::{LaunchSpec, ProviderDescriptor};

/// Arguments appended to the namespace segments to start a provider server.
const SERVER_START: [&str; 2] = ["server", "start"];

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("failed to install extension {extension_id}: {source}")]
    Install {
        extension_id: String,
        #[source]
        source: ExtensionManagerError,
    },
    #[error("failed to upgrade extension {extension_id}: {source}")]
    Upgrade {
        extension_id: String,
        #[source]
        source: ExtensionManagerError,
    },
    #[error("invalid namespace for extension: {0}")]
    InvalidNamespace(String),
    #[error("missing 'url' property for provider {0}")]
    MissingUrl(String),
    #[error("failed to start MCP client for {provider}: {source}")]
    Transport {
        provider: String,
        #[source]
        source: mcp_client::transport::Error,
    },
    #[error("failed to initialize MCP client for {provider}: {source}")]
    Handshake {
        provider: String,
        #[source]
        source: mcp_client::Error,
    },
    #[error("preparing {provider} did not complete: {reason}")]
    Interrupted { provider: String, reason: String },
}

/// Turns a descriptor into a ready provider client.
#[async_trait]
pub trait ProviderConnector: Send + Sync {
    async fn connect(
        &self,
        descriptor: &ProviderDescriptor,
    ) -> Result<Arc<dyn ProviderClient>, ConnectError>;
}

/// `<namespace segments...> server start`, the namespace needs at least two
/// dot-separated segments.
pub fn server_start_args(namespace: &str) -> Result<Vec<String>, ConnectError> {
    let segments: Vec<&str> = namespace.split('.').collect();
    if segments.len() < 2 {
        return Err(ConnectError::InvalidNamespace(namespace.to_string()));
    }
    Ok(segments
        .into_iter()
        .chain(SERVER_START)
        .map(str::to_string)
        .collect())
}

/// Install a missing extension or upgrade an outdated one.
async fn prepare_extension(
    manager: Arc<dyn ExtensionManager>,
    descriptor: ProviderDescriptor,
) -> Result<(), ConnectError> {
    let Some(extension_id) = descriptor.extension_id() else {
        return Ok(());
    };

    if !descriptor.installed {
        tracing::info!(provider = %descriptor.id, extension = extension_id, "Installing extension");
        manager
            .install(extension_id)
            .await
            .map_err(|source| ConnectError::Install {
                extension_id: extension_id.to_string(),
                source,
            })?;
    } else if descriptor.needs_upgrade() {
        tracing::info!(
            provider = %descriptor.id,
            extension = extension_id,
            installed = ?descriptor.installed_version,
            latest = ?descriptor.latest_version,
            "Upgrading extension"
        );
        manager
            .upgrade(extension_id)
            .await
            .map_err(|source| ConnectError::Upgrade {
                extension_id: extension_id.to_string(),
                source,
            })?;
    }
    Ok(())
}

/// Connects over MCP: extensions are launched as stdio subprocesses through
/// the extension manager's program, remote providers over streamable HTTP.
pub struct McpConnector {
    manager: Arc<dyn ExtensionManager>,
    client_info: Implementation,
}

impl McpConnector {
    pub fn new(manager: Arc<dyn ExtensionManager>, client_info: Implementation) -> Self {
        Self {
            manager,
            client_info,
        }
    }

    pub fn from_settings(manager: Arc<dyn ExtensionManager>, settings: &Settings) -> Self {
        Self::new(
            manager,
            Implementation {
                name: settings.server.self_id.clone(),
                version: settings.server.version.clone(),
            },
        )
    }

    async fn handshake<T>(
        &self,
        provider: &str,
        handle: T,
    ) -> Result<Arc<dyn ProviderClient>, ConnectError>
    where
        T: TransportHandle + Send + Sync + 'static,
    {
        let handshake_error = |source| ConnectError::Handshake {
            provider: provider.to_string(),
            source,
        };
        let mut client = McpClient::connect(handle).await.map_err(handshake_error)?;
        let info = client
            .initialize(self.client_info.clone(), ClientCapabilities::default())
            .await
            .map_err(handshake_error)?;

        tracing::info!(
            provider,
            server = %info.server_info.name,
            protocol = %info.protocol_version,
            "Provider client ready"
        );
        Ok(Arc::new(McpProvider::new(provider, client)))
    }
}

#[async_trait]
impl ProviderConnector for McpConnector {
    async fn connect(
        &self,
        descriptor: &ProviderDescriptor,
    ) -> Result<Arc<dyn ProviderClient>, ConnectError> {
        let transport_error = |source| ConnectError::Transport {
            provider: descriptor.id.clone(),
            source,
        };

        match &descriptor.launch {
            LaunchSpec::Extension {
                namespace, command, ..
            } => {
                // Runs detached so a cancelled request never leaves an
                // extension half installed
                tokio::spawn(prepare_extension(self.manager.clone(), descriptor.clone()))
                    .await
                    .map_err(|e| ConnectError::Interrupted {
                        provider: descriptor.id.clone(),
                        reason: e.to_string(),
                    })??;

                let args = server_start_args(namespace)?;
                let transport = StdioTransport::new(command.clone(), args, HashMap::new());
                tracing::info!(
                    provider = %descriptor.id,
                    command = %transport.command_line(),
                    "Launching provider server"
                );
                let handle = transport.start().await.map_err(transport_error)?;
                self.handshake(&descriptor.id, handle).await
            }
            LaunchSpec::Remote { url } => {
                if url.is_empty() {
                    return Err(ConnectError::MissingUrl(descriptor.id.clone()));
                }
                StreamableHttpTransport::validate_endpoint(url).map_err(transport_error)?;
                tracing::info!(provider = %descriptor.id, url = %url, "Connecting to remote provider");
                let handle = StreamableHttpTransport::new(url.clone())
                    .start()
                    .await
                    .map_err(transport_error)?;
                self.handshake(&descriptor.id, handle).await
            }
        }
    }
}
