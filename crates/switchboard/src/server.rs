use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use mcp_core::handler::ToolError;
use mcp_core::protocol::{CallToolResult, ServerCapabilities};
use mcp_core::{Content, Tool};
use mcp_server::router::CapabilitiesBuilder;
use mcp_server::{Peer, Router};
use serde_json::{json, Value};

use crate::cache::ProviderClientCache;
use crate::config::{RouterMode, Settings};
use crate::connector::McpConnector;
use crate::guidance;
use crate::manager::{CliExtensionManager, ExtensionManager};
use crate::registry::{BundledManifest, ProviderRegistry, RegistryError};
use crate::resolver::{IntentResolver, Sampler};
use crate::router::{CapabilityRouter, RouterRequest};

/// The MCP face of the capability router: one tool, plus the flattened
/// provider commands when running in flatten mode.
#[derive(Clone)]
pub struct SwitchboardRouter {
    inner: Arc<SwitchboardInner>,
}

struct SwitchboardInner {
    router: CapabilityRouter,
    settings: Settings,
}

impl SwitchboardRouter {
    pub fn new(router: CapabilityRouter, settings: Settings) -> Self {
        Self {
            inner: Arc::new(SwitchboardInner { router, settings }),
        }
    }

    /// Wire the real extension manager, manifest and MCP connector.
    pub fn from_settings(settings: &Settings) -> Result<Self, RegistryError> {
        let manager: Arc<dyn ExtensionManager> =
            Arc::new(CliExtensionManager::from_settings(&settings.extensions));
        let manifest = BundledManifest::from_settings(settings)?;
        let registry = ProviderRegistry::new(manager.clone(), manifest, settings);
        let connector = McpConnector::from_settings(manager, settings);
        let router = CapabilityRouter::new(
            registry,
            ProviderClientCache::new(Arc::new(connector)),
            IntentResolver::new(settings.router.sampling_max_tokens),
            settings.router.mode,
        );
        Ok(Self::new(router, settings.clone()))
    }

    pub fn capability_router(&self) -> &CapabilityRouter {
        &self.inner.router
    }

    fn router_tool(&self) -> Tool {
        Tool::new(
            self.inner.settings.server.tool_name.clone(),
            guidance::tool_description(),
            json!({
                "type": "object",
                "required": ["intent"],
                "properties": {
                    "intent": {
                        "type": "string",
                        "description": "The intent of the operation the user wants to perform against azure."
                    },
                    "tool": {
                        "type": "string",
                        "description": "The azure tool to use to execute the operation."
                    },
                    "command": {
                        "type": "string",
                        "description": "The command to execute against the specified tool."
                    },
                    "parameters": {
                        "type": "object",
                        "description": "The parameters to pass to the tool"
                    },
                    "learn": {
                        "type": "boolean",
                        "default": false,
                        "description": "To learn about the tool and its supported child tools and parameters."
                    }
                }
            }),
            None,
        )
    }

    /// The peer as a sampler, if the client declared sampling support and
    /// sampling is enabled.
    async fn sampler_for(&self, peer: &Peer) -> Option<Arc<dyn Sampler>> {
        if !self.inner.settings.router.sampling || !peer.supports_sampling().await {
            return None;
        }
        Some(Arc::new(peer.clone()))
    }

    fn request_for(&self, tool_name: &str, arguments: Value) -> Result<RouterRequest, CallOutcome> {
        if tool_name == self.inner.settings.server.tool_name {
            return RouterRequest::from_arguments(arguments).map_err(|e| {
                CallOutcome::Done(CallToolResult::success(vec![Content::text(
                    guidance::invalid_arguments(&e.to_string()),
                )]))
            });
        }

        match self.inner.router.flat_tools().resolve(tool_name) {
            Some((provider, command)) => Ok(RouterRequest {
                provider: Some(provider),
                command: Some(command),
                parameters: Some(arguments),
                ..Default::default()
            }),
            None => Err(CallOutcome::Failed(ToolError::NotFound(format!(
                "Tool {} not found",
                tool_name
            )))),
        }
    }

    async fn dispatch(
        &self,
        tool_name: String,
        arguments: Value,
        peer: Peer,
    ) -> Result<CallToolResult, ToolError> {
        let request = match self.request_for(&tool_name, arguments) {
            Ok(request) => request,
            Err(CallOutcome::Done(result)) => return Ok(result),
            Err(CallOutcome::Failed(e)) => return Err(e),
        };

        let sampler = self.sampler_for(&peer).await;
        let flat_tools = self.inner.router.flat_tools();
        let generation = flat_tools.generation();

        let result = self
            .inner
            .router
            .handle(request, sampler)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Request failed");
                ToolError::ExecutionError(e.to_string())
            })?;

        if flat_tools.generation() != generation {
            if let Err(e) = peer.notify_tools_list_changed().await {
                tracing::warn!(error = %e, "Failed to announce tool list change");
            }
        }
        Ok(result)
    }
}

enum CallOutcome {
    Done(CallToolResult),
    Failed(ToolError),
}

impl Router for SwitchboardRouter {
    fn name(&self) -> String {
        self.inner.settings.server.name.clone()
    }

    fn version(&self) -> String {
        self.inner.settings.server.version.clone()
    }

    fn instructions(&self) -> String {
        guidance::instructions()
    }

    fn capabilities(&self) -> ServerCapabilities {
        CapabilitiesBuilder::new()
            .with_tools(self.inner.router.mode() == RouterMode::Flatten)
            .build()
    }

    fn list_tools(&self) -> Vec<Tool> {
        let mut tools = vec![self.router_tool()];
        tools.extend(self.inner.router.flat_tools().list());
        tools
    }

    fn call_tool(
        &self,
        tool_name: &str,
        arguments: Value,
        peer: Peer,
    ) -> Pin<Box<dyn Future<Output = Result<CallToolResult, ToolError>> + Send + 'static>> {
        let this = self.clone();
        let tool_name = tool_name.to_string();
        Box::pin(async move { this.dispatch(tool_name, arguments, peer).await })
    }
}
