use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use mcp_core::protocol::{CallToolResult, JsonObject};
use mcp_core::{Content, Tool};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use thiserror::Error;

use crate::cache::ProviderClientCache;
use crate::config::RouterMode;
use crate::guidance;
use crate::provider::ProviderClient;
use crate::registry::{Catalog, ProviderDescriptor, ProviderRegistry, RegistryError};
use crate::resolver::{IntentResolver, Sampler};

/// Separator between provider id and command in flattened tool names.
pub const FLAT_SEPARATOR: &str = "__";

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Failed to discover providers: {0}")]
    Discovery(#[from] RegistryError),
}

fn non_empty<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty()))
}

/// Arguments of one call to the router tool.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RouterRequest {
    #[serde(deserialize_with = "non_empty")]
    pub intent: Option<String>,
    /// Provider id. Called `tool` on the wire.
    #[serde(rename = "tool", alias = "provider", deserialize_with = "non_empty")]
    pub provider: Option<String>,
    #[serde(deserialize_with = "non_empty")]
    pub command: Option<String>,
    pub parameters: Option<Value>,
    pub learn: bool,
}

impl RouterRequest {
    pub fn from_arguments(arguments: Value) -> Result<Self, serde_json::Error> {
        match arguments {
            Value::Null => Ok(Self::default()),
            arguments => serde_json::from_value(arguments),
        }
    }

    pub fn mode(&self) -> Mode {
        classify(self)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Mode {
    RootLearn,
    ProviderLearn {
        provider: String,
    },
    Invoke {
        provider: String,
        command: String,
        parameters: Value,
    },
    Underspecified,
}

impl Mode {
    pub fn name(&self) -> &'static str {
        match self {
            Mode::RootLearn => "root_learn",
            Mode::ProviderLearn { .. } => "provider_learn",
            Mode::Invoke { .. } => "invoke",
            Mode::Underspecified => "underspecified",
        }
    }
}

/// Derive the mode from which fields are present. Learning and invoking
/// never mix, a bare intent is treated as a request to learn.
pub fn classify(request: &RouterRequest) -> Mode {
    match (request.learn, &request.provider, &request.command) {
        (true, _, Some(_)) => Mode::Underspecified,
        (true, Some(provider), None) => Mode::ProviderLearn {
            provider: provider.clone(),
        },
        (true, None, None) => Mode::RootLearn,
        (false, Some(provider), Some(command)) => Mode::Invoke {
            provider: provider.clone(),
            command: command.clone(),
            parameters: request
                .parameters
                .clone()
                .unwrap_or_else(|| Value::Object(JsonObject::new())),
        },
        (false, None, None) if request.intent.is_some() => Mode::RootLearn,
        _ => Mode::Underspecified,
    }
}

fn text(message: String) -> CallToolResult {
    CallToolResult::success(vec![Content::text(message)])
}

struct FlatTool {
    provider: String,
    command: String,
    tool: Tool,
}

/// Provider commands registered as top-level tools after they were learned.
#[derive(Default)]
pub struct FlatTools {
    tools: RwLock<BTreeMap<String, FlatTool>>,
    generation: AtomicU64,
}

impl FlatTools {
    pub fn flat_name(provider: &str, command: &str) -> String {
        format!("{provider}{FLAT_SEPARATOR}{command}")
    }

    /// Replace the registered commands of one provider. Returns true, and
    /// bumps the generation, when the tool set changed.
    pub fn register(&self, provider: &str, capabilities: &[Tool]) -> bool {
        let mut tools = self
            .tools
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let before: Vec<(String, Tool)> = tools
            .iter()
            .filter(|(_, flat)| flat.provider == provider)
            .map(|(name, flat)| (name.clone(), flat.tool.clone()))
            .collect();
        tools.retain(|_, flat| flat.provider != provider);

        let mut after = Vec::with_capacity(capabilities.len());
        for capability in capabilities {
            let name = Self::flat_name(provider, &capability.name);
            let tool = Tool::new(
                name.clone(),
                format!("[{provider}] {}", capability.description),
                capability.input_schema.clone(),
                capability.annotations.clone(),
            );
            after.push((name.clone(), tool.clone()));
            tools.insert(
                name,
                FlatTool {
                    provider: provider.to_string(),
                    command: capability.name.clone(),
                    tool,
                },
            );
        }
        after.sort_by(|a, b| a.0.cmp(&b.0));

        let changed = before != after;
        if changed {
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
        changed
    }

    pub fn list(&self) -> Vec<Tool> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|flat| flat.tool.clone())
            .collect()
    }

    /// The provider and command behind a flattened tool name.
    pub fn resolve(&self, name: &str) -> Option<(String, String)> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|flat| (flat.provider.clone(), flat.command.clone()))
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

/// Routes one request through discovery, learning and invocation.
pub struct CapabilityRouter {
    registry: ProviderRegistry,
    cache: ProviderClientCache,
    resolver: IntentResolver,
    mode: RouterMode,
    flat_tools: FlatTools,
}

impl CapabilityRouter {
    pub fn new(
        registry: ProviderRegistry,
        cache: ProviderClientCache,
        resolver: IntentResolver,
        mode: RouterMode,
    ) -> Self {
        Self {
            registry,
            cache,
            resolver,
            mode,
            flat_tools: FlatTools::default(),
        }
    }

    pub fn mode(&self) -> RouterMode {
        self.mode
    }

    pub fn flat_tools(&self) -> &FlatTools {
        &self.flat_tools
    }

    pub fn cache(&self) -> &ProviderClientCache {
        &self.cache
    }

    /// Handle one request. Only a failed discovery is an error, every other
    /// problem comes back as guidance text in a successful result.
    ///
    /// `sampler` is only used when the request carries an intent.
    pub async fn handle(
        &self,
        request: RouterRequest,
        sampler: Option<Arc<dyn Sampler>>,
    ) -> Result<CallToolResult, RouterError> {
        let mode = classify(&request);
        tracing::info!(
            mode = mode.name(),
            provider = request.provider.as_deref().unwrap_or_default(),
            command = request.command.as_deref().unwrap_or_default(),
            "Routing request"
        );

        let intent = request.intent.as_deref();
        let sampler = sampler.as_deref().filter(|_| intent.is_some());

        match mode {
            Mode::Underspecified if request.learn => Ok(text(guidance::learn_with_command())),
            Mode::Underspecified => Ok(text(guidance::underspecified())),
            Mode::RootLearn => {
                let catalog = self.registry.discover().await?;
                Ok(self.root_learn(&catalog, intent, sampler).await)
            }
            Mode::ProviderLearn { provider } => {
                let catalog = self.registry.discover().await?;
                Ok(self.provider_learn(&catalog, &provider, intent, sampler).await)
            }
            Mode::Invoke {
                provider,
                command,
                parameters,
            } => {
                let catalog = self.registry.discover().await?;
                let Some(descriptor) = catalog.get(&provider) else {
                    return Ok(text(guidance::provider_not_found(&provider)));
                };
                Ok(self.invoke(descriptor, &command, parameters).await)
            }
        }
    }

    async fn root_learn(
        &self,
        catalog: &Catalog,
        intent: Option<&str>,
        sampler: Option<&dyn Sampler>,
    ) -> CallToolResult {
        if let (Some(intent), Some(sampler)) = (intent, sampler) {
            if let Some(pick) = self.resolver.pick_provider(sampler, intent, catalog).await {
                if catalog.contains(&pick.provider) {
                    return self
                        .provider_learn(catalog, &pick.provider, Some(intent), Some(sampler))
                        .await;
                }
                tracing::debug!(provider = %pick.provider, "Sampled provider is not in the catalog");
            }
        }
        text(guidance::root_listing(&catalog.listing()))
    }

    async fn provider_learn(
        &self,
        catalog: &Catalog,
        provider: &str,
        intent: Option<&str>,
        sampler: Option<&dyn Sampler>,
    ) -> CallToolResult {
        let Some(descriptor) = catalog.get(provider) else {
            return text(guidance::provider_not_found(provider));
        };
        let client = match self.cache.get_or_create(descriptor).await {
            Ok(client) => client,
            Err(e) => return text(guidance::establishment_failed(&descriptor.id, &e.to_string())),
        };
        let capabilities = match client.list_capabilities().await {
            Ok(capabilities) => capabilities,
            Err(e) => {
                tracing::warn!(provider = %descriptor.id, error = %e, "Failed to list provider capabilities");
                if e.is_disconnected() {
                    self.cache.invalidate(&descriptor.id, &client).await;
                    return text(guidance::stale_client(&descriptor.id, &e.to_string()));
                }
                return text(guidance::learn_failed(&descriptor.id, &e.to_string()));
            }
        };

        if self.mode == RouterMode::Flatten {
            self.flat_tools.register(&descriptor.id, &capabilities);
        }

        if let (Some(intent), Some(sampler)) = (intent, sampler) {
            if let Some(pick) = self
                .resolver
                .pick_command(sampler, intent, &descriptor.id, &capabilities)
                .await
            {
                if capabilities.iter().any(|c| c.name == pick.command) {
                    return self
                        .call(descriptor, client, &pick.command, pick.parameters)
                        .await;
                }
                tracing::debug!(provider = %descriptor.id, command = %pick.command, "Sampled command is not offered");
            }
        }

        let listing = serde_json::to_string_pretty(&capabilities).unwrap_or_else(|_| "[]".into());
        text(guidance::provider_capabilities(&descriptor.id, &listing))
    }

    async fn invoke(
        &self,
        descriptor: &ProviderDescriptor,
        command: &str,
        parameters: Value,
    ) -> CallToolResult {
        match self.cache.get_or_create(descriptor).await {
            Ok(client) => self.call(descriptor, client, command, parameters).await,
            Err(e) => text(guidance::establishment_failed(&descriptor.id, &e.to_string())),
        }
    }

    async fn call(
        &self,
        descriptor: &ProviderDescriptor,
        client: Arc<dyn ProviderClient>,
        command: &str,
        parameters: Value,
    ) -> CallToolResult {
        match client.invoke(command, parameters).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(provider = %descriptor.id, command, error = %e, "Provider call failed");
                if e.is_disconnected() {
                    self.cache.invalidate(&descriptor.id, &client).await;
                    return text(guidance::stale_client(&descriptor.id, &e.to_string()));
                }
                text(guidance::invocation_failed(
                    &descriptor.id,
                    command,
                    &e.to_string(),
                ))
            }
        }
    }
}
