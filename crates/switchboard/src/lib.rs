pub mod cache;
pub mod config;
pub mod connector;
pub mod guidance;
pub mod manager;
pub mod provider;
pub mod registry;
pub mod resolver;
pub mod router;
pub mod server;

pub use cache::ProviderClientCache;
pub use config::{RouterMode, Settings, SettingsError, APP_STRATEGY};
pub use connector::{ConnectError, McpConnector, ProviderConnector};
pub use manager::{CliExtensionManager, ExtensionManager, ExtensionManagerError, ExtensionRecord};
pub use provider::{McpProvider, ProviderClient};
pub use registry::{BundledManifest, Catalog, ProviderDescriptor, ProviderRegistry, RegistryError};
pub use resolver::{IntentResolver, Sampler, SamplingError};
pub use router::{CapabilityRouter, Mode, RouterError, RouterRequest};
pub use server::SwitchboardRouter;
