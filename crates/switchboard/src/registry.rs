use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use semver::Version;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Settings;
use crate::manager::{ExtensionManager, ExtensionManagerError, ExtensionRecord};

const BUNDLED_MANIFEST: &str = include_str!("../resources/providers.json");

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("failed to get extension metadata: {0}")]
    ExtensionManager(#[from] ExtensionManagerError),
    #[error("failed to parse provider manifest: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error("failed to read provider manifest {path}: {source}")]
    ManifestFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// How a provider's server is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchSpec {
    /// A locally installed extension started as a subprocess with
    /// `<command> <namespace segments...> server start`.
    Extension {
        extension_id: String,
        namespace: String,
        command: String,
    },
    /// A remotely hosted server spoken to over streamable HTTP.
    Remote { url: String },
}

/// Identity and connection recipe for one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderDescriptor {
    /// Caller-facing id, unique in a catalog.
    pub id: String,
    pub display_name: String,
    pub description: String,
    pub launch: LaunchSpec,
    pub installed_version: Option<Version>,
    pub latest_version: Option<Version>,
    pub installed: bool,
}

impl ProviderDescriptor {
    /// The extension manager id, if this provider is an extension.
    pub fn extension_id(&self) -> Option<&str> {
        match &self.launch {
            LaunchSpec::Extension { extension_id, .. } => Some(extension_id),
            LaunchSpec::Remote { .. } => None,
        }
    }

    /// True when an installed extension has a strictly newer release.
    /// Versions that could not be parsed never trigger an upgrade.
    pub fn needs_upgrade(&self) -> bool {
        match (&self.installed_version, &self.latest_version) {
            (Some(installed), Some(latest)) => self.installed && installed < latest,
            _ => false,
        }
    }
}

/// Summary shown to callers during discovery.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProviderSummary {
    pub name: String,
    pub description: String,
}

/// The merged, deduplicated provider set of one discovery run.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    providers: BTreeMap<String, ProviderDescriptor>,
}

impl Catalog {
    /// Look a provider up by caller-facing id or by full extension id.
    pub fn get(&self, id: &str) -> Option<&ProviderDescriptor> {
        self.providers.get(id).or_else(|| {
            self.providers
                .values()
                .find(|provider| provider.extension_id() == Some(id))
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProviderDescriptor> {
        self.providers.values()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn summaries(&self) -> Vec<ProviderSummary> {
        self.iter()
            .map(|provider| ProviderSummary {
                name: provider.id.clone(),
                description: provider.description.clone(),
            })
            .collect()
    }

    /// Pretty JSON listing of ids and descriptions, no capability detail.
    pub fn listing(&self) -> String {
        serde_json::to_string_pretty(&self.summaries()).unwrap_or_else(|_| "[]".to_string())
    }

    fn insert_if_absent(&mut self, descriptor: ProviderDescriptor) -> bool {
        if self.providers.contains_key(&descriptor.id) {
            return false;
        }
        self.providers.insert(descriptor.id.clone(), descriptor);
        true
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ManifestEntry {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Deserialize)]
struct ManifestFile {
    #[serde(default)]
    servers: Vec<ManifestEntry>,
}

/// Static list of remotely hosted providers, `{"servers": [{name, description, url}]}`.
#[derive(Debug, Clone, Default)]
pub struct BundledManifest {
    contents: String,
}

impl BundledManifest {
    /// The manifest compiled into this crate.
    pub fn bundled() -> Self {
        Self::from_contents(BUNDLED_MANIFEST)
    }

    pub fn from_contents<S: Into<String>>(contents: S) -> Self {
        Self {
            contents: contents.into(),
        }
    }

    /// Read a manifest from disk. A missing file is an empty manifest.
    pub fn from_path(path: &Path) -> Result<Self, RegistryError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Ok(Self::from_contents(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No provider manifest, skipping");
                Ok(Self::default())
            }
            Err(source) => Err(RegistryError::ManifestFile {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, RegistryError> {
        match &settings.manifest.path {
            Some(path) => Self::from_path(path),
            None => Ok(Self::bundled()),
        }
    }

    pub fn entries(&self) -> Result<Vec<ManifestEntry>, RegistryError> {
        if self.contents.trim().is_empty() {
            return Ok(Vec::new());
        }
        let manifest: ManifestFile = serde_json::from_str(&self.contents)?;
        Ok(manifest.servers)
    }
}

/// Parse a version leniently: a leading `v` and missing minor or patch
/// components are accepted, anything else unparseable is `None`.
pub fn parse_version(raw: &str) -> Option<Version> {
    let raw = raw.trim();
    let raw = raw.strip_prefix('v').unwrap_or(raw);
    if raw.is_empty() {
        return None;
    }
    if let Ok(version) = Version::parse(raw) {
        return Some(version);
    }

    let (core, rest) = match raw.find(['-', '+']) {
        Some(idx) => raw.split_at(idx),
        None => (raw, ""),
    };
    let parts = core.split('.').count();
    let padded = match parts {
        1 => format!("{core}.0.0{rest}"),
        2 => format!("{core}.0{rest}"),
        _ => return None,
    };
    Version::parse(&padded).ok()
}

/// Produces the provider catalog from the extension manager and the
/// bundled manifest.
pub struct ProviderRegistry {
    manager: Arc<dyn ExtensionManager>,
    manifest: BundledManifest,
    program: String,
    id_prefix: String,
    self_id: String,
}

impl ProviderRegistry {
    pub fn new(
        manager: Arc<dyn ExtensionManager>,
        manifest: BundledManifest,
        settings: &Settings,
    ) -> Self {
        Self {
            manager,
            manifest,
            program: settings.extensions.program.clone(),
            id_prefix: settings.extensions.id_prefix.clone(),
            self_id: settings.server.self_id.clone(),
        }
    }

    fn provider_id<'a>(&self, extension_id: &'a str) -> &'a str {
        extension_id
            .strip_prefix(self.id_prefix.as_str())
            .unwrap_or(extension_id)
    }

    fn is_self(&self, id: &str) -> bool {
        id == self.self_id || id == self.provider_id(&self.self_id)
    }

    fn from_record(&self, record: ExtensionRecord) -> ProviderDescriptor {
        let id = self.provider_id(&record.id).to_string();
        ProviderDescriptor {
            display_name: id.clone(),
            id,
            description: record.description,
            launch: LaunchSpec::Extension {
                extension_id: record.id,
                namespace: record.namespace,
                command: self.program.clone(),
            },
            installed_version: parse_version(&record.version),
            latest_version: parse_version(&record.latest_version),
            installed: record.installed,
        }
    }

    /// Run a fresh discovery. Failure of the extension manager is an error,
    /// never an empty catalog.
    pub async fn discover(&self) -> Result<Catalog, RegistryError> {
        let records = self.manager.list().await?;
        let entries = self.manifest.entries()?;

        let mut catalog = Catalog::default();
        for record in records {
            if self.is_self(&record.id) {
                continue;
            }
            let descriptor = self.from_record(record);
            let id = descriptor.id.clone();
            if !catalog.insert_if_absent(descriptor) {
                tracing::warn!(provider = %id, "Duplicate extension id, keeping the first");
            }
        }

        for entry in entries {
            if entry.name.is_empty() || self.is_self(&entry.name) {
                continue;
            }
            let descriptor = ProviderDescriptor {
                id: entry.name.clone(),
                display_name: entry.name.clone(),
                description: entry.description,
                launch: LaunchSpec::Remote { url: entry.url },
                installed_version: None,
                latest_version: None,
                installed: true,
            };
            // extension manager entries are more authoritative
            if !catalog.insert_if_absent(descriptor) {
                tracing::debug!(provider = %entry.name, "Manifest entry shadowed by extension");
            }
        }

        tracing::info!(providers = catalog.len(), "Discovered providers");
        Ok(catalog)
    }
}
