use std::path::{Path, PathBuf};

use config::{Config, Environment, File, FileFormat};
use etcetera::{choose_app_strategy, AppStrategy, AppStrategyArgs};
use once_cell::sync::Lazy;
use serde::Deserialize;
use thiserror::Error;

pub static APP_STRATEGY: Lazy<AppStrategyArgs> = Lazy::new(|| AppStrategyArgs {
    top_level_domain: "dev".to_string(),
    author: "switchboard".to_string(),
    app_name: "switchboard".to_string(),
});

const CONFIG_FILE_NAME: &str = "switchboard.toml";
const ENV_PREFIX: &str = "SWITCHBOARD";

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to load settings: {0}")]
    Load(#[from] config::ConfigError),
    #[error("Settings file not found: {0}")]
    MissingFile(PathBuf),
}

/// How discovered provider commands are exposed to the client.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RouterMode {
    /// Every call goes through the single router tool.
    #[default]
    Proxy,
    /// Learned provider commands are also registered as top-level tools.
    Flatten,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    /// Name reported in `initialize`.
    pub name: String,
    pub version: String,
    /// Name of the one tool this server exposes.
    pub tool_name: String,
    /// Extension id of this server. It is never listed as a provider and is
    /// the client name used when talking to providers.
    pub self_id: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            name: "Azure".to_string(),
            version: "1.0.0".to_string(),
            tool_name: "azure".to_string(),
            self_id: "mcp.azure".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExtensionSettings {
    /// The extension manager executable, also used to launch provider servers.
    pub program: String,
    pub tags: Vec<String>,
    /// Prefix stripped from extension ids to form provider ids.
    pub id_prefix: String,
}

impl Default for ExtensionSettings {
    fn default() -> Self {
        Self {
            program: "azd".to_string(),
            tags: vec!["azure".to_string(), "mcp".to_string()],
            id_prefix: "mcp.".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ManifestSettings {
    /// Replaces the bundled remote provider manifest when set.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RouterSettings {
    pub mode: RouterMode,
    /// Allow asking a sampling-capable client to resolve intents.
    pub sampling: bool,
    pub sampling_max_tokens: u32,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            mode: RouterMode::Proxy,
            sampling: true,
            sampling_max_tokens: 1000,
        }
    }
}

/// Layered settings: built-in defaults, then a TOML file, then
/// `SWITCHBOARD_<SECTION>__<KEY>` environment variables.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub extensions: ExtensionSettings,
    pub manifest: ManifestSettings,
    pub router: RouterSettings,
}

impl Settings {
    /// Load settings. An explicit `path` must exist, the default location in
    /// the platform config directory is optional.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let mut builder = Config::builder();

        match path {
            Some(path) => {
                if !path.exists() {
                    return Err(SettingsError::MissingFile(path.to_path_buf()));
                }
                builder = builder.add_source(File::from(path).format(FileFormat::Toml));
            }
            None => {
                if let Some(default_path) = default_config_path() {
                    builder = builder.add_source(
                        File::from(default_path)
                            .format(FileFormat::Toml)
                            .required(false),
                    );
                }
            }
        }

        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("extensions.tags"),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

/// `switchboard.toml` in the platform config directory, if a home
/// directory can be determined.
pub fn default_config_path() -> Option<PathBuf> {
    choose_app_strategy(APP_STRATEGY.clone())
        .ok()
        .map(|strategy| strategy.in_config_dir(CONFIG_FILE_NAME))
}
