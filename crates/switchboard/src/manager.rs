use std::process::Output;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;

use crate::config::ExtensionSettings;

/// One entry of the extension manager's listing.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionRecord {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub latest_version: String,
    #[serde(default)]
    pub installed: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Error, Debug)]
pub enum ExtensionManagerError {
    #[error("failed to run '{command}': {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("'{command}' failed with {status}\n{output}")]
    Failed {
        command: String,
        status: String,
        output: String,
    },
    #[error("failed to parse extension metadata: {0}")]
    Parse(#[from] serde_json::Error),
}

/// The external tool that lists, installs and upgrades provider extensions.
#[async_trait]
pub trait ExtensionManager: Send + Sync {
    async fn list(&self) -> Result<Vec<ExtensionRecord>, ExtensionManagerError>;
    async fn install(&self, extension_id: &str) -> Result<(), ExtensionManagerError>;
    async fn upgrade(&self, extension_id: &str) -> Result<(), ExtensionManagerError>;
}

/// Drives `azd ext ...` (or whichever program is configured) as a subprocess.
pub struct CliExtensionManager {
    program: String,
    tags: Vec<String>,
}

impl CliExtensionManager {
    pub fn new<S: Into<String>>(program: S, tags: Vec<String>) -> Self {
        Self {
            program: program.into(),
            tags,
        }
    }

    pub fn from_settings(settings: &ExtensionSettings) -> Self {
        Self::new(settings.program.clone(), settings.tags.clone())
    }

    fn list_args(&self) -> Vec<String> {
        vec![
            "ext".to_string(),
            "list".to_string(),
            "--tags".to_string(),
            self.tags.join(","),
            "--output".to_string(),
            "json".to_string(),
        ]
    }

    /// Run the program to completion. `kill_on_drop` decides whether an
    /// abandoned call takes the child down with it.
    async fn run(&self, args: &[String], kill_on_drop: bool) -> Result<Output, ExtensionManagerError> {
        let command_line = format!("{} {}", self.program, args.join(" "));
        tracing::debug!(command = %command_line, "Running extension manager");

        let output = Command::new(&self.program)
            .args(args)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(kill_on_drop)
            .output()
            .await
            .map_err(|source| ExtensionManagerError::Launch {
                command: command_line.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ExtensionManagerError::Failed {
                command: command_line,
                status: output.status.to_string(),
                output: combined_output(&output),
            });
        }
        Ok(output)
    }
}

fn combined_output(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    text
}

#[async_trait]
impl ExtensionManager for CliExtensionManager {
    async fn list(&self) -> Result<Vec<ExtensionRecord>, ExtensionManagerError> {
        let output = self.run(&self.list_args(), true).await?;
        // stderr may carry update notices, only stdout holds the listing
        Ok(serde_json::from_slice(&output.stdout)?)
    }

    async fn install(&self, extension_id: &str) -> Result<(), ExtensionManagerError> {
        let args = ["ext".to_string(), "install".to_string(), extension_id.to_string()];
        self.run(&args, false).await.map(|_| ())
    }

    async fn upgrade(&self, extension_id: &str) -> Result<(), ExtensionManagerError> {
        let args = ["ext".to_string(), "upgrade".to_string(), extension_id.to_string()];
        self.run(&args, false).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_parses_manager_listing() {
        let records: Vec<ExtensionRecord> = serde_json::from_str(
            r#"[
                {
                    "id": "mcp.storage",
                    "description": "Azure Storage",
                    "namespace": "mcp.storage",
                    "version": "0.1.0",
                    "latestVersion": "0.2.0",
                    "installed": true,
                    "tags": ["azure", "mcp"],
                    "source": "azd"
                },
                {"id": "mcp.keyvault"}
            ]"#,
        )
        .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].latest_version, "0.2.0");
        assert!(records[0].installed);
        assert!(!records[1].installed);
        assert_eq!(records[1].namespace, "");
    }

    #[test]
    fn test_list_args_join_tags() {
        let manager = CliExtensionManager::new("azd", vec!["azure".into(), "mcp".into()]);
        assert_eq!(
            manager.list_args().join(" "),
            "ext list --tags azure,mcp --output json"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_list_through_a_real_program() {
        // `echo` prints its arguments back, which is not a JSON listing
        let manager = CliExtensionManager::new("echo", vec!["azure".into()]);
        assert!(matches!(
            manager.list().await,
            Err(ExtensionManagerError::Parse(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_carries_output() {
        let manager = CliExtensionManager::new("false", vec![]);
        match manager.install("mcp.storage").await {
            Err(ExtensionManagerError::Failed { command, .. }) => {
                assert_eq!(command, "false ext install mcp.storage");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_a_launch_error() {
        let manager = CliExtensionManager::new("no-such-extension-manager", vec![]);
        assert!(matches!(
            manager.list().await,
            Err(ExtensionManagerError::Launch { .. })
        ));
    }
}
