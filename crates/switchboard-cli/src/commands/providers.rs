use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use console::style;
use switchboard::registry::LaunchSpec;
use switchboard::{
    BundledManifest, CliExtensionManager, ProviderDescriptor, ProviderRegistry, Settings,
};

fn source(provider: &ProviderDescriptor) -> &str {
    match &provider.launch {
        LaunchSpec::Extension { extension_id, .. } => extension_id,
        LaunchSpec::Remote { url } => url,
    }
}

fn version(provider: &ProviderDescriptor) -> String {
    match (&provider.installed_version, provider.installed) {
        (_, false) => "not installed".to_string(),
        (Some(installed), true) if provider.needs_upgrade() => {
            let latest = provider
                .latest_version
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default();
            format!("{installed} (latest {latest})")
        }
        (Some(installed), true) => installed.to_string(),
        (None, true) => "-".to_string(),
    }
}

/// Run one discovery and print what the router would offer.
pub async fn list_providers(config: Option<&Path>, json: bool) -> Result<()> {
    let settings = Settings::load(config)?;
    let manager = Arc::new(CliExtensionManager::from_settings(&settings.extensions));
    let registry = ProviderRegistry::new(
        manager,
        BundledManifest::from_settings(&settings)?,
        &settings,
    );
    let catalog = registry.discover().await?;

    if json {
        println!("{}", catalog.listing());
        return Ok(());
    }

    if catalog.is_empty() {
        println!("{}", style("No providers found").yellow());
        return Ok(());
    }
    for provider in catalog.iter() {
        println!(
            "{} {}",
            style(&provider.id).cyan().bold(),
            style(version(provider)).dim()
        );
        println!("  {}", source(provider));
        if !provider.description.is_empty() {
            println!("  {}", provider.description);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard::registry::parse_version;

    fn extension(installed: &str, latest: &str, is_installed: bool) -> ProviderDescriptor {
        ProviderDescriptor {
            id: "storage".into(),
            display_name: "storage".into(),
            description: "Azure Storage".into(),
            launch: LaunchSpec::Extension {
                extension_id: "mcp.storage".into(),
                namespace: "mcp.storage".into(),
                command: "azd".into(),
            },
            installed_version: parse_version(installed),
            latest_version: parse_version(latest),
            installed: is_installed,
        }
    }

    #[test]
    fn test_version_column() {
        assert_eq!(version(&extension("0.1.0", "0.1.0", true)), "0.1.0");
        assert_eq!(
            version(&extension("0.1.0", "0.2.0", true)),
            "0.1.0 (latest 0.2.0)"
        );
        assert_eq!(version(&extension("", "0.2.0", false)), "not installed");
        assert_eq!(source(&extension("0.1.0", "0.1.0", true)), "mcp.storage");
    }
}
