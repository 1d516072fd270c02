use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::commands::providers::list_providers;
use crate::commands::server::run_server;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Run the router as an MCP server
    #[command(about = "Run the router as an MCP server")]
    Server {
        #[command(subcommand)]
        command: ServerCommand,
    },

    /// Discover providers once and print them
    #[command(about = "Discover providers and print the catalog")]
    Providers {
        #[arg(short, long, value_name = "PATH", help = "Settings file to use")]
        config: Option<PathBuf>,

        #[arg(long, help = "Print the catalog as JSON")]
        json: bool,
    },

    #[command(about = "Print the version")]
    Version,
}

#[derive(Subcommand, Debug, PartialEq)]
enum ServerCommand {
    #[command(about = "Serve MCP over stdio")]
    Start {
        #[arg(short, long, value_name = "PATH", help = "Settings file to use")]
        config: Option<PathBuf>,
    },
}

pub async fn cli() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Server {
            command: ServerCommand::Start { config },
        } => run_server(config.as_deref()).await,
        Command::Providers { config, json } => list_providers(config.as_deref(), json).await,
        Command::Version => {
            println!("switchboard {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use test_case::test_case;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test_case(&["switchboard", "server", "start"], Command::Server { command: ServerCommand::Start { config: None } }; "server start")]
    #[test_case(&["switchboard", "server", "start", "--config", "/etc/sb.toml"], Command::Server { command: ServerCommand::Start { config: Some(PathBuf::from("/etc/sb.toml")) } }; "server start with config")]
    #[test_case(&["switchboard", "providers", "--json"], Command::Providers { config: None, json: true }; "providers as json")]
    #[test_case(&["switchboard", "version"], Command::Version; "version")]
    fn test_parse(args: &[&str], expected: Command) {
        let cli = Cli::try_parse_from(args).unwrap();
        assert_eq!(cli.command, expected);
    }

    #[test]
    fn test_server_needs_subcommand() {
        assert!(Cli::try_parse_from(["switchboard", "server"]).is_err());
    }
}
