use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    switchboard_cli::cli::cli().await
}
