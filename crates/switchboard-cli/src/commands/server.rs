use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use mcp_server::{ByteTransport, RouterService, Server};
use switchboard::{Settings, SwitchboardRouter};
use tokio::io::{stdin, stdout, AsyncRead, AsyncWrite};
use tokio::sync::Notify;

pub async fn run_server(config: Option<&Path>) -> Result<()> {
    let _guard = crate::logging::setup_logging("server")?;

    let settings = Settings::load(config)?;
    tracing::info!(
        tool = %settings.server.tool_name,
        mode = ?settings.router.mode,
        sampling = settings.router.sampling,
        "Starting MCP server"
    );
    let router = SwitchboardRouter::from_settings(&settings)?;

    let shutdown = Arc::new(Notify::new());
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        crate::signal::shutdown_signal().await;
        shutdown_clone.notify_one();
    });

    serve(router, stdin(), stdout(), shutdown.notified()).await
}

/// Serve one client until it hangs up or `shutdown` resolves.
///
/// Provider processes belong to their cached clients and are stopped when
/// the router is dropped on the way out.
pub async fn serve<R, W>(
    router: SwitchboardRouter,
    reader: R,
    writer: W,
    shutdown: impl Future<Output = ()>,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let server = Server::new(RouterService(router));
    let transport = ByteTransport::new(reader, writer);

    tracing::info!("Server initialized and ready to handle requests");

    tokio::select! {
        result = server.run(transport) => {
            tracing::info!("Client disconnected, shutting down");
            Ok(result?)
        }
        _ = shutdown => {
            tracing::info!("Shutdown requested");
            Ok(())
        }
    }
}
