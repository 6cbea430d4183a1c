//! Stevedore — MCP gateway that runs registered MCP servers in isolated
//! subprocesses.
//!
//! Two subcommands:
//! - `stevedore serve`: Streamable HTTP MCP server exposing the gateway tools
//! - `stevedore stdio`: STDIO transport for STDIO-based MCP clients

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::http::Request;
use axum::response::IntoResponse;
use clap::{Parser, Subcommand};
use rmcp::ServiceExt;
use rmcp::transport::streamable_http_server::{
    StreamableHttpServerConfig, StreamableHttpService, session::local::LocalSessionManager,
};
use stevedore::{Gateway, GatewayMcpServer, GatewaySettings, Registry};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt as TowerServiceExt;
use tracing_subscriber::EnvFilter;

/// Stevedore — MCP gateway for container-isolated MCP servers.
#[derive(Parser)]
#[command(
    name = "stevedore",
    version,
    about = "Stevedore — MCP gateway for container-isolated MCP servers"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a Streamable HTTP MCP server exposing the gateway tools
    Serve {
        /// Path to servers.yaml registry [default: ./servers.yaml or ~/.config/stevedore/servers.yaml]
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// HTTP port to listen on
        #[arg(short, long, default_value = "3000")]
        port: u16,
        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },
    /// Bridge the gateway tools over STDIO (for STDIO-based MCP clients)
    Stdio {
        /// Path to servers.yaml registry [default: ./servers.yaml or ~/.config/stevedore/servers.yaml]
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity; logs go to stderr so the stdio
    // transport keeps stdout clean for protocol frames.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cancel = CancellationToken::new();

    // Ctrl-C handler — cancels the root token for graceful shutdown
    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Shutting down Stevedore...");
        cancel_for_signal.cancel();
    });

    match cli.command {
        Commands::Serve { config, port, host } => {
            let config = resolve_config(config)?;
            run_serve(config, host, port, cancel).await?;
        }
        Commands::Stdio { config } => {
            let config = resolve_config(config)?;
            run_stdio(config, cancel).await?;
        }
    }

    Ok(())
}

/// Start a Streamable HTTP MCP server exposing the gateway tools.
async fn run_serve(
    config_path: PathBuf,
    host: String,
    port: u16,
    cancel: CancellationToken,
) -> Result<()> {
    let gateway = build_gateway(&config_path).await?;
    gateway.start().await;
    let server = GatewayMcpServer::new(gateway.clone());

    let session_manager = Arc::new(LocalSessionManager::default());
    let http_config = StreamableHttpServerConfig {
        cancellation_token: cancel.clone(),
        ..Default::default()
    };
    let server_for_factory = server.clone();
    let mcp_service = StreamableHttpService::new(
        move || Ok(server_for_factory.clone()),
        session_manager,
        http_config,
    );

    let app = Router::new().fallback(move |req: Request<axum::body::Body>| {
        let svc = mcp_service.clone();
        async move { svc.oneshot(req).await.unwrap().into_response() }
    });

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", addr, e))?;

    tracing::info!(host = %host, port = %port, "Stevedore HTTP server listening");
    tracing::info!("Connect your MCP client to http://{}:{}/mcp", host, port);

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|e| anyhow::anyhow!("Stevedore HTTP server error: {}", e))?;

    // Stop the reaper and terminate every pooled subprocess before exit.
    gateway.shutdown().await;
    tracing::info!("Stevedore HTTP server stopped");
    Ok(())
}

/// Bridge the gateway tools over STDIO for STDIO-based MCP clients.
async fn run_stdio(config_path: PathBuf, cancel: CancellationToken) -> Result<()> {
    let gateway = build_gateway(&config_path).await?;
    gateway.start().await;
    let server = GatewayMcpServer::new(gateway.clone());

    let transport = (tokio::io::stdin(), tokio::io::stdout());
    let running = server
        .serve_with_ct(transport, cancel.clone())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to initialize stdio transport: {:?}", e))?;

    tracing::info!("Stevedore stdio transport initialized, waiting for messages");

    tokio::select! {
        result = running.waiting() => {
            match result {
                Ok(reason) => {
                    tracing::info!(?reason, "Stevedore stdio transport completed");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Stevedore stdio transport error");
                    gateway.shutdown().await;
                    return Err(anyhow::anyhow!("Stevedore stdio transport error: {}", e));
                }
            }
        }
        _ = cancel.cancelled() => {
            tracing::info!("Stevedore stdio transport cancelled");
        }
    }

    gateway.shutdown().await;
    Ok(())
}

/// Load the registry and assemble the gateway behind it.
async fn build_gateway(config_path: &Path) -> Result<Arc<Gateway>> {
    let registry = Registry::load(config_path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load registry {:?}: {}", config_path, e))?;
    tracing::info!(
        path = %config_path.display(),
        servers = registry.servers.len(),
        "registry loaded"
    );
    Ok(Arc::new(Gateway::new(
        Arc::new(registry),
        GatewaySettings::default(),
    )))
}

/// Resolve registry path: explicit flag → ./servers.yaml → ~/.config/stevedore/servers.yaml.
fn resolve_config(explicit: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }

    let local = Path::new("servers.yaml");
    if local.exists() {
        return Ok(local.to_path_buf());
    }

    if let Some(config_dir) = dirs::config_dir() {
        let xdg = config_dir.join("stevedore").join("servers.yaml");
        if xdg.exists() {
            return Ok(xdg);
        }
    }

    Err(anyhow::anyhow!(
        "No servers.yaml found. Searched ./servers.yaml and ~/.config/stevedore/servers.yaml. \
         Use --config to specify a path."
    ))
}
