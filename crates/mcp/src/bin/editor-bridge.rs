// Editor bridge binary: MCP on stdio, editor over TCP

use anyhow::{Context, Result};
use clap::Parser;
use editor_bridge_core::BridgeConfig;
use editor_bridge_mcp::{LifecycleCoordinator, McpServer, ShutdownCause};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "editor-bridge", version)]
#[command(about = "Bridge between MCP clients and a running editor", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "editor-bridge.toml")]
    config: PathBuf,

    /// Base TCP port of the editor
    #[arg(short, long, env = "EDITOR_TCP_PORT")]
    port: Option<u16>,

    /// Runtime mode; `development` enables verbose diagnostics
    #[arg(long, env = "EDITOR_BRIDGE_ENV")]
    mode: Option<String>,

    /// Client name used when the MCP client does not send one
    #[arg(long, env = "MCP_CLIENT_NAME")]
    client_name: Option<String>,

    /// Write logs to this file instead of stderr
    #[arg(long, env = "EDITOR_BRIDGE_LOG_FILE")]
    log_file: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = BridgeConfig::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    if let Some(port) = args.port {
        config.peer.port = port;
    }
    if let Some(mode) = args.mode.as_deref() {
        config.development = BridgeConfig::is_development_mode(mode);
    }
    if args.client_name.is_some() {
        config.client_name = args.client_name.clone();
    }

    init_tracing(args.log_file.as_deref(), config.development)?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
    let exit_code = runtime.block_on(run(config));

    // Pending stdin reads would otherwise keep the runtime alive.
    runtime.shutdown_background();
    std::process::exit(exit_code);
}

async fn run(config: BridgeConfig) -> i32 {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.peer.host,
        base_port = config.peer.port,
        development = config.development,
        "Editor bridge starting"
    );

    let lifecycle = LifecycleCoordinator::new(config);
    lifecycle.install_panic_hook();
    lifecycle.install_signal_handlers();
    lifecycle.start();

    let server = McpServer::new(lifecycle.clone());
    let serving = tokio::spawn(async move { server.run_stdio().await });

    let cause = tokio::select! {
        cause = lifecycle.wait_for_shutdown() => cause,
        served = serving => {
            let cause = match served {
                Ok(Ok(())) => ShutdownCause::StdinClosed,
                Ok(Err(e)) => ShutdownCause::Failure(e.to_string()),
                Err(e) => ShutdownCause::Failure(format!("server task failed: {e}")),
            };
            lifecycle.shutdown(cause);
            lifecycle.wait_for_shutdown().await
        }
    };

    tracing::info!(cause = %cause, "Editor bridge stopped");
    cause.exit_code()
}

fn init_tracing(log_file: Option<&Path>, development: bool) -> Result<()> {
    let default_filter = if development {
        "editor_bridge=debug"
    } else {
        "editor_bridge=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    // stdout carries the MCP protocol, so logs never go there.
    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .with_target(true)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .init();
        }
    }
    Ok(())
}
