//! lumend - The lumen display server daemon
//!
//! This is the main entry point for the lumend service.
//! It wires together all the components:
//! - Configuration loading
//! - Shared display state and the deferred buffer executor
//! - Session authorization policy
//! - IPC server

use anyhow::{Context, Result};
use clap::Parser;
use lumen_config::{ServerConfig, load_config_or_default};
use lumen_core::{BufferExecutor, DisplayState, MediatorFactory, PolicyAuthorizer};
use lumen_ipc::{IpcServer, TransportSettings};
use lumen_protocol::CURRENT_PROTOCOL_VERSION;
use lumen_util::default_config_path;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// lumend - Display server session daemon
#[derive(Parser, Debug)]
#[command(name = "lumend")]
#[command(about = "Display server session daemon", long_about = None)]
struct Args {
    /// Configuration file path (default: ~/.config/lumen/lumen.toml)
    #[arg(short, long, default_value_os_t = default_config_path())]
    config: PathBuf,

    /// Socket path override (or set LUMEN_SOCKET env var)
    #[arg(short, long, env = "LUMEN_SOCKET")]
    socket: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

/// Main service state
struct Service {
    ipc: Arc<IpcServer>,
    executor: Arc<BufferExecutor>,
}

impl Service {
    async fn new(args: &Args, config: ServerConfig) -> Result<Self> {
        let socket_path = args
            .socket
            .clone()
            .unwrap_or_else(|| config.server.socket_path.clone());

        let executor = Arc::new(
            BufferExecutor::new().context("Failed to start the buffer executor thread")?,
        );
        let display = Arc::new(DisplayState::default());
        let authorizer = Arc::new(PolicyAuthorizer::new(config.authorization.clone()));
        let factory = Arc::new(MediatorFactory::new(
            display,
            executor.clone(),
            authorizer.clone(),
        ));

        let settings = TransportSettings {
            send_timeout: config.transport.send_timeout,
            send_buffer_bytes: config.transport.send_buffer_bytes,
        };
        let mut ipc = IpcServer::new(&socket_path, factory, authorizer, settings);
        ipc.start()
            .await
            .with_context(|| format!("Failed to listen on {:?}", socket_path))?;

        info!(socket_path = %socket_path.display(), "IPC server started");

        Ok(Self {
            ipc: Arc::new(ipc),
            executor,
        })
    }

    async fn run(self) -> Result<()> {
        // Spawn IPC accept task
        let ipc_accept = self.ipc.clone();
        let accept = tokio::spawn(async move {
            if let Err(e) = ipc_accept.run().await {
                error!(error = %e, "IPC server error");
            }
        });

        // Set up signal handlers
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to create SIGTERM handler")?;
        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to create SIGINT handler")?;
        let mut sighup =
            signal(SignalKind::hangup()).context("Failed to create SIGHUP handler")?;

        info!("Service running");

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
            _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully"),
            _ = sighup.recv() => info!("Received SIGHUP, shutting down gracefully"),
        }

        let executor = self.executor.clone();
        self.ipc.stop(move || executor.force_completion()).await;
        if let Err(e) = accept.await {
            error!(error = %e, "IPC accept task failed");
        }
        self.executor.shutdown();

        info!("Shutdown complete");
        Ok(())
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        protocol = %CURRENT_PROTOCOL_VERSION,
        "lumend starting"
    );

    let config = load_config_or_default(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    info!(
        config_path = %args.config.display(),
        io_threads = config.server.io_threads,
        "Configuration loaded"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.server.io_threads.max(1))
        .thread_name("lumen-io")
        .enable_all()
        .build()
        .context("Failed to build the I/O runtime")?;

    runtime.block_on(async {
        let service = Service::new(&args, config).await?;
        service.run().await
    })
}
