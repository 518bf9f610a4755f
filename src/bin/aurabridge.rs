//! aurabridge: multimodal acquisition service
//!
//! Usage:
//!   aurabridge                               → serve on 127.0.0.1:5556
//!   aurabridge --bind lan --port 6000        → serve on every interface
//!   aurabridge --config aurabridge.toml      → load settings from TOML
//!   aurabridge --dump-config                 → print the effective config and exit

use aurabridge::{logging, AppConfig};
use aurabridge_acquisition::{Collaborators, SessionController};
use aurabridge_core::BindMode;
use aurabridge_gateway::{start_gateway, GatewayState};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(
    name = "aurabridge",
    about = "Multimodal data acquisition service with a WebSocket control channel",
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port for the control channel
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind mode: lan or loopback
    #[arg(short, long)]
    bind: Option<String>,

    /// Output root (or set AURABRIDGE_OUTPUT)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Initial participant name
    #[arg(long)]
    participant: Option<String>,

    /// Write logs to a file (in addition to stderr)
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Print the effective config as TOML and exit
    #[arg(long, default_value_t = false)]
    dump_config: bool,
}

impl Cli {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(port) = self.port {
            config.gateway.port = port;
        }
        if let Some(bind) = &self.bind {
            config.gateway.bind = match bind.as_str() {
                "loopback" | "localhost" | "127.0.0.1" => BindMode::Loopback,
                _ => BindMode::Lan,
            };
        }
        if let Some(output) = &self.output {
            config.session.output_root = output.clone();
        }
        if let Some(participant) = &self.participant {
            config.session.participant = participant.clone();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = logging::init(cli.log_file.as_deref())?;

    let mut config = match &cli.config {
        Some(path) => AppConfig::load(path),
        None => AppConfig::default(),
    };
    config.apply_env();
    cli.apply(&mut config);
    config.validate()?;

    if cli.dump_config {
        print!("{}", config.to_toml());
        return Ok(());
    }

    info!("Output root: {}", config.session.output_root.display());
    info!("Participant: {}", config.session.participant);

    let collaborators = Collaborators::simulated(&config.sources, &config.camera);
    let controller = Arc::new(SessionController::new(config.controller_config(), collaborators));
    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let state = Arc::new(GatewayState::new(controller.clone(), shutdown.clone()));
    let served = start_gateway(&config.gateway, state).await;
    shutdown.cancel();

    // Idempotent: a `shutdown` command may already have done this.
    if let Err(e) = controller.shutdown().await {
        error!("Shutdown incomplete: {}", e);
    }
    served
}

/// Cancel on Ctrl-C or SIGTERM.
async fn watch_signals(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
        _ = shutdown.cancelled() => return,
    }
    shutdown.cancel();
}
