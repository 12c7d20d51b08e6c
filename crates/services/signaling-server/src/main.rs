//! Signaling server binary entry point
//!
//! Starts the WebSocket signaling server that negotiates WebRTC sessions
//! between producers and consumers.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: ws://0.0.0.0:8080, addressed routing
//! cargo run -p sigrelay-signaling-server
//!
//! # Load a config file, override the port
//! cargo run -p sigrelay-signaling-server -- \
//!   --config ./signaling.toml \
//!   --port 8443
//!
//! # Plain broadcast relay with JSON logs
//! cargo run -p sigrelay-signaling-server -- \
//!   --mode broadcast \
//!   --log-format json
//! ```

use anyhow::Context;
use clap::Parser;
use sigrelay_signaling::{RelayMode, SignalingConfig, SignalingServer};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// WebRTC Signaling Server
///
/// Registers peers, tracks offer/answer/ICE negotiation per session and
/// relays signaling envelopes over WebSocket.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file; flags below override its values
    #[arg(short, long, env = "SIGNALING_CONFIG")]
    config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long, env = "SIGNALING_HOST")]
    host: Option<String>,

    /// Port to bind to
    #[arg(short, long, env = "SIGNALING_PORT")]
    port: Option<u16>,

    /// Relay mode: 'addressed' routes by session, 'broadcast' copies every frame
    #[arg(short, long, env = "SIGNALING_MODE")]
    mode: Option<ModeArg>,

    /// Seconds a session may spend negotiating (0 disables the timeout)
    #[arg(long, env = "SIGNALING_NEGOTIATION_TIMEOUT_SECS")]
    negotiation_timeout_secs: Option<u64>,

    /// Maximum concurrently connected peers
    #[arg(long, env = "SIGNALING_MAX_PEERS")]
    max_peers: Option<usize>,

    /// Log output format
    #[arg(long, default_value = "text", env = "SIGNALING_LOG_FORMAT")]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum ModeArg {
    /// Route envelopes to the peer resolved from session state
    Addressed,
    /// Forward frames to every other peer
    Broadcast,
}

impl From<ModeArg> for RelayMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Addressed => RelayMode::Addressed,
            ModeArg::Broadcast => RelayMode::Broadcast,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per event
    Json,
}

impl Args {
    /// Load the config file (if any) and apply flag overrides
    fn into_config(self) -> anyhow::Result<SignalingConfig> {
        let mut config = match &self.config {
            Some(path) => SignalingConfig::from_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => SignalingConfig::default(),
        };

        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(mode) = self.mode {
            config.relay.mode = mode.into();
        }
        if let Some(timeout) = self.negotiation_timeout_secs {
            config.sessions.negotiation_timeout_secs = timeout;
        }
        if let Some(max_peers) = self.max_peers {
            config.server.max_peers = max_peers;
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_handler = Arc::clone(&shutdown_flag);

    ctrlc::set_handler(move || {
        eprintln!("\n[SIGNAL] Ctrl+C received, initiating shutdown...");

        let was_already_set = shutdown_flag_handler.swap(true, Ordering::SeqCst);
        if was_already_set {
            eprintln!("[SIGNAL] Shutdown already in progress, forcing immediate exit");
            std::process::exit(0);
        }

        // Watchdog for a stuck graceful shutdown
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(5));
            eprintln!("[WATCHDOG] Graceful shutdown timeout (5s), forcing exit");
            std::process::exit(0);
        });
    })
    .context("Failed to set Ctrl+C handler")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("signaling-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args, shutdown_flag))
}

async fn async_main(args: Args, shutdown_flag: Arc<AtomicBool>) -> anyhow::Result<()> {
    init_tracing(args.log_format);

    let config = args.into_config()?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %config.bind_addr(),
        mode = ?config.relay.mode,
        max_peers = config.server.max_peers,
        negotiation_timeout_secs = config.sessions.negotiation_timeout_secs,
        "Signaling server starting"
    );

    let server = SignalingServer::new(config)?;
    let handle = server.start().await?;
    info!("Signaling server ready on ws://{}", handle.local_addr());

    while !shutdown_flag.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    info!("Shutdown signal received, stopping signaling server...");
    handle.shutdown().await?;
    info!("Signaling server shut down gracefully");

    Ok(())
}

fn init_tracing(format: LogFormat) {
    // RUST_LOG wins; default to info
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}
