//! xseld - selection transfer engine
//!
//! Entry point for the engine binary. Runs the engine over the built-in
//! in-memory transport; deployments against a live display server supply
//! their own [`xseld::transport::DisplayTransport`] and embed
//! [`xseld::runtime::EventLoop`] directly.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use xseld::config::Config;
use xseld::engine::{EngineOptions, FileStore, SelectionEngine};
use xseld::runtime::{install_signal_cancellation, EventLoop};
use xseld::telemetry::init_logging;
use xseld::transport::{DisplayTransport, LoopbackTransport};

/// Command-line arguments for xseld
#[derive(Parser, Debug)]
#[command(name = "xseld")]
#[command(version, about = "Selection transfer engine", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<String>,

    /// Selection to track (repeatable, overrides config)
    #[arg(short, long = "selection", env = "XSELD_SELECTIONS", value_delimiter = ',')]
    pub selections: Option<Vec<String>>,

    /// Chunked-transfer chunk size in bytes (overrides config)
    #[arg(long, env = "XSELD_CHUNK_SIZE")]
    pub chunk_size: Option<usize>,

    /// Claim tracked selections at startup
    #[arg(long)]
    pub claim: bool,

    /// Verbose logging (can be specified multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log format (json|pretty|compact)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,

    /// Write logs to file instead of stdout
    #[arg(long)]
    pub log_file: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Resolve config path: CLI flag, then XDG default.
    // Silently fall back to defaults if no config file exists yet.
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| xseld::config::default_config_path().display().to_string());
    let config = Config::load(&config_path).unwrap_or_else(|_| Config::default_config());

    // CLI args override config.logging
    let level = match args.verbose {
        0 => config.logging.level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    let format = if args.log_format == "pretty" {
        config.logging.format.clone()
    } else {
        args.log_format.clone()
    };
    let log_file = args.log_file.clone().or_else(|| config.logging.file.clone());
    init_logging(&level, &format, log_file.as_deref())?;

    info!("════════════════════════════════════════════════════════");
    info!("  xseld v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "  Built: {} {}",
        option_env!("BUILD_DATE").unwrap_or("unknown"),
        option_env!("BUILD_TIME").unwrap_or("")
    );
    info!(
        "  Commit: {}",
        option_env!("GIT_HASH").unwrap_or("vendored")
    );
    info!("════════════════════════════════════════════════════════");

    let config = config
        .with_overrides(args.selections.clone(), args.chunk_size, args.claim);
    config.validate()?;
    tracing::debug!("Config: {:?}", config);

    let payload_dir = config
        .payload
        .dir
        .clone()
        .unwrap_or_else(|| std::path::PathBuf::from("."));

    let options = EngineOptions {
        selections: config.engine.selections.clone(),
        chunk_size: config.engine.chunk_size,
        native_target: config.engine.native_target.clone(),
        text_payload: config.payload.text.clone(),
        claim_on_start: config.engine.claim_on_start,
    };

    let transport: Arc<dyn DisplayTransport> = Arc::new(LoopbackTransport::new());
    info!("Connected to display transport: {}", transport.name());

    let mut engine =
        match SelectionEngine::new(Arc::clone(&transport), FileStore::new(payload_dir), options)
            .await
        {
            Ok(engine) => engine,
            Err(e) => {
                error!("Engine initialization failed: {e}");
                return Err(e).context("engine initialization");
            }
        };
    engine.bootstrap().await.context("selection bootstrap")?;

    let cancel = install_signal_cancellation().context("installing signal handlers")?;
    let event_loop = EventLoop::new(engine, transport, cancel);

    match event_loop.run().await {
        Ok((exit, _stats)) => {
            info!("Engine stopped: {exit:?}");
            Ok(())
        }
        Err(e) => {
            error!("Engine exited with error: {e}");
            Err(e).context("event loop")
        }
    }
}
