//! Engine telemetry
//!
//! Structured-logging initialization for the binary and the transfer
//! counters reported at shutdown.

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Counters accumulated across one engine run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransferStats {
    /// Conversion requests we issued
    pub conversions_requested: u64,
    /// Conversion replies we consumed
    pub conversions_completed: u64,
    /// Conversions a remote owner refused
    pub refusals_received: u64,
    /// Selection requests we serviced as owner
    pub requests_served: u64,
    /// Requests we answered with a null property
    pub refusals_sent: u64,
    /// INCR chunks received
    pub chunks_in: u64,
    /// INCR chunks sent
    pub chunks_out: u64,
    /// Payload bytes received
    pub bytes_in: u64,
    /// Payload bytes sent
    pub bytes_out: u64,
}

impl TransferStats {
    /// Log the final status block at shutdown.
    pub fn log_summary(&self) {
        info!("transfer summary:");
        info!(
            "  conversions: {} requested, {} completed, {} refused",
            self.conversions_requested, self.conversions_completed, self.refusals_received
        );
        info!(
            "  served: {} requests ({} refused)",
            self.requests_served, self.refusals_sent
        );
        info!(
            "  chunks: {} in / {} out, bytes: {} in / {} out",
            self.chunks_in, self.chunks_out, self.bytes_in, self.bytes_out
        );
    }
}

/// Initialize the global tracing subscriber.
///
/// `level` is the default filter for this crate (everything else stays at
/// `warn`); `RUST_LOG` overrides when set. `format` is one of `pretty`,
/// `compact`, or `json`; `log_file` adds a plain-text sink alongside
/// stdout, falling back to stdout-only if the file cannot be created.
pub fn init_logging(level: &str, format: &str, log_file: Option<&str>) -> Result<()> {
    let level = match level {
        "trace" | "debug" | "info" | "warn" | "error" => level,
        _ => "info",
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("xseld={level},warn")));

    let file = log_file.and_then(|path| match std::fs::File::create(path) {
        Ok(f) => Some(f),
        Err(e) => {
            eprintln!("Warning: cannot create log file {path:?}: {e} — logging to console only");
            None
        }
    });

    if let Some(file) = file {
        match format {
            "json" => tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::io::stdout),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(file)
                        .with_ansi(false),
                )
                .init(),
            "compact" => tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .compact()
                        .with_writer(std::io::stdout),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .compact()
                        .with_writer(file)
                        .with_ansi(false),
                )
                .init(),
            _ => tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .pretty()
                        .with_writer(std::io::stdout),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(file)
                        .with_ansi(false),
                )
                .init(),
        }
    } else {
        match format {
            "json" => tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init(),
            "compact" => tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().compact())
                .init(),
            _ => tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init(),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_default_is_zeroed() {
        let stats = TransferStats::default();
        assert_eq!(stats.conversions_requested, 0);
        assert_eq!(stats.bytes_in + stats.bytes_out, 0);
    }
}
