//! Event Dispatch & Cancellation Loop
//!
//! Single task pulling protocol events from the transport and racing
//! against a cancellation channel. Each iteration checks cancellation,
//! then connection health, then polls for at most one event; when idle it
//! sleeps one short interval to stay responsive without spinning. Events
//! are processed strictly in delivery order.
//!
//! Cancellation arrives as a signal number on an mpsc channel injected at
//! construction; the signal handlers' only job is one non-blocking send
//! into that channel. On cancellation the loop exits without attempting to
//! complete in-flight transfers — partial transfers are abandoned and
//! handles closed by engine teardown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::engine::error::{EngineError, Result};
use crate::engine::payload::PayloadStore;
use crate::engine::SelectionEngine;
use crate::telemetry::TransferStats;
use crate::transport::{DisplayTransport, TransportError};

/// Idle poll cadence. Short enough to stay responsive to signals, long
/// enough not to spin.
pub const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Cancellation signal observed (carries the signal number).
    Cancelled(i32),
}

/// The engine's event loop.
pub struct EventLoop<S: PayloadStore> {
    engine: SelectionEngine<S>,
    transport: Arc<dyn DisplayTransport>,
    cancel: mpsc::Receiver<i32>,
}

impl<S: PayloadStore> EventLoop<S> {
    /// Wire an engine to its transport and cancellation channel.
    pub fn new(
        engine: SelectionEngine<S>,
        transport: Arc<dyn DisplayTransport>,
        cancel: mpsc::Receiver<i32>,
    ) -> Self {
        Self {
            engine,
            transport,
            cancel,
        }
    }

    /// Run until cancelled or a fatal failure. Returns the exit reason and
    /// the final counters; the engine is torn down either way.
    pub async fn run(mut self) -> Result<(LoopExit, TransferStats)> {
        info!("event loop running");
        loop {
            if let Ok(signum) = self.cancel.try_recv() {
                info!("cancellation signal ({signum}) received");
                let stats = self.engine.shutdown().await;
                return Ok((LoopExit::Cancelled(signum), stats));
            }

            if !self.transport.connection_ok() {
                let _ = self.engine.shutdown().await;
                return Err(EngineError::Transport(TransportError::ConnectionLost(
                    "connection health check failed".into(),
                )));
            }

            match self.engine.poll_once().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(POLL_INTERVAL).await,
                Err(e) => {
                    warn!("event loop terminating: {e}");
                    let _ = self.engine.shutdown().await;
                    return Err(e);
                }
            }
        }
    }
}

/// Install SIGINT/SIGTERM handlers that forward the signal number into the
/// returned cancellation channel.
///
/// The channel holds one pending signal per slot; if the loop has not yet
/// consumed a prior signal, further ones are dropped, which is fine — one
/// observation is enough to exit.
pub fn install_signal_cancellation() -> std::io::Result<mpsc::Receiver<i32>> {
    use tokio::signal::unix::{signal, SignalKind};

    let (tx, rx) = mpsc::channel(2);

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    let int_tx = tx.clone();
    tokio::spawn(async move {
        if interrupt.recv().await.is_some() {
            debug!("SIGINT caught");
            let _ = int_tx.try_send(libc_signum::SIGINT);
        }
    });
    tokio::spawn(async move {
        if terminate.recv().await.is_some() {
            debug!("SIGTERM caught");
            let _ = tx.try_send(libc_signum::SIGTERM);
        }
    });

    Ok(rx)
}

/// Signal numbers reported through the cancellation channel.
mod libc_signum {
    pub const SIGINT: i32 = 2;
    pub const SIGTERM: i32 = 15;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineOptions, MemoryStore};
    use crate::transport::LoopbackTransport;

    #[tokio::test]
    async fn test_loop_exits_on_cancellation() {
        let server = Arc::new(LoopbackTransport::new());
        let engine = SelectionEngine::new(
            Arc::clone(&server) as Arc<dyn DisplayTransport>,
            MemoryStore::new(),
            EngineOptions::default(),
        )
        .await
        .unwrap();

        let (tx, rx) = mpsc::channel(2);
        tx.try_send(15).unwrap();
        let event_loop = EventLoop::new(engine, server, rx);

        let (exit, _stats) = event_loop.run().await.unwrap();
        assert_eq!(exit, LoopExit::Cancelled(15));
    }

    #[tokio::test]
    async fn test_loop_fails_fatally_on_broken_connection() {
        let server = Arc::new(LoopbackTransport::new());
        let engine = SelectionEngine::new(
            Arc::clone(&server) as Arc<dyn DisplayTransport>,
            MemoryStore::new(),
            EngineOptions::default(),
        )
        .await
        .unwrap();

        server.disconnect();
        let (_tx, rx) = mpsc::channel(2);
        let event_loop = EventLoop::new(engine, server, rx);

        let err = event_loop.run().await.unwrap_err();
        assert!(err.is_fatal());
    }
}
