//! Runs the daemon around an already-initialized instrument.

use std::{future::Future, sync::Arc, time::Duration};

use smu_ipc::{IpcError, ServerLimits, SessionRegistry, serve_tcp};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::{
    dispatch::DaemonDispatcher, guard::InstrumentGuard, handlers::Handler,
    instrument::Instrument, monitor::PerformanceMonitor, stats::ReadStats,
};

#[derive(Debug, Clone, Copy)]
pub struct ServeOptions {
    pub max_sessions: usize,
    pub stats_interval: Duration,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            max_sessions: ServerLimits::default().max_sessions,
            stats_interval: crate::monitor::DEFAULT_INTERVAL,
        }
    }
}

/// Serves clients until `shutdown` resolves or the accept loop fails, then
/// closes every session and leaves the instrument safe.
pub async fn serve(
    listener: TcpListener,
    instrument: Instrument,
    options: ServeOptions,
    shutdown: impl Future<Output = ()>,
) -> Result<(), IpcError> {
    let stats = Arc::new(ReadStats::new());
    let guard = InstrumentGuard::spawn(instrument);
    let registry = SessionRegistry::spawn();
    let monitor = PerformanceMonitor::new(Arc::clone(&stats), options.stats_interval).spawn();

    let handler = Handler::new(guard.clone(), stats, registry.clone());
    let dispatcher = Arc::new(DaemonDispatcher::from(handler));
    let limits = ServerLimits {
        max_sessions: options.max_sessions,
    };

    let outcome = tokio::select! {
        result = serve_tcp(listener, dispatcher, registry.clone(), limits) => result,
        () = shutdown => {
            info!("shutdown requested");
            Ok(())
        }
    };
    if let Err(err) = &outcome {
        error!(error = %err, "accept loop failed");
    }

    close_sessions(&registry).await;
    monitor.abort();
    if let Err(err) = guard.shutdown().await {
        error!(error = %err, "instrument shutdown failed");
    }
    info!("server cleanup completed");
    outcome
}

/// Logs every connected peer, then signals all sessions to stop.
async fn close_sessions(registry: &SessionRegistry) -> usize {
    for (session, peer) in registry.peers().await {
        info!(%session, %peer, "closing client session");
    }
    let closed = registry.close_all().await;
    info!(sessions = closed, "client sessions closed");
    closed
}
