//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers (SIGTERM, SIGINT, SIGHUP)
//! - Translate signals to [`SignalEvent`]s
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - A second SIGTERM/SIGINT forces an immediate exit
//! - SIGHUP triggers config reload, not shutdown

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Exit code used when a second interrupt forces shutdown.
const FORCED_EXIT_CODE: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    Shutdown,
    Reload,
}

/// Forward OS signals to `tx` from a background task.
#[cfg(unix)]
pub fn spawn_signal_handler(tx: mpsc::UnboundedSender<SignalEvent>) -> std::io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    Ok(tokio::spawn(async move {
        let mut shutdown_requests = 0u32;
        loop {
            let event = tokio::select! {
                result = tokio::signal::ctrl_c() => match result {
                    Ok(()) => SignalEvent::Shutdown,
                    Err(e) => {
                        tracing::error!(error = %e, "Ctrl+C handler failed");
                        return;
                    }
                },
                _ = terminate.recv() => SignalEvent::Shutdown,
                _ = hangup.recv() => SignalEvent::Reload,
            };
            if event == SignalEvent::Shutdown {
                shutdown_requests += 1;
                if shutdown_requests > 1 {
                    tracing::warn!("Second shutdown signal; exiting immediately");
                    std::process::exit(FORCED_EXIT_CODE);
                }
            }
            tracing::info!(?event, "Signal received");
            if tx.send(event).is_err() {
                return;
            }
        }
    }))
}

/// Forward Ctrl+C to `tx`; reload signals do not exist here.
#[cfg(not(unix))]
pub fn spawn_signal_handler(tx: mpsc::UnboundedSender<SignalEvent>) -> std::io::Result<JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Signal received");
            let _ = tx.send(SignalEvent::Shutdown);
            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(FORCED_EXIT_CODE);
            }
        }
    }))
}
