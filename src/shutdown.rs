//! Cancellation and graceful-deadline helpers.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::warn;

/// Default per-session graceful stop budget, bounded below any OS-imposed
/// service-stop deadline.
pub const DEFAULT_GRACEFUL_STOP: Duration = Duration::from_secs(25);

/// Resolves when the process receives ctrl-c or, on Unix, SIGTERM.
pub async fn signal_received() {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

/// Await a set of task handles, giving up (and aborting the stragglers)
/// once the deadline passes. Slow tasks never block each other: the
/// deadline is shared, not sequential.
pub async fn join_with_deadline(handles: Vec<JoinHandle<()>>, deadline: Duration, what: &str) {
    let aborts: Vec<_> = handles.iter().map(|handle| handle.abort_handle()).collect();
    let all = futures::future::join_all(handles.into_iter().map(|handle| async move {
        if let Err(error) = handle.await {
            if !error.is_cancelled() {
                warn!(message = "Task ended abnormally during shutdown.", %error);
            }
        }
    }));
    if tokio::time::timeout(deadline, all).await.is_err() {
        warn!(
            message = "Graceful deadline exceeded; aborting remaining tasks.",
            component = what,
        );
        for abort in aborts {
            abort.abort();
        }
    }
}
