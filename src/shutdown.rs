//! Signal handling

use tokio_util::sync::CancellationToken;

/// Why we are shutting down
#[derive(Debug, Clone, Copy)]
pub enum ShutdownReason {
    CtrlC,
    Sigterm,
}

/// Cancel `token` on Ctrl+C or SIGTERM, whichever comes first.
///
/// Returns `None` if the token was cancelled for some other reason.
pub async fn wait_for_signal(token: CancellationToken) -> Option<ShutdownReason> {
    let reason = tokio::select! {
        _ = token.cancelled() => return None,
        _ = tokio::signal::ctrl_c() => ShutdownReason::CtrlC,
        _ = sigterm() => ShutdownReason::Sigterm,
    };
    token.cancel();
    Some(reason)
}

/// Wait for SIGTERM on Unix. On other platforms this never completes.
#[cfg(unix)]
async fn sigterm() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sig) => {
            sig.recv().await;
        }
        Err(e) => {
            tracing::debug!(error = %e, "cannot listen for SIGTERM");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn sigterm() {
    std::future::pending::<()>().await;
}
