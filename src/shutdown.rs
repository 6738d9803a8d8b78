use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install a SIGTERM/SIGINT handler for the worker daemon.
///
/// Returns a `CancellationToken` cancelled on either signal; the daemon
/// loop watches it and finishes the in-flight job before exiting.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let signalled = token.clone();

    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down"),
            _ = sigint.recv() => tracing::info!("Received SIGINT, shutting down"),
        }
        signalled.cancel();
    });

    token
}
