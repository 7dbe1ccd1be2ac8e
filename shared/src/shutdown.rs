use std::time::Duration;

use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Sending half of the process-wide shutdown signal.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

/// Receiving half; cheap to clone into every background task.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is triggered or the trigger is dropped.
    pub async fn wait(&mut self) {
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}

/// Waits for SIGINT or SIGTERM.
pub async fn os_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT, shutting down"),
        () = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}

/// Waits for the HTTP server for at most `http_timeout`, then joins every
/// consumer without a bound so in-flight deliveries are settled.
pub async fn drain<E: std::fmt::Display>(
    server: JoinHandle<Result<(), E>>,
    workers: Vec<JoinHandle<()>>,
    http_timeout: Duration,
) {
    match tokio::time::timeout(http_timeout, server).await {
        Ok(Ok(Err(e))) => tracing::warn!(error = %e, "http server exited with error"),
        Ok(Err(e)) => tracing::warn!(error = %e, "http server task failed"),
        Ok(Ok(Ok(()))) => {}
        Err(_) => tracing::warn!("http drain timed out, dropping open connections"),
    }

    for worker in workers {
        if let Err(e) = worker.await {
            tracing::warn!(error = %e, "consumer task failed");
        }
    }
}
