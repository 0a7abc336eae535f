use tokio::sync::watch;
use tracing::info;

/// Graceful shutdown fan-out: one sender, any number of background tasks and
/// the HTTP acceptor watching for the flag to flip.
pub struct ShutdownCoordinator {
    tx: watch::Sender<bool>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Flip the flag; all subscribers observe it and wind down.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    /// Install SIGINT/SIGTERM handlers that trigger shutdown.
    pub fn install_signal_handlers(&self) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let ctrl_c = async {
                if tokio::signal::ctrl_c().await.is_err() {
                    tracing::warn!("failed to install SIGINT handler");
                    std::future::pending::<()>().await;
                }
            };

            #[cfg(unix)]
            let terminate = async {
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(mut signal) => {
                        signal.recv().await;
                    }
                    Err(_) => {
                        tracing::warn!("failed to install SIGTERM handler");
                        std::future::pending::<()>().await;
                    }
                }
            };

            #[cfg(not(unix))]
            let terminate = std::future::pending::<()>();

            tokio::select! {
                _ = ctrl_c => info!("received SIGINT, shutting down"),
                _ = terminate => info!("received SIGTERM, shutting down"),
            }
            let _ = tx.send(true);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_reaches_subscribers() {
        let coordinator = ShutdownCoordinator::new();
        let mut rx = coordinator.subscribe();
        assert!(!*rx.borrow());
        coordinator.trigger();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }
}
