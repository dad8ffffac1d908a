// External crates
use tokio_util::sync::CancellationToken;

/// Process-wide shutdown coordinator. The root token is cancelled exactly
/// once (signal handler or fatal error); every subsystem derives a child
/// token from it and propagates that to its spawned tasks.
#[derive(Debug, Clone)]
pub struct Shutdown {
    root: CancellationToken,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
        }
    }

    /// Child token for one subsystem.
    pub fn subscribe(&self) -> CancellationToken {
        self.root.child_token()
    }

    pub fn trigger(&self) {
        self.root.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.root.is_cancelled()
    }

    pub async fn wait(&self) {
        self.root.cancelled().await;
    }

    /// Spawn the ctrl-c / SIGTERM listener that triggers the root token.
    pub fn listen_for_signals(&self) {
        let shutdown = self.clone();
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            #[cfg(unix)]
            {
                let mut sigterm = match tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::terminate(),
                ) {
                    Ok(sigterm) => sigterm,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to install SIGTERM handler");
                        return;
                    }
                };
                tokio::select! {
                    _ = ctrl_c => tracing::info!("CTRL+C received, shutting down"),
                    _ = sigterm.recv() => tracing::info!("SIGTERM received, shutting down"),
                }
            }
            #[cfg(not(unix))]
            {
                let _ = ctrl_c.await;
                tracing::info!("CTRL+C received, shutting down");
            }
            shutdown.trigger();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_reaches_all_subscribers() {
        let shutdown = Shutdown::new();
        let a = shutdown.subscribe();
        let b = shutdown.subscribe();
        assert!(!a.is_cancelled());

        shutdown.trigger();
        a.cancelled().await;
        b.cancelled().await;
        assert!(shutdown.is_triggered());
    }
}
