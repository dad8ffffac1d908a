// Local crates
use crate::helpers::health::Health;

// External crates
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const MAX_RESTARTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(8);

/// Run a component, restarting it on failure with exponential backoff.
/// After the restart budget is spent the component is marked down in the
/// health registry and left stopped; a clean exit ends supervision quietly.
pub async fn supervised<F, Fut>(
    name: &'static str,
    cancel: CancellationToken,
    health: Arc<Health>,
    mut component: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let mut restarts = 0u32;
    let mut backoff = INITIAL_BACKOFF;
    health.set(name, true);

    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = component() => result,
        };
        match result {
            Ok(()) => break,
            Err(e) => {
                restarts += 1;
                if restarts > MAX_RESTARTS {
                    tracing::error!(
                        component = name,
                        error = %e,
                        restarts = restarts - 1,
                        "Component failed permanently, giving up"
                    );
                    health.set(name, false);
                    return;
                }
                tracing::warn!(
                    component = name,
                    error = %e,
                    attempt = restarts,
                    backoff_secs = backoff.as_secs(),
                    "Component failed, restarting after backoff"
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
    health.set(name, true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn restarts_then_gives_up_and_marks_unhealthy() {
        let health = Arc::new(Health::default());
        let attempts = Arc::new(AtomicU32::new(0));
        let counted = Arc::clone(&attempts);

        supervised("flaky", CancellationToken::new(), Arc::clone(&health), move || {
            let counted = Arc::clone(&counted);
            async move {
                counted.fetch_add(1, Ordering::Relaxed);
                anyhow::bail!("always broken")
            }
        })
        .await;

        // Initial run plus the full restart budget.
        assert_eq!(attempts.load(Ordering::Relaxed), MAX_RESTARTS + 1);
        assert!(!health.healthy());
    }

    #[tokio::test]
    async fn clean_exit_stays_healthy() {
        let health = Arc::new(Health::default());
        supervised("oneshot", CancellationToken::new(), Arc::clone(&health), || async {
            Ok(())
        })
        .await;
        assert!(health.healthy());
    }
}
