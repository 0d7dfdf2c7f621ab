//! flowgrid-cleanup — periodic reconciliation of stuck work.
//!
//! Two independent sweeps, each on its own interval:
//!
//! - [`StaleExecutionReaper`] cancels executions that overstay an in-flight
//!   status and deletes their containers.
//! - [`ContainerSweeper`] deletes flow containers older than a maximum age,
//!   whatever the state of their execution.
//!
//! Both talk to the rest of the engine only through the execution store,
//! the router's cancel operation, and the orchestrator.

pub mod containers;
pub mod reaper;

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

pub use containers::ContainerSweeper;
pub use reaper::{StaleExecutionReaper, SweepReport, REAPED_STATUSES};

/// Run `sweep` every `interval` until shutdown is signalled.
pub async fn run_periodically<F, Fut>(
    name: &'static str,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut sweep: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    debug!(sweep = name, interval_secs = interval.as_secs(), "sweep loop starting");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => sweep().await,
            _ = shutdown.changed() => {
                debug!(sweep = name, "sweep loop shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn runs_until_shutdown() {
        let runs = Arc::new(AtomicU32::new(0));
        let (tx, rx) = watch::channel(false);
        let counter = runs.clone();
        let handle = tokio::spawn(run_periodically("test", Duration::from_millis(10), rx, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));
        tokio::time::sleep(Duration::from_millis(55)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
        let seen = runs.load(Ordering::SeqCst);
        assert!(seen >= 2, "ran {seen} times");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), seen);
    }
}
