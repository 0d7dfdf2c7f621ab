//! QueueProcessor — claims READY executions and feeds the worker pool.
//!
//! One poll task claims batches from the store (READY → DISPATCHING in a
//! single write transaction), paces hand-off through the rate limiter, and
//! pushes ids into a bounded channel. A fixed pool of workers drains the
//! channel and runs the dispatcher. The enable flag is checked before every
//! claim; flipping it never touches work already handed off.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use flowgrid_core::config::QueueConfig;
use flowgrid_metrics::DispatchMetrics;
use flowgrid_state::{ExecutionId, StateStore, Status};

use crate::dispatcher::ExecutionDispatcher;
use crate::events::EventBus;
use crate::rate_limiter::RateLimiter;

struct Running {
    shutdown_tx: watch::Sender<bool>,
    poll: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

/// Everything the poll task needs, cloned into it at start.
#[derive(Clone)]
struct PollContext {
    store: StateStore,
    limiter: Arc<RateLimiter>,
    events: EventBus,
    metrics: Arc<DispatchMetrics>,
    enabled: Arc<AtomicBool>,
    batch_size: usize,
    poll_interval: Duration,
}

pub struct QueueProcessor {
    store: StateStore,
    dispatcher: Arc<ExecutionDispatcher>,
    limiter: Arc<RateLimiter>,
    events: EventBus,
    metrics: Arc<DispatchMetrics>,
    config: QueueConfig,
    enabled: Arc<AtomicBool>,
    running: Mutex<Option<Running>>,
}

impl QueueProcessor {
    pub fn new(
        store: StateStore,
        dispatcher: Arc<ExecutionDispatcher>,
        events: EventBus,
        metrics: Arc<DispatchMetrics>,
        config: QueueConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            limiter: Arc::new(RateLimiter::new(config.rate_limit_per_sec)),
            events,
            metrics,
            enabled: Arc::new(AtomicBool::new(config.enabled)),
            config,
            running: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Toggle claiming. In-flight dispatches are not affected.
    pub fn set_enabled(&self, enabled: bool) {
        let previous = self.enabled.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            info!(enabled, "queue processing toggled");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Spawn the poll task and the worker pool. Returns `false` if already running.
    pub async fn start(&self) -> bool {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return false;
        }

        let pool_size = self.config.worker_pool_size.max(1);
        let (tx, rx) = mpsc::channel::<ExecutionId>(pool_size);
        let rx = Arc::new(Mutex::new(rx));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let workers = (0..pool_size)
            .map(|worker| {
                let rx = rx.clone();
                let dispatcher = self.dispatcher.clone();
                tokio::spawn(async move { run_worker(worker, rx, dispatcher).await })
            })
            .collect();

        let ctx = PollContext {
            store: self.store.clone(),
            limiter: self.limiter.clone(),
            events: self.events.clone(),
            metrics: self.metrics.clone(),
            enabled: self.enabled.clone(),
            batch_size: self.config.batch_size.max(1),
            poll_interval: Duration::from_millis(self.config.poll_interval_ms.max(1)),
        };
        let poll = tokio::spawn(async move { run_poll_loop(ctx, tx, shutdown_rx).await });

        *running = Some(Running {
            shutdown_tx,
            poll,
            workers,
        });
        info!(
            workers = pool_size,
            batch_size = self.config.batch_size,
            rate_limit = self.config.rate_limit_per_sec,
            "queue processor started"
        );
        true
    }

    /// Stop claiming, let workers finish what was handed off (bounded by
    /// the shutdown timeout), then force-stop whatever is left.
    pub async fn shutdown(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        let _ = running.shutdown_tx.send(true);

        let timeout = Duration::from_secs(self.config.shutdown_timeout_secs);
        let aborts: Vec<_> = running.workers.iter().map(|w| w.abort_handle()).collect();
        let drained = tokio::time::timeout(timeout, async {
            for worker in running.workers {
                let _ = worker.await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(timeout_secs = timeout.as_secs(), "workers did not drain in time, aborting");
            for abort in aborts {
                abort.abort();
            }
        }

        running.poll.abort();
        info!("queue processor stopped");
    }
}

async fn run_worker(
    worker: usize,
    rx: Arc<Mutex<mpsc::Receiver<ExecutionId>>>,
    dispatcher: Arc<ExecutionDispatcher>,
) {
    loop {
        let next = rx.lock().await.recv().await;
        match next {
            Some(id) => {
                debug!(worker, execution_id = id, "dispatch picked up");
                dispatcher.dispatch(id).await;
            }
            None => break,
        }
    }
    debug!(worker, "dispatch worker exiting");
}

/// Put ids that were claimed but never handed off back to READY.
fn requeue_unsent(ctx: &PollContext, ids: &[ExecutionId]) {
    for &id in ids {
        match ctx
            .store
            .transition_execution(id, Status::Dispatching, |e| e.status = Status::Ready)
        {
            Ok(Some(_)) => debug!(execution_id = id, "unsent execution requeued"),
            Ok(None) => {}
            Err(e) => error!(execution_id = id, error = %e, "failed to requeue unsent execution"),
        }
    }
}

async fn run_poll_loop(
    ctx: PollContext,
    tx: mpsc::Sender<ExecutionId>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("queue poll loop starting");
    loop {
        if *shutdown.borrow() {
            break;
        }

        let claimed = if ctx.enabled.load(Ordering::SeqCst) {
            match ctx
                .store
                .claim_batch(ctx.batch_size, Status::Ready, Status::Dispatching)
            {
                Ok(ids) => ids,
                Err(e) => {
                    error!(error = %e, "failed to claim executions");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        if !claimed.is_empty() {
            ctx.metrics.record_claimed(claimed.len());
        }

        for (index, &id) in claimed.iter().enumerate() {
            tokio::select! {
                _ = ctx.limiter.acquire() => {}
                _ = shutdown.changed() => {
                    requeue_unsent(&ctx, &claimed[index..]);
                    debug!("queue poll loop shutting down");
                    return;
                }
            }
            ctx.events.publish(id, Status::Ready, Status::Dispatching);
            tokio::select! {
                sent = tx.send(id) => {
                    if sent.is_err() {
                        warn!(execution_id = id, "worker pool gone, requeueing");
                        requeue_unsent(&ctx, &claimed[index..]);
                        return;
                    }
                }
                _ = shutdown.changed() => {
                    requeue_unsent(&ctx, &claimed[index..]);
                    debug!("queue poll loop shutting down");
                    return;
                }
            }
        }

        // A full batch suggests more is waiting.
        if claimed.len() >= ctx.batch_size {
            tokio::task::yield_now().await;
            continue;
        }

        tokio::select! {
            _ = tokio::time::sleep(ctx.poll_interval) => {}
            _ = shutdown.changed() => break,
        }
    }
    debug!("queue poll loop shutting down");
}
