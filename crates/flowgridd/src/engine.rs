//! Assembles the dispatch engine from configuration.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use flowgrid_api::ApiState;
use flowgrid_autoscale::VpaRecommender;
use flowgrid_cleanup::{run_periodically, ContainerSweeper, StaleExecutionReaper};
use flowgrid_core::{ContainerOrchestrator, FlowgridConfig};
use flowgrid_dispatch::{
    ContainerBackend, DispatchAdmin, EventBus, ExecutionDispatcher, ExecutionRouter,
    FlowContainerGateway, PodRequestBuilder, PollBackend, QueueProcessor, ResourceSizer,
    StoreRegistry, VersionRegistry, VersionSetResolver,
};
use flowgrid_metrics::DispatchMetrics;
use flowgrid_rollout::DispatchCriteria;
use flowgrid_state::StateStore;

pub struct Engine {
    store: StateStore,
    events: EventBus,
    metrics: Arc<DispatchMetrics>,
    queue: Arc<QueueProcessor>,
    router: Arc<ExecutionRouter>,
    admin: DispatchAdmin,
    reaper: Arc<StaleExecutionReaper>,
    sweeper: Arc<ContainerSweeper>,
    cleanup_enabled: bool,
}

impl Engine {
    pub fn build(
        config: &FlowgridConfig,
        store: StateStore,
        orchestrator: Arc<dyn ContainerOrchestrator>,
        gateway: Arc<dyn FlowContainerGateway>,
    ) -> anyhow::Result<Self> {
        let events = EventBus::default();
        let metrics = Arc::new(DispatchMetrics::new());
        let criteria = Arc::new(DispatchCriteria::from_config(&config.rollout)?);
        let registry: Arc<dyn VersionRegistry> = Arc::new(StoreRegistry::new(store.clone()));

        let mut dispatcher = ExecutionDispatcher::new(
            store.clone(),
            VersionSetResolver::new(store.clone(), registry.clone(), &config.kubernetes),
            ResourceSizer::from_config(&config.resources),
            PodRequestBuilder::new(config.kubernetes.clone()),
            orchestrator.clone(),
            events.clone(),
            metrics.clone(),
        )
        .with_failure_policy(config.queue.failure_policy, config.queue.max_restart_attempts)
        .with_requeue_limit(config.queue.max_requeue_attempts);
        if config.vpa.enabled {
            let recommender = VpaRecommender::new(orchestrator.clone(), &config.vpa, &config.kubernetes)?;
            dispatcher = dispatcher.with_recommender(Arc::new(recommender));
            info!(prefix = %config.vpa.name_prefix, "autoscaler recommendations enabled");
        }

        let queue = Arc::new(QueueProcessor::new(
            store.clone(),
            Arc::new(dispatcher),
            events.clone(),
            metrics.clone(),
            config.queue.clone(),
        ));
        let router = Arc::new(ExecutionRouter::new(
            store.clone(),
            criteria.clone(),
            PollBackend::new(store.clone(), events.clone(), registry.clone()),
            ContainerBackend::new(store.clone(), events.clone(), registry, gateway),
        ));
        let admin = DispatchAdmin::new(queue.clone(), criteria);

        let reaper = Arc::new(StaleExecutionReaper::new(
            store.clone(),
            router.clone(),
            orchestrator.clone(),
            config.kubernetes.clone(),
            config.cleanup.clone(),
            metrics.clone(),
        )
        .with_restarts(events.clone(), config.queue.max_restart_attempts));
        let sweeper = Arc::new(ContainerSweeper::new(
            orchestrator,
            config.kubernetes.clone(),
            &config.cleanup,
            metrics.clone(),
        ));

        Ok(Self {
            store,
            events,
            metrics,
            queue,
            router,
            admin,
            reaper,
            sweeper,
            cleanup_enabled: config.cleanup.enabled,
        })
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            store: self.store.clone(),
            router: self.router.clone(),
            admin: self.admin.clone(),
            metrics: self.metrics.clone(),
        }
    }

    /// Start the queue processor, the sweeps, and the event logger.
    pub async fn start(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        self.queue.start().await;

        let mut handles = vec![tokio::spawn(log_events(self.events.subscribe(), shutdown.clone()))];

        if self.cleanup_enabled {
            let reaper = self.reaper.clone();
            handles.push(tokio::spawn(run_periodically(
                "stale-executions",
                reaper.interval(),
                shutdown.clone(),
                move || {
                    let reaper = reaper.clone();
                    async move {
                        reaper.sweep().await;
                    }
                },
            )));

            let sweeper = self.sweeper.clone();
            handles.push(tokio::spawn(run_periodically(
                "aged-containers",
                sweeper.interval(),
                shutdown,
                move || {
                    let sweeper = sweeper.clone();
                    async move {
                        sweeper.sweep().await;
                    }
                },
            )));
            info!("cleanup sweeps started");
        } else {
            info!("cleanup sweeps disabled");
        }
        handles
    }

    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
    }
}

async fn log_events(
    mut events: broadcast::Receiver<flowgrid_dispatch::ExecutionEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => debug!(
                    execution_id = event.execution_id,
                    from = %event.from,
                    to = %event.to,
                    "execution status changed"
                ),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event logger lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        }
    }
}
