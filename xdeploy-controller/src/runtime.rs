use std::sync::Arc;

use futures::{Stream, StreamExt};
use kube::Client;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    Result, XDeploymentRef,
    config::ControllerConfig,
    context::Context,
    controller::{Requeue, error_policy, reconcile},
    driver::{PodDriver, WorkloadDriver},
    error::ErrorClass,
    metrics::ControllerMetrics,
    queue::WorkQueue,
    store::{DesiredStateStore, KubeStore},
};

pub async fn start_xdeployment_controller(
    client: Client,
    namespace: Option<String>,
    config: ControllerConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let store = KubeStore::new(client.clone(), namespace.clone());
    let driver = PodDriver::new(client, namespace);
    Controller::new(store, driver, config).run(cancel).await
}

/// Feeds store and driver changes through a [`WorkQueue`] into a fixed pool
/// of reconcile workers
pub struct Controller<S, D> {
    ctx: Arc<Context<S, D>>,
    queue: Arc<WorkQueue<XDeploymentRef>>,
}

impl<S, D> Controller<S, D>
where
    S: DesiredStateStore,
    D: WorkloadDriver,
{
    pub fn new(store: S, driver: D, config: ControllerConfig) -> Self {
        Self::with_metrics(store, driver, config, ControllerMetrics::new("xdeployment"))
    }

    pub(crate) fn with_metrics(
        store: S,
        driver: D,
        config: ControllerConfig,
        metrics: ControllerMetrics,
    ) -> Self {
        let queue = Arc::new(WorkQueue::new(config.backoff_base, config.backoff_max));
        Self {
            ctx: Arc::new(Context {
                store,
                driver,
                config,
                metrics,
            }),
            queue,
        }
    }

    /// Runs until `cancel` fires, then lets in-flight passes finish
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let workers = self.ctx.config.workers.max(1);
        info!(workers, "starting xdeployment controller");

        let mut tasks = JoinSet::new();
        let store_events = self.ctx.store.watch().map(|ev| {
            debug!(kind = ?ev.kind, "xdeployment {} changed", ev.key);
            ev.key
        });
        tasks.spawn(pump(store_events, self.queue.clone(), cancel.clone()));
        tasks.spawn(pump(
            self.ctx.driver.watch(),
            self.queue.clone(),
            cancel.clone(),
        ));
        for _ in 0..workers {
            tasks.spawn(worker(self.ctx.clone(), self.queue.clone()));
        }

        cancel.cancelled().await;
        info!("shutting down xdeployment controller");
        self.queue.shutdown();
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                error!(%e, "controller task failed");
            }
        }
        Ok(())
    }
}

async fn pump<St>(events: St, queue: Arc<WorkQueue<XDeploymentRef>>, cancel: CancellationToken)
where
    St: Stream<Item = XDeploymentRef> + Send + Unpin,
{
    let mut events = events;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            ev = events.next() => match ev {
                Some(key) => queue.add(key),
                None => return,
            },
        }
    }
}

async fn worker<S, D>(ctx: Arc<Context<S, D>>, queue: Arc<WorkQueue<XDeploymentRef>>)
where
    S: DesiredStateStore,
    D: WorkloadDriver,
{
    while let Some(key) = queue.next().await {
        ctx.metrics.set_queue_depth(queue.len());
        match reconcile(&key, &*ctx).await {
            Ok(action) => {
                queue.forget(&key);
                if let Some(after) = action.requeue_after() {
                    queue.add_after(key.clone(), after);
                }
            }
            Err(e) => {
                ctx.metrics.count_failure(&e);
                match e.class() {
                    ErrorClass::Validation => warn!(error = %e, "invalid XDeployment {}", key),
                    ErrorClass::Conflict | ErrorClass::NotFound => {
                        debug!(error = %e, "retrying XDeployment {}", key)
                    }
                    ErrorClass::Transient => {
                        error!(error = ?e, "reconcile error for XDeployment {}", key)
                    }
                }
                match error_policy(&e, &ctx.config) {
                    Requeue::Immediately => queue.add(key.clone()),
                    Requeue::After(after) => {
                        queue.forget(&key);
                        queue.add_after(key.clone(), after);
                    }
                    Requeue::WithBackoff => queue.add_rate_limited(key.clone()),
                    Requeue::Never => queue.forget(&key),
                }
            }
        }
        queue.done(&key);
        ctx.metrics.set_queue_depth(queue.len());
    }
}
