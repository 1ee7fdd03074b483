use std::time::Duration;

use k8s_openapi::chrono::Utc;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};
use xdeploy_crds::XDEPLOYMENT_FINALIZER;
use xdeploy_crds::v1alpha1::xdeployment::XDeployment;

use crate::config::ControllerConfig;
use crate::context::Context;
use crate::driver::{ChildUnit, Readiness, WorkloadDriver};
use crate::error::ErrorClass;
use crate::plan::{ChildAction, ObservedChild, Phase, Plan, plan};
use crate::status::{compute_status, invalid_spec_status, publish};
use crate::store::DesiredStateStore;
use crate::{Error, Result, XDeploymentRef};

/// What to do with a key after a successful pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    pub fn requeue(duration: Duration) -> Self {
        Self {
            requeue_after: Some(duration),
        }
    }

    pub fn await_change() -> Self {
        Self {
            requeue_after: None,
        }
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// What to do with a key after a failed pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Requeue {
    Immediately,
    /// Fixed delay, the failure count is reset
    After(Duration),
    WithBackoff,
    Never,
}

async fn with_timeout<T>(
    limit: Duration,
    op: &'static str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| Error::Timeout(op))?
}

#[instrument(skip_all, fields(xdeployment = %key))]
pub(crate) async fn reconcile<S, D>(key: &XDeploymentRef, ctx: &Context<S, D>) -> Result<Action>
where
    S: DesiredStateStore,
    D: WorkloadDriver,
{
    let _timer = ctx.metrics.count_and_measure();
    let limit = ctx.config.driver_timeout;

    let Some(obj) = with_timeout(limit, "get xdeployment", ctx.store.get(key)).await? else {
        let children = list_children(key, None, ctx).await?;
        if !children.is_empty() {
            info!(children = children.len(), "XDeployment is gone, deleting its children");
        }
        delete_children(&children, ctx).await?;
        return Ok(Action::await_change());
    };

    if obj.meta().deletion_timestamp.is_some() {
        return finalize(key, &obj, ctx).await;
    }

    let obj = if has_finalizer(&obj) {
        obj
    } else {
        with_timeout(limit, "add finalizer", ctx.store.add_finalizer(&obj)).await?;
        with_timeout(limit, "get xdeployment", ctx.store.get(key))
            .await?
            .ok_or(Error::NotFound)?
    };

    let children = observe_children(key, &obj, ctx).await?;

    if let Err(e) = obj.spec.validate() {
        warn!(reason = e.reason(), "rejecting XDeployment: {}", e);
        let ready = children
            .iter()
            .filter(|c| !c.unit.terminating && c.readiness.is_ready())
            .count();
        let status = invalid_spec_status(&obj, &e, ready, Utc::now());
        with_timeout(limit, "publish status", publish(&ctx.store, &obj, &status)).await?;
        return Err(e.into());
    }

    let plan = plan(
        &obj.spec,
        &children,
        Utc::now(),
        ctx.config.progress_deadline,
    );
    if !plan.actions.is_empty() {
        info!(
            phase = ?plan.phase,
            creates = plan.creates(),
            deletes = plan.deletes(),
            "applying plan"
        );
    }
    execute(&obj, &plan, ctx).await?;

    let status = compute_status(&obj, &plan, Utc::now());
    let published =
        with_timeout(limit, "publish status", publish(&ctx.store, &obj, &status)).await?;
    debug!(?published, phase = ?plan.phase, ready = status.replicas, "reconciled");

    if plan.phase == Phase::Converged {
        Ok(Action::requeue(ctx.config.resync_interval))
    } else {
        Ok(Action::requeue(ctx.config.rollout_poll_interval))
    }
}

pub(crate) fn error_policy(error: &Error, config: &ControllerConfig) -> Requeue {
    match error.class() {
        ErrorClass::Validation => Requeue::After(config.invalid_spec_retry),
        ErrorClass::Conflict => Requeue::Immediately,
        ErrorClass::NotFound => Requeue::Never,
        ErrorClass::Transient => Requeue::WithBackoff,
    }
}

fn has_finalizer(obj: &XDeployment) -> bool {
    obj.finalizers().iter().any(|f| f == XDEPLOYMENT_FINALIZER)
}

async fn finalize<S, D>(key: &XDeploymentRef, obj: &XDeployment, ctx: &Context<S, D>) -> Result<Action>
where
    S: DesiredStateStore,
    D: WorkloadDriver,
{
    let uid = obj.uid();
    let children = list_children(key, uid.as_deref(), ctx).await?;
    let live: Vec<ChildUnit> = children.into_iter().filter(|c| !c.terminating).collect();
    delete_children(&live, ctx).await?;

    let remaining = list_children(key, uid.as_deref(), ctx).await?;
    if !remaining.is_empty() {
        info!(
            remaining = remaining.len(),
            "waiting for children to terminate"
        );
        return Ok(Action::requeue(ctx.config.rollout_poll_interval));
    }

    if has_finalizer(obj) {
        with_timeout(
            ctx.config.driver_timeout,
            "remove finalizer",
            ctx.store.remove_finalizer(obj),
        )
        .await?;
        info!("children removed, released finalizer");
    }
    Ok(Action::await_change())
}

async fn list_children<S, D>(
    key: &XDeploymentRef,
    uid: Option<&str>,
    ctx: &Context<S, D>,
) -> Result<Vec<ChildUnit>>
where
    D: WorkloadDriver,
{
    with_timeout(
        ctx.config.driver_timeout,
        "list children",
        ctx.driver.list_children(key, uid),
    )
    .await
}

async fn observe_children<S, D>(
    key: &XDeploymentRef,
    obj: &XDeployment,
    ctx: &Context<S, D>,
) -> Result<Vec<ObservedChild>>
where
    D: WorkloadDriver,
{
    let children = list_children(key, obj.uid().as_deref(), ctx).await?;
    let mut observed = Vec::with_capacity(children.len());
    for unit in children {
        let readiness = if unit.terminating {
            Readiness::Unknown
        } else {
            with_timeout(
                ctx.config.driver_timeout,
                "child readiness",
                ctx.driver.readiness(&unit),
            )
            .await?
        };
        observed.push(ObservedChild { unit, readiness });
    }
    Ok(observed)
}

async fn delete_children<S, D>(children: &[ChildUnit], ctx: &Context<S, D>) -> Result<()>
where
    D: WorkloadDriver,
{
    for child in children {
        with_timeout(
            ctx.config.driver_timeout,
            "delete child",
            ctx.driver.delete_child(child),
        )
        .await?;
    }
    Ok(())
}

async fn execute<S, D>(obj: &XDeployment, plan: &Plan, ctx: &Context<S, D>) -> Result<()>
where
    D: WorkloadDriver,
{
    let limit = ctx.config.driver_timeout;
    for action in &plan.actions {
        match action {
            ChildAction::Delete(child) => {
                with_timeout(limit, "delete child", ctx.driver.delete_child(child)).await?;
            }
            ChildAction::Create(template) => {
                let id =
                    with_timeout(limit, "create child", ctx.driver.create_child(obj, template))
                        .await?;
                debug!(child = %id, image = %template.image, "created child");
            }
        }
    }
    Ok(())
}
