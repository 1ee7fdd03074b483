use k8s_openapi::chrono::{DateTime, SecondsFormat, Utc};
use kube::{ResourceExt, runtime::reflector::ObjectRef};
use tracing::debug;
use xdeploy_crds::v1alpha1::xdeployment::{
    CONDITION_AVAILABLE, CONDITION_IMAGE_PULL_FAILING, CONDITION_INVALID_SPEC,
    CONDITION_PROGRESSING, ValidationError, XDeployment, XDeploymentCondition, XDeploymentStatus,
};

use crate::Result;
use crate::plan::{Phase, Plan};
use crate::store::DesiredStateStore;

const TRUE: &str = "True";
const FALSE: &str = "False";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Published {
    Unchanged,
    Updated,
}

fn count(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn condition(type_: &str, status: bool, reason: &str, message: String) -> XDeploymentCondition {
    XDeploymentCondition {
        type_: type_.to_string(),
        status: if status { TRUE } else { FALSE }.to_string(),
        reason: reason.to_string(),
        message,
        last_transition_time: String::new(),
    }
}

// Stamps each condition with `now` unless the previous status already had the
// same condition type with the same status.
fn carry_transition_times(
    conditions: Vec<XDeploymentCondition>,
    previous: Option<&XDeploymentStatus>,
    now: DateTime<Utc>,
) -> Vec<XDeploymentCondition> {
    let stamp = now.to_rfc3339_opts(SecondsFormat::Secs, true);
    conditions
        .into_iter()
        .map(|mut c| {
            c.last_transition_time = previous
                .and_then(|p| p.condition(&c.type_))
                .filter(|old| old.status == c.status)
                .map_or_else(|| stamp.clone(), |old| old.last_transition_time.clone());
            c
        })
        .collect()
}

/// Status for a valid spec after `plan` has been executed
pub fn compute_status(obj: &XDeployment, plan: &Plan, now: DateTime<Utc>) -> XDeploymentStatus {
    let ready = plan.remaining_ready;
    let available = condition(
        CONDITION_AVAILABLE,
        ready >= plan.target,
        if ready >= plan.target {
            "MinimumReplicasAvailable"
        } else {
            "MinimumReplicasUnavailable"
        },
        format!("{} of {} children ready", ready, plan.target),
    );

    let progressing = if plan.stalled {
        condition(
            CONDITION_PROGRESSING,
            false,
            "ProgressDeadlineExceeded",
            "a child on the current image did not become ready in time".to_string(),
        )
    } else if plan.phase == Phase::Converged {
        condition(
            CONDITION_PROGRESSING,
            false,
            Phase::Converged.reason(),
            format!("{} children on {}", plan.updated, obj.spec.image),
        )
    } else {
        condition(
            CONDITION_PROGRESSING,
            true,
            plan.phase.reason(),
            format!("{} of {} children updated", plan.updated, plan.target),
        )
    };

    let invalid = condition(
        CONDITION_INVALID_SPEC,
        false,
        "Valid",
        "spec is valid".to_string(),
    );

    let image_pull = match &plan.failure {
        Some(reason) => condition(
            CONDITION_IMAGE_PULL_FAILING,
            true,
            reason,
            format!("image {} cannot be started", obj.spec.image),
        ),
        None => condition(
            CONDITION_IMAGE_PULL_FAILING,
            false,
            "NoFailures",
            String::new(),
        ),
    };

    XDeploymentStatus {
        replicas: count(ready),
        updated_replicas: Some(count(plan.updated)),
        observed_generation: obj.metadata.generation,
        conditions: carry_transition_times(
            vec![available, progressing, invalid, image_pull],
            obj.status.as_ref(),
            now,
        ),
    }
}

/// Status for a spec that failed validation, keeping the other conditions
pub fn invalid_spec_status(
    obj: &XDeployment,
    error: &ValidationError,
    ready: usize,
    now: DateTime<Utc>,
) -> XDeploymentStatus {
    let previous = obj.status.as_ref();
    let mut conditions: Vec<XDeploymentCondition> = previous
        .map(|p| {
            p.conditions
                .iter()
                .filter(|c| c.type_ != CONDITION_INVALID_SPEC)
                .cloned()
                .collect()
        })
        .unwrap_or_default();
    conditions.push(condition(
        CONDITION_INVALID_SPEC,
        true,
        error.reason(),
        error.to_string(),
    ));

    XDeploymentStatus {
        replicas: count(ready),
        updated_replicas: previous.and_then(|p| p.updated_replicas),
        observed_generation: obj.metadata.generation,
        conditions: carry_transition_times(conditions, previous, now),
    }
}

/// Writes `status` unless `obj` already carries it.
///
/// The write is conditioned on the resource version `obj` was read at.
pub async fn publish<S: DesiredStateStore>(
    store: &S,
    obj: &XDeployment,
    status: &XDeploymentStatus,
) -> Result<Published> {
    if obj.status.as_ref() == Some(status) {
        return Ok(Published::Unchanged);
    }
    let key = ObjectRef::from_obj(obj);
    store
        .update_status(&key, status, obj.resource_version().as_deref())
        .await?;
    debug!(replicas = status.replicas, "published status of {}", key);
    Ok(Published::Updated)
}
