use std::time::Duration;

use k8s_openapi::chrono::{DateTime, Utc};
use xdeploy_crds::v1alpha1::xdeployment::XDeploymentSpec;

use crate::driver::{ChildTemplate, ChildUnit, Readiness};

/// A child together with the readiness reported for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedChild {
    pub unit: ChildUnit,
    pub readiness: Readiness,
}

impl ObservedChild {
    fn is_ready(&self) -> bool {
        self.readiness.is_ready()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildAction {
    Create(ChildTemplate),
    Delete(ChildUnit),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Right number of children, all on the current image and ready
    Converged,
    Scaling,
    RollingUpdate,
    /// Nothing left to do but wait for children to become ready
    WaitingForReady,
}

impl Phase {
    pub fn reason(self) -> &'static str {
        match self {
            Phase::Converged => "Converged",
            Phase::Scaling => "Scaling",
            Phase::RollingUpdate => "RollingUpdate",
            Phase::WaitingForReady => "WaitingForReady",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub actions: Vec<ChildAction>,
    pub phase: Phase,
    pub target: usize,
    /// Ready children left once the planned deletions went through
    pub remaining_ready: usize,
    /// Children on the current image left once the planned deletions went through
    pub updated: usize,
    /// A child on the current image stayed unready past the progress deadline
    pub stalled: bool,
    /// First image failure reported by a live child
    pub failure: Option<String>,
}

impl Plan {
    pub fn creates(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| matches!(a, ChildAction::Create(_)))
            .count()
    }

    pub fn deletes(&self) -> usize {
        self.actions.len() - self.creates()
    }
}

fn by_age(a: &&ObservedChild, b: &&ObservedChild) -> std::cmp::Ordering {
    (a.unit.created_at, &a.unit.id).cmp(&(b.unit.created_at, &b.unit.id))
}

/// Decides which children to create and delete for one reconcile pass.
///
/// Surge and unavailability during an image change are both bounded by one
/// child. Terminating children are ignored entirely.
pub fn plan(
    spec: &XDeploymentSpec,
    children: &[ObservedChild],
    now: DateTime<Utc>,
    progress_deadline: Duration,
) -> Plan {
    let target = usize::try_from(spec.desired_replicas()).unwrap_or(0);
    let live: Vec<&ObservedChild> = children.iter().filter(|c| !c.unit.terminating).collect();
    let (mut current, mut stale): (Vec<&ObservedChild>, Vec<&ObservedChild>) =
        live.iter().copied().partition(|c| c.unit.image == spec.image);
    current.sort_by(by_age);
    stale.sort_by(by_age);

    let ready = live.iter().filter(|c| c.is_ready()).count();
    let stalled = current.iter().any(|c| {
        !c.is_ready()
            && now
                .signed_duration_since(c.unit.created_at)
                .to_std()
                .is_ok_and(|age| age > progress_deadline)
    });
    let failure = live.iter().find_map(|c| c.unit.failure.clone());

    let template = ChildTemplate::from_spec(spec);
    let total = live.len();
    let mut deletions: Vec<&ObservedChild> = Vec::new();
    let mut creates = 0;

    let phase = if stale.is_empty() || target == 0 {
        if total < target {
            creates = target - total;
        } else if total > target {
            let mut oldest = live.clone();
            oldest.sort_by(by_age);
            deletions.extend(oldest.into_iter().take(total - target));
        }
        if creates > 0 || !deletions.is_empty() {
            Phase::Scaling
        } else if ready < target {
            Phase::WaitingForReady
        } else {
            Phase::Converged
        }
    } else {
        let surge_limit = target + 1;
        if total > surge_limit {
            deletions.extend(stale.iter().chain(current.iter()).take(total - surge_limit));
        } else {
            creates = target
                .saturating_sub(current.len())
                .min(surge_limit - total);
            if creates == 0 {
                let mut candidates = stale.clone();
                candidates.sort_by_key(|c| (c.is_ready(), c.unit.created_at, c.unit.id.clone()));
                if let Some(candidate) = candidates.first() {
                    let allowed = !candidate.is_ready()
                        || ready > target
                        || (stalled && ready >= target);
                    if allowed {
                        deletions.push(*candidate);
                    }
                }
            }
        }
        Phase::RollingUpdate
    };

    let remaining_ready = ready - deletions.iter().filter(|c| c.is_ready()).count();
    let updated = current.len()
        - deletions
            .iter()
            .filter(|c| c.unit.image == spec.image)
            .count();

    let mut actions: Vec<ChildAction> = deletions
        .into_iter()
        .map(|c| ChildAction::Delete(c.unit.clone()))
        .collect();
    actions.extend((0..creates).map(|_| ChildAction::Create(template.clone())));

    Plan {
        actions,
        phase,
        target,
        remaining_ready,
        updated,
        stalled,
        failure,
    }
}
