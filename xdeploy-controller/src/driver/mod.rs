mod pod;

use std::collections::BTreeMap;

use futures::{StreamExt, stream::BoxStream};
use k8s_openapi::chrono::{DateTime, Utc};
use xdeploy_crds::v1alpha1::xdeployment::{XDeployment, XDeploymentSpec};

use crate::{Result, XDeploymentRef};

pub use pod::PodDriver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotReady,
    Unknown,
}

impl Readiness {
    pub fn is_ready(self) -> bool {
        self == Readiness::Ready
    }
}

/// A running child owned by an XDeployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildUnit {
    pub id: String,
    pub owner: XDeploymentRef,
    pub image: String,
    pub created_at: DateTime<Utc>,
    /// Deletion already requested, the child only counts as going away
    pub terminating: bool,
    /// Reason the child cannot start its image, if any
    pub failure: Option<String>,
    /// Readiness as reported by the listing that produced this unit
    pub readiness: Readiness,
}

/// Everything the driver needs to start a child
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildTemplate {
    pub image: String,
    pub port: Option<i32>,
    pub hostname: Option<String>,
    pub env: BTreeMap<String, String>,
}

impl ChildTemplate {
    pub fn from_spec(spec: &XDeploymentSpec) -> Self {
        Self {
            image: spec.image.clone(),
            port: spec.port,
            hostname: spec.hostname().map(str::to_string),
            env: spec.env.clone(),
        }
    }
}

/// Runs children on some substrate.
///
/// Implementations must be safe to call from several workers at once and
/// `delete_child` must succeed for a child that is already gone.
pub trait WorkloadDriver: Send + Sync + 'static {
    /// Children controlled by `owner`. With a `uid` only children of that
    /// incarnation match, without one any XDeployment of that name does.
    fn list_children(
        &self,
        owner: &XDeploymentRef,
        uid: Option<&str>,
    ) -> impl Future<Output = Result<Vec<ChildUnit>>> + Send;

    /// Starts a child and returns its id
    fn create_child(
        &self,
        owner: &XDeployment,
        template: &ChildTemplate,
    ) -> impl Future<Output = Result<String>> + Send;

    fn delete_child(&self, child: &ChildUnit) -> impl Future<Output = Result<()>> + Send;

    fn readiness(&self, child: &ChildUnit) -> impl Future<Output = Result<Readiness>> + Send;

    /// Owners whose children changed. Drivers without change notification
    /// rely on periodic requeues instead.
    fn watch(&self) -> BoxStream<'static, XDeploymentRef> {
        futures::stream::pending().boxed()
    }
}
