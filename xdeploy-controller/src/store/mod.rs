mod kubernetes;

use futures::stream::BoxStream;
use xdeploy_crds::v1alpha1::xdeployment::{XDeployment, XDeploymentStatus};

use crate::{Result, XDeploymentRef};

pub use kubernetes::KubeStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Applied,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub key: XDeploymentRef,
    pub kind: ChangeKind,
}

/// Persistent home of XDeployment objects.
///
/// The controller reads specs through this trait and is the only writer of
/// status. Writes that carry a resource version fail with
/// [`Error::Conflict`](crate::Error::Conflict) when the stored object moved on.
pub trait DesiredStateStore: Send + Sync + 'static {
    fn get(
        &self,
        key: &XDeploymentRef,
    ) -> impl Future<Output = Result<Option<XDeployment>>> + Send;

    /// Stream of changes. Existing objects are replayed as `Applied` when the
    /// stream starts.
    fn watch(&self) -> BoxStream<'static, WatchEvent>;

    fn update_status(
        &self,
        key: &XDeploymentRef,
        status: &XDeploymentStatus,
        expected_version: Option<&str>,
    ) -> impl Future<Output = Result<()>> + Send;

    fn add_finalizer(&self, obj: &XDeployment) -> impl Future<Output = Result<()>> + Send;

    fn remove_finalizer(&self, obj: &XDeployment) -> impl Future<Output = Result<()>> + Send;
}
