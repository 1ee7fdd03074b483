mod config;
mod context;
mod controller;
mod driver;
mod error;
mod metrics;
mod plan;
mod queue;
mod runtime;
mod status;
mod store;
#[cfg(test)]
mod testing;

use kube::runtime::reflector::ObjectRef;
use xdeploy_crds::v1alpha1::xdeployment::XDeployment;

pub use config::ControllerConfig;
pub use driver::{ChildTemplate, ChildUnit, PodDriver, Readiness, WorkloadDriver};
pub use error::{Error, ErrorClass, Result};
pub use metrics::REGISTRY;
pub use queue::WorkQueue;
pub use runtime::{Controller, start_xdeployment_controller};
pub use store::{ChangeKind, DesiredStateStore, KubeStore, WatchEvent};
pub use xdeploy_crds::v1alpha1;

/// Identity of an XDeployment, its namespace and name
pub type XDeploymentRef = ObjectRef<XDeployment>;
