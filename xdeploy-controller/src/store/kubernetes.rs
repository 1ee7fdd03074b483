use futures::{StreamExt, future, stream::BoxStream};
use kube::{
    Api, Client, ResourceExt,
    api::{Patch, PatchParams},
    runtime::{reflector::ObjectRef, watcher},
};
use serde_json::json;
use tracing::debug;
use xdeploy_crds::XDEPLOYMENT_FINALIZER;
use xdeploy_crds::v1alpha1::xdeployment::{XDeployment, XDeploymentStatus};
use xdeploy_k8s_utils::{is_conflict, is_not_found, watch_events};

use crate::store::{ChangeKind, DesiredStateStore, WatchEvent};
use crate::{Error, Result, XDeploymentRef};

/// XDeployment store backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    namespace: Option<String>,
}

impl KubeStore {
    /// Watches every namespace unless `namespace` is set
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        Self { client, namespace }
    }

    fn api(&self, key: &XDeploymentRef) -> Result<Api<XDeployment>> {
        let ns = key
            .namespace
            .as_deref()
            .ok_or_else(|| Error::MissingPrecondition(format!("{} has no namespace", key.name)))?;
        Ok(Api::namespaced(self.client.clone(), ns))
    }

    async fn patch_metadata(&self, obj: &XDeployment, patch: serde_json::Value) -> Result<()> {
        let key = ObjectRef::from_obj(obj);
        let api = self.api(&key)?;
        api.patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(map_write_error)?;
        Ok(())
    }
}

impl DesiredStateStore for KubeStore {
    async fn get(&self, key: &XDeploymentRef) -> Result<Option<XDeployment>> {
        Ok(self.api(key)?.get_opt(&key.name).await?)
    }

    fn watch(&self) -> BoxStream<'static, WatchEvent> {
        let api: Api<XDeployment> = match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        watch_events(api, watcher::Config::default().any_semantic())
            .filter_map(|ev| future::ready(watch_event(ev)))
            .boxed()
    }

    async fn update_status(
        &self,
        key: &XDeploymentRef,
        status: &XDeploymentStatus,
        expected_version: Option<&str>,
    ) -> Result<()> {
        let patch = status_patch(status, expected_version)?;
        self.api(key)?
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(map_write_error)?;
        debug!("patched status of {}", key);
        Ok(())
    }

    async fn add_finalizer(&self, obj: &XDeployment) -> Result<()> {
        let mut finalizers = obj.finalizers().to_vec();
        if finalizers.iter().any(|f| f == XDEPLOYMENT_FINALIZER) {
            return Ok(());
        }
        finalizers.push(XDEPLOYMENT_FINALIZER.to_string());
        self.patch_metadata(obj, finalizers_patch(obj, finalizers))
            .await
    }

    async fn remove_finalizer(&self, obj: &XDeployment) -> Result<()> {
        let finalizers: Vec<String> = obj
            .finalizers()
            .iter()
            .filter(|f| *f != XDEPLOYMENT_FINALIZER)
            .cloned()
            .collect();
        if finalizers.len() == obj.finalizers().len() {
            return Ok(());
        }
        self.patch_metadata(obj, finalizers_patch(obj, finalizers))
            .await
    }
}

fn map_write_error(e: kube::Error) -> Error {
    if is_conflict(&e) {
        Error::Conflict
    } else if is_not_found(&e) {
        Error::NotFound
    } else {
        Error::KubeError(e)
    }
}

fn watch_event(ev: watcher::Event<XDeployment>) -> Option<WatchEvent> {
    match ev {
        watcher::Event::Apply(obj) | watcher::Event::InitApply(obj) => Some(WatchEvent {
            key: ObjectRef::from_obj(&obj),
            kind: ChangeKind::Applied,
        }),
        watcher::Event::Delete(obj) => Some(WatchEvent {
            key: ObjectRef::from_obj(&obj),
            kind: ChangeKind::Deleted,
        }),
        watcher::Event::Init | watcher::Event::InitDone => None,
    }
}

// A merge patch carrying metadata.resourceVersion is rejected with 409 by the
// API server when the object changed since it was read.
fn status_patch(
    status: &XDeploymentStatus,
    expected_version: Option<&str>,
) -> Result<serde_json::Value> {
    let mut patch = json!({ "status": serde_json::to_value(status)? });
    if let Some(version) = expected_version {
        patch["metadata"] = json!({ "resourceVersion": version });
    }
    Ok(patch)
}

fn finalizers_patch(obj: &XDeployment, finalizers: Vec<String>) -> serde_json::Value {
    let mut metadata = json!({ "finalizers": finalizers });
    if let Some(version) = obj.resource_version() {
        metadata["resourceVersion"] = json!(version);
    }
    json!({ "metadata": metadata })
}
