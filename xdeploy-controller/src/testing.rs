use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use futures::{StreamExt, stream, stream::BoxStream};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::chrono::{DateTime, Utc};
use kube::runtime::reflector::ObjectRef;
use kube::{Resource, ResourceExt};
use tokio::sync::broadcast;
use xdeploy_crds::v1alpha1::xdeployment::{XDeployment, XDeploymentStatus};

use crate::driver::{ChildTemplate, ChildUnit, Readiness, WorkloadDriver};
use crate::store::{ChangeKind, DesiredStateStore, WatchEvent};
use crate::{Error, Result, XDeploymentRef};

fn subscribe<T: Clone + Send + 'static>(
    replay: Vec<T>,
    rx: broadcast::Receiver<T>,
) -> BoxStream<'static, T> {
    let live = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(item) => return Some((item, rx)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    stream::iter(replay).chain(live).boxed()
}

#[derive(Default)]
struct StoreState {
    objects: HashMap<XDeploymentRef, XDeployment>,
    version: u64,
    status_writes: usize,
    conflicts: usize,
}

impl StoreState {
    fn bump(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

/// XDeployment store kept in memory, with resource version checks
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            state: Arc::default(),
            events: broadcast::channel(1024).0,
        }
    }
}

impl MemoryStore {
    fn emit(&self, key: XDeploymentRef, kind: ChangeKind) {
        let _ = self.events.send(WatchEvent { key, kind });
    }

    pub fn insert(&self, mut obj: XDeployment) -> XDeployment {
        let key = {
            let mut state = self.state.lock().unwrap();
            obj.metadata.resource_version = Some(state.bump());
            obj.metadata.uid.get_or_insert_with(|| format!("uid-{}", state.version));
            obj.metadata.generation.get_or_insert(1);
            let key = ObjectRef::from_obj(&obj);
            state.objects.insert(key.clone(), obj.clone());
            key
        };
        self.emit(key, ChangeKind::Applied);
        obj
    }

    pub fn object(&self, key: &XDeploymentRef) -> Option<XDeployment> {
        self.state.lock().unwrap().objects.get(key).cloned()
    }

    pub fn set_image(&self, key: &XDeploymentRef, image: &str) {
        {
            let mut state = self.state.lock().unwrap();
            let version = state.bump();
            let obj = state.objects.get_mut(key).expect("object");
            obj.spec.image = image.to_string();
            obj.metadata.generation = Some(obj.metadata.generation.unwrap_or(0) + 1);
            obj.metadata.resource_version = Some(version);
        }
        self.emit(key.clone(), ChangeKind::Applied);
    }

    /// Deletes the object, or marks it for deletion while finalizers remain
    pub fn request_delete(&self, key: &XDeploymentRef) {
        let kind = {
            let mut state = self.state.lock().unwrap();
            let version = state.bump();
            let obj = state.objects.get_mut(key).expect("object");
            if obj.finalizers().is_empty() {
                state.objects.remove(key);
                ChangeKind::Deleted
            } else {
                obj.metadata.deletion_timestamp = Some(Time(Utc::now()));
                obj.metadata.resource_version = Some(version);
                ChangeKind::Applied
            }
        };
        self.emit(key.clone(), kind);
    }

    /// Fails the next `n` status writes with a conflict
    pub fn inject_conflicts(&self, n: usize) {
        self.state.lock().unwrap().conflicts = n;
    }

    pub fn status_writes(&self) -> usize {
        self.state.lock().unwrap().status_writes
    }

    fn update_finalizers(&self, obj: &XDeployment, finalizers: Vec<String>) -> Result<()> {
        let key = ObjectRef::from_obj(obj);
        let kind = {
            let mut state = self.state.lock().unwrap();
            let version = state.bump();
            let stored = state.objects.get_mut(&key).ok_or(Error::NotFound)?;
            if stored.metadata.resource_version != obj.metadata.resource_version {
                return Err(Error::Conflict);
            }
            if finalizers.is_empty() && stored.meta().deletion_timestamp.is_some() {
                state.objects.remove(&key);
                ChangeKind::Deleted
            } else {
                stored.metadata.finalizers = Some(finalizers);
                stored.metadata.resource_version = Some(version);
                ChangeKind::Applied
            }
        };
        self.emit(key, kind);
        Ok(())
    }
}

impl DesiredStateStore for MemoryStore {
    async fn get(&self, key: &XDeploymentRef) -> Result<Option<XDeployment>> {
        Ok(self.object(key))
    }

    fn watch(&self) -> BoxStream<'static, WatchEvent> {
        let rx = self.events.subscribe();
        let replay = self
            .state
            .lock()
            .unwrap()
            .objects
            .keys()
            .map(|key| WatchEvent {
                key: key.clone(),
                kind: ChangeKind::Applied,
            })
            .collect();
        subscribe(replay, rx)
    }

    async fn update_status(
        &self,
        key: &XDeploymentRef,
        status: &XDeploymentStatus,
        expected_version: Option<&str>,
    ) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if state.conflicts > 0 {
                state.conflicts -= 1;
                return Err(Error::Conflict);
            }
            let version = state.bump();
            let obj = state.objects.get_mut(key).ok_or(Error::NotFound)?;
            if let Some(expected) = expected_version
                && obj.metadata.resource_version.as_deref() != Some(expected)
            {
                return Err(Error::Conflict);
            }
            obj.status = Some(status.clone());
            obj.metadata.resource_version = Some(version);
            state.status_writes += 1;
        }
        self.emit(key.clone(), ChangeKind::Applied);
        Ok(())
    }

    async fn add_finalizer(&self, obj: &XDeployment) -> Result<()> {
        let mut finalizers = obj.finalizers().to_vec();
        finalizers.push(xdeploy_crds::XDEPLOYMENT_FINALIZER.to_string());
        self.update_finalizers(obj, finalizers)
    }

    async fn remove_finalizer(&self, obj: &XDeployment) -> Result<()> {
        let finalizers = obj
            .finalizers()
            .iter()
            .filter(|f| *f != xdeploy_crds::XDEPLOYMENT_FINALIZER)
            .cloned()
            .collect();
        self.update_finalizers(obj, finalizers)
    }
}

struct FakeChild {
    unit: ChildUnit,
    owner_uid: Option<String>,
    ready: bool,
}

impl FakeChild {
    fn listed(&self) -> ChildUnit {
        ChildUnit {
            readiness: if self.ready {
                Readiness::Ready
            } else {
                Readiness::NotReady
            },
            ..self.unit.clone()
        }
    }
}

#[derive(Default)]
struct DriverState {
    children: BTreeMap<String, FakeChild>,
    next_id: u64,
    auto_ready: bool,
    graceful: bool,
    failing_creates: usize,
    hanging_creates: usize,
    creates: usize,
    deletes: usize,
    ready_history: Vec<usize>,
    total_history: Vec<usize>,
}

impl DriverState {
    fn record(&mut self) {
        let live = self.children.values().filter(|c| !c.unit.terminating);
        let (total, ready) = live.fold((0, 0), |(t, r), c| (t + 1, r + usize::from(c.ready)));
        self.total_history.push(total);
        self.ready_history.push(ready);
    }

    fn add(&mut self, owner: &XDeployment, image: &str, created_at: DateTime<Utc>, ready: bool) -> String {
        self.next_id += 1;
        let id = format!("{}-{:05}", owner.name_any(), self.next_id);
        self.children.insert(
            id.clone(),
            FakeChild {
                unit: ChildUnit {
                    id: id.clone(),
                    owner: ObjectRef::from_obj(owner),
                    image: image.to_string(),
                    created_at,
                    terminating: false,
                    failure: None,
                    readiness: Readiness::Unknown,
                },
                owner_uid: owner.uid(),
                ready,
            },
        );
        id
    }
}

/// Workload driver that keeps children in memory and records every mutation
#[derive(Clone)]
pub struct MemoryDriver {
    state: Arc<Mutex<DriverState>>,
    events: broadcast::Sender<XDeploymentRef>,
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self {
            state: Arc::default(),
            events: broadcast::channel(1024).0,
        }
    }
}

impl MemoryDriver {
    /// Children report ready as soon as they are created
    pub fn auto_ready() -> Self {
        let driver = Self::default();
        driver.state.lock().unwrap().auto_ready = true;
        driver
    }

    /// Deleted children linger as terminating until [`MemoryDriver::reap`]
    pub fn set_graceful(&self, graceful: bool) {
        self.state.lock().unwrap().graceful = graceful;
    }

    pub fn fail_creates(&self, n: usize) {
        self.state.lock().unwrap().failing_creates = n;
    }

    /// The next `n` creates never complete and leave no child behind
    pub fn hang_creates(&self, n: usize) {
        self.state.lock().unwrap().hanging_creates = n;
    }

    pub fn seed(
        &self,
        owner: &XDeployment,
        image: &str,
        created_at: DateTime<Utc>,
        ready: bool,
    ) -> String {
        self.state
            .lock()
            .unwrap()
            .add(owner, image, created_at, ready)
    }

    pub fn children(&self, owner: &XDeploymentRef) -> Vec<ChildUnit> {
        self.state
            .lock()
            .unwrap()
            .children
            .values()
            .filter(|c| &c.unit.owner == owner)
            .map(FakeChild::listed)
            .collect()
    }

    pub fn mark_all_ready(&self) {
        let owners: Vec<XDeploymentRef> = {
            let mut state = self.state.lock().unwrap();
            for child in state.children.values_mut() {
                child.ready = true;
            }
            state.record();
            state.children.values().map(|c| c.unit.owner.clone()).collect()
        };
        for owner in owners {
            let _ = self.events.send(owner);
        }
    }

    pub fn set_failure(&self, id: &str, reason: &str) {
        if let Some(child) = self.state.lock().unwrap().children.get_mut(id) {
            child.unit.failure = Some(reason.to_string());
        }
    }

    /// Drops every terminating child
    pub fn reap(&self) {
        self.state
            .lock()
            .unwrap()
            .children
            .retain(|_, c| !c.unit.terminating);
    }

    /// Number of create and delete calls so far
    pub fn mutations(&self) -> (usize, usize) {
        let state = self.state.lock().unwrap();
        (state.creates, state.deletes)
    }

    pub fn clear_history(&self) {
        let mut state = self.state.lock().unwrap();
        state.ready_history.clear();
        state.total_history.clear();
    }

    /// Live ready children after each mutation
    pub fn ready_history(&self) -> Vec<usize> {
        self.state.lock().unwrap().ready_history.clone()
    }

    /// Live children after each mutation
    pub fn total_history(&self) -> Vec<usize> {
        self.state.lock().unwrap().total_history.clone()
    }
}

impl WorkloadDriver for MemoryDriver {
    async fn list_children(
        &self,
        owner: &XDeploymentRef,
        uid: Option<&str>,
    ) -> Result<Vec<ChildUnit>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .children
            .values()
            .filter(|c| &c.unit.owner == owner)
            .filter(|c| uid.is_none_or(|uid| c.owner_uid.as_deref() == Some(uid)))
            .map(FakeChild::listed)
            .collect())
    }

    async fn create_child(&self, owner: &XDeployment, template: &ChildTemplate) -> Result<String> {
        let hang = {
            let mut state = self.state.lock().unwrap();
            let hang = state.hanging_creates > 0;
            state.hanging_creates = state.hanging_creates.saturating_sub(1);
            hang
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let key = ObjectRef::from_obj(owner);
        let id = {
            let mut state = self.state.lock().unwrap();
            if state.failing_creates > 0 {
                state.failing_creates -= 1;
                return Err(Error::Driver("create rejected".to_string()));
            }
            state.creates += 1;
            let ready = state.auto_ready;
            let id = state.add(owner, &template.image, Utc::now(), ready);
            state.record();
            id
        };
        let _ = self.events.send(key);
        Ok(id)
    }

    async fn delete_child(&self, child: &ChildUnit) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            state.deletes += 1;
            if state.graceful {
                if let Some(existing) = state.children.get_mut(&child.id) {
                    existing.unit.terminating = true;
                }
            } else {
                state.children.remove(&child.id);
            }
            state.record();
        }
        let _ = self.events.send(child.owner.clone());
        Ok(())
    }

    async fn readiness(&self, child: &ChildUnit) -> Result<Readiness> {
        let state = self.state.lock().unwrap();
        Ok(match state.children.get(&child.id) {
            Some(c) if c.ready => Readiness::Ready,
            Some(_) => Readiness::NotReady,
            None => Readiness::Unknown,
        })
    }

    fn watch(&self) -> BoxStream<'static, XDeploymentRef> {
        subscribe(Vec::new(), self.events.subscribe())
    }
}
