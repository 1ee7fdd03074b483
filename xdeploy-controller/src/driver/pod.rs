use std::collections::BTreeMap;

use futures::{StreamExt, future, stream::BoxStream};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, Pod, PodSpec, Probe, TCPSocketAction,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::chrono::{DateTime, Utc};
use kube::{
    Api, Client, Resource, ResourceExt,
    api::{DeleteParams, ListParams, ObjectMeta, PostParams},
    runtime::{reflector::ObjectRef, watcher},
};
use tracing::{debug, info};
use xdeploy_crds::OWNER_UID_LABEL;
use xdeploy_crds::v1alpha1::xdeployment::XDeployment;
use xdeploy_k8s_utils::{is_not_found, watch_events};

use crate::driver::{ChildTemplate, ChildUnit, Readiness, WorkloadDriver};
use crate::{Error, Result, XDeploymentRef};

const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
const MANAGED_BY: &str = "xdeploy";
const CONTAINER_NAME: &str = "app";

const IMAGE_FAILURES: [&str; 3] = ["ErrImagePull", "ImagePullBackOff", "InvalidImageName"];

/// Runs each child as a Pod in the owner's namespace
#[derive(Clone)]
pub struct PodDriver {
    client: Client,
    namespace: Option<String>,
}

impl PodDriver {
    /// `namespace` limits the pod watch, it should match the store's
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        Self { client, namespace }
    }

    fn api(&self, namespace: Option<&str>) -> Result<Api<Pod>> {
        let ns = namespace
            .ok_or_else(|| Error::MissingPrecondition("child has no namespace".to_string()))?;
        Ok(Api::namespaced(self.client.clone(), ns))
    }
}

impl WorkloadDriver for PodDriver {
    async fn list_children(
        &self,
        owner: &XDeploymentRef,
        uid: Option<&str>,
    ) -> Result<Vec<ChildUnit>> {
        let api = self.api(owner.namespace.as_deref())?;
        let selector = match uid {
            Some(uid) => format!("{}={}", OWNER_UID_LABEL, uid),
            None => format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY),
        };
        let pods = api.list(&ListParams::default().labels(&selector)).await?;
        Ok(owned_children(owner, uid, &pods.items))
    }

    async fn create_child(&self, owner: &XDeployment, template: &ChildTemplate) -> Result<String> {
        let pod = build_pod(owner, template)?;
        let api = self.api(owner.namespace().as_deref())?;
        let created = api.create(&PostParams::default(), &pod).await?;
        let name = created.name_any();
        info!("created pod {} for {}", name, owner.name_any());
        Ok(name)
    }

    async fn delete_child(&self, child: &ChildUnit) -> Result<()> {
        let api = self.api(child.owner.namespace.as_deref())?;
        match api.delete(&child.id, &DeleteParams::default()).await {
            Ok(_) => {
                info!("deleted pod {}", child.id);
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                debug!("pod {} already gone", child.id);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Answered from the pod list, every reconcile pass lists before it asks
    async fn readiness(&self, child: &ChildUnit) -> Result<Readiness> {
        Ok(child.readiness)
    }

    fn watch(&self) -> BoxStream<'static, XDeploymentRef> {
        let api: Api<Pod> = match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let config = watcher::Config::default()
            .labels(&format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY))
            .any_semantic();
        watch_events(api, config)
            .filter_map(|ev| {
                future::ready(match ev {
                    watcher::Event::Apply(pod)
                    | watcher::Event::InitApply(pod)
                    | watcher::Event::Delete(pod) => owner_of(&pod),
                    watcher::Event::Init | watcher::Event::InitDone => None,
                })
            })
            .boxed()
    }
}

fn controller_of(pod: &Pod) -> Option<&OwnerReference> {
    pod.owner_references().iter().find(|r| {
        r.controller == Some(true)
            && r.kind == XDeployment::kind(&())
            && r.api_version == XDeployment::api_version(&())
    })
}

fn owner_of(pod: &Pod) -> Option<XDeploymentRef> {
    let controller = controller_of(pod)?;
    let mut owner = ObjectRef::new(&controller.name);
    if let Some(ns) = pod.namespace() {
        owner = owner.within(&ns);
    }
    Some(owner)
}

/// Pods whose controller is `owner`, matched on uid when it is known
fn owned_children(owner: &XDeploymentRef, uid: Option<&str>, pods: &[Pod]) -> Vec<ChildUnit> {
    pods.iter()
        .filter(|pod| {
            controller_of(pod).is_some_and(|r| {
                r.name == owner.name && uid.is_none_or(|uid| r.uid == uid)
            })
        })
        .map(|pod| child_from_pod(owner, pod))
        .collect()
}

fn build_pod(owner: &XDeployment, template: &ChildTemplate) -> Result<Pod> {
    let name = owner.name_any();
    let owner_ref = owner
        .controller_owner_ref(&())
        .ok_or_else(|| Error::MissingPrecondition(format!("{} has no uid yet", name)))?;

    let labels = BTreeMap::from([
        (OWNER_UID_LABEL.to_string(), owner_ref.uid.clone()),
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
    ]);

    let env: Vec<EnvVar> = template
        .env
        .iter()
        .map(|(k, v)| EnvVar {
            name: k.clone(),
            value: Some(v.clone()),
            ..Default::default()
        })
        .collect();

    let ports = template.port.map(|port| {
        vec![ContainerPort {
            container_port: port,
            ..Default::default()
        }]
    });

    let readiness_probe = template.port.map(|port| Probe {
        tcp_socket: Some(TCPSocketAction {
            port: IntOrString::Int(port),
            ..Default::default()
        }),
        period_seconds: Some(5),
        ..Default::default()
    });

    Ok(Pod {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-", name)),
            namespace: owner.namespace(),
            labels: Some(labels),
            owner_references: Some(vec![owner_ref]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            hostname: template.hostname.clone(),
            containers: vec![Container {
                name: CONTAINER_NAME.to_string(),
                image: Some(template.image.clone()),
                ports,
                env: (!env.is_empty()).then_some(env),
                readiness_probe,
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: None,
    })
}

fn child_from_pod(owner: &XDeploymentRef, pod: &Pod) -> ChildUnit {
    let image = pod
        .spec
        .as_ref()
        .and_then(|s| s.containers.first())
        .and_then(|c| c.image.clone())
        .unwrap_or_default();

    ChildUnit {
        id: pod.name_any(),
        owner: owner.clone(),
        image,
        created_at: pod
            .creation_timestamp()
            .map(|t| t.0)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
        terminating: pod.meta().deletion_timestamp.is_some(),
        failure: image_failure(pod),
        readiness: pod_readiness(pod),
    }
}

fn image_failure(pod: &Pod) -> Option<String> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .filter_map(|cs| cs.state.as_ref()?.waiting.as_ref()?.reason.clone())
        .find(|reason| IMAGE_FAILURES.contains(&reason.as_str()))
}

fn pod_readiness(pod: &Pod) -> Readiness {
    let condition = pod
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conds| conds.iter().find(|c| c.type_ == "Ready"));
    match condition.map(|c| c.status.as_str()) {
        Some("True") => Readiness::Ready,
        Some("False") => Readiness::NotReady,
        _ => Readiness::Unknown,
    }
}
