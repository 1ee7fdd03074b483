use std::time::Duration;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::runtime::conditions;
use kube::runtime::wait::await_condition;
use kube::{Api, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::info;
use xdeploy_controller::{ControllerConfig, start_xdeployment_controller};
use xdeploy_crds::v1alpha1::xdeployment::{NAME_GROUP_XDEPLOYMENT, XDeployment};

use crate::{Error, Result, config::ControllerArgs};

const MANAGER: &str = "xdeploy";
const CRD_ESTABLISH_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn start(
    args: ControllerArgs,
    ready: CancellationToken,
    cancel: CancellationToken,
) -> Result<()> {
    let client = kube::Client::try_default().await?;
    apply_crds(client.clone()).await?;

    let config = ControllerConfig::from(&args);
    ready.cancel();
    start_xdeployment_controller(client, args.namespace, config, cancel).await?;
    Ok(())
}

pub async fn apply_crds(client: kube::Client) -> Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client);
    let ssapply = PatchParams::apply(MANAGER).force();
    crds.patch(
        NAME_GROUP_XDEPLOYMENT,
        &ssapply,
        &Patch::Apply(&XDeployment::crd()),
    )
    .await?;
    let established = await_condition(
        crds,
        NAME_GROUP_XDEPLOYMENT,
        conditions::is_crd_established(),
    );
    match tokio::time::timeout(CRD_ESTABLISH_TIMEOUT, established).await {
        Ok(o) => o?,
        Err(e) => return Err(Error::Other(e.to_string())),
    };
    info!("applied XDeployment CRD");
    Ok(())
}
