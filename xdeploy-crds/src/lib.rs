use thiserror::Error;

pub mod v1alpha1;

use kube::CustomResourceExt;

/// Label carrying the uid of the XDeployment that controls a child workload.
/// Names can outgrow the 63 character limit on label values, uids cannot.
pub const OWNER_UID_LABEL: &str = "xdeploy.dev/owner-uid";

/// Finalizer held on an XDeployment until all of its children are gone
pub const XDEPLOYMENT_FINALIZER: &str = "xdeployments.xdeploy.dev/cleanup";

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("yaml error: {0}")]
    YamlError(#[from] serde_yaml::Error),
}

pub fn crd_gen_xdeployment() -> Result<String> {
    Ok(format!(
        "---\n{}",
        serde_yaml::to_string(&v1alpha1::xdeployment::XDeployment::crd())?
    ))
}

pub fn crd_gen_all() -> Result<()> {
    print!("{}", crd_gen_xdeployment()?);
    Ok(())
}
