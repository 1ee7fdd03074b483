use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("crd error: {0}")]
    CrdError(#[from] xdeploy_crds::Error),

    #[error("controller error: {0}")]
    ControllerError(#[from] xdeploy_controller::Error),

    #[error("wait error: {0}")]
    WaitError(#[from] kube::runtime::wait::Error),

    #[error("other error: {0}")]
    Other(String),
}
