use thiserror::Error;
use xdeploy_crds::v1alpha1::xdeployment::ValidationError;
use xdeploy_k8s_utils::{is_conflict, is_not_found};

#[derive(Error, Debug)]
pub enum Error {
    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("invalid spec: {0}")]
    InvalidSpec(#[from] ValidationError),

    #[error("driver error: {0}")]
    Driver(String),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("resource version conflict")]
    Conflict,

    #[error("resource not found")]
    NotFound,

    #[error("missing precondition: {0}")]
    MissingPrecondition(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// How the worker loop treats a failed reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The spec is unusable until the requester fixes it
    Validation,
    /// Store or driver trouble, retried with backoff
    Transient,
    /// The object changed underneath us, retried right away
    Conflict,
    /// The object is gone
    NotFound,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::InvalidSpec(_) => ErrorClass::Validation,
            Error::Conflict => ErrorClass::Conflict,
            Error::NotFound => ErrorClass::NotFound,
            Error::KubeError(e) if is_conflict(e) => ErrorClass::Conflict,
            Error::KubeError(e) if is_not_found(e) => ErrorClass::NotFound,
            Error::KubeError(_)
            | Error::Driver(_)
            | Error::Timeout(_)
            | Error::MissingPrecondition(_)
            | Error::Json(_) => ErrorClass::Transient,
        }
    }

    pub fn metric_label(&self) -> String {
        match self {
            Error::KubeError(_) => "kube",
            Error::InvalidSpec(e) => e.reason(),
            Error::Driver(_) => "driver",
            Error::Timeout(_) => "timeout",
            Error::Conflict => "conflict",
            Error::NotFound => "not_found",
            Error::MissingPrecondition(_) => "missing_precondition",
            Error::Json(_) => "json",
        }
        .to_lowercase()
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
