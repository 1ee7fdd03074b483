use std::collections::BTreeMap;

use kube::CustomResource;
use kube::KubeSchema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const NAME_GROUP_XDEPLOYMENT: &str = "xdeployments.xdeploy.dev";

pub const DEFAULT_REPLICAS: i32 = 1;

pub const CONDITION_AVAILABLE: &str = "Available";
pub const CONDITION_PROGRESSING: &str = "Progressing";
pub const CONDITION_INVALID_SPEC: &str = "InvalidSpec";
pub const CONDITION_IMAGE_PULL_FAILING: &str = "ImagePullFailing";

const MAX_HOSTNAME_LEN: usize = 63;

#[derive(
    CustomResource, KubeSchema, Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug,
)]
#[kube(
    group = "xdeploy.dev",
    version = "v1alpha1",
    kind = "XDeployment",
    shortname = "xd",
    status = "XDeploymentStatus",
    derive = "Default",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.replicas"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct XDeploymentSpec {
    /// Container image every child runs
    pub image: String,
    /// Number of children to keep running, defaults to 1
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// Port the container listens on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    /// Hostname assigned to each child
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Environment passed to the container
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

// Fields are never skipped when serializing so a merge patch of the status
// clears values that are no longer set.
#[derive(Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct XDeploymentStatus {
    /// Number of children observed ready
    #[serde(default)]
    pub replicas: i32,
    /// Number of children running the current image
    #[serde(default)]
    pub updated_replicas: Option<i32>,
    /// Generation of the spec this status was computed from
    #[serde(default)]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub conditions: Vec<XDeploymentCondition>,
}

#[derive(Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct XDeploymentCondition {
    #[serde(rename = "type")]
    pub type_: String,
    /// One of True, False or Unknown
    pub status: String,
    pub reason: String,
    pub message: String,
    /// RFC 3339 timestamp of the last status flip
    pub last_transition_time: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("image must not be empty")]
    EmptyImage,

    #[error("replicas must be >= 0, got {0}")]
    NegativeReplicas(i32),

    #[error("port must be within 1-65535, got {0}")]
    PortOutOfRange(i32),

    #[error("hostname {0:?} is not a valid DNS label")]
    InvalidHostname(String),

    #[error("environment variable names must not be empty")]
    EmptyEnvName,
}

impl ValidationError {
    /// CamelCase reason used on the InvalidSpec condition
    pub fn reason(&self) -> &'static str {
        match self {
            ValidationError::EmptyImage => "EmptyImage",
            ValidationError::NegativeReplicas(_) => "NegativeReplicas",
            ValidationError::PortOutOfRange(_) => "PortOutOfRange",
            ValidationError::InvalidHostname(_) => "InvalidHostname",
            ValidationError::EmptyEnvName => "EmptyEnvName",
        }
    }
}

impl XDeploymentSpec {
    pub fn desired_replicas(&self) -> i32 {
        self.replicas.unwrap_or(DEFAULT_REPLICAS)
    }

    /// Hostname with the empty string treated as unset
    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref().filter(|h| !h.is_empty())
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.image.trim().is_empty() {
            return Err(ValidationError::EmptyImage);
        }
        if let Some(replicas) = self.replicas
            && replicas < 0
        {
            return Err(ValidationError::NegativeReplicas(replicas));
        }
        if let Some(port) = self.port
            && !(1..=65535).contains(&port)
        {
            return Err(ValidationError::PortOutOfRange(port));
        }
        if let Some(hostname) = self.hostname()
            && !is_dns_label(hostname)
        {
            return Err(ValidationError::InvalidHostname(hostname.to_string()));
        }
        if self.env.keys().any(|k| k.is_empty()) {
            return Err(ValidationError::EmptyEnvName);
        }
        Ok(())
    }
}

impl XDeploymentStatus {
    pub fn condition(&self, type_: &str) -> Option<&XDeploymentCondition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}

fn is_dns_label(s: &str) -> bool {
    if s.len() > MAX_HOSTNAME_LEN {
        return false;
    }
    let bytes = s.as_bytes();
    let (Some(first), Some(last)) = (bytes.first(), bytes.last()) else {
        return false;
    };
    first.is_ascii_alphanumeric()
        && last.is_ascii_alphanumeric()
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
}
