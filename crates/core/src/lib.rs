//! helmsync core types: the desired-state `HelmRelease`, the deployed
//! `Release`, values and the condition model shared by every crate.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub mod condition;
pub mod release;
pub mod values;

pub use condition::{Condition, ConditionStatus, ConditionType, Reason};
pub use release::{ChartDef, Release, Template};
pub use values::{values_checksum, Values};

const OWNER_MARKER_LEN: usize = 40;

/// Kind segment used in resource identities (`namespace:helmrelease/name`).
pub const KIND_SEGMENT: &str = "helmrelease";

/// Identity of a desired-state resource. Used as registry key and as the
/// ownership marker recorded on releases.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Ownership marker recorded as a release label. Label values are capped
    /// at 63 characters, so the key is hashed to a fixed 40 hex characters.
    pub fn owner_marker(&self) -> String {
        let digest = Sha256::digest(self.to_string().as_bytes());
        let mut marker = hex::encode(digest);
        marker.truncate(OWNER_MARKER_LEN);
        marker
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.namespace, KIND_SEGMENT, self.name)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid resource id: {0} (expect namespace:helmrelease/name)")]
pub struct KeyParseError(pub String);

impl FromStr for ResourceKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (namespace, rest) = s.split_once(':').ok_or_else(|| KeyParseError(s.to_string()))?;
        let (kind, name) = rest.split_once('/').ok_or_else(|| KeyParseError(s.to_string()))?;
        if namespace.is_empty() || name.is_empty() || !kind.eq_ignore_ascii_case(KIND_SEGMENT) {
            return Err(KeyParseError(s.to_string()));
        }
        Ok(Self::new(namespace, name))
    }
}

/// Object metadata the engine cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMeta {
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub generation: i64,
}

/// User-authored declaration of which chart, version and values should be deployed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredRelease {
    pub metadata: ResourceMeta,
    pub spec: HelmReleaseSpec,
    #[serde(default)]
    pub status: HelmReleaseStatus,
}

impl DesiredRelease {
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.metadata.namespace.clone(), self.metadata.name.clone())
    }

    /// Release name, defaulting to `<namespace>-<name>`.
    pub fn release_name(&self) -> String {
        match self.spec.release_name.as_deref() {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => format!("{}-{}", self.metadata.namespace, self.metadata.name),
        }
    }

    /// Namespace the release is installed into, defaulting to the resource namespace.
    pub fn target_namespace(&self) -> String {
        match self.spec.target_namespace.as_deref() {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => self.metadata.namespace.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelmReleaseSpec {
    #[serde(default)]
    pub release_name: Option<String>,
    #[serde(default)]
    pub target_namespace: Option<String>,
    pub chart: ChartSourceSpec,
    #[serde(default)]
    pub values_from: Vec<ValuesFromSource>,
    #[serde(default)]
    pub values: Values,
    #[serde(default)]
    pub rollback: Rollback,
    /// Seconds helm waits for individual operations.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub reset_values: bool,
    #[serde(default)]
    pub force_upgrade: bool,
}

/// Where the chart comes from: a path inside a git repository, or a
/// versioned package in a chart repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChartSourceSpec {
    #[serde(rename_all = "camelCase")]
    Git {
        git: String,
        #[serde(rename = "ref", default)]
        git_ref: Option<String>,
        path: String,
        #[serde(default)]
        skip_dep_update: bool,
    },
    Repo {
        repository: String,
        name: String,
        version: String,
    },
}

impl ChartSourceSpec {
    pub const DEFAULT_REF: &'static str = "master";

    pub fn is_git(&self) -> bool {
        matches!(self, ChartSourceSpec::Git { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ValuesFromSource {
    ConfigMapKeyRef(KeyRef),
    SecretKeyRef(KeyRef),
    ChartFileRef(ChartFileRef),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRef {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub optional: bool,
}

impl KeyRef {
    pub const DEFAULT_KEY: &'static str = "values.yaml";

    pub fn key_or_default(&self) -> &str {
        self.key.as_deref().unwrap_or(Self::DEFAULT_KEY)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartFileRef {
    pub path: String,
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rollback {
    #[serde(default)]
    pub enable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelmReleaseStatus {
    #[serde(default)]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub values_checksum: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}
