//! Deployed release records as reported by the deployment runtime.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::Values;

/// Chart definition carried by a release. Compared structurally against
/// the dry-run result to detect chart drift, so every part helm reports is
/// kept: metadata, default values, templates, plain files, schema and lock.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartDef {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub app_version: Option<String>,
    /// Remaining `Chart.yaml` fields (description, dependencies, annotations, ...).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Json>,
    /// Chart default values (values.yaml shipped with the chart).
    #[serde(default)]
    pub values: Values,
    #[serde(default)]
    pub templates: Vec<Template>,
    /// Non-template files (README, files read through `.Files.Get`, ...).
    #[serde(default)]
    pub files: Vec<Template>,
    /// `values.schema.json`, as helm encodes it.
    #[serde(default)]
    pub schema: Option<String>,
    /// `Chart.lock`.
    #[serde(default)]
    pub lock: Option<Json>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub name: String,
    pub namespace: String,
    pub chart: ChartDef,
    /// Resolved user-supplied values.
    pub values: Values,
    pub revision: u32,
    /// Ownership marker: [`crate::ResourceKey::owner_marker`] of the resource that manages this release.
    #[serde(default)]
    pub owner: Option<String>,
}
