//! helmsync engine: decides, per `HelmRelease`, whether the deployed release
//! must be installed, upgraded or left alone, and records the result on the
//! resource status.

#![forbid(unsafe_code)]

use std::path::PathBuf;

use helmsync_core::{Condition, DesiredRelease, ResourceKey};
use helmsync_release::GatewayError;

mod sync;

pub use sync::{ChartChangeSync, Clients};

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory for charts fetched from chart repositories.
    pub chart_cache: PathBuf,
    /// Log a structural diff when a release has diverged.
    pub log_diffs: bool,
    /// Run `helm dependency update` on git charts before installing.
    pub update_deps: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self { chart_cache: std::env::temp_dir(), log_diffs: false, update_deps: false }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Installed,
    Upgraded,
    Unchanged,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Installed => "installed",
            Outcome::Upgraded => "upgraded",
            Outcome::Unchanged => "unchanged",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("{0} not found")]
    NotFound(ResourceKey),
    #[error("updating {key}: {reason}")]
    Api { key: ResourceKey, reason: String },
}

/// Why a pass ended without converging. By the time one is returned it has
/// been logged and, where the resource has a condition for it, recorded.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("chart source unavailable: {0}")]
    SourceResolution(String),
    #[error("failed to update chart dependencies: {0}")]
    DependencyUpdate(#[source] GatewayError),
    #[error("install failed: {0}")]
    Install(#[source] GatewayError),
    #[error("upgrade failed: {0}")]
    Upgrade(#[source] GatewayError),
    #[error("rollback failed: {0}")]
    Rollback(#[source] GatewayError),
    #[error("uninstall failed: {0}")]
    Uninstall(#[source] GatewayError),
    #[error("spec of {0} changed since the upgrade was decided")]
    SpecDiverged(ResourceKey),
    #[error("release '{release}' does not belong to {resource}")]
    OwnershipConflict { release: String, resource: ResourceKey },
    #[error("unable to proceed with release: {0}")]
    ReleaseLookup(#[source] GatewayError),
    #[error("unable to determine if release has changed: {0}")]
    DryRun(#[source] GatewayError),
    #[error(transparent)]
    Status(#[from] StatusError),
}

/// Writes to the status subresource of a `HelmRelease`. Every call is an
/// independent last-write-wins update.
#[async_trait::async_trait]
pub trait StatusReporter: Send + Sync {
    async fn set_condition(&self, key: &ResourceKey, condition: Condition) -> Result<(), StatusError>;
    async fn set_observed_generation(&self, key: &ResourceKey, generation: i64) -> Result<(), StatusError>;
    /// Chart revision the release was built from: git head or chart version.
    async fn set_release_revision(&self, key: &ResourceKey, revision: &str) -> Result<(), StatusError>;
    async fn set_values_checksum(&self, key: &ResourceKey, checksum: &str) -> Result<(), StatusError>;
}

/// Read access to the current `HelmRelease` resources.
#[async_trait::async_trait]
pub trait DesiredReleases: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<DesiredRelease, StatusError>;
}
