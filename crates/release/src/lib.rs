//! helmsync release gateway: the operations the engine performs against the
//! deployment runtime, plus values resolution and structural release diffs.

#![forbid(unsafe_code)]

use std::path::Path;

use helmsync_core::{DesiredRelease, Release};

pub mod diff;
pub mod helm;
pub mod values;

pub use diff::{changes, Change};
pub use helm::HelmCli;
pub use values::{checksum, RefKind, ValuesError, ValuesLookup, ValuesResolver};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallAction {
    Install,
    Upgrade,
}

impl InstallAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstallAction::Install => "install",
            InstallAction::Upgrade => "upgrade",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstallOptions {
    pub dry_run: bool,
}

/// Outcome of a successful install or upgrade.
#[derive(Debug, Clone)]
pub struct Installed {
    pub release: Release,
    /// Checksum of the values the release was rendered with.
    pub checksum: String,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{command}: {stderr}")]
    Helm { command: String, stderr: String },
    #[error("release {name} is not upgradable (status {status})")]
    NotUpgradable { name: String, status: String },
    #[error("release {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Values(#[from] ValuesError),
    #[error("decoding helm output: {0}")]
    Decode(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// A failed install or upgrade; carries the checksum of the values that
/// were attempted when they could be resolved.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct InstallFailure {
    pub checksum: Option<String>,
    #[source]
    pub error: GatewayError,
}

impl From<GatewayError> for InstallFailure {
    fn from(error: GatewayError) -> Self {
        Self { checksum: None, error }
    }
}

/// Operations against the deployment runtime.
#[async_trait::async_trait]
pub trait ReleaseGateway: Send + Sync {
    /// Current release, `None` if there is none. Errors when the release
    /// exists but is in a state that cannot be upgraded.
    async fn get_upgradable_release(&self, namespace: &str, name: &str) -> Result<Option<Release>, GatewayError>;

    async fn install(
        &self,
        chart_path: &Path,
        release_name: &str,
        hr: &DesiredRelease,
        action: InstallAction,
        opts: InstallOptions,
    ) -> Result<Installed, InstallFailure>;

    async fn rollback(&self, hr: &DesiredRelease) -> Result<Release, GatewayError>;

    async fn uninstall(&self, hr: &DesiredRelease) -> Result<(), GatewayError>;

    /// Refresh the chart's dependencies in place.
    async fn dependency_update(&self, chart_path: &Path) -> Result<(), GatewayError>;

    /// Whether `release` carries the ownership marker of `hr`.
    fn managed_by_resource(&self, release: &Release, hr: &DesiredRelease) -> bool {
        release.owner.as_deref() == Some(hr.key().owner_marker().as_str())
    }
}
