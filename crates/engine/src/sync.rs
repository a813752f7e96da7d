use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use helmsync_cache::{ChartDownloader, PackageCache};
use helmsync_core::{ChartDef, ChartSourceSpec, Condition, ConditionStatus, ConditionType, DesiredRelease, Reason, Release, ResourceKey};
use helmsync_release::{checksum, diff, InstallAction, InstallOptions, ReleaseGateway, ValuesResolver};
use helmsync_source::{ChartSourceLock, ChartSourceRegistry};
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::{Config, DesiredReleases, Outcome, ReconcileError, StatusReporter};

/// External services the engine talks to.
#[derive(Clone)]
pub struct Clients {
    pub gateway: Arc<dyn ReleaseGateway>,
    pub status: Arc<dyn StatusReporter>,
    pub releases: Arc<dyn DesiredReleases>,
    pub values: Arc<ValuesResolver>,
}

/// Keeps releases in line with their `HelmRelease` resources.
pub struct ChartChangeSync {
    config: Config,
    clients: Clients,
    sources: Arc<ChartSourceRegistry>,
    cache: PackageCache,
    /// One pass at a time per resource, whichever scheduler started it.
    passes: Mutex<FxHashMap<ResourceKey, Arc<tokio::sync::Mutex<()>>>>,
}

/// A resolved chart plus, for git charts, the lock that keeps its export in place.
struct ResolvedChart {
    path: PathBuf,
    revision: String,
    _lock: Option<ChartSourceLock>,
}

impl ChartChangeSync {
    pub fn new(config: Config, clients: Clients, sources: Arc<ChartSourceRegistry>, downloader: Arc<dyn ChartDownloader>) -> Self {
        let cache = PackageCache::new(config.chart_cache.clone(), downloader);
        Self { config, clients, sources, cache, passes: Mutex::new(FxHashMap::default()) }
    }

    /// Wait for any other pass over `key` to finish.
    async fn pass_lock(&self, key: &ResourceKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut passes = self.passes.lock().unwrap_or_else(|p| p.into_inner());
            Arc::clone(passes.entry(key.clone()).or_default())
        };
        lock.lock_owned().await
    }

    /// Examine the release of `hr` and install or upgrade it when it does
    /// not match. The observed generation is recorded whatever happens.
    /// Passes over the same resource run one after another.
    pub async fn reconcile(&self, hr: &DesiredRelease) -> Result<Outcome, ReconcileError> {
        let _pass = self.pass_lock(&hr.key()).await;
        let started = Instant::now();
        let result = self.reconcile_release(hr).await;
        self.update_observed_generation(hr).await;
        histogram!("reconcile_ms", started.elapsed().as_secs_f64() * 1000.0);
        match &result {
            Ok(outcome) => counter!("reconcile_total", 1u64, "outcome" => outcome.as_str()),
            Err(_) => counter!("reconcile_errors_total", 1u64),
        }
        result
    }

    async fn reconcile_release(&self, hr: &DesiredRelease) -> Result<Outcome, ReconcileError> {
        let key = hr.key();
        let release_name = hr.release_name();
        let target_ns = hr.target_namespace();

        // Held until the end of the pass for git charts.
        let chart = self.resolve_chart(hr).await?;

        let current = match self.clients.gateway.get_upgradable_release(&target_ns, &release_name).await {
            Ok(current) => current,
            Err(e) => {
                warn!(release = %release_name, target_namespace = %target_ns, resource = %key, error = %e, "unable to proceed with release");
                return Err(ReconcileError::ReleaseLookup(e));
            }
        };

        let Some(current) = current else {
            return self.install(hr, &chart).await;
        };

        if !self.clients.gateway.managed_by_resource(&current, hr) {
            let msg = format!("release '{release_name}' does not belong to HelmRelease {key}");
            self.set_condition(hr, ConditionType::Released, ConditionStatus::False, Reason::HelmUpgradeFailed, msg.clone()).await;
            warn!(
                release = %release_name, target_namespace = %target_ns, resource = %key,
                "{msg}, this may be an indication that multiple HelmReleases with the same release name exist"
            );
            return Err(ReconcileError::OwnershipConflict { release: release_name, resource: key });
        }

        if !self.should_upgrade(&chart.path, &current, hr).await? {
            debug!(release = %release_name, resource = %key, "release up to date");
            return Ok(Outcome::Unchanged);
        }

        let fresh = match self.clients.releases.get(&key.namespace, &key.name).await {
            Ok(fresh) => fresh,
            Err(e) => {
                warn!(release = %release_name, resource = %key, error = %e, "failed to retrieve HelmRelease scheduled for upgrade");
                return Err(e.into());
            }
        };
        if fresh.spec != hr.spec {
            warn!(
                release = %release_name, resource = %key,
                "HelmRelease spec has diverged since we calculated if we should upgrade, skipping upgrade"
            );
            return Err(ReconcileError::SpecDiverged(key));
        }

        match self.clients.gateway.install(&chart.path, &release_name, hr, InstallAction::Upgrade, InstallOptions::default()).await {
            Ok(installed) => {
                self.set_condition(hr, ConditionType::Released, ConditionStatus::True, Reason::HelmSuccess, "helm upgrade succeeded").await;
                self.record_release(hr, &chart.revision, &installed.checksum).await;
                info!(release = %release_name, target_namespace = %target_ns, resource = %key, revision = installed.release.revision, "release upgraded");
                Ok(Outcome::Upgraded)
            }
            Err(failure) => {
                self.set_condition(hr, ConditionType::Released, ConditionStatus::False, Reason::HelmUpgradeFailed, failure.to_string()).await;
                if let Some(sum) = &failure.checksum {
                    if let Err(e) = self.clients.status.set_values_checksum(&key, sum).await {
                        warn!(resource = %key, error = %e, "could not update the values checksum");
                    }
                }
                warn!(release = %release_name, target_namespace = %target_ns, resource = %key, error = %failure, "failed to upgrade chart");
                // Already logged and recorded as a RolledBack condition.
                let _ = self.rollback_release(hr).await;
                Err(ReconcileError::Upgrade(failure.error))
            }
        }
    }

    async fn resolve_chart(&self, hr: &DesiredRelease) -> Result<ResolvedChart, ReconcileError> {
        let key = hr.key();
        match &hr.spec.chart {
            ChartSourceSpec::Git { path, skip_dep_update, .. } => {
                let Some(source) = self.sources.load(hr).await else {
                    return Err(ReconcileError::SourceResolution(format!("git chart source for {key} is not ready")));
                };
                let lock = source.lock().await;
                let chart_path = lock.chart_path(path);
                if self.config.update_deps && !skip_dep_update {
                    if let Err(e) = self.clients.gateway.dependency_update(&chart_path).await {
                        self.set_condition(hr, ConditionType::Released, ConditionStatus::False, Reason::UpdateDependencyFailed, e.to_string())
                            .await;
                        warn!(release = %hr.release_name(), resource = %key, error = %e, "failed to update chart dependencies");
                        return Err(ReconcileError::DependencyUpdate(e));
                    }
                }
                let revision = lock.head().revision().to_string();
                Ok(ResolvedChart { path: chart_path, revision, _lock: Some(lock) })
            }
            ChartSourceSpec::Repo { repository, name, version } => match self.cache.fetch(repository, name, version).await {
                Ok(path) => {
                    let file = path.file_name().map(|f| f.to_string_lossy().into_owned()).unwrap_or_default();
                    self.set_condition(hr, ConditionType::ChartFetched, ConditionStatus::True, Reason::RepoChartInCache, format!("chart fetched: {file}"))
                        .await;
                    Ok(ResolvedChart { path, revision: version.clone(), _lock: None })
                }
                Err(e) => {
                    self.set_condition(
                        hr,
                        ConditionType::ChartFetched,
                        ConditionStatus::False,
                        Reason::RepoFetchFailed,
                        format!("chart download failed: {e}"),
                    )
                    .await;
                    info!(resource = %key, error = %e, "chart download failed");
                    Err(ReconcileError::SourceResolution(e.to_string()))
                }
            },
        }
    }

    async fn install(&self, hr: &DesiredRelease, chart: &ResolvedChart) -> Result<Outcome, ReconcileError> {
        let release_name = hr.release_name();
        match self.clients.gateway.install(&chart.path, &release_name, hr, InstallAction::Install, InstallOptions::default()).await {
            Ok(installed) => {
                self.set_condition(hr, ConditionType::Released, ConditionStatus::True, Reason::HelmSuccess, "helm install succeeded").await;
                self.record_release(hr, &chart.revision, &installed.checksum).await;
                info!(release = %release_name, target_namespace = %hr.target_namespace(), resource = %hr.key(), "release installed");
                Ok(Outcome::Installed)
            }
            Err(failure) => {
                self.set_condition(hr, ConditionType::Released, ConditionStatus::False, Reason::HelmInstallFailed, failure.to_string()).await;
                warn!(release = %release_name, resource = %hr.key(), error = %failure, "failed to install chart");
                Err(ReconcileError::Install(failure.error))
            }
        }
    }

    /// Whether the release rendered from `chart_path` differs from `current`,
    /// in its values or in its chart. Rendering is a dry-run install under a
    /// throwaway name.
    pub async fn should_upgrade(&self, chart_path: &Path, current: &Release, hr: &DesiredRelease) -> Result<bool, ReconcileError> {
        let temp_name = if hr.metadata.uid.is_empty() { format!("{}-dry-run", hr.release_name()) } else { hr.metadata.uid.clone() };
        let desired = match self
            .clients
            .gateway
            .install(chart_path, &temp_name, hr, InstallAction::Install, InstallOptions { dry_run: true })
            .await
        {
            Ok(installed) => installed.release,
            Err(failure) => {
                warn!(release = %hr.release_name(), resource = %hr.key(), error = %failure, "unable to determine if release has changed");
                return Err(ReconcileError::DryRun(failure.error));
            }
        };

        if current.values != desired.values {
            if self.config.log_diffs {
                let changes = diff::changes(&current.values.as_json(), &desired.values.as_json());
                info!(
                    release = %hr.release_name(), target_namespace = %hr.target_namespace(), resource = %hr.key(),
                    diff = %diff::render(&changes), "release {}: values have diverged", current.name
                );
            }
            return Ok(true);
        }
        if current.chart != desired.chart {
            if self.config.log_diffs {
                let as_json = |c: &ChartDef| serde_json::to_value(c).unwrap_or_default();
                let changes = diff::changes(&as_json(&current.chart), &as_json(&desired.chart));
                info!(
                    release = %hr.release_name(), target_namespace = %hr.target_namespace(), resource = %hr.key(),
                    diff = %diff::render(&changes), "release {}: chart has diverged", current.name
                );
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// Roll the release of `hr` back when its rollback policy allows it.
    pub async fn rollback_release(&self, hr: &DesiredRelease) -> Result<(), ReconcileError> {
        let result = self.rollback(hr).await;
        self.update_observed_generation(hr).await;
        result
    }

    async fn rollback(&self, hr: &DesiredRelease) -> Result<(), ReconcileError> {
        if !hr.spec.rollback.enable {
            return Ok(());
        }
        counter!("rollback_total", 1u64);
        match self.clients.gateway.rollback(hr).await {
            Ok(release) => {
                self.set_condition(hr, ConditionType::RolledBack, ConditionStatus::True, Reason::HelmSuccess, "helm rollback succeeded").await;
                info!(release = %hr.release_name(), resource = %hr.key(), revision = release.revision, "release rolled back");
                Ok(())
            }
            Err(e) => {
                warn!(
                    release = %hr.release_name(), target_namespace = %hr.target_namespace(), resource = %hr.key(), error = %e,
                    "unable to rollback chart release"
                );
                self.set_condition(hr, ConditionType::RolledBack, ConditionStatus::False, Reason::HelmRollbackFailed, e.to_string()).await;
                Err(ReconcileError::Rollback(e))
            }
        }
    }

    /// Uninstall the release of a deleted `HelmRelease` and forget its chart
    /// source. The source is dropped even when the uninstall fails.
    pub async fn delete_release(&self, hr: &DesiredRelease) -> Result<(), ReconcileError> {
        let key = hr.key();
        let pass = self.pass_lock(&key).await;
        let result = match self.clients.gateway.uninstall(hr).await {
            Ok(()) => {
                info!(release = %hr.release_name(), resource = %hr.key(), "release deleted");
                Ok(())
            }
            Err(e) => {
                warn!(
                    release = %hr.release_name(), target_namespace = %hr.target_namespace(), resource = %hr.key(), error = %e,
                    "chart release not deleted"
                );
                Err(ReconcileError::Uninstall(e))
            }
        };
        self.sources.delete(&key).await;
        drop(pass);
        self.passes.lock().unwrap_or_else(|p| p.into_inner()).remove(&key);
        result
    }

    /// Recompute the values checksum of `hr` and compare it with the one last
    /// recorded. Any failure along the way counts as a mismatch.
    pub async fn compare_values_checksum(&self, hr: &DesiredRelease) -> bool {
        let chart_path = match &hr.spec.chart {
            ChartSourceSpec::Git { path, .. } => {
                let Some(source) = self.sources.load(hr).await else { return false };
                let lock = source.lock().await;
                lock.chart_path(path)
            }
            ChartSourceSpec::Repo { repository, name, version } => match self.cache.fetch(repository, name, version).await {
                Ok(path) => path,
                Err(e) => {
                    debug!(resource = %hr.key(), error = %e, "chart unavailable for checksum");
                    return false;
                }
            },
        };
        let values = match self
            .clients
            .values
            .values(&hr.metadata.namespace, &chart_path, &hr.spec.values_from, &hr.spec.values)
            .await
        {
            Ok(values) => values,
            Err(e) => {
                debug!(resource = %hr.key(), error = %e, "values unavailable for checksum");
                return false;
            }
        };
        match checksum(&values) {
            Ok(sum) => hr.status.values_checksum.as_deref() == Some(sum.as_str()),
            Err(_) => false,
        }
    }

    /// Pull new commits for every tracked git source. Returns the resources
    /// whose chart moved.
    pub async fn sync_mirrors(&self) -> Vec<ResourceKey> {
        self.sources.sync_mirrors().await
    }

    async fn record_release(&self, hr: &DesiredRelease, revision: &str, sum: &str) {
        let key = hr.key();
        if let Err(e) = self.clients.status.set_release_revision(&key, revision).await {
            warn!(resource = %key, error = %e, "could not update the release revision");
        }
        if let Err(e) = self.clients.status.set_values_checksum(&key, sum).await {
            warn!(resource = %key, error = %e, "could not update the values checksum");
        }
    }

    async fn set_condition(&self, hr: &DesiredRelease, kind: ConditionType, status: ConditionStatus, reason: Reason, message: impl Into<String>) {
        let key = hr.key();
        if let Err(e) = self.clients.status.set_condition(&key, Condition::new(kind, status, reason, message)).await {
            warn!(resource = %key, condition = kind.as_str(), error = %e, "could not update condition");
        }
    }

    async fn update_observed_generation(&self, hr: &DesiredRelease) {
        let key = hr.key();
        if let Err(e) = self.clients.status.set_observed_generation(&key, hr.metadata.generation).await {
            warn!(resource = %key, error = %e, "could not update the observed generation");
        }
    }
}
