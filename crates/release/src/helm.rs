//! Release gateway backed by the `helm` binary (helm 3.13 or newer; release
//! labels carry the ownership marker).

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use helmsync_cache::{ChartDownloader, FetchError, PackageKey};
use helmsync_core::{ChartDef, DesiredRelease, Release, Template, Values};
use metrics::histogram;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::values::{checksum, ValuesResolver};
use crate::{GatewayError, InstallAction, InstallFailure, InstallOptions, Installed, ReleaseGateway};

/// Release label recording which `HelmRelease` manages a release.
pub const OWNER_LABEL: &str = "helmsync.dev/owner";

pub struct HelmCli {
    helm_bin: PathBuf,
    kube_context: Option<String>,
    values: Arc<ValuesResolver>,
}

impl HelmCli {
    pub fn new(helm_bin: impl Into<PathBuf>, kube_context: Option<String>, values: Arc<ValuesResolver>) -> Self {
        Self { helm_bin: helm_bin.into(), kube_context, values }
    }

    async fn run(&self, args: &[String]) -> Result<String, GatewayError> {
        let started = Instant::now();
        let mut cmd = Command::new(&self.helm_bin);
        if let Some(ctx) = &self.kube_context {
            cmd.arg("--kube-context").arg(ctx);
        }
        debug!(args = ?args, "helm");
        let output = cmd.args(args).output().await?;
        let verb = args.first().map(String::as_str).unwrap_or("");
        histogram!("helm_command_ms", started.elapsed().as_secs_f64() * 1000.0, "verb" => verb.to_string());
        if !output.status.success() {
            return Err(GatewayError::Helm {
                command: format!("helm {verb}"),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn owner(&self, namespace: &str, name: &str) -> Result<Option<String>, GatewayError> {
        let out = self.run(&args(["get", "metadata", name, "--namespace", namespace, "--output", "json"])).await?;
        let meta: MetadataJson = serde_json::from_str(&out).map_err(|e| GatewayError::Decode(e.to_string()))?;
        Ok(meta.labels.get(OWNER_LABEL).cloned())
    }
}

fn args<const N: usize>(a: [&str; N]) -> Vec<String> {
    a.iter().map(|s| s.to_string()).collect()
}

fn is_not_found(err: &GatewayError) -> bool {
    matches!(err, GatewayError::Helm { stderr, .. } if stderr.contains("release: not found"))
}

#[derive(Debug, Deserialize)]
struct ReleaseJson {
    name: String,
    #[serde(default)]
    namespace: String,
    version: u32,
    info: InfoJson,
    chart: ChartJson,
    #[serde(default)]
    config: Option<Values>,
}

#[derive(Debug, Deserialize)]
struct InfoJson {
    status: String,
}

#[derive(Debug, Deserialize)]
struct ChartJson {
    metadata: ChartMetaJson,
    #[serde(default)]
    templates: Vec<Template>,
    #[serde(default)]
    values: Option<Values>,
    #[serde(default)]
    files: Option<Vec<Template>>,
    #[serde(default)]
    schema: Option<String>,
    #[serde(default)]
    lock: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChartMetaJson {
    name: String,
    version: String,
    #[serde(default)]
    app_version: Option<String>,
    #[serde(flatten)]
    rest: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct MetadataJson {
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

impl ReleaseJson {
    fn parse(s: &str) -> Result<Self, GatewayError> {
        serde_json::from_str(s).map_err(|e| GatewayError::Decode(e.to_string()))
    }

    fn into_release(self, owner: Option<String>) -> Release {
        Release {
            name: self.name,
            namespace: self.namespace,
            chart: ChartDef {
                name: self.chart.metadata.name,
                version: self.chart.metadata.version,
                app_version: self.chart.metadata.app_version,
                metadata: self.chart.metadata.rest,
                values: self.chart.values.unwrap_or_default(),
                templates: self.chart.templates,
                files: self.chart.files.unwrap_or_default(),
                schema: self.chart.schema,
                lock: self.chart.lock,
            },
            values: self.config.unwrap_or_default(),
            revision: self.version,
            owner,
        }
    }
}

/// Whether a release in `status` may be upgraded; `None` means it should be
/// treated as absent.
fn upgradable(status: &str) -> Option<bool> {
    match status {
        "deployed" | "failed" => Some(true),
        "uninstalled" => None,
        _ => Some(false),
    }
}

fn install_args(
    chart_path: &Path,
    release_name: &str,
    hr: &DesiredRelease,
    action: InstallAction,
    opts: InstallOptions,
    values_file: &Path,
) -> Vec<String> {
    let mut a = vec![
        action.as_str().to_string(),
        release_name.to_string(),
        chart_path.display().to_string(),
        "--namespace".into(),
        hr.target_namespace(),
        "--values".into(),
        values_file.display().to_string(),
        "--output".into(),
        "json".into(),
        "--labels".into(),
        format!("{OWNER_LABEL}={}", hr.key().owner_marker()),
    ];
    match action {
        InstallAction::Install => a.push("--create-namespace".into()),
        InstallAction::Upgrade => {
            if hr.spec.reset_values {
                a.push("--reset-values".into());
            }
            if hr.spec.force_upgrade {
                a.push("--force".into());
            }
        }
    }
    if let Some(t) = hr.spec.timeout {
        a.push("--timeout".into());
        a.push(format!("{t}s"));
    }
    if opts.dry_run {
        a.push("--dry-run".into());
    }
    a
}

#[async_trait::async_trait]
impl ReleaseGateway for HelmCli {
    async fn get_upgradable_release(&self, namespace: &str, name: &str) -> Result<Option<Release>, GatewayError> {
        let out = match self.run(&args(["status", name, "--namespace", namespace, "--output", "json"])).await {
            Ok(out) => out,
            Err(e) if is_not_found(&e) => return Ok(None),
            Err(e) => return Err(e),
        };
        let rel = ReleaseJson::parse(&out)?;
        match upgradable(&rel.info.status) {
            None => return Ok(None),
            Some(false) => return Err(GatewayError::NotUpgradable { name: name.to_string(), status: rel.info.status }),
            Some(true) => {}
        }
        let owner = self.owner(namespace, name).await?;
        Ok(Some(rel.into_release(owner)))
    }

    async fn install(
        &self,
        chart_path: &Path,
        release_name: &str,
        hr: &DesiredRelease,
        action: InstallAction,
        opts: InstallOptions,
    ) -> Result<Installed, InstallFailure> {
        let values = self
            .values
            .values(&hr.metadata.namespace, chart_path, &hr.spec.values_from, &hr.spec.values)
            .await
            .map_err(GatewayError::from)?;
        let yaml = values.yaml().map_err(|e| GatewayError::from(crate::ValuesError::from(e)))?;
        let sum = checksum(&values).map_err(GatewayError::from)?;
        let fail = |error: GatewayError| InstallFailure { checksum: Some(sum.clone()), error };

        let mut file = tempfile::Builder::new()
            .prefix("helmsync-values-")
            .suffix(".yaml")
            .tempfile()
            .map_err(|e| fail(e.into()))?;
        file.write_all(yaml.as_bytes()).map_err(|e| fail(e.into()))?;

        let a = install_args(chart_path, release_name, hr, action, opts, file.path());
        let out = self.run(&a).await.map_err(fail)?;
        let rel = ReleaseJson::parse(&out).map_err(fail)?;
        Ok(Installed { release: rel.into_release(Some(hr.key().owner_marker())), checksum: sum })
    }

    async fn rollback(&self, hr: &DesiredRelease) -> Result<Release, GatewayError> {
        let name = hr.release_name();
        let ns = hr.target_namespace();
        let mut a = args(["rollback", &name, "--namespace", &ns]);
        if let Some(t) = hr.spec.timeout {
            a.push("--timeout".into());
            a.push(format!("{t}s"));
        }
        self.run(&a).await?;
        self.get_upgradable_release(&ns, &name).await?.ok_or(GatewayError::NotFound(name))
    }

    async fn uninstall(&self, hr: &DesiredRelease) -> Result<(), GatewayError> {
        let name = hr.release_name();
        match self.run(&args(["uninstall", &name, "--namespace", &hr.target_namespace()])).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn dependency_update(&self, chart_path: &Path) -> Result<(), GatewayError> {
        self.run(&args(["dependency", "update", &chart_path.display().to_string()])).await.map(|_| ())
    }
}

#[async_trait::async_trait]
impl ChartDownloader for HelmCli {
    async fn download(&self, key: &PackageKey, dest: &Path) -> Result<(), FetchError> {
        let parent = dest.parent().unwrap_or_else(|| Path::new("."));
        let tmp = tempfile::tempdir_in(parent)?;
        let a = args([
            "pull",
            &key.name,
            "--repo",
            &key.repository,
            "--version",
            &key.version,
            "--destination",
            &tmp.path().display().to_string(),
        ]);
        self.run(&a).await.map_err(|e| FetchError::download(key, e.to_string()))?;
        // helm names the archive after the chart metadata; take whatever it wrote.
        let mut entries = tokio::fs::read_dir(tmp.path()).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.path().extension().is_some_and(|e| e == "tgz") {
                tokio::fs::rename(entry.path(), dest).await?;
                return Ok(());
            }
        }
        Err(FetchError::download(key, "helm pull wrote no chart archive"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const STATUS: &str = r#"{
        "name": "apps-redis",
        "namespace": "apps",
        "version": 4,
        "info": { "status": "deployed", "description": "Upgrade complete" },
        "chart": {
            "metadata": { "name": "redis", "version": "1.2.3", "appVersion": "7.2", "description": "In-memory store" },
            "templates": [ { "name": "templates/deployment.yaml", "data": "a2luZDogRGVwbG95bWVudA==" } ],
            "files": [ { "name": "files/README", "data": "UkVBRE1F" } ],
            "schema": "eyJ0eXBlIjoib2JqZWN0In0=",
            "lock": null,
            "values": { "replicas": 1 }
        },
        "config": { "replicas": 3 },
        "manifest": "---\nkind: Deployment\n"
    }"#;

    fn hr() -> DesiredRelease {
        serde_json::from_value(json!({
            "metadata": { "namespace": "apps", "name": "redis", "uid": "1b4e28ba-2fa1-11d2-883f-0016d3cca427" },
            "spec": {
                "chart": { "repository": "https://charts.example.com", "name": "redis", "version": "1.2.3" },
                "targetNamespace": "data",
                "timeout": 300,
                "resetValues": true
            }
        }))
        .unwrap()
    }

    #[test]
    fn decodes_status_output() {
        let rel = ReleaseJson::parse(STATUS).unwrap().into_release(Some("0f3a".into()));
        assert_eq!(rel.name, "apps-redis");
        assert_eq!(rel.revision, 4);
        assert_eq!(rel.chart.name, "redis");
        assert_eq!(rel.chart.app_version.as_deref(), Some("7.2"));
        assert_eq!(rel.chart.templates.len(), 1);
        assert_eq!(rel.values.as_json(), json!({ "replicas": 3 }));
        assert_eq!(rel.chart.values.as_json(), json!({ "replicas": 1 }));
        assert_eq!(rel.chart.metadata.get("description"), Some(&json!("In-memory store")));
        assert_eq!(rel.chart.files.len(), 1);
        assert!(rel.chart.schema.is_some());
        assert_eq!(rel.owner.as_deref(), Some("0f3a"));
    }

    #[test]
    fn chart_files_schema_and_metadata_take_part_in_comparison() {
        let base = ReleaseJson::parse(STATUS).unwrap().into_release(None).chart;
        for (from, to) in [
            (r#""data": "UkVBRE1F""#, r#""data": "UkVBRE1FIHYy""#),
            (r#""schema": "eyJ0eXBlIjoib2JqZWN0In0=""#, r#""schema": "e30=""#),
            (r#""description": "In-memory store""#, r#""description": "Key-value store""#),
            (r#""lock": null"#, r#""lock": { "digest": "sha256:1f" }"#),
        ] {
            let edited = STATUS.replace(from, to);
            assert_ne!(edited, STATUS, "{from} not found in fixture");
            let other = ReleaseJson::parse(&edited).unwrap().into_release(None).chart;
            assert_ne!(base, other, "{from} -> {to}");
        }
        let same = ReleaseJson::parse(STATUS).unwrap().into_release(None).chart;
        assert_eq!(base, same);
    }

    #[test]
    fn null_config_is_empty_values() {
        let s = STATUS.replace(r#""config": { "replicas": 3 }"#, r#""config": null"#);
        let rel = ReleaseJson::parse(&s).unwrap().into_release(None);
        assert!(rel.values.is_empty());
    }

    #[test]
    fn pending_releases_are_not_upgradable() {
        assert_eq!(upgradable("deployed"), Some(true));
        assert_eq!(upgradable("failed"), Some(true));
        assert_eq!(upgradable("pending-upgrade"), Some(false));
        assert_eq!(upgradable("uninstalling"), Some(false));
        assert_eq!(upgradable("uninstalled"), None);
    }

    #[test]
    fn not_found_is_detected_from_stderr() {
        let e = GatewayError::Helm { command: "helm status".into(), stderr: "Error: release: not found".into() };
        assert!(is_not_found(&e));
        let e = GatewayError::Helm {
            command: "helm uninstall".into(),
            stderr: "Error: uninstall: Release not loaded: apps-redis: release: not found".into(),
        };
        assert!(is_not_found(&e));
        let e = GatewayError::Helm { command: "helm status".into(), stderr: "Error: Kubernetes cluster unreachable".into() };
        assert!(!is_not_found(&e));
        let e = GatewayError::Helm { command: "helm upgrade".into(), stderr: "Error: chart \"redis\" version \"9.9\" not found".into() };
        assert!(!is_not_found(&e));
    }

    #[test]
    fn install_args_carry_owner_and_options() {
        let hr = hr();
        let a = install_args(
            Path::new("/cache/redis-1.2.3.tgz"),
            "apps-redis",
            &hr,
            InstallAction::Upgrade,
            InstallOptions { dry_run: true },
            Path::new("/tmp/v.yaml"),
        );
        assert_eq!(&a[..3], &["upgrade", "apps-redis", "/cache/redis-1.2.3.tgz"]);
        let joined = a.join(" ");
        assert!(joined.contains("--namespace data"));
        assert!(joined.contains(&format!("--labels helmsync.dev/owner={}", hr.key().owner_marker())));
        assert!(joined.contains("--reset-values"));
        assert!(joined.contains("--timeout 300s"));
        assert!(joined.ends_with("--dry-run"));
        assert!(!joined.contains("--create-namespace"));

        let a = install_args(Path::new("/c"), "x", &hr, InstallAction::Install, InstallOptions::default(), Path::new("/v"));
        assert!(a.contains(&"--create-namespace".to_string()));
        assert!(!a.contains(&"--dry-run".to_string()));
        assert!(!a.contains(&"--reset-values".to_string()));
    }
}
