//! helmsync kubehub: `HelmRelease` access over the dynamic API, status
//! subresource updates, ConfigMap/Secret values lookup and the watcher that
//! feeds resource changes to the operator.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use futures::TryStreamExt;
use helmsync_core::{Condition, DesiredRelease, HelmReleaseStatus, ResourceKey, ResourceMeta};
use helmsync_engine::{DesiredReleases, StatusError, StatusReporter};
use helmsync_release::{ValuesError, ValuesLookup};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    runtime::watcher::{self, Event},
    Client,
};
use metrics::counter;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const GROUP: &str = "helmsync.dev";
pub const VERSION: &str = "v1";
pub const KIND: &str = "HelmRelease";
pub const PLURAL: &str = "helmreleases";

pub fn api_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(GROUP, VERSION, KIND), PLURAL)
}

/// Typed view of a `HelmRelease` object.
pub fn desired_from(obj: &DynamicObject) -> Result<DesiredRelease> {
    let name = obj.metadata.name.clone().ok_or_else(|| anyhow!("HelmRelease missing metadata.name"))?;
    let namespace = obj.metadata.namespace.clone().unwrap_or_default();
    let spec = obj.data.get("spec").cloned().ok_or_else(|| anyhow!("HelmRelease {namespace}/{name} has no spec"))?;
    let spec = serde_json::from_value(spec).with_context(|| format!("parsing spec of HelmRelease {namespace}/{name}"))?;
    let status: HelmReleaseStatus = match obj.data.get("status") {
        Some(s) if !s.is_null() => serde_json::from_value(s.clone()).unwrap_or_else(|e| {
            debug!(resource = %ResourceKey::new(&namespace, &name), error = %e, "ignoring unreadable status");
            HelmReleaseStatus::default()
        }),
        _ => HelmReleaseStatus::default(),
    };
    Ok(DesiredRelease {
        metadata: ResourceMeta {
            namespace,
            name,
            uid: obj.metadata.uid.clone().unwrap_or_default(),
            generation: obj.metadata.generation.unwrap_or_default(),
        },
        spec,
        status,
    })
}

/// Whether the spec moved since the last pass recorded its generation.
/// Status-only writes do not bump the generation.
pub fn spec_changed(hr: &DesiredRelease) -> bool {
    hr.status.observed_generation != Some(hr.metadata.generation)
}

/// A change to a `HelmRelease` seen by [`KubeHub::watch`].
#[derive(Debug, Clone)]
pub enum ResourceChange {
    Applied(DesiredRelease),
    Deleted(DesiredRelease),
}

#[derive(Clone)]
pub struct KubeHub {
    client: Client,
    /// Restrict to one namespace; `None` watches all of them.
    namespace: Option<String>,
}

impl KubeHub {
    pub async fn connect(namespace: Option<String>) -> Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        Ok(Self { client, namespace })
    }

    fn scoped(&self) -> Api<DynamicObject> {
        match &self.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &api_resource()),
            None => Api::all_with(self.client.clone(), &api_resource()),
        }
    }

    fn namespaced(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &api_resource())
    }

    /// Every `HelmRelease` in scope. Objects that do not parse are skipped.
    pub async fn list(&self) -> Result<Vec<DesiredRelease>> {
        let objs = self.scoped().list(&ListParams::default()).await.context("listing HelmReleases")?;
        let mut out = Vec::with_capacity(objs.items.len());
        for obj in &objs.items {
            match desired_from(obj) {
                Ok(hr) => out.push(hr),
                Err(e) => warn!(error = %e, "skipping HelmRelease"),
            }
        }
        Ok(out)
    }

    /// Watch `HelmRelease` objects and forward spec changes and deletions.
    /// Returns when the receiver is gone or the stream ends.
    pub async fn watch(&self, tx: mpsc::Sender<ResourceChange>) -> Result<()> {
        let stream = watcher::watcher(self.scoped(), watcher::Config::default());
        futures::pin_mut!(stream);
        info!(ns = ?self.namespace, "HelmRelease watcher started");
        while let Some(ev) = stream.try_next().await? {
            let change = match ev {
                Event::Applied(o) => match desired_from(&o) {
                    Ok(hr) if spec_changed(&hr) => ResourceChange::Applied(hr),
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(error = %e, "skipping HelmRelease");
                        continue;
                    }
                },
                Event::Deleted(o) => match desired_from(&o) {
                    Ok(hr) => ResourceChange::Deleted(hr),
                    Err(e) => {
                        warn!(error = %e, "skipping deleted HelmRelease");
                        continue;
                    }
                },
                // The periodic sweep covers a relist.
                Event::Restarted(list) => {
                    debug!(count = list.len(), "watch restart");
                    continue;
                }
            };
            if tx.send(change).await.is_err() {
                return Ok(());
            }
        }
        warn!("HelmRelease watcher stream ended");
        Ok(())
    }

    async fn patch_status(&self, key: &ResourceKey, status: serde_json::Value) -> Result<(), StatusError> {
        let patch = json!({ "status": status });
        self.namespaced(&key.namespace)
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| status_error(key, e))?;
        counter!("status_patch_total", 1u64);
        Ok(())
    }
}

fn status_error(key: &ResourceKey, e: kube::Error) -> StatusError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => StatusError::NotFound(key.clone()),
        other => StatusError::Api { key: key.clone(), reason: other.to_string() },
    }
}

#[async_trait::async_trait]
impl DesiredReleases for KubeHub {
    async fn get(&self, namespace: &str, name: &str) -> Result<DesiredRelease, StatusError> {
        let key = ResourceKey::new(namespace, name);
        let obj = self.namespaced(namespace).get(name).await.map_err(|e| status_error(&key, e))?;
        desired_from(&obj).map_err(|e| StatusError::Api { key, reason: e.to_string() })
    }
}

#[async_trait::async_trait]
impl StatusReporter for KubeHub {
    async fn set_condition(&self, key: &ResourceKey, condition: Condition) -> Result<(), StatusError> {
        // A merge patch replaces lists whole, so start from what is stored.
        let mut conditions = self.get(&key.namespace, &key.name).await?.status.conditions;
        condition.merge_into(&mut conditions);
        let conditions = serde_json::to_value(&conditions).map_err(|e| StatusError::Api { key: key.clone(), reason: e.to_string() })?;
        self.patch_status(key, json!({ "conditions": conditions })).await
    }

    async fn set_observed_generation(&self, key: &ResourceKey, generation: i64) -> Result<(), StatusError> {
        self.patch_status(key, json!({ "observedGeneration": generation })).await
    }

    async fn set_release_revision(&self, key: &ResourceKey, revision: &str) -> Result<(), StatusError> {
        self.patch_status(key, json!({ "revision": revision })).await
    }

    async fn set_values_checksum(&self, key: &ResourceKey, checksum: &str) -> Result<(), StatusError> {
        self.patch_status(key, json!({ "valuesChecksum": checksum })).await
    }
}

#[async_trait::async_trait]
impl ValuesLookup for KubeHub {
    async fn config_map_value(&self, namespace: &str, name: &str, key: &str) -> Result<Option<String>, ValuesError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let cm = api.get_opt(name).await.map_err(|e| ValuesError::Lookup(format!("ConfigMap {namespace}/{name}: {e}")))?;
        Ok(cm.and_then(|cm| cm.data).and_then(|mut data| data.remove(key)))
    }

    async fn secret_value(&self, namespace: &str, name: &str, key: &str) -> Result<Option<String>, ValuesError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let Some(secret) = api.get_opt(name).await.map_err(|e| ValuesError::Lookup(format!("Secret {namespace}/{name}: {e}")))? else {
            return Ok(None);
        };
        if let Some(bytes) = secret.data.and_then(|mut d| d.remove(key)) {
            return String::from_utf8(bytes.0)
                .map(Some)
                .map_err(|_| ValuesError::Lookup(format!("Secret {namespace}/{name} key {key} is not UTF-8")));
        }
        Ok(secret.string_data.and_then(|mut d| d.remove(key)))
    }
}
