//! Effective values for a release: `valuesFrom` sources merged in order,
//! inline values last.

use std::path::Path;
use std::sync::Arc;

use helmsync_core::{values_checksum, KeyRef, Values, ValuesFromSource};
use tracing::debug;

/// Object kind a `valuesFrom` key reference points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    ConfigMap,
    Secret,
}

impl RefKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefKind::ConfigMap => "ConfigMap",
            RefKind::Secret => "Secret",
        }
    }
}

impl std::fmt::Display for RefKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ValuesError {
    #[error("{kind} {namespace}/{name} has no key {key}")]
    Missing { kind: RefKind, namespace: String, name: String, key: String },
    #[error("chart file {0} not found")]
    MissingChartFile(String),
    #[error("parsing values from {origin}: {source}")]
    Parse { origin: String, source: serde_yaml::Error },
    #[error("rendering values: {0}")]
    Render(#[from] serde_yaml::Error),
    #[error("looking up {0}")]
    Lookup(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Reads values documents out of ConfigMaps and Secrets.
#[async_trait::async_trait]
pub trait ValuesLookup: Send + Sync {
    /// Value stored under `key`, `None` if the object or the key is absent.
    async fn config_map_value(&self, namespace: &str, name: &str, key: &str) -> Result<Option<String>, ValuesError>;
    async fn secret_value(&self, namespace: &str, name: &str, key: &str) -> Result<Option<String>, ValuesError>;
}

pub struct ValuesResolver {
    lookup: Arc<dyn ValuesLookup>,
}

impl ValuesResolver {
    pub fn new(lookup: Arc<dyn ValuesLookup>) -> Self { Self { lookup } }

    pub async fn values(
        &self,
        namespace: &str,
        chart_path: &Path,
        values_from: &[ValuesFromSource],
        inline: &Values,
    ) -> Result<Values, ValuesError> {
        let mut out = Values::new();
        for source in values_from {
            let doc = match source {
                ValuesFromSource::ConfigMapKeyRef(r) => self.key_ref(RefKind::ConfigMap, namespace, r).await?,
                ValuesFromSource::SecretKeyRef(r) => self.key_ref(RefKind::Secret, namespace, r).await?,
                ValuesFromSource::ChartFileRef(r) => {
                    let file = chart_path.join(&r.path);
                    match tokio::fs::read_to_string(&file).await {
                        Ok(s) => Some((s, file.display().to_string())),
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                            if r.optional {
                                debug!(file = %file.display(), "optional chart values file missing");
                                None
                            } else {
                                return Err(ValuesError::MissingChartFile(r.path.clone()));
                            }
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            };
            if let Some((text, origin)) = doc {
                let v = Values::from_yaml(&text).map_err(|source| ValuesError::Parse { origin, source })?;
                out.merge(v);
            }
        }
        out.merge(inline.clone());
        Ok(out)
    }

    async fn key_ref(&self, kind: RefKind, default_ns: &str, r: &KeyRef) -> Result<Option<(String, String)>, ValuesError> {
        let ns = r.namespace.as_deref().unwrap_or(default_ns);
        let key = r.key_or_default();
        let found = match kind {
            RefKind::ConfigMap => self.lookup.config_map_value(ns, &r.name, key).await?,
            RefKind::Secret => self.lookup.secret_value(ns, &r.name, key).await?,
        };
        match found {
            Some(text) => Ok(Some((text, format!("{kind} {ns}/{}:{key}", r.name)))),
            None if r.optional => Ok(None),
            None => Err(ValuesError::Missing { kind, namespace: ns.to_string(), name: r.name.clone(), key: key.to_string() }),
        }
    }
}

/// Checksum of the canonical YAML rendering of `values`.
pub fn checksum(values: &Values) -> Result<String, ValuesError> {
    Ok(values_checksum(values.yaml()?.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use helmsync_core::ChartFileRef;
    use serde_json::json;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MapLookup {
        config_maps: HashMap<(String, String, String), String>,
        secrets: HashMap<(String, String, String), String>,
    }

    #[async_trait::async_trait]
    impl ValuesLookup for MapLookup {
        async fn config_map_value(&self, namespace: &str, name: &str, key: &str) -> Result<Option<String>, ValuesError> {
            Ok(self.config_maps.get(&(namespace.into(), name.into(), key.into())).cloned())
        }
        async fn secret_value(&self, namespace: &str, name: &str, key: &str) -> Result<Option<String>, ValuesError> {
            Ok(self.secrets.get(&(namespace.into(), name.into(), key.into())).cloned())
        }
    }

    fn key_ref(name: &str, optional: bool) -> KeyRef {
        KeyRef { name: name.into(), namespace: None, key: None, optional }
    }

    #[tokio::test]
    async fn sources_merge_in_order_and_inline_wins() {
        let mut lookup = MapLookup::default();
        lookup.config_maps.insert(("apps".into(), "defaults".into(), "values.yaml".into()), "replicas: 1\nimage:\n  tag: a\n".into());
        lookup.secrets.insert(("apps".into(), "prod".into(), "values.yaml".into()), "image:\n  tag: b\n  pullPolicy: Always\n".into());
        let resolver = ValuesResolver::new(Arc::new(lookup));

        let inline = Values::from_yaml("replicas: 3\n").unwrap();
        let got = resolver
            .values(
                "apps",
                Path::new("/nonexistent"),
                &[ValuesFromSource::ConfigMapKeyRef(key_ref("defaults", false)), ValuesFromSource::SecretKeyRef(key_ref("prod", false))],
                &inline,
            )
            .await
            .unwrap();
        assert_eq!(got.as_json(), json!({ "replicas": 3, "image": { "tag": "b", "pullPolicy": "Always" } }));
    }

    #[tokio::test]
    async fn missing_required_source_is_an_error_optional_is_skipped() {
        let resolver = ValuesResolver::new(Arc::new(MapLookup::default()));
        let err = resolver
            .values("apps", Path::new("/nonexistent"), &[ValuesFromSource::ConfigMapKeyRef(key_ref("nope", false))], &Values::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ValuesError::Missing { kind: RefKind::ConfigMap, .. }), "{err}");

        let got = resolver
            .values(
                "apps",
                Path::new("/nonexistent"),
                &[
                    ValuesFromSource::SecretKeyRef(key_ref("nope", true)),
                    ValuesFromSource::ChartFileRef(ChartFileRef { path: "ci/prod.yaml".into(), optional: true }),
                ],
                &Values::new(),
            )
            .await
            .unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn key_refs_read_from_their_own_kind() {
        let mut lookup = MapLookup::default();
        lookup.config_maps.insert(("apps".into(), "shared".into(), "values.yaml".into()), "from: configmap\n".into());
        lookup.secrets.insert(("apps".into(), "shared".into(), "values.yaml".into()), "from: secret\n".into());
        let resolver = ValuesResolver::new(Arc::new(lookup));
        let read = |source: ValuesFromSource| {
            let resolver = &resolver;
            async move { resolver.values("apps", Path::new("/nonexistent"), &[source], &Values::new()).await }
        };

        let got = read(ValuesFromSource::ConfigMapKeyRef(key_ref("shared", false))).await.unwrap();
        assert_eq!(got.as_json(), json!({ "from": "configmap" }));
        let got = read(ValuesFromSource::SecretKeyRef(key_ref("shared", false))).await.unwrap();
        assert_eq!(got.as_json(), json!({ "from": "secret" }));

        let err = read(ValuesFromSource::SecretKeyRef(key_ref("other", false))).await.unwrap_err();
        assert!(matches!(err, ValuesError::Missing { kind: RefKind::Secret, .. }), "{err}");
        assert_eq!(err.to_string(), "Secret apps/other has no key values.yaml");
    }

    #[tokio::test]
    async fn chart_file_refs_read_relative_to_chart() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("ci")).unwrap();
        std::fs::write(dir.path().join("ci/prod.yaml"), "ingress:\n  enabled: true\n").unwrap();
        let resolver = ValuesResolver::new(Arc::new(MapLookup::default()));
        let got = resolver
            .values(
                "apps",
                dir.path(),
                &[ValuesFromSource::ChartFileRef(ChartFileRef { path: "ci/prod.yaml".into(), optional: false })],
                &Values::new(),
            )
            .await
            .unwrap();
        assert_eq!(got.as_json(), json!({ "ingress": { "enabled": true } }));
    }

    #[test]
    fn checksum_ignores_key_order() {
        let a = Values::from_yaml("a: 1\nb: [1, 2]\n").unwrap();
        let b = Values::from_yaml("b: [1, 2]\na: 1\n").unwrap();
        assert_eq!(checksum(&a).unwrap(), checksum(&b).unwrap());
        assert_ne!(checksum(&a).unwrap(), checksum(&Values::from_yaml("a: 2\n").unwrap()).unwrap());
    }
}
