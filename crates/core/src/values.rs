//! Chart values and their canonical checksum.

use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value as Json};
use sha2::{Digest, Sha256};

/// A values document. Equality is insensitive to key order but sensitive
/// to value types.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Values(pub Map<String, Json>);

impl Values {
    pub fn new() -> Self { Self::default() }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn as_json(&self) -> Json { Json::Object(self.0.clone()) }

    /// Parse a YAML document; an empty document yields empty values.
    pub fn from_yaml(s: &str) -> Result<Self, serde_yaml::Error> {
        if s.trim().is_empty() {
            return Ok(Self::default());
        }
        let v: Option<Map<String, Json>> = serde_yaml::from_str(s)?;
        Ok(Self(v.unwrap_or_default()))
    }

    /// Canonical YAML rendering (sorted keys).
    pub fn yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(&Canonical(&self.as_json()))
    }

    /// Deep-merge `other` on top of `self`: maps merge recursively, anything
    /// else in `other` replaces what was there.
    pub fn merge(&mut self, other: Values) {
        merge_maps(&mut self.0, other.0);
    }
}

impl From<Map<String, Json>> for Values {
    fn from(m: Map<String, Json>) -> Self { Self(m) }
}

fn merge_maps(base: &mut Map<String, Json>, over: Map<String, Json>) {
    for (k, v) in over {
        if let Json::Object(o) = v {
            if let Some(Json::Object(b)) = base.get_mut(&k) {
                merge_maps(b, o);
                continue;
            }
            base.insert(k, Json::Object(o));
        } else {
            base.insert(k, v);
        }
    }
}

/// Serializes maps with their keys sorted, whatever order the map keeps.
struct Canonical<'a>(&'a Json);

impl Serialize for Canonical<'_> {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self.0 {
            Json::Object(m) => {
                let mut keys: Vec<&String> = m.keys().collect();
                keys.sort();
                let mut map = s.serialize_map(Some(keys.len()))?;
                for k in keys {
                    map.serialize_entry(k, &Canonical(&m[k.as_str()]))?;
                }
                map.end()
            }
            Json::Array(items) => {
                let mut seq = s.serialize_seq(Some(items.len()))?;
                for v in items {
                    seq.serialize_element(&Canonical(v))?;
                }
                seq.end()
            }
            other => other.serialize(s),
        }
    }
}

/// SHA-256 of the rendered values, hex encoded.
pub fn values_checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
