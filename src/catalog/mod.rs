//! Catalog binding: resolving catalog references into record streams and
//! registering process results as new catalog collections.
//!
//! The store itself is an external collaborator behind [`CatalogStore`];
//! [`MemoryCatalogStore`] and [`FeaturesApiStore`] are the adapters shipped
//! with the engine.

mod address;
mod auth;
mod binding;
mod features_api;
mod filter;
mod memory;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::CatalogError;

pub use address::{AddressGuard, HostLookup, SystemLookup};
pub use auth::{Access, AllowTenant, Authorizer, GrantTable, Identity};
pub use binding::{
    CatalogBinding, CleanupScheduler, CleanupTask, OutputSpec, Registration, ScheduledCleanup,
    TokioScheduler,
};
pub use features_api::FeaturesApiStore;
pub use filter::{RecordFilter, geometry_bounds};
pub use memory::MemoryCatalogStore;

/// A single catalog record, typically a GeoJSON feature.
pub type Record = Value;

/// Lazy sequence of records. Restart by resolving the reference again.
pub type RecordStream = BoxStream<'static, Result<Record, CatalogError>>;

/// Where a process input comes from when it is not a literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogReference {
    Collection {
        id: String,
        #[serde(default, skip_serializing_if = "RecordFilter::is_empty")]
        filter: RecordFilter,
    },
    /// A raw network address. Only accepted when it resolves to a public host.
    Url { href: String },
}

impl CatalogReference {
    pub fn collection(id: &str) -> Self {
        CatalogReference::Collection {
            id: id.to_string(),
            filter: RecordFilter::default(),
        }
    }

    pub fn filtered(id: &str, filter: RecordFilter) -> Self {
        CatalogReference::Collection {
            id: id.to_string(),
            filter,
        }
    }

    pub fn url(href: &str) -> Self {
        CatalogReference::Url {
            href: href.to_string(),
        }
    }
}

/// Metadata for a collection written by [`CatalogStore::write`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionEntry {
    pub id: String,
    pub title: String,
    pub content_hash: String,
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Whether `read` applies the filter itself.
    fn supports_server_filter(&self) -> bool;

    async fn read(
        &self,
        tenant: &str,
        collection: &str,
        filter: &RecordFilter,
    ) -> Result<RecordStream, CatalogError>;

    async fn write(
        &self,
        tenant: &str,
        entry: &CollectionEntry,
        records: Vec<Record>,
    ) -> Result<(), CatalogError>;

    /// Deleting a collection that does not exist succeeds.
    async fn delete(&self, tenant: &str, collection: &str) -> Result<(), CatalogError>;
}

/// SHA-256 over the canonical JSON form of `value`: object keys sorted,
/// no insignificant whitespace.
pub fn content_hash(value: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(value, &mut canonical);
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// Hash of a record sequence, equal to the hash of the same records as a JSON array.
pub fn records_hash(records: &[Record]) -> String {
    let mut canonical = String::from("[");
    for (i, record) in records.iter().enumerate() {
        if i > 0 {
            canonical.push(',');
        }
        write_canonical(record, &mut canonical);
    }
    canonical.push(']');
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Splits a process output value into catalog records.
pub fn records_from_value(value: &Value) -> Vec<Record> {
    match value {
        Value::Array(items) => items.clone(),
        Value::Object(map) if map.get("type").and_then(Value::as_str) == Some("FeatureCollection") => {
            map.get("features")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
        }
        other => vec![other.clone()],
    }
}

/// Wraps records into a GeoJSON FeatureCollection.
pub fn feature_collection(records: Vec<Record>) -> Value {
    serde_json::json!({ "type": "FeatureCollection", "features": records })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hash_ignores_key_order() {
        let a = json!({"b": 1, "a": {"y": [1, 2], "x": null}});
        let b = json!({"a": {"x": null, "y": [1, 2]}, "b": 1});
        assert_eq!(content_hash(&a), content_hash(&b));
        assert_ne!(content_hash(&a), content_hash(&json!({"b": 2})));
        assert_eq!(content_hash(&a).len(), 64);
    }

    #[test]
    fn records_hash_matches_array_hash() {
        let records = vec![json!({"id": 1}), json!({"id": 2})];
        assert_eq!(records_hash(&records), content_hash(&Value::Array(records.clone())));
        assert_eq!(records_hash(&[]), content_hash(&json!([])));
    }

    #[test]
    fn records_from_feature_collection() {
        let fc = feature_collection(vec![json!({"type": "Feature"}), json!({"type": "Feature"})]);
        assert_eq!(records_from_value(&fc).len(), 2);
        assert_eq!(records_from_value(&json!([1, 2, 3])).len(), 3);
        assert_eq!(records_from_value(&json!(42)), vec![json!(42)]);
    }

    #[test]
    fn reference_serde_shape() {
        let r: CatalogReference =
            serde_json::from_str(r#"{"collection": {"id": "parcels", "filter": {"limit": 5}}}"#)
                .unwrap();
        match r {
            CatalogReference::Collection { id, filter } => {
                assert_eq!(id, "parcels");
                assert_eq!(filter.limit, Some(5));
            }
            other => panic!("unexpected {other:?}"),
        }
        let u: CatalogReference =
            serde_json::from_str(r#"{"url": {"href": "https://example.org/a.geojson"}}"#).unwrap();
        assert_eq!(u, CatalogReference::url("https://example.org/a.geojson"));
    }
}
