use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use parking_lot::RwLock;

use super::{CatalogStore, CollectionEntry, Record, RecordFilter, RecordStream};
use crate::error::CatalogError;

#[derive(Debug, Clone)]
struct StoredCollection {
    entry: CollectionEntry,
    records: Arc<Vec<Record>>,
}

/// Tenant-scoped catalog kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryCatalogStore {
    collections: RwLock<HashMap<(String, String), StoredCollection>>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a collection directly, bypassing authorization.
    pub fn insert(&self, tenant: &str, id: &str, title: &str, records: Vec<Record>) {
        let entry = CollectionEntry {
            id: id.to_string(),
            title: title.to_string(),
            content_hash: super::records_hash(&records),
        };
        self.collections.write().insert(
            (tenant.to_string(), id.to_string()),
            StoredCollection {
                entry,
                records: Arc::new(records),
            },
        );
    }

    pub fn contains(&self, tenant: &str, id: &str) -> bool {
        self.collections
            .read()
            .contains_key(&(tenant.to_string(), id.to_string()))
    }

    pub fn entry(&self, tenant: &str, id: &str) -> Option<CollectionEntry> {
        self.collections
            .read()
            .get(&(tenant.to_string(), id.to_string()))
            .map(|c| c.entry.clone())
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalogStore {
    fn supports_server_filter(&self) -> bool {
        true
    }

    async fn read(
        &self,
        tenant: &str,
        collection: &str,
        filter: &RecordFilter,
    ) -> Result<RecordStream, CatalogError> {
        let records = self
            .collections
            .read()
            .get(&(tenant.to_string(), collection.to_string()))
            .map(|c| Arc::clone(&c.records))
            .ok_or_else(|| CatalogError::NotFound(collection.to_string()))?;

        let filter = filter.clone();
        let limit = filter.limit.unwrap_or(usize::MAX);
        let len = records.len();
        let stream = stream::iter(0..len)
            .filter_map(move |i| {
                let record = &records[i];
                let hit = filter
                    .matches(record)
                    .then(|| Ok::<_, CatalogError>(record.clone()));
                futures_util::future::ready(hit)
            })
            .take(limit);
        Ok(stream.boxed())
    }

    async fn write(
        &self,
        tenant: &str,
        entry: &CollectionEntry,
        records: Vec<Record>,
    ) -> Result<(), CatalogError> {
        self.collections.write().insert(
            (tenant.to_string(), entry.id.clone()),
            StoredCollection {
                entry: entry.clone(),
                records: Arc::new(records),
            },
        );
        Ok(())
    }

    async fn delete(&self, tenant: &str, collection: &str) -> Result<(), CatalogError> {
        self.collections
            .write()
            .remove(&(tenant.to_string(), collection.to_string()));
        Ok(())
    }
}
