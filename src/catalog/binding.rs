use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{StreamExt, TryStreamExt, stream};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::address::AddressGuard;
use super::auth::{Access, Authorizer, Identity};
use super::features_api::{fetch_geojson, guarded_client};
use super::{CatalogReference, CatalogStore, CollectionEntry, Record, RecordStream, records_hash};
use crate::config::RetryConfig;
use crate::error::CatalogError;

/// Where and how to publish a process output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    /// Name of the process output to publish.
    pub output: String,
    /// Collection id to create.
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    /// Seconds until the collection is removed again.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

#[derive(Debug)]
pub struct Registration {
    pub collection_id: String,
    pub content_hash: String,
    pub cleanup: Option<ScheduledCleanup>,
}

pub type CleanupTask = BoxFuture<'static, ()>;

/// Deferred-task abstraction used for TTL cleanup.
pub trait CleanupScheduler: Send + Sync {
    fn schedule(&self, delay: Duration, task: CleanupTask) -> ScheduledCleanup;
}

/// Handle to a scheduled cleanup; cancelling before it fires skips it.
#[derive(Debug, Clone)]
pub struct ScheduledCleanup {
    token: CancellationToken,
}

impl ScheduledCleanup {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Runs each task on the tokio runtime after its delay.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

impl CleanupScheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: CleanupTask) -> ScheduledCleanup {
        let token = CancellationToken::new();
        let guard = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = guard.cancelled() => {}
                _ = tokio::time::sleep(delay) => task.await,
            }
        });
        ScheduledCleanup::new(token)
    }
}

pub struct CatalogBinding {
    store: Arc<dyn CatalogStore>,
    authorizer: Arc<dyn Authorizer>,
    guard: AddressGuard,
    http: Client,
    scheduler: Arc<dyn CleanupScheduler>,
    cleanup_retry: RetryConfig,
}

impl CatalogBinding {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        authorizer: Arc<dyn Authorizer>,
        scheduler: Arc<dyn CleanupScheduler>,
    ) -> Result<Self, CatalogError> {
        let guard = AddressGuard::new();
        Ok(Self {
            store,
            authorizer,
            http: guarded_client(&guard)?,
            guard,
            scheduler,
            cleanup_retry: RetryConfig::default(),
        })
    }

    /// Replaces the address guard, along with the client it resolves for.
    pub fn with_guard(mut self, guard: AddressGuard) -> Result<Self, CatalogError> {
        self.http = guarded_client(&guard)?;
        self.guard = guard;
        Ok(self)
    }

    pub fn with_cleanup_retry(mut self, retry: RetryConfig) -> Self {
        self.cleanup_retry = retry;
        self
    }

    /// Resolves a reference into a lazy record stream.
    ///
    /// Authorization happens before the store is touched. For a URL
    /// reference the authorizer is asked about the URL's host, and the
    /// address guard vets both the URL and every address the fetch connects
    /// to. URL references carry no filter; the document is returned whole.
    pub async fn resolve_input(
        &self,
        reference: &CatalogReference,
        identity: &Identity,
    ) -> Result<RecordStream, CatalogError> {
        match reference {
            CatalogReference::Collection { id, filter } => {
                if !self.authorizer.authorize(identity, id, Access::Read) {
                    warn!(subject = %identity.subject, collection = %id, "catalog read denied");
                    return Err(CatalogError::NotAuthorized {
                        collection: id.clone(),
                        access: Access::Read.to_string(),
                    });
                }
                let records = self.store.read(&identity.tenant, id, filter).await?;
                if self.store.supports_server_filter() || filter.is_empty() {
                    return Ok(records);
                }
                debug!(collection = %id, "applying filter client-side");
                let predicate = filter.clone();
                let filtered = records.try_filter(move |r| {
                    futures_util::future::ready(predicate.matches(r))
                });
                Ok(match filter.limit {
                    Some(limit) => filtered.take(limit).boxed(),
                    None => filtered.boxed(),
                })
            }
            CatalogReference::Url { href } => {
                let url = self.guard.check(href).await?;
                let host = url.host_str().unwrap_or_default();
                if !self.authorizer.authorize(identity, host, Access::Read) {
                    warn!(subject = %identity.subject, %host, "URL read denied");
                    return Err(CatalogError::NotAuthorized {
                        collection: host.to_string(),
                        access: Access::Read.to_string(),
                    });
                }
                let records = fetch_geojson(&self.http, url).await?;
                Ok(stream::iter(records.into_iter().map(Ok::<Record, CatalogError>)).boxed())
            }
        }
    }

    /// Resolves and drains a reference.
    pub async fn collect_input(
        &self,
        reference: &CatalogReference,
        identity: &Identity,
    ) -> Result<Vec<Record>, CatalogError> {
        self.resolve_input(reference, identity)
            .await?
            .try_collect()
            .await
    }

    /// Publishes `records` as a new collection, scheduling its removal when
    /// the output carries a TTL.
    pub async fn register_output(
        &self,
        records: Vec<Record>,
        spec: &OutputSpec,
        identity: &Identity,
    ) -> Result<Registration, CatalogError> {
        if !self.authorizer.authorize(identity, &spec.id, Access::Write) {
            warn!(subject = %identity.subject, collection = %spec.id, "catalog write denied");
            return Err(CatalogError::NotAuthorized {
                collection: spec.id.clone(),
                access: Access::Write.to_string(),
            });
        }
        let entry = CollectionEntry {
            id: spec.id.clone(),
            title: spec.title.clone().unwrap_or_else(|| spec.id.clone()),
            content_hash: records_hash(&records),
        };
        let count = records.len();
        self.store.write(&identity.tenant, &entry, records).await?;
        info!(collection = %entry.id, records = count, hash = %entry.content_hash, "output registered");

        let cleanup = spec.ttl_secs.map(|ttl| {
            let task = cleanup_task(
                Arc::clone(&self.store),
                identity.tenant.clone(),
                entry.id.clone(),
                self.cleanup_retry.clone(),
            );
            self.scheduler.schedule(Duration::from_secs(ttl), task)
        });

        Ok(Registration {
            collection_id: entry.id,
            content_hash: entry.content_hash,
            cleanup,
        })
    }

    /// Deletes a collection this binding published. Deleting one that is
    /// already gone succeeds.
    pub async fn withdraw_output(
        &self,
        collection: &str,
        identity: &Identity,
    ) -> Result<(), CatalogError> {
        self.store.delete(&identity.tenant, collection).await?;
        info!(%collection, "output withdrawn");
        Ok(())
    }
}

/// At-least-once delete with exponential backoff. Delete is idempotent on
/// the store side, so a retry after a lost acknowledgement is harmless.
fn cleanup_task(
    store: Arc<dyn CatalogStore>,
    tenant: String,
    collection: String,
    retry: RetryConfig,
) -> CleanupTask {
    Box::pin(async move {
        let mut attempt = 0;
        loop {
            match store.delete(&tenant, &collection).await {
                Ok(()) => {
                    info!(%collection, "expired output removed");
                    return;
                }
                Err(e) if attempt < retry.max_retries => {
                    attempt += 1;
                    let delay = retry.delay_for_attempt(attempt);
                    warn!(%collection, error = %e, attempt, ?delay, "cleanup failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(%collection, error = %e, "cleanup gave up");
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{
        AllowTenant, GrantTable, HostLookup, MemoryCatalogStore, RecordFilter, content_hash,
    };
    use std::net::IpAddr;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Collects tasks so the test decides when they run.
    #[derive(Default)]
    struct ManualScheduler {
        tasks: Mutex<Vec<(Duration, CleanupTask, CancellationToken)>>,
    }

    impl ManualScheduler {
        async fn run_all(&self) {
            let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
            for (_, task, token) in tasks {
                if !token.is_cancelled() {
                    task.await;
                }
            }
        }
    }

    impl CleanupScheduler for ManualScheduler {
        fn schedule(&self, delay: Duration, task: CleanupTask) -> ScheduledCleanup {
            let token = CancellationToken::new();
            self.tasks.lock().push((delay, task, token.clone()));
            ScheduledCleanup::new(token)
        }
    }

    fn features() -> Vec<Record> {
        (0..4)
            .map(|i| {
                json!({
                    "type": "Feature",
                    "geometry": {"type": "Point", "coordinates": [i, i]},
                    "properties": {"n": i}
                })
            })
            .collect()
    }

    fn binding(
        store: Arc<MemoryCatalogStore>,
        authorizer: Arc<dyn Authorizer>,
        scheduler: Arc<dyn CleanupScheduler>,
    ) -> CatalogBinding {
        CatalogBinding::new(store, authorizer, scheduler).unwrap()
    }

    fn spec(id: &str, ttl: Option<u64>) -> OutputSpec {
        OutputSpec {
            output: "result".into(),
            id: id.into(),
            title: None,
            ttl_secs: ttl,
        }
    }

    #[tokio::test]
    async fn register_then_resolve_preserves_hash() {
        let store = Arc::new(MemoryCatalogStore::new());
        let b = binding(store, Arc::new(AllowTenant), Arc::new(ManualScheduler::default()));
        let identity = Identity::new("alice", "city");
        let records = features();
        let original = content_hash(&Value::Array(records.clone()));

        let reg = b
            .register_output(records, &spec("buffered", None), &identity)
            .await
            .unwrap();
        assert_eq!(reg.collection_id, "buffered");
        assert_eq!(reg.content_hash, original);
        assert!(reg.cleanup.is_none());

        let back = b
            .collect_input(&CatalogReference::collection(&reg.collection_id), &identity)
            .await
            .unwrap();
        assert_eq!(records_hash(&back), original);
    }

    #[tokio::test]
    async fn unauthorized_read_moves_no_data() {
        struct CountingStore {
            inner: MemoryCatalogStore,
            reads: AtomicU32,
        }

        #[async_trait]
        impl CatalogStore for CountingStore {
            fn supports_server_filter(&self) -> bool {
                true
            }
            async fn read(
                &self,
                tenant: &str,
                collection: &str,
                filter: &RecordFilter,
            ) -> Result<RecordStream, CatalogError> {
                self.reads.fetch_add(1, Ordering::SeqCst);
                self.inner.read(tenant, collection, filter).await
            }
            async fn write(
                &self,
                tenant: &str,
                entry: &CollectionEntry,
                records: Vec<Record>,
            ) -> Result<(), CatalogError> {
                self.inner.write(tenant, entry, records).await
            }
            async fn delete(&self, tenant: &str, collection: &str) -> Result<(), CatalogError> {
                self.inner.delete(tenant, collection).await
            }
        }

        let store = Arc::new(CountingStore {
            inner: MemoryCatalogStore::new(),
            reads: AtomicU32::new(0),
        });
        store.inner.insert("city", "parcels", "Parcels", features());
        let grants = GrantTable::new().grant("alice", "parcels", Access::Read);
        let b = CatalogBinding::new(
            store.clone(),
            Arc::new(grants),
            Arc::new(ManualScheduler::default()),
        )
        .unwrap();

        let mallory = Identity::new("mallory", "city");
        let err = b
            .resolve_input(&CatalogReference::collection("parcels"), &mallory)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CatalogError::NotAuthorized { .. }));
        assert_eq!(store.reads.load(Ordering::SeqCst), 0);

        let alice = Identity::new("alice", "city");
        let got = b
            .collect_input(&CatalogReference::collection("parcels"), &alice)
            .await
            .unwrap();
        assert_eq!(got.len(), 4);
        assert_eq!(store.reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_collection_is_not_found() {
        let b = binding(
            Arc::new(MemoryCatalogStore::new()),
            Arc::new(AllowTenant),
            Arc::new(ManualScheduler::default()),
        );
        let err = b
            .resolve_input(&CatalogReference::collection("ghost"), &Identity::system())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CatalogError::NotFound(_)));
    }

    #[tokio::test]
    async fn url_reference_to_private_address_is_rejected() {
        let b = binding(
            Arc::new(MemoryCatalogStore::new()),
            Arc::new(AllowTenant),
            Arc::new(ManualScheduler::default()),
        );
        for href in [
            "http://169.254.169.254/latest/meta-data/iam",
            "http://127.0.0.1:8080/features.geojson",
            "http://10.0.0.5/data.geojson",
        ] {
            let err = b
                .resolve_input(&CatalogReference::url(href), &Identity::system())
                .await
                .err()
                .unwrap();
            assert!(matches!(err, CatalogError::AddressBlocked(_)), "{href}");
        }
    }

    /// Answers with a public address first and with loopback afterwards.
    #[derive(Default)]
    struct Rebinding {
        calls: AtomicU32,
    }

    #[async_trait]
    impl HostLookup for Rebinding {
        async fn lookup(&self, _host: &str, _port: u16) -> std::io::Result<Vec<IpAddr>> {
            let ip = if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                "93.184.216.34"
            } else {
                "127.0.0.1"
            };
            Ok(vec![ip.parse().unwrap()])
        }
    }

    #[tokio::test]
    async fn host_rebinding_to_loopback_is_refused_at_connect() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "type": "FeatureCollection",
                "features": features()
            })))
            .expect(0)
            .mount(&server)
            .await;

        let lookup = Arc::new(Rebinding::default());
        let b = binding(
            Arc::new(MemoryCatalogStore::new()),
            Arc::new(AllowTenant),
            Arc::new(ManualScheduler::default()),
        )
        .with_guard(AddressGuard::new().with_lookup(lookup.clone()))
        .unwrap();

        let href = format!("http://rebind.example:{}/parcels.geojson", server.address().port());
        let err = b
            .resolve_input(&CatalogReference::url(&href), &Identity::system())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CatalogError::AddressBlocked(_)), "{err}");
        // Vetted once up front, then again when the client connected.
        assert!(lookup.calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn url_reads_are_authorized_by_host() {
        let lookup = Arc::new(Rebinding::default());
        let grants = GrantTable::new().grant("alice", "other.example.org", Access::Read);
        let b = binding(
            Arc::new(MemoryCatalogStore::new()),
            Arc::new(grants),
            Arc::new(ManualScheduler::default()),
        )
        .with_guard(AddressGuard::new().with_lookup(lookup.clone()))
        .unwrap();

        let err = b
            .resolve_input(
                &CatalogReference::url("https://data.example.org/parcels.geojson"),
                &Identity::new("alice", "city"),
            )
            .await
            .err()
            .unwrap();
        assert!(
            matches!(err, CatalogError::NotAuthorized { ref collection, .. } if collection == "data.example.org")
        );
        // Only the up-front check resolved the host; nothing was fetched.
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ttl_cleanup_deletes_and_is_idempotent() {
        let store = Arc::new(MemoryCatalogStore::new());
        let scheduler = Arc::new(ManualScheduler::default());
        let b = binding(store.clone(), Arc::new(AllowTenant), scheduler.clone());
        let identity = Identity::new("alice", "city");

        let reg = b
            .register_output(features(), &spec("scratch", Some(60)), &identity)
            .await
            .unwrap();
        assert!(reg.cleanup.is_some());
        assert_eq!(scheduler.tasks.lock()[0].0, Duration::from_secs(60));
        assert!(store.contains("city", "scratch"));

        // Someone else removed it first; the cleanup must still succeed.
        store.delete("city", "scratch").await.unwrap();
        scheduler.run_all().await;
        assert!(!store.contains("city", "scratch"));
    }

    #[tokio::test]
    async fn cancelled_cleanup_keeps_collection() {
        let store = Arc::new(MemoryCatalogStore::new());
        let scheduler = Arc::new(ManualScheduler::default());
        let b = binding(store.clone(), Arc::new(AllowTenant), scheduler.clone());
        let identity = Identity::new("alice", "city");

        let reg = b
            .register_output(features(), &spec("keep", Some(1)), &identity)
            .await
            .unwrap();
        reg.cleanup.unwrap().cancel();
        scheduler.run_all().await;
        assert!(store.contains("city", "keep"));
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_scheduler_fires_after_delay() {
        let fired = Arc::new(AtomicU32::new(0));
        let f = fired.clone();
        let handle = TokioScheduler.schedule(
            Duration::from_secs(30),
            Box::pin(async move {
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );
        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!handle.is_cancelled());
    }

    #[tokio::test]
    async fn cleanup_retries_until_delete_succeeds() {
        struct FlakyStore {
            failures_left: AtomicU32,
            deletes: AtomicU32,
        }

        #[async_trait]
        impl CatalogStore for FlakyStore {
            fn supports_server_filter(&self) -> bool {
                false
            }
            async fn read(
                &self,
                _tenant: &str,
                collection: &str,
                _filter: &RecordFilter,
            ) -> Result<RecordStream, CatalogError> {
                Err(CatalogError::NotFound(collection.to_string()))
            }
            async fn write(
                &self,
                _tenant: &str,
                _entry: &CollectionEntry,
                _records: Vec<Record>,
            ) -> Result<(), CatalogError> {
                Ok(())
            }
            async fn delete(&self, _tenant: &str, _collection: &str) -> Result<(), CatalogError> {
                self.deletes.fetch_add(1, Ordering::SeqCst);
                if self.failures_left.load(Ordering::SeqCst) > 0 {
                    self.failures_left.fetch_sub(1, Ordering::SeqCst);
                    return Err(CatalogError::Backend("connection reset".into()));
                }
                Ok(())
            }
        }

        let store = Arc::new(FlakyStore {
            failures_left: AtomicU32::new(2),
            deletes: AtomicU32::new(0),
        });
        let task = cleanup_task(
            store.clone(),
            "city".into(),
            "scratch".into(),
            RetryConfig {
                max_retries: 3,
                base_delay_ms: 1,
            },
        );
        task.await;
        assert_eq!(store.deletes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_side_filter_when_store_cannot() {
        struct DumbStore(MemoryCatalogStore);

        #[async_trait]
        impl CatalogStore for DumbStore {
            fn supports_server_filter(&self) -> bool {
                false
            }
            async fn read(
                &self,
                tenant: &str,
                collection: &str,
                _filter: &RecordFilter,
            ) -> Result<RecordStream, CatalogError> {
                self.0.read(tenant, collection, &RecordFilter::default()).await
            }
            async fn write(
                &self,
                tenant: &str,
                entry: &CollectionEntry,
                records: Vec<Record>,
            ) -> Result<(), CatalogError> {
                self.0.write(tenant, entry, records).await
            }
            async fn delete(&self, tenant: &str, collection: &str) -> Result<(), CatalogError> {
                self.0.delete(tenant, collection).await
            }
        }

        let inner = MemoryCatalogStore::new();
        inner.insert("city", "pts", "Points", features());
        let b = CatalogBinding::new(
            Arc::new(DumbStore(inner)),
            Arc::new(AllowTenant),
            Arc::new(ManualScheduler::default()),
        )
        .unwrap();
        let filter = RecordFilter::default()
            .with_bbox([1.5, 1.5, 10.0, 10.0])
            .with_limit(1);
        let got = b
            .collect_input(&CatalogReference::filtered("pts", filter), &Identity::new("a", "city"))
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0]["properties"]["n"], 2);
    }
}
