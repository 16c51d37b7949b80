//! Read-only catalog adapter for an OGC API Features endpoint.
//!
//! Items are pulled page by page following `next` links, so a large
//! collection is never materialized up front. `bbox`, `limit` and property
//! equality are forwarded as query parameters.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use reqwest::{Client, ClientBuilder, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use super::address::AddressGuard;
use super::{CatalogStore, CollectionEntry, Record, RecordFilter, RecordStream};
use crate::error::CatalogError;

/// Upper bound on the page size requested from the server.
const PAGE_SIZE: usize = 500;

#[derive(Debug, Deserialize)]
struct ItemsPage {
    #[serde(default)]
    features: Vec<Value>,
    #[serde(default)]
    links: Vec<Link>,
}

/// Paging state: the next page is only requested when the consumer pulls past
/// the current one.
enum Cursor {
    Page(ItemsPage),
    Next(Url),
    /// A `next` link that leaves the endpoint's origin; refused when pulled.
    Foreign(String),
    Done,
}

#[derive(Debug, Deserialize)]
struct Link {
    href: String,
    #[serde(default)]
    rel: String,
}

pub struct FeaturesApiStore {
    base_url: Url,
    client: Client,
}

impl FeaturesApiStore {
    pub fn new(base_url: &str) -> Result<Self, CatalogError> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| CatalogError::Backend(format!("invalid base URL {base_url}: {e}")))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = http_client()?;
        Ok(Self { base_url, client })
    }

    fn items_url(&self, collection: &str, filter: &RecordFilter) -> Result<Url, CatalogError> {
        let mut url = self
            .base_url
            .join(&format!("collections/{collection}/items"))
            .map_err(|e| CatalogError::Backend(e.to_string()))?;
        {
            let mut query = url.query_pairs_mut();
            let page = filter.limit.map_or(PAGE_SIZE, |l| l.min(PAGE_SIZE));
            query.append_pair("limit", &page.to_string());
            if let Some([a, b, c, d]) = filter.bbox {
                query.append_pair("bbox", &format!("{a},{b},{c},{d}"));
            }
            for (key, value) in &filter.properties {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                query.append_pair(key, &value);
            }
        }
        Ok(url)
    }
}

fn client_builder() -> ClientBuilder {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(120))
        .redirect(reqwest::redirect::Policy::none())
}

/// Client for the configured catalog endpoint.
pub(crate) fn http_client() -> Result<Client, CatalogError> {
    client_builder().build().map_err(CatalogError::from)
}

/// Client for caller-supplied URLs. Name resolution goes through `guard`,
/// so a host that resolves differently at connect time is still refused.
pub(crate) fn guarded_client(guard: &AddressGuard) -> Result<Client, CatalogError> {
    client_builder()
        .dns_resolver(Arc::new(guard.clone()))
        .build()
        .map_err(CatalogError::from)
}

/// Surfaces a refusal from the guarded resolver as `AddressBlocked` rather
/// than a generic transport error.
fn send_error(err: reqwest::Error) -> CatalogError {
    let mut source = std::error::Error::source(&err);
    while let Some(cause) = source {
        if let Some(CatalogError::AddressBlocked(reason)) = cause.downcast_ref::<CatalogError>() {
            return CatalogError::AddressBlocked(reason.clone());
        }
        source = std::error::Error::source(cause);
    }
    CatalogError::from(err)
}

fn check_status(status: StatusCode, what: &str) -> Result<(), CatalogError> {
    match status {
        s if s.is_success() => Ok(()),
        StatusCode::NOT_FOUND => Err(CatalogError::NotFound(what.to_string())),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(CatalogError::NotAuthorized {
            collection: what.to_string(),
            access: "read".into(),
        }),
        s => Err(CatalogError::Backend(format!("{what}: HTTP {}", s.as_u16()))),
    }
}

async fn fetch_page(client: &Client, url: Url, what: &str) -> Result<ItemsPage, CatalogError> {
    let response = client
        .get(url)
        .header("accept", "application/geo+json, application/json")
        .send()
        .await?;
    check_status(response.status(), what)?;
    Ok(response.json::<ItemsPage>().await?)
}

/// Reads a single GeoJSON document (FeatureCollection or Feature) from an
/// already-vetted URL.
pub(crate) async fn fetch_geojson(client: &Client, url: Url) -> Result<Vec<Record>, CatalogError> {
    let what = url.to_string();
    let response = client.get(url).send().await.map_err(send_error)?;
    check_status(response.status(), &what)?;
    let body: Value = response.json().await?;
    Ok(super::records_from_value(&body))
}

#[async_trait]
impl CatalogStore for FeaturesApiStore {
    fn supports_server_filter(&self) -> bool {
        true
    }

    async fn read(
        &self,
        _tenant: &str,
        collection: &str,
        filter: &RecordFilter,
    ) -> Result<RecordStream, CatalogError> {
        let first = self.items_url(collection, filter)?;
        let client = self.client.clone();
        let what = collection.to_string();
        let origin = self.base_url.origin();

        // Fetch the first page eagerly so a missing collection fails the
        // resolve call itself rather than the first pull.
        let page = fetch_page(&client, first, &what).await?;

        let pages = stream::try_unfold(Cursor::Page(page), move |cursor| {
            let client = client.clone();
            let what = what.clone();
            let origin = origin.clone();
            async move {
                let page = match cursor {
                    Cursor::Done => return Ok(None),
                    Cursor::Page(page) => page,
                    Cursor::Next(url) => fetch_page(&client, url, &what).await?,
                    Cursor::Foreign(href) => {
                        return Err(CatalogError::AddressBlocked(format!(
                            "{href}: next link leaves {}",
                            origin.ascii_serialization()
                        )));
                    }
                };
                let next = if page.features.is_empty() {
                    None
                } else {
                    page.links
                        .iter()
                        .find(|l| l.rel == "next")
                        .and_then(|l| Url::parse(&l.href).ok())
                };
                let cursor = match next {
                    None => Cursor::Done,
                    Some(url) if url.origin() == origin => Cursor::Next(url),
                    Some(url) => Cursor::Foreign(url.to_string()),
                };
                Ok::<_, CatalogError>(Some((page.features, cursor)))
            }
        });

        let records = pages
            .map_ok(|features| stream::iter(features.into_iter().map(Ok::<Record, CatalogError>)))
            .try_flatten();
        Ok(match filter.limit {
            Some(limit) => records.take(limit).boxed(),
            None => records.boxed(),
        })
    }

    async fn write(
        &self,
        _tenant: &str,
        _entry: &CollectionEntry,
        _records: Vec<Record>,
    ) -> Result<(), CatalogError> {
        Err(CatalogError::Unsupported("write"))
    }

    async fn delete(&self, _tenant: &str, _collection: &str) -> Result<(), CatalogError> {
        Err(CatalogError::Unsupported("delete"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn feature(id: u32) -> Value {
        json!({"type": "Feature", "id": id, "geometry": null, "properties": {}})
    }

    #[tokio::test]
    async fn follows_next_links_lazily() {
        let server = MockServer::start().await;
        let next = format!("{}/collections/roads/items?page=2", server.uri());

        Mock::given(method("GET"))
            .and(path("/collections/roads/items"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "type": "FeatureCollection",
                "features": [feature(3)],
                "links": []
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/collections/roads/items"))
            .and(query_param("bbox", "0,0,10,10"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "type": "FeatureCollection",
                "features": [feature(1), feature(2)],
                "links": [{"rel": "next", "href": next}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let store = FeaturesApiStore::new(&server.uri()).unwrap();
        let filter = RecordFilter::default().with_bbox([0.0, 0.0, 10.0, 10.0]);
        let records: Vec<Record> = store
            .read("city", "roads", &filter)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        let ids: Vec<_> = records.iter().map(|r| r["id"].as_u64().unwrap()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn limit_stops_before_next_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/collections/roads/items"))
            .and(query_param("limit", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "features": [feature(1)],
                "links": [{"rel": "next", "href": format!("{}/never", server.uri())}]
            })))
            .mount(&server)
            .await;

        let store = FeaturesApiStore::new(&server.uri()).unwrap();
        let records: Vec<Record> = store
            .read("city", "roads", &RecordFilter::default().with_limit(1))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn next_link_to_another_origin_is_refused() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/collections/roads/items"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "features": [feature(1)],
                "links": [{"rel": "next", "href": "http://169.254.169.254/latest/meta-data/"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let store = FeaturesApiStore::new(&server.uri()).unwrap();
        let mut records = store
            .read("city", "roads", &RecordFilter::default())
            .await
            .unwrap();
        assert_eq!(records.try_next().await.unwrap().unwrap()["id"], json!(1));
        assert!(matches!(
            records.try_next().await,
            Err(CatalogError::AddressBlocked(_))
        ));
    }

    #[tokio::test]
    async fn missing_collection_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = FeaturesApiStore::new(&server.uri()).unwrap();
        let err = store
            .read("city", "nope", &RecordFilter::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CatalogError::NotFound(ref c) if c == "nope"));
    }

    #[tokio::test]
    async fn forbidden_maps_to_not_authorized() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let store = FeaturesApiStore::new(&server.uri()).unwrap();
        let err = store
            .read("city", "secret", &RecordFilter::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CatalogError::NotAuthorized { .. }));
    }

    #[tokio::test]
    async fn store_is_read_only() {
        let store = FeaturesApiStore::new("https://example.org/ogc").unwrap();
        let entry = CollectionEntry {
            id: "x".into(),
            title: "x".into(),
            content_hash: String::new(),
        };
        assert!(matches!(
            store.write("city", &entry, vec![]).await,
            Err(CatalogError::Unsupported("write"))
        ));
    }
}
