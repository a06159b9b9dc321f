//! Chroma vector store over the v2 HTTP API.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::OnceCell;
use vassago_core::{ChunkId, ContentHash, DocumentId, Error, OrganizationId, Result};

use super::error_body;
use crate::store::{
    MetadataFilter, QueryResult, RecordMetadata, UpsertOutcome, VectorRecord, VectorStore,
};

/// Chroma connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChromaConfig {
    /// Server URL.
    pub url: String,
    /// Tenant name.
    pub tenant: String,
    /// Database name.
    pub database: String,
    /// Collection name; created on first use.
    pub collection: String,
    /// Fixed embedding dimensionality, if known up front.
    pub dimension: Option<usize>,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for ChromaConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000".to_string(),
            tenant: "default_tenant".to_string(),
            database: "default_database".to_string(),
            collection: "vassago".to_string(),
            dimension: None,
            timeout_secs: 30,
        }
    }
}

/// Vector store backed by a Chroma collection using cosine distance.
///
/// Last-writer-wins on `ingested_at` is checked with a read before each write,
/// so it only holds for writers that do not race on the same chunk.
pub struct ChromaStore {
    client: Client,
    config: ChromaConfig,
    collection_id: OnceCell<String>,
    dimension: RwLock<Option<usize>>,
}

impl ChromaStore {
    /// Creates a store. No request is made until first use.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the URL or collection name is empty.
    pub fn new(config: ChromaConfig) -> Result<Self> {
        if config.url.trim().is_empty() || config.collection.trim().is_empty() {
            return Err(Error::invalid_config("chroma url and collection are required"));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            dimension: RwLock::new(config.dimension),
            config,
            collection_id: OnceCell::new(),
        })
    }

    /// Checks that the server answers its heartbeat.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the server cannot be reached.
    pub async fn heartbeat(&self) -> Result<()> {
        let url = format!("{}/api/v2/heartbeat", self.base());
        let response = self.client.get(url).send().await.map_err(transport_error)?;
        check_status(response).await.map(|_| ())
    }

    fn base(&self) -> &str {
        self.config.url.trim_end_matches('/')
    }

    fn collections_url(&self) -> String {
        format!(
            "{}/api/v2/tenants/{}/databases/{}/collections",
            self.base(),
            self.config.tenant,
            self.config.database
        )
    }

    async fn collection_url(&self) -> Result<String> {
        let id = self
            .collection_id
            .get_or_try_init(|| async {
                let body = json!({
                    "name": self.config.collection,
                    "metadata": { "hnsw:space": "cosine" },
                    "get_or_create": true,
                });
                let created: CollectionResponse =
                    self.request(self.collections_url(), &body).await?;
                if let Some(reported) = created.dimension {
                    self.adopt_dimension(reported);
                }
                tracing::info!(
                    collection = %self.config.collection,
                    id = %created.id,
                    dimension = ?created.dimension,
                    "Chroma collection ready"
                );
                Ok::<_, Error>(created.id)
            })
            .await?;
        Ok(format!("{}/{}", self.collections_url(), id))
    }

    async fn request<B: Serialize, R: DeserializeOwned>(&self, url: String, body: &B) -> Result<R> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| Error::store(format!("malformed response: {e}")))
    }

    async fn collection_call<R: DeserializeOwned>(&self, op: &str, body: Value) -> Result<R> {
        let url = format!("{}/{op}", self.collection_url().await?);
        self.request(url, &body).await
    }

    /// Takes the dimension the collection already holds, which wins over config.
    fn adopt_dimension(&self, reported: usize) {
        let mut dimension = self.dimension.write();
        if let Some(configured) = *dimension {
            if configured != reported {
                tracing::warn!(
                    collection = %self.config.collection,
                    configured,
                    reported,
                    "Configured dimension differs from the existing collection"
                );
            }
        }
        *dimension = Some(reported);
    }

    /// Resolves the collection first so its stored dimension is known.
    async fn check_dimension(&self, actual: usize) -> Result<()> {
        self.collection_url().await?;
        match *self.dimension.read() {
            Some(expected) if expected != actual => {
                Err(Error::DimensionMismatch { expected, actual })
            }
            _ => Ok(()),
        }
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = error_body(response).await;
    Err(if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Error::store_unavailable(format!("{status}: {body}"))
    } else {
        Error::store(format!("{status}: {body}"))
    })
}

fn transport_error(err: reqwest::Error) -> Error {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        Error::store_unavailable(err.to_string())
    } else {
        Error::store(err.to_string())
    }
}

/// Translates a filter into a Chroma `where` clause.
fn where_clause(filter: &MetadataFilter) -> Option<Value> {
    let mut conditions = Vec::new();
    if let Some(org) = &filter.organization {
        conditions.push(json!({ "organization": { "$eq": org.as_str() } }));
    }
    if let Some(doc) = &filter.document {
        conditions.push(json!({ "document_id": { "$eq": doc.as_str() } }));
    }
    match conditions.len() {
        0 => None,
        1 => conditions.pop(),
        _ => Some(json!({ "$and": conditions })),
    }
}

fn to_chroma_metadata(metadata: &RecordMetadata) -> Value {
    json!({
        "organization": metadata.organization.as_str(),
        "document_id": metadata.document_id.as_str(),
        "chunk_index": metadata.chunk_index,
        "start": metadata.start,
        "end": metadata.end,
        "content_hash": metadata.content_hash.as_str(),
        "ingested_at": metadata.ingested_at.to_rfc3339(),
        "model": metadata.model,
    })
}

fn from_chroma_metadata(value: &Map<String, Value>) -> Result<RecordMetadata> {
    let text = |key: &str| -> Result<String> {
        value
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::store(format!("record metadata missing `{key}`")))
    };
    let number = |key: &str| -> Result<usize> {
        value
            .get(key)
            .and_then(Value::as_u64)
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| Error::store(format!("record metadata missing `{key}`")))
    };

    let ingested_at = DateTime::parse_from_rfc3339(&text("ingested_at")?)
        .map_err(|e| Error::store(format!("bad ingested_at: {e}")))?
        .with_timezone(&Utc);

    Ok(RecordMetadata {
        organization: OrganizationId::new(text("organization")?),
        document_id: DocumentId::new(text("document_id")?),
        chunk_index: number("chunk_index")?,
        start: number("start")?,
        end: number("end")?,
        content_hash: ContentHash(text("content_hash")?),
        ingested_at,
        model: text("model")?,
    })
}

#[async_trait]
impl VectorStore for ChromaStore {
    async fn upsert(&self, record: VectorRecord) -> Result<UpsertOutcome> {
        self.check_dimension(record.embedding.len()).await?;

        if let Some(existing) = self.get(&record.id).await? {
            if existing.metadata.ingested_at > record.metadata.ingested_at {
                return Ok(UpsertOutcome::Superseded);
            }
        }

        let body = json!({
            "ids": [record.id.as_str()],
            "embeddings": [record.embedding],
            "documents": [record.text],
            "metadatas": [to_chroma_metadata(&record.metadata)],
        });
        let _: Value = self.collection_call("upsert", body).await?;

        self.dimension
            .write()
            .get_or_insert(record.embedding.len());
        Ok(UpsertOutcome::Written)
    }

    async fn query(
        &self,
        embedding: &[f32],
        top_k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<QueryResult>> {
        if top_k == 0 {
            return Err(Error::invalid_config("top_k must be at least 1"));
        }
        self.check_dimension(embedding.len()).await?;

        let mut body = json!({
            "query_embeddings": [embedding],
            "n_results": top_k,
            "include": ["documents", "metadatas", "distances"],
        });
        if let Some(clause) = where_clause(filter) {
            body["where"] = clause;
        }
        let response: QueryResponse = self.collection_call("query", body).await?;

        let ids = response.ids.into_iter().next().unwrap_or_default();
        let documents = response.documents.into_iter().next().unwrap_or_default();
        let metadatas = response.metadatas.into_iter().next().unwrap_or_default();
        let distances = response.distances.into_iter().next().unwrap_or_default();

        let mut results = Vec::with_capacity(ids.len());
        for (i, id) in ids.into_iter().enumerate() {
            let metadata = metadatas
                .get(i)
                .and_then(Option::as_ref)
                .ok_or_else(|| Error::store(format!("no metadata for {id}")))?;
            let distance = distances.get(i).copied().flatten().unwrap_or(2.0);
            results.push(QueryResult {
                chunk_id: ChunkId::from(id),
                score: 1.0 - distance,
                text: documents.get(i).cloned().flatten().unwrap_or_default(),
                metadata: from_chroma_metadata(metadata)?,
            });
        }

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.metadata.ingested_at.cmp(&a.metadata.ingested_at))
        });
        results.truncate(top_k);
        Ok(results)
    }

    async fn delete(&self, id: &ChunkId) -> Result<bool> {
        if self.get(id).await?.is_none() {
            return Ok(false);
        }
        let _: Value = self
            .collection_call("delete", json!({ "ids": [id.as_str()] }))
            .await?;
        Ok(true)
    }

    async fn get(&self, id: &ChunkId) -> Result<Option<VectorRecord>> {
        let body = json!({
            "ids": [id.as_str()],
            "include": ["documents", "metadatas", "embeddings"],
        });
        let response: GetResponse = self.collection_call("get", body).await?;

        let Some(found) = response.ids.into_iter().next() else {
            return Ok(None);
        };
        let metadata = response
            .metadatas
            .into_iter()
            .next()
            .flatten()
            .ok_or_else(|| Error::store(format!("no metadata for {found}")))?;

        Ok(Some(VectorRecord {
            id: ChunkId::from(found),
            embedding: response
                .embeddings
                .and_then(|e| e.into_iter().next())
                .unwrap_or_default(),
            text: response
                .documents
                .into_iter()
                .next()
                .flatten()
                .unwrap_or_default(),
            metadata: from_chroma_metadata(&metadata)?,
        }))
    }

    async fn ids(&self, filter: &MetadataFilter) -> Result<Vec<ChunkId>> {
        let mut body = json!({ "include": [] });
        if let Some(clause) = where_clause(filter) {
            body["where"] = clause;
        }
        let response: GetResponse = self.collection_call("get", body).await?;

        let mut ids: Vec<ChunkId> = response.ids.into_iter().map(ChunkId::from).collect();
        ids.sort();
        Ok(ids)
    }

    async fn delete_where(&self, filter: &MetadataFilter) -> Result<usize> {
        let ids = self.ids(filter).await?;
        if ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<&str> = ids.iter().map(ChunkId::as_str).collect();
        let _: Value = self
            .collection_call("delete", json!({ "ids": ids }))
            .await?;
        Ok(ids.len())
    }

    async fn count(&self) -> Result<usize> {
        let url = format!("{}/count", self.collection_url().await?);
        let response = self.client.get(url).send().await.map_err(transport_error)?;
        check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| Error::store(format!("malformed response: {e}")))
    }

    fn dimension(&self) -> Option<usize> {
        *self.dimension.read()
    }
}

#[derive(Debug, Deserialize)]
struct CollectionResponse {
    id: String,
    #[serde(default)]
    dimension: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    ids: Vec<Vec<String>>,
    #[serde(default)]
    documents: Vec<Vec<Option<String>>>,
    #[serde(default)]
    metadatas: Vec<Vec<Option<Map<String, Value>>>>,
    #[serde(default)]
    distances: Vec<Vec<Option<f32>>>,
}

#[derive(Debug, Deserialize)]
struct GetResponse {
    ids: Vec<String>,
    #[serde(default)]
    documents: Vec<Option<String>>,
    #[serde(default)]
    metadatas: Vec<Option<Map<String, Value>>>,
    #[serde(default)]
    embeddings: Option<Vec<Vec<f32>>>,
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::extract::State;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use parking_lot::Mutex;

    use super::*;
    use crate::providers::stub;

    const COLLECTIONS: &str = "/api/v2/tenants/default_tenant/databases/default_database/collections";

    type Captured = Arc<Mutex<Vec<(String, Value)>>>;

    fn metadata(org: &str, doc: &str, index: usize) -> Value {
        json!({
            "organization": org,
            "document_id": doc,
            "chunk_index": index,
            "start": 0,
            "end": 5,
            "content_hash": ContentHash::of("hello").as_str(),
            "ingested_at": "2026-03-01T12:00:00+00:00",
            "model": "test",
        })
    }

    async fn stub_store(captured: Captured) -> ChromaStore {
        let record = |op: &'static str| {
            move |State(captured): State<Captured>, Json(body): Json<Value>| async move {
                captured.lock().push((op.to_string(), body.clone()));
                match op {
                    "query" => Json(json!({
                        "ids": [["acme/a#0", "acme/b#0"]],
                        "documents": [["alpha", "beta"]],
                        "metadatas": [[metadata("acme", "a", 0), metadata("acme", "b", 0)]],
                        "distances": [[0.5, 0.1]],
                    })),
                    "get" if body["ids"].is_array() => Json(json!({ "ids": [], "documents": [], "metadatas": [] })),
                    "get" => Json(json!({ "ids": ["acme/a#0", "acme/a#3"] })),
                    _ => Json(json!({})),
                }
            }
        };

        let collection = format!("{COLLECTIONS}/c-1");
        let router = Router::new()
            .route(
                COLLECTIONS,
                post(|Json(body): Json<Value>| async move {
                    assert_eq!(body["metadata"]["hnsw:space"], "cosine");
                    Json(json!({ "id": "c-1", "name": body["name"] }))
                }),
            )
            .route(&format!("{collection}/query"), post(record("query")))
            .route(&format!("{collection}/get"), post(record("get")))
            .route(&format!("{collection}/upsert"), post(record("upsert")))
            .route(&format!("{collection}/delete"), post(record("delete")))
            .route(&format!("{collection}/count"), get(|| async { Json(json!(2)) }))
            .with_state(captured);

        let config = ChromaConfig {
            url: stub::serve(router).await,
            dimension: Some(2),
            ..ChromaConfig::default()
        };
        ChromaStore::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_query_converts_distance_and_sorts() {
        let captured = Captured::default();
        let store = stub_store(captured.clone()).await;

        let filter = MetadataFilter::for_organization("acme").with_document("a");
        let results = store.query(&[1.0, 0.0], 5, &filter).await.unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk_id.as_str(), "acme/b#0");
        assert!((results[0].score - 0.9).abs() < 1e-6);
        assert!((results[1].score - 0.5).abs() < 1e-6);
        assert_eq!(results[0].metadata.organization.as_str(), "acme");

        let calls = captured.lock();
        let (_, body) = calls.iter().find(|(op, _)| op == "query").unwrap();
        assert_eq!(body["n_results"], 5);
        assert_eq!(body["where"]["$and"][0]["organization"]["$eq"], "acme");
        assert_eq!(body["where"]["$and"][1]["document_id"]["$eq"], "a");
    }

    #[tokio::test]
    async fn test_upsert_sends_flat_metadata() {
        let captured = Captured::default();
        let store = stub_store(captured.clone()).await;

        let document = vassago_core::Document::new("a", "acme", "hello world");
        let chunk = vassago_core::Chunk::new(&document, 0, 0, 5);
        let record = VectorRecord::from_chunk(
            &chunk,
            vec![0.6, 0.8],
            Utc::now(),
            "test",
        );
        assert_eq!(store.upsert(record).await.unwrap(), UpsertOutcome::Written);

        let calls = captured.lock();
        let (_, body) = calls.iter().find(|(op, _)| op == "upsert").unwrap();
        assert_eq!(body["ids"][0], "acme/a#0");
        assert_eq!(body["documents"][0], "hello");
        assert_eq!(body["metadatas"][0]["organization"], "acme");
        assert_eq!(body["metadatas"][0]["chunk_index"], 0);
    }

    #[tokio::test]
    async fn test_dimension_checked_locally() {
        let store = stub_store(Captured::default()).await;
        let err = store
            .query(&[1.0, 0.0, 0.0], 1, &MetadataFilter::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { expected: 2, actual: 3 }));
    }

    #[tokio::test]
    async fn test_dimension_taken_from_existing_collection() {
        let router = Router::new()
            .route(
                COLLECTIONS,
                post(|| async { Json(json!({ "id": "c-9", "name": "vassago", "dimension": 3 })) }),
            )
            .route(
                &format!("{COLLECTIONS}/c-9/query"),
                post(|| async { Json(json!({ "ids": [[]] })) }),
            );
        let store = ChromaStore::new(ChromaConfig {
            url: stub::serve(router).await,
            dimension: None,
            ..ChromaConfig::default()
        })
        .unwrap();
        assert_eq!(store.dimension(), None);

        let err = store
            .query(&[1.0, 0.0], 1, &MetadataFilter::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { expected: 3, actual: 2 }));
        assert_eq!(store.dimension(), Some(3));

        let results = store
            .query(&[1.0, 0.0, 0.0], 1, &MetadataFilter::default())
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_delete_where_and_count() {
        let captured = Captured::default();
        let store = stub_store(captured.clone()).await;

        let deleted = store
            .delete_where(&MetadataFilter::for_organization("acme").with_document("a"))
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(store.count().await.unwrap(), 2);

        let calls = captured.lock();
        let (_, body) = calls.iter().find(|(op, _)| op == "delete").unwrap();
        assert_eq!(body["ids"], json!(["acme/a#0", "acme/a#3"]));
    }

    #[tokio::test]
    async fn test_server_errors_are_retryable() {
        let router = Router::new().route(
            COLLECTIONS,
            post(|| async { (AxumStatus::INTERNAL_SERVER_ERROR, "boom") }),
        );
        let store = ChromaStore::new(ChromaConfig {
            url: stub::serve(router).await,
            ..ChromaConfig::default()
        })
        .unwrap();

        let err = store.count().await.unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_client_errors_are_permanent() {
        let router = Router::new().route(
            COLLECTIONS,
            post(|| async { (AxumStatus::BAD_REQUEST, "invalid collection name") }),
        );
        let store = ChromaStore::new(ChromaConfig {
            url: stub::serve(router).await,
            ..ChromaConfig::default()
        })
        .unwrap();

        let err = store.count().await.unwrap_err();
        assert!(matches!(err, Error::Store { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let store = ChromaStore::new(ChromaConfig {
            url: stub::dead_url().await,
            ..ChromaConfig::default()
        })
        .unwrap();

        let err = store.heartbeat().await.unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable { .. }));
    }
}
