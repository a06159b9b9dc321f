//! Vector storage backends.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use vassago_core::{Chunk, ChunkId, ContentHash, DocumentId, Error, OrganizationId, Result};

use crate::embedding::cosine_similarity;

/// Metadata persisted next to each vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    /// Owning organization.
    pub organization: OrganizationId,
    /// Parent document.
    pub document_id: DocumentId,
    /// Sequence index of the chunk in its document.
    pub chunk_index: usize,
    /// Start byte offset in the document.
    pub start: usize,
    /// End byte offset in the document.
    pub end: usize,
    /// Hash of the chunk text.
    pub content_hash: ContentHash,
    /// Start of the ingestion run that wrote the record.
    pub ingested_at: DateTime<Utc>,
    /// Embedding model that produced the vector.
    pub model: String,
}

/// A vector record in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    /// Chunk identifier, unique within the store.
    pub id: ChunkId,
    /// The embedding vector.
    pub embedding: Vec<f32>,
    /// Chunk text.
    pub text: String,
    /// Metadata.
    pub metadata: RecordMetadata,
}

impl VectorRecord {
    /// Builds the record for an embedded chunk.
    #[must_use]
    pub fn from_chunk(
        chunk: &Chunk,
        embedding: Vec<f32>,
        ingested_at: DateTime<Utc>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            id: chunk.id(),
            embedding,
            text: chunk.text.clone(),
            metadata: RecordMetadata {
                organization: chunk.organization.clone(),
                document_id: chunk.document_id.clone(),
                chunk_index: chunk.index,
                start: chunk.start,
                end: chunk.end,
                content_hash: chunk.hash.clone(),
                ingested_at,
                model: model.into(),
            },
        }
    }
}

/// A similarity search hit.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    /// Matched chunk.
    pub chunk_id: ChunkId,
    /// Similarity score (higher = more similar).
    pub score: f32,
    /// Chunk text.
    pub text: String,
    /// Record metadata.
    pub metadata: RecordMetadata,
}

/// Restricts queries and deletions to matching records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataFilter {
    /// Only records owned by this organization.
    pub organization: Option<OrganizationId>,
    /// Only records cut from this document.
    pub document: Option<DocumentId>,
}

impl MetadataFilter {
    /// Matches every record of `organization`.
    #[must_use]
    pub fn for_organization(organization: impl Into<OrganizationId>) -> Self {
        Self {
            organization: Some(organization.into()),
            document: None,
        }
    }

    /// Narrows the filter to one document.
    #[must_use]
    pub fn with_document(mut self, document: impl Into<DocumentId>) -> Self {
        self.document = Some(document.into());
        self
    }

    /// Returns true if the filter places no restriction.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.organization.is_none() && self.document.is_none()
    }

    /// Returns true if `metadata` passes the filter.
    #[must_use]
    pub fn matches(&self, metadata: &RecordMetadata) -> bool {
        self.organization
            .as_ref()
            .map_or(true, |org| *org == metadata.organization)
            && self
                .document
                .as_ref()
                .map_or(true, |doc| *doc == metadata.document_id)
    }
}

/// Result of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    /// The record was written.
    Written,
    /// A record from a newer ingestion run was kept instead.
    Superseded,
}

/// Trait for vector storage backends.
///
/// Writers to the same chunk id resolve last-writer-wins on
/// `metadata.ingested_at`: a record never replaces one from a newer run.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Inserts or replaces the record with the same chunk id.
    async fn upsert(&self, record: VectorRecord) -> Result<UpsertOutcome>;

    /// Returns at most `top_k` matching records, most similar first.
    ///
    /// Equal scores are ordered most recently written first.
    async fn query(
        &self,
        embedding: &[f32],
        top_k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<QueryResult>>;

    /// Deletes a record. Returns true if it existed.
    async fn delete(&self, id: &ChunkId) -> Result<bool>;

    /// Gets a record by id.
    async fn get(&self, id: &ChunkId) -> Result<Option<VectorRecord>>;

    /// Lists the ids of matching records.
    async fn ids(&self, filter: &MetadataFilter) -> Result<Vec<ChunkId>>;

    /// Deletes every matching record. Returns the number deleted.
    async fn delete_where(&self, filter: &MetadataFilter) -> Result<usize>;

    /// Returns the total number of records.
    async fn count(&self) -> Result<usize>;

    /// Returns the collection dimensionality once it is fixed.
    fn dimension(&self) -> Option<usize>;
}

struct Entry {
    record: VectorRecord,
    seq: u64,
}

struct Collection {
    dimension: Option<usize>,
    records: HashMap<ChunkId, Entry>,
    next_seq: u64,
}

/// In-memory vector store with brute-force cosine search.
pub struct InMemoryStore {
    inner: RwLock<Collection>,
}

impl InMemoryStore {
    /// Creates a store whose dimensionality is fixed by the first upsert.
    #[must_use]
    pub fn new() -> Self {
        Self::with_collection(None)
    }

    /// Creates a store with a fixed dimensionality.
    #[must_use]
    pub fn with_dimension(dimension: usize) -> Self {
        Self::with_collection(Some(dimension))
    }

    fn with_collection(dimension: Option<usize>) -> Self {
        Self {
            inner: RwLock::new(Collection {
                dimension,
                records: HashMap::new(),
                next_seq: 0,
            }),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn check_dimension(expected: Option<usize>, actual: usize) -> Result<()> {
    match expected {
        Some(expected) if expected != actual => Err(Error::DimensionMismatch { expected, actual }),
        _ => Ok(()),
    }
}

#[async_trait]
impl VectorStore for InMemoryStore {
    async fn upsert(&self, record: VectorRecord) -> Result<UpsertOutcome> {
        let mut collection = self.inner.write();
        check_dimension(collection.dimension, record.embedding.len())?;

        if let Some(existing) = collection.records.get(&record.id) {
            if existing.record.metadata.ingested_at > record.metadata.ingested_at {
                return Ok(UpsertOutcome::Superseded);
            }
        }

        collection.dimension = Some(record.embedding.len());
        let seq = collection.next_seq;
        collection.next_seq += 1;
        collection
            .records
            .insert(record.id.clone(), Entry { record, seq });

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

        let collection = self.inner.read();
        check_dimension(collection.dimension, embedding.len())?;

        let mut scored: Vec<(f32, u64, &VectorRecord)> = collection
            .records
            .values()
            .filter(|entry| filter.matches(&entry.record.metadata))
            .map(|entry| {
                (
                    cosine_similarity(embedding, &entry.record.embedding),
                    entry.seq,
                    &entry.record,
                )
            })
            .collect();

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.1.cmp(&a.1))
        });
        scored.truncate(top_k);

        Ok(scored
            .into_iter()
            .map(|(score, _, record)| QueryResult {
                chunk_id: record.id.clone(),
                score,
                text: record.text.clone(),
                metadata: record.metadata.clone(),
            })
            .collect())
    }

    async fn delete(&self, id: &ChunkId) -> Result<bool> {
        Ok(self.inner.write().records.remove(id).is_some())
    }

    async fn get(&self, id: &ChunkId) -> Result<Option<VectorRecord>> {
        Ok(self
            .inner
            .read()
            .records
            .get(id)
            .map(|entry| entry.record.clone()))
    }

    async fn ids(&self, filter: &MetadataFilter) -> Result<Vec<ChunkId>> {
        let collection = self.inner.read();
        let mut ids: Vec<ChunkId> = collection
            .records
            .values()
            .filter(|entry| filter.matches(&entry.record.metadata))
            .map(|entry| entry.record.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn delete_where(&self, filter: &MetadataFilter) -> Result<usize> {
        let mut collection = self.inner.write();
        let before = collection.records.len();
        collection
            .records
            .retain(|_, entry| !filter.matches(&entry.record.metadata));
        Ok(before - collection.records.len())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.inner.read().records.len())
    }

    fn dimension(&self) -> Option<usize> {
        self.inner.read().dimension
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use vassago_core::Document;

    use super::*;

    fn record(doc: &str, org: &str, index: usize, embedding: Vec<f32>) -> VectorRecord {
        let document = Document::new(doc, org, format!("chunk {index} of {doc}"));
        let chunk = Chunk::new(&document, index, 0, document.text.len());
        VectorRecord::from_chunk(&chunk, embedding, Utc::now(), "test")
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryStore::new();

        store.upsert(record("a", "acme", 0, vec![1.0, 0.0, 0.0])).await.unwrap();
        store.upsert(record("a", "acme", 1, vec![0.0, 1.0, 0.0])).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 2);
        assert_eq!(store.dimension(), Some(3));

        let results = store
            .query(&[1.0, 0.0, 0.0], 10, &MetadataFilter::default())
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk_id.as_str(), "acme/a#0");
        assert!(results[0].score > 0.99);
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = InMemoryStore::new();
        let rec = record("a", "acme", 0, vec![1.0, 0.0]);

        store.upsert(rec.clone()).await.unwrap();
        store.upsert(rec.clone()).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        let stored = store.get(&rec.id).await.unwrap().unwrap();
        assert_eq!(stored.embedding, rec.embedding);
    }

    #[tokio::test]
    async fn test_older_run_does_not_overwrite() {
        let store = InMemoryStore::new();
        let newer = record("a", "acme", 0, vec![1.0, 0.0]);
        let mut older = record("a", "acme", 0, vec![0.0, 1.0]);
        older.metadata.ingested_at = newer.metadata.ingested_at - Duration::seconds(5);

        assert_eq!(store.upsert(newer.clone()).await.unwrap(), UpsertOutcome::Written);
        assert_eq!(store.upsert(older).await.unwrap(), UpsertOutcome::Superseded);

        let stored = store.get(&newer.id).await.unwrap().unwrap();
        assert_eq!(stored.embedding, vec![1.0, 0.0]);
    }

    #[tokio::test]
    async fn test_dimension_mismatch() {
        let store = InMemoryStore::with_dimension(3);

        let err = store.upsert(record("a", "acme", 0, vec![1.0, 0.0])).await.unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { expected: 3, actual: 2 }));

        let err = store
            .query(&[1.0], 1, &MetadataFilter::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { .. }));
    }

    #[tokio::test]
    async fn test_query_bounds_and_ordering() {
        let store = InMemoryStore::new();
        for i in 0..20 {
            let angle = i as f32 * 0.07;
            store
                .upsert(record("doc", "acme", i, vec![angle.cos(), angle.sin()]))
                .await
                .unwrap();
        }

        for top_k in [1, 3, 7, 20, 50] {
            let results = store
                .query(&[1.0, 0.0], top_k, &MetadataFilter::default())
                .await
                .unwrap();
            assert_eq!(results.len(), top_k.min(20));
            assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
        }

        assert!(store
            .query(&[1.0, 0.0], 0, &MetadataFilter::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_ties_prefer_most_recent() {
        let store = InMemoryStore::new();
        store.upsert(record("a", "acme", 0, vec![1.0, 0.0])).await.unwrap();
        store.upsert(record("b", "acme", 0, vec![1.0, 0.0])).await.unwrap();
        store.upsert(record("c", "acme", 0, vec![1.0, 0.0])).await.unwrap();

        let results = store
            .query(&[1.0, 0.0], 3, &MetadataFilter::default())
            .await
            .unwrap();
        let order: Vec<&str> = results.iter().map(|r| r.chunk_id.as_str()).collect();
        assert_eq!(order, ["acme/c#0", "acme/b#0", "acme/a#0"]);
    }

    #[tokio::test]
    async fn test_filters_and_cascade() {
        let store = InMemoryStore::new();
        store.upsert(record("a", "acme", 0, vec![1.0, 0.0])).await.unwrap();
        store.upsert(record("a", "acme", 1, vec![1.0, 0.1])).await.unwrap();
        store.upsert(record("b", "acme", 0, vec![1.0, 0.2])).await.unwrap();
        store.upsert(record("c", "globex", 0, vec![1.0, 0.0])).await.unwrap();

        let acme = MetadataFilter::for_organization("acme");
        let results = store.query(&[1.0, 0.0], 10, &acme).await.unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.metadata.organization.as_str() == "acme"));

        let doc_a = MetadataFilter::for_organization("acme").with_document("a");
        assert_eq!(
            store.ids(&doc_a).await.unwrap(),
            vec![ChunkId::from("acme/a#0"), ChunkId::from("acme/a#1")]
        );

        assert_eq!(store.delete_where(&doc_a).await.unwrap(), 2);
        assert_eq!(store.count().await.unwrap(), 2);
        assert!(store.delete(&ChunkId::from("acme/b#0")).await.unwrap());
        assert!(!store.delete(&ChunkId::from("acme/b#0")).await.unwrap());
    }
}
