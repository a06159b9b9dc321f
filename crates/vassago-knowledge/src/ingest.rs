//! Document ingestion: chunk, embed, store.
//!
//! Every chunk is embedded and written on its own, so a failure leaves the
//! chunks that were already stored in place and a later run only has to
//! redo the failed ones. Chunks whose stored content hash is unchanged are
//! never re-embedded, which makes re-ingesting a document idempotent.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vassago_core::{Chunk, ChunkId, Document, DocumentId, Error, OrganizationId, Result, Stage};
use vassago_telemetry::{PipelineMetrics, Timer};

use crate::chunker::Chunker;
use crate::embedding::Embedder;
use crate::retry::{with_retry, Deadline, RetryPolicy};
use crate::store::{MetadataFilter, UpsertOutcome, VectorRecord, VectorStore};

/// Ingestion settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    /// Chunks processed concurrently per document.
    pub concurrency: usize,
    /// Retry policy for provider and store calls.
    pub retry: RetryPolicy,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            retry: RetryPolicy::default(),
        }
    }
}

/// Lifecycle of a document within one ingestion run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DocumentState {
    /// Accepted, not yet chunked.
    Received,
    /// Split into chunks.
    Chunked {
        /// Number of chunks.
        chunks: usize,
    },
    /// Chunks are being embedded and written.
    Embedding,
    /// Every chunk is stored; stale records not yet pruned.
    Stored,
    /// Every chunk is stored and stale records are pruned.
    Complete,
    /// Some chunks failed; the rest are stored.
    PartiallyFailed {
        /// Indices of the failed chunks.
        failed: Vec<usize>,
    },
    /// The run failed as a whole.
    Failed {
        /// Stage that failed.
        stage: Stage,
        /// Failure description.
        reason: String,
    },
}

impl DocumentState {
    /// Returns true if the run has ended in this state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete | Self::PartiallyFailed { .. } | Self::Failed { .. }
        )
    }

    /// Returns true if a run may move from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(&self, next: &Self) -> bool {
        match (self, next) {
            (current, Self::Failed { .. }) => !current.is_terminal(),
            (Self::Received, Self::Chunked { .. })
            | (Self::Chunked { .. }, Self::Embedding)
            | (Self::Embedding, Self::Stored | Self::PartiallyFailed { .. })
            | (Self::Stored, Self::Complete) => true,
            _ => false,
        }
    }

    /// Short name of the state.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Chunked { .. } => "chunked",
            Self::Embedding => "embedding",
            Self::Stored => "stored",
            Self::Complete => "complete",
            Self::PartiallyFailed { .. } => "partially_failed",
            Self::Failed { .. } => "failed",
        }
    }
}

/// What happened to one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ChunkOutcome {
    /// Embedded and written.
    Stored,
    /// Already stored with the same content; nothing was written.
    Unchanged,
    /// Embedded, but a newer run had already written the chunk.
    Superseded,
    /// Not stored.
    Failed {
        /// Stage that failed.
        stage: Stage,
        /// Failure description, `"cancelled"` when the deadline expired.
        reason: String,
    },
}

impl ChunkOutcome {
    fn from_error(err: &Error, stage: Stage) -> Self {
        let reason = if err.is_cancelled() {
            "cancelled".to_string()
        } else {
            err.root().to_string()
        };
        Self::Failed {
            stage: err.stage().unwrap_or(stage),
            reason,
        }
    }

    /// Returns true if the chunk is not in the store.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Outcome of one chunk in a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkReport {
    /// Chunk index.
    pub index: usize,
    /// Chunk identifier.
    pub chunk_id: ChunkId,
    /// What happened.
    #[serde(flatten)]
    pub outcome: ChunkOutcome,
}

/// Result of ingesting one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionReport {
    /// Ingested document.
    pub document_id: DocumentId,
    /// Owning organization.
    pub organization: OrganizationId,
    /// Identifier of this run.
    pub run_id: Uuid,
    /// Wall-clock start of the run; stamped on every record written.
    pub started_at: DateTime<Utc>,
    /// Final document state.
    pub state: DocumentState,
    /// Per-chunk outcomes, ordered by index.
    pub chunks: Vec<ChunkReport>,
    /// Stale records removed after a complete run.
    pub pruned: usize,
    /// Run duration in milliseconds.
    pub elapsed_ms: u64,
}

impl IngestionReport {
    /// Returns true if every chunk is stored.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state == DocumentState::Complete
    }

    /// Indices of chunks that were not stored.
    #[must_use]
    pub fn failed_indices(&self) -> Vec<usize> {
        self.chunks
            .iter()
            .filter(|c| c.outcome.is_failed())
            .map(|c| c.index)
            .collect()
    }

    /// Number of chunks with the given outcome kind.
    #[must_use]
    pub fn count(&self, predicate: impl Fn(&ChunkOutcome) -> bool) -> usize {
        self.chunks.iter().filter(|c| predicate(&c.outcome)).count()
    }
}

/// Per-run context shared by every chunk task.
struct Run<'a> {
    document: &'a Document,
    started_at: DateTime<Utc>,
    deadline: Deadline,
}

/// Drives documents through chunking, embedding and storage.
pub struct IngestionPipeline {
    chunker: Chunker,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    config: IngestionConfig,
    metrics: Arc<PipelineMetrics>,
}

impl IngestionPipeline {
    /// Creates a new ingestion pipeline.
    pub fn new(
        chunker: Chunker,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        config: IngestionConfig,
    ) -> Self {
        Self {
            chunker,
            embedder,
            store,
            config,
            metrics: Arc::new(PipelineMetrics::new()),
        }
    }

    /// Records counters into `metrics` instead of a private instance.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Returns the pipeline counters.
    #[must_use]
    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Returns the backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    /// Returns the embedder.
    #[must_use]
    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Ingests a document with no deadline.
    pub async fn ingest(&self, document: &Document) -> IngestionReport {
        self.ingest_with_deadline(document, Deadline::none()).await
    }

    /// Ingests a document, abandoning in-flight calls when `deadline` passes.
    #[tracing::instrument(skip_all, fields(document = %document.id, organization = %document.organization()))]
    pub async fn ingest_with_deadline(
        &self,
        document: &Document,
        deadline: Deadline,
    ) -> IngestionReport {
        self.run(document, None, deadline).await
    }

    /// Reprocesses only the chunks that `previous` reports as failed.
    ///
    /// The document must be the same one the report was produced for.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the report belongs to another document.
    pub async fn retry_failed(
        &self,
        document: &Document,
        previous: &IngestionReport,
        deadline: Deadline,
    ) -> Result<IngestionReport> {
        if previous.document_id != document.id || previous.organization != *document.organization()
        {
            return Err(Error::invalid_config(format!(
                "report for {}/{} does not match document {}/{}",
                previous.organization,
                previous.document_id,
                document.organization(),
                document.id
            )));
        }
        if matches!(previous.state, DocumentState::Failed { .. }) {
            return Ok(self.run(document, None, deadline).await);
        }

        let targets: BTreeSet<usize> = previous.failed_indices().into_iter().collect();
        tracing::info!(document = %document.id, chunks = ?targets, "Retrying failed chunks");

        let mut report = self.run(document, Some(&targets), deadline).await;
        if matches!(report.state, DocumentState::Failed { .. }) {
            return Ok(report);
        }

        // Carry forward the outcomes that were not reprocessed.
        let mut merged: Vec<ChunkReport> = previous
            .chunks
            .iter()
            .filter(|c| !targets.contains(&c.index))
            .cloned()
            .collect();
        merged.append(&mut report.chunks);
        merged.sort_by_key(|c| c.index);
        report.chunks = merged;

        Ok(report)
    }

    /// Deletes every stored chunk of a document. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns the store error once retries are exhausted.
    pub async fn delete_document(
        &self,
        document_id: &DocumentId,
        organization: &OrganizationId,
    ) -> Result<usize> {
        let filter = MetadataFilter::for_organization(organization.clone())
            .with_document(document_id.clone());
        let store = &self.store;
        let filter = &filter;

        let deleted = with_retry(
            &self.config.retry,
            Deadline::none(),
            Stage::Storage,
            move || async move { store.delete_where(filter).await },
        )
        .await
        .map_err(|e| e.at_stage(Stage::Storage))?;

        tracing::info!(document = %document_id, organization = %organization, deleted, "Document deleted");
        Ok(deleted)
    }

    async fn run(
        &self,
        document: &Document,
        only: Option<&BTreeSet<usize>>,
        deadline: Deadline,
    ) -> IngestionReport {
        let timer = Timer::start("ingest");
        let mut report = IngestionReport {
            document_id: document.id.clone(),
            organization: document.organization().clone(),
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            state: DocumentState::Received,
            chunks: Vec::new(),
            pruned: 0,
            elapsed_ms: 0,
        };

        if let Err(reason) = validate(document) {
            return self.finish(report, timer, fail(Stage::Chunking, reason));
        }

        let chunks = self.chunker.chunk(document);
        let total = chunks.len();
        advance(&mut report, DocumentState::Chunked { chunks: total });
        advance(&mut report, DocumentState::Embedding);

        let run = Run {
            document,
            started_at: report.started_at,
            deadline,
        };
        let selected: Vec<&Chunk> = chunks
            .iter()
            .filter(|c| only.map_or(true, |set| set.contains(&c.index)))
            .collect();

        let pending: Vec<_> = selected
            .into_iter()
            .map(|chunk| self.process_chunk(chunk, &run).boxed())
            .collect();
        let mut outcomes: Vec<ChunkReport> = stream::iter(pending)
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;
        outcomes.sort_by_key(|c| c.index);
        report.chunks = outcomes;

        let still_failed = report.failed_indices();
        if !still_failed.is_empty() {
            let state = DocumentState::PartiallyFailed {
                failed: still_failed,
            };
            return self.finish(report, timer, state);
        }

        advance(&mut report, DocumentState::Stored);
        match self.prune(document, total).await {
            Ok(pruned) => {
                report.pruned = pruned;
                self.finish(report, timer, DocumentState::Complete)
            }
            Err(err) => {
                let state = fail(Stage::Storage, err.root().to_string());
                self.finish(report, timer, state)
            }
        }
    }

    async fn process_chunk(&self, chunk: &Chunk, run: &Run<'_>) -> ChunkReport {
        let outcome = match self.store_chunk(chunk, run).await {
            Ok(outcome) => outcome,
            Err((stage, err)) => {
                tracing::warn!(chunk = %chunk.id(), stage = %stage, error = %err, "Chunk failed");
                ChunkOutcome::from_error(&err, stage)
            }
        };

        match &outcome {
            ChunkOutcome::Stored | ChunkOutcome::Superseded => self.metrics.record_chunk_stored(),
            ChunkOutcome::Unchanged => self.metrics.record_chunk_unchanged(),
            ChunkOutcome::Failed { .. } => self.metrics.record_chunk_failed(),
        }

        ChunkReport {
            index: chunk.index,
            chunk_id: chunk.id(),
            outcome,
        }
    }

    async fn store_chunk(
        &self,
        chunk: &Chunk,
        run: &Run<'_>,
    ) -> std::result::Result<ChunkOutcome, (Stage, Error)> {
        let id = &chunk.id();
        let store = &self.store;
        let embedder = &self.embedder;
        let metrics = &self.metrics;
        let policy = &self.config.retry;
        let model = embedder.model_name();

        let existing = with_retry(policy, run.deadline, Stage::Storage, move || async move {
            store.get(id).await
        })
        .await
        .map_err(|e| (Stage::Storage, e))?;

        if let Some(existing) = existing {
            let meta = &existing.metadata;
            if meta.content_hash == chunk.hash
                && meta.model == model
                && meta.organization == *run.document.organization()
            {
                tracing::trace!(chunk = %id, "Chunk unchanged");
                return Ok(ChunkOutcome::Unchanged);
            }
        }

        let text = chunk.text.as_str();
        let embedding = with_retry(policy, run.deadline, Stage::Embedding, move || async move {
            metrics.record_embed_calls(1);
            embedder.embed_single(text).await
        })
        .await
        .map_err(|e| (Stage::Embedding, e))?;

        let record = &VectorRecord::from_chunk(
            chunk,
            embedding,
            run.started_at,
            model,
        );
        let outcome = with_retry(policy, run.deadline, Stage::Storage, move || {
            let record = record.clone();
            async move { store.upsert(record).await }
        })
        .await
        .map_err(|e| (Stage::Storage, e))?;

        Ok(match outcome {
            UpsertOutcome::Written => ChunkOutcome::Stored,
            UpsertOutcome::Superseded => ChunkOutcome::Superseded,
        })
    }

    /// Removes records of chunks past the document's current chunk count.
    async fn prune(&self, document: &Document, chunk_count: usize) -> Result<usize> {
        let filter = MetadataFilter::for_organization(document.organization().clone())
            .with_document(document.id.clone());
        let store = &self.store;
        let policy = &self.config.retry;

        let filter = &filter;
        let ids = with_retry(policy, Deadline::none(), Stage::Storage, move || async move {
            store.ids(filter).await
        })
        .await?;

        let mut pruned = 0;
        for id in ids {
            let stale = id
                .parts()
                .is_some_and(|(org, doc, index)| {
                    org == *document.organization() && doc == document.id && index >= chunk_count
                });
            if !stale {
                continue;
            }
            let id = &id;
            if with_retry(policy, Deadline::none(), Stage::Storage, move || async move {
                store.delete(id).await
            })
            .await?
            {
                pruned += 1;
            }
        }

        if pruned > 0 {
            tracing::debug!(document = %document.id, pruned, "Pruned stale chunks");
        }
        Ok(pruned)
    }

    fn finish(
        &self,
        mut report: IngestionReport,
        timer: Timer,
        state: DocumentState,
    ) -> IngestionReport {
        advance(&mut report, state);
        report.elapsed_ms = timer.stop() as u64;

        match &report.state {
            DocumentState::Complete => self.metrics.record_document(true),
            DocumentState::PartiallyFailed { .. } => self.metrics.record_document(false),
            _ => self.metrics.record_error(),
        }

        tracing::info!(
            document = %report.document_id,
            run = %report.run_id,
            state = report.state.name(),
            chunks = report.chunks.len(),
            failed = report.failed_indices().len(),
            pruned = report.pruned,
            elapsed_ms = report.elapsed_ms,
            "Ingestion finished"
        );
        report
    }
}

fn validate(document: &Document) -> std::result::Result<(), String> {
    if document.id.as_str().trim().is_empty() {
        return Err("document id must not be empty".to_string());
    }
    if document.organization().as_str().trim().is_empty() {
        return Err("organization must not be empty".to_string());
    }
    if document.organization().as_str().contains(ChunkId::SCOPE) {
        return Err(format!("organization must not contain '{}'", ChunkId::SCOPE));
    }
    Ok(())
}

fn fail(stage: Stage, reason: impl Into<String>) -> DocumentState {
    DocumentState::Failed {
        stage,
        reason: reason.into(),
    }
}

fn advance(report: &mut IngestionReport, next: DocumentState) {
    debug_assert!(
        report.state.can_transition_to(&next),
        "invalid transition {} -> {}",
        report.state.name(),
        next.name()
    );
    tracing::debug!(
        document = %report.document_id,
        from = report.state.name(),
        to = next.name(),
        "Document state"
    );
    report.state = next;
}
