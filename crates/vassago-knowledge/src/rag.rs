//! Retrieval-Augmented Generation pipeline.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use vassago_core::{ChunkId, DocumentId, Error, OrganizationId, Result, Stage};
use vassago_telemetry::PipelineMetrics;

use crate::embedding::{Embedder, Generator};
use crate::retry::{with_retry, Deadline, RetryPolicy};
use crate::store::{MetadataFilter, QueryResult, VectorStore};

const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful assistant. Answer questions based on the provided context.";

/// Configuration for retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Number of chunks to retrieve when the caller does not say.
    pub top_k: usize,
    /// Minimum similarity score.
    pub min_score: f32,
    /// Upper bound on the characters of context handed to the model.
    pub max_context_chars: usize,
    /// Instruction placed ahead of the question.
    pub system_prompt: String,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_score: 0.3,
            max_context_chars: 6000,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

/// A chunk that was included in the prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    /// Chunk identifier.
    pub chunk_id: ChunkId,
    /// Parent document.
    pub document_id: DocumentId,
    /// Similarity score.
    pub score: f32,
}

/// A generated answer and the chunks it was grounded on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    /// Model output.
    pub answer: String,
    /// Chunks actually included in the context, most relevant first.
    pub sources: Vec<Source>,
}

/// Context passages selected for a prompt.
#[derive(Debug, Clone, Default)]
pub struct Context {
    /// Passage texts, most relevant first.
    pub passages: Vec<String>,
    /// Where each passage came from.
    pub sources: Vec<Source>,
}

impl Context {
    /// Renders the passages as a numbered list.
    #[must_use]
    pub fn render(&self) -> String {
        self.passages
            .iter()
            .enumerate()
            .map(|(i, p)| format!("[{}] {}", i + 1, p))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Total characters across all passages.
    #[must_use]
    pub fn char_len(&self) -> usize {
        self.passages.iter().map(|p| p.chars().count()).sum()
    }
}

/// RAG pipeline for retrieval-augmented generation.
pub struct RagPipeline {
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn Generator>,
    store: Arc<dyn VectorStore>,
    config: RetrievalConfig,
    retry: RetryPolicy,
    metrics: Arc<PipelineMetrics>,
}

impl RagPipeline {
    /// Creates a new RAG pipeline.
    pub fn new(
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
        store: Arc<dyn VectorStore>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            embedder,
            generator,
            store,
            config,
            retry: RetryPolicy::default(),
            metrics: Arc::new(PipelineMetrics::new()),
        }
    }

    /// Sets the retry policy for provider and store calls.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Records counters into `metrics` instead of a private instance.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Returns the retrieval configuration.
    #[must_use]
    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Retrieves the chunks of `organization` most similar to `query`.
    ///
    /// Results below `min_score` are dropped.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for `top_k == 0`, otherwise the embedding or
    /// search error attributed to its stage.
    pub async fn retrieve(
        &self,
        query: &str,
        organization: &OrganizationId,
        top_k: usize,
        deadline: Deadline,
    ) -> Result<Vec<QueryResult>> {
        if top_k == 0 {
            return Err(Error::invalid_config("top_k must be at least 1"));
        }

        let embedder = &self.embedder;
        let embedding = with_retry(&self.retry, deadline, Stage::Embedding, move || async move {
            embedder.embed_single(query).await
        })
        .await
        .map_err(|e| e.at_stage(Stage::Embedding))?;

        let store = &self.store;
        let embedding = embedding.as_slice();
        let filter = &MetadataFilter::for_organization(organization.clone());
        let results = with_retry(&self.retry, deadline, Stage::Retrieval, move || async move {
            store.query(embedding, top_k, filter).await
        })
        .await
        .map_err(|e| e.at_stage(Stage::Retrieval))?;

        let min_score = self.config.min_score;
        let results: Vec<QueryResult> = results
            .into_iter()
            .filter(|r| r.score >= min_score)
            .collect();

        tracing::debug!(
            organization = %organization,
            top_k,
            hits = results.len(),
            "Retrieved context"
        );
        Ok(results)
    }

    /// Selects passages in rank order until `max_context_chars` is reached.
    ///
    /// Lower-ranked results are dropped first. A top result that alone exceeds
    /// the budget is truncated to fit.
    #[must_use]
    pub fn build_context(&self, results: &[QueryResult]) -> Context {
        let budget = self.config.max_context_chars;
        let mut context = Context::default();
        let mut used = 0;

        for result in results {
            let len = result.text.chars().count();
            let text = if used + len <= budget {
                result.text.clone()
            } else if context.passages.is_empty() && budget > 0 {
                result.text.chars().take(budget).collect()
            } else {
                break;
            };

            used += text.chars().count();
            context.passages.push(text);
            context.sources.push(Source {
                chunk_id: result.chunk_id.clone(),
                document_id: result.metadata.document_id.clone(),
                score: result.score,
            });
        }

        if context.passages.len() < results.len() {
            tracing::debug!(
                kept = context.passages.len(),
                dropped = results.len() - context.passages.len(),
                budget,
                "Context truncated"
            );
        }
        context
    }

    /// Builds the prompt sent alongside the context.
    #[must_use]
    pub fn prompt(&self, query: &str) -> String {
        format!("{}\n\nQuestion: {}", self.config.system_prompt, query)
    }

    /// Answers `query` from the documents of `organization`.
    ///
    /// # Errors
    ///
    /// See [`RagPipeline::answer_with_deadline`].
    pub async fn answer(
        &self,
        query: &str,
        organization: &OrganizationId,
        top_k: Option<usize>,
    ) -> Result<Answer> {
        self.answer_with_deadline(query, organization, top_k, Deadline::none())
            .await
    }

    /// Answers `query`, abandoning in-flight calls when `deadline` passes.
    ///
    /// # Errors
    ///
    /// Returns `NoRelevantContext` when nothing clears `min_score`; any other
    /// failure is attributed to the embedding, retrieval or completion stage.
    #[tracing::instrument(skip_all, fields(organization = %organization))]
    pub async fn answer_with_deadline(
        &self,
        query: &str,
        organization: &OrganizationId,
        top_k: Option<usize>,
        deadline: Deadline,
    ) -> Result<Answer> {
        let result = self.answer_inner(query, organization, top_k, deadline).await;
        match &result {
            Ok(_) => self.metrics.record_answer(),
            Err(Error::NoRelevantContext { .. }) => self.metrics.record_no_context(),
            Err(err) => {
                tracing::warn!(error = %err, stage = ?err.stage(), "Answer failed");
                self.metrics.record_error();
            }
        }
        result
    }

    async fn answer_inner(
        &self,
        query: &str,
        organization: &OrganizationId,
        top_k: Option<usize>,
        deadline: Deadline,
    ) -> Result<Answer> {
        let top_k = top_k.unwrap_or(self.config.top_k);
        let results = self.retrieve(query, organization, top_k, deadline).await?;
        if results.is_empty() {
            return Err(Error::NoRelevantContext {
                organization: organization.clone(),
                min_score: self.config.min_score,
            });
        }

        let context = self.build_context(&results);
        let prompt = self.prompt(query);
        let generator = &self.generator;
        let (prompt, passages) = (prompt.as_str(), context.passages.as_slice());
        let answer = with_retry(&self.retry, deadline, Stage::Completion, move || async move {
            generator.complete(prompt, passages).await
        })
        .await
        .map_err(|e| e.at_stage(Stage::Completion))?;

        tracing::info!(
            organization = %organization,
            sources = context.sources.len(),
            context_chars = context.char_len(),
            model = self.generator.model_name(),
            "Answered question"
        );

        Ok(Answer {
            answer,
            sources: context.sources,
        })
    }
}
