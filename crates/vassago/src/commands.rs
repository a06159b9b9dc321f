//! CLI command implementations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use color_eyre::eyre::{bail, eyre, Result};
use indicatif::{ProgressBar, ProgressStyle};

use vassago_core::{Document, DocumentId, Error, OrganizationId};
use vassago_knowledge::{
    CachedEmbedder, ChromaStore, Chunker, DocumentState, Embedder, Generator, InMemoryEmbeddingCache,
    InMemoryStore, IngestionPipeline, MockEmbedder, MockGenerator, OpenRouterClient, RagPipeline,
    VectorStore,
};
use vassago_server::{AppState, Server};
use vassago_telemetry::PipelineMetrics;

use crate::config::{Config, ProviderBackend, StoreBackend};

/// Long-lived clients and pipelines, built once per process.
pub struct Services {
    /// Ingestion pipeline.
    pub ingestion: Arc<IngestionPipeline>,
    /// Answer pipeline.
    pub rag: Arc<RagPipeline>,
    /// Shared counters.
    pub metrics: Arc<PipelineMetrics>,
    /// Backing store.
    pub store: Arc<dyn VectorStore>,
}

impl Services {
    /// Builds provider clients, the store and both pipelines from config.
    ///
    /// # Errors
    ///
    /// Returns an error if a client or the chunker rejects its settings.
    pub fn build(config: &Config) -> Result<Self> {
        let embedder: Arc<dyn Embedder>;
        let generator: Arc<dyn Generator>;
        match config.provider.effective_backend() {
            ProviderBackend::Mock => {
                tracing::warn!("No provider API key configured, using the offline mock provider");
                embedder = Arc::new(MockEmbedder::new(config.provider.mock_dimension));
                generator = Arc::new(MockGenerator::new());
            }
            _ => {
                let client = Arc::new(OpenRouterClient::new(config.provider.openrouter.clone())?);
                embedder = client.clone();
                generator = client;
            }
        }

        let embedder: Arc<dyn Embedder> = if config.cache.enabled {
            let cache = Arc::new(InMemoryEmbeddingCache::new(config.cache.capacity));
            Arc::new(CachedEmbedder::new(embedder, cache))
        } else {
            embedder
        };

        let store: Arc<dyn VectorStore> = match config.store.backend {
            StoreBackend::Memory => match embedder.dimension() {
                Some(dimension) => Arc::new(InMemoryStore::with_dimension(dimension)),
                None => Arc::new(InMemoryStore::new()),
            },
            StoreBackend::Chroma => {
                let mut chroma = config.store.chroma.clone();
                chroma.dimension = chroma.dimension.or(embedder.dimension());
                Arc::new(ChromaStore::new(chroma)?)
            }
        };

        let metrics = Arc::new(PipelineMetrics::new());
        let ingestion = IngestionPipeline::new(
            Chunker::new(config.chunking)?,
            embedder.clone(),
            store.clone(),
            config.ingestion,
        )
        .with_metrics(metrics.clone());
        let rag = RagPipeline::new(embedder, generator, store.clone(), config.retrieval.clone())
            .with_retry_policy(config.ingestion.retry)
            .with_metrics(metrics.clone());

        tracing::debug!(
            provider = ?config.provider.effective_backend(),
            store = ?config.store.backend,
            "Services ready"
        );

        Ok(Self {
            ingestion: Arc::new(ingestion),
            rag: Arc::new(rag),
            metrics,
            store,
        })
    }
}

fn warn_if_ephemeral(config: &Config) {
    if config.store.backend == StoreBackend::Memory {
        tracing::warn!("Using the in-memory store; records are discarded when this command exits");
    }
}

/// Start the HTTP server.
pub async fn serve(config: &Config) -> Result<()> {
    tracing::info!("Starting Vassago server...");

    let server_config = config.server.to_server_config()?;
    let services = Services::build(config)?;
    let state = AppState::new(
        server_config,
        services.ingestion,
        services.rag,
        services.metrics,
    );

    Server::new(state).run().await?;
    Ok(())
}

/// Derives a document id from a file name.
fn document_id_for(path: &Path) -> Result<DocumentId> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .map(DocumentId::new)
        .ok_or_else(|| eyre!("Cannot derive a document id from {}", path.display()))
}

/// Ingest text files into an organization.
pub async fn ingest(
    config: &Config,
    organization: String,
    files: Vec<PathBuf>,
    id: Option<String>,
) -> Result<()> {
    if id.is_some() && files.len() != 1 {
        bail!("--id can only be used with a single file");
    }
    warn_if_ephemeral(config);

    let services = Services::build(config)?;
    let organization = OrganizationId::new(organization);

    let progress = ProgressBar::new(files.len() as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );

    let mut incomplete = 0;
    for path in &files {
        let document_id = match &id {
            Some(id) => DocumentId::new(id.clone()),
            None => document_id_for(path)?,
        };
        progress.set_message(format!("Ingesting {}...", path.display()));

        let text = tokio::fs::read_to_string(path).await?;
        let document = Document::new(document_id, organization.clone(), text)
            .with_attribute("source", serde_json::Value::from(path.display().to_string()));

        let report = services.ingestion.ingest(&document).await;
        match &report.state {
            DocumentState::Complete => {
                progress.println(format!(
                    "  {} {} chunk(s), {} pruned ({:.0} ms)",
                    report.document_id,
                    report.chunks.len(),
                    report.pruned,
                    report.elapsed_ms
                ));
            }
            DocumentState::PartiallyFailed { failed } => {
                incomplete += 1;
                progress.println(format!(
                    "  {} partially failed, chunks {:?} need a retry",
                    report.document_id, failed
                ));
            }
            other => {
                incomplete += 1;
                progress.println(format!("  {} {:?}", report.document_id, other));
            }
        }
        progress.inc(1);
    }

    progress.finish_with_message("Ingestion complete");

    let snapshot = services.metrics.snapshot();
    println!(
        "\n[Chunks: {} stored, {} unchanged, {} failed; {} embedding call(s)]",
        snapshot.chunks_stored, snapshot.chunks_unchanged, snapshot.chunks_failed, snapshot.embed_calls
    );

    if incomplete > 0 {
        bail!("{incomplete} of {} document(s) did not complete", files.len());
    }
    Ok(())
}

/// Answer a question from an organization's documents.
pub async fn ask(
    config: &Config,
    organization: String,
    query: String,
    top_k: Option<usize>,
) -> Result<()> {
    warn_if_ephemeral(config);
    let services = Services::build(config)?;
    let organization = OrganizationId::new(organization);

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}")?);
    spinner.set_message("Retrieving context...");
    spinner.enable_steady_tick(std::time::Duration::from_millis(100));

    let result = services.rag.answer(&query, &organization, top_k).await;
    spinner.finish_and_clear();

    match result {
        Ok(answer) => {
            println!("{}\n", answer.answer);
            println!("Sources:");
            for (i, source) in answer.sources.iter().enumerate() {
                println!("  [{}] {} (score {:.3})", i + 1, source.chunk_id, source.score);
            }
            Ok(())
        }
        Err(Error::NoRelevantContext { .. }) => {
            println!("No relevant context found for organization {organization}.");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Delete a document and all of its chunks.
pub async fn delete(config: &Config, organization: String, document: String) -> Result<()> {
    warn_if_ephemeral(config);
    let services = Services::build(config)?;

    let deleted = services
        .ingestion
        .delete_document(&DocumentId::new(document.clone()), &OrganizationId::new(organization))
        .await?;

    println!("Deleted {deleted} chunk(s) of {document}.");
    Ok(())
}

/// Display version information.
pub fn version() {
    println!("Vassago {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Components:");
    println!("  vassago-knowledge  - Chunking, embedding, storage and retrieval");
    println!("  vassago-server     - HTTP API");
    println!("  vassago-telemetry  - Logging, tracing and counters");
}
