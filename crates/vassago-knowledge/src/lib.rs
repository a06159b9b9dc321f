//! # Vassago Knowledge
//!
//! The knowledge engine behind Vassago: it turns organization-scoped documents
//! into searchable vectors and answers questions from them.
//!
//! ## Components
//!
//! - **Chunking**: bounded, overlapping segments that prefer sentence breaks
//! - **Embedding**: provider-agnostic `Embedder` and `Generator` traits, with an optional cache
//! - **Vector Storage**: in-memory and Chroma-backed stores behind `VectorStore`
//! - **Ingestion**: chunk → embed → store, idempotent and recoverable per chunk
//! - **Retrieval**: scoped similarity search, bounded prompt assembly, completion

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod chunker;
pub mod embedding;
pub mod ingest;
pub mod providers;
pub mod rag;
pub mod retry;
pub mod store;

pub use cache::{CachedEmbedder, EmbeddingCache, InMemoryEmbeddingCache};
pub use chunker::{Chunker, ChunkerConfig};
pub use embedding::{Embedder, Generator, MockEmbedder, MockGenerator};
pub use ingest::{
    ChunkOutcome, ChunkReport, DocumentState, IngestionConfig, IngestionPipeline, IngestionReport,
};
pub use providers::{ChromaConfig, ChromaStore, OpenRouterClient, OpenRouterConfig};
pub use rag::{Answer, Context, RagPipeline, RetrievalConfig, Source};
pub use retry::{Deadline, RetryPolicy};
pub use store::{
    InMemoryStore, MetadataFilter, QueryResult, RecordMetadata, UpsertOutcome, VectorRecord,
    VectorStore,
};
