//! Common types used across the Vassago knowledge pipeline.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Unique identifier for a source document.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(pub String);

impl DocumentId {
    /// Creates a new `DocumentId` from a string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for DocumentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of the organization that owns a document.
///
/// Retrieval is always scoped to a single organization.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrganizationId(pub String);

impl OrganizationId {
    /// Creates a new `OrganizationId` from a string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OrganizationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for OrganizationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for OrganizationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of a chunk: `{organization}/{document_id}#{index}`.
///
/// Stable across ingestion runs, so re-ingesting a document addresses the same records.
/// Two organizations using the same document id never share a chunk id.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(pub String);

impl ChunkId {
    /// Separates the organization from the document id; not allowed in organization ids.
    pub const SCOPE: char = '/';
    const SEPARATOR: char = '#';

    /// Builds the identifier of chunk `index` of `document` owned by `organization`.
    #[must_use]
    pub fn new(organization: &OrganizationId, document: &DocumentId, index: usize) -> Self {
        Self(format!(
            "{}{}{}{}{}",
            organization.0,
            Self::SCOPE,
            document.0,
            Self::SEPARATOR,
            index
        ))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits the identifier back into organization, document id and sequence index.
    ///
    /// Organization ids never contain `/`; document ids may.
    #[must_use]
    pub fn parts(&self) -> Option<(OrganizationId, DocumentId, usize)> {
        let (scoped, index) = self.0.rsplit_once(Self::SEPARATOR)?;
        let (organization, document) = scoped.split_once(Self::SCOPE)?;
        let index = index.parse().ok()?;
        Some((OrganizationId::new(organization), DocumentId::new(document), index))
    }
}

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ChunkId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ChunkId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lowercase hex SHA-256 of a chunk's text.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(pub String);

impl ContentHash {
    /// Hashes the given text.
    #[must_use]
    pub fn of(text: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Returns the hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pipeline stage, used to attribute failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Splitting a document into chunks.
    Chunking,
    /// Calling the embedding provider.
    Embedding,
    /// Reading or writing the vector store.
    Storage,
    /// Similarity search.
    Retrieval,
    /// Calling the completion provider.
    Completion,
}

impl Stage {
    /// Returns the lowercase stage name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chunking => "chunking",
            Self::Embedding => "embedding",
            Self::Storage => "storage",
            Self::Retrieval => "retrieval",
            Self::Completion => "completion",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
