//! Documents and the chunks cut from them.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ChunkId, ContentHash, DocumentId, OrganizationId};

/// Metadata attached to a document by its producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Owning organization.
    pub organization: OrganizationId,
    /// When the document was first produced.
    pub created_at: DateTime<Utc>,
    /// When the document was last changed.
    pub updated_at: DateTime<Utc>,
    /// Free-form producer attributes (title, source, author...).
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
}

impl DocumentMetadata {
    /// Creates metadata for a document owned by `organization`, timestamped now.
    #[must_use]
    pub fn new(organization: impl Into<OrganizationId>) -> Self {
        let now = Utc::now();
        Self {
            organization: organization.into(),
            created_at: now,
            updated_at: now,
            attributes: HashMap::new(),
        }
    }
}

/// An external content unit, such as a generated article.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Document identifier.
    pub id: DocumentId,
    /// Source text.
    pub text: String,
    /// Producer metadata.
    pub metadata: DocumentMetadata,
}

impl Document {
    /// Creates a new document.
    #[must_use]
    pub fn new(
        id: impl Into<DocumentId>,
        organization: impl Into<OrganizationId>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            metadata: DocumentMetadata::new(organization),
        }
    }

    /// Adds a producer attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.attributes.insert(key.into(), value);
        self
    }

    /// Returns the owning organization.
    #[must_use]
    pub fn organization(&self) -> &OrganizationId {
        &self.metadata.organization
    }
}

/// A contiguous segment of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Organization owning the parent document.
    pub organization: OrganizationId,
    /// Parent document.
    pub document_id: DocumentId,
    /// Sequence index within the document.
    pub index: usize,
    /// The chunk text.
    pub text: String,
    /// Start byte offset in the document text.
    pub start: usize,
    /// End byte offset (exclusive) in the document text.
    pub end: usize,
    /// Hash of `text`.
    pub hash: ContentHash,
}

impl Chunk {
    /// Creates a chunk covering `document.text[start..end]`.
    ///
    /// # Panics
    ///
    /// Panics if the offsets are out of range or not on character boundaries.
    #[must_use]
    pub fn new(document: &Document, index: usize, start: usize, end: usize) -> Self {
        let text = document.text[start..end].to_string();
        let hash = ContentHash::of(&text);
        Self {
            organization: document.organization().clone(),
            document_id: document.id.clone(),
            index,
            text,
            start,
            end,
            hash,
        }
    }

    /// Returns the chunk identifier.
    #[must_use]
    pub fn id(&self) -> ChunkId {
        ChunkId::new(&self.organization, &self.document_id, self.index)
    }

    /// Length of the chunk in characters.
    #[must_use]
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_from_document() {
        let doc = Document::new("doc-1", "acme", "Hello, wörld. Bye.");
        let chunk = Chunk::new(&doc, 0, 7, 14);

        assert_eq!(chunk.text, "wörld.");
        assert_eq!(chunk.char_len(), 6);
        assert_eq!(chunk.id().as_str(), "acme/doc-1#0");
        assert_eq!(chunk.hash, ContentHash::of("wörld."));
    }

    #[test]
    fn test_document_serde() {
        let doc = Document::new("doc-1", "acme", "body")
            .with_attribute("title", serde_json::json!("Launch notes"));
        let json = serde_json::to_string(&doc).unwrap();
        let back: Document = serde_json::from_str(&json).unwrap();

        assert_eq!(back.id, doc.id);
        assert_eq!(back.organization().as_str(), "acme");
        assert_eq!(back.metadata.attributes["title"], "Launch notes");
    }
}
