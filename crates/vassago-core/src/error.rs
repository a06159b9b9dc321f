//! Error types for the Vassago knowledge pipeline.

use std::time::Duration;
use thiserror::Error;

use crate::types::{OrganizationId, Stage};

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the Vassago knowledge pipeline.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration provided by the caller.
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the configuration error.
        message: String,
    },

    /// Embedding length does not match the collection dimensionality.
    #[error("Dimension mismatch: collection expects {expected}, got {actual}")]
    DimensionMismatch {
        /// Dimensionality fixed by the collection.
        expected: usize,
        /// Dimensionality of the rejected embedding.
        actual: usize,
    },

    /// The vector database could not be reached.
    #[error("Vector store unavailable: {message}")]
    StoreUnavailable {
        /// Error message.
        message: String,
    },

    /// The vector database rejected the request.
    #[error("Vector store error: {message}")]
    Store {
        /// Error message.
        message: String,
    },

    /// Rate limited by the model provider.
    #[error("Rate limited by provider (retry after {retry_after:?})")]
    RateLimited {
        /// Provider-supplied delay, when one was sent.
        retry_after: Option<Duration>,
    },

    /// The model provider is temporarily unavailable.
    #[error("Provider unavailable: {message}")]
    ProviderUnavailable {
        /// Error message.
        message: String,
    },

    /// The model provider rejected the request.
    #[error("Provider error{}: {message}", status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Provider {
        /// HTTP status returned by the provider, if any.
        status: Option<u16>,
        /// Error message.
        message: String,
    },

    /// Similarity search found nothing above the score threshold.
    #[error("No relevant context for organization {organization} (min score {min_score})")]
    NoRelevantContext {
        /// Organization the search was scoped to.
        organization: OrganizationId,
        /// Minimum similarity score that was applied.
        min_score: f32,
    },

    /// The caller's deadline expired.
    #[error("Cancelled during {stage}")]
    Cancelled {
        /// Stage that was in flight.
        stage: Stage,
    },

    /// A failure attributed to a pipeline stage.
    #[error("{stage} failed: {source}")]
    Stage {
        /// The stage that failed.
        stage: Stage,
        /// The underlying error.
        #[source]
        source: Box<Error>,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error (unexpected state).
    #[error("Internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl Error {
    /// Returns `true` if the pipeline should retry the failed call.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::StoreUnavailable { .. }
            | Self::RateLimited { .. }
            | Self::ProviderUnavailable { .. } => true,
            Self::Stage { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Returns `true` if the deadline expired.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Self::Cancelled { .. })
    }

    /// Returns the provider-supplied retry delay, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self.root() {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Returns the stage this error is attributed to, if any.
    #[must_use]
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Stage { stage, .. } | Self::Cancelled { stage } => Some(*stage),
            _ => None,
        }
    }

    /// Returns the innermost error, looking through stage wrappers.
    #[must_use]
    pub fn root(&self) -> &Error {
        match self {
            Self::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    /// Attributes this error to a pipeline stage.
    ///
    /// Errors that already carry a stage, and `NoRelevantContext`, are returned unchanged.
    #[must_use]
    pub fn at_stage(self, stage: Stage) -> Self {
        match self {
            Self::Stage { .. } | Self::Cancelled { .. } | Self::NoRelevantContext { .. } => self,
            other => Self::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// Short machine-readable name for the error kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self.root() {
            Self::InvalidConfig { .. } => "invalid_config",
            Self::DimensionMismatch { .. } => "dimension_mismatch",
            Self::StoreUnavailable { .. } => "store_unavailable",
            Self::Store { .. } => "store_error",
            Self::RateLimited { .. } => "rate_limited",
            Self::ProviderUnavailable { .. } => "provider_unavailable",
            Self::Provider { .. } => "provider_error",
            Self::NoRelevantContext { .. } => "no_relevant_context",
            Self::Cancelled { .. } => "cancelled",
            Self::Io(_) => "io_error",
            Self::Serialization(_) => "serialization_error",
            Self::Internal { .. } | Self::Stage { .. } => "internal_error",
        }
    }

    /// Creates an invalid configuration error.
    #[must_use]
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Creates a store unavailable error.
    #[must_use]
    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
        }
    }

    /// Creates a permanent store error.
    #[must_use]
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Creates a non-retryable provider error.
    #[must_use]
    pub fn provider(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Provider {
            status,
            message: message.into(),
        }
    }

    /// Creates a retryable provider availability error.
    #[must_use]
    pub fn provider_unavailable(message: impl Into<String>) -> Self {
        Self::ProviderUnavailable {
            message: message.into(),
        }
    }

    /// Creates an internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(Error::store_unavailable("down").is_retryable());
        assert!(Error::RateLimited { retry_after: None }.is_retryable());
        assert!(Error::provider_unavailable("502").is_retryable());

        assert!(!Error::provider(Some(400), "bad request").is_retryable());
        assert!(!Error::invalid_config("overlap").is_retryable());
        assert!(!Error::DimensionMismatch {
            expected: 3,
            actual: 4
        }
        .is_retryable());
    }

    #[test]
    fn test_stage_wrapping() {
        let err = Error::RateLimited {
            retry_after: Some(Duration::from_secs(2)),
        }
        .at_stage(Stage::Embedding);

        assert_eq!(err.stage(), Some(Stage::Embedding));
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
        assert_eq!(err.kind(), "rate_limited");

        // Re-wrapping keeps the innermost attribution.
        let err = err.at_stage(Stage::Completion);
        assert_eq!(err.stage(), Some(Stage::Embedding));
    }

    #[test]
    fn test_no_relevant_context_is_not_wrapped() {
        let err = Error::NoRelevantContext {
            organization: OrganizationId::new("acme"),
            min_score: 0.3,
        }
        .at_stage(Stage::Retrieval);

        assert!(err.stage().is_none());
        assert_eq!(err.kind(), "no_relevant_context");
    }

    #[test]
    fn test_provider_display() {
        let err = Error::provider(Some(422), "malformed");
        assert_eq!(err.to_string(), "Provider error (422): malformed");
        let err = Error::provider(None, "empty body");
        assert_eq!(err.to_string(), "Provider error: empty body");
    }
}
