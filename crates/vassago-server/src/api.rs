//! Request and response types for the HTTP API.

use std::collections::HashMap;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use vassago_core::{Document, Error, Stage};
use vassago_telemetry::MetricsSnapshot;

// === Documents ===

/// Document ingestion request.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestRequest {
    /// Document identifier.
    pub id: String,
    /// Owning organization.
    pub organization: String,
    /// Document text.
    pub text: String,
    /// Producer attributes (title, source...).
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
}

impl IngestRequest {
    /// Converts the request into a document.
    #[must_use]
    pub fn into_document(self) -> Document {
        let mut document = Document::new(self.id, self.organization, self.text);
        document.metadata.attributes = self.attributes;
        document
    }
}

/// Document deletion result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteResponse {
    /// Number of chunks removed.
    pub deleted: usize,
}

// === Answers ===

/// Question answering request.
#[derive(Debug, Clone, Deserialize)]
pub struct AnswerRequest {
    /// The question.
    pub query: String,
    /// Organization whose documents may be used.
    pub organization: String,
    /// Number of chunks to retrieve.
    #[serde(default)]
    pub top_k: Option<usize>,
}

// === Status ===

/// Server status.
#[derive(Debug, Serialize, Deserialize)]
pub struct ServerStatus {
    /// Always `"running"`.
    pub status: String,
    /// Seconds since start.
    pub uptime_seconds: u64,
    /// Stored chunk count, absent when the store is unreachable.
    pub records: Option<usize>,
    /// Embedding model in use.
    pub embedding_model: String,
    /// Pipeline counters.
    pub metrics: MetricsSnapshot,
}

// === Errors ===

/// Error envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error details.
    pub error: ErrorDetail,
}

/// Error details.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Human-readable message.
    pub message: String,
    /// Error category.
    #[serde(rename = "type")]
    pub error_type: String,
    /// Machine-readable error kind.
    pub code: Option<String>,
    /// Pipeline stage that failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
}

impl ErrorResponse {
    /// Creates an error envelope.
    pub fn new(message: impl Into<String>, error_type: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                message: message.into(),
                error_type: error_type.into(),
                code: None,
                stage: None,
            },
        }
    }

    /// Sets the error code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.error.code = Some(code.into());
        self
    }

    /// Sets the failing stage.
    #[must_use]
    pub fn with_stage(mut self, stage: Option<Stage>) -> Self {
        self.error.stage = stage;
        self
    }
}

/// A pipeline error rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl ApiError {
    /// HTTP status and error category for the wrapped error.
    #[must_use]
    pub fn status(&self) -> (StatusCode, &'static str) {
        match self.0.root() {
            Error::InvalidConfig { .. } => (StatusCode::BAD_REQUEST, "invalid_request_error"),
            Error::NoRelevantContext { .. } => (StatusCode::NOT_FOUND, "not_found_error"),
            Error::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, "rate_limit_error"),
            Error::StoreUnavailable { .. } | Error::ProviderUnavailable { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "upstream_unavailable")
            }
            Error::Provider { .. } | Error::Store { .. } => {
                (StatusCode::BAD_GATEWAY, "upstream_error")
            }
            Error::Cancelled { .. } => (StatusCode::GATEWAY_TIMEOUT, "timeout_error"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "server_error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, stage = ?self.0.stage(), "Request failed");
        }

        let body = ErrorResponse::new(self.0.to_string(), error_type)
            .with_code(self.0.kind())
            .with_stage(self.0.stage());
        let mut response = (status, Json(body)).into_response();

        if let Some(delay) = self.0.retry_after() {
            let seconds = delay.as_secs_f64().ceil() as u64;
            if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use vassago_core::OrganizationId;

    use super::*;

    #[test]
    fn test_ingest_request_deserialization() {
        let json = r#"{
            "id": "launch-notes",
            "organization": "acme",
            "text": "We shipped it.",
            "attributes": {"title": "Launch"}
        }"#;

        let req: IngestRequest = serde_json::from_str(json).unwrap();
        let document = req.into_document();
        assert_eq!(document.id.as_str(), "launch-notes");
        assert_eq!(document.organization().as_str(), "acme");
        assert_eq!(document.metadata.attributes["title"], "Launch");
    }

    #[test]
    fn test_answer_request_defaults() {
        let req: AnswerRequest =
            serde_json::from_str(r#"{"query": "why?", "organization": "acme"}"#).unwrap();
        assert_eq!(req.top_k, None);
    }

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (Error::invalid_config("bad"), StatusCode::BAD_REQUEST),
            (
                Error::NoRelevantContext {
                    organization: OrganizationId::new("acme"),
                    min_score: 0.3,
                },
                StatusCode::NOT_FOUND,
            ),
            (
                Error::RateLimited { retry_after: None }.at_stage(Stage::Embedding),
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (Error::store_unavailable("down"), StatusCode::SERVICE_UNAVAILABLE),
            (Error::provider(Some(400), "no"), StatusCode::BAD_GATEWAY),
            (
                Error::Cancelled {
                    stage: Stage::Completion,
                },
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (Error::internal("oops"), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, expected) in cases {
            assert_eq!(ApiError(err).status().0, expected);
        }
    }

    #[test]
    fn test_rate_limit_response_sets_retry_after() {
        let err = Error::RateLimited {
            retry_after: Some(Duration::from_millis(1500)),
        }
        .at_stage(Stage::Completion);
        let response = ApiError(err).into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "2");
    }

    #[test]
    fn test_error_envelope() {
        let err = ErrorResponse::new("Test error", "test_error")
            .with_code("TEST_CODE")
            .with_stage(Some(Stage::Retrieval));
        let json = serde_json::to_value(&err).unwrap();

        assert_eq!(json["error"]["message"], "Test error");
        assert_eq!(json["error"]["type"], "test_error");
        assert_eq!(json["error"]["code"], "TEST_CODE");
        assert_eq!(json["error"]["stage"], "retrieval");
    }
}
