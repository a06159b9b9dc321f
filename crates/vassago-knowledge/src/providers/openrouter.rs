//! OpenRouter embeddings and chat completions.
//!
//! Failures are classified by HTTP status only: 429 is `RateLimited`, 5xx and
//! transport failures are `ProviderUnavailable`, anything else is a permanent
//! `Provider` error.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use vassago_core::{Error, Result};

use super::{error_body, retry_after};
use crate::embedding::{Embedder, Generator};

/// OpenRouter connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenRouterConfig {
    /// API base URL.
    pub base_url: String,
    /// API key.
    pub api_key: String,
    /// Embedding model.
    pub embedding_model: String,
    /// Completion model.
    pub completion_model: String,
    /// Embedding dimensionality, checked on every response when set.
    pub dimension: Option<usize>,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
    /// Completion token limit.
    pub max_tokens: Option<u32>,
    /// Completion temperature.
    pub temperature: f32,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            base_url: "https://openrouter.ai/api/v1".to_string(),
            api_key: String::new(),
            embedding_model: "openai/text-embedding-3-small".to_string(),
            completion_model: "openai/gpt-4o-mini".to_string(),
            dimension: Some(1536),
            timeout_secs: 60,
            max_tokens: Some(1024),
            temperature: 0.2,
        }
    }
}

/// Client for the OpenRouter API.
#[derive(Clone)]
pub struct OpenRouterClient {
    client: Client,
    config: OpenRouterConfig,
    embeddings_url: String,
    completions_url: String,
}

impl OpenRouterClient {
    /// Builds a client.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the API key or a model name is missing.
    pub fn new(config: OpenRouterConfig) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(Error::invalid_config("missing OpenRouter API key"));
        }
        if config.embedding_model.trim().is_empty() || config.completion_model.trim().is_empty() {
            return Err(Error::invalid_config("missing OpenRouter model name"));
        }

        let mut headers = HeaderMap::new();
        let auth = format!("Bearer {}", config.api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth)
                .map_err(|_| Error::invalid_config("invalid OpenRouter API key"))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("X-Title", HeaderValue::from_static("vassago"));

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::internal(format!("failed to build HTTP client: {e}")))?;

        let base = config.base_url.trim_end_matches('/');
        Ok(Self {
            embeddings_url: format!("{base}/embeddings"),
            completions_url: format!("{base}/chat/completions"),
            client,
            config,
        })
    }

    /// Returns the client configuration.
    #[must_use]
    pub fn config(&self) -> &OpenRouterConfig {
        &self.config
    }

    async fn post<B: Serialize, R: DeserializeOwned>(&self, url: &str, body: &B) -> Result<R> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after(response.headers());
            let body = error_body(response).await;
            return Err(classify(status, retry_after, body));
        }

        response
            .json()
            .await
            .map_err(|e| Error::provider(Some(status.as_u16()), format!("malformed response: {e}")))
    }
}

/// Maps a non-success status to the error taxonomy.
fn classify(status: StatusCode, retry_after: Option<Duration>, body: String) -> Error {
    if status == StatusCode::TOO_MANY_REQUESTS {
        Error::RateLimited { retry_after }
    } else if status.is_server_error() {
        Error::provider_unavailable(format!("{status}: {body}"))
    } else {
        Error::provider(Some(status.as_u16()), body)
    }
}

fn transport_error(err: reqwest::Error) -> Error {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        Error::provider_unavailable(err.to_string())
    } else {
        Error::provider(None, err.to_string())
    }
}

#[async_trait]
impl Embedder for OpenRouterClient {
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = EmbeddingRequest {
            model: &self.config.embedding_model,
            input: texts,
        };
        let mut parsed: EmbeddingResponse = self.post(&self.embeddings_url, &request).await?;
        parsed.data.sort_by_key(|entry| entry.index);

        if parsed.data.len() != texts.len() {
            return Err(Error::provider(
                None,
                format!(
                    "returned {} embeddings for {} inputs",
                    parsed.data.len(),
                    texts.len()
                ),
            ));
        }

        let embeddings: Vec<Vec<f32>> = parsed.data.into_iter().map(|e| e.embedding).collect();
        if let Some(expected) = self.config.dimension {
            if let Some(bad) = embeddings.iter().find(|e| e.len() != expected) {
                return Err(Error::DimensionMismatch {
                    expected,
                    actual: bad.len(),
                });
            }
        }

        tracing::debug!(
            model = %self.config.embedding_model,
            inputs = texts.len(),
            "Embedded batch"
        );
        Ok(embeddings)
    }

    fn dimension(&self) -> Option<usize> {
        self.config.dimension
    }

    fn model_name(&self) -> &str {
        &self.config.embedding_model
    }
}

#[async_trait]
impl Generator for OpenRouterClient {
    async fn complete(&self, prompt: &str, context: &[String]) -> Result<String> {
        let context_block = context
            .iter()
            .enumerate()
            .map(|(i, passage)| format!("[{}] {}", i + 1, passage))
            .collect::<Vec<_>>()
            .join("\n\n");
        let system = format!("Context:\n{context_block}");

        let request = ChatRequest {
            model: &self.config.completion_model,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &system,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
        };

        let parsed: ChatResponse = self.post(&self.completions_url, &request).await?;
        let answer = parsed
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| Error::provider(None, "completion returned no content"))?;

        tracing::debug!(
            model = %self.config.completion_model,
            passages = context.len(),
            "Completed prompt"
        );
        Ok(answer)
    }

    fn model_name(&self) -> &str {
        &self.config.completion_model
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use axum::http::{header, StatusCode as AxumStatus};
    use axum::response::IntoResponse;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    use super::*;
    use crate::providers::stub;

    fn config(base_url: String) -> OpenRouterConfig {
        OpenRouterConfig {
            base_url,
            api_key: "test-key".to_string(),
            dimension: Some(2),
            timeout_secs: 5,
            ..OpenRouterConfig::default()
        }
    }

    async fn client_for(router: Router) -> OpenRouterClient {
        OpenRouterClient::new(config(stub::serve(router).await)).unwrap()
    }

    #[test]
    fn test_requires_api_key() {
        let err = OpenRouterClient::new(OpenRouterConfig::default()).err().unwrap();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }

    #[tokio::test]
    async fn test_embeddings_are_returned_in_input_order() {
        let router = Router::new().route(
            "/embeddings",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["input"], json!(["first", "second"]));
                Json(json!({
                    "data": [
                        { "index": 1, "embedding": [0.0, 1.0] },
                        { "index": 0, "embedding": [1.0, 0.0] }
                    ]
                }))
            }),
        );
        let client = client_for(router).await;

        let embeddings = client.embed(&["first", "second"]).await.unwrap();
        assert_eq!(embeddings, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[tokio::test]
    async fn test_dimension_is_checked() {
        let router = Router::new().route(
            "/embeddings",
            post(|| async { Json(json!({ "data": [{ "index": 0, "embedding": [1.0, 0.0, 0.0] }] })) }),
        );
        let client = client_for(router).await;

        let err = client.embed_single("text").await.unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { expected: 2, actual: 3 }));
    }

    #[tokio::test]
    async fn test_rate_limit_carries_retry_after() {
        let router = Router::new().route(
            "/embeddings",
            post(|| async {
                (
                    AxumStatus::TOO_MANY_REQUESTS,
                    [(header::RETRY_AFTER, "3")],
                    "slow down, server error imminent",
                )
                    .into_response()
            }),
        );
        let client = client_for(router).await;

        let err = client.embed_single("text").await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
    }

    #[tokio::test]
    async fn test_status_classification() {
        let router = Router::new()
            .route(
                "/embeddings",
                post(|| async { (AxumStatus::SERVICE_UNAVAILABLE, "upstream busy") }),
            )
            .route(
                "/chat/completions",
                post(|| async { (AxumStatus::UNAUTHORIZED, "rate limited: invalid key") }),
            );
        let client = client_for(router).await;

        let err = client.embed_single("text").await.unwrap_err();
        assert!(matches!(err, Error::ProviderUnavailable { .. }));
        assert!(err.is_retryable());

        // The body mentions rate limiting; only the status decides.
        let err = client.complete("q", &[]).await.unwrap_err();
        assert!(matches!(err, Error::Provider { status: Some(401), .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_connection_failure_is_retryable() {
        let client = OpenRouterClient::new(config(stub::dead_url().await)).unwrap();
        let err = client.embed_single("text").await.unwrap_err();
        assert!(matches!(err, Error::ProviderUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_completion_sends_context() {
        let router = Router::new().route(
            "/chat/completions",
            post(|Json(body): Json<Value>| async move {
                let system = body["messages"][0]["content"].as_str().unwrap_or_default();
                assert!(system.contains("[1] Refunds take 30 days."));
                assert_eq!(body["messages"][1]["content"], "How long do refunds take?");
                Json(json!({
                    "choices": [{ "message": { "role": "assistant", "content": "30 days." } }]
                }))
            }),
        );
        let client = client_for(router).await;

        let answer = client
            .complete(
                "How long do refunds take?",
                &["Refunds take 30 days.".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(answer, "30 days.");
    }

    #[tokio::test]
    async fn test_malformed_body_is_permanent() {
        let router = Router::new().route(
            "/chat/completions",
            post(|| async { Json(json!({ "unexpected": true })) }),
        );
        let client = client_for(router).await;

        let err = client.complete("q", &[]).await.unwrap_err();
        assert!(matches!(err, Error::Provider { .. }));
        assert!(!err.is_retryable());
    }
}
