//! HTTP-backed implementations of the knowledge traits.
//!
//! - [`OpenRouterClient`]: embeddings and chat completions over the
//!   OpenAI-compatible OpenRouter API
//! - [`ChromaStore`]: vector storage in a Chroma collection

pub mod chroma;
pub mod openrouter;

use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};

pub use chroma::{ChromaConfig, ChromaStore};
pub use openrouter::{OpenRouterClient, OpenRouterConfig};

/// Longest error body carried into an error message.
const MAX_ERROR_BODY: usize = 512;

/// Reads a `Retry-After` header given in seconds.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    let seconds: f64 = value.parse().ok()?;
    (seconds.is_finite() && seconds >= 0.0).then(|| Duration::from_secs_f64(seconds))
}

/// Reads an error body, cut to a loggable length.
async fn error_body(response: reqwest::Response) -> String {
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<body unavailable>".to_string());
    if body.chars().count() > MAX_ERROR_BODY {
        let cut: String = body.chars().take(MAX_ERROR_BODY).collect();
        format!("{cut}...")
    } else {
        body
    }
}


#[cfg(test)]
mod tests {
    use reqwest::header::HeaderValue;

    use super::*;

    #[test]
    fn test_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("3"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(3)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("0.5"));
        assert_eq!(retry_after(&headers), Some(Duration::from_millis(500)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(retry_after(&headers), None);
    }
}
