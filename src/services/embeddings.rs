use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur when requesting an embedding
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("HTTP request failed: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("Embedding API returned error: {0}")]
    ApiError(String),

    #[error("Invalid response format: {0}")]
    InvalidResponse(String),
}

/// Black-box text → vector function
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Identifier logged with computed embeddings
    fn model_name(&self) -> &str;
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    input: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

/// Embedding service reached over HTTP
///
/// Posts `{"input": "..."}` to the configured endpoint and expects
/// `{"embedding": [...]}` back.
pub struct HttpEmbeddingProvider {
    endpoint: String,
    api_key: Option<String>,
    model: Option<String>,
    client: reqwest::Client,
}

impl HttpEmbeddingProvider {
    /// Create a new provider client
    pub fn new(
        endpoint: String,
        api_key: Option<String>,
        model: Option<String>,
        timeout: Duration,
    ) -> Result<Self, EmbeddingError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            endpoint,
            api_key,
            model,
            client,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let body = EmbedRequest {
            input: text,
            model: self.model.as_deref(),
        };

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(EmbeddingError::ApiError(format!(
                "Failed to embed text: {}",
                response.status()
            )));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;

        if parsed.embedding.is_empty() {
            return Err(EmbeddingError::InvalidResponse("empty embedding".into()));
        }
        if parsed.embedding.iter().any(|v| !v.is_finite()) {
            return Err(EmbeddingError::InvalidResponse("non-finite component".into()));
        }

        Ok(parsed.embedding)
    }

    fn model_name(&self) -> &str {
        self.model.as_deref().unwrap_or("default")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn provider(url: String) -> HttpEmbeddingProvider {
        HttpEmbeddingProvider::new(url, Some("secret".into()), None, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_embed_posts_input_and_parses_vector() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/embed")
            .match_header("authorization", "Bearer secret")
            .match_body(Matcher::Json(serde_json::json!({"input": "joe s pizza"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"embedding": [0.25, -0.5, 1.0]}"#)
            .create_async()
            .await;

        let embedding = provider(format!("{}/embed", server.url()))
            .embed("joe s pizza")
            .await
            .unwrap();

        assert_eq!(embedding, vec![0.25, -0.5, 1.0]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_embed_surfaces_api_errors() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/embed")
            .with_status(503)
            .create_async()
            .await;

        let result = provider(format!("{}/embed", server.url())).embed("text").await;
        assert!(matches!(result, Err(EmbeddingError::ApiError(_))));
    }

    #[tokio::test]
    async fn test_embed_rejects_empty_vector() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/embed")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"embedding": []}"#)
            .create_async()
            .await;

        let result = provider(format!("{}/embed", server.url())).embed("text").await;
        assert!(matches!(result, Err(EmbeddingError::InvalidResponse(_))));
    }
}
