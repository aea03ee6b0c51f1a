//! HTTP embedding client for Titan-style text embedding endpoints.
//!
//! Sends `{"inputText": "..."}` and expects `{"embedding": [...]}` back.

use async_trait::async_trait;
use intentvote_core::{EmbeddingProvider, ProviderError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status}: {body}")]
    Server { status: u16, body: String },
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("embedding is empty")]
    Empty,
    #[error("embedding has {got} dimensions, expected {expected}")]
    Dimension { expected: usize, got: usize },
    #[error("embedding contains a non-finite value at index {0}")]
    NonFinite(usize),
}

impl From<EmbedError> for ProviderError {
    fn from(e: EmbedError) -> Self {
        match e {
            EmbedError::Http(e) if e.is_decode() => Self::Malformed(e.to_string()),
            EmbedError::Http(e) => Self::Unreachable(e.to_string()),
            EmbedError::Server { status, body } => Self::Server { status, body },
            other => Self::Malformed(other.to_string()),
        }
    }
}

/// HTTP embedding client.
pub struct HttpEmbedder {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
    dimensions: Option<usize>,
    normalize: Option<bool>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EmbedRequest<'a> {
    input_text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    normalize: Option<bool>,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    /// Create a client for the given embedding endpoint URL.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), endpoint)
    }

    /// Use a preconfigured `reqwest::Client` (timeouts, proxies).
    pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token: None,
            dimensions: None,
            normalize: None,
        }
    }

    /// Send `Authorization: Bearer <token>` with every request.
    pub fn bearer_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Request, and require, embeddings of exactly `dimensions` values.
    pub fn dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = Some(dimensions);
        self
    }

    /// Ask the service to L2-normalize the embedding.
    pub fn normalize(mut self, normalize: bool) -> Self {
        self.normalize = Some(normalize);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Fetch the embedding for `text`.
    pub async fn fetch(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let request = EmbedRequest {
            input_text: text,
            dimensions: self.dimensions,
            normalize: self.normalize,
        };

        debug!(url = %self.endpoint, chars = text.len(), "requesting embedding");
        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let resp = builder.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(EmbedError::Server {
                status: status.as_u16(),
                body,
            });
        }

        let body = resp.bytes().await?;
        let parsed: EmbedResponse = serde_json::from_slice(&body)?;
        self.check(parsed.embedding)
    }

    fn check(&self, embedding: Vec<f32>) -> Result<Vec<f32>, EmbedError> {
        if embedding.is_empty() {
            return Err(EmbedError::Empty);
        }
        if let Some(expected) = self.dimensions
            && embedding.len() != expected
        {
            return Err(EmbedError::Dimension {
                expected,
                got: embedding.len(),
            });
        }
        if let Some(idx) = embedding.iter().position(|v| !v.is_finite()) {
            return Err(EmbedError::NonFinite(idx));
        }
        Ok(embedding)
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        Ok(self.fetch(text).await?)
    }
}
