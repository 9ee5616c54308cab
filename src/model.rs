//! Model runtime ports and the default HTTP adapter.
//!
//! The core consumes three capabilities from a model runtime: embedding,
//! cross-encoder reranking, and text generation. Each is an object-safe
//! async trait so hosts can plug in local inference, a remote service, or
//! test doubles.
//!
//! [`HttpModelClient`] is the built-in adapter for an OpenAI-compatible
//! endpoint. Transient failures (HTTP 429, 5xx, network errors) retry with
//! exponential backoff — 1s, 2s, 4s, … capped at 32s; other client errors
//! fail immediately.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::config::ModelConfig;
use crate::error::{Error, ErrorKind, Result};

/// Produces dense vectors for chunks and queries.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Identifier recorded alongside stored vectors, e.g.
    /// `hf:nomic-ai/nomic-embed-text-v1.5`.
    fn model_uri(&self) -> &str;
    fn dimensions(&self) -> usize;
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Cross-encoder scoring of `(query, candidate)` pairs, one score in
/// `[0, 1]` per candidate, in input order.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, query: &str, candidates: &[String]) -> Result<Vec<f32>>;
}

/// Prompt-in, text-out generation (used by the query expander).
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// L2-normalize in place; zero vectors are left untouched.
pub fn normalize_unit(vec: &mut [f32]) {
    let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vec.iter_mut() {
            *v /= norm;
        }
    }
}

/// Adapter for an OpenAI-compatible HTTP endpoint.
#[derive(Debug)]
pub struct HttpModelClient {
    endpoint: String,
    api_key: Option<String>,
    embed_model: String,
    dimensions: usize,
    rerank_model: Option<String>,
    generate_model: Option<String>,
    max_retries: u32,
    client: reqwest::Client,
}

impl HttpModelClient {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let embed_model = config
            .embed_model
            .clone()
            .ok_or_else(|| Error::validation("model.embed_model is required"))?;
        let dimensions = config
            .embed_dimensions
            .ok_or_else(|| Error::validation("model.embed_dimensions is required"))?;
        let api_key = match &config.api_key_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                Error::validation(format!("environment variable {} not set", var))
            })?),
            None => None,
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(Error::from)?;
        Ok(Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key,
            embed_model,
            dimensions,
            rerank_model: config.rerank_model.clone(),
            generate_model: config.generate_model.clone(),
            max_retries: config.max_retries,
            client,
        })
    }

    async fn post_json(&self, path: &str, body: &serde_json::Value) -> Result<serde_json::Value> {
        let url = format!("{}{}", self.endpoint, path);
        let mut last_err: Option<Error> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let mut req = self.client.post(&url).json(body);
            if let Some(key) = &self.api_key {
                req = req.bearer_auth(key);
            }

            match req.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response.json().await.map_err(Error::from)?);
                    }
                    let text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(Error::new(
                            ErrorKind::AdapterFailure,
                            format!("{} returned {}: {}", url, status, text),
                        ));
                        continue;
                    }
                    return Err(Error::new(
                        ErrorKind::AdapterFailure,
                        format!("{} returned {}: {}", url, status, text),
                    )
                    .with_retryable(false));
                }
                Err(e) => {
                    last_err = Some(Error::from(e));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| Error::new(ErrorKind::AdapterFailure, "request failed")))
    }

    fn parse_embeddings(&self, json: &serde_json::Value, expected: usize) -> Result<Vec<Vec<f32>>> {
        let data = json
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| {
                Error::new(ErrorKind::AdapterFailure, "embeddings response missing data array")
            })?;
        let mut out = Vec::with_capacity(data.len());
        for item in data {
            let raw = item
                .get("embedding")
                .and_then(|e| e.as_array())
                .ok_or_else(|| {
                    Error::new(ErrorKind::AdapterFailure, "embeddings item missing vector")
                })?;
            let vec: Vec<f32> = raw
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect();
            if vec.len() != self.dimensions {
                return Err(Error::new(
                    ErrorKind::AdapterFailure,
                    format!(
                        "embedding has {} dimensions, expected {}",
                        vec.len(),
                        self.dimensions
                    ),
                ));
            }
            out.push(vec);
        }
        if out.len() != expected {
            return Err(Error::new(
                ErrorKind::AdapterFailure,
                format!("embeddings response has {} vectors, expected {}", out.len(), expected),
            ));
        }
        Ok(out)
    }
}

#[async_trait]
impl Embedder for HttpModelClient {
    fn model_uri(&self) -> &str {
        &self.embed_model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| Error::new(ErrorKind::AdapterFailure, "empty embeddings response"))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = json!({ "model": self.embed_model, "input": texts });
        let response = self.post_json("/embeddings", &body).await?;
        self.parse_embeddings(&response, texts.len())
    }
}

#[async_trait]
impl Reranker for HttpModelClient {
    async fn rerank(&self, query: &str, candidates: &[String]) -> Result<Vec<f32>> {
        let model = self
            .rerank_model
            .as_ref()
            .ok_or_else(|| Error::validation("model.rerank_model is not configured"))?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let body = json!({ "model": model, "query": query, "documents": candidates });
        let response = self.post_json("/rerank", &body).await?;
        let results = response
            .get("results")
            .and_then(|r| r.as_array())
            .ok_or_else(|| {
                Error::new(ErrorKind::AdapterFailure, "rerank response missing results")
            })?;
        let mut scores = vec![0.0f32; candidates.len()];
        for item in results {
            let index = item.get("index").and_then(|i| i.as_u64()).ok_or_else(|| {
                Error::new(ErrorKind::AdapterFailure, "rerank result missing index")
            })? as usize;
            let score = item
                .get("relevance_score")
                .and_then(|s| s.as_f64())
                .ok_or_else(|| {
                    Error::new(ErrorKind::AdapterFailure, "rerank result missing score")
                })?;
            if index >= scores.len() {
                return Err(Error::new(
                    ErrorKind::AdapterFailure,
                    format!("rerank index {} out of range", index),
                ));
            }
            scores[index] = score.clamp(0.0, 1.0) as f32;
        }
        Ok(scores)
    }
}

#[async_trait]
impl Generator for HttpModelClient {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let model = self
            .generate_model
            .as_ref()
            .ok_or_else(|| Error::validation("model.generate_model is not configured"))?;
        let body = json!({
            "model": model,
            "messages": [{ "role": "user", "content": prompt }],
        });
        let response = self.post_json("/chat/completions", &body).await?;
        response
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|t| t.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                Error::new(ErrorKind::AdapterFailure, "completion response missing content")
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_unit_vector() {
        let mut v = vec![3.0, 4.0];
        normalize_unit(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn normalize_zero_vector_is_noop() {
        let mut v = vec![0.0, 0.0, 0.0];
        normalize_unit(&mut v);
        assert_eq!(v, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn client_requires_embed_settings() {
        let config = ModelConfig::default();
        let err = HttpModelClient::new(&config).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[test]
    fn parse_embeddings_checks_dimensions_and_count() {
        let config = ModelConfig {
            embed_model: Some("test-embed".into()),
            embed_dimensions: Some(2),
            ..Default::default()
        };
        let client = HttpModelClient::new(&config).unwrap();

        let good = json!({ "data": [
            { "embedding": [0.1, 0.2] },
            { "embedding": [0.3, 0.4] },
        ]});
        let vecs = client.parse_embeddings(&good, 2).unwrap();
        assert_eq!(vecs.len(), 2);

        let wrong_dim = json!({ "data": [{ "embedding": [0.1, 0.2, 0.3] }] });
        assert!(client.parse_embeddings(&wrong_dim, 1).is_err());

        let wrong_count = json!({ "data": [{ "embedding": [0.1, 0.2] }] });
        assert!(client.parse_embeddings(&wrong_count, 2).is_err());
    }
}
