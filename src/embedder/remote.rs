//! HTTP client for an OpenAI-compatible `/embeddings` endpoint.
//!
//! Providers do not agree on a response shape: some return the usual
//! `{ "data": [{ "embedding": [...] }] }` envelope, others a bare array.
//! Both are folded into one `Vec<f32>` here, so nothing past this module
//! ever sees the raw payload.
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Embedder, validate_text};
use crate::config::EmbeddingConfig;
use crate::db::vector_defect;
use crate::error::{Error, Result, ServiceError};

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawEntry {
    Item(EmbeddingItem),
    Component(f32),
}

/// Response bodies accepted from the embedding service.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EmbeddingPayload {
    Envelope { data: Vec<EmbeddingItem> },
    RawArray(Vec<RawEntry>),
}

impl EmbeddingPayload {
    /// Resolve either shape to the vector of the first (only) input.
    fn into_vector(self) -> std::result::Result<Vec<f32>, String> {
        match self {
            Self::Envelope { data } => data
                .into_iter()
                .next()
                .map(|item| item.embedding)
                .ok_or_else(|| "envelope contains no results".to_string()),
            Self::RawArray(entries) => {
                let mut entries = entries.into_iter();
                match entries.next() {
                    None => Err("response array is empty".to_string()),
                    Some(RawEntry::Item(item)) => Ok(item.embedding),
                    Some(RawEntry::Component(first)) => {
                        let mut vector = vec![first];
                        for entry in entries {
                            match entry {
                                RawEntry::Component(v) => vector.push(v),
                                RawEntry::Item(_) => {
                                    return Err(
                                        "response array mixes numbers and objects".to_string()
                                    );
                                }
                            }
                        }
                        Ok(vector)
                    }
                }
            }
        }
    }
}

/// Parse a response body into a canonical vector.
fn parse_embedding(body: &str) -> std::result::Result<Vec<f32>, ServiceError> {
    let payload: EmbeddingPayload = serde_json::from_str(body).map_err(|e| {
        ServiceError::malformed(format!("unrecognised embedding response: {e}"))
    })?;
    let vector = payload.into_vector().map_err(ServiceError::malformed)?;
    if vector.is_empty() {
        return Err(ServiceError::malformed("embedding vector is empty"));
    }
    if let Some(defect) = vector_defect(&vector) {
        return Err(ServiceError::malformed(format!("embedding vector {defect}")));
    }
    Ok(vector)
}

#[derive(Debug, Clone)]
pub struct RemoteEmbedder {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    dimensions: usize,
}

impl RemoteEmbedder {
    pub fn new(
        base_url: &str,
        model: impl Into<String>,
        dimensions: usize,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("askbase/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Embedding(ServiceError::from_transport(&e)))?;

        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
            model: model.into(),
            api_key,
            dimensions,
        })
    }

    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = config.api_key();
        if api_key.is_none() {
            warn!(
                "{} is not set; embedding requests will be sent without credentials",
                config.api_key_env
            );
        }
        Self::new(
            &config.base_url,
            config.model.clone(),
            config.dimensions,
            api_key,
            config.timeout(),
        )
    }

    async fn request(&self, text: &str) -> std::result::Result<Vec<f32>, ServiceError> {
        let mut req = self.client.post(&self.endpoint).json(&EmbedRequest {
            model: &self.model,
            input: text,
        });
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ServiceError::from_transport(&e))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| ServiceError::from_transport(&e))?;

        if !status.is_success() {
            return Err(ServiceError::from_status(status, &body));
        }

        let vector = parse_embedding(&body)?;
        if vector.len() != self.dimensions {
            return Err(ServiceError::malformed(format!(
                "model {} returned {} dimensions, expected {}",
                self.model,
                vector.len(),
                self.dimensions
            )));
        }
        Ok(vector)
    }
}

#[async_trait]
impl Embedder for RemoteEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        validate_text(text)?;

        let started = Instant::now();
        let result = self.request(text).await;
        debug!(
            "Embedding request to {} ({} chars) finished in {:?}",
            self.endpoint,
            text.len(),
            started.elapsed()
        );

        result.map_err(|e| {
            warn!("Embedding failed: {e}");
            Error::Embedding(e)
        })
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}
