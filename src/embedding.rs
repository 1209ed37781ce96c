//! Embedding generators.
//!
//! One [`EmbeddingGenerator`] type backs three registry entries:
//!
//! | Name | Backend |
//! |------|---------|
//! | `openai` | `POST https://api.openai.com/v1/embeddings` (key from `OPENAI_API_KEY`) |
//! | `ollama` | `POST {url}/api/embed` on a local Ollama instance |
//! | `hash` | Offline, deterministic SHA-256 seeded unit vectors |
//!
//! Each generator fills `data.vectors` on RECORD envelopes and passes every
//! other envelope through in position. Batches are split into requests of
//! at most `batch_size` texts.
//!
//! # Retry Strategy
//!
//! The HTTP backends retry with exponential backoff:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::time::Duration;

use dat_core::connector::{Checkable, Connector};
use dat_core::generator::Generator;
use dat_core::protocol::{ConnectorSpecification, DatMessage, MessageType};

const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";
const OPENAI_URL: &str = "https://api.openai.com/v1/embeddings";

/// Which backend computes the vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAI,
    Ollama,
    Hash,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAI => "openai",
            Provider::Ollama => "ollama",
            Provider::Hash => "hash",
        }
    }
}

/// `connectionSpecification` shared by the embedding generators.
#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingSettings {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL (Ollama only).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingSettings {
    pub fn from_config(config: &ConnectorSpecification) -> Result<Self> {
        let value = match &config.connection_specification {
            Value::Null => json!({}),
            other => other.clone(),
        };
        let settings: Self = serde_json::from_value(value)
            .with_context(|| format!("Invalid {} connectionSpecification", config.name))?;
        if settings.batch_size == 0 {
            bail!("{}.batch_size must be > 0", config.name);
        }
        Ok(settings)
    }

    fn require_model(&self, provider: Provider) -> Result<&str> {
        self.model
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("model required for {} generator", provider.as_str()))
    }

    fn hash_dims(&self) -> Result<usize> {
        match self.dims.unwrap_or(64) {
            0 => bail!("hash.dims must be > 0"),
            n => Ok(n),
        }
    }
}

/// A generator that embeds each record's `document_chunk`.
#[derive(Debug, Clone)]
pub struct EmbeddingGenerator {
    provider: Provider,
}

impl EmbeddingGenerator {
    pub fn new(provider: Provider) -> Self {
        Self { provider }
    }

    pub fn openai() -> Self {
        Self::new(Provider::OpenAI)
    }

    pub fn ollama() -> Self {
        Self::new(Provider::Ollama)
    }

    pub fn hash() -> Self {
        Self::new(Provider::Hash)
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }
}

impl Connector for EmbeddingGenerator {
    fn name(&self) -> &str {
        self.provider.as_str()
    }

    fn spec(&self) -> ConnectorSpecification {
        let mut properties = json!({
            "batch_size": {"type": "integer", "minimum": 1, "default": default_batch_size()},
        });
        let required: Vec<&str> = match self.provider {
            Provider::Hash => {
                properties["dims"] = json!({"type": "integer", "minimum": 1, "default": 64});
                vec![]
            }
            Provider::OpenAI | Provider::Ollama => {
                properties["model"] = json!({"type": "string"});
                properties["max_retries"] =
                    json!({"type": "integer", "default": default_max_retries()});
                properties["timeout_secs"] =
                    json!({"type": "integer", "default": default_timeout_secs()});
                if self.provider == Provider::Ollama {
                    properties["url"] = json!({"type": "string", "default": OLLAMA_DEFAULT_URL});
                }
                vec!["model"]
            }
        };
        ConnectorSpecification::new(
            self.provider.as_str(),
            json!({"type": "object", "required": required, "properties": properties}),
        )
    }
}

#[async_trait]
impl Checkable for EmbeddingGenerator {
    async fn check_connection(
        &self,
        config: &ConnectorSpecification,
    ) -> Result<(bool, Option<String>)> {
        let settings = EmbeddingSettings::from_config(config)?;
        match self.provider {
            Provider::Hash => {
                settings.hash_dims()?;
                Ok((true, None))
            }
            Provider::OpenAI => {
                settings.require_model(self.provider)?;
                if std::env::var("OPENAI_API_KEY").is_err() {
                    return Ok((false, Some("OPENAI_API_KEY environment variable not set".into())));
                }
                Ok((true, None))
            }
            Provider::Ollama => {
                settings.require_model(self.provider)?;
                let url = settings.url.as_deref().unwrap_or(OLLAMA_DEFAULT_URL);
                let client = reqwest::Client::builder()
                    .timeout(Duration::from_secs(settings.timeout_secs))
                    .build()?;
                match client.get(format!("{}/api/tags", url)).send().await {
                    Ok(resp) if resp.status().is_success() => Ok((true, None)),
                    Ok(resp) => Ok((false, Some(format!("Ollama returned {}", resp.status())))),
                    Err(e) => Ok((
                        false,
                        Some(format!("Ollama unreachable at {}: {}", url, e)),
                    )),
                }
            }
        }
    }
}

#[async_trait]
impl Generator for EmbeddingGenerator {
    async fn generate(
        &self,
        config: &ConnectorSpecification,
        message: DatMessage,
    ) -> Result<Vec<DatMessage>> {
        self.generate_batch(config, vec![message]).await
    }

    async fn generate_batch(
        &self,
        config: &ConnectorSpecification,
        mut messages: Vec<DatMessage>,
    ) -> Result<Vec<DatMessage>> {
        let settings = EmbeddingSettings::from_config(config)?;

        let positions: Vec<usize> = messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.kind == MessageType::Record && m.record.is_some())
            .map(|(i, _)| i)
            .collect();

        for group in positions.chunks(settings.batch_size) {
            let texts: Vec<String> = group
                .iter()
                .filter_map(|&i| messages[i].record.as_ref())
                .map(|r| r.data.document_chunk.clone())
                .collect();

            let vectors = embed_texts(self.provider, &settings, &texts).await?;
            if vectors.len() != texts.len() {
                bail!(
                    "{} returned {} embeddings for {} inputs",
                    self.provider.as_str(),
                    vectors.len(),
                    texts.len()
                );
            }

            for (&i, vector) in group.iter().zip(vectors) {
                if let Some(record) = messages[i].record.as_mut() {
                    record.data.vectors = Some(vector);
                }
            }
        }

        tracing::debug!(
            generator = self.provider.as_str(),
            records = positions.len(),
            envelopes = messages.len(),
            "embedded batch"
        );
        Ok(messages)
    }
}

/// Embed a batch of texts with `provider`, one vector per text in order.
pub async fn embed_texts(
    provider: Provider,
    settings: &EmbeddingSettings,
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    if texts.is_empty() {
        return Ok(Vec::new());
    }
    match provider {
        Provider::OpenAI => embed_openai(settings, texts).await,
        Provider::Ollama => embed_ollama(settings, texts).await,
        Provider::Hash => {
            let dims = settings.hash_dims()?;
            Ok(texts.iter().map(|t| hash_embedding(t, dims)).collect())
        }
    }
}

/// Deterministic unit vector of `dims` components seeded by `text`.
pub fn hash_embedding(text: &str, dims: usize) -> Vec<f32> {
    let mut values = Vec::with_capacity(dims);
    let mut block: u32 = 0;
    while values.len() < dims {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hasher.update(block.to_le_bytes());
        let digest = hasher.finalize();
        for word in digest.chunks_exact(4) {
            if values.len() == dims {
                break;
            }
            let n = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
            values.push((n as f64 / u32::MAX as f64 * 2.0 - 1.0) as f32);
        }
        block += 1;
    }

    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut values {
            *v /= norm;
        }
    }
    values
}

async fn post_with_retry(
    client: &reqwest::Client,
    request: impl Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    label: &str,
    max_retries: u32,
) -> Result<Value> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tracing::debug!(backend = label, attempt, delay_secs = delay.as_secs(), "retrying");
            tokio::time::sleep(delay).await;
        }

        match request(client).send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return Ok(response.json().await?);
                }

                // Rate limited or server error: retry
                if status.as_u16() == 429 || status.is_server_error() {
                    let body_text = response.text().await.unwrap_or_default();
                    last_err = Some(anyhow::anyhow!("{} API error {}: {}", label, status, body_text));
                    continue;
                }

                let body_text = response.text().await.unwrap_or_default();
                bail!("{} API error {}: {}", label, status, body_text);
            }
            Err(e) => {
                last_err = Some(anyhow::anyhow!("{} connection error: {}", label, e));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{} embedding failed after retries", label)))
}

async fn embed_openai(settings: &EmbeddingSettings, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let api_key =
        std::env::var("OPENAI_API_KEY").map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;
    let model = settings.require_model(Provider::OpenAI)?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(settings.timeout_secs))
        .build()?;

    let mut body = json!({"model": model, "input": texts});
    if let Some(dims) = settings.dims {
        body["dimensions"] = json!(dims);
    }

    let json = post_with_retry(
        &client,
        |c| {
            c.post(OPENAI_URL)
                .header("Authorization", format!("Bearer {}", api_key))
                .json(&body)
        },
        "OpenAI",
        settings.max_retries,
    )
    .await?;
    parse_openai_response(&json)
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing embedding"))?;
        let index = item
            .get("index")
            .and_then(Value::as_u64)
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, to_f32_vec(embedding)));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

async fn embed_ollama(settings: &EmbeddingSettings, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let model = settings.require_model(Provider::Ollama)?;
    let url = settings.url.as_deref().unwrap_or(OLLAMA_DEFAULT_URL);

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(settings.timeout_secs))
        .build()?;

    let body = json!({"model": model, "input": texts});
    let endpoint = format!("{}/api/embed", url.trim_end_matches('/'));

    let json = post_with_retry(
        &client,
        |c| c.post(&endpoint).json(&body),
        "Ollama",
        settings.max_retries,
    )
    .await?;
    parse_ollama_response(&json)
}

fn parse_ollama_response(json: &Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing embeddings array"))?;

    embeddings
        .iter()
        .map(|embedding| {
            embedding
                .as_array()
                .map(|values| to_f32_vec(values.as_slice()))
                .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: embedding is not an array"))
        })
        .collect()
}

fn to_f32_vec(values: &[Value]) -> Vec<f32> {
    values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect()
}

/// Encode a vector as little-endian `f32` bytes for BLOB storage.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB written by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
