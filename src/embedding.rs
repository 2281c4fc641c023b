use crate::config::{EmbeddingConfig, EmbeddingProviderKind};
use crate::error::{CharavaultError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use wreq::{
    header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION},
    Client,
};

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const OPENAI_DEFAULT_MODEL: &str = "text-embedding-3-large";
pub const MISTRAL_BASE_URL: &str = "https://api.mistral.ai/v1";
pub const MISTRAL_DEFAULT_MODEL: &str = "mistral-embed";
pub const NOMIC_BASE_URL: &str = "https://api-atlas.nomic.ai/v1";
pub const NOMIC_DEFAULT_MODEL: &str = "nomic-embed-text-v1.5";
const NOMIC_MODELS: &[&str] = &["nomic-embed-text-v1", "nomic-embed-text-v1.5"];

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Connection details shared by the hosted providers.
#[derive(Clone)]
pub struct RemoteEmbedder {
    client: Client,
    base_url: String,
    model: String,
}

impl std::fmt::Debug for RemoteEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteEmbedder")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl RemoteEmbedder {
    pub fn new(base_url: &str, api_key: &str, model: &str, timeout_secs: u64) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let clean_key = api_key
            .strip_prefix("Bearer ")
            .unwrap_or(api_key)
            .trim();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", clean_key))
                // Keep the key out of error messages.
                .map_err(|_| CharavaultError::ConfigError("Invalid embedding API key".to_string()))?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| CharavaultError::NetworkError(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<B: Serialize, T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.post(&url).json(body).send().await?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| CharavaultError::NetworkError(e.to_string()))?;

        if !status.is_success() {
            return Err(CharavaultError::EmbeddingError(format!(
                "{} returned HTTP {}: {}",
                url,
                status.as_u16(),
                truncate(&text, 200)
            )));
        }

        serde_json::from_str(&text).map_err(|e| {
            CharavaultError::EmbeddingError(format!("unexpected response from {}: {}", url, e))
        })
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[derive(Serialize)]
struct InputRequest<'a> {
    model: &'a str,
    input: [&'a str; 1],
}

#[derive(Deserialize)]
struct DataResponse {
    data: Vec<DataItem>,
}

#[derive(Deserialize)]
struct DataItem {
    embedding: Option<Vec<f32>>,
}

#[derive(Serialize)]
struct NomicRequest<'a> {
    model: &'a str,
    texts: [&'a str; 1],
    task_type: &'static str,
}

#[derive(Deserialize)]
struct NomicResponse {
    embeddings: Vec<Vec<f32>>,
}

/// The configured embedding backend.
#[derive(Debug, Clone)]
pub enum Embedder {
    /// Any OpenAI-compatible `/embeddings` endpoint.
    OpenAi(RemoteEmbedder),
    Mistral(RemoteEmbedder),
    Nomic(RemoteEmbedder),
    Disabled,
}

impl Embedder {
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        if config.provider == EmbeddingProviderKind::Disabled {
            return Ok(Embedder::Disabled);
        }

        let api_key = config.api_key.as_deref().ok_or_else(|| {
            CharavaultError::ConfigError(format!(
                "{} embedding provider requires CHARAVAULT_EMBEDDING_API_KEY",
                config.provider
            ))
        })?;
        let base_url = config.base_url.as_ref().map(|u| u.as_str());
        let model = config.model.as_deref();
        let timeout = config.timeout_secs;

        let embedder = match config.provider {
            EmbeddingProviderKind::OpenAi => Embedder::OpenAi(RemoteEmbedder::new(
                base_url.unwrap_or(OPENAI_BASE_URL),
                api_key,
                model.unwrap_or(OPENAI_DEFAULT_MODEL),
                timeout,
            )?),
            EmbeddingProviderKind::Mistral => Embedder::Mistral(RemoteEmbedder::new(
                base_url.unwrap_or(MISTRAL_BASE_URL),
                api_key,
                model.unwrap_or(MISTRAL_DEFAULT_MODEL),
                timeout,
            )?),
            EmbeddingProviderKind::Nomic => {
                let model = model.unwrap_or(NOMIC_DEFAULT_MODEL);
                if !NOMIC_MODELS.contains(&model) {
                    return Err(CharavaultError::ConfigError(format!(
                        "Unsupported Nomic model: {}",
                        model
                    )));
                }
                Embedder::Nomic(RemoteEmbedder::new(
                    base_url.unwrap_or(NOMIC_BASE_URL),
                    api_key,
                    model,
                    timeout,
                )?)
            }
            EmbeddingProviderKind::Disabled => Embedder::Disabled,
        };

        Ok(embedder)
    }

    pub fn kind(&self) -> EmbeddingProviderKind {
        match self {
            Embedder::OpenAi(_) => EmbeddingProviderKind::OpenAi,
            Embedder::Mistral(_) => EmbeddingProviderKind::Mistral,
            Embedder::Nomic(_) => EmbeddingProviderKind::Nomic,
            Embedder::Disabled => EmbeddingProviderKind::Disabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, Embedder::Disabled)
    }
}

fn first_embedding(data: DataResponse, provider: &str) -> Result<Vec<f32>> {
    data.data
        .into_iter()
        .next()
        .and_then(|item| item.embedding)
        .ok_or_else(|| {
            CharavaultError::EmbeddingError(format!("{} returned no embedding", provider))
        })
}

#[async_trait]
impl EmbeddingProvider for Embedder {
    fn name(&self) -> &str {
        let name: &'static str = self.kind().into();
        name
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        match self {
            Embedder::OpenAi(remote) | Embedder::Mistral(remote) => {
                let body = InputRequest {
                    model: remote.model(),
                    input: [text],
                };
                let response: DataResponse = remote.post("/embeddings", &body).await?;
                first_embedding(response, self.name())
            }
            Embedder::Nomic(remote) => {
                let body = NomicRequest {
                    model: remote.model(),
                    texts: [text],
                    task_type: "search_document",
                };
                let response: NomicResponse = remote.post("/embedding/text", &body).await?;
                response.embeddings.into_iter().next().ok_or_else(|| {
                    CharavaultError::EmbeddingError("nomic returned no embedding".to_string())
                })
            }
            Embedder::Disabled => Err(CharavaultError::EmbeddingError(
                "embedding provider is disabled".to_string(),
            )),
        }
    }
}

/// Embed `text`, treating any failure or a degenerate vector as "no embedding".
pub async fn embed_optional(provider: &dyn EmbeddingProvider, text: &str) -> Option<Vec<f32>> {
    match provider.embed(text).await {
        Ok(vector) if vector.len() > 1 => {
            debug!(provider = provider.name(), dims = vector.len(), "embedded text");
            Some(vector)
        }
        Ok(vector) => {
            warn!(
                provider = provider.name(),
                dims = vector.len(),
                "discarding degenerate embedding"
            );
            None
        }
        Err(e) => {
            warn!(provider = provider.name(), error = %e, "embedding failed");
            None
        }
    }
}
