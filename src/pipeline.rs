use crate::card::CardDocument;
use crate::definition::{extract_definition, extract_definition_from_png};
use crate::embedding::{embed_optional, EmbeddingProvider};
use crate::error::{CharavaultError, Result};
use crate::normalize::{normalize_card, NormalizeOptions};
use crate::store::{sha256_hex, CharacterId, DefinitionRecord};
use crate::tokens::{compute_token_counts, select_embedding_input, EmbeddingInput};
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

pub const MAX_BATCH_CONCURRENCY: usize = 16;

/// Everything derived from one card image, ready to persist.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedDefinition {
    pub card: CardDocument,
    pub definition_json: String,
    pub content_hash: String,
    pub embedding: Option<Vec<f32>>,
    pub tokens_permanent: u32,
    pub tokens_total: u32,
}

impl PreparedDefinition {
    pub fn into_record(self, id: CharacterId) -> DefinitionRecord {
        DefinitionRecord {
            id,
            definition_json: self.definition_json,
            content_hash: self.content_hash,
            embedding: self.embedding,
            tokens_permanent: Some(self.tokens_permanent),
            tokens_total: Some(self.tokens_total),
        }
    }
}

/// Card image in either transport form.
#[derive(Debug, Clone, Copy)]
pub enum CardImage<'a> {
    DataUri(&'a str),
    Png(&'a [u8]),
}

/// Run CPU-bound codec or tokenizer work on the blocking pool.
pub async fn run_blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| CharavaultError::IoError(format!("blocking task failed: {}", e)))?
}

/// Derive a definition from already-extracted card JSON.
pub async fn prepare_from_json(
    raw_json: &str,
    options: &NormalizeOptions,
    provider: &dyn EmbeddingProvider,
    max_tokens: usize,
) -> Result<PreparedDefinition> {
    let raw_json = raw_json.to_string();
    let options = *options;
    let (card, counts, input, definition_json) = run_blocking(move || {
        let card = normalize_card(&raw_json, &options)?;
        let counts = compute_token_counts(&card)?;
        let input = select_embedding_input(&card, max_tokens)?;
        let definition_json = card.to_json()?;
        Ok((card, counts, input, definition_json))
    })
    .await?;

    let embedding = match input {
        EmbeddingInput::Embed(text) => embed_optional(provider, &text).await,
        EmbeddingInput::Skip { .. } => None,
    };

    let content_hash = sha256_hex(&definition_json);

    debug!(
        name = %card.data.name,
        tokens_total = counts.tokens_total,
        embedded = embedding.is_some(),
        "prepared definition"
    );

    Ok(PreparedDefinition {
        card,
        definition_json,
        content_hash,
        embedding,
        tokens_permanent: counts.tokens_permanent,
        tokens_total: counts.tokens_total,
    })
}

pub async fn prepare_definition(
    image: CardImage<'_>,
    options: &NormalizeOptions,
    provider: &dyn EmbeddingProvider,
    max_tokens: usize,
) -> Result<PreparedDefinition> {
    let raw = match image {
        CardImage::DataUri(uri) => {
            let uri = uri.to_string();
            run_blocking(move || extract_definition(&uri)).await?
        }
        CardImage::Png(bytes) => {
            let bytes = bytes.to_vec();
            run_blocking(move || extract_definition_from_png(&bytes)).await?
        }
    };
    prepare_from_json(&raw, options, provider, max_tokens).await
}

/// Prepare many cards concurrently. Results come back in input order; a
/// failing card is logged and reported in its slot without affecting others.
pub async fn prepare_batch(
    images: &[CardImage<'_>],
    options: &NormalizeOptions,
    provider: &dyn EmbeddingProvider,
    max_tokens: usize,
    concurrency: usize,
) -> Vec<Result<PreparedDefinition>> {
    let semaphore = Arc::new(Semaphore::new(concurrency.clamp(1, MAX_BATCH_CONCURRENCY)));

    let tasks = images.iter().enumerate().map(|(index, image)| {
        let semaphore = semaphore.clone();
        async move {
            let _permit = semaphore.acquire().await;
            let result = prepare_definition(*image, options, provider, max_tokens).await;
            if let Err(ref e) = result {
                warn!(index, error = %e, code = e.code(), "card preparation failed");
            }
            result
        }
    });

    join_all(tasks).await
}
