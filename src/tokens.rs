use crate::card::CardDocument;
use crate::error::{CharavaultError, Result};
use lazy_static::lazy_static;
use serde::Serialize;
use tiktoken_rs::CoreBPE;

pub const DEFAULT_EMBEDDING_TOKEN_LIMIT: usize = 8192;

lazy_static! {
    // cl100k_base, loaded once per process.
    static ref TOKENIZER: std::result::Result<CoreBPE, String> =
        tiktoken_rs::cl100k_base().map_err(|e| e.to_string());
}

fn tokenizer() -> Result<&'static CoreBPE> {
    TOKENIZER
        .as_ref()
        .map_err(|e| CharavaultError::TokenizerError(e.clone()))
}

pub fn count_tokens(text: &str) -> Result<usize> {
    Ok(tokenizer()?.encode_with_special_tokens(text).len())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenCounts {
    /// Description and personality: what is always in context.
    pub tokens_permanent: u32,
    /// Permanent tokens plus the first message.
    pub tokens_total: u32,
}

pub fn compute_token_counts(card: &CardDocument) -> Result<TokenCounts> {
    let data = &card.data;
    let permanent = format!("{}\n{}", data.description, data.personality);
    let total = format!("{}\n{}", permanent, data.first_mes);

    Ok(TokenCounts {
        tokens_permanent: count_tokens(&permanent)? as u32,
        tokens_total: count_tokens(&total)? as u32,
    })
}

/// What to send to the embedding provider for one card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmbeddingInput {
    Embed(String),
    /// Description is over the limit; no embedding is requested.
    Skip { tokens: usize },
}

/// Pick the embedding text for a card. Over-limit descriptions are skipped,
/// never truncated.
pub fn select_embedding_input(card: &CardDocument, max_tokens: usize) -> Result<EmbeddingInput> {
    let description = &card.data.description;
    let tokens = count_tokens(description)?;

    if tokens <= max_tokens {
        Ok(EmbeddingInput::Embed(description.clone()))
    } else {
        tracing::debug!(
            name = %card.data.name,
            tokens,
            max_tokens,
            "description over embedding token limit, skipping"
        );
        Ok(EmbeddingInput::Skip { tokens })
    }
}
