use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error, Serialize)]
#[serde(tag = "type", content = "details")]
pub enum CharavaultError {
    // PNG / codec errors
    #[error("Malformed PNG data: {0}")]
    FormatError(String),

    #[error("Invalid PNG image format: {0}")]
    InvalidImageFormat(String),

    #[error("PNG metadata does not contain any character data")]
    DefinitionNotFound,

    #[error("Unsupported card schema: {0}")]
    SchemaError(String),

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Image too large: {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: u64, limit: u64 },

    // Collaborator errors
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Embedding failed: {0}")]
    EmbeddingError(String),

    #[error("Tokenizer unavailable: {0}")]
    TokenizerError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    // Network errors
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Network timeout: {0}")]
    Timeout(String),

    // IO errors
    #[error("IO error: {0}")]
    IoError(String),
}

impl From<wreq::Error> for CharavaultError {
    fn from(err: wreq::Error) -> Self {
        if err.is_timeout() {
            CharavaultError::Timeout(err.to_string())
        } else if err.is_connect() {
            CharavaultError::NetworkError(format!("Connection failed: {}", err))
        } else {
            CharavaultError::NetworkError(err.to_string())
        }
    }
}

impl From<serde_json::Error> for CharavaultError {
    fn from(err: serde_json::Error) -> Self {
        CharavaultError::InvalidJson(err.to_string())
    }
}

impl From<base64::DecodeError> for CharavaultError {
    fn from(err: base64::DecodeError) -> Self {
        CharavaultError::FormatError(format!("Invalid base64: {}", err))
    }
}

impl From<std::io::Error> for CharavaultError {
    fn from(err: std::io::Error) -> Self {
        CharavaultError::IoError(err.to_string())
    }
}

impl CharavaultError {
    /// Whether the error is terminal for the card being processed.
    ///
    /// Codec and schema failures are deterministic and never worth retrying.
    pub fn is_card_error(&self) -> bool {
        matches!(
            self,
            CharavaultError::FormatError(_)
                | CharavaultError::InvalidImageFormat(_)
                | CharavaultError::DefinitionNotFound
                | CharavaultError::SchemaError(_)
                | CharavaultError::InvalidJson(_)
                | CharavaultError::PayloadTooLarge { .. }
        )
    }

    /// Stable machine-readable code used in HTTP error bodies and batch reports.
    pub fn code(&self) -> &'static str {
        match self {
            CharavaultError::FormatError(_) => "FORMAT_ERROR",
            CharavaultError::InvalidImageFormat(_) => "INVALID_IMAGE_FORMAT",
            CharavaultError::DefinitionNotFound => "DEFINITION_NOT_FOUND",
            CharavaultError::SchemaError(_) => "SCHEMA_ERROR",
            CharavaultError::InvalidJson(_) => "PARSE_ERROR",
            CharavaultError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            CharavaultError::NotFound(_) => "NOT_FOUND",
            CharavaultError::EmbeddingError(_) => "EMBEDDING_ERROR",
            CharavaultError::TokenizerError(_) => "TOKENIZER_ERROR",
            CharavaultError::StorageError(_) => "STORAGE_ERROR",
            CharavaultError::ConfigError(_) => "CONFIG_ERROR",
            CharavaultError::NetworkError(_) => "NETWORK_ERROR",
            CharavaultError::Timeout(_) => "TIMEOUT",
            CharavaultError::IoError(_) => "IO_ERROR",
        }
    }
}

/// Type alias for Result with CharavaultError
pub type Result<T> = std::result::Result<T, CharavaultError>;
