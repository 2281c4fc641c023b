use crate::error::{CharavaultError, Result};
use crate::tokens::DEFAULT_EMBEDDING_TOKEN_LIMIT;
use std::path::PathBuf;
use std::str::FromStr;
use url::Url;

pub const DEFAULT_PORT: u16 = 17240;
pub const DEFAULT_IMAGE_FOLDER: &str = "./data/images";
pub const DEFAULT_MAX_IMAGE_BYTES: u64 = 20 * 1024 * 1024;
pub const DEFAULT_BATCH_CONCURRENCY: usize = 4;
pub const DEFAULT_EMBEDDING_TIMEOUT_SECS: u64 = 30;

const MIN_EMBEDDING_TIMEOUT_SECS: u64 = 5;
const MAX_EMBEDDING_TIMEOUT_SECS: u64 = 180;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display, strum::EnumString, strum::IntoStaticStr,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum EmbeddingProviderKind {
    #[strum(to_string = "openai", serialize = "open_ai")]
    OpenAi,
    Mistral,
    Nomic,
    #[default]
    Disabled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProviderKind,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub base_url: Option<Url>,
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::Disabled,
            api_key: None,
            model: None,
            base_url: None,
            timeout_secs: DEFAULT_EMBEDDING_TIMEOUT_SECS,
        }
    }
}

/// Limits and knobs used by the card library.
#[derive(Debug, Clone, PartialEq)]
pub struct LibrarySettings {
    pub max_image_bytes: u64,
    pub batch_concurrency: usize,
    pub embedding_token_limit: usize,
}

impl Default for LibrarySettings {
    fn default() -> Self {
        Self {
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
            batch_concurrency: DEFAULT_BATCH_CONCURRENCY,
            embedding_token_limit: DEFAULT_EMBEDDING_TOKEN_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub image_folder: PathBuf,
    pub library: LibrarySettings,
    pub embedding: EmbeddingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            image_folder: PathBuf::from(DEFAULT_IMAGE_FOLDER),
            library: LibrarySettings::default(),
            embedding: EmbeddingConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup. Unset and blank values fall back
    /// to defaults; values that are set but malformed are a `ConfigError`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let port = parse_or(&get, "CHARAVAULT_PORT", DEFAULT_PORT)?;
        let image_folder = get("CHARAVAULT_IMAGE_FOLDER")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_IMAGE_FOLDER));

        let library = LibrarySettings {
            max_image_bytes: parse_or(&get, "CHARAVAULT_MAX_IMAGE_BYTES", DEFAULT_MAX_IMAGE_BYTES)?,
            batch_concurrency: parse_or(
                &get,
                "CHARAVAULT_BATCH_CONCURRENCY",
                DEFAULT_BATCH_CONCURRENCY,
            )?,
            embedding_token_limit: parse_or(
                &get,
                "CHARAVAULT_EMBEDDING_TOKEN_LIMIT",
                DEFAULT_EMBEDDING_TOKEN_LIMIT,
            )?,
        };

        let provider = match get("CHARAVAULT_EMBEDDING_PROVIDER") {
            Some(raw) => EmbeddingProviderKind::from_str(&raw).map_err(|_| {
                CharavaultError::ConfigError(format!(
                    "CHARAVAULT_EMBEDDING_PROVIDER: unknown provider '{}'",
                    raw
                ))
            })?,
            None => EmbeddingProviderKind::Disabled,
        };

        let base_url = get("CHARAVAULT_EMBEDDING_BASE_URL")
            .map(|raw| {
                Url::parse(&raw).map_err(|e| {
                    CharavaultError::ConfigError(format!(
                        "CHARAVAULT_EMBEDDING_BASE_URL: {}",
                        e
                    ))
                })
            })
            .transpose()?;

        let timeout_secs: u64 = parse_or(
            &get,
            "CHARAVAULT_EMBEDDING_TIMEOUT_SECS",
            DEFAULT_EMBEDDING_TIMEOUT_SECS,
        )?;

        Ok(Self {
            port,
            image_folder,
            library,
            embedding: EmbeddingConfig {
                provider,
                api_key: get("CHARAVAULT_EMBEDDING_API_KEY"),
                model: get("CHARAVAULT_EMBEDDING_MODEL"),
                base_url,
                timeout_secs: timeout_secs
                    .clamp(MIN_EMBEDDING_TIMEOUT_SECS, MAX_EMBEDDING_TIMEOUT_SECS),
            },
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| CharavaultError::ConfigError(format!("{}: {}", key, e))),
        None => Ok(default),
    }
}
