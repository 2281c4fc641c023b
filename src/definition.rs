use crate::error::{CharavaultError, Result};
use crate::png::{build_png, read_chunks, read_chunks_from, PngChunk, STREAM_WINDOW_SIZE};
use crate::text::{decode_text, encode_text, from_base64, to_base64};
use base64::{engine::general_purpose::STANDARD as BASE64, read::DecoderReader, Engine};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::borrow::Cow;
use std::io::Read;
use tracing::{debug, warn};

pub const PNG_DATA_URI_PREFIX: &str = "data:image/png;base64,";
pub const CHARA_KEYWORD: &str = "chara";

/// Escaped `"spec"` key, as it appears when a card was JSON-stringified twice.
const DOUBLE_ENCODED_MARKER: &str = r#"\"spec\""#;

lazy_static! {
    static ref DATA_URI_PREFIX_RE: Regex =
        Regex::new(r"^data:image/\w+;base64,").expect("valid data URI regex");
}

/// How a `chara` payload was stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PayloadEncoding {
    /// UTF-8 JSON written directly into the chunk.
    RawJson,
    /// Base64 of UTF-8 JSON (the convention this crate writes).
    Base64,
    /// Neither; passed through untouched.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPayload {
    pub text: String,
    pub encoding: PayloadEncoding,
}

/// Estimated decoded size of a base64 image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ImageSize {
    pub bytes: u64,
    pub kilobytes: f64,
    pub megabytes: f64,
}

pub fn is_png_data_uri(image: &str) -> bool {
    image.starts_with(PNG_DATA_URI_PREFIX)
}

fn data_uri_payload(image: &str) -> Result<&str> {
    image
        .strip_prefix(PNG_DATA_URI_PREFIX)
        .map(str::trim)
        .ok_or_else(|| {
            CharavaultError::InvalidImageFormat(format!(
                "expected a '{}' data URI",
                PNG_DATA_URI_PREFIX
            ))
        })
}

/// Decode base64 in [`STREAM_WINDOW_SIZE`] windows.
pub fn decode_base64_windowed(encoded: &str) -> Result<Vec<u8>> {
    let mut decoder = DecoderReader::new(encoded.as_bytes(), &BASE64);
    let mut window = vec![0u8; STREAM_WINDOW_SIZE];
    let mut out = Vec::with_capacity(encoded.len() / 4 * 3);

    loop {
        let n = decoder
            .read(&mut window)
            .map_err(|e| CharavaultError::InvalidImageFormat(format!("invalid base64: {}", e)))?;
        if n == 0 {
            break;
        }
        out.extend_from_slice(&window[..n]);
    }

    Ok(out)
}

/// Decode a PNG data URI into raw PNG bytes.
pub fn decode_data_uri(image: &str) -> Result<Vec<u8>> {
    decode_base64_windowed(data_uri_payload(image)?)
}

/// Wrap raw PNG bytes into a data URI.
pub fn encode_data_uri(png: &[u8]) -> String {
    format!("{}{}", PNG_DATA_URI_PREFIX, BASE64.encode(png))
}

/// Parse the chunks of a data URI, decoding base64 straight into the chunk reader.
fn data_uri_chunks(image: &str) -> Result<Vec<PngChunk>> {
    let payload = data_uri_payload(image)?;
    read_chunks_from(DecoderReader::new(payload.as_bytes(), &BASE64)).map_err(|e| match e {
        CharavaultError::IoError(msg) => {
            CharavaultError::InvalidImageFormat(format!("invalid base64: {}", msg))
        }
        other => other,
    })
}

/// Estimate the decoded size of a base64 image without decoding it.
pub fn estimate_base64_image_size(image: &str) -> ImageSize {
    let payload = DATA_URI_PREFIX_RE.replace(image, "");
    let payload = payload.trim_end();

    let padding = if payload.ends_with("==") {
        2
    } else if payload.ends_with('=') {
        1
    } else {
        0
    };
    let bytes = (payload.len() as u64 * 3 / 4).saturating_sub(padding);

    let kilobytes = bytes as f64 / 1024.0;
    let megabytes = kilobytes / 1024.0;

    ImageSize {
        bytes,
        kilobytes: (kilobytes * 100.0).round() / 100.0,
        megabytes: (megabytes * 100.0).round() / 100.0,
    }
}

/// Detect whether a `chara` payload is raw JSON or base64 and decode it.
///
/// Raw JSON is recognized first (an object or a JSON string that parses).
/// Base64 text can never start with `{` or `"`, so the two never collide.
pub fn decode_payload(text: &str) -> DecodedPayload {
    let trimmed = text.trim();
    if (trimmed.starts_with('{') || trimmed.starts_with('"'))
        && serde_json::from_str::<serde::de::IgnoredAny>(trimmed).is_ok()
    {
        return DecodedPayload {
            text: text.to_string(),
            encoding: PayloadEncoding::RawJson,
        };
    }

    match from_base64(trimmed) {
        Ok(decoded) => DecodedPayload {
            text: decoded,
            encoding: PayloadEncoding::Base64,
        },
        Err(_) => DecodedPayload {
            text: text.to_string(),
            encoding: PayloadEncoding::Unknown,
        },
    }
}

/// Undo one extra layer of JSON string encoding.
///
/// Some producers stringify the card twice, so the stored text is a JSON
/// string literal containing `\"spec\"`. Only that exact shape is unwrapped;
/// everything else is returned unchanged.
pub fn unwrap_double_encoded(json: &str) -> Result<Cow<'_, str>> {
    let trimmed = json.trim();
    if !trimmed.starts_with('"') || !trimmed.contains(DOUBLE_ENCODED_MARKER) {
        return Ok(Cow::Borrowed(json));
    }

    let inner: String = serde_json::from_str(trimmed).map_err(|e| {
        CharavaultError::SchemaError(format!(
            "double-encoded card JSON could not be unwrapped: {}",
            e
        ))
    })?;

    warn!(
        outer_len = json.len(),
        inner_len = inner.len(),
        "unwrapped double-encoded card JSON"
    );
    Ok(Cow::Owned(inner))
}

fn definition_from_chunks(chunks: &[PngChunk]) -> Result<String> {
    let text_chunks: Vec<_> = chunks
        .iter()
        .filter(|c| c.is_text())
        .filter_map(|c| match decode_text(c) {
            Ok(text) => Some(text),
            Err(e) => {
                debug!(error = %e, len = c.data.len(), "skipping unreadable tEXt chunk");
                None
            }
        })
        .collect();

    if text_chunks.is_empty() {
        debug!("PNG metadata does not contain any text chunks");
    }

    let chara = text_chunks
        .into_iter()
        .find(|t| t.keyword.to_lowercase() == CHARA_KEYWORD)
        .ok_or(CharavaultError::DefinitionNotFound)?;

    let payload = decode_payload(&chara.text);
    debug!(encoding = %payload.encoding, len = payload.text.len(), "extracted chara payload");
    Ok(payload.text)
}

/// Extract the card JSON from a PNG data URI.
pub fn extract_definition(image: &str) -> Result<String> {
    definition_from_chunks(&data_uri_chunks(image)?)
}

/// Extract the card JSON from raw PNG bytes.
pub fn extract_definition_from_png(png: &[u8]) -> Result<String> {
    definition_from_chunks(&read_chunks(png)?)
}

fn without_text_chunks(chunks: Vec<PngChunk>) -> Vec<PngChunk> {
    chunks.into_iter().filter(|c| !c.is_text()).collect()
}

/// Drop every `tEXt` chunk from a PNG data URI.
pub fn strip_metadata(image: &str) -> Result<String> {
    let chunks = without_text_chunks(data_uri_chunks(image)?);
    Ok(encode_data_uri(&build_png(&chunks)))
}

/// Drop every `tEXt` chunk from raw PNG bytes.
pub fn strip_metadata_from_png(png: &[u8]) -> Result<Vec<u8>> {
    Ok(build_png(&without_text_chunks(read_chunks(png)?)))
}

/// Replace the text metadata of `chunks` with a single `chara` chunk.
///
/// All existing `tEXt` chunks are removed, so stale copies of the card
/// (including `ccv3` chunks) never survive an edit. The new chunk goes
/// immediately before IEND.
pub fn embed_into_chunks(chunks: Vec<PngChunk>, definition_json: &str) -> Result<Vec<PngChunk>> {
    let json = unwrap_double_encoded(definition_json)?;
    let mut chunks = without_text_chunks(chunks);

    let end = chunks
        .iter()
        .position(PngChunk::is_end)
        .ok_or_else(|| CharavaultError::FormatError("PNG has no IEND chunk".to_string()))?;

    chunks.insert(end, encode_text(CHARA_KEYWORD, &to_base64(&json))?);
    Ok(chunks)
}

/// Embed card JSON into a PNG data URI.
pub fn embed_definition(image: &str, definition_json: &str) -> Result<String> {
    let chunks = embed_into_chunks(data_uri_chunks(image)?, definition_json)?;
    Ok(encode_data_uri(&build_png(&chunks)))
}

/// Embed card JSON into raw PNG bytes.
pub fn embed_definition_into_png(png: &[u8], definition_json: &str) -> Result<Vec<u8>> {
    let chunks = embed_into_chunks(read_chunks(png)?, definition_json)?;
    Ok(build_png(&chunks))
}
