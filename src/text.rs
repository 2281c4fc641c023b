use crate::error::{CharavaultError, Result};
use crate::png::{read_chunks, PngChunk, ITXT, TEXT, ZTXT};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use flate2::read::ZlibDecoder;
use std::io::Read;

/// Logical content of a text chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub keyword: String,
    pub text: String,
}

/// Pack `keyword\0text` into a `tEXt` chunk.
pub fn encode_text(keyword: &str, text: &str) -> Result<PngChunk> {
    if keyword.is_empty() {
        return Err(CharavaultError::FormatError(
            "tEXt keyword must not be empty".to_string(),
        ));
    }
    if keyword.as_bytes().contains(&0) {
        return Err(CharavaultError::FormatError(
            "tEXt keyword must not contain a null byte".to_string(),
        ));
    }

    let mut data = Vec::with_capacity(keyword.len() + 1 + text.len());
    data.extend_from_slice(keyword.as_bytes());
    data.push(0); // null separator
    data.extend_from_slice(text.as_bytes());
    Ok(PngChunk::new(&TEXT, data))
}

/// Decode a `tEXt` chunk.
///
/// Splits on the first null byte. Text that is not valid UTF-8 is read as
/// Latin-1, which is what the PNG format itself prescribes for `tEXt`.
pub fn decode_text(chunk: &PngChunk) -> Result<TextChunk> {
    if chunk.chunk_type != TEXT {
        return Err(CharavaultError::FormatError(format!(
            "Expected tEXt chunk, got {}",
            chunk.type_string()
        )));
    }

    let null_pos = chunk.data.iter().position(|&b| b == 0).ok_or_else(|| {
        CharavaultError::FormatError("tEXt chunk has no null separator".to_string())
    })?;

    Ok(TextChunk {
        keyword: latin1_or_utf8(&chunk.data[..null_pos]),
        text: latin1_or_utf8(&chunk.data[null_pos + 1..]),
    })
}

fn latin1_or_utf8(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

/// Base64-encode the UTF-8 bytes of `text` (standard alphabet, padded).
pub fn to_base64(text: &str) -> String {
    BASE64.encode(text.as_bytes())
}

/// Inverse of [`to_base64`].
pub fn from_base64(encoded: &str) -> Result<String> {
    let bytes = BASE64.decode(encoded.trim())?;
    String::from_utf8(bytes).map_err(|e| {
        CharavaultError::FormatError(format!("base64 payload is not UTF-8: {}", e))
    })
}

/// Decode an iTXt (international text) chunk.
///
/// Format: keyword\0compression_flag compression_method language_tag\0translated_keyword\0text
fn decode_itxt_chunk(chunk_data: &[u8]) -> Option<TextChunk> {
    let null_pos = chunk_data.iter().position(|&b| b == 0)?;

    let keyword = latin1_or_utf8(&chunk_data[..null_pos]);
    let rest = &chunk_data[null_pos + 1..];

    if rest.len() < 2 {
        return None;
    }

    let compression_flag = rest[0];
    let rest = &rest[2..];

    let lang_null = rest.iter().position(|&b| b == 0)?;
    let rest = &rest[lang_null + 1..];

    let trans_null = rest.iter().position(|&b| b == 0)?;
    let text_data = &rest[trans_null + 1..];

    let text_data = if compression_flag == 1 {
        inflate(text_data)?
    } else {
        text_data.to_vec()
    };

    Some(TextChunk {
        keyword,
        text: String::from_utf8_lossy(&text_data).to_string(),
    })
}

/// Decode a zTXt (compressed text) chunk.
///
/// Format: keyword\0compression_method compressed_text
fn decode_ztxt_chunk(chunk_data: &[u8]) -> Option<TextChunk> {
    let null_pos = chunk_data.iter().position(|&b| b == 0)?;

    if null_pos + 1 >= chunk_data.len() {
        return None;
    }

    let decompressed = inflate(&chunk_data[null_pos + 2..])?;

    Some(TextChunk {
        keyword: latin1_or_utf8(&chunk_data[..null_pos]),
        text: latin1_or_utf8(&decompressed),
    })
}

fn inflate(data: &[u8]) -> Option<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).ok()?;
    Some(out)
}

/// Decode any of the three PNG text chunk kinds.
///
/// Returns `None` for non-text chunks and for text chunks that are malformed.
pub fn decode_metadata_chunk(chunk: &PngChunk) -> Option<TextChunk> {
    match chunk.chunk_type {
        TEXT => decode_text(chunk).ok(),
        ZTXT => decode_ztxt_chunk(&chunk.data),
        ITXT => decode_itxt_chunk(&chunk.data),
        _ => None,
    }
}

/// List every readable text entry (tEXt, zTXt, iTXt) of a PNG in stream order.
pub fn text_entries(png: &[u8]) -> Result<Vec<TextChunk>> {
    let chunks = read_chunks(png)?;
    Ok(chunks.iter().filter_map(decode_metadata_chunk).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::png::{build_png, minimal_png, IEND};
    use flate2::{write::ZlibEncoder, Compression};
    use std::io::Write;

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_encode_decode_text() {
        let chunk = encode_text("chara", "hello").unwrap();
        assert_eq!(chunk.type_string(), "tEXt");
        assert_eq!(chunk.data, b"chara\0hello");

        let decoded = decode_text(&chunk).unwrap();
        assert_eq!(decoded.keyword, "chara");
        assert_eq!(decoded.text, "hello");
    }

    #[test]
    fn test_text_roundtrip_outside_bmp() {
        let text = "Ærin 🐉 says 你好 - 𝔘𝔫𝔦𝔠𝔬𝔡𝔢";
        let decoded = decode_text(&encode_text("chara", text).unwrap()).unwrap();
        assert_eq!(decoded.text, text);
    }

    #[test]
    fn test_decode_splits_on_first_null() {
        let chunk = PngChunk::new(&TEXT, b"key\0a\0b".to_vec());
        let decoded = decode_text(&chunk).unwrap();
        assert_eq!(decoded.keyword, "key");
        assert_eq!(decoded.text, "a\0b");
    }

    #[test]
    fn test_decode_without_null_fails() {
        let chunk = PngChunk::new(&TEXT, b"charanonull".to_vec());
        assert!(matches!(
            decode_text(&chunk),
            Err(CharavaultError::FormatError(_))
        ));
    }

    #[test]
    fn test_decode_wrong_type_fails() {
        let chunk = PngChunk::new(&IEND, b"chara\0x".to_vec());
        assert!(matches!(
            decode_text(&chunk),
            Err(CharavaultError::FormatError(_))
        ));
    }

    #[test]
    fn test_empty_keyword_rejected() {
        assert!(encode_text("", "x").is_err());
        assert!(encode_text("a\0b", "x").is_err());
    }

    #[test]
    fn test_latin1_text_is_readable() {
        // 0xE9 is 'é' in Latin-1 and an invalid lone byte in UTF-8.
        let chunk = PngChunk::new(&TEXT, vec![b'k', 0, b'c', b'a', b'f', 0xE9]);
        assert_eq!(decode_text(&chunk).unwrap().text, "café");
    }

    #[test]
    fn test_base64_goes_through_utf8() {
        assert_eq!(to_base64("é"), "w6k=");
        assert_eq!(from_base64("w6k=").unwrap(), "é");

        let emoji = "😀 grin";
        assert_eq!(from_base64(&to_base64(emoji)).unwrap(), emoji);
    }

    #[test]
    fn test_from_base64_rejects_garbage() {
        assert!(from_base64("not base64!!").is_err());
        // Valid base64 of a lone 0xFF byte, which is not UTF-8.
        assert!(from_base64("/w==").is_err());
    }

    #[test]
    fn test_decode_ztxt_and_itxt() {
        let mut ztxt = b"Comment\0\0".to_vec();
        ztxt.extend(zlib(b"squeezed"));
        let z = decode_metadata_chunk(&PngChunk::new(&ZTXT, ztxt)).unwrap();
        assert_eq!(z.keyword, "Comment");
        assert_eq!(z.text, "squeezed");

        let mut itxt = b"Title\0\x00\x00en\0Titel\0".to_vec();
        itxt.extend_from_slice("plain ünïcode".as_bytes());
        let i = decode_metadata_chunk(&PngChunk::new(&ITXT, itxt)).unwrap();
        assert_eq!(i.keyword, "Title");
        assert_eq!(i.text, "plain ünïcode");
    }

    #[test]
    fn test_text_entries_lists_in_order() {
        let mut chunks = crate::png::read_chunks(&minimal_png()).unwrap();
        chunks.insert(1, encode_text("Software", "charavault").unwrap());
        chunks.insert(2, encode_text("chara", "e30=").unwrap());
        let entries = text_entries(&build_png(&chunks)).unwrap();

        let keywords: Vec<_> = entries.iter().map(|e| e.keyword.as_str()).collect();
        assert_eq!(keywords, vec!["Software", "chara"]);
    }
}
