use crate::error::{CharavaultError, Result};
use std::io::{ErrorKind, Read};

pub const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

pub const IHDR: [u8; 4] = *b"IHDR";
pub const IDAT: [u8; 4] = *b"IDAT";
pub const IEND: [u8; 4] = *b"IEND";
pub const TEXT: [u8; 4] = *b"tEXt";
pub const ZTXT: [u8; 4] = *b"zTXt";
pub const ITXT: [u8; 4] = *b"iTXt";

/// Read window used by [`read_chunks_from`].
pub const STREAM_WINDOW_SIZE: usize = 1024 * 1024;

/// Largest chunk length allowed by the PNG specification (2^31 - 1).
const MAX_CHUNK_LENGTH: usize = i32::MAX as usize;

/// length (4) + type (4) + crc (4)
const CHUNK_OVERHEAD: usize = 12;

/// Represents a PNG chunk with type and data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PngChunk {
    pub chunk_type: [u8; 4],
    pub data: Vec<u8>,
}

impl PngChunk {
    /// Creates a new PngChunk with the given type and data.
    pub fn new(chunk_type: &[u8; 4], data: Vec<u8>) -> Self {
        Self {
            chunk_type: *chunk_type,
            data,
        }
    }

    /// Returns the chunk type as a string.
    pub fn type_string(&self) -> String {
        String::from_utf8_lossy(&self.chunk_type).to_string()
    }

    pub fn is_text(&self) -> bool {
        self.chunk_type == TEXT
    }

    pub fn is_end(&self) -> bool {
        self.chunk_type == IEND
    }
}

/// Calculate CRC32 for a chunk (type + data).
fn calculate_crc(chunk_type: &[u8], data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(chunk_type);
    hasher.update(data);
    hasher.finalize()
}

fn check_signature(data: &[u8]) -> Result<()> {
    if data.len() < PNG_SIGNATURE.len() || data[..PNG_SIGNATURE.len()] != PNG_SIGNATURE {
        return Err(CharavaultError::FormatError(
            "Missing PNG signature".to_string(),
        ));
    }
    Ok(())
}

/// Parse the chunk at the start of `data`.
///
/// Returns `Ok(None)` when `data` does not yet hold the whole chunk, and the
/// chunk together with the number of bytes it occupied otherwise.
fn parse_chunk(data: &[u8]) -> Result<Option<(PngChunk, usize)>> {
    if data.len() < 8 {
        return Ok(None);
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if length > MAX_CHUNK_LENGTH {
        return Err(CharavaultError::FormatError(format!(
            "Chunk length {} exceeds PNG limit",
            length
        )));
    }

    let total = CHUNK_OVERHEAD + length;
    if data.len() < total {
        return Ok(None);
    }

    let chunk_type: [u8; 4] = [data[4], data[5], data[6], data[7]];
    let chunk_data = &data[8..8 + length];
    let crc_pos = 8 + length;
    let stored_crc = u32::from_be_bytes([
        data[crc_pos],
        data[crc_pos + 1],
        data[crc_pos + 2],
        data[crc_pos + 3],
    ]);
    let computed_crc = calculate_crc(&chunk_type, chunk_data);
    if stored_crc != computed_crc {
        return Err(CharavaultError::FormatError(format!(
            "CRC mismatch in {} chunk: stored {:08x}, computed {:08x}",
            String::from_utf8_lossy(&chunk_type),
            stored_crc,
            computed_crc
        )));
    }

    Ok(Some((
        PngChunk {
            chunk_type,
            data: chunk_data.to_vec(),
        },
        total,
    )))
}

fn incomplete_error(remaining: usize) -> CharavaultError {
    if remaining == 0 {
        CharavaultError::FormatError("Stream ended without an IEND chunk".to_string())
    } else if remaining < 8 {
        CharavaultError::FormatError("Truncated chunk header".to_string())
    } else {
        CharavaultError::FormatError("Chunk length overruns buffer".to_string())
    }
}

/// Read all chunks from PNG data.
///
/// Every chunk's CRC is verified. Parsing stops at the IEND chunk and any
/// bytes after it are ignored; a stream without IEND is rejected.
pub fn read_chunks(data: &[u8]) -> Result<Vec<PngChunk>> {
    check_signature(data)?;

    let mut chunks = Vec::new();
    let mut pos = PNG_SIGNATURE.len();

    loop {
        match parse_chunk(&data[pos..])? {
            Some((chunk, consumed)) => {
                pos += consumed;
                let is_end = chunk.is_end();
                chunks.push(chunk);
                if is_end {
                    return Ok(chunks);
                }
            }
            None => return Err(incomplete_error(data.len() - pos)),
        }
    }
}

/// Read all chunks from a reader, pulling at most [`STREAM_WINDOW_SIZE`]
/// bytes at a time.
///
/// Only the unparsed tail is buffered, so peak memory stays around one
/// window plus the largest chunk. The result is identical to [`read_chunks`]
/// over the same bytes.
pub fn read_chunks_from<R: Read>(mut reader: R) -> Result<Vec<PngChunk>> {
    let mut window = vec![0u8; STREAM_WINDOW_SIZE];
    let mut buffer: Vec<u8> = Vec::new();
    let mut chunks = Vec::new();
    let mut pos = 0usize;
    let mut signature_checked = false;
    let mut eof = false;

    loop {
        if !signature_checked {
            if buffer.len() >= PNG_SIGNATURE.len() {
                check_signature(&buffer)?;
                pos = PNG_SIGNATURE.len();
                signature_checked = true;
                continue;
            }
        } else if let Some((chunk, consumed)) = parse_chunk(&buffer[pos..])? {
            pos += consumed;
            let is_end = chunk.is_end();
            chunks.push(chunk);
            if is_end {
                return Ok(chunks);
            }
            continue;
        }

        if eof {
            if !signature_checked {
                check_signature(&buffer)?;
            }
            return Err(incomplete_error(buffer.len() - pos));
        }

        if pos > 0 {
            buffer.drain(..pos);
            pos = 0;
        }

        match reader.read(&mut window) {
            Ok(0) => eof = true,
            Ok(n) => buffer.extend_from_slice(&window[..n]),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
}

/// Build PNG from chunks.
///
/// Writes PNG signature followed by all chunks with proper CRC.
pub fn build_png(chunks: &[PngChunk]) -> Vec<u8> {
    let capacity = PNG_SIGNATURE.len()
        + chunks
            .iter()
            .map(|c| c.data.len() + CHUNK_OVERHEAD)
            .sum::<usize>();
    let mut result = Vec::with_capacity(capacity);
    result.extend_from_slice(&PNG_SIGNATURE);

    for chunk in chunks {
        let length = chunk.data.len() as u32;
        result.extend_from_slice(&length.to_be_bytes());
        result.extend_from_slice(&chunk.chunk_type);
        result.extend_from_slice(&chunk.data);

        let crc = calculate_crc(&chunk.chunk_type, &chunk.data);
        result.extend_from_slice(&crc.to_be_bytes());
    }

    result
}

/// Extract all IDAT chunk data from a PNG file.
///
/// Used for verifying IDAT integrity before/after operations.
pub fn extract_idat_chunks(data: &[u8]) -> Result<Vec<Vec<u8>>> {
    let chunks = read_chunks(data)?;
    Ok(chunks
        .into_iter()
        .filter(|c| c.chunk_type == IDAT)
        .map(|c| c.data)
        .collect())
}

/// Create a minimal valid 1x1 grayscale PNG.
#[cfg(test)]
pub(crate) fn minimal_png() -> Vec<u8> {
    let ihdr_data: [u8; 13] = [
        0, 0, 0, 1, // width = 1
        0, 0, 0, 1, // height = 1
        8, // bit depth = 8
        0, // color type = grayscale
        0, // compression = deflate
        0, // filter = adaptive
        0, // interlace = none
    ];
    let idat_data: [u8; 10] = [0x08, 0xD7, 0x63, 0x60, 0x00, 0x00, 0x00, 0x02, 0x00, 0x01];

    build_png(&[
        PngChunk::new(&IHDR, ihdr_data.to_vec()),
        PngChunk::new(&IDAT, idat_data.to_vec()),
        PngChunk::new(&IEND, vec![]),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reader that hands out a few bytes per call.
    struct TrickleReader<'a> {
        data: &'a [u8],
        step: usize,
    }

    impl Read for TrickleReader<'_> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.step.min(buf.len()).min(self.data.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    #[test]
    fn test_read_chunks() {
        let png = minimal_png();
        let chunks = read_chunks(&png).unwrap();

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].type_string(), "IHDR");
        assert_eq!(chunks[1].type_string(), "IDAT");
        assert_eq!(chunks[2].type_string(), "IEND");
    }

    #[test]
    fn test_build_png_roundtrip_is_byte_exact() {
        let original = minimal_png();
        let chunks = read_chunks(&original).unwrap();
        let rebuilt = build_png(&chunks);

        assert_eq!(rebuilt, original);
        assert_eq!(read_chunks(&rebuilt).unwrap(), chunks);
    }

    #[test]
    fn test_build_png_keeps_order() {
        let chunks = vec![
            PngChunk::new(&IHDR, vec![1, 2, 3]),
            PngChunk::new(&TEXT, b"a\0b".to_vec()),
            PngChunk::new(&IDAT, vec![9]),
            PngChunk::new(&IEND, vec![]),
        ];
        assert_eq!(read_chunks(&build_png(&chunks)).unwrap(), chunks);
    }

    #[test]
    fn test_invalid_png_signature() {
        let invalid = vec![0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07];
        let result = read_chunks(&invalid);
        assert!(matches!(result, Err(CharavaultError::FormatError(_))));
    }

    #[test]
    fn test_crc_mismatch_is_rejected() {
        let mut png = minimal_png();
        // Last byte of the IHDR CRC: signature (8) + length/type (8) + data (13) + crc (4)
        png[8 + 8 + 13 + 3] ^= 0xFF;
        let err = read_chunks(&png).unwrap_err();
        match err {
            CharavaultError::FormatError(msg) => assert!(msg.contains("CRC mismatch")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_length_overrun_is_rejected() {
        let mut png = minimal_png();
        // Inflate the IDAT declared length far past the end of the buffer.
        let idat_len_pos = 8 + 12 + 13;
        png[idat_len_pos..idat_len_pos + 4].copy_from_slice(&1000u32.to_be_bytes());
        assert!(matches!(
            read_chunks(&png),
            Err(CharavaultError::FormatError(_))
        ));
    }

    #[test]
    fn test_missing_iend_is_rejected() {
        let png = build_png(&[PngChunk::new(&IHDR, vec![0; 13])]);
        let err = read_chunks(&png).unwrap_err();
        assert!(err.to_string().contains("IEND"));
    }

    #[test]
    fn test_trailing_bytes_after_iend_are_ignored() {
        let mut png = minimal_png();
        png.extend_from_slice(b"garbage after the end");
        let chunks = read_chunks(&png).unwrap();
        assert_eq!(chunks.len(), 3);
        assert!(chunks[2].is_end());
    }

    #[test]
    fn test_windowed_reader_matches_slice_decode() {
        // An IDAT larger than one window forces the reader to span windows.
        let big = vec![0xAB; STREAM_WINDOW_SIZE + 4096];
        let png = build_png(&[
            PngChunk::new(&IHDR, vec![0; 13]),
            PngChunk::new(&IDAT, big),
            PngChunk::new(&TEXT, b"chara\0e30=".to_vec()),
            PngChunk::new(&IEND, vec![]),
        ]);

        let from_slice = read_chunks(&png).unwrap();
        let from_reader = read_chunks_from(std::io::Cursor::new(&png)).unwrap();
        assert_eq!(from_slice, from_reader);

        let trickled = read_chunks_from(TrickleReader {
            data: &png,
            step: 7,
        })
        .unwrap();
        assert_eq!(from_slice, trickled);
    }

    #[test]
    fn test_windowed_reader_reports_truncation() {
        let png = minimal_png();
        let truncated = &png[..png.len() - 6];
        assert!(matches!(
            read_chunks_from(truncated),
            Err(CharavaultError::FormatError(_))
        ));
        assert!(matches!(
            read_chunks_from(&b"\x89PN"[..]),
            Err(CharavaultError::FormatError(_))
        ));
    }

    #[test]
    fn test_extract_idat_chunks() {
        let idat = extract_idat_chunks(&minimal_png()).unwrap();
        assert_eq!(idat.len(), 1);
        assert_eq!(idat[0].len(), 10);
    }
}
