//! Card PNG export.
//!
//! Builds a shareable card PNG from a canonical card, using a generated
//! placeholder when no avatar image is supplied.

use crate::card::CardDocument;
use crate::definition::embed_definition_into_png;
use crate::error::{CharavaultError, Result};
use image::{Rgba, RgbaImage};
use std::io::Cursor;

pub const PLACEHOLDER_SIZE: u32 = 512;

/// Generate a 512x512 gray placeholder PNG.
pub fn generate_placeholder_png() -> Result<Vec<u8>> {
    let img = RgbaImage::from_pixel(
        PLACEHOLDER_SIZE,
        PLACEHOLDER_SIZE,
        Rgba([128, 128, 128, 255]),
    );
    let mut buffer = Vec::new();
    let mut cursor = Cursor::new(&mut buffer);
    img.write_to(&mut cursor, image::ImageFormat::Png)
        .map_err(|e| CharavaultError::FormatError(format!("Failed to encode placeholder PNG: {}", e)))?;
    Ok(buffer)
}

/// Create a card PNG with the canonical card embedded as `chara`.
///
/// Pixel data of the avatar is never touched; only text metadata changes,
/// and any text chunks the avatar already carried are replaced.
pub fn create_card_png(card: &CardDocument, avatar: Option<&[u8]>) -> Result<Vec<u8>> {
    let card_json = card.to_json()?;
    match avatar {
        Some(png) => embed_definition_into_png(png, &card_json),
        None => embed_definition_into_png(&generate_placeholder_png()?, &card_json),
    }
}
