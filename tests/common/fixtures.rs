#![allow(dead_code)]

use async_trait::async_trait;
use charavault_lib::{
    config::LibrarySettings,
    definition::{embed_definition, encode_data_uri},
    embedding::EmbeddingProvider,
    library::CardLibrary,
    server::ServerState,
    store::{MemoryObjectStore, MemoryRepository},
    Result,
};
use std::sync::Arc;

/// 1x1 transparent PNG without any text chunks.
pub const TINY_PNG: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
    0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0A, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
];

pub fn plain_png_uri() -> String {
    encode_data_uri(TINY_PNG)
}

pub fn card_uri(json: &str) -> String {
    embed_definition(&plain_png_uri(), json).expect("failed to embed test card")
}

/// Deterministic embedder: `[len, 1.0]` for every input.
pub struct LengthEmbedder;

#[async_trait]
impl EmbeddingProvider for LengthEmbedder {
    fn name(&self) -> &str {
        "length"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(vec![text.len() as f32, 1.0])
    }
}

pub struct TestServer {
    pub state: Arc<ServerState>,
    pub repository: Arc<MemoryRepository>,
    pub objects: Arc<MemoryObjectStore>,
}

pub fn test_server_with(settings: LibrarySettings) -> TestServer {
    let repository = Arc::new(MemoryRepository::new());
    let objects = Arc::new(MemoryObjectStore::new());
    let library = CardLibrary::new(
        repository.clone(),
        objects.clone(),
        Arc::new(LengthEmbedder),
        settings,
    );
    let state = Arc::new(ServerState {
        port: 0,
        library: Arc::new(library),
        embedding_provider: "length".to_string(),
    });
    TestServer {
        state,
        repository,
        objects,
    }
}

pub fn test_server() -> TestServer {
    test_server_with(LibrarySettings::default())
}
