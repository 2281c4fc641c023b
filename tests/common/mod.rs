pub mod fixtures;
pub mod http;
pub mod mock_embedding;
