pub mod card;
pub mod config;
pub mod definition;
pub mod embedding;
pub mod error;
pub mod library;
pub mod normalize;
pub mod pipeline;
pub mod png;
pub mod png_export;
pub mod server;
pub mod store;
pub mod text;
pub mod tokens;

pub use error::{CharavaultError, Result};
