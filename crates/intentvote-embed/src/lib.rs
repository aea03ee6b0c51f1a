//! Embedding providers: HTTP client for remote text embedding services.

#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "http")]
pub use http::{EmbedError, HttpEmbedder};
