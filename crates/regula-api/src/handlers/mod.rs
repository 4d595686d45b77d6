//! HTTP handlers for regula-api.

pub mod checks;
pub mod embeddings;
pub mod status;
pub mod streams;
