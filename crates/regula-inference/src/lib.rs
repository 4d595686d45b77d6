//! # regula-inference
//!
//! External provider backends for regula.
//!
//! This crate provides:
//! - An OpenAI-compatible [`EmbeddingBackend`] for dictionary embeddings
//! - An HTTP [`ScanBackend`] for the remote compliance scanner
//! - Deterministic mocks (feature `mock`)

pub mod openai;
pub mod scanner;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

// Re-export core types
pub use regula_core::*;

pub use openai::{OpenAIBackend, OpenAIConfig};
pub use scanner::{HttpScanBackend, ScannerConfig};
