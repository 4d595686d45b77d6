//! # regula-core
//!
//! Core types, traits, and abstractions for the regula compliance-scanning
//! scheduler.
//!
//! This crate provides the data model shared by the scan queue, the
//! embedding batch queue and the status stream, plus the narrow collaborator
//! traits that the store, inference and scanning backends implement.

pub mod defaults;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use events::{EventBus, ServerEvent};
pub use models::*;
pub use traits::*;
