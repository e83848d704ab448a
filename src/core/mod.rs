//! Core system types and foundations
//!
//! This module contains the building blocks shared by every other part of
//! the crate: error handling, configuration and scalar types.

pub mod types;
pub mod error;
pub mod config;

// Re-export commonly used items
pub use types::Timestamp;
pub use error::{Error, MappingError, Result, StorageError};
pub use config::Config;
