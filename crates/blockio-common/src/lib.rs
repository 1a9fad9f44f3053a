//! BlockIO Common - Shared types and utilities
//!
//! This crate provides the identifiers, error definitions and configuration
//! types used across all BlockIO components.

pub mod config;
pub mod error;
pub mod types;

pub use config::{Config, IndexConfig, IndexKind, SerializerConfig};
pub use error::{Error, Result};
pub use types::*;
