//! Shared types and utilities for the Pulse sentiment platform
//!
//! This crate provides the core data model, error taxonomy, configuration
//! and text normalization used across all components of the platform.

pub mod config;
pub mod error;
pub mod normalize;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use normalize::{hash_text, normalize_item, normalize_text, TextHash};
pub use types::*;
