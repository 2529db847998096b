//! Strata Core - Foundational Types and Abstractions
//!
//! This module provides the shared types used across the strata build
//! engine: the error enum, the build configuration, and engine-wide
//! constants.

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::{LayerType, StrataConfig, WORKING_DIR};
pub use error::{Result, StrataError};

/// Strata version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
