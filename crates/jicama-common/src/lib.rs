//! Jicama Common - Shared types and utilities
//!
//! This crate provides the foundational types used across all Jicama
//! components:
//! - Error types
//! - Utility functions
//! - Common constants

pub mod error;
pub mod utils;

// Re-exports for convenience
pub use error::{AppError, JicamaError};
pub use utils::now_millis;

/// Timeout applied to a greedy recall before the server starts logging
/// the holder as unresponsive, in milliseconds
pub const DEFAULT_RECALL_TIMEOUT_MS: u64 = 30_000;

/// Thread id conventionally used for client-level (non-thread) state
pub const CLIENT_LEVEL_THREAD_ID: u64 = 0;
