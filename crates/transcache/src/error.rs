//! Error types for transcache

use thiserror::Error;

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the cloning read path.
///
/// Every other operation reports presence through its return value; absent
/// partitions and absent items are negative results, not errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// Item or partition not present
    #[error("item not found")]
    NotFound,

    /// Cached value does not carry the clone capability
    #[error("item not clonable")]
    NotClonable,

    /// A value's clone implementation failed
    #[error("clone failed: {0}")]
    CloneFailed(String),
}
