//! Distributed storage contract for cluster-wide limits.
//!
//! The engine coordinates with an external shared counter through the
//! [`DistributedStorage`] trait. The engine is the caller; backends
//! (key/value stores, coordination services) are the implementers. Every
//! operation is fallible and the engine tolerates any of them failing by
//! degrading to local-only limiting, so backends should surface errors
//! rather than retry forever.

mod memory;

pub use memory::MemoryStorage;

use thiserror::Error;

/// Errors surfaced by a distributed storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend cannot be reached at all
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A single operation failed; later operations may succeed
    #[error("storage operation failed: {0}")]
    Operation(String),
}

/// A shared token counter reachable from every node enforcing the same
/// limit.
///
/// All three operations must be atomic with respect to the counter,
/// either natively, via compare-and-swap with retry, or via a
/// server-side script. Implementations may block on network I/O; the
/// engine confines that latency to the calling request and treats
/// internal timeouts as errors.
pub trait DistributedStorage: Send + Sync {
    /// Claim one token from the shared counter.
    ///
    /// A counter that has never been seen is initialized to
    /// `max_tokens` first. Returns whether a token was claimed.
    fn try_acquire(&self, key: &str, max_tokens: i64) -> Result<bool, StorageError>;

    /// Return `tokens` tokens to the shared counter.
    fn release(&self, key: &str, tokens: i64) -> Result<(), StorageError>;

    /// Set the shared counter to `max_tokens`.
    ///
    /// Called at fixed-window refill boundaries so every node observes
    /// the fresh allowance.
    fn reset(&self, key: &str, max_tokens: i64) -> Result<(), StorageError>;
}
