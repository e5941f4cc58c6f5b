//! Tollgate - High-Throughput Multi-Tenant Rate Limiting
//!
//! This crate implements an in-process rate limiting engine built on
//! lock-free token buckets keyed by arbitrary strings. Each key carries
//! its own policy (fixed or sliding window, post-exhaustion cooldown,
//! penalty-driven capacity reduction), and limiters can optionally be
//! coordinated across processes through an external shared counter.
//!
//! The admit decision is a single compare-and-swap on the key's token
//! count; a request pins its key's policy with a shared slot lock, so
//! requests never serialize each other and a policy replacement is
//! atomic with respect to in-flight requests.
//!
//! ```
//! use tollgate::{Limit, RateLimiter};
//!
//! let limiter = RateLimiter::new(16384).unwrap();
//! limiter
//!     .create_limiter("api:search", Limit::new(100, 1_000).sliding())
//!     .unwrap();
//!
//! assert!(limiter.try_request("api:search", None));
//! ```

pub mod config;
pub mod error;
pub mod limiter;
pub mod storage;

mod access;
mod bucket;
mod clock;
mod stats;
mod table;

pub use config::{parse_duration_ms, LimiterSpec, PolicyConfig};
pub use error::{Error, Result};
pub use limiter::{Limit, RateLimitInfo, RateLimiter, DEFAULT_BUCKET_COUNT};
pub use stats::Stats;
pub use storage::{DistributedStorage, MemoryStorage, StorageError};
