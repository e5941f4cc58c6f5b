//! Core rate limiter implementation.
//!
//! The [`RateLimiter`] owns the bucket table, the allow/deny lists, the
//! request counters, and (optionally) a distributed backend. Every
//! public operation routes through it; the admit decision itself is a
//! lock-free compare-and-swap on the key's token count.

use std::sync::atomic::Ordering;

use tracing::{debug, info, trace};

use crate::access::AccessLists;
use crate::bucket::Policy;
use crate::clock::Clock;
use crate::config::PolicyConfig;
use crate::error::{Error, Result};
use crate::stats::{Counters, Stats};
use crate::storage::{DistributedStorage, StorageError};
use crate::table::BucketTable;

/// Default bucket table capacity.
pub const DEFAULT_BUCKET_COUNT: usize = 16384;

/// Policy parameters for one limiter key.
#[derive(Debug, Clone)]
pub struct Limit {
    /// Maximum tokens in the bucket
    pub max_tokens: i64,
    /// Window over which the bucket regenerates, in milliseconds
    pub refill_ms: i64,
    /// Refill proportionally to elapsed time instead of per window
    pub sliding: bool,
    /// Cooldown applied after exhaustion, in milliseconds; 0 disables
    pub block_ms: i64,
    /// Penalty points at which the capacity reduction bottoms out;
    /// 0 disables penalties
    pub max_penalty: i64,
    /// Routing key in the shared counter; empty keeps the limiter local
    pub distributed_key: String,
}

impl Limit {
    /// A fixed-window limit of `max_tokens` per `refill_ms`.
    pub fn new(max_tokens: i64, refill_ms: i64) -> Self {
        Self {
            max_tokens,
            refill_ms,
            sliding: false,
            block_ms: 0,
            max_penalty: 0,
            distributed_key: String::new(),
        }
    }

    /// Switch to sliding-window refill.
    pub fn sliding(mut self) -> Self {
        self.sliding = true;
        self
    }

    /// Deny all requests for `block_ms` after the bucket empties.
    pub fn with_block_ms(mut self, block_ms: i64) -> Self {
        self.block_ms = block_ms;
        self
    }

    /// Enable penalty-driven capacity reduction.
    pub fn with_max_penalty(mut self, max_penalty: i64) -> Self {
        self.max_penalty = max_penalty;
        self
    }

    /// Coordinate this limiter through the shared counter under `key`.
    pub fn with_distributed_key(mut self, key: impl Into<String>) -> Self {
        self.distributed_key = key.into();
        self
    }
}

/// Snapshot of one key's limit state, shaped for rate-limit response
/// headers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitInfo {
    /// Current effective capacity
    pub limit: i64,
    /// Tokens left in the window (0 while blocked)
    pub remaining: i64,
    /// When the window resets, in the registry's millisecond timebase
    pub reset_ms: i64,
    /// Whether the key is in a post-exhaustion cooldown
    pub blocked: bool,
    /// Whole seconds until the cooldown lifts
    pub retry_after_s: i64,
}

/// The rate limiter registry.
///
/// Thread-safe; share it behind an `Arc`. Requests mutate bucket state
/// with compare-and-swap and hold only a shared per-slot lock, so they
/// never serialize each other; a policy replacement for the same key
/// waits for in-flight requests to finish rather than tearing their
/// view of the bucket.
pub struct RateLimiter {
    table: BucketTable,
    clock: Clock,
    storage: Option<Box<dyn DistributedStorage>>,
    access: AccessLists,
    counters: Counters,
}

impl RateLimiter {
    /// Create a registry with at least `bucket_count` buckets (rounded
    /// up to a power of two, floored at 1024). Limiters created here
    /// are purely local.
    pub fn new(bucket_count: usize) -> Result<Self> {
        Self::build(bucket_count, None)
    }

    /// Create a registry that coordinates distributed-keyed limiters
    /// through `storage`.
    pub fn with_storage(bucket_count: usize, storage: Box<dyn DistributedStorage>) -> Result<Self> {
        Self::build(bucket_count, Some(storage))
    }

    /// Create a registry whose backend is produced by a fallible
    /// builder (a connection attempt, typically).
    ///
    /// A builder failure surfaces as [`Error::Backend`] and prevents
    /// registry construction; it is never degraded to local-only the
    /// way mid-flight backend errors are.
    pub fn try_with_storage<F>(bucket_count: usize, builder: F) -> Result<Self>
    where
        F: FnOnce() -> std::result::Result<Box<dyn DistributedStorage>, StorageError>,
    {
        let storage = builder().map_err(|e| Error::Backend(e.to_string()))?;
        Self::build(bucket_count, Some(storage))
    }

    fn build(bucket_count: usize, storage: Option<Box<dyn DistributedStorage>>) -> Result<Self> {
        let table = BucketTable::new(bucket_count)?;
        info!(
            bucket_count = table.bucket_count(),
            distributed = storage.is_some(),
            "rate limiter initialized"
        );
        Ok(Self {
            table,
            clock: Clock::new(),
            storage,
            access: AccessLists::new(),
            counters: Counters::new(),
        })
    }

    /// Milliseconds elapsed on the registry's clock. All `_at` variants
    /// and [`RateLimitInfo::reset_ms`] use this timebase.
    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Install (or atomically replace) the limiter for `key`.
    ///
    /// Replacement resets the bucket to the new capacity and clears
    /// penalties and cooldowns.
    pub fn create_limiter(&self, key: &str, limit: Limit) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("key cannot be empty".to_string()));
        }
        if limit.max_tokens < 0 {
            return Err(Error::InvalidArgument(
                "max_tokens cannot be negative".to_string(),
            ));
        }
        if limit.refill_ms <= 0 {
            return Err(Error::InvalidArgument(
                "refill_ms must be positive".to_string(),
            ));
        }
        if limit.block_ms < 0 {
            return Err(Error::InvalidArgument(
                "block_ms cannot be negative".to_string(),
            ));
        }
        if limit.max_penalty < 0 {
            return Err(Error::InvalidArgument(
                "max_penalty cannot be negative".to_string(),
            ));
        }

        debug!(
            key = %key,
            max_tokens = limit.max_tokens,
            refill_ms = limit.refill_ms,
            sliding = limit.sliding,
            "creating limiter"
        );

        let policy = Policy {
            key: key.to_string(),
            distributed_key: limit.distributed_key,
            base_max_tokens: limit.max_tokens,
            refill_ms: limit.refill_ms,
            block_ms: limit.block_ms,
            max_penalty_points: limit.max_penalty,
            sliding: limit.sliding,
        };
        self.table.create_or_replace(policy, self.clock.now_ms())
    }

    /// Drop the limiter for `key`. No-op when the key is unknown.
    pub fn remove_limiter(&self, key: &str) {
        self.table.remove(key);
    }

    /// Install every limiter a policy document declares.
    pub fn apply_config(&self, config: &PolicyConfig) -> Result<()> {
        for spec in &config.limiters {
            let limit = spec.to_limit()?;
            self.create_limiter(&spec.key, limit)?;
        }
        info!(count = config.limiters.len(), "policy configuration applied");
        Ok(())
    }

    /// Decide whether one request under `key` may proceed.
    ///
    /// `client_id`, when present, is checked against the deny list
    /// (veto) and then the allow list (bypass) before any bucket work.
    /// Unknown keys are denied.
    pub fn try_request(&self, key: &str, client_id: Option<&str>) -> bool {
        self.try_request_at(key, client_id, self.clock.now_ms())
    }

    /// [`try_request`](Self::try_request) at an explicit timestamp on
    /// the registry's timebase.
    pub fn try_request_at(&self, key: &str, client_id: Option<&str>, now_ms: i64) -> bool {
        self.counters.record_request();

        if let Some(client_id) = client_id {
            if self.access.is_denied(client_id) {
                debug!(client_id = %client_id, "request vetoed by deny list");
                self.counters.record_blocked();
                return false;
            }
            if self.access.is_allowed(client_id) {
                self.counters.record_allowed();
                return true;
            }
        }

        let decision = self.table.with_entry(key, |bucket, policy| {
            if bucket.blocked(policy, now_ms) {
                trace!(key = %key, "key is cooling down");
                self.counters.record_blocked();
                return false;
            }

            bucket.refill(policy, now_ms, self.storage.as_deref());

            // Two-phase acquire: claim a shared token first, then a
            // local one. A backend error degrades to local-only.
            let mut distributed_token = false;
            if !policy.distributed_key.is_empty() {
                if let Some(storage) = self.storage.as_deref() {
                    let max = bucket.hot.dynamic_max_tokens.load(Ordering::Acquire);
                    match storage.try_acquire(&policy.distributed_key, max) {
                        Ok(true) => distributed_token = true,
                        Ok(false) => {
                            debug!(key = %key, "shared counter exhausted");
                            self.counters.record_blocked();
                            return false;
                        }
                        Err(e) => {
                            debug!(
                                key = %key,
                                error = %e,
                                "backend unavailable, using local limit only"
                            );
                        }
                    }
                }
            }

            loop {
                let current = bucket.hot.tokens.load(Ordering::Acquire);
                if current <= 0 {
                    // Repair the shared counter before arming the cooldown.
                    if distributed_token {
                        if let Some(storage) = self.storage.as_deref() {
                            if let Err(e) = storage.release(&policy.distributed_key, 1) {
                                debug!(key = %key, error = %e, "compensating release failed");
                            }
                        }
                    }
                    if policy.block_ms > 0 {
                        bucket
                            .hot
                            .block_until_ms
                            .store(now_ms + policy.block_ms, Ordering::Release);
                    }
                    debug!(key = %key, "bucket exhausted");
                    self.counters.record_blocked();
                    return false;
                }
                if bucket
                    .hot
                    .tokens
                    .compare_exchange_weak(
                        current,
                        current - 1,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    trace!(key = %key, remaining = current - 1, "request admitted");
                    self.counters.record_allowed();
                    if bucket.hot.penalty_points.load(Ordering::Relaxed) > 0 {
                        self.counters.record_penalized();
                    }
                    return true;
                }
            }
        });

        match decision {
            Some(admitted) => admitted,
            None => {
                debug!(key = %key, "no limiter for key");
                self.counters.record_blocked();
                false
            }
        }
    }

    /// Add penalty points to `key`, shrinking its effective capacity.
    /// Negative values clamp the accumulator at zero. No-op when the
    /// key is unknown or its policy has penalties disabled.
    pub fn add_penalty(&self, key: &str, points: i64) {
        let applied = self
            .table
            .with_entry(key, |bucket, policy| bucket.apply_penalty(policy, points));
        if applied.is_some() {
            debug!(key = %key, points, "penalty added");
        }
    }

    /// Remove penalty points from `key`, restoring capacity. The
    /// accumulator floors at zero.
    pub fn remove_penalty(&self, key: &str, points: i64) {
        let applied = self
            .table
            .with_entry(key, |bucket, policy| bucket.apply_penalty(policy, -points));
        if applied.is_some() {
            debug!(key = %key, points, "penalty removed");
        }
    }

    /// Current token count for `key`, or -1 when the key is unknown.
    pub fn get_tokens(&self, key: &str) -> i64 {
        self.table
            .with_entry(key, |bucket, _| bucket.hot.tokens.load(Ordering::Acquire))
            .unwrap_or(-1)
    }

    /// Current effective capacity for `key` (after penalty reduction),
    /// or -1 when the key is unknown.
    pub fn get_current_limit(&self, key: &str) -> i64 {
        self.table
            .with_entry(key, |bucket, _| {
                bucket.hot.dynamic_max_tokens.load(Ordering::Acquire)
            })
            .unwrap_or(-1)
    }

    /// Snapshot of `key`'s limit state. Unknown keys yield the zero
    /// snapshot with `blocked == false`.
    pub fn get_rate_limit_info(&self, key: &str) -> RateLimitInfo {
        self.get_rate_limit_info_at(key, self.clock.now_ms())
    }

    /// [`get_rate_limit_info`](Self::get_rate_limit_info) at an
    /// explicit timestamp.
    pub fn get_rate_limit_info_at(&self, key: &str, now_ms: i64) -> RateLimitInfo {
        self.table
            .with_entry(key, |bucket, policy| {
                let blocked = bucket.blocked(policy, now_ms);
                bucket.refill(policy, now_ms, self.storage.as_deref());

                let limit = bucket.hot.dynamic_max_tokens.load(Ordering::Acquire);
                let remaining = if blocked {
                    0
                } else {
                    bucket.hot.tokens.load(Ordering::Acquire).max(0)
                };
                let retry_after_s = if blocked {
                    let until = bucket.hot.block_until_ms.load(Ordering::Acquire);
                    (until - now_ms).max(0) / 1000
                } else {
                    0
                };
                let reset_ms = bucket.hot.last_refill_ms.load(Ordering::Acquire) + policy.refill_ms;

                RateLimitInfo {
                    limit,
                    remaining,
                    reset_ms,
                    blocked,
                    retry_after_s,
                }
            })
            .unwrap_or_default()
    }

    /// Number of installed limiters.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.len() == 0
    }

    /// Capacity of the bucket table.
    pub fn bucket_count(&self) -> usize {
        self.table.bucket_count()
    }

    pub fn add_to_whitelist(&self, client_id: &str) {
        self.access.allow_insert(client_id);
    }

    pub fn remove_from_whitelist(&self, client_id: &str) {
        self.access.allow_remove(client_id);
    }

    pub fn is_whitelisted(&self, client_id: &str) -> bool {
        self.access.is_allowed(client_id)
    }

    pub fn add_to_blacklist(&self, client_id: &str) {
        self.access.deny_insert(client_id);
    }

    pub fn remove_from_blacklist(&self, client_id: &str) {
        self.access.deny_remove(client_id);
    }

    pub fn is_blacklisted(&self, client_id: &str) -> bool {
        self.access.is_denied(client_id)
    }

    /// Snapshot of the request counters with derived rates.
    pub fn get_stats(&self) -> Stats {
        self.counters.snapshot()
    }

    /// Zero all request counters.
    pub fn reset_stats(&self) {
        self.counters.reset();
    }
}
