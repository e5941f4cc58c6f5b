//! Per-key token bucket state machine.
//!
//! A bucket is one slot of the registry's table: a cache line of hot
//! atomics mutated with compare-and-swap on the request path, plus an
//! immutable policy snapshot swapped wholesale when the limiter is
//! recreated. The slot lock around the policy is the consistency
//! boundary: requests hold it shared for the whole bucket operation,
//! and [`Bucket::install`] holds it exclusive across both the policy
//! swap and the counter reset, so no reader can pair a new policy with
//! stale counters or vice versa. The refill engine and the
//! penalty-driven dynamic limit live here.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::storage::DistributedStorage;

/// Immutable policy parameters, fixed when a limiter is created.
#[derive(Debug, Clone)]
pub(crate) struct Policy {
    /// Identity; compared on probe hit
    pub key: String,
    /// Routing key in the external store; empty means local-only
    pub distributed_key: String,
    /// Configured capacity
    pub base_max_tokens: i64,
    /// Window length
    pub refill_ms: i64,
    /// Cooldown after exhaustion; 0 disables
    pub block_ms: i64,
    /// 0 disables penalty-driven reduction
    pub max_penalty_points: i64,
    /// false means fixed window
    pub sliding: bool,
}

/// Hot-path atomics, confined to a single cache line so concurrent
/// requests on one key touch exactly one line.
#[repr(align(64))]
#[derive(Debug)]
pub(crate) struct HotState {
    /// Current token count; the admit decision is the CAS decrement here
    pub tokens: AtomicI64,
    /// Last time a refill was applied, advanced by CAS
    pub last_refill_ms: AtomicI64,
    /// Cooldown deadline; 0 means not blocked
    pub block_until_ms: AtomicI64,
    /// Effective capacity after penalty reduction
    pub dynamic_max_tokens: AtomicI64,
    /// Accumulated abuse signal
    pub penalty_points: AtomicI64,
    /// Mixer output for the key; fast probe rejection
    pub hash: AtomicU32,
    /// Tombstone marker; published with release so a reader that sees
    /// true also sees the installed state
    pub valid: AtomicBool,
}

impl HotState {
    fn empty() -> Self {
        Self {
            tokens: AtomicI64::new(0),
            last_refill_ms: AtomicI64::new(0),
            block_until_ms: AtomicI64::new(0),
            dynamic_max_tokens: AtomicI64::new(0),
            penalty_points: AtomicI64::new(0),
            hash: AtomicU32::new(0),
            valid: AtomicBool::new(false),
        }
    }
}

/// One table slot: hot atomics first, cold policy snapshot second.
#[derive(Debug)]
pub(crate) struct Bucket {
    pub hot: HotState,
    pub policy: RwLock<Option<Arc<Policy>>>,
}

impl Bucket {
    pub fn empty() -> Self {
        Self {
            hot: HotState::empty(),
            policy: RwLock::new(None),
        }
    }

    /// Install a policy into this slot, resetting all counters.
    ///
    /// Used both for fresh inserts and for in-place replacement. The
    /// slot lock is held in exclusive mode for the whole transaction:
    /// an operation already inside the bucket finishes against the old
    /// state first, and one entering afterwards sees the new policy
    /// with fully reset counters, never a mix. The trailing release
    /// store of `valid` publishes the state to lock-free probes.
    pub fn install(&self, policy: Arc<Policy>, hash: u32, now_ms: i64) {
        let base = policy.base_max_tokens;
        let mut slot = self.policy.write();
        *slot = Some(policy);
        self.hot.hash.store(hash, Ordering::Relaxed);
        self.hot.tokens.store(base, Ordering::Relaxed);
        self.hot.last_refill_ms.store(now_ms, Ordering::Relaxed);
        self.hot.block_until_ms.store(0, Ordering::Relaxed);
        self.hot.penalty_points.store(0, Ordering::Relaxed);
        self.hot.dynamic_max_tokens.store(base, Ordering::Relaxed);
        self.hot.valid.store(true, Ordering::Release);
    }

    /// Tombstone this slot. Returns whether it held a valid entry.
    ///
    /// Holds the slot lock exclusively so in-flight operations drain
    /// before the entry disappears under them.
    pub fn invalidate(&self) -> bool {
        let mut slot = self.policy.write();
        let was_valid = self.hot.valid.swap(false, Ordering::AcqRel);
        if was_valid {
            *slot = None;
        }
        was_valid
    }

    /// Return the policy snapshot if this slot currently holds `key`.
    pub fn policy_for(&self, hash: u32, key: &str) -> Option<Arc<Policy>> {
        if self.hot.hash.load(Ordering::Relaxed) != hash {
            return None;
        }
        let guard = self.policy.read();
        match guard.as_ref() {
            Some(policy) if policy.key == key => Some(Arc::clone(policy)),
            _ => None,
        }
    }

    /// Check the cooldown, clearing it once elapsed.
    ///
    /// The winning clear also rewinds `last_refill_ms` by one window so
    /// the next refill is due immediately: a bucket leaves its cooldown
    /// with a fresh allowance rather than an empty window.
    pub fn blocked(&self, policy: &Policy, now_ms: i64) -> bool {
        let until = self.hot.block_until_ms.load(Ordering::Acquire);
        if until == 0 {
            return false;
        }
        if now_ms >= until {
            if self
                .hot
                .block_until_ms
                .compare_exchange(until, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.hot
                    .last_refill_ms
                    .store(now_ms - policy.refill_ms, Ordering::Release);
            }
            return false;
        }
        true
    }

    /// Apply fixed- or sliding-window refill.
    ///
    /// Idempotent and callable from any acquisition: the CAS on
    /// `last_refill_ms` elects a single winner per window boundary,
    /// which also syncs the shared counter when a distributed key is
    /// attached. Losers retry against the advanced timestamp and
    /// usually return on the next pass.
    pub fn refill(&self, policy: &Policy, now_ms: i64, storage: Option<&dyn DistributedStorage>) {
        loop {
            let last = self.hot.last_refill_ms.load(Ordering::Acquire);
            let elapsed = now_ms.saturating_sub(last).max(0);

            if elapsed < policy.refill_ms && !policy.sliding {
                return;
            }

            let dynamic = dynamic_limit(
                policy.base_max_tokens,
                policy.max_penalty_points,
                self.hot.penalty_points.load(Ordering::Acquire),
            );
            let current = self.hot.tokens.load(Ordering::Acquire);

            if policy.sliding {
                // Widen the product so long idle spans cannot overflow.
                let to_add = ((dynamic as i128 * elapsed as i128) / policy.refill_ms as i128)
                    .min(i64::MAX as i128) as i64;
                let proposed = current.saturating_add(to_add).min(dynamic);

                if self
                    .hot
                    .last_refill_ms
                    .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.hot.dynamic_max_tokens.store(dynamic, Ordering::Release);
                    self.hot.tokens.store(proposed, Ordering::Release);

                    if to_add > 0 && !policy.distributed_key.is_empty() {
                        if let Some(storage) = storage {
                            if let Err(e) = storage.release(&policy.distributed_key, to_add) {
                                debug!(
                                    key = %policy.key,
                                    error = %e,
                                    "sliding refill not synced to shared counter"
                                );
                            }
                        }
                    }
                    return;
                }
            } else if self
                .hot
                .last_refill_ms
                .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.hot.dynamic_max_tokens.store(dynamic, Ordering::Release);
                self.hot.tokens.store(dynamic, Ordering::Release);

                if !policy.distributed_key.is_empty() {
                    if let Some(storage) = storage {
                        if let Err(e) = storage.reset(&policy.distributed_key, dynamic) {
                            debug!(
                                key = %policy.key,
                                error = %e,
                                "fixed window reset not synced to shared counter"
                            );
                        }
                    }
                }
                return;
            }
        }
    }

    /// Shift the penalty accumulator by `delta` (floored at zero) and
    /// recompute the effective capacity. No-op when the policy has
    /// penalties disabled.
    pub fn apply_penalty(&self, policy: &Policy, delta: i64) {
        if policy.max_penalty_points <= 0 {
            return;
        }

        let mut current = self.hot.penalty_points.load(Ordering::Acquire);
        loop {
            let updated = current.saturating_add(delta).max(0);
            match self.hot.penalty_points.compare_exchange_weak(
                current,
                updated,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }

        let dynamic = dynamic_limit(
            policy.base_max_tokens,
            policy.max_penalty_points,
            self.hot.penalty_points.load(Ordering::Acquire),
        );
        self.hot.dynamic_max_tokens.store(dynamic, Ordering::Release);

        // A shrunken capacity must not leave a pre-penalty surplus
        // spendable before the next refill clamps it.
        loop {
            let tokens = self.hot.tokens.load(Ordering::Acquire);
            if tokens <= dynamic {
                break;
            }
            if self
                .hot
                .tokens
                .compare_exchange_weak(tokens, dynamic, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
    }
}

/// Effective capacity for a bucket carrying penalty points.
///
/// Each point reduces the base capacity by `base / max_penalty`;
/// the reduction is capped at 90% and the result never drops below
/// one tenth of the base (rounded up) or a single token.
pub(crate) fn dynamic_limit(base: i64, max_penalty: i64, points: i64) -> i64 {
    if base <= 0 || max_penalty <= 0 || points <= 0 {
        return base;
    }

    let points = points.min(max_penalty) as i128;
    let base_wide = base as i128;

    let reduction = (points * base_wide) / max_penalty as i128;
    let max_reduction = (base_wide * 9) / 10;
    let reduction = reduction.min(max_reduction);

    let min_limit = ((base_wide + 9) / 10).max(1);
    ((base_wide - reduction).max(min_limit)) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max: i64, refill_ms: i64) -> Policy {
        Policy {
            key: "k".to_string(),
            distributed_key: String::new(),
            base_max_tokens: max,
            refill_ms,
            block_ms: 0,
            max_penalty_points: 0,
            sliding: false,
        }
    }

    fn installed(policy: &Policy, now_ms: i64) -> Bucket {
        let bucket = Bucket::empty();
        bucket.install(Arc::new(policy.clone()), 7, now_ms);
        bucket
    }

    #[test]
    fn test_dynamic_limit_without_penalties() {
        assert_eq!(dynamic_limit(100, 0, 5), 100);
        assert_eq!(dynamic_limit(100, 10, 0), 100);
        assert_eq!(dynamic_limit(0, 10, 5), 0);
    }

    #[test]
    fn test_dynamic_limit_scales_with_points() {
        assert_eq!(dynamic_limit(100, 10, 5), 50);
        assert_eq!(dynamic_limit(100, 10, 3), 70);
    }

    #[test]
    fn test_dynamic_limit_reduction_caps_at_ninety_percent() {
        assert_eq!(dynamic_limit(100, 10, 10), 10);
        // Points beyond the maximum are ignored.
        assert_eq!(dynamic_limit(100, 10, 250), 10);
    }

    #[test]
    fn test_dynamic_limit_floor_is_at_least_one() {
        assert_eq!(dynamic_limit(5, 10, 10), 1);
        assert_eq!(dynamic_limit(1, 4, 4), 1);
    }

    #[test]
    fn test_fixed_refill_waits_for_window() {
        let p = policy(3, 1000);
        let bucket = installed(&p, 0);
        bucket.hot.tokens.store(0, Ordering::Relaxed);

        bucket.refill(&p, 999, None);
        assert_eq!(bucket.hot.tokens.load(Ordering::Relaxed), 0);

        bucket.refill(&p, 1000, None);
        assert_eq!(bucket.hot.tokens.load(Ordering::Relaxed), 3);
        assert_eq!(bucket.hot.last_refill_ms.load(Ordering::Relaxed), 1000);
    }

    #[test]
    fn test_sliding_refill_is_proportional() {
        let mut p = policy(10, 1000);
        p.sliding = true;
        let bucket = installed(&p, 0);
        bucket.hot.tokens.store(0, Ordering::Relaxed);

        bucket.refill(&p, 500, None);
        assert_eq!(bucket.hot.tokens.load(Ordering::Relaxed), 5);

        // Same instant again: nothing further accrues.
        bucket.refill(&p, 500, None);
        assert_eq!(bucket.hot.tokens.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn test_sliding_refill_clamps_to_dynamic_limit() {
        let mut p = policy(10, 1000);
        p.sliding = true;
        let bucket = installed(&p, 0);
        bucket.hot.tokens.store(8, Ordering::Relaxed);

        bucket.refill(&p, 5000, None);
        assert_eq!(bucket.hot.tokens.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn test_zero_capacity_never_accrues() {
        let mut p = policy(0, 1000);
        p.sliding = true;
        let bucket = installed(&p, 0);

        bucket.refill(&p, 10_000, None);
        assert_eq!(bucket.hot.tokens.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_block_clears_once_elapsed_and_arms_refill() {
        let p = policy(2, 1000);
        let bucket = installed(&p, 0);
        bucket.hot.tokens.store(0, Ordering::Relaxed);
        bucket.hot.block_until_ms.store(500, Ordering::Relaxed);

        assert!(bucket.blocked(&p, 250));
        assert_eq!(bucket.hot.block_until_ms.load(Ordering::Relaxed), 500);

        assert!(!bucket.blocked(&p, 550));
        assert_eq!(bucket.hot.block_until_ms.load(Ordering::Relaxed), 0);

        // The cleared cooldown made a refill due immediately.
        bucket.refill(&p, 550, None);
        assert_eq!(bucket.hot.tokens.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_penalty_updates_dynamic_limit() {
        let mut p = policy(100, 1000);
        p.max_penalty_points = 10;
        let bucket = installed(&p, 0);

        bucket.apply_penalty(&p, 5);
        assert_eq!(bucket.hot.dynamic_max_tokens.load(Ordering::Relaxed), 50);

        bucket.apply_penalty(&p, -7);
        assert_eq!(bucket.hot.penalty_points.load(Ordering::Relaxed), 0);
        assert_eq!(bucket.hot.dynamic_max_tokens.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn test_penalty_clamps_existing_tokens() {
        let mut p = policy(100, 1000);
        p.max_penalty_points = 10;
        let bucket = installed(&p, 0);
        assert_eq!(bucket.hot.tokens.load(Ordering::Relaxed), 100);

        bucket.apply_penalty(&p, 5);
        assert_eq!(bucket.hot.tokens.load(Ordering::Relaxed), 50);

        // Restoring capacity does not mint tokens back.
        bucket.apply_penalty(&p, -5);
        assert_eq!(bucket.hot.tokens.load(Ordering::Relaxed), 50);
    }

    #[test]
    fn test_penalty_noop_when_disabled() {
        let p = policy(100, 1000);
        let bucket = installed(&p, 0);

        bucket.apply_penalty(&p, 5);
        assert_eq!(bucket.hot.penalty_points.load(Ordering::Relaxed), 0);
        assert_eq!(bucket.hot.dynamic_max_tokens.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn test_invalidate_clears_policy() {
        let p = policy(1, 1000);
        let bucket = installed(&p, 0);

        assert!(bucket.invalidate());
        assert!(!bucket.invalidate());
        assert!(bucket.policy.read().is_none());
    }
}
