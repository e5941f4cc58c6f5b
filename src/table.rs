//! Open-addressed bucket table.
//!
//! Keys map to buckets through a 32-bit mixer and linear probing that
//! switches to a per-key stride once a walk exceeds eight slots. Removal
//! tombstones in place; inserts reclaim the earliest tombstone on their
//! probe path. The backing array is published as an `Arc` snapshot:
//! readers clone the handle, pin their bucket's policy with a shared
//! slot lock via [`BucketTable::with_entry`], and work on the atomics
//! inside, while a resize swaps in a doubled array and the reference
//! count keeps the old one alive for any in-flight request.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::bucket::{Bucket, Policy};
use crate::error::{Error, Result};

/// Tables never shrink below this many buckets.
pub(crate) const MIN_BUCKET_COUNT: usize = 1024;

/// Probes taken linearly before the walk switches to the key's stride.
const STRIDE_AFTER: usize = 8;

const HASH_SEED: u32 = 0x1234_5678;

/// Murmur-style 32-bit mixer with a fixed seed.
///
/// The low bits index the table; the high bits feed the probe stride,
/// so two keys that collide on the mask usually part ways after the
/// linear prefix.
pub(crate) fn mix32(key: &str) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let data = key.as_bytes();
    let mut h = HASH_SEED;

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);
        h ^= k;
        h = h.rotate_left(13);
        h = h.wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k = 0u32;
        for (i, &byte) in tail.iter().enumerate() {
            k ^= (byte as u32) << (i * 8);
        }
        k = k.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);
        h ^= k;
    }

    h ^= data.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

/// The probe walk shared by find, insert, and migration.
///
/// The stride is odd, so the post-linear phase alone visits every slot
/// of a power-of-two table; `MAX_PROBES = count + STRIDE_AFTER` is an
/// exhaustive walk.
struct ProbeSeq {
    idx: usize,
    probes: usize,
    stride: usize,
    mask: usize,
}

impl ProbeSeq {
    fn new(hash: u32, mask: usize) -> Self {
        Self {
            idx: hash as usize & mask,
            probes: 0,
            stride: ((hash >> 16) | 1) as usize,
            mask,
        }
    }

    fn advance(&mut self) {
        let step = if self.probes < STRIDE_AFTER {
            1
        } else {
            self.stride
        };
        self.idx = (self.idx + step) & self.mask;
        self.probes += 1;
    }
}

/// One published generation of the backing array.
pub(crate) struct Table {
    buckets: Box<[Bucket]>,
    mask: usize,
}

impl Table {
    fn with_capacity(count: usize) -> Result<Self> {
        let mut buckets = Vec::new();
        buckets
            .try_reserve_exact(count)
            .map_err(|_| Error::Saturated(count))?;
        for _ in 0..count {
            buckets.push(Bucket::empty());
        }
        Ok(Self {
            buckets: buckets.into_boxed_slice(),
            mask: count - 1,
        })
    }

    fn max_probes(&self) -> usize {
        self.buckets.len() + STRIDE_AFTER
    }
}

/// The registry's bucket store.
pub(crate) struct BucketTable {
    current: RwLock<Arc<Table>>,
    /// Serializes create/replace/remove/resize; the hot path never
    /// takes it.
    admin: Mutex<()>,
    entries: AtomicUsize,
}

impl BucketTable {
    /// Allocate a table of at least `bucket_count` slots, rounded up to
    /// a power of two and floored at [`MIN_BUCKET_COUNT`].
    pub fn new(bucket_count: usize) -> Result<Self> {
        let count = bucket_count.max(MIN_BUCKET_COUNT).next_power_of_two();
        let table = Table::with_capacity(count)?;
        Ok(Self {
            current: RwLock::new(Arc::new(table)),
            admin: Mutex::new(()),
            entries: AtomicUsize::new(0),
        })
    }

    fn snapshot(&self) -> Arc<Table> {
        self.current.read().clone()
    }

    /// Number of valid entries.
    pub fn len(&self) -> usize {
        self.entries.load(Ordering::Relaxed)
    }

    /// Current capacity of the backing array.
    pub fn bucket_count(&self) -> usize {
        self.snapshot().buckets.len()
    }

    /// Probe for `key` (stopping at the first invalid slot) and run `f`
    /// against its bucket. Returns `None` when the key is unknown.
    ///
    /// The slot lock is held in shared mode for the whole call, so `f`
    /// observes policy and hot counters from one committed install: a
    /// concurrent [`create_or_replace`](Self::create_or_replace) or
    /// [`remove`](Self::remove) on the same key waits for `f`, and its
    /// reset becomes visible only between operations, never inside one.
    /// Requests hold the lock shared and do not serialize each other.
    pub fn with_entry<R, F>(&self, key: &str, f: F) -> Option<R>
    where
        F: FnOnce(&Bucket, &Policy) -> R,
    {
        if key.is_empty() {
            return None;
        }

        let table = self.snapshot();
        let hash = mix32(key);
        let limit = table.max_probes();
        let mut seq = ProbeSeq::new(hash, table.mask);

        while seq.probes < limit {
            let bucket = &table.buckets[seq.idx];
            if !bucket.hot.valid.load(Ordering::Acquire) {
                return None;
            }
            if bucket.hot.hash.load(Ordering::Relaxed) == hash {
                let guard = bucket.policy.read();
                if let Some(policy) = guard.as_ref() {
                    // Re-check validity under the lock: a racing remove
                    // that already tombstoned this slot must not hand
                    // its carcass to `f`.
                    if policy.key == key && bucket.hot.valid.load(Ordering::Acquire) {
                        return Some(f(bucket, policy.as_ref()));
                    }
                }
            }
            seq.advance();
        }
        None
    }

    /// Install `policy` under its key, replacing in place when the key
    /// already exists and reclaiming the earliest tombstone otherwise.
    /// Grows the table when the walk finds neither.
    pub fn create_or_replace(&self, policy: Policy, now_ms: i64) -> Result<()> {
        let _admin = self.admin.lock();
        let hash = mix32(&policy.key);
        let policy = Arc::new(policy);

        loop {
            let table = self.snapshot();
            let limit = table.max_probes();
            let mut seq = ProbeSeq::new(hash, table.mask);
            let mut first_invalid = None;

            while seq.probes < limit {
                let bucket = &table.buckets[seq.idx];
                if !bucket.hot.valid.load(Ordering::Acquire) {
                    if first_invalid.is_none() {
                        first_invalid = Some(seq.idx);
                    }
                } else if bucket.policy_for(hash, &policy.key).is_some() {
                    bucket.install(Arc::clone(&policy), hash, now_ms);
                    debug!(key = %policy.key, "limiter replaced in place");
                    return Ok(());
                }
                seq.advance();
            }

            if let Some(index) = first_invalid {
                table.buckets[index].install(Arc::clone(&policy), hash, now_ms);
                self.entries.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }

            self.grow(&table)?;
        }
    }

    /// Tombstone `key`. Returns whether an entry was removed.
    pub fn remove(&self, key: &str) -> bool {
        let _admin = self.admin.lock();
        if key.is_empty() {
            return false;
        }

        let table = self.snapshot();
        let hash = mix32(key);
        let limit = table.max_probes();
        let mut seq = ProbeSeq::new(hash, table.mask);

        while seq.probes < limit {
            let bucket = &table.buckets[seq.idx];
            if !bucket.hot.valid.load(Ordering::Acquire) {
                return false;
            }
            if bucket.policy_for(hash, key).is_some() {
                if bucket.invalidate() {
                    self.entries.fetch_sub(1, Ordering::Relaxed);
                    debug!(key = %key, "limiter removed");
                    return true;
                }
                return false;
            }
            seq.advance();
        }
        false
    }

    /// Double the table and rehash every valid entry. Caller holds the
    /// admin lock, which makes this the single writer; the old array is
    /// freed by its reference count once the last in-flight reader
    /// drops it.
    fn grow(&self, old: &Table) -> Result<()> {
        let new_count = old.buckets.len() * 2;
        let new_table = Table::with_capacity(new_count)?;
        let mut moved = 0usize;

        for bucket in old.buckets.iter() {
            if !bucket.hot.valid.load(Ordering::Acquire) {
                continue;
            }
            let policy = match bucket.policy.read().as_ref() {
                Some(policy) => Arc::clone(policy),
                None => continue,
            };

            let hash = mix32(&policy.key);
            let mut seq = ProbeSeq::new(hash, new_table.mask);
            while new_table.buckets[seq.idx].hot.valid.load(Ordering::Relaxed) {
                seq.advance();
            }

            let target = &new_table.buckets[seq.idx];
            *target.policy.write() = Some(policy);
            target.hot.hash.store(hash, Ordering::Relaxed);
            target.hot.tokens.store(
                bucket.hot.tokens.load(Ordering::Acquire),
                Ordering::Relaxed,
            );
            target.hot.last_refill_ms.store(
                bucket.hot.last_refill_ms.load(Ordering::Acquire),
                Ordering::Relaxed,
            );
            target.hot.block_until_ms.store(
                bucket.hot.block_until_ms.load(Ordering::Acquire),
                Ordering::Relaxed,
            );
            target.hot.penalty_points.store(
                bucket.hot.penalty_points.load(Ordering::Acquire),
                Ordering::Relaxed,
            );
            target.hot.dynamic_max_tokens.store(
                bucket.hot.dynamic_max_tokens.load(Ordering::Acquire),
                Ordering::Relaxed,
            );
            target.hot.valid.store(true, Ordering::Release);
            moved += 1;
        }

        *self.current.write() = Arc::new(new_table);
        info!(
            from = old.buckets.len(),
            to = new_count,
            moved,
            "bucket table resized"
        );
        Ok(())
    }
}
