//! Bounded sketch allocator
//!
//! Every sketch the estimator creates goes through an [`Allocator`]. It is
//! the single admission-control point that keeps sketch memory bounded: once
//! `inuse` reaches `max`, further allocations fail with
//! [`Error::MaxHllsInUse`] until the owning estimator is reset.
//!
//! Sketches are never released individually. They live until the estimator
//! resets, at which point a fresh allocator replaces this one.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};
use crate::metrics;

use super::hll::{Sketch, DEFAULT_PRECISION};

/// Size of an encoded allocator record in bytes
pub const RECORD_SIZE: usize = 24;

/// Point-in-time view of allocator counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocatorStats {
    /// Capacity ceiling
    pub max: u64,
    /// Sketches currently live
    pub inuse: u64,
    /// Sketches ever created (monotonic)
    pub created: u64,
}

impl AllocatorStats {
    /// Encode as a flat `[max][inuse][created]` record
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_le(self.max);
        buf.put_u64_le(self.inuse);
        buf.put_u64_le(self.created);
    }

    /// Decode a record written by [`AllocatorStats::encode`]
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < RECORD_SIZE {
            return Err(Error::Decode(format!(
                "allocator: expected {} bytes, got {}",
                RECORD_SIZE,
                buf.remaining()
            )));
        }
        Ok(Self {
            max: buf.get_u64_le(),
            inuse: buf.get_u64_le(),
            created: buf.get_u64_le(),
        })
    }
}

/// Bounded factory for HyperLogLog sketches
///
/// `inuse <= max` holds at all times: admission is granted only through a
/// successful compare-and-swap increment, so concurrent callers cannot both
/// pass a check and then overshoot the ceiling.
#[derive(Debug)]
pub struct Allocator {
    /// Capacity ceiling (only changes on merge)
    max: AtomicU64,
    /// Live sketches
    inuse: AtomicU64,
    /// Sketches ever created
    created: AtomicU64,
}

impl Allocator {
    /// Create an allocator admitting at most `max` sketches
    pub fn new(max: u64) -> Self {
        Self {
            max: AtomicU64::new(max),
            inuse: AtomicU64::new(0),
            created: AtomicU64::new(0),
        }
    }

    /// Restore an allocator from serialized counters
    pub fn from_stats(stats: AllocatorStats) -> Self {
        Self {
            max: AtomicU64::new(stats.max),
            inuse: AtomicU64::new(stats.inuse),
            created: AtomicU64::new(stats.created),
        }
    }

    /// Allocate a new empty sketch
    ///
    /// # Errors
    ///
    /// Returns [`Error::MaxHllsInUse`] when `inuse >= max`.
    pub fn allocate(&self) -> Result<Sketch> {
        let max = self.max.load(Ordering::Acquire);

        self.inuse
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |inuse| {
                if inuse < max {
                    Some(inuse + 1)
                } else {
                    None
                }
            })
            .map_err(|_| {
                metrics::HLL_ALLOCATIONS_DENIED.inc();
                Error::MaxHllsInUse { max }
            })?;

        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(Sketch::new(DEFAULT_PRECISION))
    }

    /// Sketches currently live
    pub fn inuse(&self) -> u64 {
        self.inuse.load(Ordering::Acquire)
    }

    /// Sketches ever created
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Capacity ceiling
    pub fn max(&self) -> u64 {
        self.max.load(Ordering::Acquire)
    }

    /// Snapshot of all three counters
    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            max: self.max(),
            inuse: self.inuse(),
            created: self.created(),
        }
    }

    /// Fold another allocator's accounting into this one
    ///
    /// `inuse` and `max` take the larger side, `created` sums. The caller must
    /// have exclusive access to both allocators; the three updates are not
    /// atomic as a group.
    pub fn merge(&self, other: &Allocator) {
        let other = other.stats();
        self.inuse.fetch_max(other.inuse, Ordering::AcqRel);
        self.created.fetch_add(other.created, Ordering::Relaxed);
        self.max.fetch_max(other.max, Ordering::AcqRel);
    }
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new(u64::MAX)
    }
}
