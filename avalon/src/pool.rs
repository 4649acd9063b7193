//! Generic growable pool of fixed-capacity sub-pools.
//!
//! Descriptor sets, queries and semaphores all follow the same recycling
//! scheme: entries are handed out from the current sub-pool until it runs dry,
//! freed entries only bump a per-pool counter plus a last-free serial, and a
//! sub-pool goes back into rotation once every entry was freed *and* its
//! last-free serial has completed. Freeing never makes capacity available
//! immediately; that keeps in-flight device references to the freed entries
//! valid.

use crate::{
    context::SubmissionTimeline,
    error::{Error, Result},
    serial::Serial,
};
use tracing::trace;

/// An arbitrary cap on growth. Reaching it means entries are leaking
/// somewhere up the stack, not that the workload legitimately needs this many
/// pools.
const MAX_POOLS: usize = 99999;

struct PoolSlot<P> {
    pool: P,
    /// Number of entries handed out from this pool that were freed again.
    freed_count: u32,
    /// Serial current at the time of the most recent free.
    last_free_serial: Serial,
}

pub struct GrowingPool<P> {
    pool_size: u32,
    current_pool: usize,
    current_free_entry: u32,
    pools: Vec<PoolSlot<P>>,
}

impl<P> GrowingPool<P> {
    /// `pool_size` is the fixed number of entries of every sub-pool.
    pub fn new(pool_size: u32) -> GrowingPool<P> {
        assert!(pool_size > 0);
        GrowingPool {
            pool_size,
            current_pool: 0,
            current_free_entry: 0,
            pools: Vec::new(),
        }
    }

    pub fn pool_size(&self) -> u32 {
        self.pool_size
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    pub fn pool(&self, index: usize) -> &P {
        &self.pools[index].pool
    }

    pub fn current_pool_index(&self) -> usize {
        self.current_pool
    }

    /// Hands out `count` consecutive entries from the current pool, or `None`
    /// if the pool is exhausted (or none was allocated yet) and the caller
    /// must [`grow`](GrowingPool::grow) first.
    pub fn allocate_entries(&mut self, count: u32) -> Option<(usize, u32)> {
        assert!(count <= self.pool_size);
        if self.pools.is_empty() || self.current_free_entry + count > self.pool_size {
            return None;
        }
        let first = self.current_free_entry;
        self.current_free_entry += count;
        Some((self.current_pool, first))
    }

    /// Makes a pool current again: either recycles an existing one whose
    /// entries were all freed and whose last-free serial has completed, or
    /// requests a new one from `allocate_pool`.
    ///
    /// When an existing pool is recycled, `reset_pool` is called on it before
    /// any entry is handed out again.
    pub fn grow(
        &mut self,
        timeline: &SubmissionTimeline,
        allocate_pool: impl FnOnce() -> Result<P>,
        reset_pool: impl FnOnce(&mut P) -> Result<()>,
    ) -> Result<()> {
        for (index, slot) in self.pools.iter_mut().enumerate() {
            if slot.freed_count == self.pool_size && !timeline.is_serial_in_use(slot.last_free_serial)
            {
                trace!(index, "recycling pool");
                slot.freed_count = 0;
                slot.last_free_serial = Serial::invalid();
                reset_pool(&mut slot.pool)?;
                self.current_pool = index;
                self.current_free_entry = 0;
                return Ok(());
            }
        }

        if self.pools.len() >= MAX_POOLS {
            return Err(Error::TooManyPools);
        }

        let pool = allocate_pool()?;
        self.pools.push(PoolSlot {
            pool,
            freed_count: 0,
            last_free_serial: Serial::invalid(),
        });
        self.current_pool = self.pools.len() - 1;
        self.current_free_entry = 0;
        trace!(pool_count = self.pools.len(), "allocated new pool");
        Ok(())
    }

    /// Marks one entry of `pool_index` as freed and stamps the current
    /// serial. The entry itself stays unusable until the pool is recycled.
    pub fn free_entry(&mut self, pool_index: usize, timeline: &SubmissionTimeline) {
        let slot = &mut self.pools[pool_index];
        slot.freed_count += 1;
        assert!(slot.freed_count <= self.pool_size);
        slot.last_free_serial = timeline.current_serial();
    }

    /// Writes off the never-handed-out remainder of the current pool. Used
    /// when the underlying pool reports exhaustion before the entry counter
    /// fills; without this, such a pool would never recycle.
    pub fn retire_current(&mut self, timeline: &SubmissionTimeline) {
        if self.pools.is_empty() {
            return;
        }
        let remainder = self.pool_size - self.current_free_entry;
        let slot = &mut self.pools[self.current_pool];
        slot.freed_count += remainder;
        slot.last_free_serial = timeline.current_serial();
        self.current_free_entry = self.pool_size;
    }

    /// Tears the pools down, invoking `destroy_pool` on each.
    pub fn destroy(&mut self, mut destroy_pool: impl FnMut(P)) {
        for slot in self.pools.drain(..) {
            destroy_pool(slot.pool);
        }
        self.current_pool = 0;
        self.current_free_entry = 0;
    }
}
