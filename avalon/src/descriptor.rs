//! Recycling descriptor-set allocation.
//!
//! A [`DynamicDescriptorPool`] serves descriptor sets of one fixed shape
//! (the per-set type counts given at construction) out of `vk::DescriptorPool`
//! objects of `max_sets` capacity each. Sets are never freed individually;
//! the owner reports each set's retirement and the whole pool is reset and
//! reused once every set came back and the device moved past the last
//! retirement.

use crate::{
    context::SubmissionTimeline,
    error::Result,
    pool::GrowingPool,
};
use ash::{version::DeviceV1_0, vk};

slotmap::new_key_type! {
    /// Key of a cached descriptor allocator in the [`Context`](crate::Context).
    pub struct DescriptorAllocatorId;
}

/// Matches the set count a typical frame allocates without growing.
pub const DEFAULT_DESCRIPTOR_POOL_MAX_SETS: u32 = 128;

pub struct DynamicDescriptorPool {
    pools: GrowingPool<vk::DescriptorPool>,
    /// Per-pool descriptor counts, already multiplied by `max_sets`.
    pool_sizes: Vec<vk::DescriptorPoolSize>,
}

impl DynamicDescriptorPool {
    /// `set_sizes` holds the descriptor counts of a single set; each count is
    /// scaled by `max_sets` to size the underlying pools.
    pub fn new(set_sizes: &[vk::DescriptorPoolSize], max_sets: u32) -> DynamicDescriptorPool {
        let pool_sizes = set_sizes
            .iter()
            .map(|size| vk::DescriptorPoolSize {
                ty: size.ty,
                descriptor_count: size.descriptor_count * max_sets,
            })
            .collect();
        DynamicDescriptorPool {
            pools: GrowingPool::new(max_sets),
            pool_sizes,
        }
    }

    pub fn max_sets(&self) -> u32 {
        self.pools.pool_size()
    }

    pub fn pool_count(&self) -> usize {
        self.pools.pool_count()
    }

    /// Allocates `count` sets with the given layout, growing (or recycling a
    /// fully retired pool) when the active pool is exhausted. Returns the
    /// index of the pool the sets came from, to be passed back to
    /// [`free_set`](Self::free_set) for each set.
    pub fn allocate_sets(
        &mut self,
        device: &ash::Device,
        timeline: &SubmissionTimeline,
        layout: vk::DescriptorSetLayout,
        count: u32,
        out: &mut Vec<vk::DescriptorSet>,
    ) -> Result<usize> {
        let mut retried = false;
        loop {
            let pool_index = match self.pools.allocate_entries(count) {
                Some((index, _)) => index,
                None => {
                    self.grow(device, timeline)?;
                    continue;
                }
            };

            let layouts = vec![layout; count as usize];
            let alloc_info = vk::DescriptorSetAllocateInfo {
                descriptor_pool: *self.pools.pool(pool_index),
                descriptor_set_count: count,
                p_set_layouts: layouts.as_ptr(),
                ..Default::default()
            };
            match unsafe { device.allocate_descriptor_sets(&alloc_info) } {
                Ok(sets) => {
                    out.extend_from_slice(&sets);
                    return Ok(pool_index);
                }
                Err(err) => {
                    // The failed entries were counted but never delivered;
                    // give them back so the pool can still recycle.
                    for _ in 0..count {
                        self.pools.free_entry(pool_index, timeline);
                    }
                    let pool_exhausted = err == vk::Result::ERROR_OUT_OF_POOL_MEMORY
                        || err == vk::Result::ERROR_FRAGMENTED_POOL;
                    if pool_exhausted && !retried {
                        // The driver ran dry before the set counter did
                        // (fragmentation). Write the pool off and move to a
                        // fresh one.
                        self.pools.retire_current(timeline);
                        retried = true;
                        continue;
                    }
                    return Err(err.into());
                }
            }
        }
    }

    /// Reports one set of `pool_index` as no longer needed. The set stays
    /// valid for the device until its pool is reset on recycling.
    pub fn free_set(&mut self, pool_index: usize, timeline: &SubmissionTimeline) {
        self.pools.free_entry(pool_index, timeline);
    }

    fn grow(&mut self, device: &ash::Device, timeline: &SubmissionTimeline) -> Result<()> {
        let pool_sizes = &self.pool_sizes;
        let max_sets = self.pools.pool_size();
        self.pools.grow(
            timeline,
            || {
                let create_info = vk::DescriptorPoolCreateInfo {
                    max_sets,
                    pool_size_count: pool_sizes.len() as u32,
                    p_pool_sizes: pool_sizes.as_ptr(),
                    ..Default::default()
                };
                let pool = unsafe { device.create_descriptor_pool(&create_info, None) }?;
                Ok(pool)
            },
            |pool| {
                unsafe { device.reset_descriptor_pool(*pool, Default::default()) }?;
                Ok(())
            },
        )
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        self.pools
            .destroy(|pool| unsafe { device.destroy_descriptor_pool(pool, None) });
    }
}
