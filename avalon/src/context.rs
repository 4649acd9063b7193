//! Submission bookkeeping and deferred destruction.
//!
//! Recorded work is grouped into batches identified by a monotonically
//! increasing [`Serial`]. The [`SubmissionTimeline`] tracks the serial being
//! recorded and the last serial known complete on the device. Anything that
//! must outlive queued work goes through the [`GarbageList`] stamped with the
//! serial of the last batch that may touch it, and is destroyed once that
//! serial completes.
//!
//! Nothing here talks to a queue. Submitting batches and observing their
//! completion (fences, timeline semaphore waits) is up to the caller, who
//! reports back through [`Context::advance_serial`] and
//! [`Context::retire_serial`].

use crate::{
    descriptor::{DescriptorAllocatorId, DynamicDescriptorPool},
    device::Device,
    error::Result,
    ring::BackingStore,
    semaphore::{DynamicSemaphorePool, PooledSemaphore},
    serial::Serial,
};
use ash::{version::DeviceV1_0, vk};
use serde_json::json;
use slotmap::{Key, SlotMap};
use std::sync::Arc;
use tracing::{trace, trace_span};

/// Semaphores created per sub-pool of the context's semaphore pool.
const SEMAPHORE_POOL_SIZE: u32 = 64;

/// The serial being recorded and the last serial known complete.
///
/// Serial 0 is never assigned to a batch: it is the "never used" stamp, and
/// always counts as completed.
#[derive(Clone, Debug)]
pub struct SubmissionTimeline {
    current: Serial,
    completed: Serial,
}

impl SubmissionTimeline {
    pub fn new() -> SubmissionTimeline {
        SubmissionTimeline {
            current: Serial::from_raw(1),
            completed: Serial::invalid(),
        }
    }

    /// Serial stamped on work recorded now.
    pub fn current_serial(&self) -> Serial {
        self.current
    }

    /// Last serial the device is known to have finished.
    pub fn last_completed_serial(&self) -> Serial {
        self.completed
    }

    /// Closes the batch being recorded and starts the next one. Returns the
    /// serial of the closed batch, which the caller submits under.
    pub fn advance(&mut self) -> Serial {
        let submitted = self.current;
        self.current = Serial::from_raw(submitted.raw() + 1);
        submitted
    }

    /// Records that every batch up to and including `serial` has completed.
    ///
    /// Completion may be observed out of order; the completed mark only moves
    /// forward.
    pub fn retire(&mut self, serial: Serial) {
        assert!(
            serial.raw() < self.current.raw(),
            "retiring a serial that was never submitted"
        );
        if serial.raw() > self.completed.raw() {
            self.completed = serial;
        }
    }

    /// True while work stamped with `serial` may still be pending on the
    /// device. Always false for the invalid serial.
    pub fn is_serial_in_use(&self, serial: Serial) -> bool {
        serial.raw() > self.completed.raw()
    }
}

/// A resource handed off for deferred destruction.
pub enum Garbage {
    Buffer(vk::Buffer, Option<vk_mem::Allocation>),
    Image(vk::Image, Option<vk_mem::Allocation>),
    Store(BackingStore),
}

/// Resources waiting for their last-use serial to complete.
pub struct GarbageList {
    entries: Vec<(Serial, Garbage)>,
}

impl GarbageList {
    pub fn new() -> GarbageList {
        GarbageList {
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queues `garbage` for destruction once `serial` completes.
    pub fn discard(&mut self, serial: Serial, garbage: Garbage) {
        self.entries.push((serial, garbage));
    }

    /// Queues a ring store under the serial stamped on it.
    pub fn discard_store(&mut self, store: BackingStore) {
        let serial = store.serial();
        self.entries.push((serial, Garbage::Store(store)));
    }

    /// Hands every entry whose serial is at most `completed` to `destroy`,
    /// keeping the rest, in order.
    pub fn collect(&mut self, completed: Serial, mut destroy: impl FnMut(Garbage)) {
        let mut kept = Vec::with_capacity(self.entries.len());
        for (serial, garbage) in self.entries.drain(..) {
            if serial.raw() > completed.raw() {
                kept.push((serial, garbage));
            } else {
                destroy(garbage);
            }
        }
        self.entries = kept;
    }

    /// Hands every entry to `destroy` regardless of serial. Only valid once
    /// the device is idle.
    pub fn drain_all(&mut self, mut destroy: impl FnMut(Garbage)) {
        for (_, garbage) in self.entries.drain(..) {
            destroy(garbage);
        }
    }
}

fn destroy_garbage(device: &Device, garbage: Garbage) {
    match garbage {
        Garbage::Buffer(buffer, allocation) => device.destroy_buffer_raw(buffer, allocation),
        Garbage::Image(image, allocation) => device.destroy_image_raw(image, allocation),
        Garbage::Store(store) => {
            use crate::ring::StoreAllocator;
            device
                .destroy_store(store)
                .expect("failed to destroy ring store");
        }
    }
}

/// Owns the submission timeline, the garbage list and the recycling pools,
/// and drives deferred destruction.
pub struct Context {
    pub(crate) device: Arc<Device>,
    timeline: SubmissionTimeline,
    garbage: GarbageList,
    /// Descriptor allocators registered by layout owners.
    set_allocators: SlotMap<DescriptorAllocatorId, DynamicDescriptorPool>,
    semaphores: DynamicSemaphorePool,
}

impl Context {
    pub fn new() -> Context {
        Context::with_device(Device::new())
    }

    pub fn with_device(device: Device) -> Context {
        Context {
            device: Arc::new(device),
            timeline: SubmissionTimeline::new(),
            garbage: GarbageList::new(),
            set_allocators: SlotMap::with_key(),
            semaphores: DynamicSemaphorePool::new(SEMAPHORE_POOL_SIZE),
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn vulkan_device(&self) -> &ash::Device {
        &self.device.device
    }

    pub fn timeline(&self) -> &SubmissionTimeline {
        &self.timeline
    }

    /// Borrows the device, timeline and garbage list disjointly, for resource
    /// calls that take them together.
    pub fn split(&mut self) -> (&Arc<Device>, &SubmissionTimeline, &mut GarbageList) {
        (&self.device, &self.timeline, &mut self.garbage)
    }

    /// Closes the batch being recorded; the caller submits it under the
    /// returned serial.
    pub fn advance_serial(&mut self) -> Serial {
        self.timeline.advance()
    }

    /// Reports that every batch up to `serial` has completed, then destroys
    /// the garbage that became safe.
    pub fn retire_serial(&mut self, serial: Serial) {
        self.timeline.retire(serial);
        self.cleanup();
    }

    /// Destroys every garbage entry whose serial has completed.
    pub fn cleanup(&mut self) {
        let _span = trace_span!("cleanup", garbage = self.garbage.len()).entered();
        let device = &self.device;
        let completed = self.timeline.last_completed_serial();
        self.garbage
            .collect(completed, |garbage| destroy_garbage(device, garbage));
    }

    /// Registers a descriptor allocator for one set layout. `set_sizes`
    /// describes the descriptors of a single set.
    pub fn create_descriptor_allocator(
        &mut self,
        set_sizes: &[vk::DescriptorPoolSize],
        max_sets: u32,
    ) -> DescriptorAllocatorId {
        self.set_allocators
            .insert(DynamicDescriptorPool::new(set_sizes, max_sets))
    }

    /// Allocates `count` sets from a registered allocator. Returns the
    /// sub-pool index to pass back to
    /// [`free_descriptor_set`](Self::free_descriptor_set) for each set.
    pub fn allocate_descriptor_sets(
        &mut self,
        id: DescriptorAllocatorId,
        layout: vk::DescriptorSetLayout,
        count: u32,
        out: &mut Vec<vk::DescriptorSet>,
    ) -> Result<usize> {
        let allocator = self
            .set_allocators
            .get_mut(id)
            .expect("unknown descriptor allocator");
        allocator.allocate_sets(&self.device.device, &self.timeline, layout, count, out)
    }

    pub fn free_descriptor_set(&mut self, id: DescriptorAllocatorId, pool_index: usize) {
        let allocator = self
            .set_allocators
            .get_mut(id)
            .expect("unknown descriptor allocator");
        allocator.free_set(pool_index, &self.timeline);
    }

    /// Destroys a registered allocator and its pools. The caller guarantees
    /// no queued batch still uses sets from it.
    pub fn destroy_descriptor_allocator(&mut self, id: DescriptorAllocatorId) {
        if let Some(mut allocator) = self.set_allocators.remove(id) {
            trace!(id = ?id.data(), "destroying descriptor allocator");
            allocator.destroy(&self.device.device);
        }
    }

    pub fn allocate_semaphore(&mut self) -> Result<PooledSemaphore> {
        self.semaphores
            .allocate_semaphore(&self.device.device, &self.timeline)
    }

    pub fn free_semaphore(&mut self, semaphore: PooledSemaphore) {
        self.semaphores.free_semaphore(semaphore, &self.timeline);
    }

    /// Snapshot of the bookkeeping state as a JSON tree, for logging.
    pub fn dump(&self) -> serde_json::Value {
        let set_allocators_json: Vec<_> = self
            .set_allocators
            .iter()
            .map(|(id, allocator)| {
                json!({
                    "id": format!("{:?}", id.data()),
                    "maxSets": allocator.max_sets(),
                    "poolCount": allocator.pool_count(),
                })
            })
            .collect();

        json!({
            "currentSerial": self.timeline.current_serial().raw(),
            "lastCompletedSerial": self.timeline.last_completed_serial().raw(),
            "pendingGarbage": self.garbage.len(),
            "descriptorAllocators": set_allocators_json,
            "semaphoreSubPools": self.semaphores.pool_count(),
        })
    }

    /// Waits for the device to go idle, then destroys everything the context
    /// still owns, garbage regardless of serial included.
    pub fn destroy(mut self) -> Result<()> {
        unsafe { self.device.device.device_wait_idle()? };
        let device = self.device.clone();
        self.garbage
            .drain_all(|garbage| destroy_garbage(&device, garbage));
        for (_, mut allocator) in self.set_allocators.drain() {
            allocator.destroy(&device.device);
        }
        self.semaphores.destroy(&device.device);
        Ok(())
    }
}
