//! Buffer resources and per-buffer access tracking.
//!
//! Vulkan leaves write-after-write and read-after-write hazards on buffers to
//! the application. [`AccessTracker`] keeps the two access masks that decide
//! whether the next use needs a memory barrier; [`BufferResource`] bundles the
//! tracker with the native handle and its allocation.

use crate::{
    command::CommandEncoder,
    context::{Garbage, GarbageList, SubmissionTimeline},
    device::Device,
    error::Result,
    handle::UniqueHandle,
};
use ash::vk;
use std::ptr;

/// Most recent read and write access masks recorded against one buffer.
///
/// `on_access` is the whole contract: a barrier is needed iff any access was
/// recorded before, the source mask is the previous write mask only (prior
/// reads are ordered by execution alone and flush nothing), and the
/// destination mask is the union of the new masks. The tracked state is
/// replaced unconditionally.
#[derive(Copy, Clone, Debug, Default)]
pub struct AccessTracker {
    read: vk::AccessFlags,
    write: vk::AccessFlags,
}

impl AccessTracker {
    pub fn new() -> AccessTracker {
        AccessTracker::default()
    }

    pub fn current_read(&self) -> vk::AccessFlags {
        self.read
    }

    pub fn current_write(&self) -> vk::AccessFlags {
        self.write
    }

    /// Records an access and returns the `(src_access_mask, dst_access_mask)`
    /// of the barrier that must precede it, if one is needed.
    pub fn on_access(
        &mut self,
        read: vk::AccessFlags,
        write: vk::AccessFlags,
    ) -> Option<(vk::AccessFlags, vk::AccessFlags)> {
        let needs_barrier = !self.read.is_empty() || !self.write.is_empty();
        let src = self.write;
        let dst = read | write;
        self.read = read;
        self.write = write;
        if needs_barrier {
            Some((src, dst))
        } else {
            None
        }
    }
}

/// A buffer with its memory and access-tracking state.
pub struct BufferResource {
    buffer: UniqueHandle<vk::Buffer>,
    allocation: Option<vk_mem::Allocation>,
    size: u64,
    mapped: *mut u8,
    tracker: AccessTracker,
    /// Externally owned handle; destruction leaves it alone.
    weak: bool,
}

impl BufferResource {
    pub fn new(
        device: &Device,
        size: u64,
        usage: vk::BufferUsageFlags,
        host_visible: bool,
    ) -> Result<BufferResource> {
        let alloc = device.create_buffer_raw(size, usage, host_visible)?;
        Ok(BufferResource {
            buffer: UniqueHandle::new(alloc.handle),
            allocation: Some(alloc.allocation),
            size,
            mapped: alloc.mapped,
            tracker: AccessTracker::new(),
            weak: false,
        })
    }

    /// Wraps a buffer owned elsewhere; only the access state is tracked.
    pub fn from_raw(buffer: vk::Buffer, size: u64) -> BufferResource {
        BufferResource {
            buffer: UniqueHandle::new(buffer),
            allocation: None,
            size,
            mapped: ptr::null_mut(),
            tracker: AccessTracker::new(),
            weak: true,
        }
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.buffer.get()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Persistent mapping, null unless created host-visible.
    pub fn mapped_ptr(&self) -> *mut u8 {
        self.mapped
    }

    pub fn tracker(&self) -> &AccessTracker {
        &self.tracker
    }

    /// Records an access and emits the required global memory barrier through
    /// `encoder`.
    pub fn record_access<E: CommandEncoder>(
        &mut self,
        encoder: &mut E,
        read: vk::AccessFlags,
        write: vk::AccessFlags,
    ) {
        if let Some((src, dst)) = self.tracker.on_access(read, write) {
            let barrier = vk::MemoryBarrier {
                src_access_mask: src,
                dst_access_mask: dst,
                ..Default::default()
            };
            encoder.memory_barrier(
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::ALL_COMMANDS,
                &barrier,
            );
        }
    }

    /// Copies `regions` from `src` into this buffer, emitting at most one
    /// memory barrier merged from both buffers' tracked accesses.
    pub fn copy_from<E: CommandEncoder>(
        &mut self,
        encoder: &mut E,
        src: &mut BufferResource,
        regions: &[vk::BufferCopy],
    ) {
        let read_barrier = src
            .tracker
            .on_access(vk::AccessFlags::TRANSFER_READ, vk::AccessFlags::empty());
        let write_barrier = self
            .tracker
            .on_access(vk::AccessFlags::empty(), vk::AccessFlags::TRANSFER_WRITE);

        if read_barrier.is_some() || write_barrier.is_some() {
            let (src_a, dst_a) = read_barrier.unwrap_or_default();
            let (src_b, dst_b) = write_barrier.unwrap_or_default();
            let barrier = vk::MemoryBarrier {
                src_access_mask: src_a | src_b,
                dst_access_mask: dst_a | dst_b,
                ..Default::default()
            };
            encoder.memory_barrier(
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::TRANSFER,
                &barrier,
            );
        }

        encoder.copy_buffer(src.buffer(), self.buffer(), regions);
    }

    /// Retires the buffer through the garbage list under the current serial.
    pub fn release(mut self, timeline: &SubmissionTimeline, garbage: &mut GarbageList) {
        let buffer = self.buffer.take();
        if self.weak {
            return;
        }
        garbage.discard(
            timeline.current_serial(),
            Garbage::Buffer(buffer, self.allocation.take()),
        );
    }

    /// Destroys the buffer immediately. Only valid once the device is idle.
    pub fn destroy(mut self, device: &Device) {
        let buffer = self.buffer.take();
        if self.weak {
            return;
        }
        device.destroy_buffer_raw(buffer, self.allocation.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_access_needs_no_barrier() {
        let mut t = AccessTracker::new();
        assert_eq!(
            t.on_access(vk::AccessFlags::SHADER_READ, vk::AccessFlags::empty()),
            None
        );
        assert_eq!(t.current_read(), vk::AccessFlags::SHADER_READ);
    }

    #[test]
    fn write_after_read_orders_without_flush() {
        let mut t = AccessTracker::new();
        t.on_access(vk::AccessFlags::INDEX_READ, vk::AccessFlags::empty());
        let (src, dst) = t
            .on_access(vk::AccessFlags::empty(), vk::AccessFlags::TRANSFER_WRITE)
            .unwrap();
        assert_eq!(src, vk::AccessFlags::empty());
        assert_eq!(dst, vk::AccessFlags::TRANSFER_WRITE);
    }

    #[test]
    fn read_after_write_flushes_the_write() {
        let mut t = AccessTracker::new();
        t.on_access(vk::AccessFlags::empty(), vk::AccessFlags::TRANSFER_WRITE);
        let (src, dst) = t
            .on_access(vk::AccessFlags::VERTEX_ATTRIBUTE_READ, vk::AccessFlags::empty())
            .unwrap();
        assert_eq!(src, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(dst, vk::AccessFlags::VERTEX_ATTRIBUTE_READ);
    }

    #[test]
    fn state_is_replaced_not_accumulated() {
        let mut t = AccessTracker::new();
        t.on_access(vk::AccessFlags::SHADER_READ, vk::AccessFlags::SHADER_WRITE);
        t.on_access(vk::AccessFlags::TRANSFER_READ, vk::AccessFlags::empty());
        assert_eq!(t.current_read(), vk::AccessFlags::TRANSFER_READ);
        assert_eq!(t.current_write(), vk::AccessFlags::empty());
        // The shader write was already flushed by the previous barrier.
        let (src, _) = t
            .on_access(vk::AccessFlags::empty(), vk::AccessFlags::TRANSFER_WRITE)
            .unwrap();
        assert_eq!(src, vk::AccessFlags::empty());
    }
}
