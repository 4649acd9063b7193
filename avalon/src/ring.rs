//! Suballocating ring buffer for transient per-frame data.
//!
//! A [`RingBuffer`] bump-allocates small spans out of a large backing store.
//! When a store fills up it is stamped with the current submission serial and
//! set aside, and a fresh store takes its place. Retired stores come back
//! through a free list once their serial completes, so the steady state is a
//! handful of stores cycling without further device allocations.
//!
//! Device work is abstracted behind [`StoreAllocator`] so the ring logic can
//! run against a mock in tests.

use crate::{
    context::{GarbageList, SubmissionTimeline},
    error::{Error, Result},
    handle::UniqueHandle,
    serial::Serial,
};
use ash::vk;
use std::ptr;
use tracing::trace;

/// Creates, maps and destroys the backing stores of a ring buffer.
///
/// Implemented by [`Device`](crate::Device) for real allocations. The ring
/// never talks to vulkan directly.
pub trait StoreAllocator {
    fn create_store(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        host_visible: bool,
    ) -> Result<BackingStore>;

    /// Maps the store and records the pointer in it.
    fn map_store(&self, store: &mut BackingStore) -> Result<()>;

    /// Unmaps the store and clears its pointer.
    fn unmap_store(&self, store: &mut BackingStore) -> Result<()>;

    /// Flushes a mapped range to the device. Only called for non-coherent
    /// stores.
    fn flush_store(&self, store: &BackingStore, offset: u64, size: u64) -> Result<()>;

    /// Invalidates a mapped range for host reads. Only called for
    /// non-coherent stores.
    fn invalidate_store(&self, store: &BackingStore, offset: u64, size: u64) -> Result<()>;

    /// Destroys the store immediately. The caller guarantees the device is
    /// done with it.
    fn destroy_store(&self, store: BackingStore) -> Result<()>;
}

/// One backing buffer of a ring, together with its mapping state and the
/// serial of the last batch that may reference it.
pub struct BackingStore {
    buffer: UniqueHandle<vk::Buffer>,
    allocation: Option<vk_mem::Allocation>,
    size: u64,
    mapped: *mut u8,
    coherent: bool,
    serial: Serial,
}

impl BackingStore {
    pub fn new(
        buffer: vk::Buffer,
        allocation: Option<vk_mem::Allocation>,
        size: u64,
        coherent: bool,
    ) -> BackingStore {
        BackingStore {
            buffer: UniqueHandle::new(buffer),
            allocation,
            size,
            mapped: ptr::null_mut(),
            coherent,
            serial: Serial::invalid(),
        }
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.buffer.get()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn serial(&self) -> Serial {
        self.serial
    }

    pub fn is_mapped(&self) -> bool {
        !self.mapped.is_null()
    }

    pub fn mapped_ptr(&self) -> *mut u8 {
        self.mapped
    }

    pub fn is_coherent(&self) -> bool {
        self.coherent
    }

    pub fn allocation(&self) -> Option<&vk_mem::Allocation> {
        self.allocation.as_ref()
    }

    /// Records the mapped pointer. Called by [`StoreAllocator::map_store`]
    /// implementations.
    pub fn set_mapped(&mut self, ptr: *mut u8) {
        self.mapped = ptr;
    }

    pub fn clear_mapped(&mut self) {
        self.mapped = ptr::null_mut();
    }

    /// Takes the buffer handle out for destruction.
    pub fn take_buffer(&mut self) -> vk::Buffer {
        self.buffer.take()
    }

    pub fn take_allocation(&mut self) -> Option<vk_mem::Allocation> {
        self.allocation.take()
    }
}

/// A span handed out by [`RingBuffer::allocate`].
#[derive(Copy, Clone, Debug)]
pub struct Suballocation {
    pub buffer: vk::Buffer,
    pub offset: u64,
    /// Write pointer for the span. Null for device-local rings.
    pub ptr: *mut u8,
    /// True when this allocation landed in a different store than the
    /// previous one. Anything caching `buffer` must refresh.
    pub rotated: bool,
}

pub struct RingBuffer {
    usage: vk::BufferUsageFlags,
    host_visible: bool,
    initial_size: u64,
    /// Size of the current store, and of any store allocated next. Zero until
    /// the first allocation.
    size: u64,
    alignment: u64,
    store: Option<BackingStore>,
    next_offset: u64,
    last_flush_offset: u64,
    in_flight: Vec<BackingStore>,
    /// Retired stores, oldest first.
    free_list: Vec<BackingStore>,
}

fn round_up(value: u64, alignment: u64) -> Result<u64> {
    let aligned = value
        .checked_add(alignment - 1)
        .ok_or(Error::ArithmeticOverflow)?;
    Ok(aligned - (aligned % alignment))
}

impl RingBuffer {
    /// No store is created until the first allocation, so construction is
    /// free of device work.
    pub fn new(usage: vk::BufferUsageFlags, initial_size: u64, host_visible: bool) -> RingBuffer {
        RingBuffer {
            usage,
            host_visible,
            initial_size,
            size: 0,
            alignment: 1,
            store: None,
            next_offset: 0,
            last_flush_offset: 0,
            in_flight: Vec::new(),
            free_list: Vec::new(),
        }
    }

    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    pub fn store_size(&self) -> u64 {
        self.size
    }

    pub fn current_buffer(&self) -> Option<vk::Buffer> {
        self.store.as_ref().map(|s| s.buffer())
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn free_count(&self) -> usize {
        self.free_list.len()
    }

    /// Raises the allocation alignment to the combination of `alignment` and
    /// the device's non-coherent atom size, so that flush ranges are always
    /// validly aligned.
    ///
    /// The combination is lcm(alignment, atom_size). Atom sizes are powers of
    /// two, so for power-of-two alignments this is a max; the only other
    /// alignment that occurs in practice is 3 times a power of two (tightly
    /// packed 3-component vertex formats), which is special-cased instead of
    /// computing a general lcm.
    pub fn require_alignment(&mut self, non_coherent_atom_size: u64, alignment: u64) {
        assert!(alignment > 0);
        assert!(non_coherent_atom_size.is_power_of_two());

        let alignment = if alignment.is_power_of_two() {
            alignment.max(non_coherent_atom_size)
        } else {
            assert!(alignment % 3 == 0 && (alignment / 3).is_power_of_two());
            (alignment / 3).max(non_coherent_atom_size) * 3
        };

        if alignment != self.alignment {
            // Re-align the write cursor so the next span starts on the new
            // boundary.
            self.next_offset = (self.next_offset + alignment - 1) / alignment * alignment;
        }
        self.alignment = alignment;
    }

    /// Reserves `size_in_bytes` bytes (rounded up to the ring alignment) in
    /// the current store, rotating to a fresh store when the span does not
    /// fit.
    ///
    /// Rotation stamps the outgoing store with the current serial and parks
    /// it in the in-flight list; [`release_in_flight`](Self::release_in_flight)
    /// moves those to the free list once the caller has submitted the batch.
    /// A free store is only reused when its serial has completed, and only
    /// the oldest is ever considered.
    pub fn allocate<A: StoreAllocator>(
        &mut self,
        allocator: &A,
        timeline: &SubmissionTimeline,
        garbage: &mut GarbageList,
        size_in_bytes: u64,
    ) -> Result<Suballocation> {
        let size_to_allocate = round_up(size_in_bytes, self.alignment)?;
        let next_offset = self
            .next_offset
            .checked_add(size_to_allocate)
            .ok_or(Error::ArithmeticOverflow)?;

        let mut rotated = false;
        if self.store.is_none() || next_offset >= self.size {
            self.flush(allocator)?;
            if let Some(mut store) = self.store.take() {
                if store.is_mapped() {
                    allocator.unmap_store(&mut store)?;
                }
                store.serial = timeline.current_serial();
                self.in_flight.push(store);
            }

            if size_to_allocate > self.size {
                self.size = self.initial_size.max(size_to_allocate);
                // The free stores are too small now. They may still back
                // queued work, so they go through the garbage list rather
                // than being destroyed here.
                for store in self.free_list.drain(..) {
                    garbage.discard_store(store);
                }
            }

            // The free list is ordered oldest first; if the front is still in
            // use, so is everything behind it.
            let reusable = match self.free_list.first() {
                Some(front) => !timeline.is_serial_in_use(front.serial()),
                None => false,
            };
            let store = if reusable {
                let store = self.free_list.remove(0);
                debug_assert_eq!(store.size(), self.size);
                store
            } else {
                trace!(size = self.size, usage = ?self.usage, "allocating ring store");
                allocator.create_store(self.size, self.usage, self.host_visible)?
            };
            self.store = Some(store);
            self.next_offset = 0;
            self.last_flush_offset = 0;
            rotated = true;
        }

        let offset = self.next_offset;
        self.next_offset = offset + size_to_allocate;

        let store = match self.store.as_mut() {
            Some(store) => store,
            None => unreachable!("rotation always installs a store"),
        };
        let ptr = if self.host_visible {
            if !store.is_mapped() {
                allocator.map_store(store)?;
            }
            // Safety: offset < store.size, checked above.
            unsafe { store.mapped_ptr().add(offset as usize) }
        } else {
            ptr::null_mut()
        };

        Ok(Suballocation {
            buffer: store.buffer(),
            offset,
            ptr,
            rotated,
        })
    }

    /// Flushes host writes made since the last flush. No-op for device-local
    /// rings; the device call is also skipped for coherent stores, but the
    /// flush cursor advances either way.
    pub fn flush<A: StoreAllocator>(&mut self, allocator: &A) -> Result<()> {
        if self.host_visible && self.next_offset > self.last_flush_offset {
            if let Some(store) = &self.store {
                if !store.is_coherent() {
                    allocator.flush_store(
                        store,
                        self.last_flush_offset,
                        self.next_offset - self.last_flush_offset,
                    )?;
                }
                self.last_flush_offset = self.next_offset;
            }
        }
        Ok(())
    }

    /// Invalidates the span written by the device since the last flush or
    /// invalidate, for host reads.
    pub fn invalidate<A: StoreAllocator>(&mut self, allocator: &A) -> Result<()> {
        if self.host_visible && self.next_offset > self.last_flush_offset {
            if let Some(store) = &self.store {
                if !store.is_coherent() {
                    allocator.invalidate_store(
                        store,
                        self.last_flush_offset,
                        self.next_offset - self.last_flush_offset,
                    )?;
                }
                self.last_flush_offset = self.next_offset;
            }
        }
        Ok(())
    }

    /// Moves stores retired by rotation to the free list, or to the garbage
    /// list when the ring has grown past their size. Call once per submitted
    /// batch.
    pub fn release_in_flight(&mut self, garbage: &mut GarbageList) {
        for store in self.in_flight.drain(..) {
            if store.size() < self.size {
                garbage.discard_store(store);
            } else {
                self.free_list.push(store);
            }
        }
    }

    /// Hands every store to the garbage list and resets the ring. The ring
    /// stays usable; the next allocation starts over at the initial size.
    pub fn release<A: StoreAllocator>(
        &mut self,
        allocator: &A,
        timeline: &SubmissionTimeline,
        garbage: &mut GarbageList,
    ) -> Result<()> {
        self.size = 0;
        self.next_offset = 0;
        self.last_flush_offset = 0;

        for store in self.in_flight.drain(..) {
            garbage.discard_store(store);
        }
        for store in self.free_list.drain(..) {
            garbage.discard_store(store);
        }
        if let Some(mut store) = self.store.take() {
            if store.is_mapped() {
                allocator.unmap_store(&mut store)?;
            }
            // The store may hold data read by the current batch even if no
            // rotation ever stamped it.
            store.serial = timeline.current_serial();
            garbage.discard_store(store);
        }
        Ok(())
    }

    /// Destroys every store immediately. Only valid once the device is idle.
    pub fn destroy<A: StoreAllocator>(&mut self, allocator: &A) -> Result<()> {
        self.size = 0;
        self.next_offset = 0;
        self.last_flush_offset = 0;

        for store in self.in_flight.drain(..) {
            allocator.destroy_store(store)?;
        }
        for store in self.free_list.drain(..) {
            allocator.destroy_store(store)?;
        }
        if let Some(mut store) = self.store.take() {
            if store.is_mapped() {
                allocator.unmap_store(&mut store)?;
            }
            allocator.destroy_store(store)?;
        }
        Ok(())
    }
}
