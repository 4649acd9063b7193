//! Index synthesis for line-loop draws.
//!
//! Vulkan has no line-loop primitive, so a loop over `n` vertices is drawn as
//! a line strip of `n + 1` indices with the first vertex repeated at the end.
//! [`LineLoopSynthesizer`] builds those index buffers on demand in a
//! dedicated ring.

use crate::{
    buffer::BufferResource,
    command::CommandEncoder,
    context::{GarbageList, SubmissionTimeline},
    error::Result,
    ring::{RingBuffer, StoreAllocator},
};
use ash::vk;
use std::{mem, ptr};

/// Initial size of the index ring; it grows on demand.
const INDEX_RING_INITIAL_SIZE: u64 = 1024 * 1024;

fn index_unit_size(index_type: vk::IndexType) -> u64 {
    match index_type {
        vk::IndexType::UINT16 => 2,
        vk::IndexType::UINT32 => 4,
        _ => panic!("unsupported index type {:?}", index_type),
    }
}

/// A synthesized index span, ready for `bind_index_buffer`.
#[derive(Copy, Clone, Debug)]
pub struct SynthesizedIndices {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub index_count: u32,
    pub index_type: vk::IndexType,
}

pub struct LineLoopSynthesizer {
    ring: RingBuffer,
}

impl LineLoopSynthesizer {
    pub fn new() -> LineLoopSynthesizer {
        // Texel usages included so the spans can also back fetch-style reads
        // of the synthesized indices.
        let usage = vk::BufferUsageFlags::INDEX_BUFFER
            | vk::BufferUsageFlags::TRANSFER_DST
            | vk::BufferUsageFlags::UNIFORM_TEXEL_BUFFER
            | vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER;
        let mut ring = RingBuffer::new(usage, INDEX_RING_INITIAL_SIZE, true);
        ring.require_alignment(1, mem::size_of::<u32>() as u64);
        LineLoopSynthesizer { ring }
    }

    /// Raises the ring alignment to cover the device's non-coherent atom
    /// size. Call once after device creation.
    pub fn require_alignment(&mut self, non_coherent_atom_size: u64) {
        self.ring
            .require_alignment(non_coherent_atom_size, mem::size_of::<u32>() as u64);
    }

    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    /// Synthesizes indices for a line loop over the vertex range
    /// `first_vertex .. first_vertex + vertex_count`: 32-bit indices written
    /// host-side, the range in order and then `first_vertex` again.
    pub fn indices_for_draw_arrays<A: StoreAllocator>(
        &mut self,
        allocator: &A,
        timeline: &SubmissionTimeline,
        garbage: &mut GarbageList,
        first_vertex: u32,
        vertex_count: u32,
    ) -> Result<SynthesizedIndices> {
        let unit_size = mem::size_of::<u32>() as u64;
        let allocate_bytes = unit_size * (vertex_count as u64 + 1);

        self.ring.release_in_flight(garbage);
        let span = self
            .ring
            .allocate(allocator, timeline, garbage, allocate_bytes)?;

        unsafe {
            let indices = span.ptr as *mut u32;
            for i in 0..vertex_count {
                indices.add(i as usize).write_unaligned(first_vertex + i);
            }
            indices
                .add(vertex_count as usize)
                .write_unaligned(first_vertex);
        }
        self.ring.flush(allocator)?;

        Ok(SynthesizedIndices {
            buffer: span.buffer,
            offset: span.offset,
            index_count: vertex_count + 1,
            index_type: vk::IndexType::UINT32,
        })
    }

    /// Synthesizes indices from an index buffer already on the device: one
    /// copy of the source range, then the first index again, both as
    /// `vk::BufferCopy` regions through `encoder`. 16 and 32-bit index types
    /// only; 8-bit sources go through [`stream_indices`](Self::stream_indices).
    pub fn indices_from_element_buffer<A: StoreAllocator, E: CommandEncoder>(
        &mut self,
        allocator: &A,
        encoder: &mut E,
        timeline: &SubmissionTimeline,
        garbage: &mut GarbageList,
        src: &mut BufferResource,
        index_type: vk::IndexType,
        index_count: u32,
        src_offset: u64,
    ) -> Result<SynthesizedIndices> {
        assert!(index_count > 0);
        let unit_size = index_unit_size(index_type);
        let allocate_bytes = unit_size * (index_count as u64 + 1);

        self.ring.release_in_flight(garbage);
        let span = self
            .ring
            .allocate(allocator, timeline, garbage, allocate_bytes)?;

        src.record_access(encoder, vk::AccessFlags::TRANSFER_READ, vk::AccessFlags::empty());
        let copies = [
            vk::BufferCopy {
                src_offset,
                dst_offset: span.offset,
                size: unit_size * index_count as u64,
            },
            // loop closure: the first index repeated at the tail
            vk::BufferCopy {
                src_offset,
                dst_offset: span.offset + unit_size * index_count as u64,
                size: unit_size,
            },
        ];
        encoder.copy_buffer(src.buffer(), span.buffer, &copies);
        self.ring.flush(allocator)?;

        Ok(SynthesizedIndices {
            buffer: span.buffer,
            offset: span.offset,
            index_count: index_count + 1,
            index_type,
        })
    }

    /// Synthesizes indices from client-side index data. 8-bit indices are
    /// widened to 16-bit while copying, since there is no 8-bit index type to
    /// bind; 16 and 32-bit data is copied as-is. The first index is repeated
    /// at the end.
    pub fn stream_indices<A: StoreAllocator>(
        &mut self,
        allocator: &A,
        timeline: &SubmissionTimeline,
        garbage: &mut GarbageList,
        index_type: vk::IndexType,
        index_count: u32,
        data: &[u8],
    ) -> Result<SynthesizedIndices> {
        assert!(index_count > 0);
        let widen = index_type == vk::IndexType::UINT8_EXT;
        let out_type = if widen {
            vk::IndexType::UINT16
        } else {
            index_type
        };
        let unit_size = index_unit_size(out_type);
        let allocate_bytes = unit_size * (index_count as u64 + 1);

        let span = self
            .ring
            .allocate(allocator, timeline, garbage, allocate_bytes)?;

        unsafe {
            if widen {
                assert!(data.len() >= index_count as usize);
                let indices = span.ptr as *mut u16;
                for i in 0..index_count as usize {
                    indices.add(i).write_unaligned(data[i] as u16);
                }
                indices
                    .add(index_count as usize)
                    .write_unaligned(data[0] as u16);
            } else {
                let byte_count = (unit_size * index_count as u64) as usize;
                assert!(data.len() >= byte_count);
                ptr::copy_nonoverlapping(data.as_ptr(), span.ptr, byte_count);
                ptr::copy_nonoverlapping(
                    data.as_ptr(),
                    span.ptr.add(byte_count),
                    unit_size as usize,
                );
            }
        }
        self.ring.flush(allocator)?;

        Ok(SynthesizedIndices {
            buffer: span.buffer,
            offset: span.offset,
            index_count: index_count + 1,
            index_type: out_type,
        })
    }

    /// Moves stores retired by rotation to the free list. Call once per
    /// submitted batch.
    pub fn release_in_flight(&mut self, garbage: &mut GarbageList) {
        self.ring.release_in_flight(garbage);
    }

    /// Hands the ring's stores to the garbage list.
    pub fn release<A: StoreAllocator>(
        &mut self,
        allocator: &A,
        timeline: &SubmissionTimeline,
        garbage: &mut GarbageList,
    ) -> Result<()> {
        self.ring.release(allocator, timeline, garbage)
    }

    /// Destroys the ring's stores immediately. Only valid once the device is
    /// idle.
    pub fn destroy<A: StoreAllocator>(&mut self, allocator: &A) -> Result<()> {
        self.ring.destroy(allocator)
    }
}
