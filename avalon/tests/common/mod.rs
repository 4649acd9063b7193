//! Device-free test doubles: a heap-backed store allocator and a command
//! encoder that records what was asked of it.

#![allow(dead_code)]

use avalon::vk::Handle;
use avalon::{
    vk, BackingStore, CommandEncoder, Garbage, GarbageList, ImageResource, Result, Serial,
    StoreAllocator, SubmissionTimeline,
};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::mem;

/// A timeline with `current` as the serial being recorded and everything up
/// to `completed` retired.
pub fn timeline_at(current: u64, completed: u64) -> SubmissionTimeline {
    let mut timeline = SubmissionTimeline::new();
    for _ in 1..current {
        timeline.advance();
    }
    timeline.retire(Serial::from_raw(completed));
    timeline
}

/// A weak 64x64 RGBA8 color image with the given mip and layer counts.
pub fn color_image(mip_levels: u32, array_layers: u32) -> ImageResource {
    color_image_with_handle(0x1000, mip_levels, array_layers)
}

/// [`color_image`] with a chosen raw handle, for tests that need to tell two
/// images apart.
pub fn color_image_with_handle(raw: u64, mip_levels: u32, array_layers: u32) -> ImageResource {
    ImageResource::init_weak(
        vk::Image::from_raw(raw),
        vk::Format::R8G8B8A8_UNORM,
        vk::Extent3D {
            width: 64,
            height: 64,
            depth: 1,
        },
        mip_levels,
        array_layers,
    )
}

/// Tears down a weak image whose staging ring was never touched.
pub fn release_weak_image(image: ImageResource) {
    let allocator = CpuAllocator::new();
    let timeline = SubmissionTimeline::new();
    let mut garbage = GarbageList::new();
    image
        .release(&allocator, &timeline, &mut garbage)
        .expect("weak image release failed");
    assert!(garbage.is_empty());
}

/// Destroys everything on the garbage list through `allocator`. The
/// device-free tests only ever discard ring stores.
pub fn drain_garbage(allocator: &CpuAllocator, garbage: &mut GarbageList) {
    garbage.drain_all(|entry| match entry {
        Garbage::Store(store) => allocator.destroy_store(store).unwrap(),
        _ => panic!("only ring stores are discarded in these tests"),
    });
}

/// Backs ring stores with boxed slices so the suballocation logic runs
/// without a device. Buffer handles are drawn from a counter; the boxed
/// data never moves, so mapped pointers stay valid across map/unmap.
pub struct CpuAllocator {
    coherent: bool,
    next_handle: Cell<u64>,
    memory: RefCell<HashMap<u64, Box<[u8]>>>,
    created: Cell<usize>,
    destroyed: Cell<usize>,
    flushes: RefCell<Vec<(vk::Buffer, u64, u64)>>,
    invalidations: RefCell<Vec<(vk::Buffer, u64, u64)>>,
}

impl CpuAllocator {
    pub fn new() -> CpuAllocator {
        CpuAllocator::with_coherence(true)
    }

    /// An allocator whose stores report non-coherent memory, so rings must
    /// issue explicit flushes.
    pub fn non_coherent() -> CpuAllocator {
        CpuAllocator::with_coherence(false)
    }

    fn with_coherence(coherent: bool) -> CpuAllocator {
        CpuAllocator {
            coherent,
            next_handle: Cell::new(1),
            memory: RefCell::new(HashMap::new()),
            created: Cell::new(0),
            destroyed: Cell::new(0),
            flushes: RefCell::new(Vec::new()),
            invalidations: RefCell::new(Vec::new()),
        }
    }

    pub fn created(&self) -> usize {
        self.created.get()
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.get()
    }

    pub fn live(&self) -> usize {
        self.memory.borrow().len()
    }

    /// `(buffer, offset, size)` of every flush, in call order.
    pub fn flushes(&self) -> Vec<(vk::Buffer, u64, u64)> {
        self.flushes.borrow().clone()
    }

    pub fn invalidations(&self) -> Vec<(vk::Buffer, u64, u64)> {
        self.invalidations.borrow().clone()
    }

    /// Store contents, for checking what a span wrote.
    pub fn read(&self, buffer: vk::Buffer, offset: u64, len: usize) -> Vec<u8> {
        let memory = self.memory.borrow();
        let bytes = memory.get(&buffer.as_raw()).expect("unknown store");
        bytes[offset as usize..offset as usize + len].to_vec()
    }
}

impl StoreAllocator for CpuAllocator {
    fn create_store(
        &self,
        size: u64,
        _usage: vk::BufferUsageFlags,
        _host_visible: bool,
    ) -> Result<BackingStore> {
        let handle = self.next_handle.get();
        self.next_handle.set(handle + 1);
        self.memory
            .borrow_mut()
            .insert(handle, vec![0u8; size as usize].into_boxed_slice());
        self.created.set(self.created.get() + 1);
        Ok(BackingStore::new(
            vk::Buffer::from_raw(handle),
            None,
            size,
            self.coherent,
        ))
    }

    fn map_store(&self, store: &mut BackingStore) -> Result<()> {
        let mut memory = self.memory.borrow_mut();
        let bytes = memory
            .get_mut(&store.buffer().as_raw())
            .expect("unknown store");
        store.set_mapped(bytes.as_mut_ptr());
        Ok(())
    }

    fn unmap_store(&self, store: &mut BackingStore) -> Result<()> {
        store.clear_mapped();
        Ok(())
    }

    fn flush_store(&self, store: &BackingStore, offset: u64, size: u64) -> Result<()> {
        self.flushes
            .borrow_mut()
            .push((store.buffer(), offset, size));
        Ok(())
    }

    fn invalidate_store(&self, store: &BackingStore, offset: u64, size: u64) -> Result<()> {
        self.invalidations
            .borrow_mut()
            .push((store.buffer(), offset, size));
        Ok(())
    }

    fn destroy_store(&self, mut store: BackingStore) -> Result<()> {
        assert!(!store.is_mapped(), "store destroyed while mapped");
        let buffer = store.take_buffer();
        let removed = self.memory.borrow_mut().remove(&buffer.as_raw());
        assert!(removed.is_some(), "store destroyed twice");
        self.destroyed.set(self.destroyed.get() + 1);
        Ok(())
    }
}

/// One recorded [`CommandEncoder`] call.
///
/// `vk::ClearColorValue` is a union, so the color clear variant keeps the
/// raw `uint32` view instead.
#[derive(Clone, Debug)]
pub enum Command {
    ExecutionBarrier {
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
    },
    MemoryBarrier {
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
        barrier: vk::MemoryBarrier,
    },
    BufferBarrier {
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
        barrier: vk::BufferMemoryBarrier,
    },
    ImageBarrier {
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
        barrier: vk::ImageMemoryBarrier,
    },
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: Vec<vk::BufferCopy>,
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: Vec<vk::BufferImageCopy>,
    },
    CopyImage {
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: Vec<vk::ImageCopy>,
    },
    BlitImage {
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: Vec<vk::ImageBlit>,
        filter: vk::Filter,
    },
    ClearColorImage {
        image: vk::Image,
        layout: vk::ImageLayout,
        color: [u32; 4],
        ranges: Vec<vk::ImageSubresourceRange>,
    },
    ClearDepthStencilImage {
        image: vk::Image,
        layout: vk::ImageLayout,
        value: vk::ClearDepthStencilValue,
        ranges: Vec<vk::ImageSubresourceRange>,
    },
    ResetQueryPool {
        pool: vk::QueryPool,
        first_query: u32,
        query_count: u32,
    },
    BeginQuery {
        pool: vk::QueryPool,
        query: u32,
    },
    EndQuery {
        pool: vk::QueryPool,
        query: u32,
    },
    WriteTimestamp {
        stage: vk::PipelineStageFlags,
        pool: vk::QueryPool,
        query: u32,
    },
    BindIndexBuffer {
        buffer: vk::Buffer,
        offset: u64,
        index_type: vk::IndexType,
    },
}

impl Command {
    pub fn is_barrier(&self) -> bool {
        matches!(
            self,
            Command::ExecutionBarrier { .. }
                | Command::MemoryBarrier { .. }
                | Command::BufferBarrier { .. }
                | Command::ImageBarrier { .. }
        )
    }
}

/// Captures encoder calls so tests can assert on the exact command sequence
/// the trackers emit.
#[derive(Default)]
pub struct RecordingEncoder {
    pub commands: Vec<Command>,
}

impl RecordingEncoder {
    pub fn new() -> RecordingEncoder {
        RecordingEncoder::default()
    }

    pub fn barrier_count(&self) -> usize {
        self.commands.iter().filter(|c| c.is_barrier()).count()
    }

    /// Takes everything recorded so far, leaving the encoder empty.
    pub fn take(&mut self) -> Vec<Command> {
        mem::take(&mut self.commands)
    }
}

impl CommandEncoder for RecordingEncoder {
    fn execution_barrier(
        &mut self,
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
    ) {
        self.commands.push(Command::ExecutionBarrier {
            src_stage_mask,
            dst_stage_mask,
        });
    }

    fn memory_barrier(
        &mut self,
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
        barrier: &vk::MemoryBarrier,
    ) {
        self.commands.push(Command::MemoryBarrier {
            src_stage_mask,
            dst_stage_mask,
            barrier: *barrier,
        });
    }

    fn buffer_barrier(
        &mut self,
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
        barrier: &vk::BufferMemoryBarrier,
    ) {
        self.commands.push(Command::BufferBarrier {
            src_stage_mask,
            dst_stage_mask,
            barrier: *barrier,
        });
    }

    fn image_barrier(
        &mut self,
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
        barrier: &vk::ImageMemoryBarrier,
    ) {
        self.commands.push(Command::ImageBarrier {
            src_stage_mask,
            dst_stage_mask,
            barrier: *barrier,
        });
    }

    fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        self.commands.push(Command::CopyBuffer {
            src,
            dst,
            regions: regions.to_vec(),
        });
    }

    fn copy_buffer_to_image(
        &mut self,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        self.commands.push(Command::CopyBufferToImage {
            src,
            dst,
            dst_layout,
            regions: regions.to_vec(),
        });
    }

    fn copy_image(
        &mut self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageCopy],
    ) {
        self.commands.push(Command::CopyImage {
            src,
            src_layout,
            dst,
            dst_layout,
            regions: regions.to_vec(),
        });
    }

    fn blit_image(
        &mut self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit],
        filter: vk::Filter,
    ) {
        self.commands.push(Command::BlitImage {
            src,
            src_layout,
            dst,
            dst_layout,
            regions: regions.to_vec(),
            filter,
        });
    }

    fn clear_color_image(
        &mut self,
        image: vk::Image,
        layout: vk::ImageLayout,
        value: &vk::ClearColorValue,
        ranges: &[vk::ImageSubresourceRange],
    ) {
        self.commands.push(Command::ClearColorImage {
            image,
            layout,
            // Safety: all union views are plain arrays of the same size.
            color: unsafe { value.uint32 },
            ranges: ranges.to_vec(),
        });
    }

    fn clear_depth_stencil_image(
        &mut self,
        image: vk::Image,
        layout: vk::ImageLayout,
        value: &vk::ClearDepthStencilValue,
        ranges: &[vk::ImageSubresourceRange],
    ) {
        self.commands.push(Command::ClearDepthStencilImage {
            image,
            layout,
            value: *value,
            ranges: ranges.to_vec(),
        });
    }

    fn reset_query_pool(&mut self, pool: vk::QueryPool, first_query: u32, query_count: u32) {
        self.commands.push(Command::ResetQueryPool {
            pool,
            first_query,
            query_count,
        });
    }

    fn begin_query(&mut self, pool: vk::QueryPool, query: u32) {
        self.commands.push(Command::BeginQuery { pool, query });
    }

    fn end_query(&mut self, pool: vk::QueryPool, query: u32) {
        self.commands.push(Command::EndQuery { pool, query });
    }

    fn write_timestamp(&mut self, stage: vk::PipelineStageFlags, pool: vk::QueryPool, query: u32) {
        self.commands.push(Command::WriteTimestamp { stage, pool, query });
    }

    fn bind_index_buffer(&mut self, buffer: vk::Buffer, offset: u64, index_type: vk::IndexType) {
        self.commands.push(Command::BindIndexBuffer {
            buffer,
            offset,
            index_type,
        });
    }
}
