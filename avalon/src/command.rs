//! Abstraction over the command buffer that barriers, copies and clears are
//! recorded into.
//!
//! The trackers in this crate decide *which* commands synchronization needs,
//! but they never own the command buffer those commands land in. They write
//! through [`CommandEncoder`] instead, which keeps the decision logic testable
//! without a device: tests substitute an encoder that records what was asked
//! of it, while [`CommandRecorder`] forwards to an actual `vk::CommandBuffer`.

use ash::{version::DeviceV1_0, vk};
use std::slice;

pub trait CommandEncoder {
    /// Stage-to-stage barrier, no access masks.
    fn execution_barrier(
        &mut self,
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
    );

    /// Global memory barrier.
    fn memory_barrier(
        &mut self,
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
        barrier: &vk::MemoryBarrier,
    );

    fn buffer_barrier(
        &mut self,
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
        barrier: &vk::BufferMemoryBarrier,
    );

    fn image_barrier(
        &mut self,
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
        barrier: &vk::ImageMemoryBarrier,
    );

    fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]);

    fn copy_buffer_to_image(
        &mut self,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    );

    fn copy_image(
        &mut self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageCopy],
    );

    fn blit_image(
        &mut self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit],
        filter: vk::Filter,
    );

    fn clear_color_image(
        &mut self,
        image: vk::Image,
        layout: vk::ImageLayout,
        value: &vk::ClearColorValue,
        ranges: &[vk::ImageSubresourceRange],
    );

    fn clear_depth_stencil_image(
        &mut self,
        image: vk::Image,
        layout: vk::ImageLayout,
        value: &vk::ClearDepthStencilValue,
        ranges: &[vk::ImageSubresourceRange],
    );

    fn reset_query_pool(&mut self, pool: vk::QueryPool, first_query: u32, query_count: u32);

    fn begin_query(&mut self, pool: vk::QueryPool, query: u32);

    fn end_query(&mut self, pool: vk::QueryPool, query: u32);

    fn write_timestamp(&mut self, stage: vk::PipelineStageFlags, pool: vk::QueryPool, query: u32);

    fn bind_index_buffer(&mut self, buffer: vk::Buffer, offset: u64, index_type: vk::IndexType);
}

/// Records into a command buffer that is in the recording state.
///
/// The caller is responsible for begin/end and for submitting the command
/// buffer under the serial the resources were stamped with.
pub struct CommandRecorder<'a> {
    device: &'a ash::Device,
    command_buffer: vk::CommandBuffer,
}

impl<'a> CommandRecorder<'a> {
    pub fn new(device: &'a ash::Device, command_buffer: vk::CommandBuffer) -> CommandRecorder<'a> {
        CommandRecorder {
            device,
            command_buffer,
        }
    }

    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }
}

impl<'a> CommandEncoder for CommandRecorder<'a> {
    fn execution_barrier(
        &mut self,
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
    ) {
        unsafe {
            self.device.cmd_pipeline_barrier(
                self.command_buffer,
                src_stage_mask,
                dst_stage_mask,
                Default::default(),
                &[],
                &[],
                &[],
            );
        }
    }

    fn memory_barrier(
        &mut self,
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
        barrier: &vk::MemoryBarrier,
    ) {
        unsafe {
            self.device.cmd_pipeline_barrier(
                self.command_buffer,
                src_stage_mask,
                dst_stage_mask,
                Default::default(),
                slice::from_ref(barrier),
                &[],
                &[],
            );
        }
    }

    fn buffer_barrier(
        &mut self,
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
        barrier: &vk::BufferMemoryBarrier,
    ) {
        unsafe {
            self.device.cmd_pipeline_barrier(
                self.command_buffer,
                src_stage_mask,
                dst_stage_mask,
                Default::default(),
                &[],
                slice::from_ref(barrier),
                &[],
            );
        }
    }

    fn image_barrier(
        &mut self,
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
        barrier: &vk::ImageMemoryBarrier,
    ) {
        unsafe {
            self.device.cmd_pipeline_barrier(
                self.command_buffer,
                src_stage_mask,
                dst_stage_mask,
                Default::default(),
                &[],
                &[],
                slice::from_ref(barrier),
            );
        }
    }

    fn copy_buffer(&mut self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        unsafe {
            self.device
                .cmd_copy_buffer(self.command_buffer, src, dst, regions);
        }
    }

    fn copy_buffer_to_image(
        &mut self,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.device
                .cmd_copy_buffer_to_image(self.command_buffer, src, dst, dst_layout, regions);
        }
    }

    fn copy_image(
        &mut self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageCopy],
    ) {
        unsafe {
            self.device.cmd_copy_image(
                self.command_buffer,
                src,
                src_layout,
                dst,
                dst_layout,
                regions,
            );
        }
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
        unsafe {
            self.device.cmd_blit_image(
                self.command_buffer,
                src,
                src_layout,
                dst,
                dst_layout,
                regions,
                filter,
            );
        }
    }

    fn clear_color_image(
        &mut self,
        image: vk::Image,
        layout: vk::ImageLayout,
        value: &vk::ClearColorValue,
        ranges: &[vk::ImageSubresourceRange],
    ) {
        unsafe {
            self.device
                .cmd_clear_color_image(self.command_buffer, image, layout, value, ranges);
        }
    }

    fn clear_depth_stencil_image(
        &mut self,
        image: vk::Image,
        layout: vk::ImageLayout,
        value: &vk::ClearDepthStencilValue,
        ranges: &[vk::ImageSubresourceRange],
    ) {
        unsafe {
            self.device.cmd_clear_depth_stencil_image(
                self.command_buffer,
                image,
                layout,
                value,
                ranges,
            );
        }
    }

    fn reset_query_pool(&mut self, pool: vk::QueryPool, first_query: u32, query_count: u32) {
        unsafe {
            self.device
                .cmd_reset_query_pool(self.command_buffer, pool, first_query, query_count);
        }
    }

    fn begin_query(&mut self, pool: vk::QueryPool, query: u32) {
        unsafe {
            self.device
                .cmd_begin_query(self.command_buffer, pool, query, Default::default());
        }
    }

    fn end_query(&mut self, pool: vk::QueryPool, query: u32) {
        unsafe {
            self.device.cmd_end_query(self.command_buffer, pool, query);
        }
    }

    fn write_timestamp(&mut self, stage: vk::PipelineStageFlags, pool: vk::QueryPool, query: u32) {
        unsafe {
            self.device
                .cmd_write_timestamp(self.command_buffer, stage, pool, query);
        }
    }

    fn bind_index_buffer(&mut self, buffer: vk::Buffer, offset: u64, index_type: vk::IndexType) {
        unsafe {
            self.device
                .cmd_bind_index_buffer(self.command_buffer, buffer, offset, index_type);
        }
    }
}
