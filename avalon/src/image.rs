//! Image resources: layout/ownership tracking and staged content updates.
//!
//! An [`ImageResource`] knows which [`ImageLayout`] the device currently sees
//! the image in and which queue family owns it, and derives every transition
//! barrier from a static per-layout table. Content changes (clears, CPU
//! uploads, image copies) are not recorded immediately; they are staged into
//! an ordered update queue and replayed by [`flush_staged_updates`] right
//! before the image is read, with staging data carried by an owned
//! [`RingBuffer`].
//!
//! [`flush_staged_updates`]: ImageResource::flush_staged_updates

use crate::{
    command::CommandEncoder,
    context::{Garbage, GarbageList, SubmissionTimeline},
    device::Device,
    error::{Error, Result},
    handle::UniqueHandle,
    ring::{RingBuffer, StoreAllocator},
};
use ash::vk;
use lazy_static::lazy_static;
use std::{mem, ptr, slice};
use tracing::trace_span;

/// Initial size of the per-image staging ring.
pub const STAGING_BUFFER_INITIAL_SIZE: u64 = 16 * 1024;

/// Width of the subresource window used to batch non-overlapping uploads in
/// one flush (one bit per (level, layer) slot, modulo the window).
const MAX_PARALLEL_SUBRESOURCE_UPLOAD: u32 = 64;

/// The ways the device can be using an image. Each variant maps to a Vulkan
/// layout plus the stage/access masks of a transition into and out of that
/// use, via [`layout_entry`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ImageLayout {
    Undefined,
    ExternalPreInitialized,
    TransferSrc,
    TransferDst,
    ComputeShaderReadOnly,
    ComputeShaderWrite,
    AllGraphicsShadersReadOnly,
    AllGraphicsShadersWrite,
    ColorAttachment,
    DepthStencilAttachment,
    Present,
}

#[derive(Debug)]
pub struct LayoutEntry {
    pub layout: vk::ImageLayout,
    /// Stage the image is used in when entering the layout.
    pub dst_stage_mask: vk::PipelineStageFlags,
    /// Stage the image was used in while holding the layout.
    pub src_stage_mask: vk::PipelineStageFlags,
    /// Accesses that must wait for the transition into this layout.
    pub dst_access_mask: vk::AccessFlags,
    /// Accesses that must finish before leaving this layout. Never carries a
    /// READ bit; write-after-read needs execution ordering only.
    pub src_access_mask: vk::AccessFlags,
    /// Whether reusing the image in the same layout needs a barrier. False
    /// for read-only layouts (read-after-read needs nothing); true for
    /// write-typical ones, where an execution barrier orders the writes.
    pub same_layout_requires_barrier: bool,
}

lazy_static! {
    /// Indexed by `ImageLayout as usize`; the variant order must match.
    static ref LAYOUT_TABLE: [LayoutEntry; 11] = [
        // Undefined
        LayoutEntry {
            layout: vk::ImageLayout::UNDEFINED,
            dst_stage_mask: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            src_stage_mask: vk::PipelineStageFlags::TOP_OF_PIPE,
            // Nothing transitions into Undefined.
            dst_access_mask: vk::AccessFlags::empty(),
            // No data in the image to care about.
            src_access_mask: vk::AccessFlags::empty(),
            same_layout_requires_barrier: false,
        },
        // ExternalPreInitialized
        LayoutEntry {
            layout: vk::ImageLayout::PREINITIALIZED,
            dst_stage_mask: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            src_stage_mask: vk::PipelineStageFlags::HOST | vk::PipelineStageFlags::ALL_COMMANDS,
            dst_access_mask: vk::AccessFlags::empty(),
            src_access_mask: vk::AccessFlags::MEMORY_WRITE,
            same_layout_requires_barrier: false,
        },
        // TransferSrc
        LayoutEntry {
            layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            dst_stage_mask: vk::PipelineStageFlags::TRANSFER,
            src_stage_mask: vk::PipelineStageFlags::TRANSFER,
            dst_access_mask: vk::AccessFlags::TRANSFER_READ,
            src_access_mask: vk::AccessFlags::empty(),
            same_layout_requires_barrier: false,
        },
        // TransferDst
        LayoutEntry {
            layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            dst_stage_mask: vk::PipelineStageFlags::TRANSFER,
            src_stage_mask: vk::PipelineStageFlags::TRANSFER,
            dst_access_mask: vk::AccessFlags::TRANSFER_WRITE,
            src_access_mask: vk::AccessFlags::TRANSFER_WRITE,
            same_layout_requires_barrier: true,
        },
        // ComputeShaderReadOnly
        LayoutEntry {
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            dst_stage_mask: vk::PipelineStageFlags::COMPUTE_SHADER,
            src_stage_mask: vk::PipelineStageFlags::COMPUTE_SHADER,
            dst_access_mask: vk::AccessFlags::SHADER_READ,
            src_access_mask: vk::AccessFlags::empty(),
            same_layout_requires_barrier: false,
        },
        // ComputeShaderWrite
        LayoutEntry {
            layout: vk::ImageLayout::GENERAL,
            dst_stage_mask: vk::PipelineStageFlags::COMPUTE_SHADER,
            src_stage_mask: vk::PipelineStageFlags::COMPUTE_SHADER,
            dst_access_mask: vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            src_access_mask: vk::AccessFlags::SHADER_WRITE,
            same_layout_requires_barrier: true,
        },
        // AllGraphicsShadersReadOnly
        LayoutEntry {
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            dst_stage_mask: vk::PipelineStageFlags::ALL_GRAPHICS,
            src_stage_mask: vk::PipelineStageFlags::ALL_GRAPHICS,
            dst_access_mask: vk::AccessFlags::SHADER_READ,
            src_access_mask: vk::AccessFlags::empty(),
            same_layout_requires_barrier: false,
        },
        // AllGraphicsShadersWrite
        LayoutEntry {
            layout: vk::ImageLayout::GENERAL,
            dst_stage_mask: vk::PipelineStageFlags::ALL_GRAPHICS,
            src_stage_mask: vk::PipelineStageFlags::ALL_GRAPHICS,
            dst_access_mask: vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            src_access_mask: vk::AccessFlags::SHADER_WRITE,
            same_layout_requires_barrier: true,
        },
        // ColorAttachment
        LayoutEntry {
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_READ
                | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            src_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            same_layout_requires_barrier: true,
        },
        // DepthStencilAttachment
        LayoutEntry {
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            dst_stage_mask: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            src_stage_mask: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            dst_access_mask: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            src_access_mask: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            same_layout_requires_barrier: true,
        },
        // Present
        LayoutEntry {
            layout: vk::ImageLayout::PRESENT_SRC_KHR,
            dst_stage_mask: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            src_stage_mask: vk::PipelineStageFlags::TOP_OF_PIPE,
            // The present engine makes earlier writes visible on its own.
            dst_access_mask: vk::AccessFlags::empty(),
            src_access_mask: vk::AccessFlags::empty(),
            same_layout_requires_barrier: false,
        },
    ];
}

pub fn layout_entry(layout: ImageLayout) -> &'static LayoutEntry {
    &LAYOUT_TABLE[layout as usize]
}

#[derive(Debug)]
enum TransitionPlan {
    None,
    Execution(vk::PipelineStageFlags),
    Full {
        from: &'static LayoutEntry,
        to: &'static LayoutEntry,
    },
}

fn plan_transition(
    current: ImageLayout,
    current_queue_family: u32,
    new: ImageLayout,
    new_queue_family: u32,
) -> TransitionPlan {
    if current == new && current_queue_family == new_queue_family {
        let entry = layout_entry(current);
        if !entry.same_layout_requires_barrier {
            return TransitionPlan::None;
        }
        // Same use, so the in and out stages necessarily match; ordering the
        // stage against itself is all a repeated write needs.
        debug_assert_eq!(entry.src_stage_mask, entry.dst_stage_mask);
        return TransitionPlan::Execution(entry.dst_stage_mask);
    }
    TransitionPlan::Full {
        from: layout_entry(current),
        to: layout_entry(new),
    }
}

fn subresource_hash(level: u32, base_layer: u32, layer_count: u32, image_layer_count: u32) -> u64 {
    debug_assert!(layer_count < MAX_PARALLEL_SUBRESOURCE_UPLOAD);
    let range = (1u64 << layer_count) - 1;
    let offset = (level * image_layer_count + base_layer) % MAX_PARALLEL_SUBRESOURCE_UPLOAD;
    range.rotate_left(offset)
}

pub fn is_depth_only_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM | vk::Format::X8_D24_UNORM_PACK32 | vk::Format::D32_SFLOAT
    )
}

pub fn is_stencil_only_format(format: vk::Format) -> bool {
    matches!(format, vk::Format::S8_UINT)
}

pub fn is_depth_and_stencil_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

pub fn format_aspect_mask(format: vk::Format) -> vk::ImageAspectFlags {
    if is_depth_only_format(format) {
        vk::ImageAspectFlags::DEPTH
    } else if is_stencil_only_format(format) {
        vk::ImageAspectFlags::STENCIL
    } else if is_depth_and_stencil_format(format) {
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

pub fn get_vk_sample_count(samples: u32) -> vk::SampleCountFlags {
    match samples {
        0 | 1 => vk::SampleCountFlags::TYPE_1,
        2 => vk::SampleCountFlags::TYPE_2,
        4 => vk::SampleCountFlags::TYPE_4,
        8 => vk::SampleCountFlags::TYPE_8,
        16 => vk::SampleCountFlags::TYPE_16,
        32 => vk::SampleCountFlags::TYPE_32,
        64 => vk::SampleCountFlags::TYPE_64,
        _ => panic!("unsupported sample count: {}", samples),
    }
}

/// Creation parameters for [`ImageResource::init`].
#[derive(Copy, Clone, Debug)]
pub struct ImageDesc {
    pub image_type: vk::ImageType,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: u32,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    /// Buffer-copy alignment of the format, folded into the staging ring's
    /// alignment.
    pub staging_alignment: u64,
}

/// A deferred content change waiting in the update queue.
pub(crate) enum SubresourceUpdate {
    Clear {
        value: vk::ClearValue,
        level: u32,
        base_layer: u32,
        /// `vk::REMAINING_ARRAY_LAYERS` clears every layer of the level.
        layer_count: u32,
    },
    Buffer {
        buffer: vk::Buffer,
        region: vk::BufferImageCopy,
    },
    Image {
        image: Box<ImageResource>,
        region: vk::ImageCopy,
    },
}

impl SubresourceUpdate {
    /// Target (level, base layer, layer count); the clear sentinel is
    /// returned as-is.
    fn target(&self) -> (u32, u32, u32) {
        match self {
            SubresourceUpdate::Clear {
                level,
                base_layer,
                layer_count,
                ..
            } => (*level, *base_layer, *layer_count),
            SubresourceUpdate::Buffer { region, .. } => {
                let sub = &region.image_subresource;
                (sub.mip_level, sub.base_array_layer, sub.layer_count)
            }
            SubresourceUpdate::Image { region, .. } => {
                let sub = &region.dst_subresource;
                (sub.mip_level, sub.base_array_layer, sub.layer_count)
            }
        }
    }

    fn is_update_to_level_layer(&self, level: u32, layer: u32) -> bool {
        let (update_level, update_layer, _) = self.target();
        update_level == level && update_layer == layer
    }

    fn release<A: StoreAllocator>(
        self,
        allocator: &A,
        timeline: &SubmissionTimeline,
        garbage: &mut GarbageList,
    ) -> Result<()> {
        match self {
            // Buffer updates borrow staging ring memory; the ring retires it.
            SubresourceUpdate::Clear { .. } | SubresourceUpdate::Buffer { .. } => Ok(()),
            SubresourceUpdate::Image { image, .. } => image.release(allocator, timeline, garbage),
        }
    }
}

/// An image plus the synchronization state Vulkan makes the application
/// track: current layout, owning queue family, and the queue of staged
/// content updates.
pub struct ImageResource {
    image: UniqueHandle<vk::Image>,
    allocation: Option<vk_mem::Allocation>,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
    extent: vk::Extent3D,
    level_count: u32,
    layer_count: u32,
    current_layout: ImageLayout,
    current_queue_family: u32,
    staging: RingBuffer,
    updates: Vec<SubresourceUpdate>,
    /// Externally owned handle; destruction leaves it alone.
    weak: bool,
}

impl ImageResource {
    pub fn init(device: &Device, desc: &ImageDesc, initial_layout: ImageLayout) -> Result<ImageResource> {
        let create_info = vk::ImageCreateInfo {
            image_type: desc.image_type,
            format: desc.format,
            extent: desc.extent,
            mip_levels: desc.mip_levels,
            array_layers: desc.array_layers,
            samples: get_vk_sample_count(desc.samples),
            tiling: desc.tiling,
            usage: desc.usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            initial_layout: layout_entry(initial_layout).layout,
            ..Default::default()
        };
        let alloc = device.create_image_raw(&create_info)?;

        let mut staging = RingBuffer::new(
            vk::BufferUsageFlags::TRANSFER_SRC,
            STAGING_BUFFER_INITIAL_SIZE,
            true,
        );
        staging.require_alignment(device.non_coherent_atom_size(), desc.staging_alignment);

        Ok(ImageResource {
            image: UniqueHandle::new(alloc.handle),
            allocation: Some(alloc.allocation),
            format: desc.format,
            aspect: format_aspect_mask(desc.format),
            extent: desc.extent,
            level_count: desc.mip_levels,
            layer_count: desc.array_layers,
            current_layout: initial_layout,
            current_queue_family: vk::QUEUE_FAMILY_IGNORED,
            staging,
            updates: Vec::new(),
            weak: false,
        })
    }

    /// Wraps an image owned elsewhere in the Undefined layout. Only the
    /// layout and the staged updates are tracked; destruction leaves the
    /// handle alone.
    pub fn init_weak(
        image: vk::Image,
        format: vk::Format,
        extent: vk::Extent3D,
        mip_levels: u32,
        array_layers: u32,
    ) -> ImageResource {
        ImageResource {
            image: UniqueHandle::new(image),
            allocation: None,
            format,
            aspect: format_aspect_mask(format),
            extent,
            level_count: mip_levels,
            layer_count: array_layers,
            current_layout: ImageLayout::Undefined,
            current_queue_family: vk::QUEUE_FAMILY_IGNORED,
            staging: RingBuffer::new(
                vk::BufferUsageFlags::TRANSFER_SRC,
                STAGING_BUFFER_INITIAL_SIZE,
                true,
            ),
            updates: Vec::new(),
            weak: true,
        }
    }

    /// [`init_weak`](Self::init_weak) for the common single-level,
    /// single-layer 2D case (swapchain images).
    pub fn init_weak_2d(image: vk::Image, format: vk::Format, extent: vk::Extent2D) -> ImageResource {
        ImageResource::init_weak(
            image,
            format,
            vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            1,
            1,
        )
    }

    pub fn image(&self) -> vk::Image {
        self.image.get()
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn aspect(&self) -> vk::ImageAspectFlags {
        self.aspect
    }

    pub fn extent(&self) -> vk::Extent3D {
        self.extent
    }

    pub fn level_count(&self) -> u32 {
        self.level_count
    }

    pub fn layer_count(&self) -> u32 {
        self.layer_count
    }

    pub fn current_layout(&self) -> ImageLayout {
        self.current_layout
    }

    pub fn current_vk_layout(&self) -> vk::ImageLayout {
        layout_entry(self.current_layout).layout
    }

    pub fn current_queue_family(&self) -> u32 {
        self.current_queue_family
    }

    pub fn staged_update_count(&self) -> usize {
        self.updates.len()
    }

    pub fn has_staged_updates(&self) -> bool {
        !self.updates.is_empty()
    }

    pub fn staging_ring(&self) -> &RingBuffer {
        &self.staging
    }

    /// Raises the staging ring alignment; see [`RingBuffer::require_alignment`].
    pub fn require_staging_alignment(&mut self, non_coherent_atom_size: u64, alignment: u64) {
        self.staging.require_alignment(non_coherent_atom_size, alignment);
    }

    /// Moves the image to `new_layout` under `new_queue_family`, emitting at
    /// most one barrier:
    ///
    /// - nothing, when layout and family are unchanged and the layout is
    ///   read-only;
    /// - an execution barrier, when they are unchanged but the layout is
    ///   write-typical;
    /// - a full image memory barrier otherwise, with masks and stages from
    ///   the layout table and a queue ownership transfer when the families
    ///   differ.
    pub fn transition<E: CommandEncoder>(
        &mut self,
        encoder: &mut E,
        new_layout: ImageLayout,
        new_queue_family: u32,
    ) {
        match plan_transition(
            self.current_layout,
            self.current_queue_family,
            new_layout,
            new_queue_family,
        ) {
            TransitionPlan::None => {}
            TransitionPlan::Execution(stage) => {
                encoder.execution_barrier(stage, stage);
            }
            TransitionPlan::Full { from, to } => {
                let barrier = vk::ImageMemoryBarrier {
                    src_access_mask: from.src_access_mask,
                    dst_access_mask: to.dst_access_mask,
                    old_layout: from.layout,
                    new_layout: to.layout,
                    src_queue_family_index: self.current_queue_family,
                    dst_queue_family_index: new_queue_family,
                    image: self.image.get(),
                    subresource_range: vk::ImageSubresourceRange {
                        aspect_mask: self.aspect,
                        base_mip_level: 0,
                        level_count: self.level_count,
                        base_array_layer: 0,
                        layer_count: self.layer_count,
                    },
                    ..Default::default()
                };
                encoder.image_barrier(from.src_stage_mask, to.dst_stage_mask, &barrier);
            }
        }
        self.current_layout = new_layout;
        self.current_queue_family = new_queue_family;
    }

    /// [`transition`](Self::transition) keeping the current queue family.
    pub fn change_layout<E: CommandEncoder>(&mut self, encoder: &mut E, new_layout: ImageLayout) {
        let queue_family = self.current_queue_family;
        self.transition(encoder, new_layout, queue_family);
    }

    /// Records an immediate color clear. The image must already be in
    /// TransferDst.
    pub fn clear_color<E: CommandEncoder>(
        &mut self,
        encoder: &mut E,
        color: vk::ClearColorValue,
        base_level: u32,
        level_count: u32,
        base_layer: u32,
        layer_count: u32,
    ) {
        assert_eq!(self.current_layout, ImageLayout::TransferDst);
        let range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: base_level,
            level_count,
            base_array_layer: base_layer,
            layer_count,
        };
        encoder.clear_color_image(self.image.get(), self.current_vk_layout(), &color, &[range]);
    }

    /// Records an immediate depth/stencil clear. The image must already be
    /// in TransferDst.
    pub fn clear_depth_stencil<E: CommandEncoder>(
        &mut self,
        encoder: &mut E,
        clear_aspects: vk::ImageAspectFlags,
        value: vk::ClearDepthStencilValue,
        base_level: u32,
        level_count: u32,
        base_layer: u32,
        layer_count: u32,
    ) {
        assert_eq!(self.current_layout, ImageLayout::TransferDst);
        let range = vk::ImageSubresourceRange {
            aspect_mask: clear_aspects,
            base_mip_level: base_level,
            level_count,
            base_array_layer: base_layer,
            layer_count,
        };
        encoder.clear_depth_stencil_image(
            self.image.get(),
            self.current_vk_layout(),
            &value,
            &[range],
        );
    }

    fn clear_value<E: CommandEncoder>(
        &mut self,
        encoder: &mut E,
        value: vk::ClearValue,
        level: u32,
        base_layer: u32,
        layer_count: u32,
    ) {
        let aspect = self.aspect;
        if aspect.intersects(vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL) {
            let depth_stencil = unsafe { value.depth_stencil };
            self.clear_depth_stencil(encoder, aspect, depth_stencil, level, 1, base_layer, layer_count);
        } else {
            let color = unsafe { value.color };
            self.clear_color(encoder, color, level, 1, base_layer, layer_count);
        }
    }

    /// Image-to-image copy. The source must be in TransferSrc, the
    /// destination in TransferDst.
    pub fn copy<E: CommandEncoder>(
        encoder: &mut E,
        src: &ImageResource,
        dst: &ImageResource,
        region: &vk::ImageCopy,
    ) {
        assert_eq!(src.current_layout, ImageLayout::TransferSrc);
        assert_eq!(dst.current_layout, ImageLayout::TransferDst);
        encoder.copy_image(
            src.image(),
            src.current_vk_layout(),
            dst.image(),
            dst.current_vk_layout(),
            slice::from_ref(region),
        );
    }

    /// Fills levels `1..=max_level` by blitting each level from the previous
    /// one, with a transfer barrier per level. Leaves the whole image in
    /// TransferSrc. The caller picks the blit filter (linear when the format
    /// supports linear filtering).
    pub fn generate_mipmaps<E: CommandEncoder>(
        &mut self,
        encoder: &mut E,
        max_level: u32,
        filter: vk::Filter,
    ) {
        assert!(max_level < self.level_count);
        self.change_layout(encoder, ImageLayout::TransferDst);

        let mut mip_width = self.extent.width as i32;
        let mut mip_height = self.extent.height as i32;

        let mut barrier = vk::ImageMemoryBarrier {
            src_access_mask: vk::AccessFlags::TRANSFER_WRITE,
            dst_access_mask: vk::AccessFlags::TRANSFER_READ,
            src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            image: self.image.get(),
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: self.layer_count,
            },
            ..Default::default()
        };

        for level in 1..=max_level {
            let next_width = (mip_width / 2).max(1);
            let next_height = (mip_height / 2).max(1);

            // All layers of the previous level at once.
            barrier.subresource_range.base_mip_level = level - 1;
            barrier.old_layout = self.current_vk_layout();
            barrier.new_layout = vk::ImageLayout::TRANSFER_SRC_OPTIMAL;
            encoder.image_barrier(
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::TRANSFER,
                &barrier,
            );

            let blit = vk::ImageBlit {
                src_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: level - 1,
                    base_array_layer: 0,
                    layer_count: self.layer_count,
                },
                src_offsets: [
                    vk::Offset3D { x: 0, y: 0, z: 0 },
                    vk::Offset3D {
                        x: mip_width,
                        y: mip_height,
                        z: 1,
                    },
                ],
                dst_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: level,
                    base_array_layer: 0,
                    layer_count: self.layer_count,
                },
                dst_offsets: [
                    vk::Offset3D { x: 0, y: 0, z: 0 },
                    vk::Offset3D {
                        x: next_width,
                        y: next_height,
                        z: 1,
                    },
                ],
            };

            mip_width = next_width;
            mip_height = next_height;

            encoder.blit_image(
                self.image.get(),
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                self.image.get(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[blit],
                filter,
            );
        }

        // Bring the last level in line with the others so the whole image
        // can be declared TransferSrc.
        barrier.subresource_range.base_mip_level = max_level;
        barrier.old_layout = vk::ImageLayout::TRANSFER_DST_OPTIMAL;
        barrier.new_layout = vk::ImageLayout::TRANSFER_SRC_OPTIMAL;
        encoder.image_barrier(
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::TRANSFER,
            &barrier,
        );

        self.current_layout = ImageLayout::TransferSrc;
    }

    /// Queues a clear. Clears can arrive out of order with respect to other
    /// staged changes but are meant to apply first, so they go to the front
    /// of the queue. Pass `vk::REMAINING_ARRAY_LAYERS` to clear the entire
    /// level.
    pub fn stage_clear(&mut self, value: vk::ClearValue, level: u32, base_layer: u32, layer_count: u32) {
        self.updates.insert(
            0,
            SubresourceUpdate::Clear {
                value,
                level,
                base_layer,
                layer_count,
            },
        );
    }

    /// Copies `data` into the staging ring and queues a buffer-to-image copy
    /// of it. Pitches are computed from `extent` and `bytes_per_pixel` with
    /// checked arithmetic.
    pub fn stage_update<A: StoreAllocator>(
        &mut self,
        allocator: &A,
        timeline: &SubmissionTimeline,
        garbage: &mut GarbageList,
        level: u32,
        base_layer: u32,
        layer_count: u32,
        offset: vk::Offset3D,
        extent: vk::Extent3D,
        bytes_per_pixel: u32,
        data: &[u8],
    ) -> Result<()> {
        let row_pitch = (extent.width as u64)
            .checked_mul(bytes_per_pixel as u64)
            .ok_or(Error::ArithmeticOverflow)?;
        let depth_pitch = row_pitch
            .checked_mul(extent.height as u64)
            .ok_or(Error::ArithmeticOverflow)?;
        let total_size = depth_pitch
            .checked_mul(extent.depth as u64)
            .ok_or(Error::ArithmeticOverflow)?;
        assert!(data.len() as u64 >= total_size);

        let staging = self.staging.allocate(allocator, timeline, garbage, total_size)?;
        // The staging ring is host-visible, so the pointer is live.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), staging.ptr, total_size as usize);
        }

        let region = vk::BufferImageCopy {
            buffer_offset: staging.offset,
            buffer_row_length: extent.width,
            buffer_image_height: extent.height,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: self.aspect,
                mip_level: level,
                base_array_layer: base_layer,
                layer_count,
            },
            image_offset: offset,
            image_extent: extent,
        };
        self.updates.push(SubresourceUpdate::Buffer {
            buffer: staging.buffer,
            region,
        });
        Ok(())
    }

    /// Queues a buffer-to-image copy of `allocation_size` staging bytes and
    /// returns the mapped pointer so the caller formats pixels in place.
    pub fn stage_update_and_get_data<A: StoreAllocator>(
        &mut self,
        allocator: &A,
        timeline: &SubmissionTimeline,
        garbage: &mut GarbageList,
        allocation_size: u64,
        level: u32,
        base_layer: u32,
        layer_count: u32,
        offset: vk::Offset3D,
        extent: vk::Extent3D,
    ) -> Result<*mut u8> {
        let staging = self
            .staging
            .allocate(allocator, timeline, garbage, allocation_size)?;

        let region = vk::BufferImageCopy {
            buffer_offset: staging.offset,
            buffer_row_length: extent.width,
            buffer_image_height: extent.height,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: self.aspect,
                mip_level: level,
                base_array_layer: base_layer,
                layer_count,
            },
            image_offset: offset,
            image_extent: extent,
        };
        self.updates.push(SubresourceUpdate::Buffer {
            buffer: staging.buffer,
            region,
        });
        Ok(staging.ptr)
    }

    /// Queues a copy from a caller-managed buffer.
    pub fn stage_copy_from_buffer(&mut self, buffer: vk::Buffer, region: vk::BufferImageCopy) {
        self.updates.push(SubresourceUpdate::Buffer { buffer, region });
    }

    /// Queues a copy from another image, taking ownership of the source
    /// until the update is flushed or released.
    pub fn stage_copy_from_image(&mut self, image: Box<ImageResource>, region: vk::ImageCopy) {
        self.updates.push(SubresourceUpdate::Image { image, region });
    }

    /// Replays queued updates whose target intersects
    /// `[level_start, level_end) x [layer_start, layer_end)`, in queue order,
    /// with the image in TransferDst. Non-intersecting updates stay queued.
    ///
    /// Updates to non-overlapping subresources upload back to back; each
    /// applied update sets bits in a 64-slot (level, layer) window, and an
    /// intersection inserts one barrier and clears the window, which bounds
    /// the number of intra-flush barriers.
    pub fn flush_staged_updates<A: StoreAllocator, E: CommandEncoder>(
        &mut self,
        allocator: &A,
        encoder: &mut E,
        timeline: &SubmissionTimeline,
        garbage: &mut GarbageList,
        level_start: u32,
        level_end: u32,
        layer_start: u32,
        layer_end: u32,
    ) -> Result<()> {
        if self.updates.is_empty() {
            return Ok(());
        }

        let _span = trace_span!("flush_staged_updates", updates = self.updates.len()).entered();

        self.staging.flush(allocator)?;

        let mut uploads_in_progress: u64 = 0;

        self.change_layout(encoder, ImageLayout::TransferDst);

        let updates = mem::take(&mut self.updates);
        let mut kept = Vec::new();
        for update in updates {
            let (level, base_layer, mut layer_count) = update.target();
            if layer_count == vk::REMAINING_ARRAY_LAYERS {
                layer_count = self.layer_count;
            }

            let level_outside = level < level_start || level >= level_end;
            let layers_outside =
                base_layer + layer_count <= layer_start || base_layer >= layer_end;
            if level_outside || layers_outside {
                kept.push(update);
                continue;
            }

            if layer_count >= MAX_PARALLEL_SUBRESOURCE_UPLOAD {
                // More layers than window bits; barrier every time.
                self.change_layout(encoder, ImageLayout::TransferDst);
                uploads_in_progress = u64::MAX;
            } else {
                let hash = subresource_hash(level, base_layer, layer_count, self.layer_count);
                if uploads_in_progress & hash != 0 {
                    self.change_layout(encoder, ImageLayout::TransferDst);
                    uploads_in_progress = 0;
                }
                uploads_in_progress |= hash;
            }

            match update {
                SubresourceUpdate::Clear { value, .. } => {
                    self.clear_value(encoder, value, level, base_layer, layer_count);
                }
                SubresourceUpdate::Buffer { buffer, region } => {
                    encoder.copy_buffer_to_image(
                        buffer,
                        self.image.get(),
                        self.current_vk_layout(),
                        slice::from_ref(&region),
                    );
                }
                SubresourceUpdate::Image { mut image, region } => {
                    image.change_layout(encoder, ImageLayout::TransferSrc);
                    encoder.copy_image(
                        image.image(),
                        image.current_vk_layout(),
                        self.image.get(),
                        self.current_vk_layout(),
                        slice::from_ref(&region),
                    );
                    image.release(allocator, timeline, garbage)?;
                }
            }
        }

        self.updates = kept;

        if self.updates.is_empty() {
            self.staging.release_in_flight(garbage);
        }

        Ok(())
    }

    /// [`flush_staged_updates`](Self::flush_staged_updates) over every level
    /// and layer.
    pub fn flush_all_staged_updates<A: StoreAllocator, E: CommandEncoder>(
        &mut self,
        allocator: &A,
        encoder: &mut E,
        timeline: &SubmissionTimeline,
        garbage: &mut GarbageList,
    ) -> Result<()> {
        let levels = self.level_count;
        let layers = self.layer_count;
        self.flush_staged_updates(allocator, encoder, timeline, garbage, 0, levels, 0, layers)
    }

    /// Drops queued updates whose target is exactly (`level`, `layer`),
    /// releasing any staged source images.
    pub fn remove_staged_updates<A: StoreAllocator>(
        &mut self,
        allocator: &A,
        timeline: &SubmissionTimeline,
        garbage: &mut GarbageList,
        level: u32,
        layer: u32,
    ) -> Result<()> {
        let updates = mem::take(&mut self.updates);
        for update in updates {
            if update.is_update_to_level_layer(level, layer) {
                update.release(allocator, timeline, garbage)?;
            } else {
                self.updates.push(update);
            }
        }
        Ok(())
    }

    /// Discards every queued update and retires the staging ring.
    pub fn release_staged_updates<A: StoreAllocator>(
        &mut self,
        allocator: &A,
        timeline: &SubmissionTimeline,
        garbage: &mut GarbageList,
    ) -> Result<()> {
        for update in mem::take(&mut self.updates) {
            update.release(allocator, timeline, garbage)?;
        }
        self.staging.release(allocator, timeline, garbage)
    }

    /// Retires the image through the garbage list under the current serial.
    pub fn release<A: StoreAllocator>(
        mut self,
        allocator: &A,
        timeline: &SubmissionTimeline,
        garbage: &mut GarbageList,
    ) -> Result<()> {
        self.release_staged_updates(allocator, timeline, garbage)?;
        let image = self.image.take();
        if !self.weak {
            garbage.discard(
                timeline.current_serial(),
                Garbage::Image(image, self.allocation.take()),
            );
        }
        Ok(())
    }

    /// Destroys the image immediately. Only valid once the device is idle;
    /// staged updates must have been flushed or released first.
    pub fn destroy(mut self, device: &Device) -> Result<()> {
        assert!(
            self.updates.is_empty(),
            "image destroyed with staged updates pending"
        );
        self.staging.destroy(device)?;
        let image = self.image.take();
        if !self.weak {
            device.destroy_image_raw(image, self.allocation.take());
        }
        Ok(())
    }
}
