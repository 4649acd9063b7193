mod buffer;
mod command;
mod context;
pub(crate) mod descriptor;
pub mod device;
pub(crate) mod error;
pub(crate) mod handle;
pub(crate) mod image;
pub(crate) mod instance;
pub(crate) mod line_loop;
pub(crate) mod pool;
pub(crate) mod query;
pub(crate) mod ring;
pub(crate) mod semaphore;
pub(crate) mod serial;

pub(crate) use crate::instance::VULKAN_INSTANCE;

pub use crate::buffer::AccessTracker;
pub use crate::buffer::BufferResource;

pub use crate::command::CommandEncoder;
pub use crate::command::CommandRecorder;

pub use crate::context::Context;
pub use crate::context::Garbage;
pub use crate::context::GarbageList;
pub use crate::context::SubmissionTimeline;

pub use crate::descriptor::DescriptorAllocatorId;
pub use crate::descriptor::DynamicDescriptorPool;
pub use crate::descriptor::DEFAULT_DESCRIPTOR_POOL_MAX_SETS;

pub use crate::error::Error;
pub use crate::error::Result;

pub use crate::image::format_aspect_mask;
pub use crate::image::get_vk_sample_count;
pub use crate::image::is_depth_and_stencil_format;
pub use crate::image::is_depth_only_format;
pub use crate::image::is_stencil_only_format;
pub use crate::image::layout_entry;
pub use crate::image::ImageDesc;
pub use crate::image::ImageLayout;
pub use crate::image::ImageResource;
pub use crate::image::LayoutEntry;
pub use crate::image::STAGING_BUFFER_INITIAL_SIZE;

pub use crate::instance::get_instance_extensions;
pub use crate::instance::get_vulkan_entry;
pub use crate::instance::get_vulkan_instance;

pub use crate::line_loop::LineLoopSynthesizer;
pub use crate::line_loop::SynthesizedIndices;

pub use crate::pool::GrowingPool;

pub use crate::query::DynamicQueryPool;
pub use crate::query::PooledQuery;

pub use crate::ring::BackingStore;
pub use crate::ring::RingBuffer;
pub use crate::ring::StoreAllocator;
pub use crate::ring::Suballocation;

pub use crate::semaphore::DynamicSemaphorePool;
pub use crate::semaphore::PooledSemaphore;

pub use crate::serial::Serial;

pub use crate::device::Device;

pub use ash;
pub use ash::vk;
