//! Device and queue selection, plus raw creation of memory-backed resources.
//!
//! Everything here hands out plain handles; lifetime tracking lives in the
//! resource wrappers ([`BufferResource`](crate::BufferResource),
//! [`ImageResource`](crate::ImageResource)) and in the
//! [`Context`](crate::Context) garbage list.

use crate::{
    error::Result,
    ring::{BackingStore, StoreAllocator},
    VULKAN_INSTANCE,
};
use ash::{
    version::{DeviceV1_0, InstanceV1_0},
    vk,
};
use std::{ffi::CStr, os::raw::c_void, ptr};
use tracing::trace;

pub(crate) const MAX_QUEUES: usize = 4;

/// Defines the queue indices for each usage (graphics, compute, transfer).
#[derive(Copy, Clone, Default)]
pub(crate) struct QueueIndices {
    /// The queue that should be used for graphics operations. It is also guaranteed to support compute and transfer operations.
    pub graphics: u8,
    /// The queue that should be used for asynchronous compute operations.
    pub compute: u8,
    /// The queue that should be used for asynchronous transfer operations.
    pub transfer: u8,
}

/// Information about the queues of a device.
#[derive(Copy, Clone, Default)]
pub(crate) struct QueuesInfo {
    /// Number of created queues.
    pub queue_count: usize,
    /// Queue indices by usage.
    pub indices: QueueIndices,
    /// The queue family index of each queue. The first `queue_count` entries are valid, the rest is unspecified.
    pub families: [u32; MAX_QUEUES],
    /// The queue handle of each queue. The first `queue_count` entries are valid, the rest is unspecified.
    pub queues: [vk::Queue; MAX_QUEUES],
}

/// A created buffer and its bound device memory.
pub(crate) struct BufferAllocation {
    pub handle: vk::Buffer,
    pub allocation: vk_mem::Allocation,
    /// Persistent mapping, null for device-local buffers.
    pub mapped: *mut u8,
}

/// A created image and its bound device memory.
pub(crate) struct ImageAllocation {
    pub handle: vk::Image,
    pub allocation: vk_mem::Allocation,
}

pub struct Device {
    pub device: ash::Device,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) physical_device_properties: vk::PhysicalDeviceProperties,
    pub(crate) physical_device_memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub(crate) graphics_queue_family: u32,
    pub(crate) compute_queue_family: u32,
    pub(crate) transfer_queue_family: u32,
    pub(crate) queues_info: QueuesInfo,
    pub(crate) allocator: vk_mem::Allocator,
}

struct PhysicalDeviceAndProperties {
    phy: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
}

unsafe fn select_physical_device(instance: &ash::Instance) -> PhysicalDeviceAndProperties {
    let physical_devices = instance
        .enumerate_physical_devices()
        .expect("failed to enumerate physical devices");
    if physical_devices.len() == 0 {
        panic!("no device with vulkan support");
    }

    let mut selected_phy = None;
    let mut selected_phy_properties = Default::default();
    for phy in physical_devices {
        let props = instance.get_physical_device_properties(phy);
        if props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            selected_phy = Some(phy);
            selected_phy_properties = props;
        }
    }
    // TODO fallbacks

    let phy = selected_phy.expect("no suitable physical device");
    PhysicalDeviceAndProperties {
        phy,
        properties: selected_phy_properties,
        memory_properties: instance.get_physical_device_memory_properties(phy),
    }
}

fn find_queue_family(queue_families: &[vk::QueueFamilyProperties], flags: vk::QueueFlags) -> u32 {
    let mut best_queue_family: Option<u32> = None;
    let mut best_flags = 0u32;
    let mut index = 0u32;
    for queue_family in queue_families {
        if queue_family.queue_flags.contains(flags) {
            if let Some(ref mut i) = best_queue_family {
                // there was already a queue for the specified usage,
                // change it only if it is more specialized.
                // to determine if it is more specialized, count number of bits (XXX sketchy?)
                if queue_family.queue_flags.as_raw().count_ones() < best_flags.count_ones() {
                    *i = index;
                    best_flags = queue_family.queue_flags.as_raw();
                }
            } else {
                best_queue_family = Some(index);
                best_flags = queue_family.queue_flags.as_raw();
            }
        }
        index += 1;
    }

    best_queue_family.expect("could not find a compatible queue")
}

impl Device {
    pub fn new() -> Device {
        unsafe {
            let instance = &*VULKAN_INSTANCE;

            let phy = select_physical_device(instance);
            let queue_family_properties =
                instance.get_physical_device_queue_family_properties(phy.phy);

            let graphics_queue_family =
                find_queue_family(&queue_family_properties, vk::QueueFlags::GRAPHICS);
            let compute_queue_family =
                find_queue_family(&queue_family_properties, vk::QueueFlags::COMPUTE);
            let transfer_queue_family =
                find_queue_family(&queue_family_properties, vk::QueueFlags::TRANSFER);

            eprintln!(
                "Selected physical device: {:?}",
                CStr::from_ptr(phy.properties.device_name.as_ptr())
            );

            eprintln!(
                "Graphics queue family: {} ({:?})",
                graphics_queue_family,
                queue_family_properties[graphics_queue_family as usize].queue_flags
            );
            eprintln!(
                "Compute queue family: {} ({:?})",
                compute_queue_family,
                queue_family_properties[compute_queue_family as usize].queue_flags
            );
            eprintln!(
                "Transfer queue family: {} ({:?})",
                transfer_queue_family,
                queue_family_properties[transfer_queue_family as usize].queue_flags
            );

            let mut device_queue_create_infos = Vec::<vk::DeviceQueueCreateInfo>::new();
            let queue_priorities = [1.0f32];
            for &f in &[
                graphics_queue_family,
                compute_queue_family,
                transfer_queue_family,
            ] {
                let already_created = device_queue_create_infos
                    .iter()
                    .any(|ci| ci.queue_family_index == f);
                if already_created {
                    continue;
                }

                device_queue_create_infos.push(vk::DeviceQueueCreateInfo {
                    flags: Default::default(),
                    queue_family_index: f,
                    queue_count: 1,
                    p_queue_priorities: queue_priorities.as_ptr(),
                    ..Default::default()
                });
            }

            let mut timeline_features = vk::PhysicalDeviceTimelineSemaphoreFeatures {
                timeline_semaphore: vk::TRUE,
                ..Default::default()
            };

            let mut features2 = vk::PhysicalDeviceFeatures2 {
                p_next: &mut timeline_features as *mut _ as *mut c_void,
                features: Default::default(),
                ..Default::default()
            };

            let device_create_info = vk::DeviceCreateInfo {
                p_next: &mut features2 as *mut _ as *mut c_void,
                flags: Default::default(),
                queue_create_info_count: device_queue_create_infos.len() as u32,
                p_queue_create_infos: device_queue_create_infos.as_ptr(),
                enabled_layer_count: 0,
                pp_enabled_layer_names: ptr::null(),
                enabled_extension_count: 0,
                pp_enabled_extension_names: ptr::null(),
                p_enabled_features: ptr::null(),
                ..Default::default()
            };

            let device = instance
                .create_device(phy.phy, &device_create_info, None)
                .expect("could not create vulkan device");
            let graphics_queue = device.get_device_queue(graphics_queue_family, 0);
            let compute_queue = device.get_device_queue(compute_queue_family, 0);
            let transfer_queue = device.get_device_queue(transfer_queue_family, 0);

            // queues are accessed by index. there are three different indices
            // - graphics
            // - compute
            // - transfer
            // Some of those indices may be equal. E.g. the graphics and compute queues might be the
            // same, and graphics == compute.
            let graphics_queue_index: u8 = 0u8;
            let compute_queue_index: u8 = if compute_queue == graphics_queue {
                0
            } else {
                1
            };
            let transfer_queue_index: u8 = if transfer_queue == graphics_queue {
                0
            } else if transfer_queue == compute_queue {
                1
            } else {
                2
            };

            let mut queues_info = QueuesInfo::default();

            queues_info.queues[graphics_queue_index as usize] = graphics_queue;
            queues_info.queues[compute_queue_index as usize] = compute_queue;
            queues_info.queues[transfer_queue_index as usize] = transfer_queue;

            queues_info.families[graphics_queue_index as usize] = graphics_queue_family;
            queues_info.families[compute_queue_index as usize] = compute_queue_family;
            queues_info.families[transfer_queue_index as usize] = transfer_queue_family;

            queues_info.indices = QueueIndices {
                graphics: graphics_queue_index,
                compute: compute_queue_index,
                transfer: transfer_queue_index,
            };

            queues_info.queue_count = *[
                graphics_queue_index,
                compute_queue_index,
                transfer_queue_index,
            ]
            .iter()
            .max()
            .unwrap() as usize
                + 1;

            let allocator_create_info = vk_mem::AllocatorCreateInfo {
                physical_device: phy.phy,
                device: device.clone(),     // not cheap!
                instance: instance.clone(), // not cheap!
                flags: Default::default(),
                preferred_large_heap_block_size: 0, // default
                frame_in_use_count: 2,
                heap_size_limits: None,
            };

            let allocator = vk_mem::Allocator::new(&allocator_create_info)
                .expect("failed to create VMA allocator");

            Device {
                device,
                physical_device: phy.phy,
                physical_device_properties: phy.properties,
                physical_device_memory_properties: phy.memory_properties,
                graphics_queue_family,
                compute_queue_family,
                transfer_queue_family,
                queues_info,
                allocator,
            }
        }
    }

    pub fn graphics_queue(&self) -> vk::Queue {
        self.queues_info.queues[self.queues_info.indices.graphics as usize]
    }

    pub fn graphics_queue_family(&self) -> u32 {
        self.graphics_queue_family
    }

    pub fn compute_queue_family(&self) -> u32 {
        self.compute_queue_family
    }

    pub fn transfer_queue_family(&self) -> u32 {
        self.transfer_queue_family
    }

    /// Size of the flush granule for non-coherent host-visible memory.
    pub fn non_coherent_atom_size(&self) -> u64 {
        self.physical_device_properties.limits.non_coherent_atom_size
    }

    pub(crate) fn is_memory_type_coherent(&self, memory_type_index: u32) -> bool {
        self.physical_device_memory_properties.memory_types[memory_type_index as usize]
            .property_flags
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }

    fn buffer_sharing_mode(&self) -> vk::SharingMode {
        if self.queues_info.queue_count == 1 {
            vk::SharingMode::EXCLUSIVE
        } else {
            vk::SharingMode::CONCURRENT
        }
    }

    pub(crate) fn create_buffer_raw(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        host_visible: bool,
    ) -> Result<BufferAllocation> {
        let create_info = vk::BufferCreateInfo {
            flags: Default::default(),
            size,
            usage,
            sharing_mode: self.buffer_sharing_mode(),
            queue_family_index_count: self.queues_info.queue_count as u32,
            p_queue_family_indices: self.queues_info.families.as_ptr(),
            ..Default::default()
        };
        let handle = unsafe { self.device.create_buffer(&create_info, None)? };
        let mem_req = unsafe { self.device.get_buffer_memory_requirements(handle) };
        let allocation_create_info = vk_mem::AllocationCreateInfo {
            flags: if host_visible {
                vk_mem::AllocationCreateFlags::MAPPED
            } else {
                vk_mem::AllocationCreateFlags::NONE
            },
            usage: if host_visible {
                vk_mem::MemoryUsage::CpuToGpu
            } else {
                vk_mem::MemoryUsage::GpuOnly
            },
            ..Default::default()
        };
        let (allocation, allocation_info) = match self
            .allocator
            .allocate_memory(&mem_req, &allocation_create_info)
        {
            Ok(ok) => ok,
            Err(err) => {
                // don't leak the handle when the memory is what failed
                unsafe { self.device.destroy_buffer(handle, None) };
                return Err(err.into());
            }
        };
        if let Err(err) = unsafe {
            self.device.bind_buffer_memory(
                handle,
                allocation_info.get_device_memory(),
                allocation_info.get_offset() as u64,
            )
        } {
            let _ = self.allocator.free_memory(&allocation);
            unsafe { self.device.destroy_buffer(handle, None) };
            return Err(err.into());
        }
        let mapped = if host_visible {
            allocation_info.get_mapped_data()
        } else {
            ptr::null_mut()
        };
        trace!(size, usage = ?usage, "created buffer");
        Ok(BufferAllocation {
            handle,
            allocation,
            mapped,
        })
    }

    pub(crate) fn destroy_buffer_raw(
        &self,
        buffer: vk::Buffer,
        allocation: Option<vk_mem::Allocation>,
    ) {
        if let Some(allocation) = allocation {
            self.allocator.free_memory(&allocation).unwrap();
        }
        unsafe { self.device.destroy_buffer(buffer, None) };
    }

    pub(crate) fn create_image_raw(
        &self,
        create_info: &vk::ImageCreateInfo,
    ) -> Result<ImageAllocation> {
        let handle = unsafe { self.device.create_image(create_info, None)? };
        let mem_req = unsafe { self.device.get_image_memory_requirements(handle) };
        let allocation_create_info = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::GpuOnly,
            ..Default::default()
        };
        let (allocation, allocation_info) = match self
            .allocator
            .allocate_memory(&mem_req, &allocation_create_info)
        {
            Ok(ok) => ok,
            Err(err) => {
                unsafe { self.device.destroy_image(handle, None) };
                return Err(err.into());
            }
        };
        if let Err(err) = unsafe {
            self.device.bind_image_memory(
                handle,
                allocation_info.get_device_memory(),
                allocation_info.get_offset() as u64,
            )
        } {
            let _ = self.allocator.free_memory(&allocation);
            unsafe { self.device.destroy_image(handle, None) };
            return Err(err.into());
        }
        trace!(extent = ?create_info.extent, format = ?create_info.format, "created image");
        Ok(ImageAllocation { handle, allocation })
    }

    pub(crate) fn destroy_image_raw(
        &self,
        image: vk::Image,
        allocation: Option<vk_mem::Allocation>,
    ) {
        if let Some(allocation) = allocation {
            self.allocator.free_memory(&allocation).unwrap();
        }
        unsafe { self.device.destroy_image(image, None) };
    }
}

impl StoreAllocator for Device {
    fn create_store(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        host_visible: bool,
    ) -> Result<BackingStore> {
        let buffer_create_info = vk::BufferCreateInfo {
            flags: Default::default(),
            size,
            usage,
            sharing_mode: self.buffer_sharing_mode(),
            queue_family_index_count: self.queues_info.queue_count as u32,
            p_queue_family_indices: self.queues_info.families.as_ptr(),
            ..Default::default()
        };
        let allocation_create_info = vk_mem::AllocationCreateInfo {
            usage: if host_visible {
                vk_mem::MemoryUsage::CpuToGpu
            } else {
                vk_mem::MemoryUsage::GpuOnly
            },
            ..Default::default()
        };
        let (buffer, allocation, allocation_info) = self
            .allocator
            .create_buffer(&buffer_create_info, &allocation_create_info)?;
        let coherent =
            !host_visible || self.is_memory_type_coherent(allocation_info.get_memory_type());
        Ok(BackingStore::new(buffer, Some(allocation), size, coherent))
    }

    fn map_store(&self, store: &mut BackingStore) -> Result<()> {
        let ptr = {
            let allocation = store
                .allocation()
                .expect("backing store has no device allocation");
            self.allocator.map_memory(allocation)?
        };
        store.set_mapped(ptr);
        Ok(())
    }

    fn unmap_store(&self, store: &mut BackingStore) -> Result<()> {
        {
            let allocation = store
                .allocation()
                .expect("backing store has no device allocation");
            self.allocator.unmap_memory(allocation)?;
        }
        store.clear_mapped();
        Ok(())
    }

    fn flush_store(&self, store: &BackingStore, offset: u64, size: u64) -> Result<()> {
        let allocation = store
            .allocation()
            .expect("backing store has no device allocation");
        self.allocator
            .flush_allocation(allocation, offset as usize, size as usize)?;
        Ok(())
    }

    fn invalidate_store(&self, store: &BackingStore, offset: u64, size: u64) -> Result<()> {
        let allocation = store
            .allocation()
            .expect("backing store has no device allocation");
        self.allocator
            .invalidate_allocation(allocation, offset as usize, size as usize)?;
        Ok(())
    }

    fn destroy_store(&self, mut store: BackingStore) -> Result<()> {
        assert!(!store.is_mapped(), "backing store is still mapped");
        let buffer = store.take_buffer();
        match store.take_allocation() {
            Some(allocation) => self.allocator.destroy_buffer(buffer, &allocation)?,
            None => unsafe { self.device.destroy_buffer(buffer, None) },
        }
        Ok(())
    }
}
