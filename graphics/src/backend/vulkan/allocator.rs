//! GPU memory allocator integration using gpu-allocator.

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};

use crate::backend::UploadMemory;
use crate::error::GraphicsError;

/// Create a memory allocator for the Vulkan device.
pub fn create_allocator(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
) -> Result<Allocator, GraphicsError> {
    let allocator = Allocator::new(&AllocatorCreateDesc {
        instance: instance.clone(),
        device,
        physical_device,
        debug_settings: Default::default(),
        buffer_device_address: false,
        allocation_sizes: gpu_allocator::AllocationSizes::default(),
    })
    .map_err(|e| {
        GraphicsError::InitializationFailed(format!("Failed to create memory allocator: {}", e))
    })?;

    Ok(allocator)
}

/// A persistently mapped, host-visible uniform buffer page.
pub struct VulkanUploadMemory {
    pub(super) buffer: vk::Buffer,
    pub(super) allocation: Allocation,
    pub(super) size: u64,
}

impl std::fmt::Debug for VulkanUploadMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanUploadMemory")
            .field("buffer", &self.buffer)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl UploadMemory for VulkanUploadMemory {
    fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        self.allocation.mapped_slice_mut().unwrap_or_default()
    }
}

/// Create and map a uniform buffer page of `size` bytes.
pub fn create_upload_memory(
    device: &ash::Device,
    allocator: &mut Allocator,
    size: u64,
) -> Result<VulkanUploadMemory, GraphicsError> {
    let buffer_info = vk::BufferCreateInfo::default()
        .size(size)
        .usage(vk::BufferUsageFlags::UNIFORM_BUFFER)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let buffer = unsafe { device.create_buffer(&buffer_info, None) }
        .map_err(|e| GraphicsError::from_vk("vkCreateBuffer", e))?;

    let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

    let allocation = match allocator.allocate(&AllocationCreateDesc {
        name: "uniform upload page",
        requirements,
        location: MemoryLocation::CpuToGpu,
        linear: true,
        allocation_scheme: AllocationScheme::GpuAllocatorManaged,
    }) {
        Ok(allocation) => allocation,
        Err(e) => {
            unsafe { device.destroy_buffer(buffer, None) };
            return Err(GraphicsError::ResourceCreationFailed(format!(
                "Failed to allocate upload page memory: {}",
                e
            )));
        }
    };

    if allocation.mapped_ptr().is_none() {
        let _ = allocator.free(allocation);
        unsafe { device.destroy_buffer(buffer, None) };
        return Err(GraphicsError::ResourceCreationFailed(
            "upload page memory is not host-mapped".to_string(),
        ));
    }

    if let Err(e) = unsafe { device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) } {
        let _ = allocator.free(allocation);
        unsafe { device.destroy_buffer(buffer, None) };
        return Err(GraphicsError::from_vk("vkBindBufferMemory", e));
    }

    Ok(VulkanUploadMemory {
        buffer,
        allocation,
        size,
    })
}
