//! Native Vulkan backend implementation using ash.
//!
//! The backend does not create the instance or device: the embedder hands in
//! an initialized `ash::Device`, the queue used for both graphics submissions
//! and sparse binding, and that queue's family index. Upload pages are
//! allocated from host-visible memory through gpu-allocator.
//!
//! The backend must be dropped before the device is destroyed.

mod allocator;
mod command;

use std::time::Duration;

use ash::vk;
use gpu_allocator::vulkan::Allocator;
use parking_lot::Mutex;

use crate::deferred::DeferredCommand;
use crate::error::GraphicsError;
use crate::types::{
    CommandBufferSlot, DescriptorBinding, DescriptorResources, DescriptorWrite, QueueSubmit,
    SparseBufferBind,
};
use xegpu_core::profiling::profile_scope;

use super::GpuBackend;

pub use allocator::VulkanUploadMemory;

/// Vulkan-based GPU backend using ash.
pub struct VulkanBackend {
    /// Logical device, owned by the embedder.
    device: ash::Device,
    /// Queue receiving submissions and sparse binds.
    queue: vk::Queue,
    /// Family of `queue`, used for command pools.
    queue_family_index: u32,
    /// Allocator for upload pages.
    allocator: Mutex<Allocator>,
}

impl VulkanBackend {
    /// Wrap an already initialized device and queue.
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        queue_family_index: u32,
        queue: vk::Queue,
    ) -> Result<Self, GraphicsError> {
        let allocator = allocator::create_allocator(instance, physical_device, device.clone())?;
        log::info!(
            "Vulkan command backend initialized (queue family {})",
            queue_family_index
        );
        Ok(Self {
            device,
            queue,
            queue_family_index,
            allocator: Mutex::new(allocator),
        })
    }

    /// Get the logical device.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }
}

impl std::fmt::Debug for VulkanBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanBackend")
            .field("queue", &self.queue)
            .field("queue_family_index", &self.queue_family_index)
            .finish_non_exhaustive()
    }
}

impl GpuBackend for VulkanBackend {
    type UploadMemory = VulkanUploadMemory;

    fn name(&self) -> &'static str {
        "Vulkan Backend"
    }

    fn create_fence(&self) -> Result<vk::Fence, GraphicsError> {
        let info = vk::FenceCreateInfo::default();
        unsafe { self.device.create_fence(&info, None) }
            .map_err(|e| GraphicsError::from_vk("vkCreateFence", e))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        // SAFETY: the caller only destroys fences that are not in flight.
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<(), GraphicsError> {
        unsafe { self.device.reset_fences(&[fence]) }
            .map_err(|e| GraphicsError::from_vk("vkResetFences", e))
    }

    fn fence_status(&self, fence: vk::Fence) -> Result<bool, GraphicsError> {
        unsafe { self.device.get_fence_status(fence) }
            .map_err(|e| GraphicsError::from_vk("vkGetFenceStatus", e))
    }

    fn wait_for_fences(
        &self,
        fences: &[vk::Fence],
        timeout: Duration,
    ) -> Result<bool, GraphicsError> {
        profile_scope!("vulkan_wait_for_fences");
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        match unsafe { self.device.wait_for_fences(fences, true, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(GraphicsError::from_vk("vkWaitForFences", e)),
        }
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore, GraphicsError> {
        let info = vk::SemaphoreCreateInfo::default();
        unsafe { self.device.create_semaphore(&info, None) }
            .map_err(|e| GraphicsError::from_vk("vkCreateSemaphore", e))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn create_command_buffer_slot(&self) -> Result<CommandBufferSlot, GraphicsError> {
        command::create_command_buffer_slot(&self.device, self.queue_family_index)
    }

    fn destroy_command_buffer_slot(&self, slot: CommandBufferSlot) {
        // Destroying the pool frees its command buffer.
        unsafe { self.device.destroy_command_pool(slot.pool, None) };
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<(), GraphicsError> {
        unsafe {
            self.device
                .reset_command_pool(pool, vk::CommandPoolResetFlags::empty())
        }
        .map_err(|e| GraphicsError::from_vk("vkResetCommandPool", e))
    }

    fn record_commands(
        &self,
        command_buffer: vk::CommandBuffer,
        commands: &[DeferredCommand],
    ) -> Result<(), GraphicsError> {
        profile_scope!("vulkan_record_commands");
        // SAFETY: the command processor resets the slot's pool right before
        // recording and only uses slots whose submission has completed.
        unsafe { command::record_commands(&self.device, command_buffer, commands) }
    }

    fn queue_bind_sparse(
        &self,
        binds: &[SparseBufferBind],
        signal: vk::Semaphore,
    ) -> Result<(), GraphicsError> {
        profile_scope!("vulkan_queue_bind_sparse");
        let memory_binds: Vec<Vec<vk::SparseMemoryBind>> = binds
            .iter()
            .map(|buffer_bind| {
                buffer_bind
                    .binds
                    .iter()
                    .map(|bind| {
                        vk::SparseMemoryBind::default()
                            .resource_offset(bind.resource_offset)
                            .size(bind.size)
                            .memory(bind.memory)
                            .memory_offset(bind.memory_offset)
                    })
                    .collect()
            })
            .collect();
        let buffer_binds: Vec<vk::SparseBufferMemoryBindInfo<'_>> = binds
            .iter()
            .zip(&memory_binds)
            .map(|(buffer_bind, memory)| {
                vk::SparseBufferMemoryBindInfo::default()
                    .buffer(buffer_bind.buffer)
                    .binds(memory)
            })
            .collect();
        let signal_semaphores = [signal];
        let bind_info = vk::BindSparseInfo::default()
            .buffer_binds(&buffer_binds)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device
                .queue_bind_sparse(self.queue, &[bind_info], vk::Fence::null())
        }
        .map_err(|e| {
            log::error!("vkQueueBindSparse failed: {:?}", e);
            GraphicsError::from_vk("vkQueueBindSparse", e)
        })
    }

    fn queue_submit(&self, submit: &QueueSubmit<'_>) -> Result<(), GraphicsError> {
        profile_scope!("vulkan_queue_submit");
        let command_buffers = [submit.command_buffer];
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(submit.wait_semaphores)
            .wait_dst_stage_mask(submit.wait_stages)
            .command_buffers(&command_buffers);

        unsafe {
            self.device
                .queue_submit(self.queue, &[submit_info], submit.fence)
        }
        .map_err(|e| {
            log::error!("vkQueueSubmit failed: {:?}", e);
            GraphicsError::from_vk("vkQueueSubmit", e)
        })
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> Result<vk::DescriptorSetLayout, GraphicsError> {
        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding<'_>> = bindings
            .iter()
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding.binding)
                    .descriptor_type(binding.descriptor_type)
                    .descriptor_count(binding.descriptor_count)
                    .stage_flags(binding.stage_flags)
            })
            .collect();
        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);
        unsafe { self.device.create_descriptor_set_layout(&info, None) }.map_err(|e| {
            GraphicsError::ResourceCreationFailed(format!(
                "Failed to create descriptor set layout: {:?}",
                e
            ))
        })
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> Result<vk::PipelineLayout, GraphicsError> {
        let info = vk::PipelineLayoutCreateInfo::default().set_layouts(set_layouts);
        unsafe { self.device.create_pipeline_layout(&info, None) }.map_err(|e| {
            GraphicsError::ResourceCreationFailed(format!(
                "Failed to create pipeline layout: {:?}",
                e
            ))
        })
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe { self.device.destroy_pipeline_layout(layout, None) };
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool, GraphicsError> {
        let info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes);
        unsafe { self.device.create_descriptor_pool(&info, None) }.map_err(|e| {
            GraphicsError::ResourceCreationFailed(format!(
                "Failed to create descriptor pool: {:?}",
                e
            ))
        })
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> Result<(), GraphicsError> {
        unsafe {
            self.device
                .reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())
        }
        .map_err(|e| GraphicsError::from_vk("vkResetDescriptorPool", e))
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) };
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<Option<vk::DescriptorSet>, GraphicsError> {
        let layouts = [layout];
        let info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        match unsafe { self.device.allocate_descriptor_sets(&info) } {
            Ok(sets) => Ok(sets.first().copied()),
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL) => {
                Ok(None)
            }
            Err(e) => Err(GraphicsError::from_vk("vkAllocateDescriptorSets", e)),
        }
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        // Info arrays must outlive the write structures that point into them.
        let buffer_infos: Vec<Vec<vk::DescriptorBufferInfo>> = writes
            .iter()
            .map(|write| match &write.resources {
                DescriptorResources::UniformBuffer(range) => vec![
                    vk::DescriptorBufferInfo::default()
                        .buffer(range.buffer)
                        .offset(range.offset)
                        .range(range.range),
                ],
                DescriptorResources::StorageBuffers(ranges) => ranges
                    .iter()
                    .map(|range| {
                        vk::DescriptorBufferInfo::default()
                            .buffer(range.buffer)
                            .offset(range.offset)
                            .range(range.range)
                    })
                    .collect(),
                DescriptorResources::CombinedImageSamplers(_) => Vec::new(),
            })
            .collect();
        let image_infos: Vec<Vec<vk::DescriptorImageInfo>> = writes
            .iter()
            .map(|write| match &write.resources {
                DescriptorResources::CombinedImageSamplers(images) => images
                    .iter()
                    .map(|image| {
                        vk::DescriptorImageInfo::default()
                            .sampler(image.sampler)
                            .image_view(image.image_view)
                            .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                    })
                    .collect(),
                _ => Vec::new(),
            })
            .collect();

        let vk_writes: Vec<vk::WriteDescriptorSet<'_>> = writes
            .iter()
            .enumerate()
            .map(|(i, write)| {
                let base = vk::WriteDescriptorSet::default()
                    .dst_set(write.set)
                    .dst_binding(write.binding);
                match &write.resources {
                    DescriptorResources::UniformBuffer(_) => base
                        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                        .buffer_info(&buffer_infos[i]),
                    DescriptorResources::StorageBuffers(_) => base
                        .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                        .buffer_info(&buffer_infos[i]),
                    DescriptorResources::CombinedImageSamplers(_) => base
                        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                        .image_info(&image_infos[i]),
                }
            })
            .collect();

        unsafe { self.device.update_descriptor_sets(&vk_writes, &[]) };
    }

    fn create_upload_memory(&self, size: u64) -> Result<VulkanUploadMemory, GraphicsError> {
        let mut allocator = self.allocator.lock();
        allocator::create_upload_memory(&self.device, &mut allocator, size)
    }

    fn destroy_upload_memory(&self, memory: VulkanUploadMemory) {
        let VulkanUploadMemory {
            buffer, allocation, ..
        } = memory;
        if let Err(e) = self.allocator.lock().free(allocation) {
            log::warn!("Failed to free upload page memory: {}", e);
        }
        unsafe { self.device.destroy_buffer(buffer, None) };
    }

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachment: vk::ImageView,
        extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer, GraphicsError> {
        let attachments = [attachment];
        let info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(&attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        unsafe { self.device.create_framebuffer(&info, None) }.map_err(|e| {
            GraphicsError::ResourceCreationFailed(format!("Failed to create framebuffer: {:?}", e))
        })
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe { self.device.destroy_framebuffer(framebuffer, None) };
    }
}
