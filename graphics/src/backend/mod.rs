//! GPU backend abstraction layer.
//!
//! The command processor never calls the Vulkan API directly. Every device or
//! queue operation it needs goes through [`GpuBackend`], so the whole
//! submission state machine can run against a simulated queue in tests.
//!
//! # Available Backends
//!
//! - [`DummyBackend`] (always built): simulated in-order queue with fault
//!   injection, used by tests and benchmarks
//! - `vulkan-backend` (default): [`vulkan::VulkanBackend`] using ash and
//!   gpu-allocator on a device created by the embedder
//!
//! # Error Contract
//!
//! Methods return [`GraphicsError::DeviceLost`] when the device reports
//! `VK_ERROR_DEVICE_LOST`. Descriptor set allocation reports an exhausted pool
//! as `Ok(None)` so transient pools can move on to a fresh page.

pub mod dummy;

#[cfg(feature = "vulkan-backend")]
pub mod vulkan;

use std::time::Duration;

use ash::vk;

use crate::deferred::DeferredCommand;
use crate::error::GraphicsError;
use crate::types::{
    CommandBufferSlot, DescriptorBinding, DescriptorWrite, QueueSubmit, SparseBufferBind,
};

pub use dummy::DummyBackend;

/// Host-visible memory backing one uniform upload page.
pub trait UploadMemory {
    /// Buffer the page is bound to.
    fn buffer(&self) -> vk::Buffer;

    /// Size of the page in bytes.
    fn size(&self) -> u64;

    /// Persistently mapped contents of the page.
    fn bytes_mut(&mut self) -> &mut [u8];
}

/// Device and queue operations used by the command processor.
pub trait GpuBackend {
    /// Memory type of uniform upload pages.
    type UploadMemory: UploadMemory;

    /// Human-readable backend name.
    fn name(&self) -> &'static str;

    // Synchronization

    fn create_fence(&self) -> Result<vk::Fence, GraphicsError>;

    fn destroy_fence(&self, fence: vk::Fence);

    fn reset_fence(&self, fence: vk::Fence) -> Result<(), GraphicsError>;

    /// Non-blocking check whether a fence is signaled.
    fn fence_status(&self, fence: vk::Fence) -> Result<bool, GraphicsError>;

    /// Block until every fence is signaled.
    ///
    /// Returns `Ok(false)` if the timeout elapsed first.
    fn wait_for_fences(&self, fences: &[vk::Fence], timeout: Duration)
    -> Result<bool, GraphicsError>;

    fn create_semaphore(&self) -> Result<vk::Semaphore, GraphicsError>;

    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    // Command buffers

    /// Create a transient command pool with one primary command buffer.
    fn create_command_buffer_slot(&self) -> Result<CommandBufferSlot, GraphicsError>;

    fn destroy_command_buffer_slot(&self, slot: CommandBufferSlot);

    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<(), GraphicsError>;

    /// Begin `command_buffer`, replay `commands` into it and end it.
    fn record_commands(
        &self,
        command_buffer: vk::CommandBuffer,
        commands: &[DeferredCommand],
    ) -> Result<(), GraphicsError>;

    // Queue

    /// Issue one sparse binding operation signalling `signal`.
    fn queue_bind_sparse(
        &self,
        binds: &[SparseBufferBind],
        signal: vk::Semaphore,
    ) -> Result<(), GraphicsError>;

    fn queue_submit(&self, submit: &QueueSubmit<'_>) -> Result<(), GraphicsError>;

    // Layouts

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> Result<vk::DescriptorSetLayout, GraphicsError>;

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> Result<vk::PipelineLayout, GraphicsError>;

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);

    // Descriptor sets

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool, GraphicsError>;

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> Result<(), GraphicsError>;

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);

    /// Allocate one set, or `Ok(None)` if the pool is out of space.
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<Option<vk::DescriptorSet>, GraphicsError>;

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]);

    // Memory and framebuffers

    fn create_upload_memory(&self, size: u64) -> Result<Self::UploadMemory, GraphicsError>;

    fn destroy_upload_memory(&self, memory: Self::UploadMemory);

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachment: vk::ImageView,
        extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer, GraphicsError>;

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);
}
