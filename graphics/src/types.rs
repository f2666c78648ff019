//! Plain value types shared by the command list, the backends and the trackers.
//!
//! These mirror the Vulkan structures they are converted to, but compare by
//! value so recorded commands can be inspected and deduplicated.

use ash::vk;

/// A viewport in framebuffer pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    /// Bitwise comparison, so a NaN field does not compare unequal to itself.
    pub fn bits_eq(&self, other: &Self) -> bool {
        self.x.to_bits() == other.x.to_bits()
            && self.y.to_bits() == other.y.to_bits()
            && self.width.to_bits() == other.width.to_bits()
            && self.height.to_bits() == other.height.to_bits()
            && self.min_depth.to_bits() == other.min_depth.to_bits()
            && self.max_depth.to_bits() == other.max_depth.to_bits()
    }
}

/// An integer rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect2D {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect2D {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// A range of a buffer, as bound to a buffer descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BufferRange {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub range: u64,
}

/// One combined image sampler descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ImageBinding {
    pub image_view: vk::ImageView,
    pub sampler: vk::Sampler,
}

/// Index buffer element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexType {
    U16,
    U32,
}

impl IndexType {
    pub fn to_vk(self) -> vk::IndexType {
        match self {
            Self::U16 => vk::IndexType::UINT16,
            Self::U32 => vk::IndexType::UINT32,
        }
    }
}

/// One region of a buffer-to-buffer copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BufferCopy {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

/// One sparse memory bind of a buffer range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SparseMemoryBind {
    pub resource_offset: u64,
    pub size: u64,
    pub memory: vk::DeviceMemory,
    pub memory_offset: u64,
}

impl SparseMemoryBind {
    /// End of the bound resource range (exclusive).
    pub fn resource_end(&self) -> u64 {
        self.resource_offset.saturating_add(self.size)
    }
}

/// All sparse binds of one buffer within a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseBufferBind {
    pub buffer: vk::Buffer,
    pub binds: Vec<SparseMemoryBind>,
}

/// A render pass instance: pass, framebuffer and render area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderPassBinding {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub render_area: Rect2D,
}

/// One descriptor set layout binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub descriptor_count: u32,
    pub stage_flags: vk::ShaderStageFlags,
}

/// Resources written into one descriptor set binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorResources {
    UniformBuffer(BufferRange),
    StorageBuffers(Vec<BufferRange>),
    CombinedImageSamplers(Vec<ImageBinding>),
}

/// A pending descriptor set write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorWrite {
    pub set: vk::DescriptorSet,
    pub binding: u32,
    pub resources: DescriptorResources,
}

/// A queue submission of one command buffer.
#[derive(Debug, Clone, Copy)]
pub struct QueueSubmit<'a> {
    pub wait_semaphores: &'a [vk::Semaphore],
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub command_buffer: vk::CommandBuffer,
    pub fence: vk::Fence,
}

/// A command pool with the single primary command buffer allocated from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandBufferSlot {
    pub pool: vk::CommandPool,
    pub buffer: vk::CommandBuffer,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_viewport_bits_eq_treats_nan_as_equal() {
        let viewport = Viewport {
            x: f32::NAN,
            ..Default::default()
        };
        assert!(viewport.bits_eq(&viewport));
        assert_ne!(viewport, viewport);
    }

    #[test]
    fn test_sparse_bind_end_saturates() {
        let bind = SparseMemoryBind {
            resource_offset: u64::MAX - 1,
            size: 16,
            ..Default::default()
        };
        assert_eq!(bind.resource_end(), u64::MAX);
    }
}
