//! Collaborators the command processor drives but does not implement.
//!
//! Shared memory emulation, the render target cache, pipeline creation,
//! texture loading and frame capture live outside this crate. The processor
//! talks to them through the traits here and hands them the deferred command
//! buffer of the open submission when they need to record work.

use ash::vk;

use crate::deferred::DeferredCommandBuffer;
use crate::dynamic_state::DynamicStateFlags;
use crate::error::GraphicsError;
use crate::registers::RegisterFile;
use crate::types::{BufferRange, ImageBinding, RenderPassBinding};

/// Guest shader stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Pixel,
}

/// One texture fetch used by a shader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureBinding {
    /// Fetch constant index (0..32) the texture is described by.
    pub fetch_constant: u32,
    /// Whether the shader samples the signed variant of the texture.
    pub signed: bool,
}

/// What the binding resolver needs to know about a translated shader.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TranslatedShader {
    pub stage: Option<ShaderStage>,
    /// Bit `i` set when float constant `i` is read by the shader.
    pub float_constant_map: [u64; 4],
    /// Textures in descriptor binding order.
    pub texture_bindings: Vec<TextureBinding>,
}

impl TranslatedShader {
    pub fn vertex() -> Self {
        Self {
            stage: Some(ShaderStage::Vertex),
            ..Default::default()
        }
    }

    pub fn pixel() -> Self {
        Self {
            stage: Some(ShaderStage::Pixel),
            ..Default::default()
        }
    }

    pub fn with_float_constants(mut self, constants: &[u32]) -> Self {
        for &constant in constants {
            self.float_constant_map[(constant >> 6) as usize & 3] |= 1 << (constant & 63);
        }
        self
    }

    pub fn with_textures(mut self, bindings: Vec<TextureBinding>) -> Self {
        self.texture_bindings = bindings;
        self
    }

    pub fn float_constant_count(&self) -> u32 {
        self.float_constant_map.iter().map(|word| word.count_ones()).sum()
    }

    pub fn texture_count(&self) -> u32 {
        self.texture_bindings.len() as u32
    }
}

/// Host viewport derived from the guest viewport registers, already scaled
/// to host pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ViewportInfo {
    pub xy_offset: [i32; 2],
    pub xy_extent: [u32; 2],
    pub z_min: f32,
    pub z_max: f32,
    pub ndc_scale: [f32; 3],
    pub ndc_offset: [f32; 3],
}

/// A guest pipeline ready to be bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestPipeline {
    pub pipeline: vk::Pipeline,
    /// Parameters the pipeline takes from dynamic state.
    pub dynamic_state: DynamicStateFlags,
}

/// The presenter's guest output image and the pipeline drawing into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestOutput {
    /// Index of the output image in the presenter's ring.
    pub slot: u32,
    /// Changes whenever the image at `slot` is recreated.
    pub version: u64,
    pub image_view: vk::ImageView,
    pub extent: vk::Extent2D,
    pub render_pass: vk::RenderPass,
    pub pipeline: vk::Pipeline,
    pub pipeline_layout: vk::PipelineLayout,
    /// Descriptor set with the frontbuffer source, bound at set 0.
    pub descriptor_set: vk::DescriptorSet,
}

/// Guest memory mirror on the GPU.
pub trait SharedMemory {
    /// Buffer holding guest memory, bound in descriptor set 0.
    fn buffer_range(&self) -> BufferRange;

    /// The open submission is about to be closed.
    fn end_submission(&mut self, command_buffer: &mut DeferredCommandBuffer);

    fn completed_submission_updated(&mut self, completed_submission: u64);

    /// Guest memory in `[base, base + length)` was written behind the GPU's back.
    fn memory_invalidated(&mut self, base: u32, length: u32);

    fn clear_cache(&mut self) {}
}

/// Guest render targets and EDRAM.
pub trait RenderTargetCache {
    /// Buffer emulating EDRAM, bound in descriptor set 0.
    fn edram_buffer_range(&self) -> BufferRange;

    /// Render pass and framebuffer for the guest render target registers.
    fn render_pass_for_draw(
        &mut self,
        registers: &RegisterFile,
    ) -> Result<RenderPassBinding, GraphicsError>;

    /// The open submission is about to be closed.
    fn end_submission(&mut self) {}

    fn completed_submission_updated(&mut self, _completed_submission: u64) {}

    /// Record loading `snapshot` into EDRAM. Called outside a render pass.
    fn restore_edram_snapshot(
        &mut self,
        snapshot: &[u8],
        command_buffer: &mut DeferredCommandBuffer,
    ) -> Result<(), GraphicsError>;

    /// Record the EDRAM resolve set up in the guest copy registers. Called
    /// outside a render pass; only transfer work may be recorded.
    fn resolve(
        &mut self,
        registers: &RegisterFile,
        command_buffer: &mut DeferredCommandBuffer,
    ) -> Result<(), GraphicsError>;

    fn clear_cache(&mut self) {}
}

/// Creates or looks up guest pipelines.
pub trait PipelineProvider {
    fn get_pipeline(
        &mut self,
        vertex_shader: &TranslatedShader,
        pixel_shader: Option<&TranslatedShader>,
        render_pass: vk::RenderPass,
        pipeline_layout: vk::PipelineLayout,
        registers: &RegisterFile,
    ) -> Result<GuestPipeline, GraphicsError>;

    fn clear_cache(&mut self) {}
}

/// Resolves texture fetches to image views and samplers.
pub trait TextureSource {
    fn image_binding(
        &mut self,
        registers: &RegisterFile,
        stage: ShaderStage,
        binding: &TextureBinding,
    ) -> ImageBinding;

    fn completed_submission_updated(&mut self, _completed_submission: u64) {}

    fn clear_cache(&mut self) {}
}

/// External frame capture tool.
pub trait FrameCaptureHook {
    fn begin_capture(&mut self);

    fn end_capture(&mut self);
}

/// Every collaborator the command processor owns.
pub struct Collaborators {
    pub shared_memory: Box<dyn SharedMemory>,
    pub render_targets: Box<dyn RenderTargetCache>,
    pub pipelines: Box<dyn PipelineProvider>,
    pub textures: Box<dyn TextureSource>,
    pub frame_capture: Option<Box<dyn FrameCaptureHook>>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("frame_capture", &self.frame_capture.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_constant_map_bits() {
        let shader = TranslatedShader::vertex().with_float_constants(&[0, 63, 64, 255]);
        assert_eq!(shader.float_constant_map[0], 1 | (1 << 63));
        assert_eq!(shader.float_constant_map[1], 1);
        assert_eq!(shader.float_constant_map[3], 1 << 63);
        assert_eq!(shader.float_constant_count(), 4);
    }

    #[test]
    fn test_texture_count() {
        let shader = TranslatedShader::pixel().with_textures(vec![
            TextureBinding {
                fetch_constant: 0,
                signed: false,
            },
            TextureBinding {
                fetch_constant: 3,
                signed: true,
            },
        ]);
        assert_eq!(shader.texture_count(), 2);
        assert_eq!(shader.stage, Some(ShaderStage::Pixel));
    }
}
