//! Common utilities for command processor integration tests.
//!
//! Fake collaborators record what the processor asks of them into a shared
//! [`EventLog`], so tests can check ordering against the backend's queue log.

#![allow(dead_code)]

use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;
use parking_lot::Mutex;

use xegpu_graphics::deferred::DeferredCommandBuffer;
use xegpu_graphics::registers::RegisterFile;
use xegpu_graphics::types::{BufferCopy, BufferRange, ImageBinding, Rect2D, RenderPassBinding};
use xegpu_graphics::{
    Collaborators, CommandProcessor, DrawPrimitive, DrawRequest, DummyBackend, DynamicStateFlags,
    FrameCaptureHook, GraphicsError, GuestOutput, GuestPipeline, PipelineProvider,
    ProcessorConfig, RenderTargetCache, ShaderStage, SharedMemory, TextureBinding, TextureSource,
    TranslatedShader, ViewportInfo,
};

// ============================================================================
// Event Log
// ============================================================================

/// Something a fake collaborator was asked to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    SharedMemoryEndSubmission,
    SharedMemoryCompleted(u64),
    MemoryInvalidated { base: u32, length: u32 },
    RenderTargetsEndSubmission,
    RenderTargetsCompleted(u64),
    EdramRestored(usize),
    Resolved,
    PipelineRequested { textures_pixel: u32, textures_vertex: u32 },
    TexturesCompleted(u64),
    CacheCleared(&'static str),
    CaptureBegan,
    CaptureEnded,
}

/// Shared, cloneable log of collaborator events.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<Event>>>);

impl EventLog {
    pub fn push(&self, event: Event) {
        self.0.lock().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().clone()
    }

    pub fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.0.lock().iter().filter(|e| predicate(e)).count()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

// ============================================================================
// Fake Collaborators
// ============================================================================

pub const SHARED_MEMORY_BUFFER: u64 = 0xA000_0001;
pub const EDRAM_BUFFER: u64 = 0xA000_0002;
pub const GUEST_RENDER_PASS: u64 = 0xB000_0001;
pub const GUEST_FRAMEBUFFER: u64 = 0xB000_0002;
pub const GUEST_PIPELINE: u64 = 0xC000_0001;

pub struct FakeSharedMemory {
    pub log: EventLog,
}

impl SharedMemory for FakeSharedMemory {
    fn buffer_range(&self) -> BufferRange {
        BufferRange {
            buffer: vk::Buffer::from_raw(SHARED_MEMORY_BUFFER),
            offset: 0,
            range: 512 * 1024 * 1024,
        }
    }

    fn end_submission(&mut self, _command_buffer: &mut DeferredCommandBuffer) {
        self.log.push(Event::SharedMemoryEndSubmission);
    }

    fn completed_submission_updated(&mut self, completed_submission: u64) {
        self.log.push(Event::SharedMemoryCompleted(completed_submission));
    }

    fn memory_invalidated(&mut self, base: u32, length: u32) {
        self.log.push(Event::MemoryInvalidated { base, length });
    }

    fn clear_cache(&mut self) {
        self.log.push(Event::CacheCleared("shared_memory"));
    }
}

pub struct FakeRenderTargets {
    pub log: EventLog,
}

impl RenderTargetCache for FakeRenderTargets {
    fn edram_buffer_range(&self) -> BufferRange {
        BufferRange {
            buffer: vk::Buffer::from_raw(EDRAM_BUFFER),
            offset: 0,
            range: 10 * 1024 * 1024,
        }
    }

    fn render_pass_for_draw(
        &mut self,
        _registers: &RegisterFile,
    ) -> Result<RenderPassBinding, GraphicsError> {
        Ok(guest_render_pass())
    }

    fn end_submission(&mut self) {
        self.log.push(Event::RenderTargetsEndSubmission);
    }

    fn completed_submission_updated(&mut self, completed_submission: u64) {
        self.log.push(Event::RenderTargetsCompleted(completed_submission));
    }

    fn restore_edram_snapshot(
        &mut self,
        snapshot: &[u8],
        _command_buffer: &mut DeferredCommandBuffer,
    ) -> Result<(), GraphicsError> {
        self.log.push(Event::EdramRestored(snapshot.len()));
        Ok(())
    }

    fn resolve(
        &mut self,
        _registers: &RegisterFile,
        command_buffer: &mut DeferredCommandBuffer,
    ) -> Result<(), GraphicsError> {
        self.log.push(Event::Resolved);
        command_buffer.cmd_copy_buffer(
            vk::Buffer::from_raw(EDRAM_BUFFER),
            vk::Buffer::from_raw(SHARED_MEMORY_BUFFER),
            &[BufferCopy {
                src_offset: 0,
                dst_offset: 0x1000,
                size: 0x400,
            }],
        );
        Ok(())
    }

    fn clear_cache(&mut self) {
        self.log.push(Event::CacheCleared("render_targets"));
    }
}

pub struct FakePipelines {
    pub log: EventLog,
    pub dynamic_state: DynamicStateFlags,
}

impl PipelineProvider for FakePipelines {
    fn get_pipeline(
        &mut self,
        vertex_shader: &TranslatedShader,
        pixel_shader: Option<&TranslatedShader>,
        _render_pass: vk::RenderPass,
        _pipeline_layout: vk::PipelineLayout,
        _registers: &RegisterFile,
    ) -> Result<GuestPipeline, GraphicsError> {
        let textures_pixel = pixel_shader.map_or(0, TranslatedShader::texture_count);
        let textures_vertex = vertex_shader.texture_count();
        self.log.push(Event::PipelineRequested {
            textures_pixel,
            textures_vertex,
        });
        // One pipeline per texture count pair is enough to tell them apart.
        Ok(GuestPipeline {
            pipeline: vk::Pipeline::from_raw(
                GUEST_PIPELINE + u64::from(textures_pixel) * 64 + u64::from(textures_vertex),
            ),
            dynamic_state: self.dynamic_state,
        })
    }

    fn clear_cache(&mut self) {
        self.log.push(Event::CacheCleared("pipelines"));
    }
}

pub struct FakeTextures {
    pub log: EventLog,
}

impl TextureSource for FakeTextures {
    fn image_binding(
        &mut self,
        _registers: &RegisterFile,
        stage: ShaderStage,
        binding: &TextureBinding,
    ) -> ImageBinding {
        let stage_base = match stage {
            ShaderStage::Vertex => 0xD100_0000,
            ShaderStage::Pixel => 0xD200_0000,
        };
        ImageBinding {
            image_view: vk::ImageView::from_raw(stage_base + u64::from(binding.fetch_constant)),
            sampler: vk::Sampler::from_raw(0xD300_0000 + u64::from(binding.fetch_constant)),
        }
    }

    fn completed_submission_updated(&mut self, completed_submission: u64) {
        self.log.push(Event::TexturesCompleted(completed_submission));
    }

    fn clear_cache(&mut self) {
        self.log.push(Event::CacheCleared("textures"));
    }
}

pub struct FakeCapture {
    pub log: EventLog,
}

impl FrameCaptureHook for FakeCapture {
    fn begin_capture(&mut self) {
        self.log.push(Event::CaptureBegan);
    }

    fn end_capture(&mut self) {
        self.log.push(Event::CaptureEnded);
    }
}

// ============================================================================
// Test Context
// ============================================================================

/// A processor on the dummy backend with fake collaborators.
pub struct TestContext {
    pub processor: CommandProcessor<DummyBackend>,
    pub log: EventLog,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: ProcessorConfig) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let log = EventLog::default();
        let collaborators = Collaborators {
            shared_memory: Box::new(FakeSharedMemory { log: log.clone() }),
            render_targets: Box::new(FakeRenderTargets { log: log.clone() }),
            pipelines: Box::new(FakePipelines {
                log: log.clone(),
                dynamic_state: DynamicStateFlags::all(),
            }),
            textures: Box::new(FakeTextures { log: log.clone() }),
            frame_capture: Some(Box::new(FakeCapture { log: log.clone() })),
        };
        let processor = CommandProcessor::new(DummyBackend::new(), config, collaborators)
            .expect("processor creation on the dummy backend");
        Self { processor, log }
    }

    pub fn backend(&self) -> &DummyBackend {
        self.processor.backend()
    }
}

/// Small pages so tests can run pools out quickly.
pub fn test_config() -> ProcessorConfig {
    ProcessorConfig::default()
        .with_uniform_page_size(64 * 1024)
        .with_max_uniform_pages(4)
        .with_uniform_descriptor_page_sets(64)
        .with_texture_descriptor_pages(16, 128)
        .with_max_descriptor_pages(4)
        .with_sparse_bind_validation(true)
}

pub fn guest_render_pass() -> RenderPassBinding {
    RenderPassBinding {
        render_pass: vk::RenderPass::from_raw(GUEST_RENDER_PASS),
        framebuffer: vk::Framebuffer::from_raw(GUEST_FRAMEBUFFER),
        render_area: Rect2D::new(0, 0, 1280, 720),
    }
}

pub fn viewport_info() -> ViewportInfo {
    ViewportInfo {
        xy_offset: [0, 0],
        xy_extent: [1280, 720],
        z_min: 0.0,
        z_max: 1.0,
        ndc_scale: [1.0, -1.0, 1.0],
        ndc_offset: [0.0, 0.0, 0.0],
    }
}

pub fn textures(count: u32) -> Vec<TextureBinding> {
    (0..count)
        .map(|fetch_constant| TextureBinding {
            fetch_constant,
            signed: false,
        })
        .collect()
}

pub fn draw<'a>(
    vertex_shader: &'a TranslatedShader,
    pixel_shader: Option<&'a TranslatedShader>,
) -> DrawRequest<'a> {
    DrawRequest {
        vertex_shader,
        pixel_shader,
        primitive_polygonal: true,
        viewport_info: viewport_info(),
        index_endian: 0,
        primitive: DrawPrimitive::Vertices { vertex_count: 3 },
    }
}

pub fn guest_output(slot: u32, version: u64) -> GuestOutput {
    GuestOutput {
        slot,
        version,
        image_view: vk::ImageView::from_raw(0xE000_0000 + u64::from(slot)),
        extent: vk::Extent2D {
            width: 1280,
            height: 720,
        },
        render_pass: vk::RenderPass::from_raw(0xE100_0000),
        pipeline: vk::Pipeline::from_raw(0xE200_0000),
        pipeline_layout: vk::PipelineLayout::from_raw(0xE300_0000),
        descriptor_set: vk::DescriptorSet::from_raw(0xE400_0000),
    }
}
