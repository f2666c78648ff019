use criterion::{Criterion, black_box, criterion_group, criterion_main};

use ash::vk;
use ash::vk::Handle;

use xegpu_graphics::deferred::DeferredCommandBuffer;
use xegpu_graphics::dynamic_state::{DynamicStateInput, DynamicStateTracker};
use xegpu_graphics::registers::{RegisterFile, reg};
use xegpu_graphics::types::{BufferRange, ImageBinding, Rect2D, RenderPassBinding};
use xegpu_graphics::{
    Collaborators, CommandProcessor, DrawPrimitive, DrawRequest, DummyBackend, DynamicStateFlags,
    GraphicsError, GuestOutput, GuestPipeline, PipelineProvider, ProcessorConfig,
    RenderTargetCache, ShaderStage, SharedMemory, TextureBinding, TextureSource, TranslatedShader,
    ViewportInfo,
};

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

struct Memory;

impl SharedMemory for Memory {
    fn buffer_range(&self) -> BufferRange {
        BufferRange {
            buffer: vk::Buffer::from_raw(0x1000),
            offset: 0,
            range: 1 << 29,
        }
    }

    fn end_submission(&mut self, _command_buffer: &mut DeferredCommandBuffer) {}

    fn completed_submission_updated(&mut self, _completed_submission: u64) {}

    fn memory_invalidated(&mut self, _base: u32, _length: u32) {}
}

struct RenderTargets;

impl RenderTargetCache for RenderTargets {
    fn edram_buffer_range(&self) -> BufferRange {
        BufferRange {
            buffer: vk::Buffer::from_raw(0x2000),
            offset: 0,
            range: 10 << 20,
        }
    }

    fn render_pass_for_draw(
        &mut self,
        _registers: &RegisterFile,
    ) -> Result<RenderPassBinding, GraphicsError> {
        Ok(RenderPassBinding {
            render_pass: vk::RenderPass::from_raw(0x3000),
            framebuffer: vk::Framebuffer::from_raw(0x3001),
            render_area: Rect2D::new(0, 0, 1280, 720),
        })
    }

    fn restore_edram_snapshot(
        &mut self,
        _snapshot: &[u8],
        _command_buffer: &mut DeferredCommandBuffer,
    ) -> Result<(), GraphicsError> {
        Ok(())
    }

    fn resolve(
        &mut self,
        _registers: &RegisterFile,
        _command_buffer: &mut DeferredCommandBuffer,
    ) -> Result<(), GraphicsError> {
        Ok(())
    }
}

struct Pipelines;

impl PipelineProvider for Pipelines {
    fn get_pipeline(
        &mut self,
        _vertex_shader: &TranslatedShader,
        pixel_shader: Option<&TranslatedShader>,
        _render_pass: vk::RenderPass,
        _pipeline_layout: vk::PipelineLayout,
        _registers: &RegisterFile,
    ) -> Result<GuestPipeline, GraphicsError> {
        let textures = pixel_shader.map_or(0, TranslatedShader::texture_count);
        Ok(GuestPipeline {
            pipeline: vk::Pipeline::from_raw(0x4000 + u64::from(textures)),
            dynamic_state: DynamicStateFlags::all(),
        })
    }
}

struct Textures;

impl TextureSource for Textures {
    fn image_binding(
        &mut self,
        _registers: &RegisterFile,
        _stage: ShaderStage,
        binding: &TextureBinding,
    ) -> ImageBinding {
        ImageBinding {
            image_view: vk::ImageView::from_raw(0x5000 + u64::from(binding.fetch_constant)),
            sampler: vk::Sampler::from_raw(0x6000),
        }
    }
}

fn processor() -> CommandProcessor<DummyBackend> {
    let backend = DummyBackend::new();
    backend.set_auto_complete(true);
    CommandProcessor::new(
        backend,
        ProcessorConfig::default(),
        Collaborators {
            shared_memory: Box::new(Memory),
            render_targets: Box::new(RenderTargets),
            pipelines: Box::new(Pipelines),
            textures: Box::new(Textures),
            frame_capture: None,
        },
    )
    .expect("dummy processor")
}

fn viewport_info() -> ViewportInfo {
    ViewportInfo {
        xy_extent: [1280, 720],
        z_max: 1.0,
        ndc_scale: [1.0, -1.0, 1.0],
        ..Default::default()
    }
}

fn output() -> GuestOutput {
    GuestOutput {
        slot: 0,
        version: 1,
        image_view: vk::ImageView::from_raw(0x7000),
        extent: vk::Extent2D {
            width: 1280,
            height: 720,
        },
        render_pass: vk::RenderPass::from_raw(0x7001),
        pipeline: vk::Pipeline::from_raw(0x7002),
        pipeline_layout: vk::PipelineLayout::from_raw(0x7003),
        descriptor_set: vk::DescriptorSet::from_raw(0x7004),
    }
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

fn bench_frame_of_draws(c: &mut Criterion) {
    let vs = TranslatedShader::vertex().with_float_constants(&[0, 1, 2, 3]);
    let pixel_shaders: Vec<TranslatedShader> = (0..4)
        .map(|count| {
            TranslatedShader::pixel()
                .with_float_constants(&[0])
                .with_textures(
                    (0..count)
                        .map(|fetch_constant| TextureBinding {
                            fetch_constant,
                            signed: false,
                        })
                        .collect(),
                )
        })
        .collect();

    let mut processor = processor();
    let output = output();
    c.bench_function("frame_100_draws_and_swap", |b| {
        b.iter(|| {
            for draw in 0..100u32 {
                if draw % 10 == 0 {
                    processor.write_register(reg::SHADER_CONSTANT_000_X, draw);
                }
                let request = DrawRequest {
                    vertex_shader: &vs,
                    pixel_shader: Some(&pixel_shaders[(draw % 4) as usize]),
                    primitive_polygonal: true,
                    viewport_info: viewport_info(),
                    index_endian: 0,
                    primitive: DrawPrimitive::Vertices { vertex_count: 6 },
                };
                processor.issue_draw(black_box(&request)).unwrap();
            }
            processor.issue_swap(&output).unwrap();
        });
    });
}

fn bench_empty_frames(c: &mut Criterion) {
    let mut processor = processor();
    let output = output();
    c.bench_function("empty_frame_swap", |b| {
        b.iter(|| processor.issue_swap(black_box(&output)).unwrap());
    });
}

// ---------------------------------------------------------------------------
// Dynamic state
// ---------------------------------------------------------------------------

fn bench_dynamic_state_unchanged(c: &mut Criterion) {
    let mut registers = RegisterFile::new();
    registers.set(reg::RB_DEPTHCONTROL, 1);
    let config = ProcessorConfig::default();
    let mut tracker = DynamicStateTracker::new();
    let mut command_buffer = DeferredCommandBuffer::new();
    let info = viewport_info();

    c.bench_function("dynamic_state_update_unchanged", |b| {
        b.iter(|| {
            let input = DynamicStateInput::from_registers(&registers, &info, true, &config);
            black_box(tracker.update(&input, &mut command_buffer));
            command_buffer.reset();
        });
    });
}

criterion_group!(
    benches,
    bench_frame_of_draws,
    bench_empty_frames,
    bench_dynamic_state_unchanged,
);
criterion_main!(benches);
