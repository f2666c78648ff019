//! The command processor: public entry points tying submissions, caches,
//! dynamic state and bindings together.
//!
//! # Submissions and frames
//!
//! ```text
//!   begin_submission(true)                      end_submission(true)
//!        │  opens frame N (waits for frame N-3)       │  closes frame N
//!        ▼                                             ▼
//!   ┌─────────┐   draws   ┌─────────┐   draws   ┌─────────┐
//!   │  sub k  │ ───────►  │ sub k+1 │ ───────►  │ sub k+2 │ ──► frame ring
//!   └─────────┘           └─────────┘           └─────────┘
//!        ▲ end_submission(false) splits a frame into several submissions
//! ```
//!
//! Everything runs on the thread that owns the processor. The only blocking
//! points are awaiting a submission and frame throttling when a frame opens.

use ash::vk;
use xegpu_core::profiling::{frame_mark, profile_scope};

use crate::backend::GpuBackend;
use crate::bindings::{BindingResolver, BindingUpdate};
use crate::config::ProcessorConfig;
use crate::deferred::DeferredCommandBuffer;
use crate::dynamic_state::{DynamicStateFlags, DynamicStateInput, DynamicStateTracker};
use crate::error::GraphicsError;
use crate::interfaces::{Collaborators, GuestOutput, GuestPipeline, TranslatedShader, ViewportInfo};
use crate::layout_cache::{LayoutCache, PipelineLayout, PipelineLayoutId};
use crate::registers::RegisterFile;
use crate::submission::{DeviceState, SubmissionTracker};
use crate::swap::SwapFramebufferCache;
use crate::system_constants::SystemConstants;
use crate::transient::TransientAllocators;
use crate::types::{
    DescriptorResources, DescriptorWrite, IndexType, Rect2D, RenderPassBinding, SparseMemoryBind,
    Viewport,
};

/// Vertices or indices of a draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawPrimitive {
    Vertices {
        vertex_count: u32,
    },
    Indexed {
        buffer: vk::Buffer,
        offset: u64,
        index_type: IndexType,
        index_count: u32,
    },
}

/// One guest draw.
#[derive(Debug, Clone, Copy)]
pub struct DrawRequest<'a> {
    pub vertex_shader: &'a TranslatedShader,
    pub pixel_shader: Option<&'a TranslatedShader>,
    pub primitive_polygonal: bool,
    pub viewport_info: ViewportInfo,
    pub index_endian: u32,
    pub primitive: DrawPrimitive,
}

/// Guest GPU command processor on a Vulkan-like backend.
pub struct CommandProcessor<B: GpuBackend> {
    backend: B,
    config: ProcessorConfig,
    collaborators: Collaborators,
    registers: RegisterFile,
    tracker: SubmissionTracker,
    deferred: DeferredCommandBuffer,
    transient: TransientAllocators<B::UploadMemory>,
    layout_cache: LayoutCache,
    dynamic_state: DynamicStateTracker,
    bindings: BindingResolver,
    system_constants: SystemConstants,
    swap_framebuffers: SwapFramebufferCache,
    shared_memory_and_edram_pool: vk::DescriptorPool,

    current_render_pass: Option<RenderPassBinding>,
    current_external_pipeline: Option<vk::Pipeline>,
    current_guest_pipeline: Option<vk::Pipeline>,
    current_pipeline_layout: Option<PipelineLayoutId>,

    cache_clear_requested: bool,
    frame_capture_requested: bool,
    frame_capturing: bool,
    shut_down: bool,
}

impl<B: GpuBackend> std::fmt::Debug for CommandProcessor<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandProcessor")
            .field("backend", &self.backend.name())
            .field("current_submission", &self.tracker.current_submission())
            .field("completed_submission", &self.tracker.completed_submission())
            .field("current_frame", &self.tracker.frames().current())
            .field("device_state", &self.tracker.device_state())
            .finish_non_exhaustive()
    }
}

impl<B: GpuBackend> CommandProcessor<B> {
    /// Create the processor, its fixed set layouts and the shared memory and
    /// EDRAM descriptor set.
    pub fn new(
        backend: B,
        config: ProcessorConfig,
        collaborators: Collaborators,
    ) -> Result<Self, GraphicsError> {
        config.validate()?;
        let mut layout_cache = LayoutCache::new(&backend, config.guest_vertex_stages())?;

        let (pool, set) = match Self::create_shared_memory_and_edram_set(
            &backend,
            &layout_cache,
            &collaborators,
        ) {
            Ok(created) => created,
            Err(e) => {
                layout_cache.destroy(&backend);
                return Err(e);
            }
        };
        let mut bindings = BindingResolver::new();
        bindings.set_shared_memory_and_edram(set);

        log::info!("Command processor created on the {} backend", backend.name());
        Ok(Self {
            tracker: SubmissionTracker::new(config.validate_sparse_binds, config.fence_wait_timeout),
            transient: TransientAllocators::new(&config),
            backend,
            config,
            collaborators,
            registers: RegisterFile::new(),
            deferred: DeferredCommandBuffer::new(),
            layout_cache,
            dynamic_state: DynamicStateTracker::new(),
            bindings,
            system_constants: SystemConstants::default(),
            swap_framebuffers: SwapFramebufferCache::new(),
            shared_memory_and_edram_pool: pool,
            current_render_pass: None,
            current_external_pipeline: None,
            current_guest_pipeline: None,
            current_pipeline_layout: None,
            cache_clear_requested: false,
            frame_capture_requested: false,
            frame_capturing: false,
            shut_down: false,
        })
    }

    fn create_shared_memory_and_edram_set(
        backend: &B,
        layout_cache: &LayoutCache,
        collaborators: &Collaborators,
    ) -> Result<(vk::DescriptorPool, vk::DescriptorSet), GraphicsError> {
        let pool = backend.create_descriptor_pool(
            1,
            &[vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: 2,
            }],
        )?;
        let set = match backend
            .allocate_descriptor_set(pool, layout_cache.fixed().shared_memory_and_edram)
        {
            Ok(Some(set)) => set,
            Ok(None) => {
                backend.destroy_descriptor_pool(pool);
                return Err(GraphicsError::InitializationFailed(
                    "no space for the shared memory and EDRAM descriptor set".into(),
                ));
            }
            Err(e) => {
                backend.destroy_descriptor_pool(pool);
                return Err(e);
            }
        };
        backend.update_descriptor_sets(&[
            DescriptorWrite {
                set,
                binding: 0,
                resources: DescriptorResources::StorageBuffers(vec![
                    collaborators.shared_memory.buffer_range(),
                ]),
            },
            DescriptorWrite {
                set,
                binding: 1,
                resources: DescriptorResources::StorageBuffers(vec![
                    collaborators.render_targets.edram_buffer_range(),
                ]),
            },
        ]);
        Ok((pool, set))
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn registers(&self) -> &RegisterFile {
        &self.registers
    }

    pub fn bindings(&self) -> &BindingResolver {
        &self.bindings
    }

    pub fn dynamic_state(&self) -> &DynamicStateTracker {
        &self.dynamic_state
    }

    pub fn tracker(&self) -> &SubmissionTracker {
        &self.tracker
    }

    pub fn current_submission(&self) -> u64 {
        self.tracker.current_submission()
    }

    pub fn completed_submission(&self) -> u64 {
        self.tracker.completed_submission()
    }

    pub fn current_frame(&self) -> u64 {
        self.tracker.frames().current()
    }

    pub fn completed_frame(&self) -> u64 {
        self.tracker.frames().completed()
    }

    pub fn device_state(&self) -> DeviceState {
        self.tracker.device_state()
    }

    pub fn is_submission_open(&self) -> bool {
        self.tracker.is_open()
    }

    pub fn is_frame_open(&self) -> bool {
        self.tracker.frames().is_open()
    }

    /// Command list of the open submission, `None` if no submission is open.
    pub fn deferred_command_buffer(&mut self) -> Option<&mut DeferredCommandBuffer> {
        if self.tracker.is_open() {
            Some(&mut self.deferred)
        } else {
            None
        }
    }

    fn ensure_submission_open(&self) -> Result<(), GraphicsError> {
        self.tracker.ensure_device()?;
        if self.tracker.is_open() {
            Ok(())
        } else {
            Err(GraphicsError::InvalidParameter(
                "no submission is open".into(),
            ))
        }
    }

    // Submission lifecycle

    /// Make sure a submission is open, and a frame too if `is_guest_command`.
    ///
    /// Opening a frame first waits for the frame `MAX_FRAMES_IN_FLIGHT`
    /// frames back to complete.
    pub fn begin_submission(&mut self, is_guest_command: bool) -> Result<(), GraphicsError> {
        self.tracker.ensure_device()?;
        let is_opening_frame = is_guest_command && !self.tracker.frames().is_open();
        if self.tracker.is_open() && !is_opening_frame {
            return Ok(());
        }

        if is_opening_frame {
            let await_submission = self.tracker.frames().submission_to_await();
            if await_submission > self.tracker.completed_submission() {
                log::trace!(
                    "Frame {} waits for submission {}",
                    self.tracker.frames().current(),
                    await_submission
                );
            }
            self.check_submission_fence_and_device_loss(await_submission)?;
        }

        if self.tracker.open_submission() {
            self.deferred.reset();
            self.dynamic_state.mark_all_dirty();
            self.current_render_pass = None;
            self.current_external_pipeline = None;
            self.current_guest_pipeline = None;
            self.current_pipeline_layout = None;
            self.bindings.submission_opened();
            log::trace!("Opened submission {}", self.tracker.current_submission());
        }

        if is_opening_frame {
            self.tracker.frames_mut().open();
            self.bindings.invalidate_transient_sets();
            self.transient.reclaim(self.tracker.frames().completed());
            if std::mem::take(&mut self.frame_capture_requested) {
                if let Some(capture) = self.collaborators.frame_capture.as_mut() {
                    capture.begin_capture();
                    self.frame_capturing = true;
                }
            }
            log::trace!("Opened frame {}", self.tracker.frames().current());
        }
        Ok(())
    }

    /// Close the open submission, and the frame too if `is_swap`.
    ///
    /// On failure the submission stays open and can be closed again.
    pub fn end_submission(&mut self, is_swap: bool) -> Result<(), GraphicsError> {
        profile_scope!("end_submission");
        self.tracker.ensure_device()?;
        let is_closing_frame = is_swap && self.tracker.frames().is_open();

        if self.tracker.is_open() {
            // Fail before touching anything if a pooled object cannot be created.
            self.tracker.prepare_submission(&self.backend)?;
            self.end_render_pass();
            self.collaborators
                .shared_memory
                .end_submission(&mut self.deferred);
            self.collaborators.render_targets.end_submission();
            self.tracker.submit(&self.backend, self.deferred.commands())?;
        }

        if is_closing_frame {
            if self.frame_capturing {
                if let Some(capture) = self.collaborators.frame_capture.as_mut() {
                    capture.end_capture();
                }
                self.frame_capturing = false;
            }
            let closing_submission = self.tracker.current_submission() - 1;
            self.tracker.frames_mut().close(closing_submission);
            self.bindings.invalidate_transient_sets();
            frame_mark!();
            log::trace!("Closed frame with submission {}", closing_submission);

            if self.cache_clear_requested && self.await_all_queue_operations_completion()? {
                self.cache_clear_requested = false;
                self.clear_caches()?;
            }
        }
        Ok(())
    }

    /// Advance completion, blocking until `await_submission` has completed.
    ///
    /// Awaiting the current submission or later closes the open one first.
    /// `0` only polls.
    pub fn check_submission_fence_and_device_loss(
        &mut self,
        await_submission: u64,
    ) -> Result<(), GraphicsError> {
        self.tracker.ensure_device()?;
        let mut await_submission = await_submission;
        if await_submission >= self.tracker.current_submission() {
            if self.tracker.is_open() {
                self.end_submission(false)?;
            }
            await_submission = self.tracker.current_submission() - 1;
        }

        let newly_completed = self.tracker.check_fences(&self.backend, await_submission)?;
        let completed = self.tracker.completed_submission();
        self.tracker.frames_mut().update_completed(completed);
        if newly_completed == 0 {
            return Ok(());
        }

        self.swap_framebuffers.reclaim(&self.backend, completed);
        self.collaborators
            .shared_memory
            .completed_submission_updated(completed);
        self.collaborators
            .render_targets
            .completed_submission_updated(completed);
        self.collaborators
            .textures
            .completed_submission_updated(completed);
        Ok(())
    }

    /// Release every transient page, including those of the open frame, once
    /// nothing is open or in flight. Sets written so far are rewritten on use.
    fn release_transient_memory(&mut self) {
        if !self.tracker.is_idle() {
            return;
        }
        if self.transient.release_all() {
            log::debug!("Released all transient pages with the queue idle");
        }
        self.bindings.invalidate_transient_sets();
    }

    /// Close the open submission and wait for everything submitted.
    ///
    /// Returns whether nothing is open or in flight afterwards.
    pub fn await_all_queue_operations_completion(&mut self) -> Result<bool, GraphicsError> {
        self.check_submission_fence_and_device_loss(self.tracker.current_submission())?;
        Ok(self.tracker.is_idle())
    }

    /// Queue sparse binds of `buffer` for the current submission.
    pub fn sparse_bind_buffer(
        &mut self,
        buffer: vk::Buffer,
        binds: &[SparseMemoryBind],
        wait_stage_mask: vk::PipelineStageFlags,
    ) -> Result<(), GraphicsError> {
        self.tracker
            .sparse_bind_buffer(buffer, binds, wait_stage_mask)
    }

    /// Leave the lost-device state once the owner has recreated the device
    /// objects. Submission numbering continues where it stopped.
    pub fn reset_device_loss(&mut self) {
        self.tracker.reset_device_loss(&self.backend);
        let completed = self.tracker.completed_submission();
        self.tracker.frames_mut().update_completed(completed);
        self.release_transient_memory();
        self.swap_framebuffers.reclaim(&self.backend, completed);
        self.deferred.reset();
        self.current_render_pass = None;
        self.current_external_pipeline = None;
        self.current_guest_pipeline = None;
        self.current_pipeline_layout = None;
    }

    // Caches

    /// Pipeline layout for the given texture counts.
    pub fn get_pipeline_layout(
        &mut self,
        texture_count_pixel: u32,
        texture_count_vertex: u32,
    ) -> Result<PipelineLayoutId, GraphicsError> {
        self.layout_cache
            .get_pipeline_layout(&self.backend, texture_count_pixel, texture_count_vertex)
    }

    pub fn pipeline_layout(&self, id: PipelineLayoutId) -> Option<&PipelineLayout> {
        self.layout_cache.layout(id)
    }

    pub fn layout_cache(&self) -> &LayoutCache {
        &self.layout_cache
    }

    /// Clear every cache at the next frame end with nothing in flight.
    pub fn request_cache_clear(&mut self) {
        self.cache_clear_requested = true;
    }

    fn clear_caches(&mut self) -> Result<(), GraphicsError> {
        if !self.tracker.is_idle() {
            log::warn!("Cache clear attempted with submissions in flight");
            return Err(GraphicsError::CacheClearWhileBusy);
        }
        self.layout_cache.clear(&self.backend);
        self.transient.clear(&self.backend);
        self.swap_framebuffers.clear(&self.backend);
        self.collaborators.shared_memory.clear_cache();
        self.collaborators.render_targets.clear_cache();
        self.collaborators.pipelines.clear_cache();
        self.collaborators.textures.clear_cache();
        self.bindings.invalidate_transient_sets();
        self.current_guest_pipeline = None;
        self.current_pipeline_layout = None;
        log::info!("Cleared GPU caches");
        Ok(())
    }

    /// Capture the next frame with the frame capture hook.
    pub fn request_frame_capture(&mut self) {
        self.frame_capture_requested = true;
    }

    // Recording

    /// Begin `binding` unless it is already the current render pass.
    pub fn begin_render_pass(&mut self, binding: RenderPassBinding) -> Result<(), GraphicsError> {
        self.ensure_submission_open()?;
        if self.current_render_pass == Some(binding) {
            return Ok(());
        }
        self.end_render_pass();
        self.deferred.cmd_begin_render_pass(binding);
        self.current_render_pass = Some(binding);
        Ok(())
    }

    pub fn end_render_pass(&mut self) {
        if self.current_render_pass.take().is_some() {
            self.deferred.cmd_end_render_pass();
        }
    }

    /// Bind a pipeline that is not a guest pipeline.
    ///
    /// Dynamic state groups not kept are re-recorded before the next guest
    /// draw, and the guest pipeline and layout are forgotten.
    pub fn bind_external_graphics_pipeline(
        &mut self,
        pipeline: vk::Pipeline,
        keep_depth_bias: bool,
        keep_blend_constants: bool,
        keep_stencil_mask_ref: bool,
    ) -> Result<(), GraphicsError> {
        self.ensure_submission_open()?;
        let mut invalidate = DynamicStateFlags::empty();
        invalidate.set(DynamicStateFlags::DEPTH_BIAS, !keep_depth_bias);
        invalidate.set(DynamicStateFlags::BLEND_CONSTANTS, !keep_blend_constants);
        invalidate.set(DynamicStateFlags::STENCIL, !keep_stencil_mask_ref);
        self.dynamic_state.invalidate(invalidate);

        if self.current_external_pipeline != Some(pipeline) {
            self.deferred.cmd_bind_pipeline(pipeline);
            self.current_external_pipeline = Some(pipeline);
        }
        self.current_guest_pipeline = None;
        self.current_pipeline_layout = None;
        Ok(())
    }

    fn bind_guest_pipeline(
        &mut self,
        pipeline: GuestPipeline,
        layout_id: PipelineLayoutId,
        layout: &PipelineLayout,
    ) {
        if self.current_guest_pipeline != Some(pipeline.pipeline) {
            self.deferred.cmd_bind_pipeline(pipeline.pipeline);
            self.current_guest_pipeline = Some(pipeline.pipeline);
            self.current_external_pipeline = None;
            self.dynamic_state.pipeline_bound(pipeline.dynamic_state);
        }
        if self.current_pipeline_layout != Some(layout_id) {
            let previous = self
                .current_pipeline_layout
                .and_then(|id| self.layout_cache.layout(id))
                .copied();
            self.bindings
                .pipeline_layout_changed(previous.as_ref(), layout);
            self.current_pipeline_layout = Some(layout_id);
        }
    }

    /// Store a guest register and invalidate what depends on it.
    pub fn write_register(&mut self, index: u32, value: u32) {
        if !self.registers.set(index, value) {
            log::warn!("Write to register {:#06X} outside the register file", index);
            return;
        }
        self.bindings.register_written(index);
    }

    /// Record the dynamic state a draw needs. Returns what was recorded.
    pub fn update_dynamic_state(
        &mut self,
        viewport_info: &ViewportInfo,
        primitive_polygonal: bool,
    ) -> Result<DynamicStateFlags, GraphicsError> {
        self.ensure_submission_open()?;
        let input = DynamicStateInput::from_registers(
            &self.registers,
            viewport_info,
            primitive_polygonal,
            &self.config,
        );
        Ok(self.dynamic_state.update(&input, &mut self.deferred))
    }

    /// Recompute the system constants, invalidating their set on change.
    pub fn update_system_constant_values(
        &mut self,
        index_endian: u32,
        viewport_info: &ViewportInfo,
        primitive_polygonal: bool,
    ) {
        if self.system_constants.update(
            &self.registers,
            index_endian,
            viewport_info,
            primitive_polygonal,
        ) {
            self.bindings.system_constants_changed();
        }
    }

    /// Write and bind the descriptor sets a draw with these shaders needs.
    ///
    /// Requires a guest pipeline layout to be current.
    pub fn update_bindings(
        &mut self,
        vertex_shader: &TranslatedShader,
        pixel_shader: Option<&TranslatedShader>,
    ) -> Result<(), GraphicsError> {
        self.ensure_submission_open()?;
        let layout = self
            .current_pipeline_layout
            .and_then(|id| self.layout_cache.layout(id))
            .copied()
            .ok_or_else(|| GraphicsError::Internal("no guest pipeline layout bound".into()))?;
        self.bindings.update_bindings(BindingUpdate {
            backend: &self.backend,
            frame: self.tracker.frames().current(),
            transient: &mut self.transient,
            fixed_layouts: self.layout_cache.fixed(),
            pipeline_layout: &layout,
            registers: &self.registers,
            system_constants: &self.system_constants,
            vertex_shader,
            pixel_shader,
            textures: self.collaborators.textures.as_mut(),
            command_buffer: &mut self.deferred,
        })
    }

    /// Record a guest draw.
    ///
    /// If a transient pool runs out, the submission is closed, awaited and a
    /// fresh one is used for a single retry.
    pub fn issue_draw(&mut self, request: &DrawRequest<'_>) -> Result<(), GraphicsError> {
        profile_scope!("issue_draw");
        match self.try_issue_draw(request) {
            Err(GraphicsError::PoolExhausted) => {
                log::debug!(
                    "Transient pools exhausted in submission {}, retrying in a new one",
                    self.tracker.current_submission()
                );
                self.end_submission(false)?;
                self.check_submission_fence_and_device_loss(
                    self.tracker.current_submission() - 1,
                )?;
                self.release_transient_memory();
                self.try_issue_draw(request)
            }
            result => result,
        }
    }

    fn try_issue_draw(&mut self, request: &DrawRequest<'_>) -> Result<(), GraphicsError> {
        self.begin_submission(true)?;

        let render_pass = self
            .collaborators
            .render_targets
            .render_pass_for_draw(&self.registers)?;
        self.begin_render_pass(render_pass)?;

        let layout_id = self.get_pipeline_layout(
            request.pixel_shader.map_or(0, TranslatedShader::texture_count),
            request.vertex_shader.texture_count(),
        )?;
        let layout = self
            .layout_cache
            .layout(layout_id)
            .copied()
            .ok_or_else(|| GraphicsError::Internal("pipeline layout vanished".into()))?;
        let pipeline = self.collaborators.pipelines.get_pipeline(
            request.vertex_shader,
            request.pixel_shader,
            render_pass.render_pass,
            layout.handle,
            &self.registers,
        )?;
        self.bind_guest_pipeline(pipeline, layout_id, &layout);

        self.update_dynamic_state(&request.viewport_info, request.primitive_polygonal)?;
        self.update_system_constant_values(
            request.index_endian,
            &request.viewport_info,
            request.primitive_polygonal,
        );
        self.update_bindings(request.vertex_shader, request.pixel_shader)?;

        match request.primitive {
            DrawPrimitive::Vertices { vertex_count } => {
                self.deferred.cmd_draw(vertex_count, 1, 0, 0);
            }
            DrawPrimitive::Indexed {
                buffer,
                offset,
                index_type,
                index_count,
            } => {
                self.deferred.cmd_bind_index_buffer(buffer, offset, index_type);
                self.deferred.cmd_draw_indexed(index_count, 1, 0, 0, 0);
            }
        }
        Ok(())
    }

    /// Draw the guest output into the presenter's image and close the frame.
    pub fn issue_swap(&mut self, output: &GuestOutput) -> Result<(), GraphicsError> {
        profile_scope!("issue_swap");
        self.begin_submission(true)?;
        self.end_render_pass();

        let framebuffer = self.swap_framebuffers.get_framebuffer(
            &self.backend,
            output.slot,
            output.version,
            output.render_pass,
            output.image_view,
            output.extent,
            self.tracker.current_submission(),
        )?;

        // The presentation pipeline has no dynamic depth bias, blend constants
        // or stencil, so the guest values must be recorded again.
        self.bind_external_graphics_pipeline(output.pipeline, false, false, false)?;
        let area = Rect2D::new(0, 0, output.extent.width, output.extent.height);
        self.begin_render_pass(RenderPassBinding {
            render_pass: output.render_pass,
            framebuffer,
            render_area: area,
        })?;
        self.dynamic_state.set_viewport(
            Viewport {
                x: 0.0,
                y: 0.0,
                width: output.extent.width as f32,
                height: output.extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            },
            &mut self.deferred,
        );
        self.dynamic_state.set_scissor(area, &mut self.deferred);
        self.deferred
            .cmd_bind_descriptor_sets(output.pipeline_layout, 0, &[output.descriptor_set]);
        self.deferred.cmd_draw(3, 1, 0, 0);
        self.end_render_pass();

        self.end_submission(true)
    }

    /// Record a guest copy from EDRAM into guest memory.
    pub fn issue_copy(&mut self) -> Result<(), GraphicsError> {
        profile_scope!("issue_copy");
        self.begin_submission(true)?;
        self.end_render_pass();
        self.collaborators
            .render_targets
            .resolve(&self.registers, &mut self.deferred)
    }

    // Trace playback

    /// Guest memory was written by trace playback.
    pub fn trace_playback_wrote_memory(&mut self, base: u32, length: u32) -> Result<(), GraphicsError> {
        self.check_submission_fence_and_device_loss(0)?;
        self.collaborators
            .shared_memory
            .memory_invalidated(base, length);
        Ok(())
    }

    /// Load an EDRAM snapshot, ordered with the surrounding guest commands.
    pub fn restore_edram_snapshot(&mut self, snapshot: &[u8]) -> Result<(), GraphicsError> {
        self.begin_submission(true)?;
        self.end_render_pass();
        self.collaborators
            .render_targets
            .restore_edram_snapshot(snapshot, &mut self.deferred)
    }

    /// Wait for the GPU and destroy every object the processor owns.
    ///
    /// Called automatically on drop.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        if self.tracker.device_state() == DeviceState::Ok {
            if let Err(e) = self.await_all_queue_operations_completion() {
                log::warn!("Failed to await the GPU during shutdown: {}", e);
            }
        }
        self.swap_framebuffers.clear(&self.backend);
        self.transient.clear(&self.backend);
        self.layout_cache.destroy(&self.backend);
        self.backend
            .destroy_descriptor_pool(self.shared_memory_and_edram_pool);
        self.tracker.destroy(&self.backend);
        self.shut_down = true;
        log::info!("Command processor shut down");
    }
}

impl<B: GpuBackend> Drop for CommandProcessor<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
