//! Dummy GPU backend for testing and development.
//!
//! This backend doesn't touch a GPU. It hands out unique fake handles and
//! simulates a single in-order queue: submitted work stays pending until a
//! fence wait reaches it or the test completes it explicitly with
//! [`DummyBackend::complete_submissions`]. Faults (rejected submissions,
//! device loss, failed object creation) can be injected, and every queue
//! operation is logged for inspection.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use ash::vk;
use ash::vk::Handle;
use parking_lot::Mutex;

use crate::deferred::DeferredCommand;
use crate::error::GraphicsError;
use crate::types::{
    CommandBufferSlot, DescriptorBinding, DescriptorWrite, QueueSubmit, SparseBufferBind,
};

use super::{GpuBackend, UploadMemory};

/// Kinds of objects the dummy backend counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Fence,
    Semaphore,
    CommandBufferSlot,
    DescriptorSetLayout,
    PipelineLayout,
    DescriptorPool,
    UploadMemory,
    Framebuffer,
}

/// A logged `queue_submit`.
#[derive(Debug, Clone)]
pub struct SubmitRecord {
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub wait_stages: Vec<vk::PipelineStageFlags>,
    pub command_buffer: vk::CommandBuffer,
    pub fence: vk::Fence,
    /// Commands recorded into the command buffer at submission time.
    pub commands: Vec<DeferredCommand>,
}

/// A logged `queue_bind_sparse`.
#[derive(Debug, Clone)]
pub struct SparseBindRecord {
    pub binds: Vec<SparseBufferBind>,
    pub signal: vk::Semaphore,
}

/// Host memory standing in for a mapped upload page.
#[derive(Debug)]
pub struct DummyUploadMemory {
    buffer: vk::Buffer,
    data: Vec<u8>,
}

impl UploadMemory for DummyUploadMemory {
    fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

#[derive(Debug, Default)]
struct DummyState {
    next_handle: u64,
    /// Fences of submissions the simulated GPU has finished.
    signaled: HashSet<vk::Fence>,
    /// Fences of submitted, unfinished work, oldest first.
    queue: VecDeque<vk::Fence>,
    auto_complete: bool,
    device_lost: bool,
    fail_next_submit: Option<vk::Result>,
    fail_next_bind_sparse: Option<vk::Result>,
    fail_next_create: HashSet<ObjectKind>,
    recorded: HashMap<vk::CommandBuffer, Vec<DeferredCommand>>,
    submits: Vec<SubmitRecord>,
    sparse_binds: Vec<SparseBindRecord>,
    fence_waits: Vec<Vec<vk::Fence>>,
    descriptor_writes: Vec<DescriptorWrite>,
    descriptor_pools: HashMap<vk::DescriptorPool, (u32, u32)>,
    /// Allocated descriptor sets and their pools; freed by pool resets.
    descriptor_sets: HashMap<vk::DescriptorSet, vk::DescriptorPool>,
    set_layouts: HashMap<vk::DescriptorSetLayout, Vec<DescriptorBinding>>,
    pipeline_layouts: HashMap<vk::PipelineLayout, Vec<vk::DescriptorSetLayout>>,
    created: HashMap<ObjectKind, usize>,
    destroyed: HashMap<ObjectKind, usize>,
}

impl DummyState {
    fn handle<H: Handle>(&mut self) -> H {
        self.next_handle += 1;
        H::from_raw(self.next_handle)
    }

    fn create(&mut self, kind: ObjectKind) -> Result<(), GraphicsError> {
        if self.fail_next_create.remove(&kind) {
            return Err(GraphicsError::ResourceCreationFailed(format!(
                "injected {kind:?} creation failure"
            )));
        }
        *self.created.entry(kind).or_default() += 1;
        Ok(())
    }

    fn destroy(&mut self, kind: ObjectKind) {
        *self.destroyed.entry(kind).or_default() += 1;
    }

    fn check_device(&self) -> Result<(), GraphicsError> {
        if self.device_lost {
            Err(GraphicsError::DeviceLost)
        } else {
            Ok(())
        }
    }

    /// Whether an unfinished submission binds a set allocated from `pool`.
    ///
    /// The queue completes in order, so the pending submissions are the last
    /// `queue.len()` records.
    fn pool_in_use(&self, pool: vk::DescriptorPool) -> bool {
        let pending = self.submits.len().saturating_sub(self.queue.len());
        self.submits[pending..]
            .iter()
            .flat_map(|submit| &submit.commands)
            .any(|command| match command {
                DeferredCommand::BindDescriptorSets { sets, .. } => sets
                    .iter()
                    .any(|set| self.descriptor_sets.get(set) == Some(&pool)),
                _ => false,
            })
    }

    fn complete_one(&mut self) -> bool {
        match self.queue.pop_front() {
            Some(fence) => {
                self.signaled.insert(fence);
                true
            }
            None => false,
        }
    }
}

/// Dummy GPU backend with a simulated queue.
#[derive(Debug, Default)]
pub struct DummyBackend {
    state: Mutex<DummyState>,
}

impl DummyBackend {
    /// Create a new dummy backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Finish every submission as soon as it is queued.
    pub fn set_auto_complete(&self, enabled: bool) {
        let mut state = self.state.lock();
        state.auto_complete = enabled;
        if enabled {
            while state.complete_one() {}
        }
    }

    /// Finish up to `count` of the oldest pending submissions.
    ///
    /// Returns how many were finished.
    pub fn complete_submissions(&self, count: usize) -> usize {
        let mut state = self.state.lock();
        (0..count).take_while(|_| state.complete_one()).count()
    }

    /// Finish every pending submission.
    pub fn complete_all(&self) -> usize {
        let mut state = self.state.lock();
        let mut count = 0;
        while state.complete_one() {
            count += 1;
        }
        count
    }

    /// Number of submitted but unfinished queue submissions.
    pub fn pending_submissions(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Make every following device and queue call report device loss.
    pub fn set_device_lost(&self, lost: bool) {
        self.state.lock().device_lost = lost;
    }

    /// Make the next `queue_submit` fail with `result`.
    pub fn fail_next_submit(&self, result: vk::Result) {
        self.state.lock().fail_next_submit = Some(result);
    }

    /// Make the next `queue_bind_sparse` fail with `result`.
    pub fn fail_next_bind_sparse(&self, result: vk::Result) {
        self.state.lock().fail_next_bind_sparse = Some(result);
    }

    /// Make the next creation of `kind` fail.
    pub fn fail_next_create(&self, kind: ObjectKind) {
        self.state.lock().fail_next_create.insert(kind);
    }

    pub fn submits(&self) -> Vec<SubmitRecord> {
        self.state.lock().submits.clone()
    }

    pub fn sparse_binds(&self) -> Vec<SparseBindRecord> {
        self.state.lock().sparse_binds.clone()
    }

    /// Fence lists of every blocking wait, in call order.
    pub fn fence_waits(&self) -> Vec<Vec<vk::Fence>> {
        self.state.lock().fence_waits.clone()
    }

    pub fn descriptor_writes(&self) -> Vec<DescriptorWrite> {
        self.state.lock().descriptor_writes.clone()
    }

    /// Whether `set` was allocated and its pool not reset or destroyed since.
    pub fn is_descriptor_set_live(&self, set: vk::DescriptorSet) -> bool {
        self.state.lock().descriptor_sets.contains_key(&set)
    }

    pub fn created_count(&self, kind: ObjectKind) -> usize {
        self.state.lock().created.get(&kind).copied().unwrap_or(0)
    }

    pub fn destroyed_count(&self, kind: ObjectKind) -> usize {
        self.state.lock().destroyed.get(&kind).copied().unwrap_or(0)
    }

    /// Objects of `kind` created and not yet destroyed.
    pub fn live_count(&self, kind: ObjectKind) -> usize {
        self.created_count(kind)
            .saturating_sub(self.destroyed_count(kind))
    }

    /// Bindings a descriptor set layout was created with.
    pub fn set_layout_bindings(
        &self,
        layout: vk::DescriptorSetLayout,
    ) -> Option<Vec<DescriptorBinding>> {
        self.state.lock().set_layouts.get(&layout).cloned()
    }

    /// Set layouts a pipeline layout was created with.
    pub fn pipeline_layout_sets(
        &self,
        layout: vk::PipelineLayout,
    ) -> Option<Vec<vk::DescriptorSetLayout>> {
        self.state.lock().pipeline_layouts.get(&layout).cloned()
    }

    /// Forget logged submissions, sparse binds, waits and descriptor writes.
    pub fn clear_logs(&self) {
        let mut state = self.state.lock();
        state.submits.clear();
        state.sparse_binds.clear();
        state.fence_waits.clear();
        state.descriptor_writes.clear();
    }
}

impl GpuBackend for DummyBackend {
    type UploadMemory = DummyUploadMemory;

    fn name(&self) -> &'static str {
        "Dummy Backend"
    }

    fn create_fence(&self) -> Result<vk::Fence, GraphicsError> {
        let mut state = self.state.lock();
        state.create(ObjectKind::Fence)?;
        let fence = state.handle();
        log::trace!("DummyBackend: created fence {:?}", fence);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        state.signaled.remove(&fence);
        state.destroy(ObjectKind::Fence);
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<(), GraphicsError> {
        let mut state = self.state.lock();
        state.check_device()?;
        state.signaled.remove(&fence);
        Ok(())
    }

    fn fence_status(&self, fence: vk::Fence) -> Result<bool, GraphicsError> {
        let state = self.state.lock();
        state.check_device()?;
        Ok(state.signaled.contains(&fence))
    }

    fn wait_for_fences(
        &self,
        fences: &[vk::Fence],
        _timeout: Duration,
    ) -> Result<bool, GraphicsError> {
        let mut state = self.state.lock();
        state.check_device()?;
        state.fence_waits.push(fences.to_vec());
        loop {
            if fences.iter().all(|fence| state.signaled.contains(fence)) {
                return Ok(true);
            }
            if !state.complete_one() {
                log::warn!("DummyBackend: waiting on fences that were never submitted");
                return Ok(false);
            }
        }
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore, GraphicsError> {
        let mut state = self.state.lock();
        state.create(ObjectKind::Semaphore)?;
        Ok(state.handle())
    }

    fn destroy_semaphore(&self, _semaphore: vk::Semaphore) {
        self.state.lock().destroy(ObjectKind::Semaphore);
    }

    fn create_command_buffer_slot(&self) -> Result<CommandBufferSlot, GraphicsError> {
        let mut state = self.state.lock();
        state.create(ObjectKind::CommandBufferSlot)?;
        Ok(CommandBufferSlot {
            pool: state.handle(),
            buffer: state.handle(),
        })
    }

    fn destroy_command_buffer_slot(&self, slot: CommandBufferSlot) {
        let mut state = self.state.lock();
        state.recorded.remove(&slot.buffer);
        state.destroy(ObjectKind::CommandBufferSlot);
    }

    fn reset_command_pool(&self, _pool: vk::CommandPool) -> Result<(), GraphicsError> {
        self.state.lock().check_device()
    }

    fn record_commands(
        &self,
        command_buffer: vk::CommandBuffer,
        commands: &[DeferredCommand],
    ) -> Result<(), GraphicsError> {
        let mut state = self.state.lock();
        state.check_device()?;
        state.recorded.insert(command_buffer, commands.to_vec());
        Ok(())
    }

    fn queue_bind_sparse(
        &self,
        binds: &[SparseBufferBind],
        signal: vk::Semaphore,
    ) -> Result<(), GraphicsError> {
        let mut state = self.state.lock();
        state.check_device()?;
        if let Some(result) = state.fail_next_bind_sparse.take() {
            return Err(GraphicsError::from_vk("vkQueueBindSparse", result));
        }
        state.sparse_binds.push(SparseBindRecord {
            binds: binds.to_vec(),
            signal,
        });
        Ok(())
    }

    fn queue_submit(&self, submit: &QueueSubmit<'_>) -> Result<(), GraphicsError> {
        let mut state = self.state.lock();
        state.check_device()?;
        if let Some(result) = state.fail_next_submit.take() {
            if result == vk::Result::ERROR_DEVICE_LOST {
                state.device_lost = true;
            }
            return Err(GraphicsError::from_vk("vkQueueSubmit", result));
        }
        let commands = state
            .recorded
            .get(&submit.command_buffer)
            .cloned()
            .unwrap_or_default();
        state.submits.push(SubmitRecord {
            wait_semaphores: submit.wait_semaphores.to_vec(),
            wait_stages: submit.wait_stages.to_vec(),
            command_buffer: submit.command_buffer,
            fence: submit.fence,
            commands,
        });
        if state.auto_complete {
            state.signaled.insert(submit.fence);
        } else {
            state.queue.push_back(submit.fence);
        }
        Ok(())
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> Result<vk::DescriptorSetLayout, GraphicsError> {
        let mut state = self.state.lock();
        state.create(ObjectKind::DescriptorSetLayout)?;
        let layout = state.handle();
        state.set_layouts.insert(layout, bindings.to_vec());
        Ok(layout)
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        let mut state = self.state.lock();
        state.set_layouts.remove(&layout);
        state.destroy(ObjectKind::DescriptorSetLayout);
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> Result<vk::PipelineLayout, GraphicsError> {
        let mut state = self.state.lock();
        state.create(ObjectKind::PipelineLayout)?;
        let layout = state.handle();
        state.pipeline_layouts.insert(layout, set_layouts.to_vec());
        Ok(layout)
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        let mut state = self.state.lock();
        state.pipeline_layouts.remove(&layout);
        state.destroy(ObjectKind::PipelineLayout);
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        _pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool, GraphicsError> {
        let mut state = self.state.lock();
        state.create(ObjectKind::DescriptorPool)?;
        let pool = state.handle();
        state.descriptor_pools.insert(pool, (max_sets, max_sets));
        Ok(pool)
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> Result<(), GraphicsError> {
        let mut state = self.state.lock();
        if state.pool_in_use(pool) {
            return Err(GraphicsError::InvalidParameter(format!(
                "descriptor pool {pool:?} reset while a pending submission binds its sets"
            )));
        }
        if let Some((remaining, max_sets)) = state.descriptor_pools.get_mut(&pool) {
            *remaining = *max_sets;
        }
        state.descriptor_sets.retain(|_, owner| *owner != pool);
        Ok(())
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        let mut state = self.state.lock();
        state.descriptor_pools.remove(&pool);
        state.descriptor_sets.retain(|_, owner| *owner != pool);
        state.destroy(ObjectKind::DescriptorPool);
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        _layout: vk::DescriptorSetLayout,
    ) -> Result<Option<vk::DescriptorSet>, GraphicsError> {
        let mut state = self.state.lock();
        match state.descriptor_pools.get_mut(&pool) {
            Some((remaining, _)) if *remaining > 0 => {
                *remaining -= 1;
                let set = state.handle();
                state.descriptor_sets.insert(set, pool);
                Ok(Some(set))
            }
            Some(_) => Ok(None),
            None => Err(GraphicsError::InvalidParameter(format!(
                "unknown descriptor pool {pool:?}"
            ))),
        }
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        self.state
            .lock()
            .descriptor_writes
            .extend_from_slice(writes);
    }

    fn create_upload_memory(&self, size: u64) -> Result<DummyUploadMemory, GraphicsError> {
        let mut state = self.state.lock();
        state.create(ObjectKind::UploadMemory)?;
        let len = usize::try_from(size).map_err(|_| GraphicsError::OutOfMemory)?;
        Ok(DummyUploadMemory {
            buffer: state.handle(),
            data: vec![0; len],
        })
    }

    fn destroy_upload_memory(&self, _memory: DummyUploadMemory) {
        self.state.lock().destroy(ObjectKind::UploadMemory);
    }

    fn create_framebuffer(
        &self,
        _render_pass: vk::RenderPass,
        _attachment: vk::ImageView,
        _extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer, GraphicsError> {
        let mut state = self.state.lock();
        state.create(ObjectKind::Framebuffer)?;
        Ok(state.handle())
    }

    fn destroy_framebuffer(&self, _framebuffer: vk::Framebuffer) {
        self.state.lock().destroy(ObjectKind::Framebuffer);
    }
}
