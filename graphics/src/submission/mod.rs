//! Submission and frame state machine.
//!
//! A *submission* is one queue submit of one command buffer, signalling one
//! fence. Submission numbers start at 1 and only grow:
//!
//! ```text
//!   completed ──► [ in flight: completed+1 .. current-1 ] ──► current (open or next)
//!
//!   current_submission = completed + in_flight_fences + 1
//! ```
//!
//! ```text
//!   NoSubmission ──open──► Open ──submit ok──► Closed (in flight) ──fence──► Completed
//!                           │ ▲
//!                           └─┘ submit failed: stays open, resources kept
//!
//!   any state ──VK_ERROR_DEVICE_LOST──► DeviceLost (sticky)
//! ```
//!
//! Retirement is strictly oldest first. Every pool owned here (fences,
//! semaphores, command buffers, sparse validation ranges) only returns an
//! object once `completed` has reached the submission that last used it.

pub mod command_buffers;
pub mod frames;
pub mod signals;
pub mod sparse;

use std::time::Duration;

use ash::vk;
use xegpu_core::profiling::profile_scope;

use crate::backend::GpuBackend;
use crate::deferred::DeferredCommand;
use crate::error::GraphicsError;
use crate::types::{QueueSubmit, SparseMemoryBind};

pub use command_buffers::CommandBufferPool;
pub use frames::{FrameRing, MAX_FRAMES_IN_FLIGHT};
pub use signals::CompletionSignalPool;
pub use sparse::SparseBindBatcher;

/// Whether the device is still usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceState {
    #[default]
    Ok,
    Lost,
}

/// Tracks open, in-flight and completed submissions and the frames built
/// from them.
#[derive(Debug)]
pub struct SubmissionTracker {
    signals: CompletionSignalPool,
    command_buffers: CommandBufferPool,
    sparse: SparseBindBatcher,
    frames: FrameRing,
    completed: u64,
    open: bool,
    device_state: DeviceState,
    /// Semaphores the open submission must wait on, with their stages.
    /// Kept across a failed submit so the retry still waits on them.
    wait_semaphores: Vec<vk::Semaphore>,
    wait_stages: Vec<vk::PipelineStageFlags>,
    fence_wait_timeout: Duration,
}

impl SubmissionTracker {
    pub fn new(validate_sparse_binds: bool, fence_wait_timeout: Duration) -> Self {
        Self {
            signals: CompletionSignalPool::new(),
            command_buffers: CommandBufferPool::new(),
            sparse: SparseBindBatcher::new(validate_sparse_binds),
            frames: FrameRing::new(),
            completed: 0,
            open: false,
            device_state: DeviceState::Ok,
            wait_semaphores: Vec::new(),
            wait_stages: Vec::new(),
            fence_wait_timeout,
        }
    }

    /// Number of the open submission, or of the next one if none is open.
    pub fn current_submission(&self) -> u64 {
        self.completed + self.signals.in_flight_fence_count() as u64 + 1
    }

    pub fn completed_submission(&self) -> u64 {
        self.completed
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Whether nothing is open and nothing is in flight.
    pub fn is_idle(&self) -> bool {
        !self.open && self.signals.in_flight_fence_count() == 0
    }

    pub fn frames(&self) -> &FrameRing {
        &self.frames
    }

    pub fn frames_mut(&mut self) -> &mut FrameRing {
        &mut self.frames
    }

    pub fn signals(&self) -> &CompletionSignalPool {
        &self.signals
    }

    pub fn command_buffers(&self) -> &CommandBufferPool {
        &self.command_buffers
    }

    pub fn sparse(&self) -> &SparseBindBatcher {
        &self.sparse
    }

    pub fn device_state(&self) -> DeviceState {
        self.device_state
    }

    pub fn ensure_device(&self) -> Result<(), GraphicsError> {
        match self.device_state {
            DeviceState::Ok => Ok(()),
            DeviceState::Lost => Err(GraphicsError::DeviceLost),
        }
    }

    /// Record device loss if `error` reports it, and pass the error through.
    pub fn note_error(&mut self, error: GraphicsError) -> GraphicsError {
        if error.is_device_lost() && self.device_state != DeviceState::Lost {
            log::error!("GPU device lost");
            self.device_state = DeviceState::Lost;
        }
        error
    }

    /// Mark a submission open. Returns `false` if one already was.
    pub fn open_submission(&mut self) -> bool {
        let newly_opened = !self.open;
        self.open = true;
        newly_opened
    }

    /// Queue sparse binds for the current submission.
    pub fn sparse_bind_buffer(
        &mut self,
        buffer: vk::Buffer,
        binds: &[SparseMemoryBind],
        wait_stage_mask: vk::PipelineStageFlags,
    ) -> Result<(), GraphicsError> {
        self.ensure_device()?;
        let submission = self.current_submission();
        self.sparse
            .bind_buffer(submission, buffer, binds, wait_stage_mask)
    }

    /// Make sure every object the next submit needs exists, so a creation
    /// failure is reported before anything is queued.
    pub fn prepare_submission<B: GpuBackend>(&mut self, backend: &B) -> Result<(), GraphicsError> {
        self.signals.ensure_free_fence(backend)?;
        if !self.sparse.is_empty() {
            self.signals.ensure_free_semaphore(backend)?;
        }
        self.command_buffers.ensure_writable(backend)?;
        Ok(())
    }

    /// Close the open submission: issue pending sparse binds, record
    /// `commands` into a pooled command buffer and submit it with a fence.
    ///
    /// On failure the submission stays open and every pooled object stays in
    /// its free list. A sparse bind that was already issued is kept as a wait
    /// of the retried submission.
    pub fn submit<B: GpuBackend>(
        &mut self,
        backend: &B,
        commands: &[DeferredCommand],
    ) -> Result<(), GraphicsError> {
        profile_scope!("submission_submit");
        self.ensure_device()?;
        self.prepare_submission(backend)?;
        let submission = self.current_submission();

        if !self.sparse.is_empty() {
            let semaphore = self.signals.ensure_free_semaphore(backend)?;
            let bind_result = backend.queue_bind_sparse(self.sparse.pending(), semaphore);
            if let Err(e) = bind_result {
                log::error!("Failed to bind sparse memory for submission {}: {}", submission, e);
                return Err(self.note_error(e));
            }
            self.signals.take_semaphore();
            self.wait_semaphores.push(semaphore);
            self.wait_stages.push(self.sparse.wait_stage_mask());
            self.sparse.flushed();
        }

        let slot = self.command_buffers.ensure_writable(backend)?;
        let record_result = backend
            .reset_command_pool(slot.pool)
            .and_then(|()| backend.record_commands(slot.buffer, commands));
        if let Err(e) = record_result {
            return Err(self.note_error(e));
        }

        let fence = self.signals.ensure_free_fence(backend)?;
        if let Err(e) = backend.reset_fence(fence) {
            return Err(self.note_error(e));
        }

        let submit_result = backend.queue_submit(&QueueSubmit {
            wait_semaphores: &self.wait_semaphores,
            wait_stages: &self.wait_stages,
            command_buffer: slot.buffer,
            fence,
        });
        if let Err(e) = submit_result {
            log::error!("Failed to submit command buffer {}: {}", submission, e);
            return Err(match self.note_error(e) {
                GraphicsError::DeviceLost => GraphicsError::DeviceLost,
                other => GraphicsError::SubmissionFailed(other.to_string()),
            });
        }

        for semaphore in self.wait_semaphores.drain(..) {
            self.signals.semaphore_submitted(submission, semaphore);
        }
        self.wait_stages.clear();
        if let Some(slot) = self.command_buffers.take() {
            self.command_buffers.submitted(submission, slot);
        }
        if let Some(fence) = self.signals.take_fence() {
            self.signals.fence_submitted(submission, fence);
        }
        self.open = false;
        log::debug!(
            "Submitted {} ({} commands, {} in flight)",
            submission,
            commands.len(),
            self.signals.in_flight_fence_count()
        );
        Ok(())
    }

    /// Advance the completed counter, blocking until `await_submission`
    /// completes and polling everything after it.
    ///
    /// `await_submission` is clamped to the last submitted one. Returns the
    /// number of submissions that completed during this call.
    pub fn check_fences<B: GpuBackend>(
        &mut self,
        backend: &B,
        await_submission: u64,
    ) -> Result<u64, GraphicsError> {
        profile_scope!("submission_check_fences");
        self.ensure_device()?;
        let before = self.completed;
        let await_submission = await_submission.min(self.current_submission() - 1);

        if await_submission > self.completed {
            let count = (await_submission - self.completed) as usize;
            let fences: Vec<vk::Fence> = self
                .signals
                .in_flight_fences()
                .take(count)
                .map(|(_, fence)| fence)
                .collect();
            loop {
                match backend.wait_for_fences(&fences, self.fence_wait_timeout) {
                    Ok(true) => break,
                    Ok(false) => log::warn!(
                        "Awaiting submission {} is taking longer than {:?}",
                        await_submission,
                        self.fence_wait_timeout
                    ),
                    Err(e) => return Err(self.note_error(e)),
                }
            }
        }

        let mut newly_completed = 0;
        let mut poll_error = None;
        for (_, fence) in self.signals.in_flight_fences() {
            match backend.fence_status(fence) {
                Ok(true) => newly_completed += 1,
                Ok(false) => break,
                Err(e) => {
                    poll_error = Some(e);
                    break;
                }
            }
        }

        self.completed += newly_completed;
        self.signals.reclaim(self.completed);
        self.command_buffers.reclaim(self.completed);
        self.sparse.retire(self.completed);

        if let Some(e) = poll_error {
            return Err(self.note_error(e));
        }
        if self.completed != before {
            log::trace!("Submissions completed up to {}", self.completed);
        }
        Ok(self.completed - before)
    }

    /// Leave the lost-device state after the owner recreated the device
    /// objects the GPU was using.
    ///
    /// Everything in flight is treated as completed, so numbering continues
    /// from the last submitted submission.
    pub fn reset_device_loss<B: GpuBackend>(&mut self, backend: &B) {
        self.completed = self.current_submission() - 1;
        self.signals.abandon_in_flight(backend);
        self.command_buffers.reclaim(u64::MAX);
        self.sparse.flushed();
        self.sparse.retire(u64::MAX);
        for semaphore in self.wait_semaphores.drain(..) {
            backend.destroy_semaphore(semaphore);
        }
        self.wait_stages.clear();
        self.open = false;
        self.device_state = DeviceState::Ok;
        log::info!("Device loss cleared, continuing after submission {}", self.completed);
    }

    /// Destroy every pooled object. Only valid with the GPU idle.
    pub fn destroy<B: GpuBackend>(&mut self, backend: &B) {
        self.signals.destroy(backend);
        self.command_buffers.destroy(backend);
        for semaphore in self.wait_semaphores.drain(..) {
            backend.destroy_semaphore(semaphore);
        }
        self.wait_stages.clear();
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::Handle;

    use super::*;
    use crate::backend::DummyBackend;
    use crate::backend::dummy::ObjectKind;

    fn tracker() -> SubmissionTracker {
        SubmissionTracker::new(true, Duration::from_millis(10))
    }

    fn submit_one(tracker: &mut SubmissionTracker, backend: &DummyBackend) {
        tracker.open_submission();
        tracker.submit(backend, &[]).unwrap();
    }

    #[test]
    fn test_current_submission_counts_in_flight() {
        let backend = DummyBackend::new();
        let mut tracker = tracker();
        assert_eq!(tracker.current_submission(), 1);

        submit_one(&mut tracker, &backend);
        submit_one(&mut tracker, &backend);
        assert_eq!(tracker.current_submission(), 3);
        assert_eq!(tracker.completed_submission(), 0);

        backend.complete_submissions(1);
        assert_eq!(tracker.check_fences(&backend, 0).unwrap(), 1);
        assert_eq!(tracker.completed_submission(), 1);
        assert_eq!(tracker.current_submission(), 3);
    }

    #[test]
    fn test_await_blocks_only_up_to_requested_submission() {
        let backend = DummyBackend::new();
        let mut tracker = tracker();
        for _ in 0..3 {
            submit_one(&mut tracker, &backend);
        }

        tracker.check_fences(&backend, 2).unwrap();
        assert_eq!(tracker.completed_submission(), 2);
        assert_eq!(backend.fence_waits().len(), 1);
        assert_eq!(backend.fence_waits()[0].len(), 2);
        assert_eq!(backend.pending_submissions(), 1);
    }

    #[test]
    fn test_failed_submit_keeps_submission_open() {
        let backend = DummyBackend::new();
        let mut tracker = tracker();
        tracker.open_submission();
        backend.fail_next_submit(vk::Result::ERROR_OUT_OF_DATE_KHR);

        let result = tracker.submit(&backend, &[]);
        assert!(matches!(result, Err(GraphicsError::SubmissionFailed(_))));
        assert!(tracker.is_open());
        assert_eq!(tracker.signals().free_fence_count(), 1);
        assert_eq!(tracker.command_buffers().free_count(), 1);

        tracker.submit(&backend, &[]).unwrap();
        assert_eq!(backend.created_count(ObjectKind::Fence), 1);
        assert_eq!(backend.created_count(ObjectKind::CommandBufferSlot), 1);
    }

    #[test]
    fn test_sparse_semaphore_survives_failed_submit() {
        let backend = DummyBackend::new();
        let mut tracker = tracker();
        tracker.open_submission();
        let bind = SparseMemoryBind {
            resource_offset: 0,
            size: 65536,
            memory: vk::DeviceMemory::from_raw(7),
            memory_offset: 0,
        };
        tracker
            .sparse_bind_buffer(
                vk::Buffer::from_raw(9),
                &[bind],
                vk::PipelineStageFlags::VERTEX_SHADER,
            )
            .unwrap();
        backend.fail_next_submit(vk::Result::ERROR_UNKNOWN);

        assert!(tracker.submit(&backend, &[]).is_err());
        assert_eq!(backend.sparse_binds().len(), 1);
        assert!(tracker.sparse().is_empty());

        tracker.submit(&backend, &[]).unwrap();
        let submits = backend.submits();
        assert_eq!(submits.len(), 1);
        assert_eq!(submits[0].wait_semaphores, vec![backend.sparse_binds()[0].signal]);
        assert_eq!(
            submits[0].wait_stages,
            vec![vk::PipelineStageFlags::VERTEX_SHADER]
        );
        assert_eq!(backend.sparse_binds().len(), 1);
    }

    #[test]
    fn test_device_loss_is_sticky() {
        let backend = DummyBackend::new();
        let mut tracker = tracker();
        tracker.open_submission();
        backend.fail_next_submit(vk::Result::ERROR_DEVICE_LOST);

        assert_eq!(tracker.submit(&backend, &[]), Err(GraphicsError::DeviceLost));
        assert_eq!(tracker.device_state(), DeviceState::Lost);
        assert_eq!(tracker.check_fences(&backend, 0), Err(GraphicsError::DeviceLost));
    }

    #[test]
    fn test_reset_device_loss_keeps_numbering_monotonic() {
        let backend = DummyBackend::new();
        let mut tracker = tracker();
        submit_one(&mut tracker, &backend);
        submit_one(&mut tracker, &backend);
        backend.set_device_lost(true);
        assert!(tracker.check_fences(&backend, 2).is_err());

        backend.set_device_lost(false);
        tracker.reset_device_loss(&backend);
        assert_eq!(tracker.completed_submission(), 2);
        assert_eq!(tracker.current_submission(), 3);
        assert!(tracker.is_idle());
    }
}
