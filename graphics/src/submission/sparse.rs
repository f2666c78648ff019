//! Sparse bind batcher.
//!
//! Sparse buffer binds requested while a submission is open are accumulated
//! and issued as one `vkQueueBindSparse` right before the submission's command
//! buffer. The bind signals a semaphore the submission waits on, with the
//! union of every requested wait stage.
//!
//! Binds must not overlap each other within a batch, nor any range still
//! being bound by an in-flight batch. With validation enabled this is checked
//! and violating requests are rejected before they reach the batch.

use ash::vk;

use crate::error::GraphicsError;
use crate::types::{SparseBufferBind, SparseMemoryBind};

#[derive(Debug, Clone, Copy)]
struct TrackedRange {
    buffer: vk::Buffer,
    start: u64,
    end: u64,
    submission: u64,
}

/// Pending sparse binds of the open submission.
#[derive(Debug)]
pub struct SparseBindBatcher {
    pending: Vec<SparseBufferBind>,
    wait_stage_mask: vk::PipelineStageFlags,
    /// Ranges of pending and in-flight batches, if validation is enabled.
    tracked: Option<Vec<TrackedRange>>,
}

impl SparseBindBatcher {
    pub fn new(validate: bool) -> Self {
        Self {
            pending: Vec::new(),
            wait_stage_mask: vk::PipelineStageFlags::empty(),
            tracked: validate.then(Vec::new),
        }
    }

    pub fn is_validating(&self) -> bool {
        self.tracked.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Binds of the pending batch, grouped per buffer.
    pub fn pending(&self) -> &[SparseBufferBind] {
        &self.pending
    }

    /// Union of the wait stages requested for the pending batch.
    pub fn wait_stage_mask(&self) -> vk::PipelineStageFlags {
        self.wait_stage_mask
    }

    /// Add binds for `buffer` to the batch of `submission`.
    ///
    /// Nothing is added if validation rejects any of the binds.
    pub fn bind_buffer(
        &mut self,
        submission: u64,
        buffer: vk::Buffer,
        binds: &[SparseMemoryBind],
        wait_stage_mask: vk::PipelineStageFlags,
    ) -> Result<(), GraphicsError> {
        if binds.is_empty() {
            return Ok(());
        }

        if let Some(tracked) = &mut self.tracked {
            for (i, bind) in binds.iter().enumerate() {
                let (start, end) = (bind.resource_offset, bind.resource_end());
                let overlaps_tracked = tracked
                    .iter()
                    .any(|range| range.buffer == buffer && start < range.end && range.start < end);
                let overlaps_request = binds[..i]
                    .iter()
                    .any(|other| start < other.resource_end() && other.resource_offset < end);
                if overlaps_tracked || overlaps_request {
                    log::error!(
                        "Sparse bind of {:?} [{:#x}, {:#x}) overlaps a pending or in-flight bind",
                        buffer,
                        start,
                        end
                    );
                    return Err(GraphicsError::InvalidParameter(format!(
                        "overlapping sparse bind of {buffer:?} at {start:#x}"
                    )));
                }
            }
            tracked.extend(binds.iter().map(|bind| TrackedRange {
                buffer,
                start: bind.resource_offset,
                end: bind.resource_end(),
                submission,
            }));
        }

        match self.pending.iter_mut().find(|pending| pending.buffer == buffer) {
            Some(pending) => pending.binds.extend_from_slice(binds),
            None => self.pending.push(SparseBufferBind {
                buffer,
                binds: binds.to_vec(),
            }),
        }
        self.wait_stage_mask |= wait_stage_mask;
        Ok(())
    }

    /// Forget the batch after it was issued to the queue.
    ///
    /// Tracked ranges stay until [`retire`](Self::retire) sees their
    /// submission complete.
    pub fn flushed(&mut self) {
        self.pending.clear();
        self.wait_stage_mask = vk::PipelineStageFlags::empty();
    }

    /// Stop tracking ranges of submissions `<= completed`.
    pub fn retire(&mut self, completed: u64) {
        if let Some(tracked) = &mut self.tracked {
            tracked.retain(|range| range.submission > completed);
        }
    }

    /// Number of ranges still checked against new binds.
    pub fn tracked_range_count(&self) -> usize {
        self.tracked.as_ref().map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::Handle;

    use super::*;

    fn bind(offset: u64, size: u64) -> SparseMemoryBind {
        SparseMemoryBind {
            resource_offset: offset,
            size,
            memory: vk::DeviceMemory::from_raw(1),
            memory_offset: offset,
        }
    }

    #[test]
    fn test_binds_grouped_per_buffer_and_stages_accumulate() {
        let mut batcher = SparseBindBatcher::new(false);
        let a = vk::Buffer::from_raw(10);
        let b = vk::Buffer::from_raw(11);
        batcher
            .bind_buffer(1, a, &[bind(0, 64)], vk::PipelineStageFlags::VERTEX_INPUT)
            .unwrap();
        batcher
            .bind_buffer(1, b, &[bind(0, 64)], vk::PipelineStageFlags::FRAGMENT_SHADER)
            .unwrap();
        batcher
            .bind_buffer(1, a, &[bind(64, 64)], vk::PipelineStageFlags::VERTEX_INPUT)
            .unwrap();

        assert_eq!(batcher.pending().len(), 2);
        assert_eq!(batcher.pending()[0].binds.len(), 2);
        assert_eq!(
            batcher.wait_stage_mask(),
            vk::PipelineStageFlags::VERTEX_INPUT | vk::PipelineStageFlags::FRAGMENT_SHADER
        );

        batcher.flushed();
        assert!(batcher.is_empty());
        assert_eq!(batcher.wait_stage_mask(), vk::PipelineStageFlags::empty());
    }

    #[test]
    fn test_overlap_with_in_flight_rejected_until_retired() {
        let mut batcher = SparseBindBatcher::new(true);
        let buffer = vk::Buffer::from_raw(10);
        batcher
            .bind_buffer(1, buffer, &[bind(0, 128)], vk::PipelineStageFlags::ALL_COMMANDS)
            .unwrap();
        batcher.flushed();

        let result = batcher.bind_buffer(
            2,
            buffer,
            &[bind(64, 128)],
            vk::PipelineStageFlags::ALL_COMMANDS,
        );
        assert!(matches!(result, Err(GraphicsError::InvalidParameter(_))));
        assert!(batcher.is_empty());

        batcher.retire(1);
        assert_eq!(batcher.tracked_range_count(), 0);
        batcher
            .bind_buffer(2, buffer, &[bind(64, 128)], vk::PipelineStageFlags::ALL_COMMANDS)
            .unwrap();
    }

    #[test]
    fn test_overlap_within_request_rejected() {
        let mut batcher = SparseBindBatcher::new(true);
        let buffer = vk::Buffer::from_raw(10);
        let result = batcher.bind_buffer(
            1,
            buffer,
            &[bind(0, 64), bind(32, 64)],
            vk::PipelineStageFlags::ALL_COMMANDS,
        );
        assert!(result.is_err());
        assert_eq!(batcher.tracked_range_count(), 0);
    }

    #[test]
    fn test_adjacent_ranges_and_other_buffers_allowed() {
        let mut batcher = SparseBindBatcher::new(true);
        let a = vk::Buffer::from_raw(10);
        let b = vk::Buffer::from_raw(11);
        batcher
            .bind_buffer(1, a, &[bind(0, 64), bind(64, 64)], vk::PipelineStageFlags::ALL_COMMANDS)
            .unwrap();
        batcher
            .bind_buffer(1, b, &[bind(0, 64)], vk::PipelineStageFlags::ALL_COMMANDS)
            .unwrap();
        assert_eq!(batcher.tracked_range_count(), 3);
    }
}
