//! Command-buffer pool.

use xegpu_core::pool::Recycler;

use crate::backend::GpuBackend;
use crate::error::GraphicsError;
use crate::types::CommandBufferSlot;

/// Command pool + command buffer pairs, recycled once their submission
/// completes.
///
/// A slot is only taken when a submission closes; until then commands live
/// in the deferred command buffer.
#[derive(Debug, Default)]
pub struct CommandBufferPool {
    slots: Recycler<CommandBufferSlot>,
}

impl CommandBufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure a writable slot exists, creating one if the free list is empty.
    pub fn ensure_writable<B: GpuBackend>(
        &mut self,
        backend: &B,
    ) -> Result<CommandBufferSlot, GraphicsError> {
        if let Some(&slot) = self.slots.peek_free() {
            return Ok(slot);
        }
        let slot = backend.create_command_buffer_slot()?;
        log::debug!("Created command buffer slot {:?}", slot);
        self.slots.push_free(slot);
        Ok(slot)
    }

    pub fn take(&mut self) -> Option<CommandBufferSlot> {
        self.slots.acquire()
    }

    pub fn submitted(&mut self, submission: u64, slot: CommandBufferSlot) {
        self.slots.retire(submission, slot);
    }

    pub fn reclaim(&mut self, completed: u64) -> usize {
        self.slots.reclaim(completed)
    }

    pub fn free_count(&self) -> usize {
        self.slots.free_len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.slots.in_flight_len()
    }

    pub fn destroy<B: GpuBackend>(&mut self, backend: &B) {
        for slot in self.slots.drain_all() {
            backend.destroy_command_buffer_slot(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DummyBackend;

    #[test]
    fn test_slot_returns_only_after_completion() {
        let backend = DummyBackend::new();
        let mut pool = CommandBufferPool::new();
        pool.ensure_writable(&backend).unwrap();
        let slot = pool.take().unwrap();
        pool.submitted(2, slot);

        assert_eq!(pool.reclaim(1), 0);
        assert_eq!(pool.free_count(), 0);
        assert_eq!(pool.reclaim(2), 1);
        assert_eq!(pool.ensure_writable(&backend).unwrap(), slot);
    }
}
