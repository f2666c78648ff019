//! Completion-signal pool: recycled fences and semaphores.

use ash::vk;
use xegpu_core::pool::Recycler;

use crate::backend::GpuBackend;
use crate::error::GraphicsError;

/// Fences and semaphores, either free or tagged with the submission whose
/// completion makes them reusable.
///
/// In-flight fences are kept oldest first; the tracker polls them in that
/// order, so the in-flight fence count also defines the current submission
/// number.
#[derive(Debug, Default)]
pub struct CompletionSignalPool {
    fences: Recycler<vk::Fence>,
    semaphores: Recycler<vk::Semaphore>,
}

impl CompletionSignalPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure a free fence exists, creating one if needed.
    ///
    /// The fence stays in the free list until [`take_fence`](Self::take_fence).
    pub fn ensure_free_fence<B: GpuBackend>(
        &mut self,
        backend: &B,
    ) -> Result<vk::Fence, GraphicsError> {
        if let Some(&fence) = self.fences.peek_free() {
            return Ok(fence);
        }
        let fence = backend.create_fence()?;
        log::debug!("Created submission fence {:?}", fence);
        self.fences.push_free(fence);
        Ok(fence)
    }

    /// Make sure a free semaphore exists, creating one if needed.
    pub fn ensure_free_semaphore<B: GpuBackend>(
        &mut self,
        backend: &B,
    ) -> Result<vk::Semaphore, GraphicsError> {
        if let Some(&semaphore) = self.semaphores.peek_free() {
            return Ok(semaphore);
        }
        let semaphore = backend.create_semaphore()?;
        self.semaphores.push_free(semaphore);
        Ok(semaphore)
    }

    pub fn take_fence(&mut self) -> Option<vk::Fence> {
        self.fences.acquire()
    }

    pub fn take_semaphore(&mut self) -> Option<vk::Semaphore> {
        self.semaphores.acquire()
    }

    /// Put a fence in flight for `submission`.
    pub fn fence_submitted(&mut self, submission: u64, fence: vk::Fence) {
        self.fences.retire(submission, fence);
    }

    /// Keep a semaphore until `submission`, which waits on it, completes.
    pub fn semaphore_submitted(&mut self, submission: u64, semaphore: vk::Semaphore) {
        self.semaphores.retire(submission, semaphore);
    }

    /// In-flight fences, oldest first.
    pub fn in_flight_fences(&self) -> impl Iterator<Item = (u64, vk::Fence)> + '_ {
        self.fences.in_flight().map(|(submission, fence)| (submission, *fence))
    }

    pub fn in_flight_fence_count(&self) -> usize {
        self.fences.in_flight_len()
    }

    pub fn free_fence_count(&self) -> usize {
        self.fences.free_len()
    }

    pub fn free_semaphore_count(&self) -> usize {
        self.semaphores.free_len()
    }

    pub fn in_flight_semaphore_count(&self) -> usize {
        self.semaphores.in_flight_len()
    }

    /// Return every signal of submissions `<= completed` to the free lists.
    pub fn reclaim(&mut self, completed: u64) {
        self.fences.reclaim(completed);
        self.semaphores.reclaim(completed);
    }

    /// Forget the GPU's view of every in-flight signal after device loss.
    ///
    /// Fences are reset before reuse anyway. Semaphores may be left signaled
    /// and are destroyed instead of reused.
    pub fn abandon_in_flight<B: GpuBackend>(&mut self, backend: &B) {
        self.fences.reclaim(u64::MAX);
        let free_semaphores = self.semaphores.free_len();
        let mut semaphores = self.semaphores.drain_all();
        for semaphore in semaphores.drain(free_semaphores..) {
            backend.destroy_semaphore(semaphore);
        }
        for semaphore in semaphores {
            self.semaphores.push_free(semaphore);
        }
    }

    /// Destroy every signal. Only valid with the GPU idle.
    pub fn destroy<B: GpuBackend>(&mut self, backend: &B) {
        for fence in self.fences.drain_all() {
            backend.destroy_fence(fence);
        }
        for semaphore in self.semaphores.drain_all() {
            backend.destroy_semaphore(semaphore);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DummyBackend;
    use crate::backend::dummy::ObjectKind;

    #[test]
    fn test_ensure_free_fence_reuses_existing() {
        let backend = DummyBackend::new();
        let mut pool = CompletionSignalPool::new();
        let a = pool.ensure_free_fence(&backend).unwrap();
        let b = pool.ensure_free_fence(&backend).unwrap();
        assert_eq!(a, b);
        assert_eq!(backend.created_count(ObjectKind::Fence), 1);
    }

    #[test]
    fn test_in_flight_fence_not_reused_before_completion() {
        let backend = DummyBackend::new();
        let mut pool = CompletionSignalPool::new();
        pool.ensure_free_fence(&backend).unwrap();
        let fence = pool.take_fence().unwrap();
        pool.fence_submitted(1, fence);

        let other = pool.ensure_free_fence(&backend).unwrap();
        assert_ne!(fence, other);

        pool.reclaim(1);
        assert_eq!(pool.free_fence_count(), 2);
        assert_eq!(pool.in_flight_fence_count(), 0);
    }

    #[test]
    fn test_abandon_destroys_in_flight_semaphores() {
        let backend = DummyBackend::new();
        let mut pool = CompletionSignalPool::new();
        pool.ensure_free_semaphore(&backend).unwrap();
        let semaphore = pool.take_semaphore().unwrap();
        pool.semaphore_submitted(4, semaphore);
        pool.ensure_free_semaphore(&backend).unwrap();

        pool.abandon_in_flight(&backend);
        assert_eq!(pool.free_semaphore_count(), 1);
        assert_eq!(pool.in_flight_semaphore_count(), 0);
        assert_eq!(backend.destroyed_count(ObjectKind::Semaphore), 1);
    }
}
