//! Framebuffers for drawing the guest output into the presenter's images.

use ash::vk;
use xegpu_core::pool::Recycler;

use crate::backend::GpuBackend;
use crate::error::GraphicsError;

/// Guest output images the presenter may have alive at once.
pub const MAX_ACTIVE_GUEST_OUTPUT_IMAGE_VERSIONS: usize = 3;

#[derive(Debug, Clone, Copy)]
struct SwapFramebuffer {
    version: u64,
    framebuffer: vk::Framebuffer,
    last_submission: u64,
}

/// One framebuffer per presenter output slot, recreated when the slot's
/// image version changes.
///
/// A replaced framebuffer may still be in use by a submission in flight, so
/// it is destroyed only once that submission has completed.
#[derive(Debug, Default)]
pub struct SwapFramebufferCache {
    slots: [Option<SwapFramebuffer>; MAX_ACTIVE_GUEST_OUTPUT_IMAGE_VERSIONS],
    outdated: Recycler<vk::Framebuffer>,
}

impl SwapFramebufferCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Framebuffer for output `slot` at `version`, used by `submission`.
    #[allow(clippy::too_many_arguments)]
    pub fn get_framebuffer<B: GpuBackend>(
        &mut self,
        backend: &B,
        slot: u32,
        version: u64,
        render_pass: vk::RenderPass,
        image_view: vk::ImageView,
        extent: vk::Extent2D,
        submission: u64,
    ) -> Result<vk::Framebuffer, GraphicsError> {
        let entry = &mut self.slots[slot as usize % MAX_ACTIVE_GUEST_OUTPUT_IMAGE_VERSIONS];
        if let Some(existing) = entry.as_mut().filter(|existing| existing.version == version) {
            existing.last_submission = submission;
            return Ok(existing.framebuffer);
        }

        let framebuffer = backend.create_framebuffer(render_pass, image_view, extent)?;
        if let Some(old) = entry.replace(SwapFramebuffer {
            version,
            framebuffer,
            last_submission: submission,
        }) {
            log::debug!(
                "Guest output slot {} changed to version {}, retiring framebuffer",
                slot,
                version
            );
            self.outdated.retire(old.last_submission, old.framebuffer);
        }
        Ok(framebuffer)
    }

    pub fn outdated_count(&self) -> usize {
        self.outdated.in_flight_len()
    }

    /// Destroy replaced framebuffers whose last submission has completed.
    pub fn reclaim<B: GpuBackend>(&mut self, backend: &B, completed: u64) {
        if self.outdated.reclaim(completed) == 0 {
            return;
        }
        while let Some(framebuffer) = self.outdated.acquire() {
            backend.destroy_framebuffer(framebuffer);
        }
    }

    /// Destroy every framebuffer. Only valid with the GPU idle.
    pub fn clear<B: GpuBackend>(&mut self, backend: &B) {
        for framebuffer in self.outdated.drain_all() {
            backend.destroy_framebuffer(framebuffer);
        }
        for entry in &mut self.slots {
            if let Some(entry) = entry.take() {
                backend.destroy_framebuffer(entry.framebuffer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DummyBackend;
    use crate::backend::dummy::ObjectKind;

    fn get(
        cache: &mut SwapFramebufferCache,
        backend: &DummyBackend,
        slot: u32,
        version: u64,
        submission: u64,
    ) -> vk::Framebuffer {
        cache
            .get_framebuffer(
                backend,
                slot,
                version,
                vk::RenderPass::null(),
                vk::ImageView::null(),
                vk::Extent2D {
                    width: 1280,
                    height: 720,
                },
                submission,
            )
            .unwrap()
    }

    #[test]
    fn test_same_version_reuses_framebuffer() {
        let backend = DummyBackend::new();
        let mut cache = SwapFramebufferCache::new();
        let a = get(&mut cache, &backend, 0, 1, 1);
        let b = get(&mut cache, &backend, 0, 1, 2);
        assert_eq!(a, b);
        assert_eq!(backend.created_count(ObjectKind::Framebuffer), 1);
    }

    #[test]
    fn test_new_version_retires_old_until_completed() {
        let backend = DummyBackend::new();
        let mut cache = SwapFramebufferCache::new();
        get(&mut cache, &backend, 1, 1, 4);
        get(&mut cache, &backend, 1, 2, 5);
        assert_eq!(cache.outdated_count(), 1);

        cache.reclaim(&backend, 3);
        assert_eq!(backend.destroyed_count(ObjectKind::Framebuffer), 0);
        cache.reclaim(&backend, 4);
        assert_eq!(backend.destroyed_count(ObjectKind::Framebuffer), 1);
        assert_eq!(cache.outdated_count(), 0);
    }

    #[test]
    fn test_clear_destroys_everything() {
        let backend = DummyBackend::new();
        let mut cache = SwapFramebufferCache::new();
        for slot in 0..3 {
            get(&mut cache, &backend, slot, 1, 1);
        }
        get(&mut cache, &backend, 0, 2, 2);
        cache.clear(&backend);
        assert_eq!(backend.live_count(ObjectKind::Framebuffer), 0);
    }
}
