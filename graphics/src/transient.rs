//! Transient per-frame allocators.
//!
//! Uniform data and descriptor sets written for a draw stay valid for the
//! rest of the guest frame: any later submission of the frame may bind them
//! again. Both allocators hand out space from *pages*; a page that fills up
//! is retired with the number of the last frame that used it and becomes
//! reusable once that frame has completed.
//!
//! ```text
//!   current page ──full──► retired (last frame) ──completed──► free
//!        ▲                                                      │
//!        └─────────────────────── reuse ────────────────────────┘
//! ```
//!
//! Both pools have a page limit. When it is reached and no page has retired
//! yet, allocation returns `None`; the caller then drains the queue and
//! releases every page with [`TransientAllocators::release_all`].

use ash::vk;
use xegpu_core::pool::Recycler;

use crate::backend::{GpuBackend, UploadMemory};
use crate::error::GraphicsError;
use crate::types::{BufferRange, DescriptorResources, DescriptorWrite};

/// Round `value` up to a multiple of `alignment` (a power of two).
pub fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

#[derive(Debug)]
struct UploadPage<M> {
    memory: M,
    used: u64,
}

/// Space reserved in an upload page, not yet committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadReservation {
    page: usize,
    offset: u64,
    size: u64,
    /// The reservation starts a fresh page that replaces the current one.
    new_page: bool,
}

/// Pool of persistently mapped uniform buffer pages.
#[derive(Debug)]
pub struct UploadBufferPool<M> {
    page_size: u64,
    alignment: u64,
    max_pages: usize,
    pages: Vec<UploadPage<M>>,
    recycler: Recycler<usize>,
    current: Option<usize>,
    current_last_frame: u64,
}

impl<M: UploadMemory> UploadBufferPool<M> {
    pub fn new(page_size: u64, alignment: u64, max_pages: usize) -> Self {
        Self {
            page_size,
            alignment,
            max_pages,
            pages: Vec::new(),
            recycler: Recycler::new(),
            current: None,
            current_last_frame: 0,
        }
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Find room for `size` bytes without consuming it.
    ///
    /// A page may be created to satisfy the request. Returns `Ok(None)` when
    /// the page limit is reached and no page has been released yet.
    pub fn reserve<B: GpuBackend<UploadMemory = M>>(
        &mut self,
        backend: &B,
        size: u64,
    ) -> Result<Option<UploadReservation>, GraphicsError> {
        if size > self.page_size {
            return Err(GraphicsError::InvalidParameter(format!(
                "upload of {size} bytes exceeds the page size {}",
                self.page_size
            )));
        }

        if let Some(page) = self.current {
            let offset = align_up(self.pages[page].used, self.alignment);
            if offset + size <= self.page_size {
                return Ok(Some(UploadReservation {
                    page,
                    offset,
                    size,
                    new_page: false,
                }));
            }
        }

        if let Some(&page) = self.recycler.peek_free() {
            return Ok(Some(UploadReservation {
                page,
                offset: 0,
                size,
                new_page: true,
            }));
        }

        if self.pages.len() >= self.max_pages {
            log::debug!(
                "Uniform upload pool exhausted ({} pages in flight)",
                self.recycler.in_flight_len()
            );
            return Ok(None);
        }

        let memory = backend.create_upload_memory(self.page_size)?;
        let page = self.pages.len();
        self.pages.push(UploadPage { memory, used: 0 });
        self.recycler.push_free(page);
        log::debug!("Created uniform upload page {}", page);
        Ok(Some(UploadReservation {
            page,
            offset: 0,
            size,
            new_page: true,
        }))
    }

    /// Consume a reservation for `frame`, returning the writable bytes
    /// and the bound range.
    pub fn commit(
        &mut self,
        reservation: UploadReservation,
        frame: u64,
    ) -> (&mut [u8], BufferRange) {
        if reservation.new_page {
            if let Some(previous) = self.current.take() {
                self.recycler.retire(self.current_last_frame, previous);
            }
            self.recycler.acquire();
            self.current = Some(reservation.page);
            self.pages[reservation.page].used = 0;
        }
        self.current_last_frame = frame;

        let page = &mut self.pages[reservation.page];
        page.used = reservation.offset + reservation.size;
        let range = BufferRange {
            buffer: page.memory.buffer(),
            offset: reservation.offset,
            range: reservation.size,
        };
        let start = reservation.offset as usize;
        let end = start + reservation.size as usize;
        let bytes = page.memory.bytes_mut();
        let end = end.min(bytes.len());
        (&mut bytes[start.min(end)..end], range)
    }

    /// Release pages whose last frame is `<= completed`, including the
    /// current one.
    pub fn reclaim(&mut self, completed: u64) -> usize {
        if self.current_last_frame <= completed {
            if let Some(page) = self.current.take() {
                self.recycler.retire(self.current_last_frame, page);
            }
        }
        self.recycler.reclaim(completed)
    }

    /// Destroy every page. Only valid with the GPU idle.
    pub fn clear<B: GpuBackend<UploadMemory = M>>(&mut self, backend: &B) {
        self.recycler.drain_all();
        self.current = None;
        for page in self.pages.drain(..) {
            backend.destroy_upload_memory(page.memory);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct DescriptorPage {
    pool: vk::DescriptorPool,
    sets_remaining: u32,
    descriptors_remaining: u32,
}

/// Pages of descriptor pools holding a single descriptor type.
#[derive(Debug)]
pub struct TransientDescriptorPool {
    descriptor_type: vk::DescriptorType,
    page_sets: u32,
    page_descriptors: u32,
    max_pages: usize,
    pages: Vec<DescriptorPage>,
    recycler: Recycler<usize>,
    current: Option<usize>,
    current_last_frame: u64,
}

impl TransientDescriptorPool {
    pub fn new(
        descriptor_type: vk::DescriptorType,
        page_sets: u32,
        page_descriptors: u32,
        max_pages: usize,
    ) -> Self {
        Self {
            descriptor_type,
            page_sets,
            page_descriptors,
            max_pages,
            pages: Vec::new(),
            recycler: Recycler::new(),
            current: None,
            current_last_frame: 0,
        }
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn fits(&self, page: usize, descriptor_count: u32) -> bool {
        let page = &self.pages[page];
        page.sets_remaining > 0 && page.descriptors_remaining >= descriptor_count
    }

    /// Allocate a set with `descriptor_count` descriptors for `frame`.
    ///
    /// Returns `Ok(None)` when the page limit is reached and no page has
    /// been released yet.
    pub fn allocate<B: GpuBackend>(
        &mut self,
        backend: &B,
        frame: u64,
        layout: vk::DescriptorSetLayout,
        descriptor_count: u32,
    ) -> Result<Option<vk::DescriptorSet>, GraphicsError> {
        if descriptor_count > self.page_descriptors {
            return Err(GraphicsError::InvalidParameter(format!(
                "{descriptor_count} descriptors exceed the pool page size {}",
                self.page_descriptors
            )));
        }

        if let Some(page) = self.current.filter(|&page| self.fits(page, descriptor_count)) {
            if let Some(set) =
                self.allocate_in(backend, page, frame, layout, descriptor_count)?
            {
                return Ok(Some(set));
            }
            // The driver ran out of space earlier than the counters predicted.
            self.pages[page].sets_remaining = 0;
        }

        let page = match self.recycler.acquire() {
            Some(page) => {
                backend.reset_descriptor_pool(self.pages[page].pool)?;
                self.pages[page].sets_remaining = self.page_sets;
                self.pages[page].descriptors_remaining = self.page_descriptors;
                page
            }
            None if self.pages.len() < self.max_pages => {
                let pool = backend.create_descriptor_pool(
                    self.page_sets,
                    &[vk::DescriptorPoolSize {
                        ty: self.descriptor_type,
                        descriptor_count: self.page_descriptors,
                    }],
                )?;
                self.pages.push(DescriptorPage {
                    pool,
                    sets_remaining: self.page_sets,
                    descriptors_remaining: self.page_descriptors,
                });
                log::debug!(
                    "Created {:?} descriptor pool page {}",
                    self.descriptor_type,
                    self.pages.len() - 1
                );
                self.pages.len() - 1
            }
            None => {
                log::debug!("{:?} descriptor pool exhausted", self.descriptor_type);
                return Ok(None);
            }
        };

        if let Some(previous) = self.current.replace(page) {
            self.recycler.retire(self.current_last_frame, previous);
        }
        self.allocate_in(backend, page, frame, layout, descriptor_count)
    }

    fn allocate_in<B: GpuBackend>(
        &mut self,
        backend: &B,
        page: usize,
        frame: u64,
        layout: vk::DescriptorSetLayout,
        descriptor_count: u32,
    ) -> Result<Option<vk::DescriptorSet>, GraphicsError> {
        let set = backend.allocate_descriptor_set(self.pages[page].pool, layout)?;
        if set.is_some() {
            let page = &mut self.pages[page];
            page.sets_remaining -= 1;
            page.descriptors_remaining -= descriptor_count;
            self.current_last_frame = frame;
        }
        Ok(set)
    }

    /// Release pages whose last frame is `<= completed`, including the
    /// current one. Released pools are reset when next used.
    pub fn reclaim(&mut self, completed: u64) -> usize {
        if self.current_last_frame <= completed {
            if let Some(page) = self.current.take() {
                self.recycler.retire(self.current_last_frame, page);
            }
        }
        self.recycler.reclaim(completed)
    }

    /// Destroy every page. Only valid with the GPU idle.
    pub fn clear<B: GpuBackend>(&mut self, backend: &B) {
        self.recycler.drain_all();
        self.current = None;
        for page in self.pages.drain(..) {
            backend.destroy_descriptor_pool(page.pool);
        }
    }
}

/// The transient allocators used by the binding resolver.
#[derive(Debug)]
pub struct TransientAllocators<M> {
    pub uniform_buffers: UploadBufferPool<M>,
    pub uniform_descriptors: TransientDescriptorPool,
    pub texture_descriptors: TransientDescriptorPool,
}

impl<M: UploadMemory> TransientAllocators<M> {
    pub fn new(config: &crate::config::ProcessorConfig) -> Self {
        Self {
            uniform_buffers: UploadBufferPool::new(
                config.uniform_page_size,
                config.uniform_alignment,
                config.max_uniform_pages,
            ),
            uniform_descriptors: TransientDescriptorPool::new(
                vk::DescriptorType::UNIFORM_BUFFER,
                config.uniform_descriptor_page_sets,
                config.uniform_descriptor_page_sets,
                config.max_descriptor_pages,
            ),
            texture_descriptors: TransientDescriptorPool::new(
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                config.texture_descriptor_page_sets,
                config.texture_descriptor_page_descriptors,
                config.max_descriptor_pages,
            ),
        }
    }

    /// Reserve `size` bytes of uniform data and a uniform buffer descriptor
    /// set of `layout` pointing at them.
    ///
    /// Returns the bytes to fill and the descriptor write to issue, or `None`
    /// if either pool is exhausted. Nothing is consumed in that case.
    pub fn write_uniform_buffer_binding<B: GpuBackend<UploadMemory = M>>(
        &mut self,
        backend: &B,
        frame: u64,
        size: u64,
        layout: vk::DescriptorSetLayout,
    ) -> Result<Option<(&mut [u8], DescriptorWrite)>, GraphicsError> {
        let Some(reservation) = self.uniform_buffers.reserve(backend, size)? else {
            return Ok(None);
        };
        let Some(set) = self
            .uniform_descriptors
            .allocate(backend, frame, layout, 1)?
        else {
            return Ok(None);
        };
        let (bytes, range) = self.uniform_buffers.commit(reservation, frame);
        let write = DescriptorWrite {
            set,
            binding: 0,
            resources: DescriptorResources::UniformBuffer(range),
        };
        Ok(Some((bytes, write)))
    }

    /// Release the pages of frames up to `completed_frame`.
    ///
    /// Returns whether any page was released. Sets allocated from a released
    /// page must not be bound again.
    pub fn reclaim(&mut self, completed_frame: u64) -> bool {
        let released = self.uniform_buffers.reclaim(completed_frame)
            + self.uniform_descriptors.reclaim(completed_frame)
            + self.texture_descriptors.reclaim(completed_frame);
        released != 0
    }

    /// Release every page, including those of the open frame. Only valid
    /// with no submission open or in flight.
    pub fn release_all(&mut self) -> bool {
        self.reclaim(u64::MAX)
    }

    /// Destroy all pages. Only valid with the GPU idle.
    pub fn clear<B: GpuBackend<UploadMemory = M>>(&mut self, backend: &B) {
        self.uniform_buffers.clear(backend);
        self.uniform_descriptors.clear(backend);
        self.texture_descriptors.clear(backend);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DummyBackend;
    use crate::backend::dummy::{DummyUploadMemory, ObjectKind};
    use crate::config::ProcessorConfig;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
    }

    #[test]
    fn test_uploads_share_a_page_with_alignment() {
        let backend = DummyBackend::new();
        let mut pool = UploadBufferPool::<DummyUploadMemory>::new(1024, 256, 2);

        let first = pool.reserve(&backend, 100).unwrap().unwrap();
        let (bytes, first_range) = pool.commit(first, 1);
        assert_eq!(bytes.len(), 100);
        let second = pool.reserve(&backend, 100).unwrap().unwrap();
        let (_, second_range) = pool.commit(second, 1);

        assert_eq!(first_range.offset, 0);
        assert_eq!(second_range.offset, 256);
        assert_eq!(first_range.buffer, second_range.buffer);
        assert_eq!(pool.page_count(), 1);
    }

    #[test]
    fn test_upload_pool_exhausts_then_recovers() {
        let backend = DummyBackend::new();
        let mut pool = UploadBufferPool::<DummyUploadMemory>::new(256, 256, 2);

        for frame in [1, 1] {
            let reservation = pool.reserve(&backend, 256).unwrap().unwrap();
            pool.commit(reservation, frame);
        }
        assert!(pool.reserve(&backend, 256).unwrap().is_none());

        // The first page was retired with frame 1 when the second one
        // became current.
        pool.reclaim(1);
        let reservation = pool.reserve(&backend, 256).unwrap().unwrap();
        pool.commit(reservation, 2);
        assert_eq!(backend.created_count(ObjectKind::UploadMemory), 2);
    }

    #[test]
    fn test_reservation_without_commit_consumes_nothing() {
        let backend = DummyBackend::new();
        let mut pool = UploadBufferPool::<DummyUploadMemory>::new(1024, 256, 1);
        let a = pool.reserve(&backend, 64).unwrap().unwrap();
        let b = pool.reserve(&backend, 64).unwrap().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_oversized_upload_rejected() {
        let backend = DummyBackend::new();
        let mut pool = UploadBufferPool::<DummyUploadMemory>::new(256, 256, 1);
        assert!(pool.reserve(&backend, 257).is_err());
    }

    #[test]
    fn test_descriptor_pool_pages_by_set_count() {
        let backend = DummyBackend::new();
        let mut pool = TransientDescriptorPool::new(vk::DescriptorType::UNIFORM_BUFFER, 2, 2, 2);
        let layout = vk::DescriptorSetLayout::null();

        for _ in 0..4 {
            assert!(pool.allocate(&backend, 1, layout, 1).unwrap().is_some());
        }
        assert_eq!(pool.page_count(), 2);
        assert!(pool.allocate(&backend, 1, layout, 1).unwrap().is_none());

        pool.reclaim(1);
        assert!(pool.allocate(&backend, 2, layout, 1).unwrap().is_some());
        assert_eq!(backend.created_count(ObjectKind::DescriptorPool), 2);
    }

    #[test]
    fn test_descriptor_pool_pages_by_descriptor_count() {
        let backend = DummyBackend::new();
        let mut pool =
            TransientDescriptorPool::new(vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 8, 4, 4);
        let layout = vk::DescriptorSetLayout::null();

        pool.allocate(&backend, 1, layout, 3).unwrap().unwrap();
        pool.allocate(&backend, 1, layout, 3).unwrap().unwrap();
        assert_eq!(pool.page_count(), 2);
        assert!(pool.allocate(&backend, 1, layout, 5).is_err());
    }

    #[test]
    fn test_uniform_binding_not_consumed_when_descriptors_exhausted() {
        let backend = DummyBackend::new();
        let config = ProcessorConfig::new()
            .with_uniform_page_size(1024)
            .with_uniform_descriptor_page_sets(1)
            .with_max_descriptor_pages(1);
        let mut allocators = TransientAllocators::<DummyUploadMemory>::new(&config);
        let layout = vk::DescriptorSetLayout::null();

        let (_, first) = allocators
            .write_uniform_buffer_binding(&backend, 1, 64, layout)
            .unwrap()
            .unwrap();
        assert!(
            allocators
                .write_uniform_buffer_binding(&backend, 1, 64, layout)
                .unwrap()
                .is_none()
        );

        // The failed attempt left the upload page where it was.
        let next = allocators.uniform_buffers.reserve(&backend, 64).unwrap().unwrap();
        match first.resources {
            DescriptorResources::UniformBuffer(range) => assert_eq!(next.offset, range.offset + 256),
            _ => panic!("expected a uniform buffer write"),
        }

        allocators.reclaim(1);
        assert!(
            allocators
                .write_uniform_buffer_binding(&backend, 2, 64, layout)
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn test_release_all_frees_pages_of_the_open_frame() {
        let backend = DummyBackend::new();
        let config = ProcessorConfig::new()
            .with_uniform_page_size(1024)
            .with_max_uniform_pages(1)
            .with_uniform_descriptor_page_sets(1)
            .with_max_descriptor_pages(1);
        let mut allocators = TransientAllocators::<DummyUploadMemory>::new(&config);
        let layout = vk::DescriptorSetLayout::null();

        allocators
            .write_uniform_buffer_binding(&backend, 1, 64, layout)
            .unwrap()
            .unwrap();
        assert!(
            allocators
                .write_uniform_buffer_binding(&backend, 1, 64, layout)
                .unwrap()
                .is_none()
        );

        // Frame 1 has not completed.
        assert!(!allocators.reclaim(0));
        assert!(allocators.release_all());
        assert!(
            allocators
                .write_uniform_buffer_binding(&backend, 1, 64, layout)
                .unwrap()
                .is_some()
        );
    }
}
