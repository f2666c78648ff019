//! Descriptor set layout and pipeline layout cache.
//!
//! Every guest pipeline layout shares the same descriptor set order:
//!
//! | set | contents                                   | layout          |
//! |-----|--------------------------------------------|-----------------|
//! | 0   | shared memory + EDRAM storage buffers      | fixed           |
//! | 1   | fetch + bool/loop constants                | fixed           |
//! | 2   | float constants, vertex shader             | fixed           |
//! | 3   | float constants, pixel shader              | fixed           |
//! | 4   | system constants                           | fixed           |
//! | 5   | vertex shader textures                     | by texture count|
//! | 6   | pixel shader textures                      | by texture count|
//!
//! Only the two texture sets vary, so pipeline layouts are keyed by the two
//! texture counts. Layouts live in an arena; a [`PipelineLayoutId`] stays
//! valid until [`LayoutCache::clear`], which bumps the cache epoch so stale
//! ids resolve to `None` instead of dangling.

use std::collections::HashMap;

use ash::vk;
use bitflags::bitflags;
use static_assertions::const_assert;

use crate::backend::GpuBackend;
use crate::error::GraphicsError;
use crate::types::DescriptorBinding;

/// Descriptor set indices of guest pipeline layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DescriptorSet {
    SharedMemoryAndEdram = 0,
    FetchBoolLoopConstants = 1,
    FloatConstantsVertex = 2,
    FloatConstantsPixel = 3,
    SystemConstants = 4,
    TexturesVertex = 5,
    TexturesPixel = 6,
}

/// Number of descriptor sets in a guest pipeline layout.
pub const DESCRIPTOR_SET_COUNT: usize = 7;

const_assert!(DESCRIPTOR_SET_COUNT <= 32);

impl DescriptorSet {
    pub const ALL: [Self; DESCRIPTOR_SET_COUNT] = [
        Self::SharedMemoryAndEdram,
        Self::FetchBoolLoopConstants,
        Self::FloatConstantsVertex,
        Self::FloatConstantsPixel,
        Self::SystemConstants,
        Self::TexturesVertex,
        Self::TexturesPixel,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn mask(self) -> DescriptorSetMask {
        DescriptorSetMask::from_bits_truncate(1 << self as u32)
    }
}

bitflags! {
    /// One bit per [`DescriptorSet`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DescriptorSetMask: u32 {
        const SHARED_MEMORY_AND_EDRAM = 1 << 0;
        const FETCH_BOOL_LOOP_CONSTANTS = 1 << 1;
        const FLOAT_CONSTANTS_VERTEX = 1 << 2;
        const FLOAT_CONSTANTS_PIXEL = 1 << 3;
        const SYSTEM_CONSTANTS = 1 << 4;
        const TEXTURES_VERTEX = 1 << 5;
        const TEXTURES_PIXEL = 1 << 6;
    }
}

impl DescriptorSetMask {
    /// Sets whose contents are uniform buffers written per draw.
    pub const CONSTANTS: Self = Self::FETCH_BOOL_LOOP_CONSTANTS
        .union(Self::FLOAT_CONSTANTS_VERTEX)
        .union(Self::FLOAT_CONSTANTS_PIXEL)
        .union(Self::SYSTEM_CONSTANTS);

    /// Keep only sets with an index below `count`.
    pub fn below(count: usize) -> Self {
        Self::from_bits_truncate((1u32 << count.min(31)) - 1)
    }
}

/// Key of a texture descriptor set layout: bit 0 is the stage, the remaining
/// bits the texture count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureDescriptorSetLayoutKey(u32);

impl TextureDescriptorSetLayoutKey {
    pub fn new(is_vertex: bool, texture_count: u32) -> Self {
        Self(u32::from(is_vertex) | (texture_count << 1))
    }

    pub fn is_vertex(self) -> bool {
        self.0 & 1 != 0
    }

    pub fn texture_count(self) -> u32 {
        self.0 >> 1
    }
}

/// Key of a pipeline layout: pixel texture count in the low 16 bits, vertex
/// texture count in the high 16 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineLayoutKey(u32);

const_assert!(std::mem::size_of::<PipelineLayoutKey>() == 4);

impl PipelineLayoutKey {
    pub fn new(texture_count_pixel: u32, texture_count_vertex: u32) -> Result<Self, GraphicsError> {
        if texture_count_pixel > 0xFFFF || texture_count_vertex > 0xFFFF {
            return Err(GraphicsError::InvalidParameter(format!(
                "texture counts {texture_count_pixel}/{texture_count_vertex} exceed 65535"
            )));
        }
        Ok(Self(texture_count_pixel | (texture_count_vertex << 16)))
    }

    pub fn texture_count_pixel(self) -> u32 {
        self.0 & 0xFFFF
    }

    pub fn texture_count_vertex(self) -> u32 {
        self.0 >> 16
    }
}

/// Reference to a cached pipeline layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineLayoutId {
    index: u32,
    epoch: u64,
}

/// A pipeline layout and the texture set layouts it was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineLayout {
    pub handle: vk::PipelineLayout,
    pub textures_vertex: vk::DescriptorSetLayout,
    pub textures_pixel: vk::DescriptorSetLayout,
    pub key: PipelineLayoutKey,
}

impl PipelineLayout {
    /// Texture set layout of `set`, for the two variable sets.
    pub fn texture_set_layout(&self, set: DescriptorSet) -> Option<vk::DescriptorSetLayout> {
        match set {
            DescriptorSet::TexturesVertex => Some(self.textures_vertex),
            DescriptorSet::TexturesPixel => Some(self.textures_pixel),
            _ => None,
        }
    }
}

/// Set layouts shared by every guest pipeline layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedSetLayouts {
    pub empty: vk::DescriptorSetLayout,
    pub shared_memory_and_edram: vk::DescriptorSetLayout,
    /// Single uniform buffer: bool/loop constants followed by fetch constants.
    pub fetch_bool_loop_constants: vk::DescriptorSetLayout,
    pub float_constants_vertex: vk::DescriptorSetLayout,
    pub float_constants_pixel: vk::DescriptorSetLayout,
    pub system_constants: vk::DescriptorSetLayout,
}

impl FixedSetLayouts {
    fn create<B: GpuBackend>(
        backend: &B,
        vertex_stages: vk::ShaderStageFlags,
    ) -> Result<Self, GraphicsError> {
        let all_stages = vertex_stages | vk::ShaderStageFlags::FRAGMENT;
        let uniform = |stage_flags| {
            [DescriptorBinding {
                binding: 0,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 1,
                stage_flags,
            }]
        };
        let storage = |binding| DescriptorBinding {
            binding,
            descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
            descriptor_count: 1,
            stage_flags: all_stages,
        };

        let mut created = Vec::with_capacity(6);
        let result: Result<Self, GraphicsError> = (|| {
            let mut create = |bindings: &[DescriptorBinding]| {
                let layout = backend.create_descriptor_set_layout(bindings)?;
                created.push(layout);
                Ok::<_, GraphicsError>(layout)
            };
            Ok(Self {
                empty: create(&[])?,
                shared_memory_and_edram: create(&[storage(0), storage(1)])?,
                fetch_bool_loop_constants: create(&uniform(all_stages))?,
                float_constants_vertex: create(&uniform(vertex_stages))?,
                float_constants_pixel: create(&uniform(vk::ShaderStageFlags::FRAGMENT))?,
                system_constants: create(&uniform(all_stages))?,
            })
        })();

        if result.is_err() {
            for layout in created {
                backend.destroy_descriptor_set_layout(layout);
            }
        }
        result
    }

    /// Set layout for every set index, with the given texture layouts.
    fn pipeline_set_layouts(
        &self,
        textures_vertex: vk::DescriptorSetLayout,
        textures_pixel: vk::DescriptorSetLayout,
    ) -> [vk::DescriptorSetLayout; DESCRIPTOR_SET_COUNT] {
        [
            self.shared_memory_and_edram,
            self.fetch_bool_loop_constants,
            self.float_constants_vertex,
            self.float_constants_pixel,
            self.system_constants,
            textures_vertex,
            textures_pixel,
        ]
    }

    fn destroy<B: GpuBackend>(&self, backend: &B) {
        for layout in [
            self.empty,
            self.shared_memory_and_edram,
            self.fetch_bool_loop_constants,
            self.float_constants_vertex,
            self.float_constants_pixel,
            self.system_constants,
        ] {
            backend.destroy_descriptor_set_layout(layout);
        }
    }
}

/// Cache of texture set layouts and pipeline layouts.
#[derive(Debug)]
pub struct LayoutCache {
    fixed: FixedSetLayouts,
    vertex_stages: vk::ShaderStageFlags,
    texture_set_layouts: HashMap<TextureDescriptorSetLayoutKey, vk::DescriptorSetLayout>,
    layouts: Vec<PipelineLayout>,
    layout_map: HashMap<PipelineLayoutKey, u32>,
    epoch: u64,
}

impl LayoutCache {
    /// Create the fixed set layouts.
    pub fn new<B: GpuBackend>(
        backend: &B,
        vertex_stages: vk::ShaderStageFlags,
    ) -> Result<Self, GraphicsError> {
        Ok(Self {
            fixed: FixedSetLayouts::create(backend, vertex_stages)?,
            vertex_stages,
            texture_set_layouts: HashMap::new(),
            layouts: Vec::new(),
            layout_map: HashMap::new(),
            epoch: 0,
        })
    }

    pub fn fixed(&self) -> &FixedSetLayouts {
        &self.fixed
    }

    /// Get or create the pipeline layout for the given texture counts.
    pub fn get_pipeline_layout<B: GpuBackend>(
        &mut self,
        backend: &B,
        texture_count_pixel: u32,
        texture_count_vertex: u32,
    ) -> Result<PipelineLayoutId, GraphicsError> {
        let key = PipelineLayoutKey::new(texture_count_pixel, texture_count_vertex)?;
        if let Some(&index) = self.layout_map.get(&key) {
            return Ok(PipelineLayoutId {
                index,
                epoch: self.epoch,
            });
        }

        let textures_vertex = self.texture_set_layout(backend, true, texture_count_vertex)?;
        let textures_pixel = self.texture_set_layout(backend, false, texture_count_pixel)?;
        let set_layouts = self
            .fixed
            .pipeline_set_layouts(textures_vertex, textures_pixel);
        let handle = backend.create_pipeline_layout(&set_layouts)?;

        let index = self.layouts.len() as u32;
        self.layouts.push(PipelineLayout {
            handle,
            textures_vertex,
            textures_pixel,
            key,
        });
        self.layout_map.insert(key, index);
        log::debug!(
            "Created pipeline layout for {} vertex / {} pixel textures",
            texture_count_vertex,
            texture_count_pixel
        );
        Ok(PipelineLayoutId {
            index,
            epoch: self.epoch,
        })
    }

    /// Resolve an id, or `None` if the cache was cleared since it was issued.
    pub fn layout(&self, id: PipelineLayoutId) -> Option<&PipelineLayout> {
        if id.epoch != self.epoch {
            return None;
        }
        self.layouts.get(id.index as usize)
    }

    /// Get or create the set layout for `texture_count` textures of a stage.
    ///
    /// Zero textures map to the shared empty layout.
    pub fn texture_set_layout<B: GpuBackend>(
        &mut self,
        backend: &B,
        is_vertex: bool,
        texture_count: u32,
    ) -> Result<vk::DescriptorSetLayout, GraphicsError> {
        if texture_count == 0 {
            return Ok(self.fixed.empty);
        }
        let key = TextureDescriptorSetLayoutKey::new(is_vertex, texture_count);
        if let Some(&layout) = self.texture_set_layouts.get(&key) {
            return Ok(layout);
        }
        let stage_flags = if is_vertex {
            self.vertex_stages
        } else {
            vk::ShaderStageFlags::FRAGMENT
        };
        let layout = backend.create_descriptor_set_layout(&[DescriptorBinding {
            binding: 0,
            descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: texture_count,
            stage_flags,
        }])?;
        self.texture_set_layouts.insert(key, layout);
        Ok(layout)
    }

    pub fn pipeline_layout_count(&self) -> usize {
        self.layouts.len()
    }

    pub fn texture_set_layout_count(&self) -> usize {
        self.texture_set_layouts.len()
    }

    /// Destroy every pipeline layout and texture set layout.
    ///
    /// Only valid while no submission referencing them is in flight.
    pub fn clear<B: GpuBackend>(&mut self, backend: &B) {
        for layout in self.layouts.drain(..) {
            backend.destroy_pipeline_layout(layout.handle);
        }
        self.layout_map.clear();
        for (_, layout) in self.texture_set_layouts.drain() {
            backend.destroy_descriptor_set_layout(layout);
        }
        // 64 bits never wrap, even with a clear every frame, so an old id
        // cannot match a later epoch.
        self.epoch += 1;
    }

    /// Destroy everything including the fixed layouts.
    pub fn destroy<B: GpuBackend>(&mut self, backend: &B) {
        self.clear(backend);
        self.fixed.destroy(backend);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DummyBackend;
    use crate::backend::dummy::ObjectKind;

    fn cache(backend: &DummyBackend) -> LayoutCache {
        LayoutCache::new(backend, vk::ShaderStageFlags::VERTEX).unwrap()
    }

    #[test]
    fn test_same_counts_return_same_layout() {
        let backend = DummyBackend::new();
        let mut cache = cache(&backend);
        let a = cache.get_pipeline_layout(&backend, 2, 1).unwrap();
        let b = cache.get_pipeline_layout(&backend, 2, 1).unwrap();
        assert_eq!(a, b);
        assert_eq!(cache.layout(a), cache.layout(b));
        assert_eq!(backend.created_count(ObjectKind::PipelineLayout), 1);
    }

    #[test]
    fn test_swapped_counts_do_not_alias() {
        let backend = DummyBackend::new();
        let mut cache = cache(&backend);
        let a = cache.get_pipeline_layout(&backend, 2, 1).unwrap();
        let b = cache.get_pipeline_layout(&backend, 1, 2).unwrap();
        assert_ne!(a, b);
        assert_ne!(
            cache.layout(a).unwrap().handle,
            cache.layout(b).unwrap().handle
        );
    }

    #[test]
    fn test_zero_textures_use_empty_layout() {
        let backend = DummyBackend::new();
        let mut cache = cache(&backend);
        let id = cache.get_pipeline_layout(&backend, 0, 0).unwrap();
        let layout = *cache.layout(id).unwrap();
        assert_eq!(layout.textures_vertex, cache.fixed().empty);
        assert_eq!(layout.textures_pixel, cache.fixed().empty);
        assert_eq!(cache.texture_set_layout_count(), 0);
    }

    #[test]
    fn test_set_order_in_pipeline_layout() {
        let backend = DummyBackend::new();
        let mut cache = cache(&backend);
        let id = cache.get_pipeline_layout(&backend, 3, 0).unwrap();
        let layout = *cache.layout(id).unwrap();
        let sets = backend.pipeline_layout_sets(layout.handle).unwrap();
        assert_eq!(sets.len(), DESCRIPTOR_SET_COUNT);
        assert_eq!(
            sets[DescriptorSet::SharedMemoryAndEdram.index()],
            cache.fixed().shared_memory_and_edram
        );
        assert_eq!(sets[DescriptorSet::TexturesVertex.index()], cache.fixed().empty);
        assert_eq!(sets[DescriptorSet::TexturesPixel.index()], layout.textures_pixel);

        let bindings = backend.set_layout_bindings(layout.textures_pixel).unwrap();
        assert_eq!(bindings[0].descriptor_count, 3);
        assert_eq!(bindings[0].stage_flags, vk::ShaderStageFlags::FRAGMENT);
    }

    #[test]
    fn test_clear_invalidates_ids() {
        let backend = DummyBackend::new();
        let mut cache = cache(&backend);
        let id = cache.get_pipeline_layout(&backend, 1, 1).unwrap();
        cache.clear(&backend);
        assert!(cache.layout(id).is_none());
        assert_eq!(backend.live_count(ObjectKind::PipelineLayout), 0);

        let fresh = cache.get_pipeline_layout(&backend, 1, 1).unwrap();
        assert!(cache.layout(fresh).is_some());
    }

    #[test]
    fn test_ids_from_every_earlier_epoch_stay_stale() {
        let backend = DummyBackend::new();
        let mut cache = cache(&backend);
        let mut issued = Vec::new();
        for _ in 0..4 {
            let id = cache.get_pipeline_layout(&backend, 1, 0).unwrap();
            assert!(!issued.contains(&id));
            issued.push(id);
            cache.clear(&backend);
            assert!(issued.iter().all(|&old| cache.layout(old).is_none()));
        }
    }

    #[test]
    fn test_oversized_count_rejected() {
        let backend = DummyBackend::new();
        let mut cache = cache(&backend);
        assert!(matches!(
            cache.get_pipeline_layout(&backend, 0x1_0000, 0),
            Err(GraphicsError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_layout_keys_pack_counts() {
        let key = PipelineLayoutKey::new(5, 9).unwrap();
        assert_eq!(key.texture_count_pixel(), 5);
        assert_eq!(key.texture_count_vertex(), 9);

        let texture_key = TextureDescriptorSetLayoutKey::new(true, 12);
        assert!(texture_key.is_vertex());
        assert_eq!(texture_key.texture_count(), 12);
    }

    #[test]
    fn test_mask_below() {
        assert_eq!(
            DescriptorSetMask::below(DescriptorSet::TexturesVertex.index()),
            DescriptorSetMask::SHARED_MEMORY_AND_EDRAM | DescriptorSetMask::CONSTANTS
        );
        assert_eq!(DescriptorSet::TexturesPixel.mask(), DescriptorSetMask::TEXTURES_PIXEL);
    }
}
