//! Per-draw descriptor set resolution.
//!
//! Two bitsets over the guest descriptor sets drive the decisions:
//!
//! - *values up to date*: the set last written for this set index still
//!   holds the right contents, so it can be reused;
//! - *bound up to date*: that set is bound in the open submission at the
//!   right index with a compatible pipeline layout.
//!
//! A draw rewrites the sets whose values are stale and binds the sets that
//! are not bound, grouping consecutive indices into one bind command.

use ash::vk;
use xegpu_core::profiling::profile_scope;

use crate::backend::GpuBackend;
use crate::deferred::DeferredCommandBuffer;
use crate::error::GraphicsError;
use crate::interfaces::{ShaderStage, TextureBinding, TextureSource, TranslatedShader};
use crate::layout_cache::{
    DESCRIPTOR_SET_COUNT, DescriptorSet, DescriptorSetMask, FixedSetLayouts, PipelineLayout,
};
use crate::registers::{
    BOOL_LOOP_CONSTANT_DWORDS, FETCH_CONSTANT_DWORDS, FLOAT_CONSTANTS_PER_STAGE, RegisterFile, reg,
};
use crate::system_constants::SystemConstants;
use crate::transient::TransientAllocators;
use crate::types::{DescriptorResources, DescriptorWrite};

/// Size of the fetch + bool/loop constant block: bool and loop constants
/// first, then the fetch constants.
pub const FETCH_BOOL_LOOP_CONSTANTS_SIZE: u64 =
    ((BOOL_LOOP_CONSTANT_DWORDS + FETCH_CONSTANT_DWORDS) * 4) as u64;

/// Bytes per float constant.
const FLOAT_CONSTANT_SIZE: u64 = 16;

/// Everything [`BindingResolver::update_bindings`] reads or allocates from.
pub struct BindingUpdate<'a, B: GpuBackend> {
    pub backend: &'a B,
    /// Frame the transient allocations are tagged with.
    pub frame: u64,
    pub transient: &'a mut TransientAllocators<B::UploadMemory>,
    pub fixed_layouts: &'a FixedSetLayouts,
    pub pipeline_layout: &'a PipelineLayout,
    pub registers: &'a RegisterFile,
    pub system_constants: &'a SystemConstants,
    pub vertex_shader: &'a TranslatedShader,
    pub pixel_shader: Option<&'a TranslatedShader>,
    pub textures: &'a mut dyn TextureSource,
    pub command_buffer: &'a mut DeferredCommandBuffer,
}

/// Descriptor set validity for the open submission.
#[derive(Debug, Clone)]
pub struct BindingResolver {
    values_up_to_date: DescriptorSetMask,
    bound_up_to_date: DescriptorSetMask,
    current_sets: [vk::DescriptorSet; DESCRIPTOR_SET_COUNT],
    float_constant_map_vertex: [u64; 4],
    float_constant_map_pixel: [u64; 4],
    texture_bindings_vertex: Vec<TextureBinding>,
    texture_bindings_pixel: Vec<TextureBinding>,
}

impl Default for BindingResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl BindingResolver {
    pub fn new() -> Self {
        Self {
            values_up_to_date: DescriptorSetMask::empty(),
            bound_up_to_date: DescriptorSetMask::empty(),
            current_sets: [vk::DescriptorSet::null(); DESCRIPTOR_SET_COUNT],
            float_constant_map_vertex: [0; 4],
            float_constant_map_pixel: [0; 4],
            texture_bindings_vertex: Vec::new(),
            texture_bindings_pixel: Vec::new(),
        }
    }

    pub fn values_up_to_date(&self) -> DescriptorSetMask {
        self.values_up_to_date
    }

    pub fn bound_up_to_date(&self) -> DescriptorSetMask {
        self.bound_up_to_date
    }

    pub fn current_set(&self, set: DescriptorSet) -> vk::DescriptorSet {
        self.current_sets[set.index()]
    }

    /// Install the persistent shared memory and EDRAM set, which never goes
    /// stale.
    pub fn set_shared_memory_and_edram(&mut self, set: vk::DescriptorSet) {
        self.current_sets[DescriptorSet::SharedMemoryAndEdram.index()] = set;
        self.values_up_to_date |= DescriptorSetMask::SHARED_MEMORY_AND_EDRAM;
        self.bound_up_to_date
            .remove(DescriptorSetMask::SHARED_MEMORY_AND_EDRAM);
    }

    /// Nothing is bound in a new command buffer.
    pub fn submission_opened(&mut self) {
        self.bound_up_to_date = DescriptorSetMask::empty();
    }

    /// Stop reusing sets allocated from the transient pools, whose pages may
    /// be released from now on. Only the shared memory and EDRAM set stays.
    pub fn invalidate_transient_sets(&mut self) {
        self.float_constant_map_vertex = [0; 4];
        self.float_constant_map_pixel = [0; 4];
        self.values_up_to_date &= DescriptorSetMask::SHARED_MEMORY_AND_EDRAM;
    }

    pub fn system_constants_changed(&mut self) {
        self.values_up_to_date
            .remove(DescriptorSetMask::SYSTEM_CONSTANTS);
    }

    /// Invalidate the sets whose contents depend on register `index`.
    pub fn register_written(&mut self, index: u32) {
        if (reg::SHADER_CONSTANT_000_X..reg::SHADER_CONSTANT_END).contains(&index) {
            let constant = (index - reg::SHADER_CONSTANT_000_X) >> 2;
            let (map, set, constant) = if constant < FLOAT_CONSTANTS_PER_STAGE {
                (
                    &self.float_constant_map_vertex,
                    DescriptorSetMask::FLOAT_CONSTANTS_VERTEX,
                    constant,
                )
            } else {
                (
                    &self.float_constant_map_pixel,
                    DescriptorSetMask::FLOAT_CONSTANTS_PIXEL,
                    constant - FLOAT_CONSTANTS_PER_STAGE,
                )
            };
            if map[(constant >> 6) as usize] & (1 << (constant & 63)) != 0 {
                self.values_up_to_date.remove(set);
            }
        } else if (reg::SHADER_CONSTANT_FETCH_00_0..reg::SHADER_CONSTANT_FETCH_END).contains(&index)
        {
            self.values_up_to_date.remove(
                DescriptorSetMask::FETCH_BOOL_LOOP_CONSTANTS
                    | DescriptorSetMask::TEXTURES_VERTEX
                    | DescriptorSetMask::TEXTURES_PIXEL,
            );
        } else if (reg::SHADER_CONSTANT_BOOL_000_031..reg::SHADER_CONSTANT_LOOP_END).contains(&index)
        {
            self.values_up_to_date
                .remove(DescriptorSetMask::FETCH_BOOL_LOOP_CONSTANTS);
        }
    }

    /// The guest pipeline layout changed from `previous` to `layout`.
    ///
    /// Sets stay bound only up to the first set whose layout differs.
    pub fn pipeline_layout_changed(
        &mut self,
        previous: Option<&PipelineLayout>,
        layout: &PipelineLayout,
    ) {
        let Some(previous) = previous else {
            self.bound_up_to_date = DescriptorSetMask::empty();
            return;
        };
        let compatible = if previous.textures_vertex != layout.textures_vertex {
            DescriptorSet::TexturesVertex.index()
        } else if previous.textures_pixel != layout.textures_pixel {
            DescriptorSet::TexturesPixel.index()
        } else {
            DESCRIPTOR_SET_COUNT
        };
        self.bound_up_to_date &= DescriptorSetMask::below(compatible);
    }

    /// Write stale sets and bind unbound ones for a draw with the given
    /// shaders.
    ///
    /// Returns [`GraphicsError::PoolExhausted`] if a transient pool ran out;
    /// value validity is left unchanged in that case.
    pub fn update_bindings<B: GpuBackend>(
        &mut self,
        update: BindingUpdate<'_, B>,
    ) -> Result<(), GraphicsError> {
        profile_scope!("update_bindings");
        let BindingUpdate {
            backend,
            frame,
            transient,
            fixed_layouts,
            pipeline_layout,
            registers,
            system_constants,
            vertex_shader,
            pixel_shader,
            textures,
            command_buffer,
        } = update;

        let float_map_pixel = pixel_shader.map_or([0; 4], |shader| shader.float_constant_map);
        let float_count_vertex = vertex_shader.float_constant_count();
        let float_count_pixel = pixel_shader.map_or(0, |shader| shader.float_constant_count());
        if self.float_constant_map_vertex != vertex_shader.float_constant_map {
            self.float_constant_map_vertex = vertex_shader.float_constant_map;
            // With no constants used, any buffer will do.
            if float_count_vertex != 0 {
                self.values_up_to_date
                    .remove(DescriptorSetMask::FLOAT_CONSTANTS_VERTEX);
            }
        }
        if self.float_constant_map_pixel != float_map_pixel {
            self.float_constant_map_pixel = float_map_pixel;
            if float_count_pixel != 0 {
                self.values_up_to_date
                    .remove(DescriptorSetMask::FLOAT_CONSTANTS_PIXEL);
            }
        }

        let textures_pixel: &[TextureBinding] =
            pixel_shader.map_or(&[], |shader| &shader.texture_bindings);
        if self.texture_bindings_vertex != vertex_shader.texture_bindings {
            self.texture_bindings_vertex = vertex_shader.texture_bindings.clone();
            self.values_up_to_date
                .remove(DescriptorSetMask::TEXTURES_VERTEX);
        }
        if self.texture_bindings_pixel != textures_pixel {
            self.texture_bindings_pixel = textures_pixel.to_vec();
            self.values_up_to_date
                .remove(DescriptorSetMask::TEXTURES_PIXEL);
        }

        let mut needed = DescriptorSetMask::SHARED_MEMORY_AND_EDRAM | DescriptorSetMask::CONSTANTS;
        if !self.texture_bindings_vertex.is_empty() {
            needed |= DescriptorSetMask::TEXTURES_VERTEX;
        }
        if !self.texture_bindings_pixel.is_empty() {
            needed |= DescriptorSetMask::TEXTURES_PIXEL;
        }

        let to_write = needed - self.values_up_to_date;
        let mut new_sets = [vk::DescriptorSet::null(); DESCRIPTOR_SET_COUNT];
        let mut writes = Vec::with_capacity(to_write.bits().count_ones() as usize);

        for set in DescriptorSet::ALL {
            if !to_write.contains(set.mask()) {
                continue;
            }
            let write = match set {
                DescriptorSet::SharedMemoryAndEdram => continue,
                DescriptorSet::FetchBoolLoopConstants => {
                    let (bytes, write) = transient
                        .write_uniform_buffer_binding(
                            backend,
                            frame,
                            FETCH_BOOL_LOOP_CONSTANTS_SIZE,
                            fixed_layouts.fetch_bool_loop_constants,
                        )?
                        .ok_or(GraphicsError::PoolExhausted)?;
                    write_fetch_bool_loop_constants(bytes, registers);
                    write
                }
                DescriptorSet::FloatConstantsVertex | DescriptorSet::FloatConstantsPixel => {
                    let (map, count, layout, first_register) =
                        if set == DescriptorSet::FloatConstantsVertex {
                            (
                                &self.float_constant_map_vertex,
                                float_count_vertex,
                                fixed_layouts.float_constants_vertex,
                                reg::SHADER_CONSTANT_000_X,
                            )
                        } else {
                            (
                                &self.float_constant_map_pixel,
                                float_count_pixel,
                                fixed_layouts.float_constants_pixel,
                                reg::SHADER_CONSTANT_256_X,
                            )
                        };
                    // Zero-sized bindings are not allowed.
                    let size = u64::from(count.max(1)) * FLOAT_CONSTANT_SIZE;
                    let (bytes, write) = transient
                        .write_uniform_buffer_binding(backend, frame, size, layout)?
                        .ok_or(GraphicsError::PoolExhausted)?;
                    write_float_constants(bytes, registers, map, first_register);
                    write
                }
                DescriptorSet::SystemConstants => {
                    let block = bytemuck::bytes_of(system_constants);
                    let (bytes, write) = transient
                        .write_uniform_buffer_binding(
                            backend,
                            frame,
                            block.len() as u64,
                            fixed_layouts.system_constants,
                        )?
                        .ok_or(GraphicsError::PoolExhausted)?;
                    bytes.copy_from_slice(block);
                    write
                }
                DescriptorSet::TexturesVertex | DescriptorSet::TexturesPixel => {
                    let (stage, bindings, layout) = if set == DescriptorSet::TexturesVertex {
                        (
                            ShaderStage::Vertex,
                            &self.texture_bindings_vertex,
                            pipeline_layout.textures_vertex,
                        )
                    } else {
                        (
                            ShaderStage::Pixel,
                            &self.texture_bindings_pixel,
                            pipeline_layout.textures_pixel,
                        )
                    };
                    let descriptor_set = transient
                        .texture_descriptors
                        .allocate(backend, frame, layout, bindings.len() as u32)?
                        .ok_or(GraphicsError::PoolExhausted)?;
                    let images = bindings
                        .iter()
                        .map(|binding| textures.image_binding(registers, stage, binding))
                        .collect();
                    DescriptorWrite {
                        set: descriptor_set,
                        binding: 0,
                        resources: DescriptorResources::CombinedImageSamplers(images),
                    }
                }
            };
            new_sets[set.index()] = write.set;
            writes.push(write);
        }

        if !writes.is_empty() {
            backend.update_descriptor_sets(&writes);
            for set in DescriptorSet::ALL {
                if to_write.contains(set.mask()) && set != DescriptorSet::SharedMemoryAndEdram {
                    self.current_sets[set.index()] = new_sets[set.index()];
                }
            }
            let written = to_write - DescriptorSetMask::SHARED_MEMORY_AND_EDRAM;
            self.values_up_to_date |= written;
            self.bound_up_to_date -= written;
            log::trace!("Wrote descriptor sets {:?}", written);
        }

        self.bind_sets(needed - self.bound_up_to_date, pipeline_layout, command_buffer);
        Ok(())
    }

    /// Bind `sets` in runs of consecutive indices.
    fn bind_sets(
        &mut self,
        sets: DescriptorSetMask,
        pipeline_layout: &PipelineLayout,
        command_buffer: &mut DeferredCommandBuffer,
    ) {
        let mut index = 0;
        while index < DESCRIPTOR_SET_COUNT {
            if !sets.contains(DescriptorSet::ALL[index].mask()) {
                index += 1;
                continue;
            }
            let first = index;
            while index < DESCRIPTOR_SET_COUNT && sets.contains(DescriptorSet::ALL[index].mask()) {
                index += 1;
            }
            command_buffer.cmd_bind_descriptor_sets(
                pipeline_layout.handle,
                first as u32,
                &self.current_sets[first..index],
            );
        }
        self.bound_up_to_date |= sets;
    }
}

fn write_fetch_bool_loop_constants(bytes: &mut [u8], registers: &RegisterFile) {
    let bool_loop = registers.range(reg::SHADER_CONSTANT_BOOL_000_031, BOOL_LOOP_CONSTANT_DWORDS);
    let fetch = registers.range(reg::SHADER_CONSTANT_FETCH_00_0, FETCH_CONSTANT_DWORDS);
    let bool_loop_bytes: &[u8] = bytemuck::cast_slice(bool_loop);
    let fetch_bytes: &[u8] = bytemuck::cast_slice(fetch);
    let (head, tail) = bytes.split_at_mut(bytes.len().min(bool_loop_bytes.len()));
    head.copy_from_slice(&bool_loop_bytes[..head.len()]);
    let len = tail.len().min(fetch_bytes.len());
    tail[..len].copy_from_slice(&fetch_bytes[..len]);
}

/// Pack the float constants set in `map`, in bit order.
fn write_float_constants(
    bytes: &mut [u8],
    registers: &RegisterFile,
    map: &[u64; 4],
    first_register: u32,
) {
    let mut chunks = bytes.chunks_exact_mut(FLOAT_CONSTANT_SIZE as usize);
    for (word_index, &word) in map.iter().enumerate() {
        let mut bits = word;
        while bits != 0 {
            let constant = word_index as u32 * 64 + bits.trailing_zeros();
            bits &= bits - 1;
            let Some(chunk) = chunks.next() else {
                return;
            };
            let values = registers.range(first_register + constant * 4, 4);
            chunk.copy_from_slice(bytemuck::cast_slice(values));
        }
    }
}
