//! Redundancy filter for dynamic render state.
//!
//! The tracker keeps a snapshot of every dynamic parameter last recorded into
//! the open submission plus a dirty flag per parameter. A `Set*` command is
//! recorded only when the new value differs from the snapshot (bitwise for
//! floats) or the parameter was invalidated, either because a new submission
//! was opened or because a pipeline with the parameter baked in was bound.

use ash::vk;
use bitflags::bitflags;

use crate::config::ProcessorConfig;
use crate::deferred::DeferredCommandBuffer;
use crate::interfaces::ViewportInfo;
use crate::registers::{RbStencilRefMask, RegisterFile, guest_scissor, reg};
use crate::types::{Rect2D, Viewport};

bitflags! {
    /// Dynamic state parameters.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DynamicStateFlags: u32 {
        const VIEWPORT = 1 << 0;
        const SCISSOR = 1 << 1;
        const DEPTH_BIAS = 1 << 2;
        const BLEND_CONSTANTS = 1 << 3;
        const STENCIL_COMPARE_MASK = 1 << 4;
        const STENCIL_WRITE_MASK = 1 << 5;
        const STENCIL_REFERENCE = 1 << 6;
    }
}

impl DynamicStateFlags {
    pub const STENCIL: Self = Self::STENCIL_COMPARE_MASK
        .union(Self::STENCIL_WRITE_MASK)
        .union(Self::STENCIL_REFERENCE);
}

/// Depth bias in host depth units. The clamp is always 0.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DepthBias {
    pub constant_factor: f32,
    pub slope_factor: f32,
}

/// Stencil parameters of one face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StencilFaceState {
    pub compare_mask: u32,
    pub write_mask: u32,
    pub reference: u32,
}

impl Default for StencilFaceState {
    fn default() -> Self {
        Self {
            compare_mask: 0xFF,
            write_mask: 0xFF,
            reference: 0,
        }
    }
}

impl From<RbStencilRefMask> for StencilFaceState {
    fn from(value: RbStencilRefMask) -> Self {
        Self {
            compare_mask: value.stencil_mask(),
            write_mask: value.stencil_write_mask(),
            reference: value.stencil_ref(),
        }
    }
}

/// Values wanted for the next draw.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DynamicStateInput {
    pub viewport: Viewport,
    pub scissor: Rect2D,
    pub depth_bias: DepthBias,
    pub blend_constants: [f32; 4],
    /// Front and back stencil state, `None` when stencil is disabled.
    pub stencil: Option<[StencilFaceState; 2]>,
}

impl DynamicStateInput {
    /// Derive the dynamic state of a draw from the guest registers.
    pub fn from_registers(
        registers: &RegisterFile,
        viewport_info: &ViewportInfo,
        primitive_polygonal: bool,
        config: &ProcessorConfig,
    ) -> Self {
        Self {
            viewport: host_viewport(viewport_info),
            scissor: host_scissor(registers, config),
            depth_bias: depth_bias(registers, primitive_polygonal, config),
            blend_constants: [
                registers.get_f32(reg::RB_BLEND_RED),
                registers.get_f32(reg::RB_BLEND_GREEN),
                registers.get_f32(reg::RB_BLEND_BLUE),
                registers.get_f32(reg::RB_BLEND_ALPHA),
            ],
            stencil: stencil(registers, primitive_polygonal, config),
        }
    }
}

/// Viewport from the host viewport info. An empty viewport becomes a 1x1
/// viewport outside the render target so nothing is drawn.
fn host_viewport(info: &ViewportInfo) -> Viewport {
    if info.xy_extent[0] == 0 || info.xy_extent[1] == 0 {
        return Viewport {
            x: -1.0,
            y: -1.0,
            width: 1.0,
            height: 1.0,
            min_depth: info.z_min,
            max_depth: info.z_max,
        };
    }
    Viewport {
        x: info.xy_offset[0] as f32,
        y: info.xy_offset[1] as f32,
        width: info.xy_extent[0] as f32,
        height: info.xy_extent[1] as f32,
        min_depth: info.z_min,
        max_depth: info.z_max,
    }
}

fn host_scissor(registers: &RegisterFile, config: &ProcessorConfig) -> Rect2D {
    let scissor = guest_scissor(registers);
    Rect2D::new(
        (scissor.x * config.resolution_scale_x) as i32,
        (scissor.y * config.resolution_scale_y) as i32,
        scissor.width * config.resolution_scale_x,
        scissor.height * config.resolution_scale_y,
    )
}

fn depth_bias(
    registers: &RegisterFile,
    primitive_polygonal: bool,
    config: &ProcessorConfig,
) -> DepthBias {
    let mode = registers.sc_mode_cntl();
    let front = || {
        (
            registers.get_f32(reg::PA_SU_POLY_OFFSET_FRONT_SCALE),
            registers.get_f32(reg::PA_SU_POLY_OFFSET_FRONT_OFFSET),
        )
    };

    let mut scale = 0.0;
    let mut offset = 0.0;
    if primitive_polygonal {
        // Front faces are preferred, they are the ones usually drawn.
        if mode.poly_offset_front_enable() && !mode.cull_front() {
            (scale, offset) = front();
        }
        if mode.poly_offset_back_enable() && !mode.cull_back() && scale == 0.0 && offset == 0.0 {
            scale = registers.get_f32(reg::PA_SU_POLY_OFFSET_BACK_SCALE);
            offset = registers.get_f32(reg::PA_SU_POLY_OFFSET_BACK_OFFSET);
        }
    } else if mode.poly_offset_para_enable() {
        (scale, offset) = front();
    }

    let max_scale = config.resolution_scale_x.max(config.resolution_scale_y) as f32;
    DepthBias {
        constant_factor: offset * registers.depth_info().depth_format().polygon_offset_factor(),
        // Slope is in 1/16 subpixel units.
        slope_factor: scale * (1.0 / 16.0) * max_scale,
    }
}

fn stencil(
    registers: &RegisterFile,
    primitive_polygonal: bool,
    config: &ProcessorConfig,
) -> Option<[StencilFaceState; 2]> {
    let depth_control = registers.depth_control();
    if !depth_control.stencil_enable() {
        return None;
    }
    let front = registers.stencil_ref_mask(reg::RB_STENCILREFMASK);
    if primitive_polygonal && depth_control.backface_enable() {
        let back = registers.stencil_ref_mask(reg::RB_STENCILREFMASK_BF);
        if config.separate_stencil_mask_ref {
            return Some([front.into(), back.into()]);
        }
        // Only one set for both faces; use the one of the face that is drawn.
        let shared = if registers.sc_mode_cntl().cull_front() {
            back
        } else {
            front
        };
        return Some([shared.into(), shared.into()]);
    }
    Some([front.into(), front.into()])
}

fn f32_bits_eq(a: &[f32], b: &[f32]) -> bool {
    a.iter().zip(b).all(|(a, b)| a.to_bits() == b.to_bits())
}

/// Dynamic state snapshot of the open submission.
#[derive(Debug, Clone)]
pub struct DynamicStateTracker {
    viewport: Viewport,
    scissor: Rect2D,
    depth_bias: DepthBias,
    blend_constants: [f32; 4],
    stencil: [StencilFaceState; 2],
    dirty: DynamicStateFlags,
    /// Stencil dirty bits per face; only the stencil flags are used.
    stencil_dirty: [DynamicStateFlags; 2],
}

impl Default for DynamicStateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl DynamicStateTracker {
    pub fn new() -> Self {
        Self {
            viewport: Viewport::default(),
            scissor: Rect2D::default(),
            depth_bias: DepthBias::default(),
            blend_constants: [0.0; 4],
            stencil: [StencilFaceState::default(); 2],
            dirty: DynamicStateFlags::all().difference(DynamicStateFlags::STENCIL),
            stencil_dirty: [DynamicStateFlags::STENCIL; 2],
        }
    }

    pub fn dirty(&self) -> DynamicStateFlags {
        self.dirty | self.stencil_dirty[0] | self.stencil_dirty[1]
    }

    /// Nothing recorded in a new command buffer can be relied upon.
    pub fn mark_all_dirty(&mut self) {
        self.invalidate(DynamicStateFlags::all());
    }

    pub fn invalidate(&mut self, flags: DynamicStateFlags) {
        self.dirty |= flags.difference(DynamicStateFlags::STENCIL);
        for face in &mut self.stencil_dirty {
            *face |= flags & DynamicStateFlags::STENCIL;
        }
    }

    /// A pipeline taking `dynamic` from dynamic state was bound; everything
    /// else was overwritten by its static state.
    pub fn pipeline_bound(&mut self, dynamic: DynamicStateFlags) {
        self.invalidate(DynamicStateFlags::all().difference(dynamic));
    }

    /// Record `viewport` unless it is already current. Returns whether it was
    /// recorded.
    pub fn set_viewport(
        &mut self,
        viewport: Viewport,
        command_buffer: &mut DeferredCommandBuffer,
    ) -> bool {
        if !self.dirty.contains(DynamicStateFlags::VIEWPORT) && self.viewport.bits_eq(&viewport) {
            return false;
        }
        self.viewport = viewport;
        self.dirty.remove(DynamicStateFlags::VIEWPORT);
        command_buffer.cmd_set_viewport(viewport);
        true
    }

    pub fn set_scissor(
        &mut self,
        scissor: Rect2D,
        command_buffer: &mut DeferredCommandBuffer,
    ) -> bool {
        if !self.dirty.contains(DynamicStateFlags::SCISSOR) && self.scissor == scissor {
            return false;
        }
        self.scissor = scissor;
        self.dirty.remove(DynamicStateFlags::SCISSOR);
        command_buffer.cmd_set_scissor(scissor);
        true
    }

    /// Record every changed or dirty parameter. Returns the parameters that
    /// were recorded.
    pub fn update(
        &mut self,
        input: &DynamicStateInput,
        command_buffer: &mut DeferredCommandBuffer,
    ) -> DynamicStateFlags {
        let mut emitted = DynamicStateFlags::empty();

        if self.set_viewport(input.viewport, command_buffer) {
            emitted |= DynamicStateFlags::VIEWPORT;
        }
        if self.set_scissor(input.scissor, command_buffer) {
            emitted |= DynamicStateFlags::SCISSOR;
        }

        let depth_bias = input.depth_bias;
        if self.dirty.contains(DynamicStateFlags::DEPTH_BIAS)
            || !f32_bits_eq(
                &[depth_bias.constant_factor, depth_bias.slope_factor],
                &[self.depth_bias.constant_factor, self.depth_bias.slope_factor],
            )
        {
            self.depth_bias = depth_bias;
            self.dirty.remove(DynamicStateFlags::DEPTH_BIAS);
            command_buffer.cmd_set_depth_bias(depth_bias.constant_factor, 0.0, depth_bias.slope_factor);
            emitted |= DynamicStateFlags::DEPTH_BIAS;
        }

        if self.dirty.contains(DynamicStateFlags::BLEND_CONSTANTS)
            || !f32_bits_eq(&input.blend_constants, &self.blend_constants)
        {
            self.blend_constants = input.blend_constants;
            self.dirty.remove(DynamicStateFlags::BLEND_CONSTANTS);
            command_buffer.cmd_set_blend_constants(input.blend_constants);
            emitted |= DynamicStateFlags::BLEND_CONSTANTS;
        }

        // Stencil state is irrelevant with stencil disabled; leave it dirty.
        if let Some(stencil) = input.stencil {
            emitted |= self.update_stencil(&stencil, command_buffer);
        }
        emitted
    }

    fn update_stencil(
        &mut self,
        faces: &[StencilFaceState; 2],
        command_buffer: &mut DeferredCommandBuffer,
    ) -> DynamicStateFlags {
        let mut emitted = DynamicStateFlags::empty();
        let parameters: [(DynamicStateFlags, fn(&StencilFaceState) -> u32); 3] = [
            (DynamicStateFlags::STENCIL_COMPARE_MASK, |face| face.compare_mask),
            (DynamicStateFlags::STENCIL_WRITE_MASK, |face| face.write_mask),
            (DynamicStateFlags::STENCIL_REFERENCE, |face| face.reference),
        ];

        for (flag, get) in parameters {
            let mut update = [false; 2];
            for face in 0..2 {
                update[face] = self.stencil_dirty[face].contains(flag)
                    || get(&faces[face]) != get(&self.stencil[face]);
            }
            if !update[0] && !update[1] {
                continue;
            }

            let front = get(&faces[0]);
            let back = get(&faces[1]);
            if front == back {
                record_stencil(command_buffer, flag, vk::StencilFaceFlags::FRONT_AND_BACK, front);
            } else {
                if update[0] {
                    record_stencil(command_buffer, flag, vk::StencilFaceFlags::FRONT, front);
                }
                if update[1] {
                    record_stencil(command_buffer, flag, vk::StencilFaceFlags::BACK, back);
                }
            }
            for face in 0..2 {
                self.stencil_dirty[face].remove(flag);
            }
            emitted |= flag;
        }

        self.stencil = *faces;
        emitted
    }
}

fn record_stencil(
    command_buffer: &mut DeferredCommandBuffer,
    flag: DynamicStateFlags,
    face_mask: vk::StencilFaceFlags,
    value: u32,
) {
    if flag == DynamicStateFlags::STENCIL_COMPARE_MASK {
        command_buffer.cmd_set_stencil_compare_mask(face_mask, value);
    } else if flag == DynamicStateFlags::STENCIL_WRITE_MASK {
        command_buffer.cmd_set_stencil_write_mask(face_mask, value);
    } else {
        command_buffer.cmd_set_stencil_reference(face_mask, value);
    }
}
