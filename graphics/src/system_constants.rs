//! Per-draw system constants read by translated shaders.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

use crate::interfaces::ViewportInfo;
use crate::registers::{RegisterFile, reg};

bitflags! {
    /// `SystemConstants::flags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SystemConstantFlags: u32 {
        const XY_DIVIDED_BY_W = 1 << 0;
        const Z_DIVIDED_BY_W = 1 << 1;
        const W_NOT_RECIPROCAL = 1 << 2;
        const PRIMITIVE_POLYGONAL = 1 << 3;
    }
}

/// Uniform block of descriptor set 4, std140 layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct SystemConstants {
    pub flags: u32,
    pub vertex_index_endian: u32,
    pub vertex_base_index: i32,
    pub _pad0: u32,
    pub ndc_scale: [f32; 3],
    pub _pad1: u32,
    pub ndc_offset: [f32; 3],
    pub _pad2: u32,
}

const_assert_eq!(std::mem::size_of::<SystemConstants>(), 48);

impl SystemConstants {
    pub fn flags(&self) -> SystemConstantFlags {
        SystemConstantFlags::from_bits_truncate(self.flags)
    }

    /// Recompute from the registers and draw state. Returns whether anything
    /// changed.
    pub fn update(
        &mut self,
        registers: &RegisterFile,
        index_endian: u32,
        viewport_info: &ViewportInfo,
        primitive_polygonal: bool,
    ) -> bool {
        let vte = registers.vte_cntl();
        let mut flags = SystemConstantFlags::empty();
        flags.set(SystemConstantFlags::XY_DIVIDED_BY_W, vte.vtx_xy_fmt());
        flags.set(SystemConstantFlags::Z_DIVIDED_BY_W, vte.vtx_z_fmt());
        flags.set(SystemConstantFlags::W_NOT_RECIPROCAL, vte.vtx_w0_fmt());
        flags.set(SystemConstantFlags::PRIMITIVE_POLYGONAL, primitive_polygonal);

        let updated = Self {
            flags: flags.bits(),
            vertex_index_endian: index_endian,
            vertex_base_index: registers.get(reg::VGT_INDX_OFFSET) as i32,
            ndc_scale: viewport_info.ndc_scale,
            ndc_offset: viewport_info.ndc_offset,
            ..Self::zeroed()
        };

        // Bytewise, so a NaN scale does not count as a change every draw.
        let changed = bytemuck::bytes_of(self) != bytemuck::bytes_of(&updated);
        if changed {
            *self = updated;
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> ViewportInfo {
        ViewportInfo {
            ndc_scale: [1.0, -1.0, 1.0],
            ndc_offset: [0.0, 0.0, 0.0],
            ..Default::default()
        }
    }

    #[test]
    fn test_update_reports_changes_once() {
        let mut regs = RegisterFile::new();
        regs.set(reg::PA_CL_VTE_CNTL, 1 << 8);
        regs.set(reg::VGT_INDX_OFFSET, 16);
        let mut constants = SystemConstants::default();

        assert!(constants.update(&regs, 2, &info(), true));
        assert_eq!(
            constants.flags(),
            SystemConstantFlags::XY_DIVIDED_BY_W | SystemConstantFlags::PRIMITIVE_POLYGONAL
        );
        assert_eq!(constants.vertex_base_index, 16);
        assert_eq!(constants.vertex_index_endian, 2);

        assert!(!constants.update(&regs, 2, &info(), true));
        assert!(constants.update(&regs, 2, &info(), false));
    }

    #[test]
    fn test_nan_scale_is_stable() {
        let regs = RegisterFile::new();
        let mut constants = SystemConstants::default();
        let mut nan_info = info();
        nan_info.ndc_scale[0] = f32::NAN;
        assert!(constants.update(&regs, 0, &nan_info, true));
        assert!(!constants.update(&regs, 0, &nan_info, true));
    }
}
