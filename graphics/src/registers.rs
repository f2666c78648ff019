//! Guest GPU register file and decoding of the render-state registers.

/// Number of 32-bit registers in the guest register file.
pub const REGISTER_COUNT: usize = 0x5003;

/// Register indices.
pub mod reg {
    pub const RB_DEPTH_INFO: u32 = 0x2002;
    pub const PA_SC_SCREEN_SCISSOR_TL: u32 = 0x200E;
    pub const PA_SC_SCREEN_SCISSOR_BR: u32 = 0x200F;
    pub const PA_SC_WINDOW_OFFSET: u32 = 0x2080;
    pub const PA_SC_WINDOW_SCISSOR_TL: u32 = 0x2081;
    pub const PA_SC_WINDOW_SCISSOR_BR: u32 = 0x2082;
    pub const VGT_INDX_OFFSET: u32 = 0x2102;
    pub const RB_BLEND_RED: u32 = 0x2105;
    pub const RB_BLEND_GREEN: u32 = 0x2106;
    pub const RB_BLEND_BLUE: u32 = 0x2107;
    pub const RB_BLEND_ALPHA: u32 = 0x2108;
    pub const RB_STENCILREFMASK_BF: u32 = 0x210C;
    pub const RB_STENCILREFMASK: u32 = 0x210D;
    pub const RB_DEPTHCONTROL: u32 = 0x2200;
    pub const PA_SU_SC_MODE_CNTL: u32 = 0x2205;
    pub const PA_CL_VTE_CNTL: u32 = 0x2206;
    pub const PA_SU_POLY_OFFSET_FRONT_SCALE: u32 = 0x2380;
    pub const PA_SU_POLY_OFFSET_FRONT_OFFSET: u32 = 0x2381;
    pub const PA_SU_POLY_OFFSET_BACK_SCALE: u32 = 0x2382;
    pub const PA_SU_POLY_OFFSET_BACK_OFFSET: u32 = 0x2383;

    /// First vertex shader float constant (4 registers per constant).
    pub const SHADER_CONSTANT_000_X: u32 = 0x4000;
    /// First pixel shader float constant.
    pub const SHADER_CONSTANT_256_X: u32 = 0x4400;
    /// End of the float constants.
    pub const SHADER_CONSTANT_END: u32 = 0x4800;
    /// First fetch constant dword.
    pub const SHADER_CONSTANT_FETCH_00_0: u32 = 0x4800;
    /// End of the fetch constants.
    pub const SHADER_CONSTANT_FETCH_END: u32 = 0x48C0;
    /// First boolean constant dword.
    pub const SHADER_CONSTANT_BOOL_000_031: u32 = 0x4900;
    /// First loop constant.
    pub const SHADER_CONSTANT_LOOP_00: u32 = 0x4908;
    /// End of the loop constants.
    pub const SHADER_CONSTANT_LOOP_END: u32 = 0x4928;
}

/// Float constants per shader stage.
pub const FLOAT_CONSTANTS_PER_STAGE: u32 = 256;
/// Fetch constant dwords (32 fetch constants of 6 dwords).
pub const FETCH_CONSTANT_DWORDS: u32 = reg::SHADER_CONSTANT_FETCH_END - reg::SHADER_CONSTANT_FETCH_00_0;
/// Boolean (8 dwords) plus loop (32 dwords) constant dwords.
pub const BOOL_LOOP_CONSTANT_DWORDS: u32 = reg::SHADER_CONSTANT_LOOP_END - reg::SHADER_CONSTANT_BOOL_000_031;

/// Flat storage of every guest register.
#[derive(Clone)]
pub struct RegisterFile {
    values: Box<[u32]>,
}

impl std::fmt::Debug for RegisterFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisterFile")
            .field("len", &self.values.len())
            .finish_non_exhaustive()
    }
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterFile {
    pub fn new() -> Self {
        Self {
            values: vec![0; REGISTER_COUNT].into_boxed_slice(),
        }
    }

    /// Value of register `index`, or 0 outside the register file.
    pub fn get(&self, index: u32) -> u32 {
        self.values.get(index as usize).copied().unwrap_or(0)
    }

    pub fn get_f32(&self, index: u32) -> f32 {
        f32::from_bits(self.get(index))
    }

    /// Store `value`. Returns `false` if `index` is outside the register file.
    pub fn set(&mut self, index: u32, value: u32) -> bool {
        match self.values.get_mut(index as usize) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn set_f32(&mut self, index: u32, value: f32) -> bool {
        self.set(index, value.to_bits())
    }

    /// Contiguous registers `[start, start + count)`.
    pub fn range(&self, start: u32, count: u32) -> &[u32] {
        let start = (start as usize).min(self.values.len());
        let end = start.saturating_add(count as usize).min(self.values.len());
        &self.values[start..end]
    }

    pub fn sc_mode_cntl(&self) -> PaSuScModeCntl {
        PaSuScModeCntl(self.get(reg::PA_SU_SC_MODE_CNTL))
    }

    pub fn depth_control(&self) -> RbDepthControl {
        RbDepthControl(self.get(reg::RB_DEPTHCONTROL))
    }

    pub fn stencil_ref_mask(&self, index: u32) -> RbStencilRefMask {
        RbStencilRefMask(self.get(index))
    }

    pub fn depth_info(&self) -> RbDepthInfo {
        RbDepthInfo(self.get(reg::RB_DEPTH_INFO))
    }

    pub fn vte_cntl(&self) -> PaClVteCntl {
        PaClVteCntl(self.get(reg::PA_CL_VTE_CNTL))
    }
}

fn bit(value: u32, index: u32) -> bool {
    (value >> index) & 1 != 0
}

/// Sign-extend the low `bits` bits of `value`.
fn sign_extend(value: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

/// `PA_SU_SC_MODE_CNTL`: culling and polygon offset enables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaSuScModeCntl(pub u32);

impl PaSuScModeCntl {
    pub fn cull_front(self) -> bool {
        bit(self.0, 0)
    }

    pub fn cull_back(self) -> bool {
        bit(self.0, 1)
    }

    pub fn poly_offset_front_enable(self) -> bool {
        bit(self.0, 11)
    }

    pub fn poly_offset_back_enable(self) -> bool {
        bit(self.0, 12)
    }

    pub fn poly_offset_para_enable(self) -> bool {
        bit(self.0, 13)
    }
}

/// `RB_DEPTHCONTROL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RbDepthControl(pub u32);

impl RbDepthControl {
    pub fn stencil_enable(self) -> bool {
        bit(self.0, 0)
    }

    pub fn z_enable(self) -> bool {
        bit(self.0, 1)
    }

    pub fn backface_enable(self) -> bool {
        bit(self.0, 7)
    }
}

/// `RB_STENCILREFMASK` and `RB_STENCILREFMASK_BF`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RbStencilRefMask(pub u32);

impl RbStencilRefMask {
    pub fn stencil_ref(self) -> u32 {
        self.0 & 0xFF
    }

    pub fn stencil_mask(self) -> u32 {
        (self.0 >> 8) & 0xFF
    }

    pub fn stencil_write_mask(self) -> u32 {
        (self.0 >> 16) & 0xFF
    }
}

/// Depth buffer formats selectable in `RB_DEPTH_INFO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthFormat {
    /// 24-bit unsigned normalized depth.
    D24S8,
    /// 20e4 floating-point depth.
    D24FS8,
}

/// `RB_DEPTH_INFO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RbDepthInfo(pub u32);

impl RbDepthInfo {
    pub fn depth_format(self) -> DepthFormat {
        if bit(self.0, 16) {
            DepthFormat::D24FS8
        } else {
            DepthFormat::D24S8
        }
    }
}

impl DepthFormat {
    /// Factor converting a Direct3D 10 style polygon offset constant into
    /// units of the host depth format.
    pub fn polygon_offset_factor(self) -> f32 {
        match self {
            Self::D24S8 => (1u32 << 24) as f32,
            // Float24 depth is stored as 0...0.5 on the host.
            Self::D24FS8 => (1u32 << 19) as f32,
        }
    }
}

/// `PA_CL_VTE_CNTL`: vertex transform format bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaClVteCntl(pub u32);

impl PaClVteCntl {
    pub fn vtx_xy_fmt(self) -> bool {
        bit(self.0, 8)
    }

    pub fn vtx_z_fmt(self) -> bool {
        bit(self.0, 9)
    }

    pub fn vtx_w0_fmt(self) -> bool {
        bit(self.0, 10)
    }
}

/// Guest scissor rectangle after window offset and screen scissor clipping,
/// in guest pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GuestScissor {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Compute the effective guest scissor from the window scissor, window
/// offset and screen scissor registers.
pub fn guest_scissor(regs: &RegisterFile) -> GuestScissor {
    let window_tl = regs.get(reg::PA_SC_WINDOW_SCISSOR_TL);
    let window_br = regs.get(reg::PA_SC_WINDOW_SCISSOR_BR);
    let mut tl_x = (window_tl & 0x3FFF) as i32;
    let mut tl_y = ((window_tl >> 16) & 0x3FFF) as i32;
    let mut br_x = (window_br & 0x3FFF) as i32;
    let mut br_y = ((window_br >> 16) & 0x3FFF) as i32;

    let window_offset_disable = bit(window_tl, 31);
    if !window_offset_disable {
        let offset = regs.get(reg::PA_SC_WINDOW_OFFSET);
        let offset_x = sign_extend(offset & 0x7FFF, 15);
        let offset_y = sign_extend((offset >> 16) & 0x7FFF, 15);
        tl_x += offset_x;
        tl_y += offset_y;
        br_x += offset_x;
        br_y += offset_y;
    }

    let screen_tl = regs.get(reg::PA_SC_SCREEN_SCISSOR_TL);
    let screen_br = regs.get(reg::PA_SC_SCREEN_SCISSOR_BR);
    tl_x = tl_x.max(sign_extend(screen_tl & 0x7FFF, 15));
    tl_y = tl_y.max(sign_extend((screen_tl >> 16) & 0x7FFF, 15));
    br_x = br_x.min(sign_extend(screen_br & 0x7FFF, 15));
    br_y = br_y.min(sign_extend((screen_br >> 16) & 0x7FFF, 15));

    tl_x = tl_x.max(0);
    tl_y = tl_y.max(0);
    br_x = br_x.max(tl_x);
    br_y = br_y.max(tl_y);

    GuestScissor {
        x: tl_x as u32,
        y: tl_y as u32,
        width: (br_x - tl_x) as u32,
        height: (br_y - tl_y) as u32,
    }
}
