//! Minimal x86-64 encoder: just enough ModRM/REX/opcode plumbing for the
//! opcodes the backend actually lowers to (spec.md §4.4.6's representative
//! algorithms), grounded by naming convention on yjit's `asm/x86_64`
//! module (only its call sites were retrievable, not its source, so the
//! encoding tables below are written fresh against the Intel encoding
//! rather than ported).

use crate::backend::state::ModRmFuse;

/// GPR numbering, RAX..R15 (0-15); the REX.B/X/R extension bits cover 8-15.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Gpr {
    Rax, Rcx, Rdx, Rbx, Rsp, Rbp, Rsi, Rdi,
    R8, R9, R10, R11, R12, R13, R14, R15,
}

/// XMM registers, numbered separately from the GPR file.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Xmm {
    Xmm0, Xmm1, Xmm2, Xmm3, Xmm4, Xmm5, Xmm6, Xmm7,
    Xmm8, Xmm9, Xmm10, Xmm11, Xmm12, Xmm13, Xmm14, Xmm15,
}

/// C-call return register / the default return-value GPR.
pub const RET_REG: Gpr = Gpr::Rax;
/// Register scratch pool the allocator may freely clobber (first choice
/// candidates when evicting).
pub const SCRATCH_REGS: [Gpr; 2] = [Gpr::Rax, Gpr::Rcx];

fn rex(w: bool, r: u8, x: u8, b: u8) -> Option<u8> {
    let needs = w || r >= 8 || x >= 8 || b >= 8;
    if !needs {
        return None;
    }
    Some(0x40 | ((w as u8) << 3) | (((r >> 3) & 1) << 2) | (((x >> 3) & 1) << 1) | ((b >> 3) & 1))
}

fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
    (mode << 6) | ((reg & 7) << 3) | (rm & 7)
}

/// Encode `[base + disp]`, `[base + index*scale + disp]`, or a RIP/absolute
/// addressing form from a [`ModRmFuse`], choosing the minimal `mode` field
/// (00/01/04 disp8/disp32) the way the original's `asm_fuseload` callers do.
fn encode_mem(out: &mut Vec<u8>, reg_field: u8, fuse: &ModRmFuse) {
    match (fuse.base, fuse.index) {
        (Some(base), None) => {
            let mode = if fuse.disp == 0 && base != Gpr::Rbp as u8 {
                0b00
            } else if fuse.disp >= i8::MIN as i32 && fuse.disp <= i8::MAX as i32 {
                0b01
            } else {
                0b10
            };
            out.push(modrm(mode, reg_field, base));
            if base & 7 == Gpr::Rsp as u8 {
                out.push(0x24); // SIB: no index, base = RSP/R12
            }
            push_disp(out, fuse.disp, mode);
        }
        (Some(base), Some(index)) => {
            let mode = if fuse.disp == 0 {
                0b00
            } else if fuse.disp >= i8::MIN as i32 && fuse.disp <= i8::MAX as i32 {
                0b01
            } else {
                0b10
            };
            out.push(modrm(mode, reg_field, 0b100)); // SIB follows
            let scale_bits = match fuse.scale {
                1 => 0,
                2 => 1,
                4 => 2,
                8 => 3,
                _ => 3,
            };
            out.push((scale_bits << 6) | ((index & 7) << 3) | (base & 7));
            push_disp(out, fuse.disp, mode);
        }
        (None, _) => {
            // Absolute / RIP-relative, disp32 only.
            out.push(modrm(0b00, reg_field, 0b101));
            out.extend_from_slice(&fuse.disp.to_le_bytes());
        }
    }
}

fn push_disp(out: &mut Vec<u8>, disp: i32, mode: u8) {
    match mode {
        0b01 => out.push(disp as i8 as u8),
        0b10 => out.extend_from_slice(&disp.to_le_bytes()),
        _ => {}
    }
}

/// `add r64, r/m64` or `add r64, imm32` depending on whether `src` is a
/// register or a fused memory operand.
pub fn emit_add_reg_reg(dst: Gpr, src: Gpr) -> Vec<u8> {
    let mut out = Vec::with_capacity(4);
    if let Some(r) = rex(true, src as u8, 0, dst as u8) {
        out.push(r);
    }
    out.push(0x01);
    out.push(modrm(0b11, src as u8, dst as u8));
    out
}

pub fn emit_add_reg_imm32(dst: Gpr, imm: i32) -> Vec<u8> {
    let mut out = Vec::with_capacity(7);
    if let Some(r) = rex(true, 0, 0, dst as u8) {
        out.push(r);
    }
    out.push(0x81);
    out.push(modrm(0b11, 0, dst as u8));
    out.extend_from_slice(&imm.to_le_bytes());
    out
}

/// The "lea-based 3-operand form" from spec.md §4.4.6: `lea dst, [a+b+k]`.
pub fn emit_lea(dst: Gpr, fuse: &ModRmFuse) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    let index = fuse.index.unwrap_or(0);
    if let Some(r) = rex(true, dst as u8, index, fuse.base.unwrap_or(0)) {
        out.push(r);
    }
    out.push(0x8d);
    encode_mem(&mut out, dst as u8, fuse);
    out
}

pub fn emit_mov_reg_reg(dst: Gpr, src: Gpr) -> Vec<u8> {
    let mut out = Vec::with_capacity(3);
    if let Some(r) = rex(true, src as u8, 0, dst as u8) {
        out.push(r);
    }
    out.push(0x89);
    out.push(modrm(0b11, src as u8, dst as u8));
    out
}

pub fn emit_mov_reg_mem(dst: Gpr, fuse: &ModRmFuse) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    let index = fuse.index.unwrap_or(0);
    if let Some(r) = rex(true, dst as u8, index, fuse.base.unwrap_or(0)) {
        out.push(r);
    }
    out.push(0x8b);
    encode_mem(&mut out, dst as u8, fuse);
    out
}

pub fn emit_test_reg_reg(a: Gpr, b: Gpr) -> Vec<u8> {
    let mut out = Vec::with_capacity(3);
    if let Some(r) = rex(true, b as u8, 0, a as u8) {
        out.push(r);
    }
    out.push(0x85);
    out.push(modrm(0b11, b as u8, a as u8));
    out
}

pub fn emit_cmp_reg_reg(a: Gpr, b: Gpr) -> Vec<u8> {
    let mut out = Vec::with_capacity(3);
    if let Some(r) = rex(true, b as u8, 0, a as u8) {
        out.push(r);
    }
    out.push(0x39);
    out.push(modrm(0b11, b as u8, a as u8));
    out
}

/// Condition codes for `Jcc`, numbered the way the Intel encoding expects
/// (`0x0f 0x8x`).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Cc {
    O = 0x0, No = 0x1, B = 0x2, Ae = 0x3, E = 0x4, Ne = 0x5,
    Be = 0x6, A = 0x7, L = 0xc, Ge = 0xd, Le = 0xe, G = 0xf,
}

impl Cc {
    /// Bit-0 flip negates the condition, mirroring the IR opcode symmetry
    /// spec.md §4.1 calls out (`EQ^1 == NE`, etc).
    pub fn invert(self) -> Cc {
        match self {
            Cc::O => Cc::No,
            Cc::No => Cc::O,
            Cc::B => Cc::Ae,
            Cc::Ae => Cc::B,
            Cc::E => Cc::Ne,
            Cc::Ne => Cc::E,
            Cc::Be => Cc::A,
            Cc::A => Cc::Be,
            Cc::L => Cc::Ge,
            Cc::Ge => Cc::L,
            Cc::Le => Cc::G,
            Cc::G => Cc::Le,
        }
    }
}

/// `jcc rel32`, the form `guardcc` uses to reach an exit stub.
pub fn emit_jcc_rel32(cc: Cc, rel: i32) -> Vec<u8> {
    let mut out = Vec::with_capacity(6);
    out.push(0x0f);
    out.push(0x80 | cc as u8);
    out.extend_from_slice(&rel.to_le_bytes());
    out
}

pub fn emit_jmp_rel32(rel: i32) -> Vec<u8> {
    let mut out = Vec::with_capacity(5);
    out.push(0xe9);
    out.extend_from_slice(&rel.to_le_bytes());
    out
}

pub fn emit_push_imm8(v: u8) -> Vec<u8> {
    vec![0x6a, v]
}

pub fn emit_addsd(dst: Xmm, src: Xmm) -> Vec<u8> {
    vec![0xf2, 0x0f, 0x58, modrm(0b11, dst as u8, src as u8)]
}

/// `movaps xmm, xmm`: the reg-reg move used to rename a value across FPRs.
pub fn emit_movaps_reg_reg(dst: Xmm, src: Xmm) -> Vec<u8> {
    vec![0x0f, 0x28, modrm(0b11, dst as u8, src as u8)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rex_omitted_for_low_regs_no_w() {
        assert_eq!(rex(false, 0, 0, 1), None);
    }

    #[test]
    fn rex_present_for_w() {
        assert_eq!(rex(true, 0, 0, 0), Some(0x48));
    }

    #[test]
    fn invert_is_involution() {
        for cc in [Cc::E, Cc::L, Cc::Ge, Cc::A] {
            assert_eq!(cc.invert().invert(), cc);
        }
    }

    #[test]
    fn add_reg_reg_has_rex_w() {
        let bytes = emit_add_reg_reg(Gpr::Rax, Gpr::Rcx);
        assert_eq!(bytes[0], 0x48);
        assert_eq!(bytes[1], 0x01);
    }
}
