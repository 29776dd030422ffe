//! Memory-operand fusion (spec.md §4.4.3), grounded by name (not ported) on
//! `lj_asm.c`'s `asm_fuseahuref`/`asm_fusearef`/`asm_fusefref`/
//! `asm_fusestrref` family.
//!
//! Fusing an operand means folding its address computation straight into
//! the consuming instruction's ModRM byte instead of materializing it in a
//! register first. It's only sound when the fused instruction is the sole
//! recent reader of that address and nothing could have written through it
//! in between -- the bounded conflict scan below is how that's checked
//! without building a full memory-dependence graph.

use crate::backend::state::ModRmFuse;
use crate::ir::{IrBuffer, Op, Ref};

/// How far back `fuse_load` will scan for a conflicting store before giving
/// up and forcing a plain register load.
pub const CONFLICT_SCAN_WINDOW: usize = 15;

#[derive(Clone, Copy, Debug)]
pub enum Fused {
    /// `[base + field_offset]`.
    Field { base: Ref, offset: i32 },
    /// `[array_base + index*scale + k]`.
    Array { base: Ref, index: Option<Ref>, scale: u8, disp: i32 },
    /// A closed-upvalue constant: an absolute address, no base register.
    Absolute { addr: usize },
    /// `[str_base + offset]`, optionally with a folded constant add.
    StrSlice { base: Ref, offset: i32 },
}

/// `fuse_fref`: `FREF`/`FLOAD` -> `[base + field_offset]`.
pub fn fuse_fref(buf: &IrBuffer, r: Ref, limit: Ref) -> Option<Fused> {
    if r < limit {
        return None;
    }
    let ins = buf.get(r);
    if ins.op != Op::Fref {
        return None;
    }
    Some(Fused::Field { base: ins.op1, offset: ins.op2 as i32 })
}

/// `fuse_aref`: `AREF` -> `[array_base + index*8 + k]`, with a
/// collocated-array fast path folded in when the array base is itself a
/// freshly allocated table (`TNEW`/`TDUP`), in which case the header and
/// array data sit at a fixed relative offset and no separate base load is
/// required.
pub fn fuse_aref(buf: &IrBuffer, r: Ref, limit: Ref) -> Option<Fused> {
    if r < limit {
        return None;
    }
    let ins = buf.get(r);
    if ins.op != Op::Aref {
        return None;
    }
    let base_ins = buf.get(ins.op1);
    let disp = if matches!(base_ins.op, Op::Tnew | Op::Tdup) { 8 } else { 0 };
    Some(Fused::Array { base: ins.op1, index: Some(ins.op2), scale: 8, disp })
}

/// `fuse_ahu_ref`: accepts `AREF`/`HREFK`/`UREFC`, producing an array/field
/// fuse or an absolute address for a closed upvalue constant.
pub fn fuse_ahu_ref(buf: &IrBuffer, r: Ref, limit: Ref) -> Option<Fused> {
    if r < limit {
        return None;
    }
    let ins = buf.get(r);
    match ins.op {
        Op::Aref => fuse_aref(buf, r, limit),
        Op::Hrefk => Some(Fused::Field { base: ins.op1, offset: ins.op2 as i32 }),
        Op::Urefc => Some(Fused::Absolute { addr: ins.op2 as usize }),
        _ => None,
    }
}

/// `fuse_strref`: `STRREF` -> `[str_base + offset]`, folding a constant
/// `ADD` on the offset operand when present.
pub fn fuse_strref(buf: &IrBuffer, r: Ref, limit: Ref) -> Option<Fused> {
    if r < limit {
        return None;
    }
    let ins = buf.get(r);
    if ins.op != Op::Strref {
        return None;
    }
    let offset_ins = buf.get(ins.op2);
    if offset_ins.op == Op::Kint {
        if let crate::ir::ConstVal::Int(v) = buf.const_val(offset_ins.op1) {
            return Some(Fused::StrSlice { base: ins.op1, offset: v });
        }
    }
    Some(Fused::StrSlice { base: ins.op1, offset: 0 })
}

/// True if no store in the `CONFLICT_SCAN_WINDOW` instructions following
/// `r` (toward the current assembly position, i.e. earlier refs since
/// we're walking backward) could alias the fused address. A coarse but
/// sound approximation: any store at all within the window blocks fusion,
/// since this core tracks no alias analysis finer than "is a store".
fn window_has_conflicting_store(buf: &IrBuffer, r: Ref, current: Ref) -> bool {
    let mut seen = 0usize;
    let mut scan = current;
    while scan > r && seen < CONFLICT_SCAN_WINDOW {
        let ins = buf.get(scan);
        if ins.op.is_store() {
            return true;
        }
        scan -= 1;
        seen += 1;
    }
    false
}

/// `fuse_load(ref, current, limit) -> Option<Fused>`: try the fusers in
/// order, honoring the fusion limit and the conflict scan. Returns `None`
/// if fusion isn't possible, in which case the caller allocates a plain
/// register.
pub fn fuse_load(buf: &IrBuffer, r: Ref, current: Ref, limit: Ref) -> Option<Fused> {
    if window_has_conflicting_store(buf, r, current) {
        return None;
    }
    fuse_fref(buf, r, limit)
        .or_else(|| fuse_ahu_ref(buf, r, limit))
        .or_else(|| fuse_strref(buf, r, limit))
}

/// Commit a [`Fused`] address into the assembler's pending ModRM state.
pub fn apply(fuse: &mut ModRmFuse, f: Fused, base_reg: u8, index_reg: Option<u8>) {
    match f {
        Fused::Field { offset, .. } => {
            fuse.base = Some(base_reg);
            fuse.index = None;
            fuse.scale = 0;
            fuse.disp = offset;
        }
        Fused::Array { scale, disp, .. } => {
            fuse.base = Some(base_reg);
            fuse.index = index_reg;
            fuse.scale = scale;
            fuse.disp = disp;
        }
        Fused::Absolute { addr } => {
            fuse.base = None;
            fuse.index = None;
            fuse.scale = 0;
            fuse.disp = addr as i32;
        }
        Fused::StrSlice { offset, .. } => {
            fuse.base = Some(base_reg);
            fuse.index = None;
            fuse.scale = 0;
            fuse.disp = offset;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ConstVal, IrType, TypeTag};

    #[test]
    fn fref_fuses_to_field_offset() {
        let mut buf = IrBuffer::new();
        let base = buf.emit_raw(Op::Sload, IrType::new(TypeTag::Tab), 0, 0).unwrap();
        let fref = buf.emit_raw(Op::Fref, IrType::new(TypeTag::Ptr), base, 3).unwrap();
        match fuse_fref(&buf, fref, crate::ir::REF_FIRST) {
            Some(Fused::Field { base: b, offset }) => {
                assert_eq!(b, base);
                assert_eq!(offset, 3);
            }
            _ => panic!("expected field fuse"),
        }
    }

    #[test]
    fn conflict_window_blocks_fusion() {
        let mut buf = IrBuffer::new();
        let base = buf.emit_raw(Op::Sload, IrType::new(TypeTag::Tab), 0, 0).unwrap();
        let fref = buf.emit_raw(Op::Fref, IrType::new(TypeTag::Ptr), base, 0).unwrap();
        let idx = buf.intern_const(ConstVal::Int(0)).unwrap();
        let val = buf.emit_raw(Op::Kint, IrType::new(TypeTag::Int), idx, 0).unwrap();
        buf.emit_raw(Op::Fstore, IrType::new(TypeTag::Nil), fref, val).unwrap();
        let current = buf.next_ref() - 1;
        assert!(fuse_load(&buf, fref, current, crate::ir::REF_FIRST).is_none());
    }
}
