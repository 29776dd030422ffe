//! `AsmState`: the backward assembler's working state (spec.md §4.4.1),
//! grounded on `lj_asm.c`'s `ASMState` struct.

use crate::backend::regalloc::RegAllocator;
use crate::ir::Ref;
use crate::mcode::McodeArena;

/// Pending x86 ModRM fuse: base register, optional scaled index, and a
/// displacement, accumulated while `fuse_load` walks a chain of `AREF`/
/// `FREF`/`STRREF` instructions before committing to one addressing mode.
#[derive(Clone, Copy, Debug, Default)]
pub struct ModRmFuse {
    pub base: Option<u8>,
    pub index: Option<u8>,
    pub scale: u8,
    pub disp: i32,
}

impl ModRmFuse {
    pub fn clear(&mut self) {
        *self = ModRmFuse::default();
    }

    pub fn is_pending(&self) -> bool {
        self.base.is_some() || self.index.is_some()
    }
}

/// Code pointers the emitter needs to patch after the fact: the loop
/// branch target, a pending invertible branch (for the `guardcc`/
/// loop-inversion peephole), a pending `test` the next guard might elide,
/// and the realign marker used by the state-machine retry.
#[derive(Clone, Copy, Debug, Default)]
pub struct PatchPoints {
    pub loop_branch: Option<usize>,
    pub invertible_branch: Option<usize>,
    pub pending_test: Option<usize>,
    pub realign: Option<usize>,
}

/// Everything the backward walk needs in one place.
pub struct AsmState<'a> {
    pub buf: &'a mut crate::ir::IrBuffer,
    pub regs: RegAllocator,
    pub mcode: &'a mut McodeArena,

    /// Current machine-code write cursor and the red-zone limit.
    pub mcp: usize,
    pub mclim: usize,

    pub snapno: u32,
    /// High-water mark for `RENAME` refs inserted so snapshots downstream
    /// of a rename still resolve correctly.
    pub rename_hwm: Ref,

    pub fuse: ModRmFuse,
    /// IR ref below which memory-operand fusion is disabled (crossing into
    /// a different section loses the 15-instruction conflict-scan window).
    pub fuse_limit: Ref,

    /// Current section's base ref, for the variant/invariant split used by
    /// `alloc_ref`'s hint logic.
    pub section_ref: Ref,

    pub gcsteps: u32,

    pub patch: PatchPoints,
}

impl<'a> AsmState<'a> {
    pub fn new(buf: &'a mut crate::ir::IrBuffer, mcode: &'a mut McodeArena, section_ref: Ref) -> crate::error::Result<Self> {
        let (mcp, mclim) = mcode.reserve()?;
        Ok(AsmState {
            buf,
            regs: RegAllocator::new(),
            mcode,
            mcp,
            mclim,
            snapno: 0,
            rename_hwm: section_ref,
            fuse: ModRmFuse::default(),
            fuse_limit: section_ref,
            section_ref,
            gcsteps: 0,
            patch: PatchPoints::default(),
        })
    }

    /// `is_variant(ref)`: defined at or after the current section, or
    /// PHI-flagged -- the complement of "invariant" used by `alloc_ref`.
    pub fn is_variant(&self, r: Ref) -> bool {
        if crate::ir::ref_is_const(r) {
            return false;
        }
        r >= self.section_ref || self.buf.get(r).ty.is_phi()
    }

    /// `check_limit()`: called at block boundaries; true if the red zone
    /// has been crossed and a `limit_err` retry is needed.
    pub fn limit_crossed(&self, bytes_about_to_emit: usize) -> bool {
        self.mcp.saturating_sub(bytes_about_to_emit) < self.mclim
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::IrBuffer;

    #[test]
    fn variant_split_respects_section_and_phi() {
        let mut buf = IrBuffer::new();
        let mut mcode = McodeArena::new(32, 512);
        let section_ref = crate::ir::REF_BASE + 1;
        let state = AsmState::new(&mut buf, &mut mcode, section_ref).unwrap();
        assert!(!state.is_variant(crate::ir::REF_BASE));
    }
}
