//! Exit stubs and guard emission (spec.md §4.4.5), grounded on `lj_asm.c`'s
//! `asm_guard`/exit-stub-group layout and `lj_jit.h`'s `EXITSTUB_SPACING`/
//! `EXITSTUBS_PER_GROUP`.

use crate::asm::x86_64::{emit_jcc_rel32, emit_jmp_rel32, emit_push_imm8, Cc};

/// Exit stubs are emitted in groups of 32 at the bottom of the reserved
/// mcode area.
pub const EXITSTUBS_PER_GROUP: u32 = 32;
/// Bytes between consecutive stubs within a group: a 1-byte `push imm8`
/// plus a 2-byte short jump to the shared group epilogue.
pub const EXITSTUB_SPACING: usize = 2 + 2;

/// Address (offset within the mcode arena) of exit stub `exitno`.
pub fn exitstub_addr(group_base: usize, exitno: u32) -> usize {
    let group = exitno / EXITSTUBS_PER_GROUP;
    let slot = exitno % EXITSTUBS_PER_GROUP;
    group_base + group as usize * (EXITSTUBS_PER_GROUP as usize * EXITSTUB_SPACING)
        + slot as usize * EXITSTUB_SPACING
}

/// Emit one exit stub: pushes a 1-byte exit number then falls through to
/// the group epilogue (which pushes the high byte and jumps to the VM exit
/// handler). Returns the bytes in forward order -- stubs are laid out once,
/// not walked backward like the trace body.
pub fn emit_exit_stub(exitno: u32) -> Vec<u8> {
    let mut out = emit_push_imm8((exitno & 0xff) as u8);
    out.extend(emit_jmp_rel32(0)); // relocated to the group epilogue by the caller
    out
}

pub fn emit_group_epilogue(exitno_hi: u32, dispatch_rel32: i32) -> Vec<u8> {
    let mut out = emit_push_imm8(((exitno_hi >> 8) & 0xff) as u8);
    out.extend(emit_jmp_rel32(dispatch_rel32));
    out
}

/// `guardcc(cc)`: emit a conditional jump to the exit stub for `snapno`. If
/// `pending_loop_branch` names a branch at the address we're about to
/// place this guard, the condition is inverted and rewritten to target the
/// loop instead -- merging the guard and the loop-inversion branch into one
/// instruction (spec.md §4.4.5 "falls on the same machine address").
pub fn guardcc(
    cc: Cc,
    snapno: u32,
    group_base: usize,
    here: usize,
    pending_loop_branch: Option<(usize, usize)>,
) -> Vec<u8> {
    if let Some((branch_addr, loop_target)) = pending_loop_branch {
        if branch_addr == here {
            let rel = (loop_target as isize - here as isize) as i32;
            return emit_jcc_rel32(cc.invert(), rel);
        }
    }
    let target = exitstub_addr(group_base, snapno);
    let rel = (target as isize - here as isize) as i32;
    emit_jcc_rel32(cc, rel)
}
