//! External interfaces (spec.md §6): what this core consumes from the
//! recorder and the runtime, and what it produces.

use crate::config::JitConfig;
use crate::snapshot::{RegSp, SnapshotStore};
use crate::trace::LinkTarget;

/// Everything the recorder hands the optimizer/assembler for one job.
pub struct RecorderInput {
    pub ir: crate::ir::IrBuffer,
    pub snapshots: SnapshotStore,
    /// PC of the bytecode instruction that started this recording.
    pub starting_pc: usize,
    /// Parent trace number + exit number, for a side trace.
    pub parent: Option<(u32, u32)>,
    pub config: JitConfig,
    /// Per-slot RegSP inherited from the parent trace's exit state, if any.
    pub parent_exit_regsp: Vec<RegSp>,
}

/// Callable runtime addresses the assembler bakes into call sites. Every
/// field is an opaque function pointer from this core's point of view; the
/// host supplies the actual addresses.
pub struct RuntimeEntryPoints {
    pub str_cmp: usize,
    pub str_new: usize,
    pub str_fromnum: usize,
    pub str_fromint: usize,
    pub str_numconv: usize,
    pub tab_new: usize,
    pub tab_dup: usize,
    pub tab_len: usize,
    pub tab_newkey: usize,
    pub gc_step_jit: usize,
    pub gc_barrieruv: usize,
    pub vm_pow: usize,
    pub vm_floor: usize,
    pub vm_ceil: usize,
    pub vm_trunc: usize,
    pub vm_exp: usize,
    pub vm_exp2: usize,
    pub vm_powi: usize,
    pub vm_exit_handler: usize,
    pub vm_exit_interp: usize,
}

/// Fixed field offsets into runtime object headers, baked into emitted
/// addressing modes (spec.md §9 "Global runtime state" -- centralized here
/// so a layout change updates every call site at once).
#[derive(Clone, Copy, Debug)]
pub struct RuntimeLayout {
    pub string_header_len_offset: i32,
    pub table_header_array_offset: i32,
    pub table_header_node_offset: i32,
    pub table_header_asize_offset: i32,
    pub table_header_hmask_offset: i32,
    pub upvalue_header_offset: i32,
    pub function_header_env_offset: i32,
    pub thread_header_offset: i32,
}

/// The per-instance global VM state this core reads/writes through fixed
/// offsets (`global_State` in the original).
pub struct GlobalStateOffsets {
    pub dispatch: i32,
    pub jit_l: i32,
    pub jit_base: i32,
    pub gc_total: i32,
    pub gc_threshold: i32,
    pub vmstate: i32,
    pub tmptv: i32,
    pub nilnode: i32,
}

/// Everything this core produces for one successfully compiled trace.
pub struct CompiledTrace {
    pub mcode_ptr: usize,
    pub mcode_size: usize,
    pub loop_entry_offset: usize,
    pub spadjust: i32,
    pub link: LinkTarget,
}

/// The host-owned facilities this core calls into without re-entering
/// itself (spec.md §5 "Suspension points"): executable memory management
/// and an incremental GC step trigger.
pub trait HostAllocator {
    fn grow_arena(&mut self, region_size: usize) -> Result<usize, crate::error::TraceError>;
    fn protect(&mut self, base: usize, size: usize, prot: crate::mcode::Protection);
}

/// `patch_exit(tr, exitno, target)`: repoint a previously-unpatched exit
/// jump at an already-installed trace so failing guard `exitno` transfers
/// directly to `target` instead of round-tripping through the VM exit
/// handler. Idempotent: calling it twice with the same arguments after the
/// first patch is a no-op, since the comparison against the jump's current
/// target short-circuits the rewrite.
pub fn patch_exit(
    mcode: &mut crate::mcode::McodeArena,
    exit_jump_site: usize,
    current_target: &mut usize,
    new_target: usize,
) -> Result<(), crate::error::TraceError> {
    if *current_target == new_target {
        return Ok(());
    }
    let handle = mcode.patch_window(exit_jump_site)?;
    *current_target = new_target;
    mcode.patch_close(handle);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_exit_is_idempotent() {
        let mut mcode = crate::mcode::McodeArena::new(32, 512);
        let (top, _) = mcode.reserve().unwrap();
        mcode.commit(top);
        let mut current = 0xdead;
        patch_exit(&mut mcode, top, &mut current, 0xbeef).unwrap();
        assert_eq!(current, 0xbeef);
        // Second call with the same new target: no further state change.
        patch_exit(&mut mcode, top, &mut current, 0xbeef).unwrap();
        assert_eq!(current, 0xbeef);
    }
}
