//! Loop optimizer: copy-substitution and PHI formation (spec.md §4.3),
//! grounded on `lj_opt_loop.c`.
//!
//! Classical LICM would need a dominance analysis to keep guards ordered
//! correctly with respect to the code they protect. Copy-substitution
//! sidesteps that: the pre-roll is walked again, instruction by instruction,
//! re-emitting each one through the fold/CSE pipeline with its operands
//! substituted. Every guard in the pre-roll dominates the re-emitted body by
//! construction, and invariants fold away for free because CSE recognizes
//! the re-emitted instruction as identical to the original.

use log::{debug, warn};

use crate::error::{Result, TraceError};
use crate::ir::{ref_is_const, IrBuffer, IrType, Op, Ref, TypeTag, REF_BASE, REF_BIAS, REF_FIRST};
use crate::snapshot::{SnapEntry, SnapshotStore};

/// Outcome of a successful unroll: the ref of the `LOOP` marker and the
/// final list of PHI refs (as `(left, right)` pairs, in emission order).
pub struct LoopResult {
    pub loop_ref: Ref,
    pub phis: Vec<(Ref, Ref)>,
}

struct PhiCandidate {
    left: Ref,
    right: Ref,
    redundant: bool,
}

/// Run the copy-substitution pass over everything recorded so far
/// (`REF_FIRST..next_ref()`), turning it into pre-roll + `LOOP` + unrolled
/// body + PHIs.
pub fn unroll(buf: &mut IrBuffer, snaps: &mut SnapshotStore, max_snap: u32) -> Result<LoopResult> {
    let preroll_start = REF_FIRST;
    let preroll_end = buf.next_ref();

    let loop_ref = buf.emit_raw(Op::Loop, IrType::guarded(TypeTag::Nil), 0, 0)?;

    // subst[r - REF_BIAS] is the re-emitted ref for original instruction r.
    let mut subst = vec![0 as Ref; (preroll_end - REF_BIAS) as usize];
    subst[(REF_BASE - REF_BIAS) as usize] = REF_BASE;

    let mut candidates: Vec<PhiCandidate> = Vec::new();
    let mut guard_since_dup = false;
    let mut last_dup: Option<usize> = None;

    // The snapshot at loop entry: a slot dead anywhere later in the body
    // still has whatever value it held on entry, so duplicated snapshots
    // fall back to this one instead of leaving the slot dead.
    let loop_snapshot: Vec<SnapEntry> = if snaps.is_empty() { Vec::new() } else { snaps.slots(0).to_vec() };

    for orig in preroll_start..preroll_end {
        if let Some(snap_idx) = snapshot_boundary_at(snaps, orig) {
            let new_ref = buf.next_ref();
            if !guard_since_dup {
                if let Some(dup) = last_dup {
                    let slots = substituted_slots(snaps, dup, &subst, preroll_start);
                    snaps.overwrite(dup, new_ref, &slots);
                    last_dup = Some(dup);
                } else {
                    let dup = duplicate(snaps, snap_idx, new_ref, &subst, preroll_start, max_snap, &loop_snapshot)?;
                    last_dup = Some(dup);
                }
            } else {
                let dup = duplicate(snaps, snap_idx, new_ref, &subst, preroll_start, max_snap, &loop_snapshot)?;
                last_dup = Some(dup);
            }
            guard_since_dup = false;
        }

        let ins = *buf.get(orig);
        let sop1 = subst_ref(&subst, ins.op1, preroll_start);
        let sop2 = subst_ref(&subst, ins.op2, preroll_start);

        let final_ref = if sop1 == ins.op1 && sop2 == ins.op2 && ins.op.is_normal() {
            // Invariant: hoisted free by CSE (its definition already
            // dominates the loop body, so re-emitting would just CSE back
            // to itself).
            orig
        } else {
            let mut ty = ins.ty;
            ty.clear_phi();
            let new_ref = buf.emit(ins.op, ty, sop1, sop2)?;
            type_stability_check(buf, orig, new_ref, ins.ty)?
        };
        subst[(orig - REF_BIAS) as usize] = final_ref;

        // `final_ref` is either `orig` itself (CSE proved the re-emitted
        // instruction identical, i.e. truly loop-invariant) or a fresh ref
        // above `loop_ref` (genuinely recomputed each iteration). Only the
        // latter needs a PHI joining the pre-roll value with the
        // recomputed one.
        if final_ref != orig
            && !ref_is_const(final_ref)
            && !buf.get(final_ref).ty.is_phi()
            && !ins.ty.tag().is_primitive()
        {
            buf.get_mut(final_ref).ty.set_phi();
            candidates.push(PhiCandidate { left: orig, right: final_ref, redundant: false });
        }

        if ins.op.is_guard() {
            guard_since_dup = true;
        }
    }

    if !guard_since_dup {
        if last_dup.is_some() {
            debug!("loop optimizer: discarding trailing snapshot duplicate with no guard");
            snaps.discard_last();
        }
    }

    let phis = emit_phis(buf, candidates, loop_ref)?;
    Ok(LoopResult { loop_ref, phis })
}

fn subst_ref(subst: &[Ref], r: Ref, preroll_start: Ref) -> Ref {
    if ref_is_const(r) || r < preroll_start {
        return r;
    }
    subst[(r - REF_BIAS) as usize]
}

/// Checks the re-emitted instruction's type against the original, allowing
/// int-to-float promotion and failing anything else that changed kind
/// (spec.md §4.3 step 3 "Type stability check").
fn type_stability_check(buf: &mut IrBuffer, orig: Ref, new_ref: Ref, orig_ty: IrType) -> Result<Ref> {
    let new_ty = buf.get(new_ref).ty;
    if new_ty.tag() == orig_ty.tag() {
        return Ok(new_ref);
    }
    if orig_ty.tag() == TypeTag::Num && new_ty.tag().is_integer() {
        return buf.emit(Op::Tonum, IrType::new(TypeTag::Num), new_ref, 0);
    }
    if orig_ty.tag().is_integer() && new_ty.tag().is_integer() {
        return Ok(new_ref);
    }
    warn!(
        "loop optimizer: type instability at ref {:#x}: {:?} -> {:?}",
        orig,
        orig_ty.tag(),
        new_ty.tag()
    );
    Err(TraceError::TypeInstability)
}

fn snapshot_boundary_at(snaps: &SnapshotStore, r: Ref) -> Option<usize> {
    (0..snaps.len()).find(|&i| snaps.get(i).first_ref == r)
}

fn substituted_slots(
    snaps: &SnapshotStore,
    idx: usize,
    subst: &[Ref],
    preroll_start: Ref,
) -> Vec<SnapEntry> {
    snaps
        .slots(idx)
        .iter()
        .map(|e| match *e {
            SnapEntry::Live(r) => SnapEntry::Live(subst_ref(subst, r, preroll_start)),
            other => other,
        })
        .collect()
}

fn duplicate(
    snaps: &mut SnapshotStore,
    idx: usize,
    new_first_ref: Ref,
    subst: &[Ref],
    preroll_start: Ref,
    max_snap: u32,
    loop_snapshot: &[SnapEntry],
) -> Result<usize> {
    snaps.duplicate_substituted(
        idx,
        new_first_ref,
        |r| subst_ref(subst, r, preroll_start),
        max_snap,
        loop_snapshot,
    )
}

/// Four-pass PHI formation (spec.md §4.3 step 5).
fn emit_phis(buf: &mut IrBuffer, mut candidates: Vec<PhiCandidate>, loop_ref: Ref) -> Result<Vec<(Ref, Ref)>> {
    // Pass 1: mark the trivially redundant ones.
    for c in candidates.iter_mut() {
        if c.left == c.right {
            c.redundant = true;
        }
    }

    // Pass 2: un-mark any candidate whose left ref is actually referenced
    // as an operand somewhere in the unrolled body -- it's genuinely
    // variant, a PHI is needed even though left==right looked redundant at
    // a glance (e.g. it also feeds a side computation).
    let body_refs: Vec<Ref> = buf.iter().filter(|(r, _)| *r > loop_ref).map(|(r, _)| r).collect();
    for r in body_refs {
        let ins = *buf.get(r);
        for c in candidates.iter_mut() {
            if c.redundant && (ins.op1 == c.left || ins.op2 == c.left) {
                c.redundant = false;
            }
        }
    }

    // Pass 3 (changed stack slots) is already covered: every instruction
    // whose substitution actually changed was added as a candidate at the
    // point of substitution, above.

    // Pass 4: emit survivors, drop the rest.
    let mut phis = Vec::with_capacity(candidates.len());
    for c in candidates {
        if c.redundant {
            buf.get_mut(c.left).ty.clear_phi();
            continue;
        }
        let ty = buf.get(c.left).ty;
        buf.emit_raw(Op::Phi, ty, c.left, c.right)?;
        phis.push((c.left, c.right));
    }
    Ok(phis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ConstVal, TypeTag};
    use crate::snapshot::SnapEntry;

    #[test]
    fn loop_with_invariant_and_variant() {
        let mut buf = IrBuffer::new();
        let mut snaps = SnapshotStore::new();

        let k1 = buf.intern_const(ConstVal::Int(1)).unwrap();
        let one = buf.emit(Op::Kint, IrType::new(TypeTag::Int), k1, 0).unwrap();
        let i = buf.emit_raw(Op::Sload, IrType::new(TypeTag::Int), 0, 0).unwrap();
        let i2 = buf.emit(Op::Add, IrType::new(TypeTag::Int), i, one).unwrap();

        snaps.begin(i2, &[SnapEntry::Live(i2)], 100).unwrap();

        let result = unroll(&mut buf, &mut snaps, 100).unwrap();
        assert!(result.loop_ref > i2);
        // The Add is variant (its left operand is loop-carried): expect a
        // PHI candidate to survive.
        assert!(!result.phis.is_empty());
    }

    #[test]
    fn pure_constant_loop_produces_no_phis() {
        let mut buf = IrBuffer::new();
        let mut snaps = SnapshotStore::new();
        let k1 = buf.intern_const(ConstVal::Int(1)).unwrap();
        buf.emit(Op::Kint, IrType::new(TypeTag::Int), k1, 0).unwrap();
        let result = unroll(&mut buf, &mut snaps, 100).unwrap();
        assert!(result.phis.is_empty());
    }
}
