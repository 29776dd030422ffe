//! Snapshots, the snapshot map, and the register/spill descriptor (spec.md
//! §3 "Snapshot", "Snapshot map entry", "Register/spill pair (RegSP)").
//!
//! A snapshot is a point in a trace where execution may bail out to the
//! interpreter: it records, for every interpreter stack slot, either that
//! the slot is dead, or which IR ref currently holds its value, or that the
//! slot is a frame-link (a call boundary). The assembler later fills in a
//! RegSP for each live slot so the exit stub knows where to find it.

use smallvec::SmallVec;

use crate::error::{Result, TraceError};
use crate::ir::Ref;

/// No register assigned.
pub const RID_INVALID: u8 = 0xff;
/// No spill slot assigned.
pub const SPILL_NONE: u8 = 0;
/// One past the highest legal spill slot (spec.md "spill slot 255 is still
/// accepted; allocating the 256th slot raises SPILL_OVERFLOW").
pub const MAX_SPILL_SLOTS: u16 = 256;

/// Register id + spill slot, attached to each IR instruction once the
/// assembler allocates it. Numbers occupy even slots (paired for doubles),
/// integers fit the odd companion slot.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RegSp {
    pub reg: u8,
    pub spill: u8,
}

impl RegSp {
    pub const UNALLOCATED: RegSp = RegSp { reg: RID_INVALID, spill: SPILL_NONE };

    pub fn has_reg(self) -> bool {
        self.reg != RID_INVALID
    }

    pub fn has_spill(self) -> bool {
        self.spill != SPILL_NONE
    }

    pub fn used(self) -> bool {
        self.has_reg() || self.has_spill()
    }

    pub fn with_reg(reg: u8) -> Self {
        RegSp { reg, spill: SPILL_NONE }
    }

    pub fn with_spill(spill: u8) -> Self {
        RegSp { reg: RID_INVALID, spill }
    }
}

/// One entry of a snapshot's per-slot map.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SnapEntry {
    /// The slot holds no live value at this point.
    Dead,
    /// The slot's value is the result of this IR ref.
    Live(Ref),
    /// The slot is a frame-link: a new Lua frame was pushed here, recording
    /// the called function and the return PC/slot.
    FrameLink { func_ref: Ref, return_slot: u16 },
}

impl SnapEntry {
    /// `snap_ref`: separate the stored ref from its register/spill role
    /// (only meaningful for [`SnapEntry::Live`]).
    pub fn snap_ref(self) -> Option<Ref> {
        match self {
            SnapEntry::Live(r) => Some(r),
            _ => None,
        }
    }
}

/// One snapshot: an offset into the trace's flattened slot-map array, plus
/// the bookkeeping spec.md §3 lists (first-valid ref, slot/frame-link
/// counts, taken-exit counter).
#[derive(Clone, Debug)]
pub struct Snapshot {
    /// Byte (entry) offset into the trace's snapshot-map array.
    pub map_offset: u32,
    /// First IR ref this snapshot is valid after.
    pub first_ref: Ref,
    pub nslots: u8,
    pub nframelinks: u8,
    /// Number of times a guard built from this snapshot has actually exited.
    pub exit_count: u32,
}

/// `snap_ridsp`: read the RegSP assigned to the slot a snapshot entry
/// names, by looking it up in the assembler's per-ref RegSP table. Kept as
/// a free function (not a method on `Snapshot`) since it needs the IR
/// buffer's allocation results, which a `Snapshot` does not itself own.
pub fn snap_ridsp(entry: SnapEntry, regsp_of: impl Fn(Ref) -> RegSp) -> Option<RegSp> {
    entry.snap_ref().map(regsp_of)
}

/// The snapshot array plus flattened slot-map storage for one trace
/// (spec.md's "snapshot array + snapshot map"). Snapshot refs are kept
/// monotonically non-decreasing, matching the `I-` invariant checked in
/// integration tests.
#[derive(Clone, Debug, Default)]
pub struct SnapshotStore {
    snapshots: Vec<Snapshot>,
    map: Vec<SnapEntry>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn get(&self, idx: usize) -> &Snapshot {
        &self.snapshots[idx]
    }

    pub fn slots(&self, idx: usize) -> &[SnapEntry] {
        let snap = &self.snapshots[idx];
        let start = snap.map_offset as usize;
        &self.map[start..start + snap.nslots as usize + snap.nframelinks as usize]
    }

    /// `snapshot_begin`: record a new snapshot built from `slots`, enforcing
    /// monotonic refs and the configured ceiling.
    pub fn begin(&mut self, first_ref: Ref, slots: &[SnapEntry], max_snap: u32) -> Result<usize> {
        if let Some(last) = self.snapshots.last() {
            debug_assert!(first_ref >= last.first_ref, "snapshot refs must be monotonic");
        }
        if self.snapshots.len() as u32 >= max_snap {
            return Err(TraceError::SnapOverflow { limit: max_snap });
        }
        let nframelinks = slots.iter().filter(|e| matches!(e, SnapEntry::FrameLink { .. })).count();
        let nslots = slots.len() - nframelinks;
        let map_offset = self.map.len() as u32;
        self.map.extend_from_slice(slots);
        self.snapshots.push(Snapshot {
            map_offset,
            first_ref,
            nslots: nslots as u8,
            nframelinks: nframelinks as u8,
            exit_count: 0,
        });
        Ok(self.snapshots.len() - 1)
    }

    /// Duplicate snapshot `idx` for the loop optimizer's unrolled body,
    /// substituting each live slot's ref through `subst`. A slot that's dead
    /// in this snapshot but live in `loop_snapshot` (the snapshot taken at
    /// loop entry) inherits that value instead of staying dead, per spec.md
    /// §4.3 step 2 ("slots that are dead in the body inherit from the loop
    /// snapshot").
    pub fn duplicate_substituted(
        &mut self,
        idx: usize,
        new_first_ref: Ref,
        subst: impl Fn(Ref) -> Ref,
        max_snap: u32,
        loop_snapshot: &[SnapEntry],
    ) -> Result<usize> {
        let slots: SmallVec<[SnapEntry; 32]> = self
            .slots(idx)
            .iter()
            .enumerate()
            .map(|(i, e)| match *e {
                SnapEntry::Live(r) => SnapEntry::Live(subst(r)),
                SnapEntry::FrameLink { func_ref, return_slot } => {
                    SnapEntry::FrameLink { func_ref: subst(func_ref), return_slot }
                }
                SnapEntry::Dead => match loop_snapshot.get(i) {
                    Some(SnapEntry::Live(r)) => SnapEntry::Live(subst(*r)),
                    _ => SnapEntry::Dead,
                },
            })
            .collect();
        self.begin(new_first_ref, &slots, max_snap)
    }

    /// Overwrite an already-duplicated snapshot in place, used when no guard
    /// was emitted between it and the previous duplicate (spec.md §4.3).
    pub fn overwrite(&mut self, idx: usize, new_first_ref: Ref, slots: &[SnapEntry]) {
        let old = &self.snapshots[idx];
        let start = old.map_offset as usize;
        let old_len = old.nslots as usize + old.nframelinks as usize;
        if slots.len() == old_len {
            self.map[start..start + old_len].copy_from_slice(slots);
        } else {
            // Length changed: append fresh and repoint the offset. The
            // stale tail is simply unreachable; no compaction pass runs
            // mid-trace.
            let map_offset = self.map.len() as u32;
            self.map.extend_from_slice(slots);
            self.snapshots[idx].map_offset = map_offset;
        }
        let nframelinks = slots.iter().filter(|e| matches!(e, SnapEntry::FrameLink { .. })).count();
        let snap = &mut self.snapshots[idx];
        snap.first_ref = new_first_ref;
        snap.nslots = (slots.len() - nframelinks) as u8;
        snap.nframelinks = nframelinks as u8;
    }

    /// Drop the trailing snapshot, used when finalizing the loop body if no
    /// guard followed the last duplicate (spec.md §4.3 step 4).
    pub fn discard_last(&mut self) {
        if let Some(last) = self.snapshots.pop() {
            let start = last.map_offset as usize;
            self.map.truncate(start);
        }
    }

    pub fn record_exit(&mut self, idx: usize) {
        self.snapshots[idx].exit_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regsp_used_reflects_either_field() {
        assert!(!RegSp::UNALLOCATED.used());
        assert!(RegSp::with_reg(3).used());
        assert!(RegSp::with_spill(4).used());
    }

    #[test]
    fn begin_enforces_ceiling() {
        let mut store = SnapshotStore::new();
        for i in 0..3u16 {
            store.begin(i, &[SnapEntry::Dead], 3).unwrap();
        }
        let err = store.begin(3, &[SnapEntry::Dead], 3).unwrap_err();
        assert_eq!(err, TraceError::SnapOverflow { limit: 3 });
    }

    #[test]
    fn duplicate_substitutes_live_slots() {
        let mut store = SnapshotStore::new();
        let idx = store.begin(10, &[SnapEntry::Live(0x8001), SnapEntry::Dead], 100).unwrap();
        let dup = store
            .duplicate_substituted(idx, 20, |r| r + 1, 100, &[])
            .unwrap();
        match store.slots(dup)[0] {
            SnapEntry::Live(r) => assert_eq!(r, 0x8002),
            _ => panic!("expected live slot"),
        }
    }

    #[test]
    fn duplicate_substituted_inherits_dead_slot_from_loop_snapshot() {
        let mut store = SnapshotStore::new();
        let idx = store.begin(10, &[SnapEntry::Live(0x8001), SnapEntry::Dead], 100).unwrap();
        let loop_snapshot = [SnapEntry::Live(0x8001), SnapEntry::Live(0x8002)];
        let dup = store
            .duplicate_substituted(idx, 20, |r| r + 1, 100, &loop_snapshot)
            .unwrap();
        match store.slots(dup)[1] {
            SnapEntry::Live(r) => assert_eq!(r, 0x8003),
            other => panic!("expected the dead slot to inherit from the loop snapshot, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_substituted_leaves_slot_dead_when_loop_snapshot_agrees() {
        let mut store = SnapshotStore::new();
        let idx = store.begin(10, &[SnapEntry::Dead], 100).unwrap();
        let loop_snapshot = [SnapEntry::Dead];
        let dup = store
            .duplicate_substituted(idx, 20, |r| r + 1, 100, &loop_snapshot)
            .unwrap();
        assert_eq!(store.slots(dup)[0], SnapEntry::Dead);
    }

    #[test]
    fn discard_last_truncates_map() {
        let mut store = SnapshotStore::new();
        store.begin(0, &[SnapEntry::Dead], 100).unwrap();
        let before = store.len();
        store.discard_last();
        assert_eq!(store.len(), before - 1);
    }
}
