//! Trace records, the trace table, and the penalty/backprop caches (spec.md
//! §3 "Trace record", §7, supplemented per `lj_jit.h`'s `Trace`/`jit_State`,
//! `HotPenalty`, and `BPropEntry`).

use crate::ir::{IrBuffer, Ref};
use crate::snapshot::SnapshotStore;

/// Where a trace transfers control when it falls off the end of its body.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LinkTarget {
    /// Self-loop: jump back to this trace's own loop entry.
    SelfLoop,
    /// Jump to another installed trace's entry.
    Trace(u32),
    /// Back to the interpreter: no compiled successor.
    Interpreter,
}

/// A completed, installed trace (spec.md §3 "Trace record").
pub struct Trace {
    pub trace_no: u32,
    pub ir: IrBuffer,
    /// `nk < bias <= nins`: lowest constant index and highest instruction
    /// ref, both bias-relative.
    pub nk: Ref,
    pub nins: Ref,
    pub snapshots: SnapshotStore,
    pub mcode_ptr: usize,
    pub mcode_size: usize,
    pub loop_entry_offset: usize,
    pub link: LinkTarget,
    pub spadjust: i32,
    pub child_count: u32,
    pub starting_pc: usize,
    pub parent: Option<(u32, u32)>, // (parent trace_no, parent exit number)
}

impl Trace {
    /// Invariant 2 (spec.md §8): every snapshot's named refs are either
    /// below the bias or within `[bias, snapshot.first_ref]`.
    #[cfg(debug_assertions)]
    pub fn check_snapshot_ref_bounds(&self) -> bool {
        use crate::ir::ref_is_const;
        use crate::snapshot::SnapEntry;
        for i in 0..self.snapshots.len() {
            let snap = self.snapshots.get(i);
            for entry in self.snapshots.slots(i) {
                if let SnapEntry::Live(r) = *entry {
                    if !ref_is_const(r) && r > snap.first_ref {
                        return false;
                    }
                }
            }
        }
        true
    }
}

/// Trace table: owns every installed trace, indexed by trace number.
#[derive(Default)]
pub struct TraceTable {
    traces: Vec<Trace>,
}

impl TraceTable {
    pub fn new() -> Self {
        TraceTable { traces: Vec::new() }
    }

    pub fn install(&mut self, mut trace: Trace) -> u32 {
        let no = self.traces.len() as u32;
        trace.trace_no = no;
        self.traces.push(trace);
        no
    }

    pub fn get(&self, no: u32) -> Option<&Trace> {
        self.traces.get(no as usize)
    }

    pub fn get_mut(&mut self, no: u32) -> Option<&mut Trace> {
        self.traces.get_mut(no as usize)
    }

    pub fn len(&self) -> usize {
        self.traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }
}

/// Round-robin hot-counter penalty cache (`lj_jit.h`'s `HotPenalty`). When a
/// trace aborts, the starting bytecode's penalty counter is bumped so the
/// interpreter waits longer before trying to record it again.
pub const PENALTY_SLOTS: usize = 16;

#[derive(Clone, Copy, Debug)]
struct PenaltyEntry {
    pc: usize,
    val: u16,
    reason: crate::error::TraceError,
}

pub struct PenaltyCache {
    slots: [Option<PenaltyEntry>; PENALTY_SLOTS],
    next: usize,
}

impl PenaltyCache {
    pub fn new() -> Self {
        PenaltyCache { slots: [None; PENALTY_SLOTS], next: 0 }
    }

    /// Bump (or insert) the penalty for `pc`, doubling it up to a cap so
    /// repeated failures back off the retry rate.
    pub fn bump(&mut self, pc: usize, reason: crate::error::TraceError, base: u16, max: u16) -> u16 {
        if let Some(entry) = self.slots.iter_mut().flatten().find(|e| e.pc == pc) {
            entry.val = (entry.val.saturating_mul(2)).min(max);
            entry.reason = reason;
            return entry.val;
        }
        let slot = self.next;
        self.next = (self.next + 1) % PENALTY_SLOTS;
        self.slots[slot] = Some(PenaltyEntry { pc, val: base, reason });
        base
    }

    pub fn get(&self, pc: usize) -> Option<u16> {
        self.slots.iter().flatten().find(|e| e.pc == pc).map(|e| e.val)
    }
}

impl Default for PenaltyCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Backpropagation cache (`lj_jit.h`'s `BPropEntry`), used by narrowing
/// conversions (`TOINT`/`TOBIT`) to avoid re-deriving the same
/// int-vs-float decision repeatedly for the same key instruction.
pub const BPROP_SLOTS: usize = 16;

#[derive(Clone, Copy, Debug)]
struct BPropEntry {
    key: Ref,
    val: Ref,
    mode: u8,
}

pub struct BPropCache {
    slots: [Option<BPropEntry>; BPROP_SLOTS],
    next: usize,
}

impl BPropCache {
    pub fn new() -> Self {
        BPropCache { slots: [None; BPROP_SLOTS], next: 0 }
    }

    pub fn insert(&mut self, key: Ref, val: Ref, mode: u8) {
        let slot = self.next;
        self.next = (self.next + 1) % BPROP_SLOTS;
        self.slots[slot] = Some(BPropEntry { key, val, mode });
    }

    pub fn lookup(&self, key: Ref, mode: u8) -> Option<Ref> {
        self.slots.iter().flatten().find(|e| e.key == key && e.mode == mode).map(|e| e.val)
    }
}

impl Default for BPropCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn penalty_doubles_on_repeat() {
        let mut cache = PenaltyCache::new();
        let v1 = cache.bump(100, crate::error::TraceError::TypeInstability, 10, 1000);
        let v2 = cache.bump(100, crate::error::TraceError::TypeInstability, 10, 1000);
        assert_eq!(v1, 10);
        assert_eq!(v2, 20);
    }

    #[test]
    fn bprop_round_trips() {
        let mut cache = BPropCache::new();
        cache.insert(0x8005, 0x8006, 1);
        assert_eq!(cache.lookup(0x8005, 1), Some(0x8006));
        assert_eq!(cache.lookup(0x8005, 2), None);
    }

    #[test]
    fn trace_table_assigns_sequential_numbers() {
        let mut table = TraceTable::new();
        let t0 = Trace {
            trace_no: 0,
            ir: IrBuffer::new(),
            nk: 0,
            nins: crate::ir::REF_BASE,
            snapshots: SnapshotStore::new(),
            mcode_ptr: 0,
            mcode_size: 0,
            loop_entry_offset: 0,
            link: LinkTarget::Interpreter,
            spadjust: 0,
            child_count: 0,
            starting_pc: 0,
            parent: None,
        };
        let no = table.install(t0);
        assert_eq!(no, 0);
        assert_eq!(table.len(), 1);
    }
}
