//! Error taxonomy for the trace compiler core (spec.md §7).
//!
//! Every fallible entry point into the core returns a [`TraceError`]. There
//! is no panic-based error path outside of `debug_assert!`-guarded invariant
//! checks (`BadRegAlloc`, which the spec calls "a fatal bug"). Callers
//! (recorder, trace manager) are expected to discard the in-progress
//! recording, bump the penalty counter for the starting bytecode, and
//! return control to the interpreter -- see [`crate::trace::PenaltyCache`].

use thiserror::Error;

/// Taxonomy of ways a compilation job can fail.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceError {
    // -- Resource exhaustion --------------------------------------------
    #[error("spill slot overflow: more than 256 spill slots requested")]
    SpillOverflow,

    #[error("snapshot overflow: snapshot budget of {limit} exceeded")]
    SnapOverflow { limit: u32 },

    #[error("PHI overflow: too many PHI candidates (limit {limit})")]
    PhiOverflow { limit: u32 },

    #[error("IR buffer overflow: instruction buffer exhausted")]
    IrOverflow,

    #[error("mcode overflow: trace ({needed} bytes) larger than one arena region")]
    McodeOverflow { needed: usize },

    #[error("mcode allocation failed: could not obtain more pages")]
    McodeAlloc,

    /// Retryable: the assembler should grow the arena and retry emission.
    #[error("mcode limit reached, retry after growing arena ({needed} bytes needed)")]
    McodeLimit { needed: usize },

    // -- Semantic ---------------------------------------------------------
    #[error("type instability: loop-carried type mismatch with no legal coercion")]
    TypeInstability,

    #[error("guard always fails: fold deduced a guard contradiction")]
    GuardAlwaysFails,

    /// The register allocator reached an internal state that should be
    /// unreachable. This is always a compiler bug, never a user-triggerable
    /// condition.
    #[error("register allocator invariant violated: {0}")]
    BadRegAlloc(&'static str),

    // -- Not yet implemented ----------------------------------------------
    #[error("side-trace register coalescing too complex for this parent state")]
    NyiCoalesce,

    #[error("PHI with a pre-existing spill slot is not supported")]
    NyiPhi,

    #[error("frame sync inside a GC step is not supported")]
    NyiGcFrame,

    #[error("IR opcode {0:?} has no assembler lowering")]
    NyiIrOp(crate::ir::Op),
}

impl TraceError {
    /// Whether the assembler job may be retried in place (growing the mcode
    /// arena) rather than being treated as a full trace abort.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TraceError::McodeLimit { .. })
    }
}

pub type Result<T> = std::result::Result<T, TraceError>;
