//! Configuration read once at the start of each compilation job (spec.md §6).
//!
//! Mirrors `lj_jit.h`'s `JIT_F_*` engine flags and `JIT_PARAMDEF` parameter
//! table: a bitflags word for booleans plus a small struct of tunables. There
//! is no persisted state -- a [`JitConfig`] is constructed fresh (or cloned)
//! per job and never written back to disk.

use bitflags::bitflags;

bitflags! {
    /// Optimization and CPU-feature flags, `opt_fold`..`opt_fuse` plus the
    /// CPU-feature detection bits from spec.md §6.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct OptFlags: u32 {
        const FOLD        = 1 << 0;
        const CSE         = 1 << 1;
        const DCE         = 1 << 2;
        const FWD         = 1 << 3;
        const DSE         = 1 << 4;
        const NARROW      = 1 << 5;
        const LOOP        = 1 << 6;
        const FUSE        = 1 << 7;

        // CPU-feature flags.
        const CMOV        = 1 << 16;
        const SSE2        = 1 << 17;
        const SSE4_1      = 1 << 18;
        const PREFER_IMUL = 1 << 19;
        const SPLIT_XMM   = 1 << 20;
        const LEA_AGU     = 1 << 21;
    }
}

impl OptFlags {
    /// `JIT_F_OPT_1`: fold + cse + dce.
    pub const LEVEL_1: OptFlags = OptFlags::FOLD
        .union(OptFlags::CSE)
        .union(OptFlags::DCE);

    /// `JIT_F_OPT_2`: level 1 + narrow + loop.
    pub const LEVEL_2: OptFlags =
        OptFlags::LEVEL_1.union(OptFlags::NARROW).union(OptFlags::LOOP);

    /// `JIT_F_OPT_3` / default: level 2 + fwd + dse + fuse.
    pub const LEVEL_3: OptFlags = OptFlags::LEVEL_2
        .union(OptFlags::FWD)
        .union(OptFlags::DSE)
        .union(OptFlags::FUSE);

    /// Named optimization level presets, matching `JIT_F_OPT_0..3`.
    pub fn level(n: u8) -> OptFlags {
        match n {
            0 => OptFlags::empty(),
            1 => OptFlags::LEVEL_1,
            2 => OptFlags::LEVEL_2,
            _ => OptFlags::LEVEL_3,
        }
    }
}

/// Numeric tunables, `JIT_PARAMDEF` in the original.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JitParams {
    pub maxtrace: u32,
    pub maxrecord: u32,
    pub maxirconst: u32,
    pub maxside: u32,
    pub maxsnap: u32,

    pub hotloop: u32,
    pub hotexit: u32,
    pub tryside: u32,

    pub instunroll: u32,
    pub loopunroll: u32,
    pub callunroll: u32,
    pub recunroll: u32,

    /// Size of each machine code arena region, in KiB.
    pub sizemcode: u32,
    /// Total cap on all arena allocation, in KiB.
    pub maxmcode: u32,
}

impl Default for JitParams {
    fn default() -> Self {
        JitParams {
            maxtrace: 1000,
            maxrecord: 2000,
            maxirconst: 500,
            maxside: 100,
            maxsnap: 100,
            hotloop: 57,
            hotexit: 10,
            tryside: 4,
            instunroll: 4,
            loopunroll: 7,
            callunroll: 3,
            recunroll: 0,
            sizemcode: 32,
            maxmcode: 512,
        }
    }
}

/// Full configuration for one compilation job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JitConfig {
    pub opt: OptFlags,
    pub params: JitParams,
}

impl Default for JitConfig {
    fn default() -> Self {
        JitConfig {
            opt: OptFlags::LEVEL_3,
            params: JitParams::default(),
        }
    }
}

impl JitConfig {
    pub fn enabled(&self, flag: OptFlags) -> bool {
        self.opt.contains(flag)
    }
}
