//! Machine-code arena (spec.md §4.2), grounded on `lj_mcode.c`.
//!
//! The arena is a linked list of fixed-size regions. Exactly one region is
//! "current"; within it a single page-granular protection state is tracked
//! by a cache so repeated `reserve`/`commit` cycles don't re-syscall when
//! the protection hasn't actually changed. Emission fills a region
//! back-to-front (`top` downward toward `bot`), matching the backward
//! assembler's instruction order.

use log::{debug, warn};

use crate::error::{Result, TraceError};

/// Page protection states a region can be in. `Rwx` only exists when the
/// `rwx-mcode` feature is enabled; it trades W^X safety for fewer syscalls.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Protection {
    /// Writable, not executable: the state during code emission.
    ReadWrite,
    /// Executable, not writable: the state while a trace may run.
    ReadExecute,
    /// Writable and executable at once. Only reachable with `rwx-mcode`.
    ReadWriteExecute,
}

/// One fixed-size region of the arena, forming a linked list (`MCLink` in
/// the original).
struct Region {
    base: usize,
    size: usize,
    /// Current write cursor; emission proceeds downward from `top`.
    top: usize,
    next: Option<Box<Region>>,
}

/// 64-byte red zone: the assembler may emit this many bytes past the last
/// limit check without re-validating against `bot`.
pub const RED_ZONE: usize = 64;

/// The machine-code arena. Owns a linked list of regions and tracks the
/// currently-writable one to avoid redundant protection syscalls.
pub struct McodeArena {
    /// Head of the region list; `None` until the first reservation.
    head: Option<Box<Region>>,
    /// Protection of the region at `head`, cached so repeated `reserve`s
    /// against an already-writable region skip the syscall.
    prot: Protection,
    region_size: usize,
    max_total: usize,
    total_allocated: usize,
}

impl McodeArena {
    pub fn new(region_size_kib: u32, max_mcode_kib: u32) -> Self {
        McodeArena {
            head: None,
            prot: Protection::ReadExecute,
            region_size: region_size_kib as usize * 1024,
            max_total: max_mcode_kib as usize * 1024,
            total_allocated: 0,
        }
    }

    /// Allocate a fresh region and push it onto the list, failing with
    /// `McodeAlloc` if the total cap would be exceeded.
    fn allocate_region(&mut self) -> Result<()> {
        if self.total_allocated + self.region_size > self.max_total {
            warn!(
                "mcode arena: refusing to grow past cap ({} + {} > {})",
                self.total_allocated, self.region_size, self.max_total
            );
            return Err(TraceError::McodeAlloc);
        }
        // Host integration point: in a real embedding this calls mmap/
        // VirtualAlloc. This core tracks only offsets/bookkeeping, not an
        // actual mapping -- see `extern_api::HostAllocator`.
        let base = self.total_allocated; // placeholder address space
        let region = Box::new(Region {
            base,
            size: self.region_size,
            top: base + self.region_size,
            next: self.head.take(),
        });
        self.head = Some(region);
        self.prot = Protection::ReadWrite;
        self.total_allocated += self.region_size;
        debug!("mcode arena: allocated region of {} bytes at offset {}", self.region_size, base);
        Ok(())
    }

    /// `reserve() -> (top, limit)`: return the current writable top and the
    /// lowest safe address including the red zone, allocating a region
    /// lazily on first use.
    pub fn reserve(&mut self) -> Result<(usize, usize)> {
        if self.head.is_none() {
            self.allocate_region()?;
        }
        self.protect(Protection::ReadWrite);
        let region = self.head.as_ref().ok_or(TraceError::McodeAlloc)?;
        Ok((region.top, region.base + RED_ZONE))
    }

    /// `commit(new_top)`: shrink the writable window and transition to
    /// executable-only.
    pub fn commit(&mut self, new_top: usize) {
        if let Some(region) = self.head.as_mut() {
            debug_assert!(new_top <= region.top, "commit must shrink the writable window");
            region.top = new_top;
        }
        self.protect(Protection::ReadExecute);
    }

    /// `abort()`: restore executable-only protection without committing.
    pub fn abort(&mut self) {
        self.protect(Protection::ReadExecute);
    }

    /// `limit_err(needed)`: the assembler crossed the red zone. Try to grow
    /// into a new region (retryable) or give up with `McodeOverflow` if a
    /// single trace can never fit one region.
    pub fn limit_err(&mut self, needed: usize) -> TraceError {
        if needed > self.region_size - RED_ZONE {
            return TraceError::McodeOverflow { needed };
        }
        match self.allocate_region() {
            Ok(()) => TraceError::McodeLimit { needed },
            Err(e) => e,
        }
    }

    /// `patch_window(ptr) -> handle`: temporarily reopen the region
    /// containing `ptr` for writing so an installed trace's exit jump can be
    /// patched. Returns an opaque handle to pass to `patch_close`.
    pub fn patch_window(&mut self, ptr: usize) -> Result<PatchHandle> {
        let mut cur = self.head.as_deref_mut();
        while let Some(region) = cur {
            if ptr >= region.base && ptr < region.base + region.size {
                self.protect(Protection::ReadWrite);
                return Ok(PatchHandle { region_base: region.base });
            }
            cur = region.next.as_deref_mut();
        }
        Err(TraceError::McodeAlloc)
    }

    pub fn patch_close(&mut self, _handle: PatchHandle) {
        self.protect(Protection::ReadExecute);
    }

    /// Protection-cache pattern from `lj_mcode.c`'s `mcode_protect`: skip
    /// the syscall if the cached state already matches.
    fn protect(&mut self, want: Protection) {
        if self.prot == want {
            return;
        }
        self.prot = want;
        // Host integration point: mprotect/VirtualProtect call happens here
        // in a real embedding.
    }

    #[cfg(feature = "rwx-mcode")]
    pub fn enable_rwx(&mut self) {
        self.prot = Protection::ReadWriteExecute;
    }
}

/// Opaque token returned by `patch_window`, required by `patch_close`.
pub struct PatchHandle {
    region_base: usize,
}

impl PatchHandle {
    pub fn region_base(&self) -> usize {
        self.region_base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_allocates_lazily() {
        let mut arena = McodeArena::new(32, 512);
        assert!(arena.head.is_none());
        let (top, limit) = arena.reserve().unwrap();
        assert!(top > limit);
    }

    #[test]
    fn commit_shrinks_top() {
        let mut arena = McodeArena::new(32, 512);
        let (top, _) = arena.reserve().unwrap();
        arena.commit(top - 16);
        assert_eq!(arena.head.as_ref().unwrap().top, top - 16);
    }

    #[test]
    fn cap_exceeded_is_alloc_error() {
        let mut arena = McodeArena::new(32, 32);
        arena.reserve().unwrap();
        let err = arena.limit_err(8);
        assert_eq!(err, TraceError::McodeAlloc);
    }

    #[test]
    fn oversized_trace_is_overflow() {
        let mut arena = McodeArena::new(32, 512);
        arena.reserve().unwrap();
        let err = arena.limit_err(32 * 1024);
        assert_eq!(err, TraceError::McodeOverflow { needed: 32 * 1024 });
    }
}
