//! Bitmap-based physical frame allocator (L0).
//!
//! Each bit represents one 4 KiB frame; bit = 1 means allocated, bit = 0
//! means free. Allocation is first-fit word-level scanning with
//! `trailing_zeros()` (compiles to TZCNT/BSF on x86_64). Frames are
//! identity-addressed: this crate has no paging layer, so the address an
//! allocation returns is the address a caller reads and writes directly.
//!
//! Unlike the original bitmap allocator this is ported from, `free`
//! releases the *entire run* handed out by the matching `alloc` call, not
//! a single frame -- see the per-allocation run-length side table below.

use alloc::collections::BTreeMap;

use hadron_core::{kinfo, kwarn};

/// Size of one frame in bytes.
pub const FRAME_SIZE: usize = 4096;

const BITS_PER_WORD: usize = 32;

/// Errors returned by the frame allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// `alloc` was asked for zero frames.
    ZeroSize,
    /// No run of free frames long enough was found.
    OutOfMemory,
    /// `free` was called with an address that is not the start of a live
    /// allocation (covers both out-of-range and double-free).
    NotAllocated,
}

/// Point-in-time statistics for the frame allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    /// Total number of frames managed by the allocator.
    pub total: usize,
    /// Number of frames currently free.
    pub free: usize,
    /// Number of frames currently allocated.
    pub used: usize,
}

/// Bitmap-based first-fit physical frame allocator.
pub struct BitmapAllocator {
    base_addr: usize,
    total_frames: usize,
    free_frames: usize,
    bitmap: alloc::vec::Vec<u32>,
    /// Index of the first word that might contain a free bit, to avoid
    /// rescanning fully-allocated low memory on every call.
    search_hint: usize,
    /// Run length (in frames), keyed by the starting frame index, for every
    /// currently-live allocation. Populated at `alloc` time, consulted and
    /// removed at `free` time so a single `free(addr)` call releases the
    /// whole run handed out together.
    allocations: BTreeMap<usize, usize>,
}

impl BitmapAllocator {
    /// Creates an allocator managing `total_frames` frames starting at
    /// physical address `base_addr`. All frames start out free.
    pub fn new(base_addr: usize, total_frames: usize) -> Self {
        let words = total_frames.div_ceil(BITS_PER_WORD);
        kinfo!(
            "pmm: init base={:#x} total_frames={} words={}",
            base_addr,
            total_frames,
            words
        );
        Self {
            base_addr,
            total_frames,
            free_frames: total_frames,
            bitmap: alloc::vec![0u32; words],
            search_hint: 0,
            allocations: BTreeMap::new(),
        }
    }

    fn is_set(&self, index: usize) -> bool {
        self.bitmap[index / BITS_PER_WORD] & (1 << (index % BITS_PER_WORD)) != 0
    }

    fn set_run(&mut self, start: usize, count: usize) {
        for index in start..start + count {
            self.bitmap[index / BITS_PER_WORD] |= 1 << (index % BITS_PER_WORD);
        }
    }

    fn clear_run(&mut self, start: usize, count: usize) {
        for index in start..start + count {
            self.bitmap[index / BITS_PER_WORD] &= !(1 << (index % BITS_PER_WORD));
        }
    }

    /// Linear first-fit scan for `count` consecutive free frames.
    fn find_free_run(&self, count: usize) -> Option<usize> {
        let mut run_start = None;
        let mut run_len = 0;
        for index in self.search_hint * BITS_PER_WORD..self.total_frames {
            if self.is_set(index) {
                run_start = None;
                run_len = 0;
                continue;
            }
            if run_start.is_none() {
                run_start = Some(index);
            }
            run_len += 1;
            if run_len == count {
                return run_start;
            }
        }
        // The hint may have skipped a run straddling the boundary; on miss,
        // fall back to scanning from the start once.
        if self.search_hint != 0 {
            let mut run_start = None;
            let mut run_len = 0;
            for index in 0..self.search_hint * BITS_PER_WORD {
                if self.is_set(index) {
                    run_start = None;
                    run_len = 0;
                    continue;
                }
                if run_start.is_none() {
                    run_start = Some(index);
                }
                run_len += 1;
                if run_len == count {
                    return run_start;
                }
            }
        }
        None
    }

    /// Allocates `count` consecutive frames, returning the physical address
    /// of the first frame.
    pub fn alloc(&mut self, count: usize) -> Result<usize, FrameError> {
        if count == 0 {
            return Err(FrameError::ZeroSize);
        }
        if count > self.free_frames {
            return Err(FrameError::OutOfMemory);
        }
        let start = self.find_free_run(count).ok_or(FrameError::OutOfMemory)?;
        self.set_run(start, count);
        self.free_frames -= count;
        self.allocations.insert(start, count);
        self.search_hint = (start + count) / BITS_PER_WORD;
        Ok(self.base_addr + start * FRAME_SIZE)
    }

    /// Allocates a single frame.
    pub fn alloc_one(&mut self) -> Result<usize, FrameError> {
        self.alloc(1)
    }

    /// Frees the run of frames that was returned together by the `alloc`
    /// call that produced `addr`. `addr` must be the exact address returned
    /// by that call; an address that doesn't start a live allocation (out
    /// of range, already freed, or mid-run) is reported as `NotAllocated`
    /// and left untouched.
    pub fn free(&mut self, addr: usize) -> Result<(), FrameError> {
        if addr < self.base_addr {
            kwarn!("pmm: free of out-of-range address {:#x}", addr);
            return Err(FrameError::NotAllocated);
        }
        let offset = addr - self.base_addr;
        if offset % FRAME_SIZE != 0 {
            kwarn!("pmm: free of misaligned address {:#x}", addr);
            return Err(FrameError::NotAllocated);
        }
        let index = offset / FRAME_SIZE;
        let Some(&count) = self.allocations.get(&index) else {
            kwarn!("pmm: double-free or unknown address {:#x}", addr);
            return Err(FrameError::NotAllocated);
        };
        self.allocations.remove(&index);
        self.clear_run(index, count);
        self.free_frames += count;
        if index / BITS_PER_WORD < self.search_hint {
            self.search_hint = index / BITS_PER_WORD;
        }
        Ok(())
    }

    /// Returns current allocator statistics.
    pub fn stats(&self) -> FrameStats {
        FrameStats {
            total: self.total_frames,
            free: self.free_frames,
            used: self.total_frames - self.free_frames,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(total_frames: usize) -> BitmapAllocator {
        BitmapAllocator::new(0x1000, total_frames)
    }

    #[test]
    fn alloc_single_frame() {
        let mut pmm = allocator(16);
        let addr = pmm.alloc_one().unwrap();
        assert_eq!(addr, 0x1000);
        assert_eq!(pmm.stats(), FrameStats { total: 16, free: 15, used: 1 });
    }

    #[test]
    fn alloc_is_first_fit() {
        let mut pmm = allocator(16);
        let a = pmm.alloc_one().unwrap();
        let b = pmm.alloc_one().unwrap();
        assert_eq!(b, a + FRAME_SIZE as usize);
    }

    #[test]
    fn alloc_multi_frame_run() {
        let mut pmm = allocator(16);
        let addr = pmm.alloc(4).unwrap();
        assert_eq!(pmm.stats().used, 4);
        assert_eq!(addr, 0x1000);
    }

    #[test]
    fn free_releases_whole_run_not_one_frame() {
        let mut pmm = allocator(16);
        let addr = pmm.alloc(4).unwrap();
        pmm.free(addr).unwrap();
        assert_eq!(pmm.stats(), FrameStats { total: 16, free: 16, used: 0 });
        // The whole run must be available again as one allocation.
        let addr2 = pmm.alloc(4).unwrap();
        assert_eq!(addr2, addr);
    }

    #[test]
    fn free_unknown_address_is_rejected() {
        let mut pmm = allocator(16);
        assert_eq!(pmm.free(0x9999), Err(FrameError::NotAllocated));
    }

    #[test]
    fn double_free_is_rejected() {
        let mut pmm = allocator(16);
        let addr = pmm.alloc_one().unwrap();
        pmm.free(addr).unwrap();
        assert_eq!(pmm.free(addr), Err(FrameError::NotAllocated));
    }

    #[test]
    fn free_of_middle_of_run_is_rejected() {
        let mut pmm = allocator(16);
        let addr = pmm.alloc(4).unwrap();
        assert_eq!(
            pmm.free(addr + FRAME_SIZE as usize),
            Err(FrameError::NotAllocated)
        );
    }

    #[test]
    fn alloc_zero_is_rejected() {
        let mut pmm = allocator(16);
        assert_eq!(pmm.alloc(0), Err(FrameError::ZeroSize));
    }

    #[test]
    fn out_of_memory_when_exhausted() {
        let mut pmm = allocator(4);
        pmm.alloc(4).unwrap();
        assert_eq!(pmm.alloc(1), Err(FrameError::OutOfMemory));
    }

    #[test]
    fn alloc_after_free_reuses_frames() {
        let mut pmm = allocator(4);
        let a = pmm.alloc(2).unwrap();
        pmm.alloc(2).unwrap();
        pmm.free(a).unwrap();
        let c = pmm.alloc(2).unwrap();
        assert_eq!(c, a);
    }
}
