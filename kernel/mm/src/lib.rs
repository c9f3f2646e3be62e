//! Physical frame allocator and slab allocator for the memory-and-storage
//! stack (L0, L1).
//!
//! Both allocators are plain data structures guarded by one global
//! [`SpinLock`](hadron_core::sync::SpinLock) each, initialized once via
//! `init` and accessed thereafter through `with`/`with_mut` closures --
//! no lock guard is ever exposed past the closure that produced it.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod pmm;
pub mod slab;

use hadron_core::sync::SpinLock;

pub use pmm::{BitmapAllocator, FrameError, FrameStats, FRAME_SIZE};
pub use slab::{SlabAllocator, SlabError, SlabStats};

static FRAMES: SpinLock<Option<BitmapAllocator>> = SpinLock::new(None);
static SLABS: SpinLock<Option<SlabAllocator>> = SpinLock::new(None);

/// Initializes both allocators over the given physical memory range.
/// Must be called exactly once before any other function in this crate.
pub fn init(base_addr: usize, total_frames: usize) {
    *FRAMES.lock() = Some(BitmapAllocator::new(base_addr, total_frames));
    *SLABS.lock() = Some(SlabAllocator::new());
}

/// Runs `f` with exclusive access to the frame allocator.
///
/// # Panics
///
/// Panics if [`init`] has not been called yet.
pub fn with_frames<R>(f: impl FnOnce(&mut BitmapAllocator) -> R) -> R {
    let mut guard = FRAMES.lock();
    f(guard.as_mut().expect("hadron_mm::init was not called"))
}

/// Allocates an object of `size` bytes from the slab allocator, falling
/// back to the frame allocator directly above [`slab::DIRECT_ALLOC_CUTOFF`].
///
/// # Panics
///
/// Panics if [`init`] has not been called yet.
pub fn kalloc(size: usize) -> Result<usize, SlabError> {
    let mut frames_guard = FRAMES.lock();
    let frames = frames_guard.as_mut().expect("hadron_mm::init was not called");
    let mut slabs_guard = SLABS.lock();
    let slabs = slabs_guard.as_mut().expect("hadron_mm::init was not called");
    slabs.alloc(frames, size)
}

/// Frees an object previously returned by [`kalloc`].
///
/// # Panics
///
/// Panics if [`init`] has not been called yet.
pub fn kfree(addr: usize) -> Result<(), SlabError> {
    let mut frames_guard = FRAMES.lock();
    let frames = frames_guard.as_mut().expect("hadron_mm::init was not called");
    let mut slabs_guard = SLABS.lock();
    let slabs = slabs_guard.as_mut().expect("hadron_mm::init was not called");
    slabs.free(frames, addr)
}

/// Registers (or grows) the slab cache for `obj_size` without allocating
/// an object from it.
///
/// # Panics
///
/// Panics if [`init`] has not been called yet.
pub fn add_slab(obj_size: usize) -> Result<(), SlabError> {
    let mut frames_guard = FRAMES.lock();
    let frames = frames_guard.as_mut().expect("hadron_mm::init was not called");
    let mut slabs_guard = SLABS.lock();
    let slabs = slabs_guard.as_mut().expect("hadron_mm::init was not called");
    slabs.add_slab(frames, obj_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kalloc_kfree_roundtrip() {
        init(0x20_0000, 64);
        let addr = kalloc(32).unwrap();
        kfree(addr).unwrap();
        let addr2 = kalloc(32).unwrap();
        assert_eq!(addr, addr2);
    }
}
