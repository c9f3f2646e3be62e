//! Fixed-size-class slab/pool allocator (L1).
//!
//! Sits above the frame allocator. Objects up to 2048 bytes are served
//! from one of nine pre-seeded size-class caches; anything larger
//! delegates directly to the frame allocator. Each slab is exactly one
//! frame, headed by a magic-tagged `repr(C)` struct so a bare address can
//! be classified as "inside a slab page" or not without any side table.
//!
//! The intra-page free list is intrusive: each free object's first two
//! bytes store the index of the next free object (`u16::MAX` means end
//! of list), matching the "arena + stable index" replacement for raw
//! pointer links noted in `DESIGN.md`.

use core::mem::size_of;
use core::ptr;

use hadron_core::{kinfo, kwarn};

use crate::pmm::{BitmapAllocator, FrameError, FRAME_SIZE};

/// `repr(C)` magic used to tag the first bytes of a slab page ("SLAB").
const SLAB_MAGIC: u32 = 0x534C_4142;

/// Pre-seeded size classes, smallest to largest.
pub const SIZE_CLASSES: [usize; 9] = [8, 16, 32, 64, 128, 256, 512, 1024, 2048];

/// Largest object size served by the slab allocator; above this, `alloc`
/// delegates straight to the frame allocator.
pub const DIRECT_ALLOC_CUTOFF: usize = 2048;

/// Fixed size of the cache table (mirrors `MAX_SLAB_CACHES` in the
/// original C allocator this is ported from).
const MAX_SLAB_CACHES: usize = 16;

const NO_NEXT: u16 = u16::MAX;

/// Errors returned by the slab allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabError {
    /// The frame allocator backing new slabs is exhausted.
    OutOfMemory,
    /// `add_slab` was asked to manage an object size the cache table has
    /// no room for (either it exceeds the direct-allocation cutoff, or
    /// all 16 cache slots are already in use by other size classes).
    SizeTooLarge,
}

/// Point-in-time byte accounting for the slab allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlabStats {
    /// Bytes currently handed out to callers (objects in full/partial slabs).
    pub allocated_bytes: usize,
    /// Bytes reserved in slab pages but not currently allocated.
    pub free_bytes: usize,
}

#[repr(C)]
struct SlabHeader {
    magic: u32,
    obj_size: u32,
    num_objs: u16,
    free_count: u16,
    free_head: u16,
    cache_index: u8,
}

/// Reads the slab header at the start of the page containing `addr`.
fn page_base(addr: usize) -> usize {
    addr & !(FRAME_SIZE - 1)
}

/// # Safety
/// `page` must be the base address of a page, readable for `size_of::<SlabHeader>()` bytes.
unsafe fn header_ptr(page: usize) -> *mut SlabHeader {
    page as *mut SlabHeader
}

fn objects_offset() -> usize {
    // Keep objects naturally aligned past the header.
    size_of::<SlabHeader>().next_multiple_of(8)
}

fn object_addr(page: usize, obj_size: usize, index: u16) -> usize {
    page + objects_offset() + index as usize * obj_size
}

/// Returns `true` if `addr` falls inside a page whose header carries the
/// slab magic tag -- i.e. whether `addr` belongs to the slab allocator
/// rather than being a raw frame-allocator allocation.
fn is_slab_page(page: usize) -> bool {
    // SAFETY: reading a u32 from the start of a frame-allocator-owned page
    // we already hold exclusive access to via the allocator lock.
    let magic = unsafe { ptr::read_unaligned(page as *const u32) };
    magic == SLAB_MAGIC
}

struct SlabCache {
    obj_size: usize,
    /// Base addresses of slabs with at least one free object.
    partial: alloc::vec::Vec<usize>,
    /// Base addresses of slabs with zero free objects.
    full: alloc::vec::Vec<usize>,
}

impl SlabCache {
    fn new(obj_size: usize) -> Self {
        Self {
            obj_size,
            partial: alloc::vec::Vec::new(),
            full: alloc::vec::Vec::new(),
        }
    }
}

/// Fixed-table-of-caches pool allocator.
pub struct SlabAllocator {
    caches: [Option<SlabCache>; MAX_SLAB_CACHES],
}

fn round_up_class(size: usize) -> Option<usize> {
    SIZE_CLASSES.into_iter().find(|&class| size <= class)
}

impl SlabAllocator {
    /// Creates a slab allocator with the nine default size classes
    /// pre-seeded (no slab pages are allocated yet -- the first `alloc`
    /// into a class creates its first slab lazily).
    pub fn new() -> Self {
        kinfo!("slab: init with {} default size classes", SIZE_CLASSES.len());
        let mut caches: [Option<SlabCache>; MAX_SLAB_CACHES] = Default::default();
        for (i, &class) in SIZE_CLASSES.iter().enumerate() {
            caches[i] = Some(SlabCache::new(class));
        }
        Self { caches }
    }

    fn find_cache_index(&self, obj_size: usize) -> Option<usize> {
        self.caches
            .iter()
            .position(|c| matches!(c, Some(cache) if cache.obj_size == obj_size))
    }

    fn find_free_cache_slot(&self) -> Option<usize> {
        self.caches.iter().position(|c| c.is_none())
    }

    /// Explicitly registers (or grows) the cache for `obj_size`. `alloc`
    /// calls this lazily on first use of a given size class; exposed
    /// publicly as a standalone operation to mirror the original
    /// allocator's `add_slab`.
    pub fn add_slab(
        &mut self,
        frames: &mut BitmapAllocator,
        obj_size: usize,
    ) -> Result<(), SlabError> {
        if obj_size == 0 || obj_size > DIRECT_ALLOC_CUTOFF {
            return Err(SlabError::SizeTooLarge);
        }
        let class = round_up_class(obj_size).ok_or(SlabError::SizeTooLarge)?;
        let cache_index = match self.find_cache_index(class) {
            Some(index) => index,
            None => {
                let slot = self.find_free_cache_slot().ok_or(SlabError::SizeTooLarge)?;
                self.caches[slot] = Some(SlabCache::new(class));
                slot
            }
        };
        self.grow_cache(frames, cache_index)
            .map_err(|_| SlabError::OutOfMemory)
    }

    fn grow_cache(
        &mut self,
        frames: &mut BitmapAllocator,
        cache_index: usize,
    ) -> Result<(), FrameError> {
        let page = frames.alloc_one()?;
        let cache = self.caches[cache_index].as_mut().expect("cache must exist");
        let obj_size = cache.obj_size;
        let num_objs = ((FRAME_SIZE - objects_offset()) / obj_size) as u16;

        // Lay out the intrusive free list: object i's first two bytes hold
        // the index of object i + 1, last object points to NO_NEXT.
        for i in 0..num_objs {
            let addr = object_addr(page, obj_size, i);
            let next = if i + 1 == num_objs { NO_NEXT } else { i + 1 };
            // SAFETY: addr is within the freshly allocated page, object_size >= 8.
            unsafe { ptr::write_unaligned(addr as *mut u16, next) };
        }

        // SAFETY: page is a freshly allocated, exclusively owned frame.
        unsafe {
            header_ptr(page).write(SlabHeader {
                magic: SLAB_MAGIC,
                obj_size: obj_size as u32,
                num_objs,
                free_count: num_objs,
                free_head: 0,
                cache_index: cache_index as u8,
            });
        }
        cache.partial.push(page);
        Ok(())
    }

    /// Allocates an object of `size` bytes, returning its address. Sizes
    /// larger than [`DIRECT_ALLOC_CUTOFF`] are served directly by the frame
    /// allocator (one or more whole frames).
    pub fn alloc(&mut self, frames: &mut BitmapAllocator, size: usize) -> Result<usize, SlabError> {
        if size == 0 {
            return Err(SlabError::SizeTooLarge);
        }
        if size > DIRECT_ALLOC_CUTOFF {
            let count = size.div_ceil(FRAME_SIZE);
            return frames.alloc(count).map_err(|_| SlabError::OutOfMemory);
        }
        let class = round_up_class(size).expect("size <= DIRECT_ALLOC_CUTOFF always has a class");
        let cache_index = match self.find_cache_index(class) {
            Some(index) => index,
            None => {
                let slot = self.find_free_cache_slot().ok_or(SlabError::SizeTooLarge)?;
                self.caches[slot] = Some(SlabCache::new(class));
                slot
            }
        };
        if self.caches[cache_index].as_ref().unwrap().partial.is_empty() {
            self.grow_cache(frames, cache_index)
                .map_err(|_| SlabError::OutOfMemory)?;
        }

        let cache = self.caches[cache_index].as_mut().unwrap();
        let page = *cache.partial.last().expect("just grew if empty");
        // SAFETY: page is a live slab page (just verified via partial list).
        let header = unsafe { &mut *header_ptr(page) };
        let obj_index = header.free_head;
        let addr = object_addr(page, header.obj_size as usize, obj_index);
        // SAFETY: addr holds the intrusive next-free index written at grow time
        // or at the previous free().
        header.free_head = unsafe { ptr::read_unaligned(addr as *const u16) };
        header.free_count -= 1;

        if header.free_count == 0 {
            cache.partial.pop();
            cache.full.push(page);
        }
        Ok(addr)
    }

    /// Frees an object previously returned by `alloc`. Pages that are not
    /// slab pages are assumed to be direct frame-allocator allocations and
    /// are freed via `frames.free` instead.
    pub fn free(&mut self, frames: &mut BitmapAllocator, addr: usize) -> Result<(), SlabError> {
        let page = page_base(addr);
        if !is_slab_page(page) {
            return frames.free(addr).map_err(|_| {
                kwarn!("slab: free of unknown address {:#x}", addr);
                SlabError::OutOfMemory
            });
        }

        // SAFETY: is_slab_page confirmed the magic tag is present.
        let header = unsafe { &mut *header_ptr(page) };
        let cache_index = header.cache_index as usize;
        let obj_size = header.obj_size as usize;
        let obj_index = ((addr - page - objects_offset()) / obj_size) as u16;

        // SAFETY: addr is inside the object area; write the intrusive link.
        unsafe { ptr::write_unaligned(addr as *mut u16, header.free_head) };
        header.free_head = obj_index;
        let was_full = header.free_count == 0;
        header.free_count += 1;

        let cache = self.caches[cache_index].as_mut().expect("cache must exist");
        if was_full {
            if let Some(pos) = cache.full.iter().position(|&p| p == page) {
                cache.full.remove(pos);
            }
            cache.partial.push(page);
        }

        if header.free_count == header.num_objs {
            // Keep one empty slab as a cushion; only release the page back
            // to the frame allocator if another slab remains for this cache.
            let other_slabs = cache.partial.len() + cache.full.len() - 1;
            if other_slabs > 0 {
                if let Some(pos) = cache.partial.iter().position(|&p| p == page) {
                    cache.partial.remove(pos);
                }
                frames.free(page).map_err(|_| SlabError::OutOfMemory)?;
            }
        }
        Ok(())
    }

    /// Returns byte-level accounting across every active cache.
    pub fn stats(&self) -> SlabStats {
        let mut allocated_bytes = 0;
        let mut free_bytes = 0;
        for cache in self.caches.iter().flatten() {
            for &page in cache.partial.iter().chain(cache.full.iter()) {
                // SAFETY: every listed page carries a live slab header.
                let header = unsafe { &*header_ptr(page) };
                let used = (header.num_objs - header.free_count) as usize;
                allocated_bytes += used * cache.obj_size;
                free_bytes += header.free_count as usize * cache.obj_size;
            }
        }
        SlabStats { allocated_bytes, free_bytes }
    }
}

impl Default for SlabAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (BitmapAllocator, SlabAllocator) {
        (BitmapAllocator::new(0x10_0000, 256), SlabAllocator::new())
    }

    #[test]
    fn alloc_small_object() {
        let (mut frames, mut slab) = setup();
        let addr = slab.alloc(&mut frames, 16).unwrap();
        assert_eq!(addr % 8, 0);
    }

    #[test]
    fn alloc_rounds_up_to_size_class() {
        let (mut frames, mut slab) = setup();
        let a = slab.alloc(&mut frames, 10).unwrap();
        let b = slab.alloc(&mut frames, 16).unwrap();
        // Both requests round up to the 16-byte class and share a slab.
        assert_eq!(page_base(a), page_base(b));
    }

    #[test]
    fn alloc_above_cutoff_delegates_to_frames() {
        let (mut frames, mut slab) = setup();
        let before = frames.stats().used;
        let addr = slab.alloc(&mut frames, 4096).unwrap();
        assert_eq!(addr, 0x10_0000);
        assert_eq!(frames.stats().used, before + 1);
    }

    #[test]
    fn free_reuses_slot() {
        let (mut frames, mut slab) = setup();
        let a = slab.alloc(&mut frames, 32).unwrap();
        slab.free(&mut frames, a).unwrap();
        let b = slab.alloc(&mut frames, 32).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn fully_freed_slab_releases_page_when_another_exists() {
        let (mut frames, mut slab) = setup();
        // 2048-byte objects: one page holds very few, force two slabs.
        let mut addrs = alloc::vec::Vec::new();
        loop {
            let a = slab.alloc(&mut frames, 2048).unwrap();
            let on_first_page = addrs.first().is_some_and(|&f| page_base(f) == page_base(a));
            addrs.push(a);
            if !on_first_page && addrs.len() > 1 {
                break;
            }
        }
        let used_before = frames.stats().used;
        // Free every object on the first page; with a second slab present,
        // the first slab's page must be returned to the frame allocator.
        let first_page = page_base(addrs[0]);
        let on_first: alloc::vec::Vec<usize> = addrs
            .iter()
            .copied()
            .filter(|&a| page_base(a) == first_page)
            .collect();
        for a in on_first {
            slab.free(&mut frames, a).unwrap();
        }
        assert!(frames.stats().used < used_before);
    }

    #[test]
    fn single_slab_cushion_is_kept() {
        let (mut frames, mut slab) = setup();
        let a = slab.alloc(&mut frames, 64).unwrap();
        let used_before = frames.stats().used;
        slab.free(&mut frames, a).unwrap();
        // Only slab for this class; its page must not be released.
        assert_eq!(frames.stats().used, used_before);
    }

    #[test]
    fn add_slab_rejects_oversized_request() {
        let (mut frames, mut slab) = setup();
        assert_eq!(
            slab.add_slab(&mut frames, 4096),
            Err(SlabError::SizeTooLarge)
        );
    }
}
