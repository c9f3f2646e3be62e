//! Device registry, block cache, and partition overlay for the
//! memory-and-storage stack (L2, L3, L4).
//!
//! Exposes one pair of global statics -- the device registry and the
//! block cache that mediates every `bread`/`bwrite` against it -- behind
//! `with_registry_mut`/`bread`/`bwrite` free functions, mirroring the
//! `hadron_mm::with_frames`/`kalloc`/`kfree` idiom one layer down. Callers
//! above this crate (the partition overlay's own scan, the VFS, the
//! FAT32 driver) never touch a `BlockCache` or `DeviceRegistry` directly;
//! they go through [`bread`]/[`bwrite`] and get cache mediation for free.
//! The cache's own `mark_dirty`/`flush`/`invalidate` operations (`spec.md`
//! §4.4) are reachable the same way, as [`mark_dirty`]/[`flush`]/
//! [`invalidate`], so the write-through default is a policy choice a
//! caller can still override one block at a time, not a hole in the
//! wiring.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod block;
pub mod cache;
pub mod partition;
pub mod registry;

use hadron_core::sync::SpinLock;

pub use cache::{BlockCache, CacheStats, CACHE_BLOCK_SIZE, CACHE_MAX_ENTRIES};
pub use partition::{scan_and_register, PartitionDevice, PartitionInfo, FIRST_PARTITION_DEVICE_ID};
pub use registry::{DeviceError, DeviceRegistry, MAX_DEVICE_ID};

static REGISTRY: SpinLock<Option<DeviceRegistry>> = SpinLock::new(None);
static CACHE: SpinLock<Option<BlockCache>> = SpinLock::new(None);

/// Initializes the global device registry and block cache. Must be called
/// exactly once before [`with_registry_mut`], [`bread`], or [`bwrite`].
pub fn init() {
    *REGISTRY.lock() = Some(DeviceRegistry::new());
    *CACHE.lock() = Some(BlockCache::new());
}

/// Runs `f` with exclusive access to the global device registry, e.g. to
/// register a new block or char device.
///
/// # Panics
///
/// Panics if [`init`] has not been called yet.
pub fn with_registry_mut<R>(f: impl FnOnce(&mut DeviceRegistry) -> R) -> R {
    let mut guard = REGISTRY.lock();
    f(guard.as_mut().expect("hadron_drivers::init was not called"))
}

/// Reads one block from `device_id` at `sector`. Requests of exactly
/// [`CACHE_BLOCK_SIZE`] bytes are served through the block cache (hit or
/// miss-and-insert); any other length bypasses the cache and reads
/// straight through the registry, per `spec.md` §4.4.
///
/// # Panics
///
/// Panics if [`init`] has not been called yet.
pub fn bread(device_id: u8, sector: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
    let registry_guard = REGISTRY.lock();
    let registry = registry_guard.as_ref().expect("hadron_drivers::init was not called");
    if buf.len() == CACHE_BLOCK_SIZE {
        let mut cache_guard = CACHE.lock();
        let cache = cache_guard.as_mut().expect("hadron_drivers::init was not called");
        cache.read(registry, device_id, sector, buf)
    } else {
        registry.bread(device_id, sector, buf)
    }
}

/// Writes one block to `device_id` at `sector`. Requests of exactly
/// [`CACHE_BLOCK_SIZE`] bytes go through the cache's write-through policy;
/// any other length bypasses the cache.
///
/// # Panics
///
/// Panics if [`init`] has not been called yet.
pub fn bwrite(device_id: u8, sector: u64, buf: &[u8]) -> Result<(), DeviceError> {
    let registry_guard = REGISTRY.lock();
    let registry = registry_guard.as_ref().expect("hadron_drivers::init was not called");
    if buf.len() == CACHE_BLOCK_SIZE {
        let mut cache_guard = CACHE.lock();
        let cache = cache_guard.as_mut().expect("hadron_drivers::init was not called");
        cache.write(registry, device_id, sector, buf)
    } else {
        registry.bwrite(device_id, sector, buf)
    }
}

/// Returns current block-cache hit/miss/entry-count statistics.
///
/// # Panics
///
/// Panics if [`init`] has not been called yet.
pub fn cache_stats() -> CacheStats {
    let cache_guard = CACHE.lock();
    cache_guard.as_ref().expect("hadron_drivers::init was not called").stats()
}

/// Marks the cached block for `(device_id, sector)` dirty and moves it to
/// the head of the LRU list, without performing any I/O. A no-op if the
/// block isn't currently resident.
///
/// # Panics
///
/// Panics if [`init`] has not been called yet.
pub fn mark_dirty(device_id: u8, sector: u64) {
    let mut cache_guard = CACHE.lock();
    let cache = cache_guard.as_mut().expect("hadron_drivers::init was not called");
    cache.mark_dirty(device_id, sector);
}

/// Writes back every dirty entry in the global block cache, returning the
/// number of entries written.
///
/// # Panics
///
/// Panics if [`init`] has not been called yet.
pub fn flush() -> usize {
    let registry_guard = REGISTRY.lock();
    let registry = registry_guard.as_ref().expect("hadron_drivers::init was not called");
    let mut cache_guard = CACHE.lock();
    let cache = cache_guard.as_mut().expect("hadron_drivers::init was not called");
    cache.flush(registry)
}

/// Writes back (if dirty) and evicts the cached block for
/// `(device_id, sector)`, if resident.
///
/// # Panics
///
/// Panics if [`init`] has not been called yet.
pub fn invalidate(device_id: u8, sector: u64) -> Result<(), DeviceError> {
    let registry_guard = REGISTRY.lock();
    let registry = registry_guard.as_ref().expect("hadron_drivers::init was not called");
    let mut cache_guard = CACHE.lock();
    let cache = cache_guard.as_mut().expect("hadron_drivers::init was not called");
    cache.invalidate(registry, device_id, sector)
}
