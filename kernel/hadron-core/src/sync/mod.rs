//! Synchronization primitives for the kernel.
//!
//! Provides [`SpinLock`], suitable for use in `static` items and usable
//! before any allocator or scheduler is available.

mod spinlock;

pub use spinlock::{SpinLock, SpinLockGuard};
