//! Driver subsystem API traits for the memory-and-storage stack.
//!
//! Defines the two interface traits the rest of the stack is built
//! against: [`BlockDevice`] for sector-addressed storage and
//! [`CharDevice`] for byte-stream devices. Both are synchronous --
//! there is no suspension point anywhere in this stack (see
//! `hadron-core`'s single-execution-context model) -- unlike the
//! kernel's driver API proper, which is `async`.

#![cfg_attr(not(test), no_std)]

pub mod block;

pub use block::{BlockDevice, CharDevice, IoError};
