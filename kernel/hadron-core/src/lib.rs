//! Core library for the kernel's memory-and-storage stack.
//!
//! Provides the two facilities every layer above is built on: a
//! spin-based mutual-exclusion lock suitable for `static` globals
//! initialized before any scheduler exists, and a leveled logging
//! macro family that is silent until a sink is registered.

#![cfg_attr(not(test), no_std)]

pub mod log;
pub mod sync;
