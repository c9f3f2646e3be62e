//! Virtual filesystem and FAT32 driver for the memory-and-storage stack
//! (L5, L6).

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod fat32;
pub mod path;
pub mod vfs;

use alloc::boxed::Box;
use alloc::sync::Arc;

use bitflags::bitflags;

pub use vfs::{Fd, Vfs, VfsError, MAX_FS_DRIVERS, MAX_MOUNT_POINTS};

bitflags! {
    /// Flags passed to [`Vfs::open`], corresponding to the original's
    /// `O_RDONLY`/`O_WRONLY`/`O_RDWR`/`O_CREAT`/`O_APPEND`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Open for reading.
        const READ = 0b0000_0001;
        /// Open for writing.
        const WRITE = 0b0000_0010;
        /// Create the file if it doesn't exist. Not honored by any driver
        /// in this stack -- file creation is out of scope.
        const CREATE = 0b0000_0100;
        /// Append writes to the end of the file. Not honored: this stack
        /// has no file-extension support.
        const APPEND = 0b0000_1000;
    }
}

impl OpenFlags {
    /// `O_RDONLY` equivalent.
    pub const RDONLY: Self = Self::READ;
    /// `O_WRONLY` equivalent.
    pub const WRONLY: Self = Self::WRITE;
    /// `O_RDWR` equivalent.
    pub const RDWR: Self = Self::READ.union(Self::WRITE);
}

/// Errors returned by the VFS or a filesystem driver (FAT32, see
/// [`fat32`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// The boot sector's 0xAA55 trailing signature was missing.
    BadSignature,
    /// The boot sector parsed but isn't a valid FAT32 volume
    /// (`root_entry_count != 0` or `fat_size_16 != 0`).
    NotFat32,
    /// A path component does not exist.
    NotFound,
    /// A path component that should be a directory is a file.
    NotADirectory,
    /// A file path resolved to a directory.
    IsADirectory,
    /// The underlying block device returned an error.
    Io,
    /// A path passed to [`Vfs::open`]/[`Vfs::mount`] was not absolute.
    InvalidPath,
    /// [`Vfs::mount`] named a filesystem driver that was never registered.
    UnknownFilesystem,
    /// [`Vfs::register_filesystem`] was called after the driver table
    /// (`MAX_FS_DRIVERS` slots) filled up.
    TooManyFilesystems,
    /// [`Vfs::mount`] was called after the mount table (`MAX_MOUNT_POINTS`
    /// slots) filled up.
    TooManyMounts,
    /// [`Vfs::mount`] named a path that already has a live mount point.
    AlreadyMounted,
    /// [`Vfs::unmount`] named a path with no live mount point.
    NotMounted,
    /// A read/write/close was dispatched against an `fd` with no live
    /// handle.
    BadFd,
    /// `read` on a handle opened write-only, or `write` on a handle
    /// opened read-only.
    PermissionDenied,
}

/// A filesystem driver, identified by name, capable of mounting a block
/// device. Exactly one implementation exists in this stack ([`fat32::Fat32Driver`]),
/// but the VFS dispatches through this trait object so a second filesystem
/// could register itself the same way.
pub trait FileSystem: Send + Sync {
    /// The name used to select this driver in [`Vfs::mount`] (`"fat32"`).
    fn name(&self) -> &'static str;

    /// Mounts the block device registered at `device_id` (read and written
    /// via `hadron_drivers::bread`/`bwrite`, so every sector access is
    /// mediated by the block cache). `device_id` is expected to already be
    /// a partition overlay device (see `hadron-drivers::partition`), so no
    /// further LBA translation happens here.
    fn mount(&self, device_id: u8) -> Result<Arc<dyn Mount>, FsError>;
}

/// A mounted filesystem instance, capable of opening files by path
/// relative to its own root.
pub trait Mount: Send + Sync {
    /// Opens `path` (already stripped of its VFS mount prefix) with
    /// `flags`.
    fn open(&self, path: &str, flags: OpenFlags) -> Result<Box<dyn OpenFile>, FsError>;
}

/// A file opened through a [`Mount`]. Tracks its own read/write position;
/// per this stack's non-goals, only sequential access is supported -- there
/// is no seek.
pub trait OpenFile: Send + Sync {
    /// Reads up to `buf.len()` bytes starting at the file's current
    /// position, returning the number of bytes read (`0` at end of file).
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, FsError>;

    /// Writes `buf` at the file's current position. Only overwriting
    /// existing file data is supported; writes are clamped to the
    /// existing file size.
    fn write(&mut self, buf: &[u8]) -> Result<usize, FsError>;
}
