//! Mount table, filesystem-driver registry, and handle table (L5).
//!
//! Ported from `original_source/fs/vfs.c`'s `find_mount_point`/`fs_mount`/
//! `fs_open`/`fs_read`/`fs_write` algorithm: longest mount-path-prefix
//! resolution with the root mount (`"/"`) matching everything, a
//! fixed-size driver table keyed by name, and a handle table that hands
//! out `fd`s monotonically from 3 upward. Unlike the donor's own
//! `kernel/fs/src/vfs.rs` (an async `Inode`-graph VFS with symlink
//! resolution), this stack has no directory enumeration or symlinks --
//! see `spec.md` §1 Non-goals -- so resolution only ever walks through
//! exactly one [`Mount`], never recursing through intermediate inodes.

extern crate alloc;

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use hadron_core::sync::SpinLock;

use crate::path;
use crate::{FileSystem, FsError, Mount, OpenFlags};

/// Maximum number of distinct filesystem driver names that can be
/// registered (`F_max` in `spec.md` §4.6).
pub const MAX_FS_DRIVERS: usize = 16;

/// Maximum number of simultaneously live mount points.
pub const MAX_MOUNT_POINTS: usize = 16;

/// First `fd` value handed out by [`Vfs::open`]; 0-2 are reserved for
/// stdio-like conventions this stack does not otherwise implement.
const FIRST_FD: Fd = 3;

/// A file descriptor: a small integer naming one live [`Handle`].
pub type Fd = i32;

/// Errors returned directly by VFS operations. [`FsError`] covers both
/// these and filesystem-driver-specific failures; this alias exists so
/// call sites that only care about VFS-level failures can read clearly.
pub type VfsError = FsError;

struct FsDriverSlot {
    driver: Arc<dyn FileSystem>,
}

struct MountPoint {
    path: String,
    fs_driver_id: usize,
    mount: Arc<dyn Mount>,
}

struct Handle {
    mount: Arc<dyn Mount>,
    file: alloc::boxed::Box<dyn crate::OpenFile>,
    flags: OpenFlags,
}

/// The virtual filesystem: driver registry, mount table, and open-file
/// handle table.
pub struct Vfs {
    drivers: Vec<Option<FsDriverSlot>>,
    mounts: Vec<MountPoint>,
    handles: Vec<(Fd, Handle)>,
    next_fd: Fd,
}

impl Vfs {
    fn new() -> Self {
        Self {
            drivers: (0..MAX_FS_DRIVERS).map(|_| None).collect(),
            mounts: Vec::new(),
            handles: Vec::new(),
            next_fd: FIRST_FD,
        }
    }

    /// Registers a filesystem driver under its own [`FileSystem::name`],
    /// returning the driver id later used with [`Vfs::mount`]'s `name`
    /// argument resolved internally. Fails if all [`MAX_FS_DRIVERS`] slots
    /// are full.
    pub fn register_filesystem(&mut self, driver: Arc<dyn FileSystem>) -> Result<usize, FsError> {
        let slot = self
            .drivers
            .iter()
            .position(Option::is_none)
            .ok_or(FsError::TooManyFilesystems)?;
        self.drivers[slot] = Some(FsDriverSlot { driver });
        Ok(slot)
    }

    fn find_driver(&self, name: &str) -> Option<(usize, &Arc<dyn FileSystem>)> {
        self.drivers.iter().enumerate().find_map(|(i, slot)| {
            slot.as_ref()
                .filter(|s| s.driver.name() == name)
                .map(|s| (i, &s.driver))
        })
    }

    /// Mounts the partition-overlay block device `device_id` at `path`
    /// using the filesystem driver registered under `name`.
    ///
    /// # Errors
    ///
    /// [`FsError::UnknownFilesystem`] if `name` was never registered,
    /// [`FsError::AlreadyMounted`] if `path` already has a mount point,
    /// [`FsError::TooManyMounts`] if the mount table is full, or whatever
    /// the driver's own `mount` returns (e.g. [`FsError::BadSignature`]).
    pub fn mount(&mut self, device_id: u8, name: &str, path: &str) -> Result<(), FsError> {
        if self.mounts.iter().any(|m| m.path == path) {
            return Err(FsError::AlreadyMounted);
        }
        if self.mounts.len() >= MAX_MOUNT_POINTS {
            return Err(FsError::TooManyMounts);
        }
        let (fs_driver_id, driver) = self.find_driver(name).ok_or(FsError::UnknownFilesystem)?;
        let driver = driver.clone();
        let mount = driver.mount(device_id)?;
        self.mounts.push(MountPoint {
            path: path.to_string(),
            fs_driver_id,
            mount,
        });
        Ok(())
    }

    /// Unmounts the filesystem mounted at `path`.
    ///
    /// # Errors
    ///
    /// [`FsError::NotMounted`] if no mount point has exactly this path.
    pub fn unmount(&mut self, path: &str) -> Result<(), FsError> {
        let pos = self
            .mounts
            .iter()
            .position(|m| m.path == path)
            .ok_or(FsError::NotMounted)?;
        self.mounts.remove(pos);
        Ok(())
    }

    fn find_mount_point(&self, abs_path: &str) -> Result<&MountPoint, FsError> {
        let mount_path =
            path::longest_prefix_match(abs_path, self.mounts.iter().map(|m| m.path.as_str()))
                .ok_or(FsError::NotFound)?;
        self.mounts
            .iter()
            .find(|m| m.path == mount_path)
            .ok_or(FsError::NotFound)
    }

    /// Opens `path` (must be absolute) with `flags`, resolving the
    /// longest-matching mount point and delegating the relative path to
    /// that mount's driver.
    ///
    /// # Errors
    ///
    /// [`FsError::InvalidPath`] if `path` is not absolute,
    /// [`FsError::NotFound`] if no mount point matches, or whatever the
    /// driver's own `open` returns. On driver failure no handle is
    /// allocated.
    pub fn open(&mut self, abs_path: &str, flags: OpenFlags) -> Result<Fd, FsError> {
        if !path::is_absolute(abs_path) {
            return Err(FsError::InvalidPath);
        }
        let mount_point = self.find_mount_point(abs_path)?;
        let mount_path = mount_point.path.clone();
        let mount = mount_point.mount.clone();

        let mut rel = path::strip_mount_prefix(abs_path, &mount_path);
        if rel.is_empty() {
            rel = "/";
        }
        let file = mount.open(rel, flags)?;

        let fd = self.next_fd;
        self.next_fd += 1;
        self.handles.push((fd, Handle { mount, file, flags }));
        Ok(fd)
    }

    fn find_handle(&self, fd: Fd) -> Result<usize, FsError> {
        self.handles.iter().position(|(h_fd, _)| *h_fd == fd).ok_or(FsError::BadFd)
    }

    /// Closes `fd`, releasing its handle. The handle's `fd` value is never
    /// reused.
    ///
    /// # Errors
    ///
    /// [`FsError::BadFd`] if `fd` does not name a live handle.
    pub fn close(&mut self, fd: Fd) -> Result<(), FsError> {
        let index = self.find_handle(fd)?;
        self.handles.remove(index);
        Ok(())
    }

    /// Reads up to `buf.len()` bytes from `fd` into `buf`, returning the
    /// number of bytes read.
    ///
    /// # Errors
    ///
    /// [`FsError::BadFd`] if `fd` does not name a live handle,
    /// [`FsError::PermissionDenied`] if the handle was opened without
    /// [`OpenFlags::READ`], or whatever the driver's own `read` returns.
    pub fn read(&mut self, fd: Fd, buf: &mut [u8]) -> Result<usize, FsError> {
        let index = self.find_handle(fd)?;
        let (_, handle) = &mut self.handles[index];
        if !handle.flags.contains(OpenFlags::READ) {
            return Err(FsError::PermissionDenied);
        }
        handle.file.read(buf)
    }

    /// Writes `buf` to `fd`, returning the number of bytes actually
    /// written.
    ///
    /// # Errors
    ///
    /// [`FsError::BadFd`] if `fd` does not name a live handle,
    /// [`FsError::PermissionDenied`] if the handle was opened without
    /// [`OpenFlags::WRITE`], or whatever the driver's own `write` returns.
    pub fn write(&mut self, fd: Fd, buf: &[u8]) -> Result<usize, FsError> {
        let index = self.find_handle(fd)?;
        let (_, handle) = &mut self.handles[index];
        if !handle.flags.contains(OpenFlags::WRITE) {
            return Err(FsError::PermissionDenied);
        }
        handle.file.write(buf)
    }

    /// Returns the number of currently live mount points, for diagnostics
    /// and tests.
    #[must_use]
    pub fn mount_count(&self) -> usize {
        self.mounts.len()
    }

    /// Returns the number of currently live file handles, for diagnostics
    /// and tests.
    #[must_use]
    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }
}

static VFS: SpinLock<Option<Vfs>> = SpinLock::new(None);

/// Initializes the global VFS. Must be called exactly once before
/// [`with_vfs`]/[`with_vfs_mut`].
pub fn init() {
    *VFS.lock() = Some(Vfs::new());
}

/// Runs `f` with a shared reference to the global VFS.
///
/// # Panics
///
/// Panics if [`init`] has not been called yet.
pub fn with_vfs<R>(f: impl FnOnce(&Vfs) -> R) -> R {
    let guard = VFS.lock();
    f(guard.as_ref().expect("hadron_fs::vfs::init was not called"))
}

/// Runs `f` with a mutable reference to the global VFS.
///
/// # Panics
///
/// Panics if [`init`] has not been called yet.
pub fn with_vfs_mut<R>(f: impl FnOnce(&mut Vfs) -> R) -> R {
    let mut guard = VFS.lock();
    f(guard.as_mut().expect("hadron_fs::vfs::init was not called"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Mount, OpenFile};
    use alloc::boxed::Box;
    use alloc::vec::Vec as StdVec;

    struct StubFile {
        data: StdVec<u8>,
        pos: usize,
    }

    impl OpenFile for StubFile {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize, FsError> {
            let remaining = self.data.len() - self.pos;
            let n = remaining.min(buf.len());
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }

        fn write(&mut self, buf: &[u8]) -> Result<usize, FsError> {
            let remaining = self.data.len() - self.pos;
            let n = remaining.min(buf.len());
            self.data[self.pos..self.pos + n].copy_from_slice(&buf[..n]);
            self.pos += n;
            Ok(n)
        }
    }

    struct StubMount;
    impl Mount for StubMount {
        fn open(&self, path: &str, _flags: OpenFlags) -> Result<Box<dyn OpenFile>, FsError> {
            if path == "missing" {
                return Err(FsError::NotFound);
            }
            Ok(Box::new(StubFile { data: alloc::vec![b'h', b'i'], pos: 0 }))
        }
    }

    struct StubFs;
    impl FileSystem for StubFs {
        fn name(&self) -> &'static str {
            "stubfs"
        }
        fn mount(&self, _device_id: u8) -> Result<Arc<dyn Mount>, FsError> {
            Ok(Arc::new(StubMount))
        }
    }

    #[test]
    fn register_mount_open_read() {
        let mut vfs = Vfs::new();
        vfs.register_filesystem(Arc::new(StubFs)).unwrap();
        vfs.mount(0, "stubfs", "/").unwrap();
        let fd = vfs.open("/file", OpenFlags::RDONLY).unwrap();
        assert_eq!(fd, FIRST_FD);
        let mut buf = [0u8; 8];
        let n = vfs.read(fd, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hi");
        vfs.close(fd).unwrap();
        assert_eq!(vfs.handle_count(), 0);
    }

    #[test]
    fn fd_allocation_is_monotonic() {
        let mut vfs = Vfs::new();
        vfs.register_filesystem(Arc::new(StubFs)).unwrap();
        vfs.mount(0, "stubfs", "/").unwrap();
        let a = vfs.open("/a", OpenFlags::RDONLY).unwrap();
        let b = vfs.open("/b", OpenFlags::RDONLY).unwrap();
        assert_eq!(b, a + 1);
    }

    #[test]
    fn failed_open_does_not_leak_a_handle() {
        let mut vfs = Vfs::new();
        vfs.register_filesystem(Arc::new(StubFs)).unwrap();
        vfs.mount(0, "stubfs", "/").unwrap();
        assert_eq!(vfs.open("/missing", OpenFlags::RDONLY), Err(FsError::NotFound));
        assert_eq!(vfs.handle_count(), 0);
    }

    #[test]
    fn write_on_read_only_handle_is_denied() {
        let mut vfs = Vfs::new();
        vfs.register_filesystem(Arc::new(StubFs)).unwrap();
        vfs.mount(0, "stubfs", "/").unwrap();
        let fd = vfs.open("/file", OpenFlags::RDONLY).unwrap();
        assert_eq!(vfs.write(fd, b"x"), Err(FsError::PermissionDenied));
    }

    #[test]
    fn read_on_write_only_handle_is_denied() {
        let mut vfs = Vfs::new();
        vfs.register_filesystem(Arc::new(StubFs)).unwrap();
        vfs.mount(0, "stubfs", "/").unwrap();
        let fd = vfs.open("/file", OpenFlags::WRONLY).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(vfs.read(fd, &mut buf), Err(FsError::PermissionDenied));
    }

    #[test]
    fn duplicate_mount_path_rejected() {
        let mut vfs = Vfs::new();
        vfs.register_filesystem(Arc::new(StubFs)).unwrap();
        vfs.mount(0, "stubfs", "/").unwrap();
        assert_eq!(vfs.mount(1, "stubfs", "/"), Err(FsError::AlreadyMounted));
    }

    #[test]
    fn mount_unknown_driver_rejected() {
        let mut vfs = Vfs::new();
        assert_eq!(vfs.mount(0, "nope", "/"), Err(FsError::UnknownFilesystem));
    }

    #[test]
    fn unmount_then_open_fails() {
        let mut vfs = Vfs::new();
        vfs.register_filesystem(Arc::new(StubFs)).unwrap();
        vfs.mount(0, "stubfs", "/").unwrap();
        vfs.unmount("/").unwrap();
        assert_eq!(vfs.open("/file", OpenFlags::RDONLY), Err(FsError::NotFound));
    }

    #[test]
    fn operating_on_closed_fd_is_bad_fd() {
        let mut vfs = Vfs::new();
        vfs.register_filesystem(Arc::new(StubFs)).unwrap();
        vfs.mount(0, "stubfs", "/").unwrap();
        let fd = vfs.open("/file", OpenFlags::RDONLY).unwrap();
        vfs.close(fd).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(vfs.read(fd, &mut buf), Err(FsError::BadFd));
    }

    #[test]
    fn longest_prefix_mount_wins() {
        let mut vfs = Vfs::new();
        vfs.register_filesystem(Arc::new(StubFs)).unwrap();
        vfs.mount(0, "stubfs", "/").unwrap();
        vfs.mount(1, "stubfs", "/mnt").unwrap();
        // Both mounts would resolve; `/mnt/file` must dispatch through the
        // more specific `/mnt` mount rather than falling through to `/`.
        let fd = vfs.open("/mnt/file", OpenFlags::RDONLY).unwrap();
        vfs.close(fd).unwrap();
    }
}
