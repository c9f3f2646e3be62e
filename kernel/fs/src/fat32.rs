//! FAT32 filesystem driver (L6).
//!
//! Implements the [`FileSystem`]/[`Mount`]/[`OpenFile`] vtables against
//! the block layer's global `bread`/`bwrite` (see `hadron-drivers`),
//! which already routes through the LRU block cache. Ported from
//! `original_source/fs/fat32.c`'s `read_fat_entry`/`name_to_83`/
//! `compare_83`/`find_in_directory` algorithm and
//! `original_source/include/fat32.h`'s on-disk struct layout; the
//! original's single static scratch-cluster buffer shared by every open
//! file is moved into per-mount state here (`spec.md` §9's "static
//! cluster buffer" pattern note), since a second mounted volume must not
//! share one buffer with the first.

extern crate alloc;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use hadron_core::sync::SpinLock;

use crate::{FileSystem, FsError, Mount, OpenFile, OpenFlags};

const BOOT_SIGNATURE: u16 = 0xAA55;
const DIR_ENTRY_SIZE: usize = 32;
const FAT_ENTRY_SIZE: u32 = 4;
const FAT_ENTRY_MASK: u32 = 0x0FFF_FFFF;
const END_OF_CHAIN_MIN: u32 = 0x0FFF_FFF8;

const ATTR_VOLUME_ID: u8 = 0x08;
const ATTR_DIRECTORY: u8 = 0x10;
const ATTR_LONG_NAME: u8 = 0x0F;

const DIR_ENTRY_FREE: u8 = 0x00;
const DIR_ENTRY_DELETED: u8 = 0xE5;

/// Boot-sector-derived geometry of a mounted FAT32 volume, computed once
/// at mount time (`spec.md` §3 "FAT32 mount state") and copied into every
/// file opened against the mount.
#[derive(Clone, Copy)]
struct Geometry {
    bytes_per_sector: u16,
    sectors_per_cluster: u8,
    fat_start_sector: u32,
    data_start_sector: u32,
    root_cluster: u32,
    bytes_per_cluster: u32,
}

impl Geometry {
    /// Parses and validates a 512-byte FAT32 boot sector.
    ///
    /// # Errors
    ///
    /// [`FsError::BadSignature`] if the `0xAA55` trailer is missing,
    /// [`FsError::NotFat32`] if `root_entry_count != 0` or
    /// `fat_size_16 != 0` (the marker this driver uses to reject FAT12/16).
    fn parse(sector: &[u8; 512]) -> Result<Self, FsError> {
        let signature = u16::from_le_bytes([sector[510], sector[511]]);
        if signature != BOOT_SIGNATURE {
            return Err(FsError::BadSignature);
        }

        let bytes_per_sector = u16::from_le_bytes([sector[11], sector[12]]);
        let sectors_per_cluster = sector[13];
        let reserved_sectors = u16::from_le_bytes([sector[14], sector[15]]);
        let num_fats = sector[16];
        let root_entry_count = u16::from_le_bytes([sector[17], sector[18]]);
        let fat_size_16 = u16::from_le_bytes([sector[22], sector[23]]);
        let fat_size_32 = u32::from_le_bytes([sector[36], sector[37], sector[38], sector[39]]);
        let root_cluster = u32::from_le_bytes([sector[44], sector[45], sector[46], sector[47]]);

        if root_entry_count != 0 || fat_size_16 != 0 {
            return Err(FsError::NotFat32);
        }

        let fat_start_sector = u32::from(reserved_sectors);
        let data_start_sector = fat_start_sector + u32::from(num_fats) * fat_size_32;
        let bytes_per_cluster = u32::from(bytes_per_sector) * u32::from(sectors_per_cluster);

        Ok(Self {
            bytes_per_sector,
            sectors_per_cluster,
            fat_start_sector,
            data_start_sector,
            root_cluster,
            bytes_per_cluster,
        })
    }

    /// Converts a cluster number to its first absolute sector.
    fn cluster_to_sector(&self, cluster: u32) -> u64 {
        u64::from(self.data_start_sector) + (u64::from(cluster) - 2) * u64::from(self.sectors_per_cluster)
    }
}

fn is_end_of_chain(entry: u32) -> bool {
    entry >= END_OF_CHAIN_MIN
}

/// Reads the FAT entry for `cluster`: sector `fat_start + (cluster*4)/512`,
/// byte offset `(cluster*4) mod 512` (`spec.md` §4.7).
fn read_fat_entry(device_id: u8, geometry: &Geometry, cluster: u32) -> Result<u32, FsError> {
    let fat_offset = cluster * FAT_ENTRY_SIZE;
    let sector = geometry.fat_start_sector + fat_offset / u32::from(geometry.bytes_per_sector);
    let offset_in_sector = (fat_offset % u32::from(geometry.bytes_per_sector)) as usize;

    let mut buf = [0u8; 512];
    hadron_drivers::bread(device_id, u64::from(sector), &mut buf).map_err(|_| FsError::Io)?;
    let raw = u32::from_le_bytes(buf[offset_in_sector..offset_in_sector + 4].try_into().unwrap());
    Ok(raw & FAT_ENTRY_MASK)
}

/// Reads cluster `cluster` in full into `scratch` (one `bread` per
/// sector; no multi-sector batching, per `spec.md` §1 Non-goals).
fn read_cluster(device_id: u8, geometry: &Geometry, cluster: u32, scratch: &mut [u8]) -> Result<(), FsError> {
    let start_sector = geometry.cluster_to_sector(cluster);
    let sector_size = geometry.bytes_per_sector as usize;
    for i in 0..u64::from(geometry.sectors_per_cluster) {
        let offset = i as usize * sector_size;
        hadron_drivers::bread(device_id, start_sector + i, &mut scratch[offset..offset + sector_size])
            .map_err(|_| FsError::Io)?;
    }
    Ok(())
}

/// Writes cluster `cluster` in full from `scratch`.
fn write_cluster(device_id: u8, geometry: &Geometry, cluster: u32, scratch: &[u8]) -> Result<(), FsError> {
    let start_sector = geometry.cluster_to_sector(cluster);
    let sector_size = geometry.bytes_per_sector as usize;
    for i in 0..u64::from(geometry.sectors_per_cluster) {
        let offset = i as usize * sector_size;
        hadron_drivers::bwrite(device_id, start_sector + i, &scratch[offset..offset + sector_size])
            .map_err(|_| FsError::Io)?;
    }
    Ok(())
}

/// Upper-cases and splits `component` into the fixed 11-byte 8.3 form
/// (8 bytes of name, then 3 bytes of extension, space-padded).
fn to_83(component: &str) -> [u8; 11] {
    let mut out = [b' '; 11];
    let upper = component.to_ascii_uppercase();
    let (name, ext) = upper.split_once('.').unwrap_or((upper.as_str(), ""));
    for (i, b) in name.as_bytes().iter().take(8).enumerate() {
        out[i] = *b;
    }
    for (i, b) in ext.as_bytes().iter().take(3).enumerate() {
        out[8 + i] = *b;
    }
    out
}

struct DirEntryInfo {
    attr: u8,
    first_cluster: u32,
    file_size: u32,
}

fn parse_dir_entry(raw: &[u8]) -> DirEntryInfo {
    let attr = raw[11];
    let first_cluster_hi = u16::from_le_bytes([raw[20], raw[21]]);
    let first_cluster_lo = u16::from_le_bytes([raw[26], raw[27]]);
    let first_cluster = (u32::from(first_cluster_hi) << 16) | u32::from(first_cluster_lo);
    let file_size = u32::from_le_bytes([raw[28], raw[29], raw[30], raw[31]]);
    DirEntryInfo { attr, first_cluster, file_size }
}

/// Searches the directory chain rooted at `dir_cluster` for an entry
/// whose 8.3 name equals `target`, skipping long-filename and volume-id
/// entries and stopping at the first `0x00` (end of directory) marker.
fn find_in_directory(device_id: u8, geometry: &Geometry, dir_cluster: u32, target: [u8; 11]) -> Result<DirEntryInfo, FsError> {
    let mut cluster = dir_cluster;
    let mut buf = vec![0u8; geometry.bytes_per_cluster as usize];
    loop {
        read_cluster(device_id, geometry, cluster, &mut buf)?;
        for raw in buf.chunks_exact(DIR_ENTRY_SIZE) {
            let first_byte = raw[0];
            if first_byte == DIR_ENTRY_FREE {
                return Err(FsError::NotFound);
            }
            if first_byte == DIR_ENTRY_DELETED {
                continue;
            }
            let attr = raw[11];
            if attr == ATTR_LONG_NAME || attr & ATTR_VOLUME_ID != 0 {
                continue;
            }
            if raw[0..11] == target {
                return Ok(parse_dir_entry(raw));
            }
        }
        let next = read_fat_entry(device_id, geometry, cluster)?;
        if is_end_of_chain(next) {
            return Err(FsError::NotFound);
        }
        cluster = next;
    }
}

/// Resolves a path (relative to the volume root) to the directory entry
/// of its final (file) component, walking through intermediate directory
/// components. An empty path (the volume root itself) is not a file.
fn resolve(device_id: u8, geometry: &Geometry, path: &str) -> Result<DirEntryInfo, FsError> {
    let components: Vec<&str> = crate::path::components(path).collect();
    let Some((last, parents)) = components.split_last() else {
        return Err(FsError::IsADirectory);
    };

    let mut dir_cluster = geometry.root_cluster;
    for &component in parents {
        let entry = find_in_directory(device_id, geometry, dir_cluster, to_83(component))?;
        if entry.attr & ATTR_DIRECTORY == 0 {
            return Err(FsError::NotADirectory);
        }
        dir_cluster = entry.first_cluster;
    }

    let entry = find_in_directory(device_id, geometry, dir_cluster, to_83(*last))?;
    if entry.attr & ATTR_DIRECTORY != 0 {
        return Err(FsError::IsADirectory);
    }
    Ok(entry)
}

/// A mounted FAT32 volume.
struct Fat32MountState {
    device_id: u8,
    geometry: Geometry,
}

impl Mount for Fat32MountState {
    fn open(&self, path: &str, _flags: OpenFlags) -> Result<Box<dyn OpenFile>, FsError> {
        let entry = resolve(self.device_id, &self.geometry, path)?;
        Ok(Box::new(Fat32File {
            device_id: self.device_id,
            geometry: self.geometry,
            current_cluster: entry.first_cluster,
            file_size: entry.file_size,
            position: 0,
            offset_in_cluster: 0,
        }))
    }
}

/// A registered `"fat32"` filesystem driver.
#[derive(Default)]
pub struct Fat32Driver;

impl Fat32Driver {
    /// Creates a new FAT32 driver instance to pass to
    /// [`crate::Vfs::register_filesystem`].
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for Fat32Driver {
    fn name(&self) -> &'static str {
        "fat32"
    }

    fn mount(&self, device_id: u8) -> Result<Arc<dyn Mount>, FsError> {
        let mut sector0 = [0u8; 512];
        hadron_drivers::bread(device_id, 0, &mut sector0).map_err(|_| FsError::Io)?;
        let geometry = Geometry::parse(&sector0)?;
        Ok(Arc::new(Fat32MountState { device_id, geometry }))
    }
}

/// An open FAT32 file: a copy of the mount's geometry plus this file's
/// own traversal state (`spec.md` §3 "FAT32 file state"). `position <=
/// file_size` always; `offset_in_cluster` may transiently equal
/// `bytes_per_cluster` right at a cluster boundary, resolved by
/// `advance_cluster_if_needed` on the next access.
struct Fat32File {
    device_id: u8,
    geometry: Geometry,
    current_cluster: u32,
    file_size: u32,
    position: u32,
    offset_in_cluster: u32,
}

impl Fat32File {
    /// If the current cluster is exhausted, follows the FAT chain to the
    /// next one. Returns `Ok(false)` at end of chain (should not happen
    /// while `position < file_size` on a well-formed volume).
    fn advance_cluster_if_needed(&mut self) -> Result<bool, FsError> {
        if self.offset_in_cluster < self.geometry.bytes_per_cluster {
            return Ok(true);
        }
        let next = read_fat_entry(self.device_id, &self.geometry, self.current_cluster)?;
        if is_end_of_chain(next) {
            return Ok(false);
        }
        self.current_cluster = next;
        self.offset_in_cluster = 0;
        Ok(true)
    }
}

impl OpenFile for Fat32File {
    /// Reads bounded by `file_size - position`: a request larger than
    /// what's left returns exactly what's left and leaves `position` at
    /// `file_size` (`spec.md` §8 property 5).
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, FsError> {
        let remaining = (self.file_size - self.position) as usize;
        let want = buf.len().min(remaining);
        let mut written = 0usize;
        let mut scratch = vec![0u8; self.geometry.bytes_per_cluster as usize];

        while written < want {
            match self.advance_cluster_if_needed() {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => return if written > 0 { Ok(written) } else { Err(e) },
            }

            if let Err(e) = read_cluster(self.device_id, &self.geometry, self.current_cluster, &mut scratch) {
                return if written > 0 { Ok(written) } else { Err(e) };
            }

            let in_cluster_remaining = (self.geometry.bytes_per_cluster - self.offset_in_cluster) as usize;
            let n = (want - written).min(in_cluster_remaining);
            let off = self.offset_in_cluster as usize;
            buf[written..written + n].copy_from_slice(&scratch[off..off + n]);

            written += n;
            self.position += n as u32;
            self.offset_in_cluster += n as u32;
        }
        Ok(written)
    }

    /// In-place overwrite only: never extends past `file_size`. Returns
    /// `0` without touching the FAT or any sector if `position ==
    /// file_size` already (`spec.md` §8 property 10).
    fn write(&mut self, buf: &[u8]) -> Result<usize, FsError> {
        if self.position == self.file_size {
            return Ok(0);
        }
        let remaining = (self.file_size - self.position) as usize;
        let want = buf.len().min(remaining);
        let mut written = 0usize;
        let mut scratch = vec![0u8; self.geometry.bytes_per_cluster as usize];

        while written < want {
            match self.advance_cluster_if_needed() {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => return if written > 0 { Ok(written) } else { Err(e) },
            }

            if let Err(e) = read_cluster(self.device_id, &self.geometry, self.current_cluster, &mut scratch) {
                return if written > 0 { Ok(written) } else { Err(e) };
            }

            let in_cluster_remaining = (self.geometry.bytes_per_cluster - self.offset_in_cluster) as usize;
            let n = (want - written).min(in_cluster_remaining);
            let off = self.offset_in_cluster as usize;
            scratch[off..off + n].copy_from_slice(&buf[written..written + n]);

            if let Err(e) = write_cluster(self.device_id, &self.geometry, self.current_cluster, &scratch) {
                return if written > 0 { Ok(written) } else { Err(e) };
            }

            written += n;
            self.position += n as u32;
            self.offset_in_cluster += n as u32;
        }
        Ok(written)
    }
}
