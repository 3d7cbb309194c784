//! On-disk inode format, the free-map, and the inode table.
//!
//! Modeled on the direct/indirect/double-indirect extensible inode of a
//! teaching filesystem (`filesys/inode.c` in the original Pintos-style
//! source), but indexed in 4096-byte file blocks (one file block = 8
//! sectors) instead of raw 512-byte sectors, since [`keos::fs::RegularFile`]
//! already does byte-granular work on top of block-granular primitives.
//!
//! # On-disk layout
//! - Sector 0: reserved boot sector.
//! - `[1, 1 + FREEMAP_SECTORS)`: a raw bitmap, one bit per sector on the
//!   disk (bit set = in use).
//! - `[1 + FREEMAP_SECTORS, 1 + FREEMAP_SECTORS + INODE_TABLE_SECTORS)`: a
//!   fixed-size array of on-disk inodes, one per sector. Inode number `n`
//!   (1-based) lives at sector `INODE_TABLE_START + n - 1`.
//! - Everything after that is the data region, allocated in 8-sector (file
//!   block) aligned groups.
//!
//! Inode number 1 is always the root directory, created at format time.

use crate::block_cache::BlockCache;
use alloc::{sync::Arc, vec::Vec};
use keos::{
    KernelError,
    fs::{FileBlockNumber, InodeNumber, Sector},
    sync::SpinLock,
};

/// 512 bytes per sector, 8 sectors per file block.
pub const SECTORS_PER_BLOCK: usize = 8;
/// Maximum number of inodes this filesystem can hold.
pub const MAX_INODES: usize = 1024;
/// Number of direct file-block pointers stored inline in the inode.
pub const N_DIRECT: usize = 100;
/// Number of pointers that fit in one indirection block.
pub const PTRS_PER_INDIRECT: usize = 4096 / 4;

const INODE_MAGIC: u32 = 0x4b45_4f53;

const FREEMAP_START: Sector = Sector(1);

fn freemap_sectors(total_sectors: usize) -> usize {
    total_sectors.div_ceil(512 * 8)
}

fn inode_table_start(total_sectors: usize) -> Sector {
    Sector(FREEMAP_START.into_usize() + freemap_sectors(total_sectors))
}

fn data_start(total_sectors: usize) -> Sector {
    Sector(inode_table_start(total_sectors).into_usize() + MAX_INODES)
}

/// The exactly-512-byte on-disk representation of an inode.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct OnDiskInode {
    pub magic: u32,
    pub is_dir: u32,
    pub length: u64,
    pub link_count: u32,
    pub direct: [u32; N_DIRECT],
    pub indirect: u32,
    pub double_indirect: u32,
    _pad: [u8; 512 - 4 - 4 - 8 - 4 - N_DIRECT * 4 - 4 - 4],
}

impl OnDiskInode {
    fn empty(is_dir: bool) -> Self {
        Self {
            magic: INODE_MAGIC,
            is_dir: is_dir as u32,
            length: 0,
            link_count: 1,
            direct: [0; N_DIRECT],
            indirect: 0,
            double_indirect: 0,
            _pad: [0; 512 - 4 - 4 - 8 - 4 - N_DIRECT * 4 - 4 - 4],
        }
    }

    fn from_bytes(buf: &[u8; 512]) -> Self {
        unsafe { core::ptr::read_unaligned(buf.as_ptr() as *const Self) }
    }

    fn to_bytes(self) -> [u8; 512] {
        let mut buf = [0u8; 512];
        unsafe {
            core::ptr::write_unaligned(buf.as_mut_ptr() as *mut Self, self);
        }
        buf
    }
}

const _: () = assert!(core::mem::size_of::<OnDiskInode>() == 512);

/// Manages the on-disk bitmap of free sectors and the fixed inode table.
pub struct Allocator {
    cache: Arc<BlockCache>,
    total_sectors: usize,
}

impl Allocator {
    /// The block cache backing this allocator, for callers (directory and
    /// regular-file data blocks) that need raw sector access alongside it.
    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    fn freemap_bit(&self, sector: Sector, set: bool) -> Result<(), KernelError> {
        let idx = sector.into_usize();
        let byte_sector = Sector(FREEMAP_START.into_usize() + idx / (512 * 8));
        let mut buf = [0u8; 512];
        self.cache.read(byte_sector, &mut buf)?;
        let bit = (idx / 8) % 512;
        let mask = 1u8 << (idx % 8);
        if set {
            buf[bit] |= mask;
        } else {
            buf[bit] &= !mask;
        }
        self.cache.write(byte_sector, &buf)
    }

    fn freemap_test(&self, sector: Sector) -> Result<bool, KernelError> {
        let idx = sector.into_usize();
        let byte_sector = Sector(FREEMAP_START.into_usize() + idx / (512 * 8));
        let mut buf = [0u8; 512];
        self.cache.read(byte_sector, &mut buf)?;
        let bit = (idx / 8) % 512;
        let mask = 1u8 << (idx % 8);
        Ok(buf[bit] & mask != 0)
    }

    /// Allocates one file block (8 contiguous sectors) from the data region.
    pub fn alloc_block(&self) -> Result<Sector, KernelError> {
        let start = data_start(self.total_sectors).into_usize().div_ceil(SECTORS_PER_BLOCK)
            * SECTORS_PER_BLOCK;
        'search: for candidate in (start..self.total_sectors).step_by(SECTORS_PER_BLOCK) {
            if candidate + SECTORS_PER_BLOCK > self.total_sectors {
                break;
            }
            for i in 0..SECTORS_PER_BLOCK {
                if self.freemap_test(Sector(candidate + i))? {
                    continue 'search;
                }
            }
            let zero = [0u8; 512];
            for i in 0..SECTORS_PER_BLOCK {
                self.freemap_bit(Sector(candidate + i), true)?;
                self.cache.write(Sector(candidate + i), &zero)?;
            }
            return Ok(Sector(candidate));
        }
        Err(KernelError::NoSpace)
    }

    /// Frees one file block previously returned by [`Self::alloc_block`].
    pub fn free_block(&self, sector: Sector) -> Result<(), KernelError> {
        for i in 0..SECTORS_PER_BLOCK {
            self.freemap_bit(Sector(sector.into_usize() + i), false)?;
        }
        Ok(())
    }

    /// Allocates a free inode slot and writes an empty inode into it.
    pub fn alloc_inode(&self, is_dir: bool) -> Result<InodeNumber, KernelError> {
        let table = inode_table_start(self.total_sectors);
        for n in 1..=MAX_INODES as u32 {
            let sector = Sector(table.into_usize() + n as usize - 1);
            let mut buf = [0u8; 512];
            self.cache.read(sector, &mut buf)?;
            let disk = OnDiskInode::from_bytes(&buf);
            if disk.magic != INODE_MAGIC {
                self.cache.write(sector, &OnDiskInode::empty(is_dir).to_bytes())?;
                return InodeNumber::new(n).ok_or(KernelError::NoSpace);
            }
        }
        Err(KernelError::NoSpace)
    }

    /// Reads the on-disk inode for `ino`.
    pub fn read_inode(&self, ino: InodeNumber) -> Result<OnDiskInode, KernelError> {
        let sector = Sector(inode_table_start(self.total_sectors).into_usize() + ino.into_u32() as usize - 1);
        let mut buf = [0u8; 512];
        self.cache.read(sector, &mut buf)?;
        Ok(OnDiskInode::from_bytes(&buf))
    }

    /// Writes back the on-disk inode for `ino`.
    pub fn write_inode(&self, ino: InodeNumber, disk: OnDiskInode) -> Result<(), KernelError> {
        let sector = Sector(inode_table_start(self.total_sectors).into_usize() + ino.into_u32() as usize - 1);
        self.cache.write(sector, &disk.to_bytes())
    }

    /// Marks an inode slot as free by zeroing its magic, releasing every
    /// data block and indirection block it owns.
    pub fn free_inode(&self, ino: InodeNumber) -> Result<(), KernelError> {
        let disk = self.read_inode(ino)?;
        let nblocks = disk.length.div_ceil(4096) as usize;
        for fba in 0..nblocks {
            if let Some(sector) = self.block_sector(&disk, FileBlockNumber(fba))? {
                self.free_block(sector)?;
            }
        }
        if disk.indirect != 0 {
            self.free_block(Sector(disk.indirect as usize))?;
        }
        if disk.double_indirect != 0 {
            let mut idx_buf = [0u8; 512];
            self.cache.read(Sector(disk.double_indirect as usize), &mut idx_buf)?;
            for i in 0..PTRS_PER_INDIRECT {
                let ptr = u32::from_le_bytes(idx_buf[i * 4..i * 4 + 4].try_into().unwrap());
                if ptr != 0 {
                    self.free_block(Sector(ptr as usize))?;
                }
            }
            self.free_block(Sector(disk.double_indirect as usize))?;
        }
        let mut buf = [0u8; 512];
        buf.fill(0);
        let sector = Sector(inode_table_start(self.total_sectors).into_usize() + ino.into_u32() as usize - 1);
        self.cache.write(sector, &buf)
    }

    fn read_ptr_block(&self, sector: Sector, idx: usize) -> Result<u32, KernelError> {
        // Each sector stores 128 u32 pointers; an indirection block spans the
        // SECTORS_PER_BLOCK sectors of one allocated file block, for
        // 128 * SECTORS_PER_BLOCK == PTRS_PER_INDIRECT pointers total.
        let sector_in_block = idx / 128;
        let off = (idx % 128) * 4;
        let mut buf = [0u8; 512];
        self.cache
            .read(Sector(sector.into_usize() + sector_in_block), &mut buf)?;
        Ok(u32::from_le_bytes(buf[off..off + 4].try_into().unwrap()))
    }

    fn write_ptr_block(&self, sector: Sector, idx: usize, val: u32) -> Result<(), KernelError> {
        let sector_in_block = idx / 128;
        let off = (idx % 128) * 4;
        let target = Sector(sector.into_usize() + sector_in_block);
        let mut buf = [0u8; 512];
        self.cache.read(target, &mut buf)?;
        buf[off..off + 4].copy_from_slice(&val.to_le_bytes());
        self.cache.write(target, &buf)
    }

    /// Looks up the data sector backing file block `fba`, if allocated.
    pub fn block_sector(
        &self,
        disk: &OnDiskInode,
        fba: FileBlockNumber,
    ) -> Result<Option<Sector>, KernelError> {
        let i = fba.0;
        if i < N_DIRECT {
            let s = disk.direct[i];
            return Ok((s != 0).then_some(Sector(s as usize)));
        }
        let i = i - N_DIRECT;
        if i < PTRS_PER_INDIRECT {
            if disk.indirect == 0 {
                return Ok(None);
            }
            let s = self.read_ptr_block(Sector(disk.indirect as usize), i)?;
            return Ok((s != 0).then_some(Sector(s as usize)));
        }
        let i = i - PTRS_PER_INDIRECT;
        if disk.double_indirect == 0 {
            return Ok(None);
        }
        let (outer, inner) = (i / PTRS_PER_INDIRECT, i % PTRS_PER_INDIRECT);
        let indirect_sector = self.read_ptr_block(Sector(disk.double_indirect as usize), outer)?;
        if indirect_sector == 0 {
            return Ok(None);
        }
        let s = self.read_ptr_block(Sector(indirect_sector as usize), inner)?;
        Ok((s != 0).then_some(Sector(s as usize)))
    }

    /// Ensures file block `fba` is backed by an allocated data sector,
    /// allocating indirection blocks and the data block itself as needed.
    pub fn ensure_block(
        &self,
        disk: &mut OnDiskInode,
        fba: FileBlockNumber,
    ) -> Result<Sector, KernelError> {
        if let Some(s) = self.block_sector(disk, fba)? {
            return Ok(s);
        }
        let data = self.alloc_block()?;
        let i = fba.0;
        if i < N_DIRECT {
            disk.direct[i] = data.into_usize() as u32;
            return Ok(data);
        }
        let i = i - N_DIRECT;
        if i < PTRS_PER_INDIRECT {
            if disk.indirect == 0 {
                disk.indirect = self.alloc_block()?.into_usize() as u32;
            }
            self.write_ptr_block(Sector(disk.indirect as usize), i, data.into_usize() as u32)?;
            return Ok(data);
        }
        let i = i - PTRS_PER_INDIRECT;
        let (outer, inner) = (i / PTRS_PER_INDIRECT, i % PTRS_PER_INDIRECT);
        if disk.double_indirect == 0 {
            disk.double_indirect = self.alloc_block()?.into_usize() as u32;
        }
        let mut indirect_sector = self.read_ptr_block(Sector(disk.double_indirect as usize), outer)?;
        if indirect_sector == 0 {
            indirect_sector = self.alloc_block()?.into_usize() as u32;
            self.write_ptr_block(Sector(disk.double_indirect as usize), outer, indirect_sector)?;
        }
        self.write_ptr_block(Sector(indirect_sector as usize), inner, data.into_usize() as u32)?;
        Ok(data)
    }

    /// Formats a fresh filesystem: clears the bitmap, marks metadata
    /// sectors used, and creates the root directory inode (number 1).
    pub fn format(cache: Arc<BlockCache>, total_sectors: usize) -> Result<Self, KernelError> {
        let this = Self {
            cache,
            total_sectors,
        };
        let zero = [0u8; 512];
        for s in 0..freemap_sectors(total_sectors) {
            this.cache.write(Sector(FREEMAP_START.into_usize() + s), &zero)?;
        }
        for i in 0..data_start(total_sectors).into_usize() {
            this.freemap_bit(Sector(i), true)?;
        }
        for n in 1..=MAX_INODES as u32 {
            let sector = Sector(inode_table_start(total_sectors).into_usize() + n as usize - 1);
            this.cache.write(sector, &zero)?;
        }
        let root = this.alloc_inode(true)?;
        debug_assert_eq!(root.into_u32(), 1);
        Ok(this)
    }

    /// Opens the filesystem that was previously formatted on this disk.
    pub fn open(cache: Arc<BlockCache>, total_sectors: usize) -> Result<Self, KernelError> {
        let this = Self {
            cache,
            total_sectors,
        };
        let root = InodeNumber::new(1).unwrap();
        let disk = this.read_inode(root)?;
        if disk.magic != INODE_MAGIC {
            return Err(KernelError::FilesystemCorrupted("missing root inode"));
        }
        Ok(this)
    }
}

/// In-memory state tracked per open inode: concurrent open handles, the
/// removed flag, and deny-write tracking for executables.
pub struct MemInode {
    pub ino: InodeNumber,
    pub open_count: SpinLock<usize>,
    pub removed: keos::sync::atomic::AtomicBool,
    pub deny_write_count: SpinLock<usize>,
}

impl MemInode {
    pub fn new(ino: InodeNumber) -> Self {
        Self {
            ino,
            open_count: SpinLock::new(1),
            removed: keos::sync::atomic::AtomicBool::new(false),
            deny_write_count: SpinLock::new(0),
        }
    }

    /// Increments the deny-write counter. While non-zero, [`Self::write_denied`]
    /// reports writes as blocked.
    pub fn deny_write(&self) {
        let mut g = self.deny_write_count.lock();
        *g += 1;
        g.unlock();
    }

    /// Decrements the deny-write counter.
    pub fn allow_write(&self) {
        let mut g = self.deny_write_count.lock();
        *g -= 1;
        g.unlock();
    }

    /// Whether this inode currently has an outstanding `deny_write` mark.
    pub fn write_denied(&self) -> bool {
        let g = self.deny_write_count.lock();
        let denied = *g > 0;
        g.unlock();
        denied
    }
}

/// Reads the directory-entry payload of a directory inode as a list of
/// `(name, InodeNumber)` pairs. Directory contents are just regular file
/// bytes laid out as fixed 32-byte records (28-byte name + u32 inode
/// number; an all-zero record is a free slot).
pub const DIRENT_SIZE: usize = 32;
pub const DIRENT_NAME_LEN: usize = 28;

pub fn decode_dirent(buf: &[u8]) -> Option<(InodeNumber, Vec<u8>)> {
    let ino = u32::from_le_bytes(buf[28..32].try_into().unwrap());
    let ino = InodeNumber::new(ino)?;
    let end = buf[..28].iter().position(|&b| b == 0).unwrap_or(28);
    Some((ino, buf[..end].to_vec()))
}

pub fn encode_dirent(name: &str, ino: InodeNumber) -> [u8; DIRENT_SIZE] {
    let mut buf = [0u8; DIRENT_SIZE];
    let bytes = name.as_bytes();
    let n = bytes.len().min(DIRENT_NAME_LEN);
    buf[..n].copy_from_slice(&bytes[..n]);
    buf[28..32].copy_from_slice(&ino.into_u32().to_le_bytes());
    buf
}
