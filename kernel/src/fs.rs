//! Filesystem glue: wires [`crate::inode`]'s block/inode allocator into
//! `keos::fs::traits::{FileSystem, RegularFile, Directory}`.
//!
//! Grounded on `examples/casys-kaist-KeOS/fs/simple_fs/src/keos_binder.rs`
//! for the shape of the trait impls (an `ino()`-tagged wrapper type plus a
//! global table mapping inode numbers to shared in-memory state), but unlike
//! that reference the directory here is a real, growable, hierarchical
//! directory rather than a flat stub.

use crate::inode::{Allocator, DIRENT_SIZE, MemInode, decode_dirent, encode_dirent};
use alloc::{
    boxed::Box, collections::BTreeMap, string::String, string::ToString, sync::Arc, vec::Vec,
};
use keos::{
    KernelError,
    fs::{self, FileBlockNumber, InodeNumber},
    sync::{SpinLock, atomic::AtomicBool},
};

/// Shared filesystem state: the block/inode allocator plus the table of
/// currently-open in-memory inodes, keyed by inode number so that every
/// handle to the same file observes the same open-count/removed/deny-write
/// state.
pub struct FsShared {
    alloc: Allocator,
    /// Guards structural mutations: inode allocation/free and directory
    /// entry create/unlink. Mirrors the single `inode_extension_lock` of the
    /// original teaching filesystem.
    structure_lock: SpinLock<()>,
    open_inodes: SpinLock<BTreeMap<u32, Arc<MemInode>>>,
}

impl FsShared {
    fn mem_inode(self: &Arc<Self>, ino: InodeNumber) -> Arc<MemInode> {
        let mut guard = self.open_inodes.lock();
        let entry = guard
            .entry(ino.into_u32())
            .or_insert_with(|| Arc::new(MemInode::new(ino)))
            .clone();
        *entry.open_count.lock() += 1;
        guard.unlock();
        entry
    }

    fn release(self: &Arc<Self>, mem: &Arc<MemInode>) -> Result<(), KernelError> {
        let mut guard = self.open_inodes.lock();
        let mut count = mem.open_count.lock();
        *count -= 1;
        let last = *count == 0;
        count.unlock();
        if last {
            guard.remove(&mem.ino.into_u32());
        }
        guard.unlock();
        if last && mem.removed.load() {
            self.alloc.free_inode(mem.ino)?;
        }
        Ok(())
    }

    /// True if some live handle — an open file descriptor or a process's
    /// current working directory — already references `ino`.
    fn is_referenced(&self, ino: InodeNumber) -> bool {
        let guard = self.open_inodes.lock();
        let referenced = guard.contains_key(&ino.into_u32());
        guard.unlock();
        referenced
    }
}

/// Registers a freshly formatted or previously formatted filesystem as the
/// global [`keos::fs::FileSystem`], given the sector count of disk slot
/// `disk_index`.
pub fn register(disk_index: usize, total_sectors: usize, fresh: bool) -> Result<(), KernelError> {
    let cache = Arc::new(crate::block_cache::BlockCache::new(disk_index));
    let alloc = if fresh {
        Allocator::format(cache, total_sectors)?
    } else {
        Allocator::open(cache, total_sectors)?
    };
    let shared = Arc::new(FsShared {
        alloc,
        structure_lock: SpinLock::new(()),
        open_inodes: SpinLock::new(BTreeMap::new()),
    });
    fs::FileSystem::register(FileSystemImpl { shared });
    Ok(())
}

struct FileSystemImpl {
    shared: Arc<FsShared>,
}

impl fs::traits::FileSystem for FileSystemImpl {
    fn root(&self) -> Option<fs::Directory> {
        let ino = InodeNumber::new(1)?;
        let mem = self.shared.mem_inode(ino);
        Some(fs::Directory::new(DirectoryImpl {
            shared: self.shared.clone(),
            mem,
        }))
    }
}

fn open_as_file(shared: &Arc<FsShared>, ino: InodeNumber) -> Result<fs::File, KernelError> {
    let disk = shared.alloc.read_inode(ino)?;
    let mem = shared.mem_inode(ino);
    if disk.is_dir != 0 {
        Ok(fs::File::Directory(fs::Directory::new(DirectoryImpl {
            shared: shared.clone(),
            mem,
        })))
    } else {
        Ok(fs::File::RegularFile(fs::RegularFile::new(RegularFileImpl {
            shared: shared.clone(),
            mem,
        })))
    }
}

/// A handle to a regular file's inode.
struct RegularFileImpl {
    shared: Arc<FsShared>,
    mem: Arc<MemInode>,
}

impl fs::traits::RegularFile for RegularFileImpl {
    fn ino(&self) -> InodeNumber {
        self.mem.ino
    }

    fn size(&self) -> usize {
        self.shared
            .alloc
            .read_inode(self.mem.ino)
            .map(|d| d.length as usize)
            .unwrap_or(0)
    }

    fn read(&self, fba: FileBlockNumber, buf: &mut [u8; 4096]) -> Result<bool, KernelError> {
        let disk = self.shared.alloc.read_inode(self.mem.ino)?;
        if (fba.0 as u64) * 4096 >= disk.length {
            buf.fill(0);
            return Ok(false);
        }
        match self.shared.alloc.block_sector(&disk, fba)? {
            Some(sector) => {
                for i in 0..crate::inode::SECTORS_PER_BLOCK {
                    let mut s = [0u8; 512];
                    self.shared
                        .alloc_cache()
                        .read(keos::fs::Sector(sector.into_usize() + i), &mut s)?;
                    buf[i * 512..(i + 1) * 512].copy_from_slice(&s);
                }
                Ok(true)
            }
            None => {
                buf.fill(0);
                Ok(true)
            }
        }
    }

    fn write(
        &self,
        fba: FileBlockNumber,
        buf: &[u8; 4096],
        min_size: usize,
    ) -> Result<(), KernelError> {
        if self.mem.write_denied() {
            return Err(KernelError::Busy);
        }
        let _g = self.shared.structure_lock.lock();
        let mut disk = self.shared.alloc.read_inode(self.mem.ino)?;
        let sector = self.shared.alloc.ensure_block(&mut disk, fba)?;
        for i in 0..crate::inode::SECTORS_PER_BLOCK {
            let chunk: [u8; 512] = buf[i * 512..(i + 1) * 512].try_into().unwrap();
            self.shared
                .alloc_cache()
                .write(keos::fs::Sector(sector.into_usize() + i), &chunk)?;
        }
        if min_size as u64 > disk.length {
            disk.length = min_size as u64;
        }
        self.shared.alloc.write_inode(self.mem.ino, disk)?;
        _g.unlock();
        Ok(())
    }

    fn writeback(&self) -> Result<(), KernelError> {
        self.shared.alloc_cache().flush_all()
    }

    fn deny_write(&self) {
        self.mem.deny_write();
    }

    fn allow_write(&self) {
        self.mem.allow_write();
    }
}

impl Drop for RegularFileImpl {
    fn drop(&mut self) {
        let _ = self.shared.release(&self.mem);
    }
}

/// A handle to a directory's inode.
struct DirectoryImpl {
    shared: Arc<FsShared>,
    mem: Arc<MemInode>,
}

impl DirectoryImpl {
    fn as_regular(&self) -> RegularFileImpl {
        // Directory contents are read/written through the same block-level
        // machinery as regular files; borrow it without going through the
        // open-count bookkeeping (the directory handle itself already owns a
        // reference via `self.mem`).
        *self.mem.open_count.lock() += 1;
        RegularFileImpl {
            shared: self.shared.clone(),
            mem: self.mem.clone(),
        }
    }

    fn read_entries(&self) -> Result<Vec<(usize, InodeNumber, String)>, KernelError> {
        let disk = self.shared.alloc.read_inode(self.mem.ino)?;
        let n = (disk.length as usize) / DIRENT_SIZE;
        let file = self.as_regular();
        let mut out = Vec::new();
        for i in 0..n {
            let mut block = Box::new([0u8; 4096]);
            let fba = FileBlockNumber((i * DIRENT_SIZE) / 4096);
            file.read(fba, &mut block)?;
            let off = (i * DIRENT_SIZE) % 4096;
            if let Some((ino, name)) = decode_dirent(&block[off..off + DIRENT_SIZE]) {
                out.push((i, ino, String::from_utf8_lossy(&name).to_string()));
            }
        }
        Ok(out)
    }
}

impl fs::traits::Directory for DirectoryImpl {
    fn ino(&self) -> InodeNumber {
        self.mem.ino
    }

    fn size(&self) -> usize {
        self.shared
            .alloc
            .read_inode(self.mem.ino)
            .map(|d| d.length as usize)
            .unwrap_or(0)
    }

    fn link_count(&self) -> usize {
        self.shared
            .alloc
            .read_inode(self.mem.ino)
            .map(|d| d.link_count as usize)
            .unwrap_or(0)
    }

    fn open_entry(&self, entry: &str) -> Result<fs::File, KernelError> {
        if entry == "." {
            return open_as_file(&self.shared, self.mem.ino);
        }
        for (_, ino, name) in self.read_entries()? {
            if name == entry {
                return open_as_file(&self.shared, ino);
            }
        }
        Err(KernelError::NoSuchEntry)
    }

    fn create_entry(&self, entry: &str, is_dir: bool) -> Result<fs::File, KernelError> {
        if entry.len() > crate::inode::DIRENT_NAME_LEN {
            return Err(KernelError::NameTooLong);
        }
        let _g = self.shared.structure_lock.lock();
        if self.read_entries()?.iter().any(|(_, _, n)| n == entry) {
            _g.unlock();
            return Err(KernelError::FileExist);
        }
        let new_ino = self.shared.alloc.alloc_inode(is_dir)?;
        let record = encode_dirent(entry, new_ino);
        let append_at = self.size();
        let file = self.as_regular();
        file.write(
            FileBlockNumber(append_at / 4096),
            &pad_to_block(append_at % 4096, &record),
            append_at + DIRENT_SIZE,
        )?;
        _g.unlock();
        open_as_file(&self.shared, new_ino)
    }

    fn unlink_entry(&self, entry: &str) -> Result<(), KernelError> {
        let _g = self.shared.structure_lock.lock();
        let entries = self.read_entries()?;
        let Some((idx, ino, _)) = entries.into_iter().find(|(_, _, n)| n == entry) else {
            _g.unlock();
            return Err(KernelError::NoSuchEntry);
        };

        let target_disk = match self.shared.alloc.read_inode(ino) {
            Ok(d) => d,
            Err(e) => {
                _g.unlock();
                return Err(e);
            }
        };
        if target_disk.is_dir != 0 {
            // Refuse to remove a sub-directory that's open anywhere (which
            // includes being some process's current working directory) or
            // that still has entries of its own.
            if self.shared.is_referenced(ino) {
                _g.unlock();
                return Err(KernelError::Busy);
            }
            let target_mem = self.shared.mem_inode(ino);
            let target = DirectoryImpl {
                shared: self.shared.clone(),
                mem: target_mem.clone(),
            };
            let empty_check = target.read_entries().map(|e| e.is_empty());
            if let Err(e) = self.shared.release(&target_mem) {
                _g.unlock();
                return Err(e);
            }
            match empty_check {
                Ok(true) => {}
                Ok(false) => {
                    _g.unlock();
                    return Err(KernelError::DirectoryNotEmpty);
                }
                Err(e) => {
                    _g.unlock();
                    return Err(e);
                }
            }
        }

        let file = self.as_regular();
        let off_in_block = (idx * DIRENT_SIZE) % 4096;
        let fba = FileBlockNumber((idx * DIRENT_SIZE) / 4096);
        let mut block = Box::new([0u8; 4096]);
        file.read(fba, &mut block)?;
        block[off_in_block..off_in_block + DIRENT_SIZE].fill(0);
        file.write(fba, &block, 0)?;
        _g.unlock();

        let mem = self.shared.mem_inode(ino);
        mem.removed.store(true);
        self.shared.release(&mem)
    }

    fn read_dir(&self) -> Result<Vec<(InodeNumber, String)>, KernelError> {
        Ok(self
            .read_entries()?
            .into_iter()
            .map(|(_, ino, name)| (ino, name))
            .collect())
    }

    fn removed(&self) -> Result<&AtomicBool, KernelError> {
        Ok(&self.mem.removed)
    }
}

impl Drop for DirectoryImpl {
    fn drop(&mut self) {
        let _ = self.shared.release(&self.mem);
    }
}

fn pad_to_block(off: usize, record: &[u8; DIRENT_SIZE]) -> Box<[u8; 4096]> {
    let mut block = Box::new([0u8; 4096]);
    block[off..off + DIRENT_SIZE].copy_from_slice(record);
    block
}

impl FsShared {
    fn alloc_cache(&self) -> &crate::block_cache::BlockCache {
        self.alloc.cache()
    }
}
