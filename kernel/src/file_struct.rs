//! Per-process file state: the file-descriptor table and current working
//! directory.
//!
//! Grounded on `keos-project1/src/file_struct.rs`'s `FileKind`/`File`/
//! `FileDescriptor`/`FileStruct` shape. The IPC variants (`FileKind::Rx`/
//! `Tx`, `FileStruct::pipe`) are dropped: pipes and channels are out of
//! scope here, only on-disk files and console stdio are supported.

use alloc::collections::BTreeMap;
use keos::{
    KernelError,
    fs::{Directory, InodeNumber, RegularFile},
    syscall::flags::FileMode,
    teletype::Teletype,
};

/// The kind of object a file descriptor refers to.
#[derive(Clone)]
pub enum FileKind {
    /// An open regular file, at a tracked byte offset.
    RegularFile { file: RegularFile, position: usize },
    /// An open directory, at a tracked directory-entry offset.
    Directory { dir: Directory, position: usize },
    /// Console standard input/output/error.
    Stdio,
}

/// An open file: its access mode plus the underlying kind.
#[derive(Clone)]
pub struct File {
    pub mode: FileMode,
    pub file: FileKind,
}

/// An index into a process's file-descriptor table.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct FileDescriptor(pub i32);

/// Reserved descriptors for console I/O, pre-installed by [`FileStruct::new`].
pub const STDIN: FileDescriptor = FileDescriptor(0);
pub const STDOUT: FileDescriptor = FileDescriptor(1);
pub const STDERR: FileDescriptor = FileDescriptor(2);

const MAX_OPEN_FILES: usize = 1024;

/// A process's file-system state: current working directory plus the
/// descriptor-to-file table.
#[derive(Clone)]
pub struct FileStruct {
    pub cwd: Directory,
    files: BTreeMap<FileDescriptor, File>,
    next_fd: i32,
}

impl Default for FileStruct {
    fn default() -> Self {
        Self::new()
    }
}

impl FileStruct {
    /// Creates a fresh file state rooted at the file system root, with
    /// stdin/stdout/stderr pre-installed.
    pub fn new() -> Self {
        let mut this = Self {
            cwd: keos::fs::FileSystem::root(),
            files: BTreeMap::new(),
            next_fd: 3,
        };
        this.install_file(File {
            mode: FileMode::Read,
            file: FileKind::Stdio,
        })
        .unwrap();
        this.install_file(File {
            mode: FileMode::Write,
            file: FileKind::Stdio,
        })
        .unwrap();
        this.install_file(File {
            mode: FileMode::Write,
            file: FileKind::Stdio,
        })
        .unwrap();
        this
    }

    /// Assigns the next free descriptor to `file` and returns it.
    pub fn install_file(&mut self, file: File) -> Result<FileDescriptor, KernelError> {
        if self.files.len() >= MAX_OPEN_FILES {
            return Err(KernelError::TooManyOpenFile);
        }
        let fd = FileDescriptor(self.next_fd);
        self.next_fd += 1;
        self.files.insert(fd, file);
        Ok(fd)
    }

    fn get(&self, fd: FileDescriptor) -> Result<&File, KernelError> {
        self.files.get(&fd).ok_or(KernelError::BadFileDescriptor)
    }

    fn get_mut(&mut self, fd: FileDescriptor) -> Result<&mut File, KernelError> {
        self.files
            .get_mut(&fd)
            .ok_or(KernelError::BadFileDescriptor)
    }

    /// Looks up the open regular file backing `fd`, for mmap.
    pub fn regular_file(&self, fd: FileDescriptor) -> Result<RegularFile, KernelError> {
        match &self.get(fd)?.file {
            FileKind::RegularFile { file, .. } => Ok(file.clone()),
            _ => Err(KernelError::InvalidArgument),
        }
    }

    /// Opens `path` relative to `cwd`, in the given mode.
    pub fn open(&mut self, path: &str, mode: FileMode) -> Result<FileDescriptor, KernelError> {
        let file = self.cwd.open(path)?;
        let kind = match file {
            keos::fs::File::RegularFile(file) => FileKind::RegularFile { file, position: 0 },
            keos::fs::File::Directory(dir) => FileKind::Directory { dir, position: 0 },
        };
        self.install_file(File { mode, file: kind })
    }

    /// Creates a new entry (regular file or directory) at `path`.
    pub fn create(&mut self, path: &str, is_dir: bool) -> Result<(), KernelError> {
        self.cwd.create(path, is_dir)?;
        Ok(())
    }

    /// Removes the entry at `path`.
    pub fn remove(&mut self, path: &str) -> Result<(), KernelError> {
        self.cwd.unlink(path)
    }

    /// Changes the current working directory to `path`.
    pub fn chdir(&mut self, path: &str) -> Result<(), KernelError> {
        let file = self.cwd.open(path)?;
        self.cwd = file.into_directory().ok_or(KernelError::NotDirectory)?;
        Ok(())
    }

    /// Reads up to `buf.len()` bytes from `fd` at its current position.
    pub fn read(&mut self, fd: FileDescriptor, buf: &mut [u8]) -> Result<usize, KernelError> {
        if fd == STDIN {
            let mut guard = keos::teletype::serial().lock();
            let n = guard.read(buf).unwrap_or(0);
            guard.unlock();
            return Ok(n);
        }
        let entry = self.get_mut(fd)?;
        if entry.mode == FileMode::Write {
            return Err(KernelError::OperationNotPermitted);
        }
        match &mut entry.file {
            FileKind::RegularFile { file, position } => {
                let n = file.read(*position, buf)?;
                *position += n;
                Ok(n)
            }
            _ => Err(KernelError::InvalidArgument),
        }
    }

    /// Writes `buf` to `fd` at its current position.
    pub fn write(&mut self, fd: FileDescriptor, buf: &[u8]) -> Result<usize, KernelError> {
        if fd == STDOUT || fd == STDERR {
            let mut guard = keos::teletype::serial().lock();
            let n = guard.write(buf).unwrap_or(0);
            guard.unlock();
            return Ok(n);
        }
        let entry = self.get_mut(fd)?;
        if entry.mode == FileMode::Read {
            return Err(KernelError::OperationNotPermitted);
        }
        match &mut entry.file {
            FileKind::RegularFile { file, position } => {
                // A deny-written file (e.g. a running executable's image)
                // reports zero bytes written rather than failing the call.
                match file.write(*position, buf) {
                    Ok(n) => {
                        *position += n;
                        Ok(n)
                    }
                    Err(KernelError::Busy) => Ok(0),
                    Err(e) => Err(e),
                }
            }
            _ => Err(KernelError::InvalidArgument),
        }
    }

    /// Marks `fd`'s backing file deny-write, blocking further writes to its
    /// content (through any handle) until a matching [`Self::allow_write`].
    pub fn deny_write(&mut self, fd: FileDescriptor) -> Result<(), KernelError> {
        match &self.get_mut(fd)?.file {
            FileKind::RegularFile { file, .. } => {
                file.deny_write();
                Ok(())
            }
            _ => Err(KernelError::InvalidArgument),
        }
    }

    /// Clears one deny-write mark set by [`Self::deny_write`].
    pub fn allow_write(&mut self, fd: FileDescriptor) -> Result<(), KernelError> {
        match &self.get_mut(fd)?.file {
            FileKind::RegularFile { file, .. } => {
                file.allow_write();
                Ok(())
            }
            _ => Err(KernelError::InvalidArgument),
        }
    }

    /// Repositions `fd`'s offset to `pos`.
    pub fn seek(&mut self, fd: FileDescriptor, pos: usize) -> Result<(), KernelError> {
        match &mut self.get_mut(fd)?.file {
            FileKind::RegularFile { position, .. } => *position = pos,
            FileKind::Directory { position, .. } => *position = pos,
            FileKind::Stdio => return Err(KernelError::InvalidArgument),
        }
        Ok(())
    }

    /// Returns `fd`'s current offset.
    pub fn tell(&self, fd: FileDescriptor) -> Result<usize, KernelError> {
        match &self.get(fd)?.file {
            FileKind::RegularFile { position, .. } => Ok(*position),
            FileKind::Directory { position, .. } => Ok(*position),
            FileKind::Stdio => Err(KernelError::InvalidArgument),
        }
    }

    /// Returns the size in bytes of the regular file backing `fd`.
    pub fn filesize(&self, fd: FileDescriptor) -> Result<usize, KernelError> {
        match &self.get(fd)?.file {
            FileKind::RegularFile { file, .. } => Ok(file.size()),
            _ => Err(KernelError::InvalidArgument),
        }
    }

    /// Closes `fd`, dropping its underlying file handle.
    pub fn close(&mut self, fd: FileDescriptor) -> Result<(), KernelError> {
        self.files
            .remove(&fd)
            .map(|_| ())
            .ok_or(KernelError::BadFileDescriptor)
    }

    /// Closes every open descriptor, for process exit.
    pub fn close_all(&mut self) {
        self.files.clear();
    }

    /// Returns whether `fd` refers to a directory.
    pub fn isdir(&self, fd: FileDescriptor) -> Result<bool, KernelError> {
        Ok(matches!(self.get(fd)?.file, FileKind::Directory { .. }))
    }

    /// Returns the inode number backing `fd`.
    pub fn inumber(&self, fd: FileDescriptor) -> Result<InodeNumber, KernelError> {
        match &self.get(fd)?.file {
            FileKind::RegularFile { file, .. } => Ok(file.ino()),
            FileKind::Directory { dir, .. } => Ok(dir.ino()),
            FileKind::Stdio => Err(KernelError::InvalidArgument),
        }
    }

    /// Reads the next directory entry of `fd`, advancing its position.
    pub fn readdir(&mut self, fd: FileDescriptor) -> Result<Option<alloc::string::String>, KernelError> {
        let entry = self.get_mut(fd)?;
        match &mut entry.file {
            FileKind::Directory { dir, position } => {
                let entries = dir.read_dir()?;
                let next = entries.get(*position).map(|(_, name)| name.clone());
                if next.is_some() {
                    *position += 1;
                }
                Ok(next)
            }
            _ => Err(KernelError::NotDirectory),
        }
    }
}
