//! The per-user-process [`Task`] implementation: ties the file-descriptor
//! table, supplemental page table, and memory maps together behind the
//! platform's syscall/page-fault seam, and owns the parent/child exit
//! rendezvous.
//!
//! Grounded on `keos-projects/keos-project3/src/process.rs`'s minimal
//! `Process { file_struct, mm_struct }` shape. Unlike that project, address
//! space state is split into a hardware [`PageTable`] plus a
//! [`SupplementalPageTable`] (section 4.7), and there is no `fork`/`exec`
//! here (section 4.11: process creation is exec-based and the ELF
//! loader/trap-entry glue that would build a fresh address space is out of
//! scope) — only the exit/wait rendezvous and teardown sequence, built on
//! the platform's own thread-join idiom (`keos::thread::JoinHandle`) instead
//! of a bespoke wait queue.

use crate::{
    file_struct::{FileDescriptor, FileStruct},
    frame::{self, EvictionTarget, ProcessId},
    page_table::PageTable,
    spt::{MmapTable, SupplementalPageTable},
    syscall::{SyscallAbi, sysno},
};
use alloc::{
    collections::BTreeMap,
    string::String,
    sync::{Arc, Weak},
    vec,
};
use core::{
    ops::Range,
    sync::atomic::{AtomicUsize, Ordering},
};
use keos::{
    KernelError,
    addressing::Va,
    mm::page_table::PteFlags,
    sync::SpinLock,
    syscall::{
        Registers,
        flags::FileMode,
        uaccess::{UserCString, UserU8SliceRO, UserU8SliceWO},
    },
    task::{PFErrorCode, Task},
    thread::{self, Current, JoinHandle, kill_current_thread},
};

static NEXT_PID: AtomicUsize = AtomicUsize::new(1);

/// Whether `e` belongs to the "BadArgument" class that section 7 says always
/// terminates the calling process, as opposed to an error that just fails
/// the syscall.
fn is_bad_argument(e: &KernelError) -> bool {
    matches!(
        e,
        KernelError::InvalidArgument
            | KernelError::BadAddress
            | KernelError::InvalidAccess
            | KernelError::NameTooLong
    )
}

/// Reads the user stack pointer saved in the trap frame of whatever fault or
/// trap the current thread is handling, via the same `Thread::interrupt_frame`
/// slot the scheduler uses to save/restore it across context switches.
fn current_trap_user_rsp() -> Option<Va> {
    thread::with_current(|th| {
        let guard = th.interrupt_frame.lock();
        let ptr = *guard;
        guard.unlock();
        if ptr.is_null() {
            None
        } else {
            // Safety: `ptr` was stashed by `handle_page_fault`/`do_handle_syscall`
            // from a `&mut Registers` that is still live on the interrupted
            // thread's kernel stack for the duration of this trap.
            let regs = unsafe { &mut *(ptr as *mut Registers) };
            Va::new(*regs.rsp())
        }
    })
}

/// The shared, referable half of a process's state. Split out of [`Process`]
/// so an `Arc` of it can be registered with [`frame::FRAME_TABLE`] as a
/// `Weak<dyn EvictionTarget>`, while [`Process`] itself stays the uniquely
/// owned `Box<dyn Task>` the platform's `Thread` holds (`Task::syscall` takes
/// `&mut self`, which an `Arc`-shared value cannot offer).
struct ProcessInner {
    pid: ProcessId,
    page_table: SpinLock<PageTable>,
    spt: SupplementalPageTable,
    mmap: MmapTable,
    files: SpinLock<FileStruct>,
    children: SpinLock<BTreeMap<u64, JoinHandle>>,
}

impl ProcessInner {
    fn new(pid: ProcessId) -> Self {
        Self {
            pid,
            page_table: SpinLock::new(PageTable::new()),
            spt: SupplementalPageTable::new(pid),
            mmap: MmapTable::new(),
            files: SpinLock::new(FileStruct::new()),
            children: SpinLock::new(BTreeMap::new()),
        }
    }
}

impl EvictionTarget for ProcessInner {
    fn evict(&self, va: Va) -> Result<(), KernelError> {
        let mut pt = self.page_table.lock();
        let r = self.spt.evict(&mut pt, va);
        pt.unlock();
        r
    }
}

/// A user process, and the `Task` the scheduler drives on every trap from
/// user mode.
pub struct Process {
    inner: Arc<ProcessInner>,
}

impl Process {
    /// Creates a fresh process and registers it as a frame-table eviction
    /// target. Address-space population (mapping the ELF image, installing
    /// the initial stack SPE) is the out-of-scope loader's job, done before
    /// the thread wrapping this `Process` is first scheduled.
    pub fn new() -> Self {
        let pid = ProcessId(NEXT_PID.fetch_add(1, Ordering::SeqCst));
        let inner = Arc::new(ProcessInner::new(pid));
        let target: Weak<dyn EvictionTarget> = Arc::downgrade(&inner);
        frame::FRAME_TABLE.register_owner(pid, target);
        info!("Process {:?} created.", pid);
        Self { inner }
    }

    /// This process's identifier, also its thread id (the process/thread
    /// model is 1:1 here).
    pub fn pid(&self) -> ProcessId {
        self.inner.pid
    }

    /// Grants direct access to the page table, for the out-of-scope loader
    /// to populate before first run.
    pub fn page_table(&self) -> &SpinLock<PageTable> {
        &self.inner.page_table
    }

    /// Grants direct access to the supplemental page table, for the
    /// out-of-scope loader to install the executable's segment SPEs.
    pub fn spt(&self) -> &SupplementalPageTable {
        &self.inner.spt
    }

    /// Registers `handle` as a waitable child of this process.
    pub fn adopt_child(&self, handle: JoinHandle) {
        let mut guard = self.inner.children.lock();
        guard.insert(handle.tid, handle);
        guard.unlock();
    }

    fn read_path(&self, addr: usize) -> Result<String, KernelError> {
        UserCString::new(addr).read()
    }

    /// Closes every descriptor, writes back and tears down every mapping,
    /// frees every SPE, and drops this process's frame-table registration —
    /// the full release sequence of section 4.11.
    fn teardown(&self) {
        let mut files = self.inner.files.lock();
        files.close_all();
        files.unlock();

        let mut pt = self.inner.page_table.lock();
        self.inner.mmap.close_all(&self.inner.spt, &mut pt);
        self.inner.spt.free_all(&mut pt);
        pt.unlock();

        frame::FRAME_TABLE.unregister_owner(self.inner.pid);
        info!("Process {:?} exited.", self.inner.pid);
    }

    fn sys_halt(&mut self) -> Result<usize, KernelError> {
        keos::power::shutdown()
    }

    fn sys_exit(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let status = abi.arg(0)? as i32;
        self.teardown();
        Current::exit(status)
    }

    fn sys_wait(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let tid = abi.arg(0)? as u64;
        let mut guard = self.inner.children.lock();
        let handle = guard.remove(&tid);
        guard.unlock();
        match handle {
            Some(h) => Ok(h.join() as isize as usize),
            None => Ok(-1isize as usize),
        }
    }

    fn sys_create(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let path = self.read_path(abi.arg(0)?)?;
        let _initial_size = abi.arg(1)?;
        let mut files = self.inner.files.lock();
        let r = files.create(&path, false);
        files.unlock();
        match r {
            Ok(()) => Ok(1),
            Err(e) if is_bad_argument(&e) => Err(e),
            Err(_) => Ok(0),
        }
    }

    fn sys_mkdir(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let path = self.read_path(abi.arg(0)?)?;
        let mut files = self.inner.files.lock();
        let r = files.create(&path, true);
        files.unlock();
        match r {
            Ok(()) => Ok(1),
            Err(e) if is_bad_argument(&e) => Err(e),
            Err(_) => Ok(0),
        }
    }

    fn sys_remove(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let path = self.read_path(abi.arg(0)?)?;
        let mut files = self.inner.files.lock();
        let r = files.remove(&path);
        files.unlock();
        match r {
            Ok(()) => Ok(1),
            Err(e) if is_bad_argument(&e) => Err(e),
            Err(_) => Ok(0),
        }
    }

    fn sys_chdir(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let path = self.read_path(abi.arg(0)?)?;
        let mut files = self.inner.files.lock();
        let r = files.chdir(&path);
        files.unlock();
        match r {
            Ok(()) => Ok(1),
            Err(e) if is_bad_argument(&e) => Err(e),
            Err(_) => Ok(0),
        }
    }

    fn sys_open(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let path = self.read_path(abi.arg(0)?)?;
        let mode = match abi.arg(1)? {
            0 => FileMode::Read,
            1 => FileMode::Write,
            2 => FileMode::ReadWrite,
            _ => return Err(KernelError::InvalidArgument),
        };
        let mut files = self.inner.files.lock();
        let r = files.open(&path, mode);
        files.unlock();
        r.map(|fd| fd.0 as usize)
    }

    fn sys_filesize(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let fd = FileDescriptor(abi.arg(0)? as i32);
        let files = self.inner.files.lock();
        let r = files.filesize(fd);
        files.unlock();
        r
    }

    fn sys_read(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let fd = FileDescriptor(abi.arg(0)? as i32);
        let addr = abi.arg(1)?;
        let len = abi.arg(2)?;
        let mut buf = vec![0u8; len];
        let mut files = self.inner.files.lock();
        let r = files.read(fd, &mut buf);
        files.unlock();
        let n = r?;
        UserU8SliceWO::new(addr, n).put(&buf[..n])?;
        Ok(n)
    }

    fn sys_write(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let fd = FileDescriptor(abi.arg(0)? as i32);
        let addr = abi.arg(1)?;
        let len = abi.arg(2)?;
        let buf = UserU8SliceRO::new(addr, len).get()?;
        let mut files = self.inner.files.lock();
        let r = files.write(fd, &buf);
        files.unlock();
        r
    }

    fn sys_seek(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let fd = FileDescriptor(abi.arg(0)? as i32);
        let pos = abi.arg(1)?;
        let mut files = self.inner.files.lock();
        let r = files.seek(fd, pos);
        files.unlock();
        r.map(|_| 0)
    }

    fn sys_tell(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let fd = FileDescriptor(abi.arg(0)? as i32);
        let files = self.inner.files.lock();
        let r = files.tell(fd);
        files.unlock();
        r
    }

    fn sys_close(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let fd = FileDescriptor(abi.arg(0)? as i32);
        let mut files = self.inner.files.lock();
        let r = files.close(fd);
        files.unlock();
        r.map(|_| 0)
    }

    fn sys_mmap(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let fd = FileDescriptor(abi.arg(0)? as i32);
        let addr = abi.arg(1)?;
        let writable = abi.arg(2)? != 0;
        let va = Va::new(addr).ok_or(KernelError::InvalidArgument)?;
        let files = self.inner.files.lock();
        let file = files.regular_file(fd);
        files.unlock();
        let file = file?;
        self.inner.mmap.mmap(&self.inner.spt, file, va, writable)
    }

    fn sys_munmap(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let id = abi.arg(0)?;
        let mut pt = self.inner.page_table.lock();
        let r = self.inner.mmap.munmap(&self.inner.spt, &mut pt, id);
        pt.unlock();
        r.map(|_| 0)
    }

    fn sys_readdir(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let fd = FileDescriptor(abi.arg(0)? as i32);
        let addr = abi.arg(1)?;
        let maxlen = abi.arg(2)?;
        let mut files = self.inner.files.lock();
        let r = files.readdir(fd);
        files.unlock();
        match r {
            Ok(Some(name)) => {
                let mut bytes = name.into_bytes();
                bytes.truncate(maxlen.saturating_sub(1));
                bytes.push(0);
                UserU8SliceWO::new(addr, bytes.len()).put(&bytes)?;
                Ok(1)
            }
            Ok(None) => Ok(0),
            Err(e) if is_bad_argument(&e) => Err(e),
            Err(_) => Ok(0),
        }
    }

    fn sys_isdir(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let fd = FileDescriptor(abi.arg(0)? as i32);
        let files = self.inner.files.lock();
        let r = files.isdir(fd);
        files.unlock();
        match r {
            Ok(b) => Ok(b as usize),
            Err(e) if is_bad_argument(&e) => Err(e),
            Err(_) => Ok(0),
        }
    }

    fn sys_inumber(&mut self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let fd = FileDescriptor(abi.arg(0)? as i32);
        let files = self.inner.files.lock();
        let r = files.inumber(fd);
        files.unlock();
        r.map(|ino| ino.into_u32() as usize)
    }

    fn dispatch(&mut self, sysno: usize, abi: &SyscallAbi) -> Result<usize, KernelError> {
        match sysno {
            sysno::HALT => self.sys_halt(),
            sysno::EXIT => self.sys_exit(abi),
            sysno::EXEC => Err(KernelError::NoExec),
            sysno::WAIT => self.sys_wait(abi),
            sysno::CREATE => self.sys_create(abi),
            sysno::REMOVE => self.sys_remove(abi),
            sysno::OPEN => self.sys_open(abi),
            sysno::FILESIZE => self.sys_filesize(abi),
            sysno::READ => self.sys_read(abi),
            sysno::WRITE => self.sys_write(abi),
            sysno::SEEK => self.sys_seek(abi),
            sysno::TELL => self.sys_tell(abi),
            sysno::CLOSE => self.sys_close(abi),
            sysno::MMAP => self.sys_mmap(abi),
            sysno::MUNMAP => self.sys_munmap(abi),
            sysno::CHDIR => self.sys_chdir(abi),
            sysno::MKDIR => self.sys_mkdir(abi),
            sysno::READDIR => self.sys_readdir(abi),
            sysno::ISDIR => self.sys_isdir(abi),
            sysno::INUMBER => self.sys_inumber(abi),
            _ => {
                self.teardown();
                Current::exit(-1)
            }
        }
    }
}

impl Default for Process {
    fn default() -> Self {
        Self::new()
    }
}

impl Task for Process {
    fn syscall(&mut self, registers: &mut Registers) {
        let abi = match SyscallAbi::from_registers(registers) {
            Ok(abi) => abi,
            Err(_) => {
                self.teardown();
                Current::exit(-1)
            }
        };
        let sysno = abi.sysno;
        match self.dispatch(sysno, &abi) {
            Ok(v) => abi.set_return_value(Ok(v)),
            Err(e) if e == KernelError::IOError => {
                panic!("fatal I/O error servicing syscall {}", sysno)
            }
            Err(e) if is_bad_argument(&e) => {
                self.teardown();
                Current::exit(-1);
            }
            Err(_) => abi.set_return_value(Ok(-1isize as usize)),
        }
    }

    fn page_fault(&mut self, ec: PFErrorCode, cr2: Va) {
        if (ec & PFErrorCode::USER) != PFErrorCode::USER {
            panic!(
                "Unexpected page fault in Kernel at {:?} because of {:?}",
                cr2, ec
            );
        }
        let Some(user_rsp) = current_trap_user_rsp() else {
            kill_current_thread();
        };
        let mut pt = self.inner.page_table.lock();
        let resolved = self.inner.spt.handle_fault(&mut pt, cr2, user_rsp);
        pt.unlock();
        if resolved.is_err() {
            self.teardown();
            kill_current_thread();
        }
    }

    fn access_ok(&self, addr: Range<Va>, is_write: bool) -> bool {
        const USER_TOP: usize = 0xffff_8000_0000_0000;
        if addr.start.into_usize() == 0 || addr.start.into_usize() >= USER_TOP {
            return false;
        }
        if addr.end.into_usize() > addr.start.into_usize() && addr.end.into_usize() > USER_TOP {
            return false;
        }
        let pt = self.inner.page_table.lock();
        let mut cur = addr.start.page_down().into_usize();
        let end = addr.end.into_usize();
        while cur < end {
            let va = Va::new(cur).unwrap();
            let ok = match pt.walk(va) {
                Ok(pte) => !is_write || pte.flags().contains(PteFlags::RW),
                Err(_) => match self.inner.spt.writable_at(va) {
                    Some(w) => !is_write || w,
                    None => false,
                },
            };
            if !ok {
                pt.unlock();
                return false;
            }
            cur += 0x1000;
        }
        pt.unlock();
        true
    }
}
