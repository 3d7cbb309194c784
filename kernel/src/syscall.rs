//! System call ABI for this kernel's trap convention.
//!
//! Unlike `keos-project1/src/syscall.rs`'s register-passed arguments
//! (`%rdi`/`%rsi`/... per the x86_64 SysV convention), this kernel's
//! trap-entry glue pushes the syscall number and its arguments onto the
//! user stack before invoking `syscall`, Pintos-style: the syscall number
//! sits at the saved user `%rsp`, and argument `n` (0-indexed) sits at
//! `%rsp + 8*(n+1)`. Every read goes through [`UserPtrRO`] so a malicious
//! or wild stack pointer faults cleanly instead of touching unchecked
//! memory.

use keos::{
    KernelError,
    syscall::{Registers, uaccess::UserPtrRO},
};

/// Syscall numbers dispatched by [`crate::process::Process::syscall`].
pub mod sysno {
    pub const HALT: usize = 0;
    pub const EXIT: usize = 1;
    pub const EXEC: usize = 2;
    pub const WAIT: usize = 3;
    pub const CREATE: usize = 4;
    pub const REMOVE: usize = 5;
    pub const OPEN: usize = 6;
    pub const FILESIZE: usize = 7;
    pub const READ: usize = 8;
    pub const WRITE: usize = 9;
    pub const SEEK: usize = 10;
    pub const TELL: usize = 11;
    pub const CLOSE: usize = 12;
    pub const MMAP: usize = 13;
    pub const MUNMAP: usize = 14;
    pub const CHDIR: usize = 15;
    pub const MKDIR: usize = 16;
    pub const READDIR: usize = 17;
    pub const ISDIR: usize = 18;
    pub const INUMBER: usize = 19;
}

/// A parsed, not-yet-dispatched system call: the syscall number plus a
/// handle for reading its argument slots off the user stack and for
/// writing the eventual return value back to the trap frame.
pub struct SyscallAbi<'a> {
    /// The system call number read from the user stack pointer.
    pub sysno: usize,
    stack_rsp: usize,
    regs: &'a mut Registers,
}

impl<'a> SyscallAbi<'a> {
    /// Reads the syscall number off the user stack pointer saved in `regs`.
    ///
    /// Fails with [`KernelError::BadAddress`] if that address is not a
    /// readable user page.
    pub fn from_registers(regs: &'a mut Registers) -> Result<Self, KernelError> {
        let rsp = *regs.rsp();
        let sysno = UserPtrRO::<usize>::new(rsp).get()?;
        Ok(Self {
            sysno,
            stack_rsp: rsp,
            regs,
        })
    }

    /// Reads argument slot `n` (0-indexed), validating its address first.
    pub fn arg(&self, n: usize) -> Result<usize, KernelError> {
        UserPtrRO::<usize>::new(self.stack_rsp + 8 * (n + 1)).get()
    }

    /// The user stack pointer as saved at trap entry, for the stack-growth
    /// heuristic in [`crate::spt`].
    pub fn user_rsp(&self) -> usize {
        self.stack_rsp
    }

    /// Writes the syscall's outcome into `%rax`, converting an `Err` into
    /// its negative error code via [`KernelError::into_usize`].
    pub fn set_return_value(self, return_val: Result<usize, KernelError>) {
        self.regs.gprs.rax = match return_val {
            Ok(v) => v,
            Err(e) => e.into_usize(),
        };
    }
}
