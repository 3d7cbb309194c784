//! End-to-end syscall dispatch tests: a real `Registers` frame with the
//! syscall number and arguments pushed onto a mapped user stack, dispatched
//! through `Process`'s `Task::syscall` exactly as `do_handle_syscall` would.
//!
//! Each test spawns its own thread with its own `Process` attached and its
//! page table loaded as the active one, since the syscall ABI's user-memory
//! access (`UserPtrRO`/`UserU8Slice*`) validates against the *currently
//! scheduled* thread's task, not whatever `Process` a test holds locally.

use alloc::boxed::Box;
use kernel::{Process, syscall::sysno};
use keos::{
    addressing::Va,
    mm::{Page, page_table::Permission, page_table::get_current_pt_pa, page_table::load_pt},
    syscall::Registers,
    task::Task,
    thread::{self, ThreadBuilder},
};

const STACK_VA: usize = 0x7fff_0000_0000;
const PATH_VA: usize = 0x7ffe_0000_0000;
const DATA_VA: usize = 0x7ffd_0000_0000;

/// Writes `sysno`/`args` onto the mapped stack page at [`STACK_VA`] and
/// drives a syscall through the current thread's attached task.
fn dispatch(sysno: usize, args: &[usize]) -> isize {
    let mut words = alloc::vec![0usize; 1 + args.len()];
    words[0] = sysno;
    words[1..].copy_from_slice(args);
    unsafe {
        core::ptr::copy_nonoverlapping(
            words.as_ptr() as *const u8,
            STACK_VA as *mut u8,
            words.len() * 8,
        );
    }

    let mut regs = Registers::new();
    *regs.rsp() = STACK_VA;
    thread::with_current(|th| th.task.as_mut().expect("task attached").syscall(&mut regs));
    regs.gprs.rax as isize
}

fn write_bytes_at(va: usize, bytes: &[u8]) {
    unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), va as *mut u8, bytes.len()) };
}

fn read_bytes_at(va: usize, out: &mut [u8]) {
    unsafe { core::ptr::copy_nonoverlapping(va as *const u8, out.as_mut_ptr(), out.len()) };
}

/// Builds a fresh process with a stack/path/data page mapped, runs `body` on
/// a dedicated thread with that process attached and its address space
/// loaded, and returns the thread's exit status.
fn with_process(body: impl FnOnce() + Send + 'static) -> i32 {
    let mut process = Process::new();
    {
        let mut pt = process.page_table().lock();
        for va in [STACK_VA, PATH_VA, DATA_VA] {
            pt.map(
                Va::new(va).unwrap(),
                Page::new(),
                Permission::READ | Permission::WRITE | Permission::USER,
            )
            .unwrap();
        }
        pt.unlock();
    }
    let pt_pa = {
        let pt = process.page_table().lock();
        let pa = pt.pa();
        pt.unlock();
        pa
    };
    let prev_pt_pa = get_current_pt_pa();

    ThreadBuilder::new("syscall_test")
        .attach_task(Box::new(process))
        .spawn(move || {
            load_pt(pt_pa);
            body();
            load_pt(prev_pt_pa);
            thread::Current::exit(0)
        })
        .join()
}

pub fn sys_create_open_write_read_close() {
    let status = with_process(|| {
        write_bytes_at(PATH_VA, b"greeting\0");

        assert_eq!(
            dispatch(sysno::CREATE, &[PATH_VA, 0]),
            1,
            "sys_create should report success"
        );

        let fd = dispatch(sysno::OPEN, &[PATH_VA, 2 /* ReadWrite */]);
        assert!(fd >= 3, "sys_open should return a fresh fd, got {}", fd);

        let payload = b"hello from a syscall";
        write_bytes_at(DATA_VA, payload);
        let n = dispatch(sysno::WRITE, &[fd as usize, DATA_VA, payload.len()]);
        assert_eq!(n as usize, payload.len());

        assert_eq!(dispatch(sysno::SEEK, &[fd as usize, 0]), 0);

        let mut back = alloc::vec![0u8; payload.len()];
        write_bytes_at(DATA_VA, &back);
        let n = dispatch(sysno::READ, &[fd as usize, DATA_VA, payload.len()]);
        assert_eq!(n as usize, payload.len());
        read_bytes_at(DATA_VA, &mut back);
        assert_eq!(&back[..], &payload[..]);

        assert_eq!(dispatch(sysno::CLOSE, &[fd as usize]), 0);
    });
    assert_eq!(status, 0);
}

pub fn sys_open_missing_file_returns_error() {
    let status = with_process(|| {
        write_bytes_at(PATH_VA, b"does-not-exist\0");
        assert_eq!(
            dispatch(sysno::OPEN, &[PATH_VA, 0]),
            -1,
            "opening a missing file should fail with -1, not terminate the process"
        );
    });
    assert_eq!(status, 0);
}

pub fn sys_mkdir_readdir_round_trip() {
    let status = with_process(|| {
        write_bytes_at(PATH_VA, b"etc\0");
        assert_eq!(dispatch(sysno::MKDIR, &[PATH_VA]), 1);

        let fd = dispatch(sysno::OPEN, &[PATH_VA, 0]);
        assert!(fd >= 3);
        assert_eq!(dispatch(sysno::ISDIR, &[fd as usize]), 1);
        assert_eq!(dispatch(sysno::CLOSE, &[fd as usize]), 0);
    });
    assert_eq!(status, 0);
}

pub fn sys_unknown_number_terminates_process() {
    // `dispatch` never returns here: an unrecognized syscall number tears the
    // process down and exits the thread with -1 (section 7's BadArgument
    // class), which `with_process` surfaces as its join status.
    let status = with_process(|| {
        dispatch(9999, &[]);
    });
    assert_eq!(status, -1);
}
