// This is test & bootstrap implementation.
#![no_std]
#![no_main]
#![allow(clippy::missing_safety_doc)]

extern crate alloc;
extern crate keos;
extern crate kernel;

mod fs_tests;
mod mm_tests;
mod syscall_tests;

use keos::SystemConfigurationBuilder;
pub use kernel::Process;

#[allow(unsafe_code)]
#[unsafe(no_mangle)]
pub unsafe fn main(_config_builder: SystemConfigurationBuilder) {
    kernel::init(true).expect("failed to bring up the file system");

    keos::TestDriver::<Process>::start([
        // File system.
        &fs_tests::create_open_write_read,
        &fs_tests::directories,
        &fs_tests::reopen_shares_growth,
        &fs_tests::stdio_descriptors_preinstalled,
        // Address space.
        &mm_tests::access_ok_normal,
        &mm_tests::access_ok_invalid,
        &mm_tests::access_ok_write_to_readonly,
        &mm_tests::frame_table_allocate_touch_free,
        &mm_tests::spt_zero_page_fault_then_resident,
        &mm_tests::spt_stack_growth_heuristic,
        // Syscall ABI.
        &syscall_tests::sys_create_open_write_read_close,
        &syscall_tests::sys_open_missing_file_returns_error,
        &syscall_tests::sys_mkdir_readdir_round_trip,
        &syscall_tests::sys_unknown_number_terminates_process,
    ]);
}

#[unsafe(no_mangle)]
pub unsafe fn ap_main() {}
