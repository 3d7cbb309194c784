//! Exercises the demand-paging stack (`kernel::frame`, `kernel::spt`) and
//! `Process::access_ok` directly, without routing through the syscall ABI.

use kernel::{
    frame::{self, EvictionTarget, ProcessId},
    page_table::PageTable,
    spt::SupplementalPageTable,
    Process,
};
use keos::{KernelError, addressing::Va, mm::page_table::Permission, task::Task};

pub fn access_ok_normal() {
    let mut process = Process::new();
    let ro = Va::new(0x1000).unwrap();
    let rw = Va::new(0x2000).unwrap();

    {
        let mut pt = process.page_table().lock();
        pt.map(ro, keos::mm::Page::new(), Permission::READ | Permission::USER)
            .unwrap();
        pt.map(
            rw,
            keos::mm::Page::new(),
            Permission::READ | Permission::WRITE | Permission::USER,
        )
        .unwrap();
        pt.unlock();
    }

    assert!(process.access_ok(ro..ro + 0xfff, false));
    assert!(process.access_ok(rw..rw + 0xfff, true));
}

pub fn access_ok_invalid() {
    let process = Process::new();
    let null_va = Va::new(0).unwrap();
    let kern = Va::new(0xFFFF_8000_0000_0000).unwrap();
    let unmapped = Va::new(0x3000).unwrap();

    assert!(!process.access_ok(null_va..null_va + 0xfff, false));
    assert!(!process.access_ok(kern..kern + 0xfff, false));
    assert!(!process.access_ok(unmapped..unmapped + 1, false));
}

pub fn access_ok_write_to_readonly() {
    let mut process = Process::new();
    let ro = Va::new(0x1000).unwrap();
    {
        let mut pt = process.page_table().lock();
        pt.map(ro, keos::mm::Page::new(), Permission::READ | Permission::USER)
            .unwrap();
        pt.unlock();
    }
    assert!(!process.access_ok(ro..ro + 0xfff, true));
}

/// A page whose content is never actually touched; just a target for the
/// frame table's eviction bookkeeping.
struct NullTarget;
impl EvictionTarget for NullTarget {
    fn evict(&self, _va: Va) -> Result<(), KernelError> {
        Ok(())
    }
}

pub fn frame_table_allocate_touch_free() {
    use alloc::sync::{Arc, Weak};
    let pid = ProcessId(usize::MAX - 1);
    let target: Arc<NullTarget> = Arc::new(NullTarget);
    let weak: Weak<dyn EvictionTarget> = Arc::downgrade(&target);
    frame::FRAME_TABLE.register_owner(pid, weak);

    let va = Va::new(0x5000).unwrap();
    let page = frame::FRAME_TABLE.allocate(pid, va).expect("allocate");
    frame::FRAME_TABLE.touch(pid, va);
    frame::FRAME_TABLE.free(pid, va);
    drop(page);

    frame::FRAME_TABLE.unregister_owner(pid);
}

pub fn spt_zero_page_fault_then_resident() {
    let mut pt = PageTable::new();
    let spt = SupplementalPageTable::new(ProcessId(usize::MAX - 2));
    let va = Va::new(0x10000).unwrap();

    spt.install_zero_page(va, true).unwrap();
    assert!(spt.contains(va));
    assert_eq!(spt.writable_at(va), Some(true));

    assert!(matches!(spt.load_page(&mut pt, va), Some(Ok(()))));
    assert!(pt.walk(va).is_ok());

    // A second fault on the now-resident page is a cheap touch, not a reload.
    assert!(matches!(spt.load_page(&mut pt, va), Some(Ok(()))));

    spt.free(&mut pt, va).unwrap();
    assert!(!spt.contains(va));
}

pub fn spt_stack_growth_heuristic() {
    let mut pt = PageTable::new();
    let spt = SupplementalPageTable::new(ProcessId(usize::MAX - 3));
    let user_rsp = Va::new(0x7fff_ffff_e000).unwrap();
    let grows_into = Va::new(user_rsp.into_usize() - 16).unwrap();
    let too_far = Va::new(user_rsp.into_usize() - 0x10_0000).unwrap();

    assert!(spt.handle_fault(&mut pt, grows_into, user_rsp).is_ok());
    assert!(pt.walk(grows_into.page_down()).is_ok());

    assert!(spt.handle_fault(&mut pt, too_far, user_rsp).is_err());
}
