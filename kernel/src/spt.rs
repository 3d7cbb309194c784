//! Supplemental page table: per-process registry of demand-paged virtual
//! addresses, backing the lazy-loading and eviction machinery that a
//! hardware page table alone cannot express.
//!
//! Grounded on `keos-projects/keos-project3/src/lazy_pager.rs`'s
//! `PageFaultReason`/`LazyPager::do_lazy_load` shape, but with the
//! `MmLoader`/`Pager` trait split collapsed into one concrete tagged-union
//! entry (`SpeKind`) per section 4.7, and the page table passed in by every
//! caller rather than owned here — this table outlives no particular
//! [`crate::page_table::PageTable`] borrow.

use crate::{
    frame::{self, ProcessId},
    page_table::PageTable,
    swap::{self, SwapSlot},
};
use alloc::collections::BTreeMap;
use keos::{
    KernelError,
    addressing::Va,
    fs::RegularFile,
    mm::PageRef,
    mm::page_table::{Permission, PteFlags},
    sync::SpinLock,
};

const PAGE_SIZE: usize = 0x1000;
/// A page fault within this many bytes below the saved user stack pointer is
/// treated as stack growth rather than a segfault.
const STACK_GROWTH_SLACK: usize = 32;

/// The content source backing one supplemental page table entry.
enum SpeKind {
    /// Not yet loaded; the frame, once allocated, is zero-filled.
    AllZero,
    /// Resident: a frame is mapped and holds the entry's content.
    OnFrame,
    /// Evicted to the swap device.
    InSwap(SwapSlot),
    /// A page of an `mmap`ed file. Stays tagged `FileMapped` across the
    /// frame/swap transition (`resident` tracks which), since eviction must
    /// keep writing back to `file` rather than ever falling through to swap.
    FileMapped {
        file: RegularFile,
        file_offset: usize,
        file_bytes: usize,
        zero_bytes: usize,
        resident: bool,
    },
    /// A copy-on-first-load page of a loaded executable segment. Once
    /// loaded, converts to `OnFrame`: later evictions of this address behave
    /// like ordinary anonymous memory and go to swap, per 4.7.
    FileSegment {
        file: RegularFile,
        file_offset: usize,
        file_bytes: usize,
        zero_bytes: usize,
    },
}

struct Spe {
    kind: SpeKind,
    writable: bool,
}

/// Per-process registry of supplemental page table entries, keyed by the
/// page-aligned user virtual address they back.
pub struct SupplementalPageTable {
    pid: ProcessId,
    entries: SpinLock<BTreeMap<Va, Spe>>,
}

impl SupplementalPageTable {
    pub fn new(pid: ProcessId) -> Self {
        Self {
            pid,
            entries: SpinLock::new(BTreeMap::new()),
        }
    }

    fn perm(writable: bool) -> Permission {
        let mut perm = Permission::READ | Permission::USER;
        if writable {
            perm |= Permission::WRITE;
        }
        perm
    }

    /// Installs a demand-zero page at `va`.
    pub fn install_zero_page(&self, va: Va, writable: bool) -> Result<(), KernelError> {
        let mut guard = self.entries.lock();
        if guard.contains_key(&va) {
            guard.unlock();
            return Err(KernelError::InvalidArgument);
        }
        guard.insert(
            va,
            Spe {
                kind: SpeKind::AllZero,
                writable,
            },
        );
        guard.unlock();
        Ok(())
    }

    /// Installs a page backed by a memory-mapped file region.
    pub fn install_mapped_page(
        &self,
        va: Va,
        writable: bool,
        file: RegularFile,
        file_offset: usize,
        file_bytes: usize,
        zero_bytes: usize,
    ) -> Result<(), KernelError> {
        let mut guard = self.entries.lock();
        if guard.contains_key(&va) {
            guard.unlock();
            return Err(KernelError::InvalidArgument);
        }
        guard.insert(
            va,
            Spe {
                kind: SpeKind::FileMapped {
                    file,
                    file_offset,
                    file_bytes,
                    zero_bytes,
                    resident: false,
                },
                writable,
            },
        );
        guard.unlock();
        Ok(())
    }

    /// Installs a copy-on-first-load executable segment page.
    pub fn install_segment_page(
        &self,
        va: Va,
        writable: bool,
        file: RegularFile,
        file_offset: usize,
        file_bytes: usize,
        zero_bytes: usize,
    ) -> Result<(), KernelError> {
        let mut guard = self.entries.lock();
        if guard.contains_key(&va) {
            guard.unlock();
            return Err(KernelError::InvalidArgument);
        }
        guard.insert(
            va,
            Spe {
                kind: SpeKind::FileSegment {
                    file,
                    file_offset,
                    file_bytes,
                    zero_bytes,
                },
                writable,
            },
        );
        guard.unlock();
        Ok(())
    }

    /// Returns whether an SPE is registered for `va`.
    pub fn contains(&self, va: Va) -> bool {
        let guard = self.entries.lock();
        let has = guard.contains_key(&va);
        guard.unlock();
        has
    }

    /// Returns the writability an SPE at `va` was installed with, for
    /// `Task::access_ok` to check against an unfaulted-but-backed page.
    pub fn writable_at(&self, va: Va) -> Option<bool> {
        let guard = self.entries.lock();
        let w = guard.get(&va).map(|spe| spe.writable);
        guard.unlock();
        w
    }

    /// The page-fault worker. Returns `None` if no SPE covers `va` (not our
    /// fault); `Some(Ok(()))` once the page is present and mapped.
    pub fn load_page(
        &self,
        page_table: &mut PageTable,
        va: Va,
    ) -> Option<Result<(), KernelError>> {
        let mut guard = self.entries.lock();
        let spe = guard.get_mut(&va)?;
        if matches!(spe.kind, SpeKind::OnFrame)
            || matches!(
                spe.kind,
                SpeKind::FileMapped {
                    resident: true,
                    ..
                }
            )
        {
            guard.unlock();
            frame::FRAME_TABLE.touch(self.pid, va);
            return Some(Ok(()));
        }
        let writable = spe.writable;
        let result = (|| -> Result<(), KernelError> {
            let mut page = frame::FRAME_TABLE.allocate(self.pid, va)?;
            match &mut spe.kind {
                SpeKind::AllZero => {
                    page.inner_mut().fill(0);
                }
                SpeKind::OnFrame => unreachable!(),
                SpeKind::InSwap(slot) => {
                    let buf: &mut [u8; PAGE_SIZE] = page.inner_mut().try_into().unwrap();
                    swap::get().read(*slot, buf)?;
                }
                SpeKind::FileMapped {
                    file,
                    file_offset,
                    file_bytes,
                    zero_bytes,
                    ..
                } => {
                    page.inner_mut()[*file_bytes..*file_bytes + *zero_bytes].fill(0);
                    file.read(*file_offset, &mut page.inner_mut()[..*file_bytes])?;
                }
                SpeKind::FileSegment {
                    file,
                    file_offset,
                    file_bytes,
                    zero_bytes,
                } => {
                    page.inner_mut()[*file_bytes..*file_bytes + *zero_bytes].fill(0);
                    file.read(*file_offset, &mut page.inner_mut()[..*file_bytes])?;
                }
            }
            page_table
                .map(va, page, Self::perm(writable))
                .map_err(|_| KernelError::InvalidArgument)?;
            Ok(())
        })();
        if result.is_ok() {
            spe.kind = match &spe.kind {
                SpeKind::FileMapped {
                    file,
                    file_offset,
                    file_bytes,
                    zero_bytes,
                    ..
                } => SpeKind::FileMapped {
                    file: file.clone(),
                    file_offset: *file_offset,
                    file_bytes: *file_bytes,
                    zero_bytes: *zero_bytes,
                    resident: true,
                },
                _ => SpeKind::OnFrame,
            };
        }
        guard.unlock();
        Some(result)
    }

    /// Frees every remaining SPE, for process exit.
    pub fn free_all(&self, page_table: &mut PageTable) {
        let vas: alloc::vec::Vec<Va> = {
            let guard = self.entries.lock();
            let vas = guard.keys().copied().collect();
            guard.unlock();
            vas
        };
        for va in vas {
            let _ = self.free(page_table, va);
        }
    }

    /// Tears down the SPE at `va`: writes back a dirty mapped page, releases
    /// its frame or swap slot, and removes it from the table. Called for
    /// ordinary `munmap`/exit teardown, not for eviction (see
    /// [`Self::evict`]).
    pub fn free(&self, page_table: &mut PageTable, va: Va) -> Result<(), KernelError> {
        let mut guard = self.entries.lock();
        let Some(spe) = guard.remove(&va) else {
            guard.unlock();
            return Ok(());
        };
        let dirty = page_table
            .walk(va)
            .map(|pte| pte.flags().contains(PteFlags::D))
            .unwrap_or(false);
        let result = (|| -> Result<(), KernelError> {
            match spe.kind {
                SpeKind::AllZero => Ok(()),
                SpeKind::OnFrame => {
                    page_table.unmap(va).map_err(|_| KernelError::InvalidArgument)?;
                    frame::FRAME_TABLE.free(self.pid, va);
                    Ok(())
                }
                SpeKind::InSwap(slot) => {
                    swap::get().free(slot);
                    Ok(())
                }
                SpeKind::FileMapped {
                    file,
                    file_offset,
                    file_bytes,
                    resident,
                    ..
                } => {
                    if resident {
                        if dirty {
                            let page =
                                page_table.unmap(va).map_err(|_| KernelError::InvalidArgument)?;
                            file.write(file_offset, &page.inner()[..file_bytes])?;
                        } else {
                            page_table.unmap(va).map_err(|_| KernelError::InvalidArgument)?;
                        }
                        frame::FRAME_TABLE.free(self.pid, va);
                    }
                    Ok(())
                }
                SpeKind::FileSegment { .. } => Ok(()),
            }
        })();
        guard.unlock();
        result
    }

    /// Evicts the resident page at `va` on behalf of [`frame::FrameTable`]:
    /// migrates its content per section 4.6 and clears the owner's hardware
    /// mapping, but leaves the SPE itself registered (re-tagged) for a
    /// future [`Self::load_page`].
    ///
    /// The victim is only unmapped, reclaimed, and re-tagged once its
    /// content has actually been preserved (written to swap or its backing
    /// file). A store failure (e.g. swap exhaustion) leaves the mapping, the
    /// frame-table entry, and `spe.kind` exactly as they were: the caller
    /// sees the error and the page stays ON_FRAME, resident and readable.
    pub fn evict(&self, page_table: &mut PageTable, va: Va) -> Result<(), KernelError> {
        let mut guard = self.entries.lock();
        let Some(spe) = guard.get_mut(&va) else {
            guard.unlock();
            return Ok(());
        };
        let Ok(pte) = page_table.walk(va) else {
            guard.unlock();
            return Ok(());
        };
        let dirty = pte.flags().contains(PteFlags::D);
        let Some(pa) = pte.pa() else {
            guard.unlock();
            return Ok(());
        };
        // A non-owning peek at the still-mapped frame: eviction must not take
        // the page away from the live mapping until the content is safely
        // stored elsewhere.
        let peek = unsafe { PageRef::from_pa(pa) };

        let result = (|| -> Result<(), KernelError> {
            match &mut spe.kind {
                SpeKind::FileMapped {
                    file,
                    file_offset,
                    file_bytes,
                    resident,
                    ..
                } => {
                    if dirty {
                        file.write(*file_offset, &peek.inner()[..*file_bytes])?;
                    }
                    *resident = false;
                    Ok(())
                }
                kind @ (SpeKind::FileSegment { .. } | SpeKind::OnFrame) => {
                    let buf: &[u8; PAGE_SIZE] = peek.inner().try_into().unwrap();
                    let slot = swap::get().store(buf)?;
                    *kind = SpeKind::InSwap(slot);
                    Ok(())
                }
                SpeKind::AllZero | SpeKind::InSwap(_) => {
                    // Not resident; the frame table should never have offered
                    // this entry as a victim.
                    Err(KernelError::InvalidArgument)
                }
            }
        })();

        if result.is_ok() {
            let _ = page_table.unmap(va);
            frame::FRAME_TABLE.free(self.pid, va);
        }
        guard.unlock();
        result
    }

    /// Handles a user-mode page fault at `cr2`, consulting `user_rsp` (the
    /// user stack pointer saved at trap entry) for the stack-growth heuristic.
    /// Returns `Ok(())` if the fault was resolved and the instruction may be
    /// retried, `Err(())` if the process should be terminated.
    pub fn handle_fault(
        &self,
        page_table: &mut PageTable,
        cr2: Va,
        user_rsp: Va,
    ) -> Result<(), ()> {
        let va = cr2.page_down();
        match self.load_page(page_table, va) {
            Some(Ok(())) => return Ok(()),
            Some(Err(_)) => return Err(()),
            None => {}
        }
        let is_stack_growth = cr2.into_usize() + STACK_GROWTH_SLACK >= user_rsp.into_usize();
        if is_stack_growth {
            if self.install_zero_page(va, true).is_ok() {
                if let Some(Ok(())) = self.load_page(page_table, va) {
                    return Ok(());
                }
            }
        }
        Err(())
    }
}

/// A process's memory-mapped-file registration, returned to userspace as an
/// opaque identifier.
pub struct Mapping {
    pub file: RegularFile,
    pub base: Va,
    pub page_count: usize,
}

/// Per-process table of active `mmap` regions, keyed by map id.
pub struct MmapTable {
    next_id: SpinLock<usize>,
    mappings: SpinLock<BTreeMap<usize, Mapping>>,
}

impl MmapTable {
    pub fn new() -> Self {
        Self {
            next_id: SpinLock::new(1),
            mappings: SpinLock::new(BTreeMap::new()),
        }
    }

    /// Validates and installs an `mmap` of `file` at `base`, delegating the
    /// per-page SPE installation to `spt`. Returns the new mapping's id.
    pub fn mmap(
        &self,
        spt: &SupplementalPageTable,
        file: RegularFile,
        base: Va,
        writable: bool,
    ) -> Result<usize, KernelError> {
        if base.offset() != 0 || base.into_usize() == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let length = file.size();
        if length == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let page_count = length.div_ceil(PAGE_SIZE);
        for i in 0..page_count {
            let va = Va::new(base.into_usize() + i * PAGE_SIZE).ok_or(KernelError::InvalidArgument)?;
            if spt.contains(va) {
                return Err(KernelError::InvalidArgument);
            }
        }
        for i in 0..page_count {
            let va = Va::new(base.into_usize() + i * PAGE_SIZE).unwrap();
            let file_offset = i * PAGE_SIZE;
            let file_bytes = core::cmp::min(PAGE_SIZE, length - file_offset);
            let zero_bytes = PAGE_SIZE - file_bytes;
            spt.install_mapped_page(
                va,
                writable,
                file.clone(),
                file_offset,
                file_bytes,
                zero_bytes,
            )?;
        }
        let mut id_guard = self.next_id.lock();
        let id = *id_guard;
        *id_guard += 1;
        id_guard.unlock();
        let mut guard = self.mappings.lock();
        guard.insert(
            id,
            Mapping {
                file,
                base,
                page_count,
            },
        );
        guard.unlock();
        Ok(id)
    }

    /// Writes back dirty pages and frees every SPE of mapping `id`.
    pub fn munmap(
        &self,
        spt: &SupplementalPageTable,
        page_table: &mut PageTable,
        id: usize,
    ) -> Result<(), KernelError> {
        let mut guard = self.mappings.lock();
        let Some(mapping) = guard.remove(&id) else {
            guard.unlock();
            return Err(KernelError::InvalidArgument);
        };
        guard.unlock();
        for i in 0..mapping.page_count {
            let va = Va::new(mapping.base.into_usize() + i * PAGE_SIZE).unwrap();
            spt.free(page_table, va)?;
        }
        Ok(())
    }

    /// Frees every remaining mapping, for process exit.
    pub fn close_all(&self, spt: &SupplementalPageTable, page_table: &mut PageTable) {
        let ids: alloc::vec::Vec<usize> = {
            let guard = self.mappings.lock();
            let ids = guard.keys().copied().collect();
            guard.unlock();
            ids
        };
        for id in ids {
            let _ = self.munmap(spt, page_table, id);
        }
    }
}

impl Default for MmapTable {
    fn default() -> Self {
        Self::new()
    }
}

