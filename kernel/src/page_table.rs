//! Four-level page table for x86_64 user address spaces.
//!
//! A [`PageTable`] owns the user half (pml4 indices below
//! [`PageTableRoot::KBASE`]) of a process's address space. The kernel half is
//! shared and copied in at construction time via
//! [`PageTableRoot::new_boxed_with_kernel_addr`].

use alloc::boxed::Box;
use core::ops::Deref;
use keos::{
    addressing::{Kva, Pa, Va},
    mm::{Page, page_table::*},
};

/// Page table indices decomposed from a page-aligned virtual address.
pub struct PtIndices {
    /// The virtual address this breakdown was derived from.
    pub va: Va,
    /// Page Map Level 4 index.
    pub pml4ei: usize,
    /// Page Directory Pointer Table index.
    pub pdptei: usize,
    /// Page Directory index.
    pub pdei: usize,
    /// Page Table index.
    pub ptei: usize,
}

impl PtIndices {
    /// Extracts the four nine-bit indices from a page-aligned virtual
    /// address.
    pub fn from_va(va: Va) -> Result<Self, PageTableMappingError> {
        let addr = va.into_usize();
        if addr & 0xFFF == 0 {
            Ok(Self {
                va,
                pml4ei: (addr >> 39) & 0x1ff,
                pdptei: (addr >> 30) & 0x1ff,
                pdei: (addr >> 21) & 0x1ff,
                ptei: (addr >> 12) & 0x1ff,
            })
        } else {
            Err(PageTableMappingError::Unaligned)
        }
    }
}

/// Converts a logical [`Permission`] into the flags used at the leaf PTE.
///
/// Intermediate levels (PML4/PDPT/PD) are always opened up with the most
/// permissive RW|US so that the actual restriction lives solely at the leaf;
/// this mirrors how the hardware ANDs attributes across levels together.
fn pte_flags(perm: Permission) -> PteFlags {
    let mut flags = PteFlags::P;
    if perm.contains(Permission::WRITE) {
        flags |= PteFlags::RW;
    }
    if perm.contains(Permission::USER) {
        flags |= PteFlags::US;
    }
    if !perm.contains(Permission::EXECUTABLE) {
        flags |= PteFlags::XD;
    }
    flags
}

/// Page table structure for the x86_64 four-level paging scheme.
pub struct PageTable(pub Box<PageTableRoot>);

impl PageTable {
    /// Creates an empty page table that can still resolve kernel addresses.
    pub fn new() -> Self {
        Self(PageTableRoot::new_boxed_with_kernel_addr())
    }

    /// Physical address of this page table's root.
    pub fn pa(&self) -> Pa {
        Kva::new(self.0.as_ref().as_ptr() as usize)
            .unwrap()
            .into_pa()
    }

    /// Maps `va` to the given page with `perm`, taking ownership of `pg`.
    pub fn map(&mut self, va: Va, pg: Page, perm: Permission) -> Result<(), PageTableMappingError> {
        let pa = pg.into_raw();
        unsafe {
            self.do_map(va, pa, perm).inspect_err(|_| {
                Page::from_pa(pa);
            })
        }
    }

    /// Maps `va` to the physical address `pa` with `perm`.
    ///
    /// # Safety
    /// The caller must ensure `pa` refers to a valid, owned physical frame.
    pub unsafe fn do_map(
        &mut self,
        va: Va,
        pa: Pa,
        perm: Permission,
    ) -> Result<(), PageTableMappingError> {
        let indices = PtIndices::from_va(va)?;
        let pml4e = &mut self.0[indices.pml4ei];
        if pml4e.pa().is_none() {
            let table = Page::new();
            pml4e.set_pa(table.into_raw())?;
            unsafe { pml4e.set_flags(Pml4eFlags::P | Pml4eFlags::RW | Pml4eFlags::US) };
        }
        let pdpe = &mut pml4e.into_pdp_mut()?[indices.pdptei];
        if pdpe.pa().is_none() {
            let table = Page::new();
            pdpe.set_pa(table.into_raw())?;
            pdpe.set_flags(PdpeFlags::P | PdpeFlags::RW | PdpeFlags::US);
        }
        let pde = &mut pdpe.into_pd_mut()?[indices.pdei];
        if pde.pa().is_none() {
            let table = Page::new();
            pde.set_pa(table.into_raw())?;
            pde.set_flags(PdeFlags::P | PdeFlags::RW | PdeFlags::US);
        }
        let pte = &mut pde.into_pt_mut()?[indices.ptei];
        if pte.flags().contains(PteFlags::P) {
            return Err(PageTableMappingError::Duplicated);
        }
        pte.set_pa(pa)?;
        unsafe {
            pte.set_flags(pte_flags(perm));
        }
        Ok(())
    }

    /// Unmaps `va`, returning the physical page it was mapped to.
    pub fn unmap(&mut self, va: Va) -> Result<Page, PageTableMappingError> {
        let mut walked = self.walk_mut(va)?;
        let stale = walked.clear().ok_or(PageTableMappingError::NotExist)?;
        Ok(stale.invalidate())
    }

    /// Walks the page table to find the page table entry for `va`.
    pub fn walk(&self, va: Va) -> Result<&Pte, PageTableMappingError> {
        let indices = PtIndices::from_va(va)?;
        let pml4e = &self.0[indices.pml4ei];
        let pdpe = &pml4e.into_pdp()?[indices.pdptei];
        let pde = &pdpe.into_pd()?[indices.pdei];
        let pte = &pde.into_pt()?[indices.ptei];
        if pte.flags().contains(PteFlags::P) {
            Ok(pte)
        } else {
            Err(PageTableMappingError::NotExist)
        }
    }

    /// Walks the page table to find a mutable handle to the entry for `va`.
    pub fn walk_mut(&mut self, va: Va) -> Result<Walked<'_>, PageTableMappingError> {
        let indices = PtIndices::from_va(va)?;
        let pml4e = &mut self.0[indices.pml4ei];
        let pdpe = &mut pml4e.into_pdp_mut()?[indices.pdptei];
        let pde = &mut pdpe.into_pd_mut()?[indices.pdei];
        let pte = &mut pde.into_pt_mut()?[indices.ptei];
        if pte.flags().contains(PteFlags::P) {
            Ok(Walked {
                addr: indices.va,
                pte,
            })
        } else {
            Err(PageTableMappingError::NotExist)
        }
    }

    /// Clears all user-half entries and frees every page (including
    /// intermediate tables) but the PML4 root itself.
    fn clear(&mut self) {
        for pml4ei in 0..PageTableRoot::KBASE {
            let pml4e = &mut self.0[pml4ei];
            let Some(pdp_pa) = pml4e.pa() else { continue };
            let pdp = unsafe {
                core::slice::from_raw_parts_mut(
                    pdp_pa.into_kva().into_usize() as *mut Pdpe,
                    512,
                )
            };
            for pdpe in pdp.iter_mut() {
                let Some(pd_pa) = pdpe.pa() else { continue };
                let pd = unsafe {
                    core::slice::from_raw_parts_mut(
                        pd_pa.into_kva().into_usize() as *mut Pde,
                        512,
                    )
                };
                for pde in pd.iter_mut() {
                    let Some(pt_pa) = pde.pa() else { continue };
                    let pt = unsafe {
                        core::slice::from_raw_parts_mut(
                            pt_pa.into_kva().into_usize() as *mut Pte,
                            512,
                        )
                    };
                    for pte in pt.iter_mut() {
                        if let Some(pa) = unsafe { pte.clear() } {
                            drop(unsafe { Page::from_pa(pa) });
                        }
                    }
                    drop(unsafe { Page::from_pa(pt_pa) });
                }
                pdpe.clear();
                drop(unsafe { Page::from_pa(pd_pa) });
            }
            pml4e.clear();
            drop(unsafe { Page::from_pa(pdp_pa) });
        }
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PageTable {
    fn drop(&mut self) {
        assert_ne!(
            get_current_pt_pa().into_usize(),
            self.pa().into_usize(),
            "dropping the active page table"
        );
        self.clear()
    }
}

/// A mutable reference to a page table entry reached by [`PageTable::walk_mut`].
pub struct Walked<'a> {
    addr: Va,
    pte: &'a mut Pte,
}

impl Walked<'_> {
    /// Clears the mapping, returning a handle that must be invalidated from
    /// the TLB before the freed page may be reused.
    pub fn clear(&mut self) -> Option<StaleTLBEntry> {
        unsafe {
            self.pte
                .clear()
                .map(|pa| StaleTLBEntry::new(self.addr, Page::from_pa(pa)))
        }
    }

    /// Installs `page` at this entry with the given flags.
    pub fn set_page(&mut self, page: Page, flags: PteFlags) -> Result<(), PageTableMappingError> {
        if self.pte.flags().contains(PteFlags::P) {
            Err(PageTableMappingError::Duplicated)
        } else {
            unsafe {
                self.pte.set_pa(page.into_raw())?.set_flags(flags);
            }
            Ok(())
        }
    }
}

impl Deref for Walked<'_> {
    type Target = Pte;

    fn deref(&self) -> &Self::Target {
        self.pte
    }
}
