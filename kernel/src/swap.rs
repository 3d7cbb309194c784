//! Page-granular swap backend: a bitmap of free slots on a dedicated block
//! device (disk index 1), one slot per virtual page.
//!
//! Grounded on `examples/original_source/vm/swap.c`: `swap_init`/`store_in_swap`/
//! `read_from_swap`/`swap_free` map directly onto [`SwapDevice::new`],
//! [`SwapDevice::store`], [`SwapDevice::read`], and [`SwapDevice::free`].
//! Reading an empty slot or exhausting the bitmap is fatal there (`PANIC`);
//! this crate keeps that behavior for a read/free of an unallocated slot
//! (programmer error, an SPE would never reference one) but turns
//! allocation-time exhaustion into a normal `KernelError::NoSpace` so
//! eviction can fail the originating syscall instead of taking down the
//! kernel.

use alloc::vec::Vec;
use keos::{KernelError, fs::Sector, sync::SpinLock};

const PAGE_SIZE: usize = 0x1000;
const SECTORS_PER_SLOT: usize = PAGE_SIZE / 512;

/// Index of a slot on the swap device.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct SwapSlot(pub usize);

struct Inner {
    /// `true` means the slot is free, mirroring the original's
    /// `bitmap_set_all(swap_bitmap, true)` at init time.
    free: Vec<bool>,
}

/// The swap device: a disk plus a bitmap tracking which page-sized slots on
/// it are occupied.
pub struct SwapDevice {
    disk: keos::fs::Disk,
    inner: SpinLock<Inner>,
}

impl SwapDevice {
    /// Opens the swap device at `disk_index` with `total_sectors` sectors.
    pub fn new(disk_index: usize, total_sectors: usize) -> Self {
        let slots = total_sectors / SECTORS_PER_SLOT;
        Self {
            disk: keos::fs::Disk::new(disk_index),
            inner: SpinLock::new(Inner {
                free: alloc::vec![true; slots],
            }),
        }
    }

    /// Stores one page's worth of data into a free slot, returning its
    /// index.
    pub fn store(&self, page: &[u8; PAGE_SIZE]) -> Result<SwapSlot, KernelError> {
        let mut guard = self.inner.lock();
        let Some(idx) = guard.free.iter().position(|&f| f) else {
            guard.unlock();
            warning!("Swap device exhausted: no free slot for an eviction store.");
            return Err(KernelError::NoSpace);
        };
        guard.free[idx] = false;
        guard.unlock();

        for i in 0..SECTORS_PER_SLOT {
            let sector = Sector(idx * SECTORS_PER_SLOT + i);
            let chunk: [u8; 512] = page[i * 512..(i + 1) * 512].try_into().unwrap();
            self.disk.write(sector, &chunk)?;
        }
        Ok(SwapSlot(idx))
    }

    /// Reads back and frees the slot at `index`.
    pub fn read(&self, slot: SwapSlot, page: &mut [u8; PAGE_SIZE]) -> Result<(), KernelError> {
        let mut guard = self.inner.lock();
        let in_swap = !guard.free[slot.0];
        assert!(in_swap, "read from an empty swap slot");
        guard.unlock();

        for i in 0..SECTORS_PER_SLOT {
            let sector = Sector(slot.0 * SECTORS_PER_SLOT + i);
            let mut chunk = [0u8; 512];
            self.disk.read(sector, &mut chunk)?;
            page[i * 512..(i + 1) * 512].copy_from_slice(&chunk);
        }

        let mut guard = self.inner.lock();
        guard.free[slot.0] = true;
        guard.unlock();
        Ok(())
    }

    /// Releases a slot without reading it back.
    pub fn free(&self, slot: SwapSlot) {
        let mut guard = self.inner.lock();
        let in_swap = !guard.free[slot.0];
        assert!(in_swap, "free an empty swap slot");
        guard.free[slot.0] = true;
        guard.unlock();
    }
}

static mut SWAP_DEVICE: Option<SwapDevice> = None;

/// Initializes the global swap device at `disk_index`, sized from the
/// underlying block device's reported sector count.
pub fn init(disk_index: usize) {
    let total_sectors = keos::fs::Disk::new(disk_index).size_in_sectors();
    unsafe {
        SWAP_DEVICE = Some(SwapDevice::new(disk_index, total_sectors));
    }
}

/// Returns the global swap device.
///
/// # Panics
/// Panics if [`init`] has not been called yet.
pub fn get() -> &'static SwapDevice {
    unsafe { SWAP_DEVICE.as_ref() }.expect("swap device is not available")
}
