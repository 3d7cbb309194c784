//! The physical user-frame registry: allocates frames for supplemental page
//! table entries, and evicts the least-recently-touched frame under memory
//! pressure.
//!
//! Grounded on `examples/original_source/vm/frame.c`'s `frame_table`/
//! `frame_allocate_page`/`frame_free_page`, generalized with the real
//! eviction the original left unimplemented (`/* Need to implement evicting
//! a frame according to LRU ... */`). Per the supplemental-page-table
//! section's re-architecture guidance, an entry here never holds a pointer
//! back to its owning SPE directly — only a `(ProcessId, Va)` pair, resolved
//! against the owner's [`EvictionTarget`] at eviction time under that
//! process's own lock.

use alloc::{collections::BTreeMap, sync::Weak, vec::Vec};
use core::sync::atomic::{AtomicU64, Ordering};
use keos::{KernelError, addressing::Va, mm::ContigPages, mm::Page, sync::SpinLock};

/// Stable identity of a process, used instead of a raw pointer so frame
/// entries outlive nothing they don't own.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct ProcessId(pub usize);

/// Implemented by a process's supplemental page table so the frame table can
/// ask it to evict a specific address without knowing anything about source
/// tags, swap, or the file system.
pub trait EvictionTarget: Send + Sync {
    /// Evicts the page at `va`: migrates its content (to swap or the backing
    /// file, or simply discards it) and releases the underlying frame.
    fn evict(&self, va: Va) -> Result<(), KernelError>;
}

struct Entry {
    owner: ProcessId,
    va: Va,
    tick: u64,
}

struct Inner {
    entries: Vec<Entry>,
    targets: BTreeMap<usize, Weak<dyn EvictionTarget>>,
}

/// The global frame table.
pub struct FrameTable {
    inner: SpinLock<Inner>,
    tick: AtomicU64,
}

impl FrameTable {
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(Inner {
                entries: Vec::new(),
                targets: BTreeMap::new(),
            }),
            tick: AtomicU64::new(0),
        }
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers `owner`'s eviction handler, replacing any previous one.
    pub fn register_owner(&self, owner: ProcessId, target: Weak<dyn EvictionTarget>) {
        let mut guard = self.inner.lock();
        guard.targets.insert(owner.0, target);
        guard.unlock();
    }

    /// Drops `owner`'s eviction handler and every frame entry still tagged
    /// with it; called when a process exits after it has freed its own SPEs.
    pub fn unregister_owner(&self, owner: ProcessId) {
        let mut guard = self.inner.lock();
        guard.targets.remove(&owner.0);
        guard.entries.retain(|e| e.owner != owner);
        guard.unlock();
    }

    /// Allocates a zeroed frame for `owner`'s page at `va`, evicting other
    /// processes' frames if physical memory is exhausted.
    pub fn allocate(&self, owner: ProcessId, va: Va) -> Result<Page, KernelError> {
        loop {
            if let Some(cp) = ContigPages::new(0x1000) {
                let kva = cp.kva();
                core::mem::forget(cp);
                let page = unsafe { Page::from_pa(kva.into_pa()) };
                let tick = self.next_tick();
                let mut guard = self.inner.lock();
                guard.entries.push(Entry { owner, va, tick });
                guard.unlock();
                return Ok(page);
            }
            self.evict_one()?;
        }
    }

    /// Refreshes the recency of `owner`'s frame at `va`, for LRU accounting.
    pub fn touch(&self, owner: ProcessId, va: Va) {
        let tick = self.next_tick();
        let mut guard = self.inner.lock();
        if let Some(e) = guard.entries.iter_mut().find(|e| e.owner == owner && e.va == va) {
            e.tick = tick;
        }
        guard.unlock();
    }

    /// Detaches the frame-table entry for `owner`'s page at `va`. The caller
    /// is responsible for releasing the hardware mapping and the underlying
    /// [`Page`] itself.
    pub fn free(&self, owner: ProcessId, va: Va) {
        let mut guard = self.inner.lock();
        guard.entries.retain(|e| !(e.owner == owner && e.va == va));
        guard.unlock();
    }

    /// Picks the least-recently-touched frame and asks its owner to evict it.
    ///
    /// The entry is left in place until eviction actually succeeds: the
    /// owner's `evict` is responsible for detaching it (via [`Self::free`])
    /// only once the page's content is safely preserved. On failure (e.g.
    /// swap exhaustion) the entry, the mapping, and the frame all stay
    /// exactly as they were, so accounting never loses track of a still-live
    /// frame.
    fn evict_one(&self) -> Result<(), KernelError> {
        let mut guard = self.inner.lock();
        let Some(entry) = guard.entries.iter().min_by_key(|e| e.tick) else {
            guard.unlock();
            return Err(KernelError::NoMemory);
        };
        let (owner, va) = (entry.owner, entry.va);
        let target = guard.targets.get(&owner.0).and_then(Weak::upgrade);
        guard.unlock();
        match target {
            Some(target) => {
                warning!("Frame table evicting owner={:?} va={:?} under memory pressure.", owner, va);
                let result = target.evict(va);
                if result.is_err() {
                    warning!("Eviction of owner={:?} va={:?} failed; frame stays resident.", owner, va);
                }
                result
            }
            // The owning process is gone; its own teardown already freed
            // this frame, so there is nothing left to evict but the entry.
            None => {
                let mut guard = self.inner.lock();
                guard.entries.retain(|e| !(e.owner == owner && e.va == va));
                guard.unlock();
                Ok(())
            }
        }
    }
}

impl Default for FrameTable {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide frame table instance.
pub static FRAME_TABLE: FrameTable = FrameTable::new();
