//! Sector-granular write-back block cache sitting in front of a [`Disk`].
//!
//! Modeled on the buffer cache of a teaching Pintos filesystem: a fixed
//! number of 512-byte entries, clock-style eviction driven by a recency
//! counter, write-back (not write-through) dirty tracking, and a read-ahead
//! hint for the sector following the most recently loaded one.
//!
//! This retrieval pack exposes no timer/sleep primitive, so the periodic
//! flush thread approximates its "every 20 ticks" interval by yielding the
//! CPU (`keos::thread::scheduler::scheduler().reschedule()`) that many times
//! between flushes, the same voluntary-yield idiom
//! `keos-project4/grader/src/round_robin.rs` uses to drive its scheduler
//! test loop. The thread itself, and the try-lock read-ahead below, are
//! grounded on `keos-project5/src/page_cache/mod.rs`'s `[Readahead]`
//! background thread.

use alloc::{boxed::Box, sync::Arc};
use keos::{
    KernelError,
    fs::Sector,
    sync::SpinLock,
    thread::{JoinHandle, ThreadBuilder},
};

/// Number of cached 512-byte sectors.
pub const CACHE_SIZE: usize = 64;

/// Number of scheduler yields the background flush thread waits between
/// flush-all passes, standing in for the original's 20-tick interval.
const FLUSH_INTERVAL_TICKS: u32 = 20;

struct Entry {
    sector: Sector,
    valid: bool,
    dirty: bool,
    clock: u64,
    data: Box<[u8; 512]>,
}

struct Inner {
    entries: [Option<Entry>; CACHE_SIZE],
    tick: u64,
    last_loaded: Option<Sector>,
}

/// A write-back cache of 512-byte disk sectors.
pub struct BlockCache {
    disk: keos::fs::Disk,
    inner: Arc<SpinLock<Inner>>,
    /// Background flush/read-ahead thread; kept alive for the cache's own
    /// lifetime, never joined.
    _flusher: JoinHandle,
}

impl BlockCache {
    /// Creates a cache fronting the disk at the given slot index, and spawns
    /// its background flush thread.
    pub fn new(disk_index: usize) -> Self {
        let inner = Arc::new(SpinLock::new(Inner {
            entries: [const { None }; CACHE_SIZE],
            tick: 0,
            last_loaded: None,
        }));

        let bg_inner = inner.clone();
        let bg_disk = keos::fs::Disk::new(disk_index);
        let _flusher = ThreadBuilder::new("[BlockCacheFlush]").spawn(move || {
            info!("Starting periodic block-cache flush thread.");
            loop {
                for _ in 0..FLUSH_INTERVAL_TICKS {
                    keos::thread::scheduler::scheduler().reschedule();
                }
                let mut guard = bg_inner.lock();
                for entry in guard.entries.iter_mut().flatten() {
                    if entry.dirty {
                        if bg_disk.write(entry.sector, &entry.data).is_ok() {
                            entry.dirty = false;
                        } else {
                            warning!("Periodic flush failed for sector {:?}.", entry.sector);
                        }
                    }
                }
                guard.unlock();
            }
        });

        Self {
            disk: keos::fs::Disk::new(disk_index),
            inner,
            _flusher,
        }
    }

    fn load_into(&self, sector: Sector, slot: &mut Option<Entry>) -> Result<(), KernelError> {
        let mut data = Box::new([0u8; 512]);
        self.disk.read(sector, &mut data)?;
        *slot = Some(Entry {
            sector,
            valid: true,
            dirty: false,
            clock: 0,
            data,
        });
        Ok(())
    }

    fn writeback_entry(&self, entry: &mut Entry) -> Result<(), KernelError> {
        if entry.dirty {
            self.disk.write(entry.sector, &entry.data)?;
            entry.dirty = false;
        }
        Ok(())
    }

    /// Reads a 512-byte sector through the cache.
    pub fn read(&self, sector: Sector, buf: &mut [u8; 512]) -> Result<(), KernelError> {
        let mut guard = self.inner.lock();
        guard.tick += 1;
        let tick = guard.tick;

        if let Some(idx) = guard
            .entries
            .iter()
            .position(|e| matches!(e, Some(e) if e.valid && e.sector == sector))
        {
            let entry = guard.entries[idx].as_mut().unwrap();
            entry.clock = tick;
            buf.copy_from_slice(entry.data.as_ref());
            guard.unlock();
            return Ok(());
        }

        let idx = self.acquire_slot(&mut guard, sector)?;
        let entry = guard.entries[idx].as_mut().unwrap();
        buf.copy_from_slice(entry.data.as_ref());

        let ahead = Sector(sector.into_usize() + 1);
        let need_ahead = guard.last_loaded != Some(ahead)
            && !guard
                .entries
                .iter()
                .any(|e| matches!(e, Some(e) if e.valid && e.sector == ahead));
        guard.last_loaded = Some(sector);
        guard.unlock();

        if need_ahead {
            let _ = self.prefetch(ahead);
        }
        Ok(())
    }

    /// Writes a 512-byte sector through the cache, marking it dirty.
    pub fn write(&self, sector: Sector, buf: &[u8; 512]) -> Result<(), KernelError> {
        let mut guard = self.inner.lock();
        guard.tick += 1;
        let tick = guard.tick;

        if let Some(idx) = guard
            .entries
            .iter()
            .position(|e| matches!(e, Some(e) if e.valid && e.sector == sector))
        {
            let entry = guard.entries[idx].as_mut().unwrap();
            entry.data.copy_from_slice(buf);
            entry.dirty = true;
            entry.clock = tick;
            guard.unlock();
            return Ok(());
        }

        let idx = self.acquire_slot(&mut guard, sector)?;
        let entry = guard.entries[idx].as_mut().unwrap();
        entry.data.copy_from_slice(buf);
        entry.dirty = true;
        entry.clock = tick;
        guard.unlock();
        Ok(())
    }

    /// Brings `sector` into an empty or evicted slot, loading it from disk.
    fn acquire_slot(
        &self,
        guard: &mut keos::sync::SpinLockGuard<'_, Inner>,
        sector: Sector,
    ) -> Result<usize, KernelError> {
        if let Some(idx) = guard.entries.iter().position(|e| e.is_none()) {
            self.load_into(sector, &mut guard.entries[idx])?;
            return Ok(idx);
        }
        // Evict the least-recently-used entry (smallest clock value).
        let idx = (0..CACHE_SIZE)
            .min_by_key(|&i| guard.entries[i].as_ref().unwrap().clock)
            .unwrap();
        let mut victim = guard.entries[idx].take().unwrap();
        warning!("Block cache evicting sector {:?}.", victim.sector);
        if let Err(e) = self.writeback_entry(&mut victim) {
            // Keep the dirty victim in place rather than losing its data;
            // the caller sees the error and the slot stays occupied.
            guard.entries[idx] = Some(victim);
            return Err(e);
        }
        self.load_into(sector, &mut guard.entries[idx])?;
        Ok(idx)
    }

    /// Opportunistically loads `sector` into a free slot. Uses a try-lock so
    /// a contended cache never blocks the foreground caller on read-ahead.
    fn prefetch(&self, sector: Sector) {
        let mut guard = match self.inner.try_lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        if guard
            .entries
            .iter()
            .any(|e| matches!(e, Some(e) if e.valid && e.sector == sector))
        {
            guard.unlock();
            return;
        }
        let _ = self.acquire_slot(&mut guard, sector);
        guard.unlock();
    }

    /// Writes back every dirty entry.
    pub fn flush_all(&self) -> Result<(), KernelError> {
        let mut guard = self.inner.lock();
        let mut res = Ok(());
        for entry in guard.entries.iter_mut().flatten() {
            if let Err(e) = self.writeback_entry(entry) {
                res = Err(e);
            }
        }
        guard.unlock();
        res
    }
}
