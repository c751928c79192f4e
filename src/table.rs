use crate::error::{Error, Result};
use crate::metrics::EpochMetrics;
use crate::state::{
    DEFAULT_TABLE_SIZE, Entry, Epoch, FREE_OWNER, RETIRED_OWNER, UNPROTECTED,
};
use crate::sync::{Ordering, fence, thread_local};
use std::cell::RefCell;
use std::sync::atomic::AtomicU64 as IdCounter;
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

/// Source of per-thread identities. Starts at 1 so no thread ever looks like a free owner.
static NEXT_THREAD_ID: IdCounter = IdCounter::new(1);

thread_local! {
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    /// Entries this thread owns, one per live table.
    /// Dropped at thread exit, which retires every entry still reachable.
    /// 此线程拥有的条目，每个存活的表一个。线程退出时被 drop，从而退休所有仍可达的条目。
    static REGISTRATIONS: RefCell<Vec<Registration>> = RefCell::new(Vec::new());
}

/// Fixed-capacity, cache-line aligned storage for the table entries.
/// 固定容量、按缓存行对齐的条目存储区。
#[derive(Debug)]
pub(crate) struct EntryArena {
    entries: Box<[Entry]>,
    mask: usize,
}

impl EntryArena {
    fn allocate(size: usize) -> Result<Self> {
        let mut entries = Vec::new();
        entries
            .try_reserve_exact(size)
            .map_err(|_| Error::AllocationFailed {
                bytes: size.saturating_mul(std::mem::size_of::<Entry>()),
            })?;
        entries.extend((0..size).map(|_| Entry::new()));

        Ok(Self {
            entries: entries.into_boxed_slice(),
            mask: size - 1,
        })
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Mark an entry whose owning thread is gone.
    ///
    /// An entry that is still protected keeps its epoch published, so it
    /// keeps holding the watermark back until someone clears it.
    fn retire(&self, index: usize) {
        let entry = &self.entries[index];
        let protected = entry.protected_epoch.load(Ordering::Acquire);
        if protected != UNPROTECTED {
            warn!(
                index,
                epoch = protected,
                "epoch.entry.retired_while_protected"
            );
        }
        entry.owner.store(RETIRED_OWNER, Ordering::Release);
        trace!(index, "epoch.entry.retired");
    }

    /// Return retired, unprotected entries to the free state.
    fn reclaim_old_entries(&self) -> usize {
        let mut recycled = 0;
        for entry in self.entries.iter() {
            if entry.owner.load(Ordering::Acquire) != RETIRED_OWNER {
                continue;
            }
            if entry.protected_epoch.load(Ordering::Acquire) != UNPROTECTED {
                continue;
            }
            if entry
                .owner
                .compare_exchange(
                    RETIRED_OWNER,
                    FREE_OWNER,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                recycled += 1;
            }
        }
        recycled
    }
}

/// A thread's claim on one entry of one table.
///
/// 线程对某个表中某个条目的占有记录。
struct Registration {
    arena: Weak<EntryArena>,
    index: usize,
    /// Nesting depth of protect calls on this thread.
    depth: usize,
}

impl Registration {
    #[inline]
    fn belongs_to(&self, arena: &Arc<EntryArena>) -> bool {
        std::ptr::eq(self.arena.as_ptr(), Arc::as_ptr(arena))
    }

    fn is_live(&self) -> bool {
        self.arena.strong_count() > 0
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(arena) = self.arena.upgrade() {
            arena.retire(self.index);
        }
    }
}

/// Finalizer mix of a thread identity, folded to 32 bits, used as the first probe index.
///
/// 线程标识的终结混合（折叠为 32 位），用作第一个探测下标。
#[inline]
pub(crate) fn probe_start(thread_id: u64) -> u32 {
    let mut h = (thread_id ^ (thread_id >> 32)) as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

/// Lock-free registry of the epoch each thread currently observes.
///
/// Every thread that protects gets one entry, claimed with a single
/// compare-and-swap on first use and cached in a thread-local registration.
/// The entry is retired when the thread exits and recycled by a later claim
/// that finds the table full.
///
/// 无锁登记表，记录每个线程当前观察的纪元。
///
/// 每个执行 protect 的线程拥有一个条目：首次使用时通过一次 CAS 占有，
/// 并缓存在线程本地登记中。线程退出时条目被退休，之后在表满时被新的占有请求回收复用。
#[derive(Debug)]
pub struct MinEpochTable {
    arena: Option<Arc<EntryArena>>,
    metrics: Arc<EpochMetrics>,
}

impl Default for MinEpochTable {
    fn default() -> Self {
        Self::new(Arc::new(EpochMetrics::new()))
    }
}

impl MinEpochTable {
    pub fn new(metrics: Arc<EpochMetrics>) -> Self {
        Self {
            arena: None,
            metrics,
        }
    }

    /// Allocate the entry arena. Calling it again on an initialized table is a no-op.
    ///
    /// `size` must be a power of two.
    pub fn initialize(&mut self, size: usize) -> Result<()> {
        if self.arena.is_some() {
            return Ok(());
        }
        if !size.is_power_of_two() {
            return Err(Error::TableSizeNotPowerOfTwo { size });
        }

        self.arena = Some(Arc::new(EntryArena::allocate(size)?));
        debug!(capacity = size, "epoch.table.initialized");
        Ok(())
    }

    /// Initialize with [`DEFAULT_TABLE_SIZE`] entries.
    pub fn initialize_default(&mut self) -> Result<()> {
        self.initialize(DEFAULT_TABLE_SIZE)
    }

    /// Release the arena. Threads keep only weak references to it, so their
    /// cached registrations go stale instead of dangling.
    pub fn uninitialize(&mut self) {
        if let Some(arena) = self.arena.take() {
            debug!(capacity = arena.capacity(), "epoch.table.uninitialized");
        }
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.arena.is_some()
    }

    pub fn capacity(&self) -> usize {
        self.arena.as_ref().map_or(0, |arena| arena.capacity())
    }

    #[inline]
    fn arena(&self) -> Result<&Arc<EntryArena>> {
        self.arena.as_ref().ok_or(Error::NotInitialized)
    }

    /// Publish `epoch` as observed by the calling thread.
    ///
    /// Returns `true` when this call published, `false` when the thread was
    /// already protected and only the nesting depth grew (the older epoch stays
    /// published).
    pub fn protect(&self, epoch: Epoch) -> Result<bool> {
        self.with_registration(|entry, registration| {
            registration.depth += 1;
            if registration.depth > 1 {
                return false;
            }
            publish(entry, epoch);
            true
        })
    }

    /// Overwrite the calling thread's published epoch without touching the nesting depth.
    pub(crate) fn republish(&self, epoch: Epoch) -> Result<()> {
        self.with_registration(|entry, _| publish(entry, epoch))
    }

    /// Retract the calling thread's protection. Only the outermost call clears the entry.
    ///
    /// A thread that never protected has nothing to retract: no entry is claimed.
    pub fn unprotect(&self, epoch: Epoch) -> Result<()> {
        let arena = self.arena()?;
        REGISTRATIONS
            .try_with(|registrations| {
                let mut registrations = registrations.borrow_mut();
                let Some(registration) = registrations.iter_mut().find(|r| r.belongs_to(arena))
                else {
                    return;
                };
                if registration.depth > 1 {
                    registration.depth -= 1;
                    return;
                }
                registration.depth = 0;
                let entry = &arena.entries[registration.index];
                entry.last_unprotected_epoch.store(epoch, Ordering::Relaxed);
                fence(Ordering::Release);
                entry.protected_epoch.store(UNPROTECTED, Ordering::Relaxed);
            })
            .map_err(|_| Error::ThreadExiting)
    }

    /// Whether the calling thread is protected. Never claims an entry.
    pub fn is_protected(&self) -> bool {
        self.published_epoch().is_some()
    }

    /// Epoch the calling thread currently publishes, if any.
    pub fn published_epoch(&self) -> Option<Epoch> {
        let arena = self.arena.as_ref()?;
        REGISTRATIONS
            .try_with(|registrations| {
                let registrations = registrations.borrow();
                let registration = registrations.iter().find(|r| r.belongs_to(arena))?;
                // Own slot: program order is enough.
                let epoch = arena.entries[registration.index]
                    .protected_epoch
                    .load(Ordering::Relaxed);
                (epoch != UNPROTECTED).then_some(epoch)
            })
            .ok()
            .flatten()
    }

    /// Scan every entry and derive the epoch at or before which nothing is observed.
    ///
    /// The result is `min(nonzero protected epochs, current_epoch) - 1`.
    pub fn compute_new_safe_to_reclaim_epoch(&self, current_epoch: Epoch) -> Epoch {
        self.oldest_protected()
            .map_or(current_epoch, |oldest| oldest.min(current_epoch))
            .saturating_sub(1)
    }

    /// Smallest epoch published by any thread, `None` when no entry is protected.
    pub fn oldest_protected(&self) -> Option<Epoch> {
        let arena = self.arena.as_ref()?;
        fence(Ordering::SeqCst);
        arena
            .entries
            .iter()
            .map(|entry| entry.protected_epoch.load(Ordering::Acquire))
            .filter(|&epoch| epoch != UNPROTECTED)
            .min()
    }

    /// Index of the calling thread's entry, claiming one on first use.
    pub fn entry_for_thread(&self) -> Result<usize> {
        self.with_registration(|_, registration| registration.index)
    }

    /// Recycle entries of exited threads. Returns how many became free.
    pub fn reclaim_old_entries(&self) -> usize {
        let Some(arena) = self.arena.as_ref() else {
            return 0;
        };
        let recycled = arena.reclaim_old_entries();
        if recycled > 0 {
            self.metrics.entries_recycled(recycled as u64);
            trace!(recycled, "epoch.table.entries_recycled");
        }
        recycled
    }

    /// Claim a free entry for `thread_id`, probing from `start_index`.
    ///
    /// A full pass without success runs the reclamation hook and scans again;
    /// when the hook frees nothing the table is reported exhausted.
    pub(crate) fn reserve_entry(&self, start_index: u64, thread_id: u64) -> Result<usize> {
        debug_assert!(thread_id != FREE_OWNER && thread_id != RETIRED_OWNER);
        let arena = self.arena()?;
        let capacity = arena.capacity();

        loop {
            for i in 0..capacity {
                let index = (start_index as usize).wrapping_add(i) & arena.mask;
                let entry = &arena.entries[index];
                if entry.owner.load(Ordering::Relaxed) != FREE_OWNER {
                    continue;
                }
                // The slot is ours the moment the identity lands.
                match entry.owner.compare_exchange(
                    FREE_OWNER,
                    thread_id,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        self.metrics.entry_claimed();
                        trace!(index, thread_id, "epoch.table.entry_claimed");
                        return Ok(index);
                    }
                    // Taken by a racing thread, move on.
                    Err(_) => self.metrics.claim_conflict(),
                }
            }

            if self.reclaim_old_entries() == 0 {
                break;
            }
        }

        self.metrics.registry_exhausted();
        warn!(capacity, thread_id, "epoch.table.exhausted");
        Err(Error::RegistryExhausted { capacity })
    }

    fn with_registration<R>(
        &self,
        f: impl FnOnce(&Entry, &mut Registration) -> R,
    ) -> Result<R> {
        let arena = self.arena()?;
        REGISTRATIONS
            .try_with(|registrations| -> Result<R> {
                let mut registrations = registrations.borrow_mut();
                let position = match registrations.iter().position(|r| r.belongs_to(arena)) {
                    Some(position) => position,
                    None => {
                        registrations.retain(Registration::is_live);
                        let thread_id = THREAD_ID
                            .try_with(|id| *id)
                            .map_err(|_| Error::ThreadExiting)?;
                        let index = self.reserve_entry(probe_start(thread_id) as u64, thread_id)?;
                        registrations.push(Registration {
                            arena: Arc::downgrade(arena),
                            index,
                            depth: 0,
                        });
                        registrations.len() - 1
                    }
                };
                let registration = &mut registrations[position];
                Ok(f(&arena.entries[registration.index], registration))
            })
            .map_err(|_| Error::ThreadExiting)?
    }

    #[cfg(test)]
    pub(crate) fn entry_owner(&self, index: usize) -> Option<u64> {
        let arena = self.arena.as_ref()?;
        Some(arena.entries.get(index)?.owner.load(Ordering::Acquire))
    }

    #[cfg(test)]
    pub(crate) fn last_unprotected_epoch(&self) -> Option<Epoch> {
        let index = self.entry_for_thread().ok()?;
        let arena = self.arena.as_ref()?;
        Some(arena.entries[index].last_unprotected_epoch.load(Ordering::Relaxed))
    }
}

#[inline]
fn publish(entry: &Entry, epoch: Epoch) {
    entry.last_unprotected_epoch.store(0, Ordering::Relaxed);
    entry.protected_epoch.store(epoch, Ordering::SeqCst);
    // Reads inside the protected region must not move above the publish.
    fence(Ordering::SeqCst);
}
