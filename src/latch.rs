//! Optimistic version latch for index pages.
//!
//! One 64-bit counter per page: an even value means unlocked at that version,
//! an odd value means a writer holds the page exclusively.
//!
//! # Protocol
//! 1. Readers: [`VersionLatch::version`], read the page, [`VersionLatch::validate`].
//! 2. Writers: [`VersionLatch::upgrade_to_write_lock`] with the version read
//!    earlier, modify the page, [`VersionLatch::release_lock`].
//!
//! Any failure means the caller restarts its whole operation, not only the
//! latch step: the page contents may have changed as well. There is no
//! fairness; sustained writes can keep optimistic readers retrying.
//!
//! ```
//! use rdma_epoch::VersionLatch;
//!
//! let latch = VersionLatch::new();
//! let version = latch.version().unwrap();
//! assert!(latch.upgrade_to_write_lock(version));
//! latch.release_lock();
//! assert!(!latch.validate(version));
//! ```

use crate::error::Restart;
use crate::sync::{AtomicU64, Ordering, fence};

/// Per-page optimistic lock. `repr(transparent)` so it can sit at a fixed
/// offset inside a page image.
#[derive(Debug)]
#[repr(transparent)]
pub struct VersionLatch {
    version: AtomicU64,
}

#[inline(always)]
const fn is_locked(version: u64) -> bool {
    version & 1 == 1
}

impl Default for VersionLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionLatch {
    /// Unlocked at version 0.
    pub fn new() -> Self {
        Self::with_version(0)
    }

    /// Latch starting at a given raw version, e.g. one read from a remote page.
    pub fn with_version(version: u64) -> Self {
        Self {
            version: AtomicU64::new(version),
        }
    }

    /// Snapshot the version for an optimistic read.
    ///
    /// Does not block. A write-locked page yields `Err(Restart)` carrying the
    /// raw value that was seen.
    #[inline]
    pub fn version(&self) -> Result<u64, Restart> {
        let version = self.version.load(Ordering::Acquire);
        if is_locked(version) {
            return Err(Restart { observed: version });
        }
        Ok(version)
    }

    /// Raw counter value, locked or not.
    #[inline]
    pub fn raw(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        is_locked(self.version.load(Ordering::Acquire))
    }

    /// Move `expected` to `expected + 1` if nothing changed since the snapshot.
    ///
    /// Exactly one of several racing callers with the same snapshot wins.
    /// `false` means the caller must restart its operation.
    #[inline]
    pub fn upgrade_to_write_lock(&self, expected: u64) -> bool {
        if is_locked(expected) {
            return false;
        }
        let locked = self
            .version
            .compare_exchange(expected, expected + 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok();
        if locked {
            // Page writes that follow may be plain stores; none of them may
            // become visible before the odd version does.
            fence(Ordering::Release);
        }
        locked
    }

    /// Unlock, publishing the page at the next even version.
    #[inline]
    pub fn release_lock(&self) {
        let previous = self.version.fetch_add(1, Ordering::Release);
        debug_assert!(is_locked(previous), "release_lock on an unlocked latch");
    }

    /// Whether no writer committed since `old_version` was read.
    ///
    /// A lock/unlock cycle that left the data untouched still fails validation.
    #[inline]
    pub fn validate(&self, old_version: u64) -> bool {
        // Keep the optimistic reads above the recheck.
        fence(Ordering::Acquire);
        self.version.load(Ordering::Relaxed) == old_version
    }

    /// Upgrade and return a guard that releases the lock when dropped.
    #[inline]
    pub fn write_lock(&self, expected: u64) -> Option<LatchWriteGuard<'_>> {
        self.upgrade_to_write_lock(expected)
            .then_some(LatchWriteGuard { latch: self })
    }
}

/// Exclusive hold on a [`VersionLatch`]. Releases on drop.
#[must_use]
#[derive(Debug)]
pub struct LatchWriteGuard<'a> {
    latch: &'a VersionLatch,
}

impl LatchWriteGuard<'_> {
    /// Version the page will carry once this guard is dropped.
    pub fn next_version(&self) -> u64 {
        self.latch.version.load(Ordering::Relaxed) + 1
    }
}

impl Drop for LatchWriteGuard<'_> {
    fn drop(&mut self) {
        self.latch.release_lock();
    }
}
