//! Concurrency-safety layer for a one-sided-RDMA tree index.
//!
//! Remote clients read and mutate index pages directly in pinned server
//! memory. This crate gives the tree/cache layer the three pieces it needs to
//! do that without server-side locks:
//!
//! - **Epoch-based reclamation**: [`EpochManager`] keeps a global epoch and a
//!   lock-free [`MinEpochTable`] of what every thread currently observes.
//!   Readers hold an [`EpochGuard`]; memory retired at epoch `e` is reused only
//!   once [`EpochManager::is_safe_to_reclaim`] holds for `e`. [`Reclaimer`]
//!   defers destruction of retired objects accordingly.
//! - **Optimistic latching**: [`VersionLatch`] detects concurrent writers on a
//!   page without ever blocking readers.
//! - **Buffer carving**: [`BufferPool`] splits one [`PinnedRegion`] into
//!   rotating page, sibling and compare-and-swap slots plus send/receive spans,
//!   used as stable local targets of in-flight verbs.
//!
//! Connection setup, verb issuance and completion polling live elsewhere.
//!
//! ```
//! use rdma_epoch::{EpochManager, Reclaimer, VersionLatch};
//!
//! let manager = EpochManager::builder().build().unwrap();
//! let reclaimer = Reclaimer::new();
//! let latch = VersionLatch::new();
//!
//! {
//!     let _guard = manager.pin().unwrap();
//!     let version = latch.version().unwrap();
//!     // read the page optimistically...
//!     assert!(latch.validate(version));
//! }
//!
//! reclaimer.retire(&manager, Box::new(vec![0u8; 1024]));
//! reclaimer.collect(&manager);
//! assert_eq!(reclaimer.pending(), 0);
//! ```
//!
//! 面向单边 RDMA 树索引的并发安全层：基于纪元的回收、乐观版本锁，以及固定内存缓冲区的切分。

mod buffer;
mod error;
mod garbage;
mod guard;
mod latch;
mod manager;
mod metrics;
mod state;
mod sync;
mod table;

pub use buffer::{
    BufferPool, BufferPoolBuilder, BufferSlot, CAS_SLOT_SIZE, DEFAULT_PAGE_SIZE,
    HUGE_PAGE_SIZE, PinnedRegion, REGION_ALIGN,
};
pub use error::{Error, Restart, Result};
pub use garbage::{Reclaimer, ReclaimerBuilder};
pub use guard::EpochGuard;
pub use latch::{LatchWriteGuard, VersionLatch};
pub use manager::{EpochManager, EpochManagerBuilder};
pub use metrics::{EpochMetrics, MetricsSnapshot};
pub use state::{AUTO_RECLAIM_THRESHOLD, CACHE_LINE_SIZE, DEFAULT_TABLE_SIZE, Epoch};
pub use table::MinEpochTable;

#[cfg(test)]
mod tests;
