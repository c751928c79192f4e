use crate::error::Result;
use crate::guard::EpochGuard;
use crate::metrics::EpochMetrics;
use crate::state::{DEFAULT_TABLE_SIZE, Epoch, INITIAL_EPOCH};
use crate::sync::{AtomicU64, Ordering};
use crate::table::MinEpochTable;
use std::sync::Arc;
use tracing::{debug, warn};

/// Builder for configuring an `EpochManager`.
///
/// # Example
/// ```
/// use rdma_epoch::EpochManager;
///
/// let manager = EpochManager::builder()
///     .table_capacity(256)
///     .build()
///     .unwrap();
/// assert_eq!(manager.current_epoch(), 1);
/// ```
///
/// 用于配置 `EpochManager` 的构建器。
pub struct EpochManagerBuilder {
    table_capacity: usize,
    metrics: Option<Arc<EpochMetrics>>,
}

impl EpochManagerBuilder {
    /// Create a new builder with default settings.
    /// 创建一个带有默认设置的新构建器。
    #[inline]
    pub fn new() -> Self {
        Self {
            table_capacity: DEFAULT_TABLE_SIZE,
            metrics: None,
        }
    }

    /// Set the number of registry entries, i.e. the maximum number of threads
    /// that can be registered at once. Must be a power of two.
    ///
    /// Default: `128`
    ///
    /// 设置登记表条目数，即同时可登记的最大线程数。必须是 2 的幂。
    #[inline]
    pub fn table_capacity(mut self, capacity: usize) -> Self {
        self.table_capacity = capacity;
        self
    }

    /// Share an externally owned metrics object with the manager.
    #[inline]
    pub fn metrics(mut self, metrics: Arc<EpochMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build an initialized `EpochManager`.
    ///
    /// Fails if the capacity is not a power of two or the table cannot be allocated.
    ///
    /// 构建一个已初始化的 `EpochManager`。
    pub fn build(self) -> Result<EpochManager> {
        let mut manager = self.build_uninitialized();
        manager.initialize()?;
        Ok(manager)
    }

    fn build_uninitialized(self) -> EpochManager {
        let metrics = self.metrics.unwrap_or_default();
        EpochManager {
            current_epoch: AtomicU64::new(INITIAL_EPOCH),
            safe_to_reclaim_epoch: AtomicU64::new(0),
            table: MinEpochTable::new(Arc::clone(&metrics)),
            table_capacity: self.table_capacity,
            metrics,
        }
    }
}

impl Default for EpochManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Global epoch clock and safe-to-reclaim watermark.
///
/// Readers call [`protect`](Self::protect) (usually through an
/// [`EpochGuard`]) before touching pages that may be recycled, and
/// [`unprotect`](Self::unprotect) afterwards. Any thread may call
/// [`bump_current_epoch`](Self::bump_current_epoch); each bump rescans the
/// table and republishes the watermark. Memory retired at an epoch `e` may be
/// reused once [`is_safe_to_reclaim(e)`](Self::is_safe_to_reclaim) holds.
///
/// `initialize` and `uninitialize` take `&mut self`, so they never race with
/// protection; every other operation takes `&self` and is lock-free.
///
/// **Typical Usage**:
/// ```
/// use rdma_epoch::EpochManager;
///
/// let manager = EpochManager::builder().build().unwrap();
///
/// {
///     let _guard = manager.pin().unwrap();
///     // read pages...
/// }
///
/// let retired_at = manager.current_epoch();
/// manager.bump_current_epoch();
/// assert!(manager.is_safe_to_reclaim(retired_at));
/// ```
///
/// 全局纪元时钟与安全回收水位线。
/// 读者在访问可能被回收的页面之前调用 `protect`（通常通过 `EpochGuard`），之后调用 `unprotect`。
/// 任何线程都可以调用 `bump_current_epoch`；每次推进都会重新扫描登记表并发布新的水位线。
#[derive(Debug)]
pub struct EpochManager {
    current_epoch: AtomicU64,
    safe_to_reclaim_epoch: AtomicU64,
    table: MinEpochTable,
    table_capacity: usize,
    metrics: Arc<EpochMetrics>,
}

impl Default for EpochManager {
    fn default() -> Self {
        Self::new()
    }
}

impl EpochManager {
    /// Create an uninitialized manager with the default table capacity.
    /// Call [`initialize`](Self::initialize) before protecting.
    #[inline]
    pub fn new() -> Self {
        EpochManagerBuilder::new().build_uninitialized()
    }

    /// Create a builder for configuring the manager.
    #[inline]
    pub fn builder() -> EpochManagerBuilder {
        EpochManagerBuilder::new()
    }

    /// Allocate and wire up the registry. Idempotent.
    pub fn initialize(&mut self) -> Result<()> {
        if self.table.is_initialized() {
            return Ok(());
        }

        self.table.initialize(self.table_capacity)?;
        self.current_epoch.store(INITIAL_EPOCH, Ordering::SeqCst);
        self.safe_to_reclaim_epoch.store(0, Ordering::SeqCst);
        debug!(capacity = self.table_capacity, "epoch.manager.initialized");
        Ok(())
    }

    /// Tear down the registry and reset both epochs. Idempotent, never fails.
    pub fn uninitialize(&mut self) {
        if !self.table.is_initialized() {
            return;
        }

        let current = self.current_epoch.load(Ordering::SeqCst);
        if let Some(oldest) = self.table.oldest_protected() {
            // Some thread is still inside a protected region. Keep going anyway.
            warn!(current, oldest, "epoch.manager.uninitialize_while_protected");
        }

        self.table.uninitialize();
        self.current_epoch.store(INITIAL_EPOCH, Ordering::SeqCst);
        self.safe_to_reclaim_epoch.store(0, Ordering::SeqCst);
        debug!("epoch.manager.uninitialized");
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.table.is_initialized()
    }

    /// Publish that the calling thread observes the current epoch.
    ///
    /// The publish is validated against the global clock and redone if a bump
    /// slipped in between, so the epoch that ends up published is always newer
    /// than any watermark computed without it.
    ///
    /// Nested calls keep the outermost epoch published.
    pub fn protect(&self) -> Result<()> {
        let mut epoch = self.current_epoch.load(Ordering::SeqCst);
        if !self.table.protect(epoch)? {
            self.metrics.protected();
            return Ok(());
        }

        loop {
            let current = self.current_epoch.load(Ordering::SeqCst);
            if current == epoch {
                break;
            }
            self.metrics.protect_retried();
            epoch = current;
            self.table.republish(epoch)?;
        }

        self.metrics.protected();
        Ok(())
    }

    /// Retract the calling thread's protection.
    pub fn unprotect(&self) -> Result<()> {
        self.table.unprotect(self.current_epoch.load(Ordering::Relaxed))?;
        self.metrics.unprotected();
        Ok(())
    }

    /// Protect and return a guard that unprotects when dropped.
    ///
    /// 执行 protect 并返回一个在 drop 时执行 unprotect 的守卫。
    #[inline]
    pub fn pin(&self) -> Result<EpochGuard<'_>> {
        EpochGuard::new(self)
    }

    /// Whether the calling thread is currently protected.
    #[inline]
    pub fn is_protected(&self) -> bool {
        self.table.is_protected()
    }

    /// Epoch published by the calling thread, if it is protected.
    #[inline]
    pub fn protected_epoch(&self) -> Option<Epoch> {
        self.table.published_epoch()
    }

    /// Advance the global epoch by one and recompute the watermark.
    ///
    /// Returns the new current epoch.
    pub fn bump_current_epoch(&self) -> Epoch {
        let new_epoch = self.current_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.metrics.epoch_bumped();
        self.compute_new_safe_to_reclaim_epoch(new_epoch);
        new_epoch
    }

    /// Rescan the table against `current_epoch` and publish the resulting watermark.
    pub fn compute_new_safe_to_reclaim_epoch(&self, current_epoch: Epoch) {
        let watermark = self.table.compute_new_safe_to_reclaim_epoch(current_epoch);
        self.safe_to_reclaim_epoch.store(watermark, Ordering::Release);
    }

    /// Whether memory retired at `epoch` can no longer be observed by anyone.
    #[inline]
    pub fn is_safe_to_reclaim(&self, epoch: Epoch) -> bool {
        epoch <= self.safe_to_reclaim_epoch.load(Ordering::Acquire)
    }

    #[inline]
    pub fn reclaim_epoch(&self) -> Epoch {
        self.safe_to_reclaim_epoch.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn current_epoch(&self) -> Epoch {
        self.current_epoch.load(Ordering::SeqCst)
    }

    /// Number of registry entries, `0` when uninitialized.
    #[inline]
    pub fn table_capacity(&self) -> usize {
        self.table.capacity()
    }

    #[inline]
    pub fn metrics(&self) -> &Arc<EpochMetrics> {
        &self.metrics
    }

    #[inline]
    pub fn table(&self) -> &MinEpochTable {
        &self.table
    }
}

impl Drop for EpochManager {
    fn drop(&mut self) {
        self.uninitialize();
    }
}
