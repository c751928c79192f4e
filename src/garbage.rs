use crate::manager::EpochManager;
use crate::state::{AUTO_RECLAIM_THRESHOLD, Epoch};
use crate::sync::Mutex;
use std::collections::VecDeque;
use std::ptr::NonNull;
use tracing::trace;

/// A boxed value waiting for the watermark to pass its retirement epoch,
/// with the concrete type erased behind `destroy`.
struct RetiredObject {
    ptr: NonNull<()>,
    destroy: unsafe fn(NonNull<()>),
}

// SAFETY: only built from `Box<T>` with `T: Send`.
unsafe impl Send for RetiredObject {}

/// # Safety
/// `ptr` must come from a leaked `Box<T>` that has not been freed.
unsafe fn destroy_boxed<T>(ptr: NonNull<()>) {
    drop(unsafe { Box::from_raw(ptr.cast::<T>().as_ptr()) });
}

impl RetiredObject {
    #[inline]
    fn new<T: Send + 'static>(value: Box<T>) -> Self {
        Self {
            ptr: NonNull::from(Box::leak(value)).cast(),
            destroy: destroy_boxed::<T>,
        }
    }
}

impl Drop for RetiredObject {
    fn drop(&mut self) {
        // SAFETY: `ptr` and `destroy` were paired in `new`; drop runs once.
        unsafe { (self.destroy)(self.ptr) }
    }
}

/// Retired objects grouped in bags by retirement epoch, oldest first.
///
/// 按退休纪元分组的已退休对象，最旧的在前。
struct GarbageSet {
    /// Each element is (epoch, bag_of_objects).
    queue: VecDeque<(Epoch, Vec<RetiredObject>)>,
    /// Emptied bags kept for reuse.
    pool: Vec<Vec<RetiredObject>>,
    count: usize,
}

impl GarbageSet {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            pool: Vec::new(),
            count: 0,
        }
    }

    /// Append to the bag of `epoch`. Epochs only grow, except when several
    /// threads retire concurrently; an older epoch then opens its own bag.
    fn add(&mut self, object: RetiredObject, epoch: Epoch) {
        match self.queue.back_mut() {
            Some((last_epoch, bag)) if *last_epoch == epoch => bag.push(object),
            _ => {
                let mut bag = self.pool.pop().unwrap_or_else(|| Vec::with_capacity(16));
                bag.push(object);
                self.queue.push_back((epoch, bag));
            }
        }
        self.count += 1;
    }

    /// Take every bag retired at or before `safe_epoch` out of the set.
    ///
    /// The caller drops the bags after releasing the lock.
    fn split_reclaimable(&mut self, safe_epoch: Epoch) -> Vec<Vec<RetiredObject>> {
        let mut ready = Vec::new();
        let mut kept = VecDeque::with_capacity(self.queue.len());
        for (epoch, bag) in self.queue.drain(..) {
            if epoch <= safe_epoch {
                self.count -= bag.len();
                ready.push(bag);
            } else {
                kept.push_back((epoch, bag));
            }
        }
        self.queue = kept;
        ready
    }

    fn recycle(&mut self, mut bag: Vec<RetiredObject>) {
        bag.clear();
        self.pool.push(bag);
    }
}

/// Builder for configuring a [`Reclaimer`].
pub struct ReclaimerBuilder {
    auto_reclaim_threshold: Option<usize>,
}

impl ReclaimerBuilder {
    #[inline]
    pub fn new() -> Self {
        Self {
            auto_reclaim_threshold: Some(AUTO_RECLAIM_THRESHOLD),
        }
    }

    /// Set the automatic reclamation threshold.
    ///
    /// When the pending count exceeds this threshold, `collect()` runs as part of `retire()`.
    /// Pass `None` to disable automatic reclamation.
    ///
    /// Default: `Some(64)`
    ///
    /// 设置自动回收阈值。当待回收数量超过此阈值时，`retire()` 会顺带执行 `collect()`。
    /// 传递 `None` 可禁用自动回收。
    #[inline]
    pub fn auto_reclaim_threshold(mut self, threshold: impl Into<Option<usize>>) -> Self {
        self.auto_reclaim_threshold = threshold.into();
        self
    }

    pub fn build(self) -> Reclaimer {
        Reclaimer {
            garbage: Mutex::new(GarbageSet::new()),
            auto_reclaim_threshold: self.auto_reclaim_threshold,
        }
    }
}

impl Default for ReclaimerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Deferred destruction of objects unlinked from an epoch-protected structure.
///
/// Objects are tagged with the manager's current epoch when retired and
/// destroyed once the manager's watermark reaches that epoch. Retirements and
/// reclamations are counted in the manager's metrics. Any thread may
/// retire or collect; the bag list sits behind a mutex that is never held while
/// destructors run.
///
/// ```
/// use rdma_epoch::{EpochManager, Reclaimer};
///
/// let manager = EpochManager::builder().build().unwrap();
/// let reclaimer = Reclaimer::new();
///
/// reclaimer.retire(&manager, Box::new([0u8; 1024]));
/// assert_eq!(reclaimer.pending(), 1);
///
/// reclaimer.collect(&manager);
/// assert_eq!(reclaimer.pending(), 0);
/// ```
///
/// 对从纪元保护结构中摘除的对象进行延迟销毁。
/// 对象在退休时被打上管理器当前纪元的标签，当管理器的水位线到达该纪元后被销毁。
pub struct Reclaimer {
    garbage: Mutex<GarbageSet>,
    auto_reclaim_threshold: Option<usize>,
}

impl Default for Reclaimer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Reclaimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reclaimer")
            .field("pending", &self.pending())
            .field("auto_reclaim_threshold", &self.auto_reclaim_threshold)
            .finish()
    }
}

impl Reclaimer {
    #[inline]
    pub fn new() -> Self {
        ReclaimerBuilder::new().build()
    }

    #[inline]
    pub fn builder() -> ReclaimerBuilder {
        ReclaimerBuilder::new()
    }

    /// Number of retired objects not destroyed yet.
    pub fn pending(&self) -> usize {
        self.garbage.lock().count
    }

    /// Retire `data`, tagged with the manager's current epoch.
    ///
    /// Call only after `data` is unreachable for threads that protect later.
    pub fn retire<T: Send + 'static>(&self, manager: &EpochManager, data: Box<T>) {
        let epoch = manager.current_epoch();
        let pending = {
            let mut garbage = self.garbage.lock();
            garbage.add(RetiredObject::new(data), epoch);
            garbage.count
        };
        manager.metrics().objects_retired(1);

        if let Some(threshold) = self.auto_reclaim_threshold {
            if pending > threshold {
                self.collect(manager);
            }
        }
    }

    /// Destroy everything retired at or before the manager's current watermark.
    ///
    /// Returns the number of objects destroyed.
    pub fn reclaim(&self, manager: &EpochManager) -> usize {
        self.reclaim_up_to(manager, manager.reclaim_epoch())
    }

    /// Bump the manager's epoch, then reclaim against the fresh watermark.
    pub fn collect(&self, manager: &EpochManager) -> usize {
        manager.bump_current_epoch();
        self.reclaim(manager)
    }

    fn reclaim_up_to(&self, manager: &EpochManager, safe_epoch: Epoch) -> usize {
        let ready = self.garbage.lock().split_reclaimable(safe_epoch);
        if ready.is_empty() {
            return 0;
        }

        let reclaimed: usize = ready.iter().map(Vec::len).sum();
        let mut emptied = Vec::with_capacity(ready.len());
        for mut bag in ready {
            // Drops the objects outside the lock.
            bag.clear();
            emptied.push(bag);
        }

        let mut garbage = self.garbage.lock();
        for bag in emptied {
            garbage.recycle(bag);
        }
        drop(garbage);

        manager.metrics().objects_reclaimed(reclaimed as u64);
        trace!(safe_epoch, reclaimed, "epoch.reclaimer.reclaimed");
        reclaimed
    }
}
