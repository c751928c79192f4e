use crate::error::Result;
use crate::manager::EpochManager;
use std::marker::PhantomData;
use tracing::warn;

/// Keeps the current thread protected for the lifetime of a lexical scope.
///
/// Obtained by [`EpochManager::pin`], [`EpochGuard::new`] or
/// [`EpochGuard::attach`]. Dropping the guard unprotects exactly once, on every
/// exit path including unwinding. [`EpochGuard::release`] hands the pending
/// unprotect back to the caller instead.
///
/// The guard is `!Send` and `!Sync`: protection is recorded in the calling
/// thread's registry entry and must be retracted from that same thread.
///
/// **Example**:
/// ```
/// use rdma_epoch::{EpochGuard, EpochManager};
///
/// let manager = EpochManager::builder().build().unwrap();
///
/// let guard = EpochGuard::new(&manager).unwrap();
/// assert!(manager.is_protected());
/// drop(guard);
/// assert!(!manager.is_protected());
/// ```
///
/// 在一个词法作用域的生命周期内保持当前线程处于受保护状态。
/// 守卫被 drop 时恰好执行一次 unprotect，覆盖所有退出路径（包括 panic 展开）。
/// `release` 会把待执行的 unprotect 交还给调用者。
/// 守卫是 `!Send` 和 `!Sync` 的：保护记录在调用线程的登记条目中，必须由同一线程撤销。
#[must_use]
pub struct EpochGuard<'m> {
    manager: &'m EpochManager,
    _not_send: PhantomData<*const ()>,
}

impl<'m> EpochGuard<'m> {
    /// Protect the calling thread and take ownership of the matching unprotect.
    pub fn new(manager: &'m EpochManager) -> Result<Self> {
        manager.protect()?;
        Ok(Self::attach(manager))
    }

    /// Either protect now (`protect == true`) or attach to a protection the
    /// caller already established. In both cases the guard owns the unprotect.
    pub fn with_protect(manager: &'m EpochManager, protect: bool) -> Result<Self> {
        if protect {
            Self::new(manager)
        } else {
            Ok(Self::attach(manager))
        }
    }

    /// Take ownership of the unprotect for a protection the caller already
    /// holds via [`EpochManager::protect`].
    #[inline]
    pub fn attach(manager: &'m EpochManager) -> Self {
        Self {
            manager,
            _not_send: PhantomData,
        }
    }

    /// Give up the guard without unprotecting.
    ///
    /// The caller now owes one [`EpochManager::unprotect`] on this thread.
    #[inline]
    pub fn release(self) -> &'m EpochManager {
        let manager = self.manager;
        std::mem::forget(self);
        manager
    }

    #[inline]
    pub fn manager(&self) -> &'m EpochManager {
        self.manager
    }
}

impl<'m> Drop for EpochGuard<'m> {
    fn drop(&mut self) {
        if let Err(err) = self.manager.unprotect() {
            warn!(error = %err, "epoch.guard.unprotect_failed");
        }
    }
}
