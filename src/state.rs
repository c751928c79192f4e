use crate::sync::AtomicU64;

/// A value of the global logical clock. Starts at 1 and only moves forward.
/// 全局逻辑时钟的值。从 1 开始，只会向前推进。
pub type Epoch = u64;

/// Size of one registry entry and of one compare-and-swap buffer slot.
/// 一个登记表条目以及一个 CAS 缓冲槽的大小。
pub const CACHE_LINE_SIZE: usize = 64;

/// Default number of entries in the epoch table.
/// 纪元表的默认条目数。
pub const DEFAULT_TABLE_SIZE: usize = 128;

/// Default threshold for automatic garbage reclamation (count of retired objects).
/// 自动垃圾回收的默认阈值（已退休对象的数量）。
pub const AUTO_RECLAIM_THRESHOLD: usize = 64;

/// Epoch value of a fresh manager.
pub(crate) const INITIAL_EPOCH: Epoch = 1;

/// `protected_epoch` value meaning "not observing anything".
/// `protected_epoch` 的取值，表示"未观察任何纪元"。
pub(crate) const UNPROTECTED: Epoch = 0;

/// Owner value of an entry nobody has claimed.
pub(crate) const FREE_OWNER: u64 = 0;

/// Owner value of an entry whose thread has exited but which has not been recycled yet.
/// 线程已退出、但尚未被回收复用的条目的 owner 取值。
pub(crate) const RETIRED_OWNER: u64 = u64::MAX;

/// One slot of the epoch table.
///
/// Exactly one cache line: scanning the table touches one line per thread and
/// two threads never share a line.
///
/// 纪元表中的一个槽位。
/// 恰好占一个缓存行：扫描时每个线程只触碰一个缓存行，且两个线程永远不会共享同一缓存行。
#[derive(Debug)]
#[repr(C, align(64))]
pub(crate) struct Entry {
    /// Epoch this thread currently observes, or `UNPROTECTED`.
    /// 此线程当前观察的纪元，或 `UNPROTECTED`。
    pub(crate) protected_epoch: AtomicU64,
    /// Epoch recorded by the last unprotect. Written, never consulted.
    /// 最近一次 unprotect 时记录的纪元。只写入，不参与任何判断。
    pub(crate) last_unprotected_epoch: AtomicU64,
    /// Identity of the owning thread, `FREE_OWNER` or `RETIRED_OWNER`.
    /// 拥有者线程的标识，或 `FREE_OWNER` / `RETIRED_OWNER`。
    pub(crate) owner: AtomicU64,
    _padding: [u8; CACHE_LINE_SIZE - 24],
}

impl Entry {
    pub(crate) fn new() -> Self {
        Self {
            protected_epoch: AtomicU64::new(UNPROTECTED),
            last_unprotected_epoch: AtomicU64::new(0),
            owner: AtomicU64::new(FREE_OWNER),
            _padding: [0; CACHE_LINE_SIZE - 24],
        }
    }
}

#[cfg(not(feature = "loom"))]
const _: () = assert!(std::mem::size_of::<Entry>() == CACHE_LINE_SIZE);
#[cfg(not(feature = "loom"))]
const _: () = assert!(std::mem::align_of::<Entry>() == CACHE_LINE_SIZE);
