/// 边界情况测试模块
/// Full registries, exited threads and deferred destruction limits.
use crate::{EpochManager, Error, Reclaimer, Restart};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

struct Counted(Arc<AtomicUsize>);

impl Drop for Counted {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// 测试1: 登记表满时返回错误，线程退出后条目被回收复用
#[test]
fn test_full_registry_recycles_exited_threads() {
    let manager = Arc::new(EpochManager::builder().table_capacity(2).build().unwrap());
    let claimed = Arc::new(Barrier::new(3));
    let release = Arc::new(Barrier::new(3));

    let holders: Vec<_> = (0..2)
        .map(|_| {
            let manager = Arc::clone(&manager);
            let claimed = Arc::clone(&claimed);
            let release = Arc::clone(&release);
            thread::spawn(move || {
                {
                    let _guard = manager.pin().unwrap();
                }
                claimed.wait();
                release.wait();
            })
        })
        .collect();

    claimed.wait();
    let err = manager.pin().map(|_| ()).unwrap_err();
    assert!(matches!(err, Error::RegistryExhausted { capacity: 2 }));
    assert!(!manager.is_protected());

    release.wait();
    for holder in holders {
        holder.join().unwrap();
    }

    {
        let _guard = manager.pin().unwrap();
        assert!(manager.is_protected());
    }

    let snapshot = manager.metrics().snapshot();
    assert_eq!(snapshot.registry_exhausted, 1);
    assert_eq!(snapshot.entries_recycled, 2);
    assert_eq!(snapshot.entries_claimed, 3);
}

/// 测试2: 退出时仍受保护的条目不会被回收，并继续钉住水位线
#[test]
fn test_entry_retired_while_protected_is_not_recycled() {
    let manager = Arc::new(EpochManager::builder().table_capacity(2).build().unwrap());

    {
        let manager = Arc::clone(&manager);
        thread::spawn(move || {
            manager.protect().unwrap();
            // Exits without unprotecting.
        })
        .join()
        .unwrap();
    }

    assert_eq!(manager.table().reclaim_old_entries(), 0);
    for _ in 0..3 {
        manager.bump_current_epoch();
    }
    assert_eq!(manager.reclaim_epoch(), 0);

    let _guard = manager.pin().unwrap();
    let other = Arc::clone(&manager);
    let result = thread::spawn(move || other.protect().map_err(|err| err.to_string()))
        .join()
        .unwrap();
    let message = result.unwrap_err();
    assert!(message.contains("exhausted"), "unexpected error: {message}");
}

/// 测试3: 超过阈值时 retire 自动回收
#[test]
fn test_auto_reclaim_threshold() {
    let manager = EpochManager::builder().build().unwrap();
    let reclaimer = Reclaimer::builder().auto_reclaim_threshold(4).build();
    let drops = Arc::new(AtomicUsize::new(0));

    for _ in 0..4 {
        reclaimer.retire(&manager, Box::new(Counted(Arc::clone(&drops))));
    }
    assert_eq!(reclaimer.pending(), 4);
    assert_eq!(drops.load(Ordering::SeqCst), 0);

    reclaimer.retire(&manager, Box::new(Counted(Arc::clone(&drops))));
    assert_eq!(reclaimer.pending(), 0);
    assert_eq!(drops.load(Ordering::SeqCst), 5);
}

/// 测试4: 禁用自动回收时对象一直保留到手动回收
#[test]
fn test_auto_reclaim_disabled() {
    let manager = EpochManager::builder().build().unwrap();
    let reclaimer = Reclaimer::builder().auto_reclaim_threshold(None).build();
    let drops = Arc::new(AtomicUsize::new(0));

    for _ in 0..200 {
        reclaimer.retire(&manager, Box::new(Counted(Arc::clone(&drops))));
    }
    assert_eq!(reclaimer.pending(), 200);

    // Nothing was bumped yet, so the watermark still sits below the retire epoch.
    assert_eq!(reclaimer.reclaim(&manager), 0);
    assert_eq!(reclaimer.collect(&manager), 200);
    assert_eq!(drops.load(Ordering::SeqCst), 200);
}

/// 测试5: 受保护的读者阻止回收其纪元之后退休的对象
#[test]
fn test_protection_defers_destruction() {
    let manager = EpochManager::builder().build().unwrap();
    let reclaimer = Reclaimer::builder().auto_reclaim_threshold(None).build();
    let drops = Arc::new(AtomicUsize::new(0));

    reclaimer.retire(&manager, Box::new(Counted(Arc::clone(&drops))));
    manager.bump_current_epoch();

    let guard = manager.pin().unwrap();
    reclaimer.retire(&manager, Box::new(Counted(Arc::clone(&drops))));

    // Only the object retired before the guard was taken.
    assert_eq!(reclaimer.collect(&manager), 1);
    assert_eq!(reclaimer.collect(&manager), 0);
    assert_eq!(reclaimer.pending(), 1);

    drop(guard);
    assert_eq!(reclaimer.collect(&manager), 1);
    assert_eq!(drops.load(Ordering::SeqCst), 2);
    assert_eq!(manager.metrics().snapshot().pending_objects(), 0);
}

/// 测试6: 回收器被 drop 时销毁所有剩余对象
#[test]
fn test_dropping_reclaimer_destroys_pending() {
    let manager = EpochManager::builder().build().unwrap();
    let drops = Arc::new(AtomicUsize::new(0));

    {
        let reclaimer = Reclaimer::builder().auto_reclaim_threshold(None).build();
        for _ in 0..10 {
            reclaimer.retire(&manager, Box::new(Counted(Arc::clone(&drops))));
        }
        assert_eq!(drops.load(Ordering::SeqCst), 0);
    }

    assert_eq!(drops.load(Ordering::SeqCst), 10);
}

/// 测试7: 错误信息
#[test]
fn test_error_messages() {
    let err = Error::RegistryExhausted { capacity: 8 };
    assert!(err.to_string().contains('8'));

    let restart = Restart { observed: 7 };
    assert!(restart.to_string().contains('7'));

    let io: Error = std::io::Error::other("boom").into();
    assert!(matches!(io, Error::Io(_)));
}
