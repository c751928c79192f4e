/// 基础测试模块
/// Basic behaviour of the epoch manager: initialization, epochs, watermark.
use crate::{EpochManager, Error};

/// 测试1: 新建的管理器纪元为 1，回收水位线为 0
#[test]
fn test_fresh_manager_epochs() {
    let manager = EpochManager::builder().build().unwrap();

    assert!(manager.is_initialized());
    assert_eq!(manager.current_epoch(), 1);
    assert_eq!(manager.reclaim_epoch(), 0);
    assert_eq!(manager.table_capacity(), 128);
}

/// 测试2: 未初始化的管理器拒绝 protect
#[test]
fn test_uninitialized_manager_rejects_protect() {
    let mut manager = EpochManager::new();

    assert!(!manager.is_initialized());
    assert_eq!(manager.current_epoch(), 1);
    assert!(matches!(manager.protect(), Err(Error::NotInitialized)));
    assert!(!manager.is_protected());

    manager.initialize().unwrap();
    manager.protect().unwrap();
    assert!(manager.is_protected());
    manager.unprotect().unwrap();
}

/// 测试3: initialize 与 uninitialize 都是幂等的
#[test]
fn test_initialize_and_uninitialize_are_idempotent() {
    let mut manager = EpochManager::new();

    manager.initialize().unwrap();
    manager.initialize().unwrap();
    assert!(manager.is_initialized());

    manager.bump_current_epoch();
    assert_eq!(manager.current_epoch(), 2);

    // A second initialize must not reset a live manager.
    // 第二次 initialize 不应重置正在使用的管理器
    manager.initialize().unwrap();
    assert_eq!(manager.current_epoch(), 2);

    manager.uninitialize();
    manager.uninitialize();
    assert!(!manager.is_initialized());
    assert_eq!(manager.current_epoch(), 1);
    assert_eq!(manager.reclaim_epoch(), 0);
    assert_eq!(manager.table_capacity(), 0);
}

/// 测试4: 表容量必须是 2 的幂
#[test]
fn test_table_capacity_must_be_power_of_two() {
    let err = EpochManager::builder().table_capacity(100).build().unwrap_err();
    assert!(matches!(err, Error::TableSizeNotPowerOfTwo { size: 100 }));

    let err = EpochManager::builder().table_capacity(0).build().unwrap_err();
    assert!(matches!(err, Error::TableSizeNotPowerOfTwo { size: 0 }));

    let manager = EpochManager::builder().table_capacity(128).build().unwrap();
    assert_eq!(manager.table_capacity(), 128);
}

/// 测试5: 没有受保护线程时，推进后水位线为新纪元减一
#[test]
fn test_bump_without_protection_advances_watermark() {
    let manager = EpochManager::builder().build().unwrap();

    for expected in 2..10 {
        let new_epoch = manager.bump_current_epoch();
        assert_eq!(new_epoch, expected);
        assert_eq!(manager.current_epoch(), expected);
        assert_eq!(manager.reclaim_epoch(), expected - 1);
    }
}

/// 测试6: 受保护线程会钉住水位线
#[test]
fn test_protection_pins_watermark() {
    let manager = EpochManager::builder().build().unwrap();

    manager.bump_current_epoch();
    manager.bump_current_epoch();
    assert_eq!(manager.current_epoch(), 3);

    manager.protect().unwrap();
    assert_eq!(manager.protected_epoch(), Some(3));

    for _ in 0..5 {
        manager.bump_current_epoch();
        assert_eq!(manager.reclaim_epoch(), 2);
        assert!(manager.is_safe_to_reclaim(2));
        assert!(!manager.is_safe_to_reclaim(3));
    }

    manager.unprotect().unwrap();
    manager.bump_current_epoch();
    assert_eq!(manager.reclaim_epoch(), manager.current_epoch() - 1);
    assert!(manager.is_safe_to_reclaim(3));
}

/// 测试7: is_safe_to_reclaim 与水位线的比较
#[test]
fn test_is_safe_to_reclaim_boundary() {
    let manager = EpochManager::builder().build().unwrap();

    assert!(manager.is_safe_to_reclaim(0));
    assert!(!manager.is_safe_to_reclaim(1));

    manager.bump_current_epoch();
    assert!(manager.is_safe_to_reclaim(1));
    assert!(!manager.is_safe_to_reclaim(2));
}

/// 测试8: 重新计算水位线时使用调用者给出的纪元
#[test]
fn test_compute_watermark_with_explicit_epoch() {
    let manager = EpochManager::builder().build().unwrap();

    manager.compute_new_safe_to_reclaim_epoch(10);
    assert_eq!(manager.reclaim_epoch(), 9);

    manager.protect().unwrap();
    manager.compute_new_safe_to_reclaim_epoch(10);
    assert_eq!(manager.reclaim_epoch(), 0);
    manager.unprotect().unwrap();
}

/// 测试9: 指标记录 protect、unprotect 与推进
#[test]
fn test_metrics_record_operations() {
    let manager = EpochManager::builder().build().unwrap();
    manager.metrics().reset();

    manager.protect().unwrap();
    manager.unprotect().unwrap();
    manager.bump_current_epoch();
    manager.bump_current_epoch();

    let snapshot = manager.metrics().snapshot();
    assert_eq!(snapshot.protects, 1);
    assert_eq!(snapshot.unprotects, 1);
    assert_eq!(snapshot.epoch_bumps, 2);

    manager.metrics().reset();
    assert_eq!(manager.metrics().snapshot(), Default::default());
}

/// 测试10: 共享外部指标对象
#[test]
fn test_shared_metrics_object() {
    use crate::EpochMetrics;
    use std::sync::Arc;

    let metrics = Arc::new(EpochMetrics::new());
    let manager = EpochManager::builder()
        .metrics(Arc::clone(&metrics))
        .build()
        .unwrap();

    manager.protect().unwrap();
    manager.unprotect().unwrap();

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.protects, 1);
    assert_eq!(snapshot.entries_claimed, 1);
}
