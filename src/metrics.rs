//! Counters for the epoch subsystem.
//!
//! One [`EpochMetrics`] is built explicitly by the owner of an
//! [`EpochManager`](crate::EpochManager) and handed to it through the builder.
//! The manager shares it with its table and with any
//! [`Reclaimer`](crate::Reclaimer) driven by it. Call [`EpochMetrics::reset`]
//! at the start of a run and [`EpochMetrics::snapshot`] at shutdown.

use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe event counters. All updates are relaxed; a snapshot is not a
/// consistent cut across counters.
#[derive(Debug, Default)]
pub struct EpochMetrics {
    protects: AtomicU64,
    unprotects: AtomicU64,
    protect_retries: AtomicU64,
    epoch_bumps: AtomicU64,
    entries_claimed: AtomicU64,
    claim_conflicts: AtomicU64,
    entries_recycled: AtomicU64,
    registry_exhausted: AtomicU64,
    objects_retired: AtomicU64,
    objects_reclaimed: AtomicU64,
}

/// Plain copy of [`EpochMetrics`] at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Successful protect calls.
    pub protects: u64,
    /// Successful unprotect calls.
    pub unprotects: u64,
    /// Times a protect had to republish because the epoch moved underneath it.
    pub protect_retries: u64,
    /// Global epoch bumps.
    pub epoch_bumps: u64,
    /// Registry entries claimed by a thread.
    pub entries_claimed: u64,
    /// Claim attempts that lost a compare-and-swap race.
    pub claim_conflicts: u64,
    /// Retired entries returned to the free state.
    pub entries_recycled: u64,
    /// Claims that failed because the table was full.
    pub registry_exhausted: u64,
    /// Objects handed to a reclaimer.
    pub objects_retired: u64,
    /// Retired objects actually destroyed.
    pub objects_reclaimed: u64,
}

impl MetricsSnapshot {
    /// Retired objects still waiting for the watermark to pass them.
    pub fn pending_objects(&self) -> u64 {
        self.objects_retired.saturating_sub(self.objects_reclaimed)
    }
}

impl EpochMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            protects: self.protects.load(Ordering::Relaxed),
            unprotects: self.unprotects.load(Ordering::Relaxed),
            protect_retries: self.protect_retries.load(Ordering::Relaxed),
            epoch_bumps: self.epoch_bumps.load(Ordering::Relaxed),
            entries_claimed: self.entries_claimed.load(Ordering::Relaxed),
            claim_conflicts: self.claim_conflicts.load(Ordering::Relaxed),
            entries_recycled: self.entries_recycled.load(Ordering::Relaxed),
            registry_exhausted: self.registry_exhausted.load(Ordering::Relaxed),
            objects_retired: self.objects_retired.load(Ordering::Relaxed),
            objects_reclaimed: self.objects_reclaimed.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.protects,
            &self.unprotects,
            &self.protect_retries,
            &self.epoch_bumps,
            &self.entries_claimed,
            &self.claim_conflicts,
            &self.entries_recycled,
            &self.registry_exhausted,
            &self.objects_retired,
            &self.objects_reclaimed,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn protected(&self) {
        self.protects.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn unprotected(&self) {
        self.unprotects.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn protect_retried(&self) {
        self.protect_retries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn epoch_bumped(&self) {
        self.epoch_bumps.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn entry_claimed(&self) {
        self.entries_claimed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn claim_conflict(&self) {
        self.claim_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn entries_recycled(&self, count: u64) {
        self.entries_recycled.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn registry_exhausted(&self) {
        self.registry_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn objects_retired(&self, count: u64) {
        self.objects_retired.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn objects_reclaimed(&self, count: u64) {
        self.objects_reclaimed.fetch_add(count, Ordering::Relaxed);
    }
}
