//! Quota monitoring and storage degradation tiers.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::config::Limits;
use crate::core::{EventPayload, QuotaSnapshot, StoreName};
use crate::eventlog::EventSink;

/// Reports current storage usage. Production measures the store directory;
/// tests inject fixed values.
pub trait QuotaProbe: Send + Sync {
    fn usage_bytes(&self) -> u64;
}

/// Sums file sizes under the store directory.
pub struct DirUsageProbe {
    dir: PathBuf,
}

impl DirUsageProbe {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }
}

impl QuotaProbe for DirUsageProbe {
    fn usage_bytes(&self) -> u64 {
        fn walk(dir: &Path) -> u64 {
            let Ok(entries) = std::fs::read_dir(dir) else {
                return 0;
            };
            entries
                .flatten()
                .map(|entry| {
                    let path = entry.path();
                    match entry.metadata() {
                        Ok(meta) if meta.is_dir() => walk(&path),
                        Ok(meta) => meta.len(),
                        Err(_) => 0,
                    }
                })
                .sum()
        }
        walk(&self.dir)
    }
}

/// Fixed usage for tests.
pub struct FixedUsageProbe(pub u64);

impl QuotaProbe for FixedUsageProbe {
    fn usage_bytes(&self) -> u64 {
        self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuotaLevel {
    Normal,
    Warning,
    Critical,
}

/// Storage degradation tiers, worst first wins.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DegradationTier {
    Normal,
    Degraded,
    ReadOnly,
    Emergency,
}

impl DegradationTier {
    pub fn as_str(self) -> &'static str {
        match self {
            DegradationTier::Normal => "NORMAL",
            DegradationTier::Degraded => "DEGRADED",
            DegradationTier::ReadOnly => "READ_ONLY",
            DegradationTier::Emergency => "EMERGENCY",
        }
    }
}

/// What a write is, for admission purposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteClass {
    /// Ordinary mutation into `store`.
    Mutation { store: StoreName },
    /// Delete/clear: always space-reclaiming, admitted under pressure.
    Reclaim,
    /// Small allowlist of recovery writes admitted while read-only.
    Recovery,
}

/// Stores that stay writable for recovery while the tier is read-only.
pub const RECOVERY_STORES: &[StoreName] = &[StoreName::Settings];

/// Periodic usage estimation plus admission control.
///
/// Tier transitions are driven by quota level, consecutive write failures,
/// and explicit user action; the monitor emits quota events on every level
/// change and a tier event on every tier change.
pub struct QuotaMonitor {
    probe: Box<dyn QuotaProbe>,
    quota_bytes: u64,
    limits: Limits,
    sink: EventSink,
    level: Mutex<QuotaLevel>,
    tier: Mutex<DegradationTier>,
    consecutive_failures: AtomicU32,
    last_check_ms: AtomicU64,
    user_tier_floor: Mutex<Option<DegradationTier>>,
}

impl QuotaMonitor {
    pub fn new(
        probe: Box<dyn QuotaProbe>,
        quota_bytes: u64,
        limits: Limits,
        sink: EventSink,
    ) -> Self {
        Self {
            probe,
            quota_bytes,
            limits,
            sink,
            level: Mutex::new(QuotaLevel::Normal),
            tier: Mutex::new(DegradationTier::Normal),
            consecutive_failures: AtomicU32::new(0),
            last_check_ms: AtomicU64::new(0),
            user_tier_floor: Mutex::new(None),
        }
    }

    pub fn snapshot(&self) -> QuotaSnapshot {
        QuotaSnapshot::new(self.probe.usage_bytes(), self.quota_bytes)
    }

    pub fn level(&self) -> QuotaLevel {
        *self.level.lock().expect("quota lock poisoned")
    }

    pub fn tier(&self) -> DegradationTier {
        *self.tier.lock().expect("tier lock poisoned")
    }

    /// Recompute only when the check interval has elapsed. The store calls
    /// this on every commit so estimation stays periodic without a timer.
    pub fn maybe_recompute(&self, now_ms: u64) {
        let last = self.last_check_ms.load(Ordering::SeqCst);
        if now_ms.saturating_sub(last) >= self.limits.quota_check_interval_ms {
            self.recompute(now_ms);
        }
    }

    /// Re-estimate usage, emitting transition events. Returns the snapshot.
    pub fn recompute(&self, now_ms: u64) -> QuotaSnapshot {
        self.last_check_ms.store(now_ms, Ordering::SeqCst);
        let snapshot = self.snapshot();
        let new_level = if snapshot.percentage >= self.limits.quota_critical_ratio {
            QuotaLevel::Critical
        } else if snapshot.percentage >= self.limits.quota_warn_ratio {
            QuotaLevel::Warning
        } else {
            QuotaLevel::Normal
        };

        let changed = {
            let mut level = self.level.lock().expect("quota lock poisoned");
            let changed = *level != new_level;
            *level = new_level;
            changed
        };

        if changed {
            let payload = match new_level {
                QuotaLevel::Normal => EventPayload::QuotaNormal(snapshot),
                QuotaLevel::Warning => EventPayload::QuotaWarning(snapshot),
                QuotaLevel::Critical => EventPayload::QuotaCritical(snapshot),
            };
            self.sink.emit(payload, now_ms);
        }

        self.refresh_tier(now_ms);
        snapshot
    }

    /// Post-write hook: recompute immediately for large writes.
    pub fn on_write_committed(&self, bytes: u64, now_ms: u64) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        if bytes > self.limits.large_write_threshold_bytes {
            self.recompute(now_ms);
        }
        self.refresh_tier(now_ms);
    }

    /// Record a failed write; enough in a row degrades the store.
    pub fn on_write_failed(&self, now_ms: u64) {
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
        self.refresh_tier(now_ms);
    }

    /// Explicit user action pinning a floor tier (or releasing it).
    pub fn set_user_tier(&self, tier: Option<DegradationTier>, now_ms: u64) {
        *self.user_tier_floor.lock().expect("tier lock poisoned") = tier;
        self.refresh_tier(now_ms);
    }

    /// Admission decision for one write.
    pub fn admit(&self, class: WriteClass) -> Result<(), QuotaSnapshot> {
        let tier = self.tier();
        let admitted = match tier {
            DegradationTier::Normal | DegradationTier::Degraded => true,
            DegradationTier::ReadOnly => matches!(class, WriteClass::Reclaim | WriteClass::Recovery),
            DegradationTier::Emergency => matches!(class, WriteClass::Reclaim),
        };
        // Embedding growth freezes from ReadOnly up.
        let admitted = admitted
            && !(tier >= DegradationTier::ReadOnly
                && matches!(
                    class,
                    WriteClass::Mutation {
                        store: StoreName::Embeddings
                    }
                ));
        if admitted {
            Ok(())
        } else {
            Err(self.snapshot())
        }
    }

    fn refresh_tier(&self, now_ms: u64) {
        let level = self.level();
        let failures = self.consecutive_failures.load(Ordering::SeqCst);
        let floor = *self.user_tier_floor.lock().expect("tier lock poisoned");

        let from_level = match level {
            QuotaLevel::Normal => DegradationTier::Normal,
            QuotaLevel::Warning => DegradationTier::Degraded,
            QuotaLevel::Critical => DegradationTier::ReadOnly,
        };
        let from_failures = if failures >= self.limits.degraded_write_failures {
            DegradationTier::ReadOnly
        } else if failures > 0 {
            DegradationTier::Degraded
        } else {
            DegradationTier::Normal
        };
        let mut next = from_level.max(from_failures);
        if let Some(floor) = floor {
            next = next.max(floor);
        }

        let mut tier = self.tier.lock().expect("tier lock poisoned");
        if *tier != next {
            tracing::info!(from = tier.as_str(), to = next.as_str(), "storage tier changed");
            *tier = next;
            drop(tier);
            self.sink.emit(
                EventPayload::TierChanged {
                    tier: next.as_str().to_string(),
                },
                now_ms,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ReplicaId;
    use crate::eventlog::{EventBus, EventLog};

    fn sink() -> EventSink {
        EventSink::new(EventLog::new(ReplicaId::random(), 1000), EventBus::new(16))
    }

    fn monitor(usage: u64, quota: u64) -> QuotaMonitor {
        QuotaMonitor::new(
            Box::new(FixedUsageProbe(usage)),
            quota,
            Limits::default(),
            sink(),
        )
    }

    #[test]
    fn levels_follow_thresholds() {
        let m = monitor(79, 100);
        m.recompute(0);
        assert_eq!(m.level(), QuotaLevel::Normal);

        let m = monitor(80, 100);
        m.recompute(0);
        assert_eq!(m.level(), QuotaLevel::Warning);
        assert_eq!(m.tier(), DegradationTier::Degraded);

        let m = monitor(96, 100);
        m.recompute(0);
        assert_eq!(m.level(), QuotaLevel::Critical);
        assert_eq!(m.tier(), DegradationTier::ReadOnly);
    }

    #[test]
    fn critical_admits_only_reclaim_and_recovery() {
        let m = monitor(96, 100);
        m.recompute(0);

        assert!(m
            .admit(WriteClass::Mutation {
                store: StoreName::Streams
            })
            .is_err());
        assert!(m.admit(WriteClass::Reclaim).is_ok());
        assert!(m.admit(WriteClass::Recovery).is_ok());
    }

    #[test]
    fn emergency_blocks_recovery_writes_too() {
        let m = monitor(10, 100);
        m.set_user_tier(Some(DegradationTier::Emergency), 0);
        assert!(m.admit(WriteClass::Recovery).is_err());
        assert!(m.admit(WriteClass::Reclaim).is_ok());
    }

    #[test]
    fn consecutive_failures_degrade_then_recover() {
        let m = monitor(10, 100);
        for _ in 0..Limits::default().degraded_write_failures {
            m.on_write_failed(0);
        }
        assert_eq!(m.tier(), DegradationTier::ReadOnly);

        m.on_write_committed(0, 0);
        assert_eq!(m.tier(), DegradationTier::Normal);
    }

    #[test]
    fn recovery_below_warn_restores_writes() {
        let m = QuotaMonitor::new(
            Box::new(FixedUsageProbe(96)),
            100,
            Limits::default(),
            sink(),
        );
        m.recompute(0);
        assert!(m
            .admit(WriteClass::Mutation {
                store: StoreName::Streams
            })
            .is_err());
        // Usage cannot change through FixedUsageProbe; emulate cleanup with
        // a fresh monitor at 70%.
        let m = monitor(70, 100);
        m.recompute(0);
        assert!(m
            .admit(WriteClass::Mutation {
                store: StoreName::Streams
            })
            .is_ok());
    }

    #[test]
    fn embedding_growth_frozen_under_pressure() {
        let m = monitor(96, 100);
        m.recompute(0);
        assert!(m
            .admit(WriteClass::Mutation {
                store: StoreName::Embeddings
            })
            .is_err());
    }
}
