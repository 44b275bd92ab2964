#![allow(dead_code)]

//! Shared fixtures for the integration suites.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use echovault::core::ReplicaId;
use echovault::eventlog::{EventBus, EventLog, EventSink};
use echovault::store::quota::{QuotaMonitor, QuotaProbe};
use echovault::store::DurableStore;
use echovault::{Config, Core, CoreContext, KeyManager, Limits, ManualTimeSource, Stream};

/// Limits tuned so connection retries finish in milliseconds.
pub fn fast_limits() -> Limits {
    Limits {
        connect_max_attempts: 2,
        connect_backoff_base_ms: 5,
        connect_backoff_cap_ms: 10,
        ..Limits::default()
    }
}

pub fn test_config(dir: &Path) -> Config {
    Config {
        database: dir.to_path_buf(),
        quota_bytes: 64 * 1024 * 1024,
        limits: fast_limits(),
        ..Config::default()
    }
}

pub fn open_core(dir: &Path) -> Core {
    let config = test_config(dir);
    let keys = KeyManager::derive(b"integration-root", b"salt", true).unwrap();
    let ctx = CoreContext::new(config, keys, Arc::new(echovault::SystemTimeSource));
    Core::open(ctx, dir, 2).unwrap()
}

pub fn stream(ts: &str, track: &str) -> Stream {
    Stream {
        ts: ts.to_string(),
        track: track.to_string(),
        artist: "artist".to_string(),
        ms_played: 30_000,
        context: None,
    }
}

pub fn sink() -> EventSink {
    EventSink::new(EventLog::new(ReplicaId::random(), 10_000), EventBus::new(32))
}

/// Quota probe whose reading tests can move.
#[derive(Clone)]
pub struct SharedProbe(pub Arc<AtomicU64>);

impl SharedProbe {
    pub fn at(usage: u64) -> (Self, Arc<AtomicU64>) {
        let cell = Arc::new(AtomicU64::new(usage));
        (Self(Arc::clone(&cell)), cell)
    }
}

impl QuotaProbe for SharedProbe {
    fn usage_bytes(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// A store wired to a controllable quota probe and manual clock.
pub struct StoreRig {
    pub store: Arc<DurableStore>,
    pub sink: EventSink,
    pub time: Arc<ManualTimeSource>,
    pub usage: Arc<AtomicU64>,
    pub quota_bytes: u64,
}

pub fn store_rig(dir: &Path, usage: u64, quota_bytes: u64) -> StoreRig {
    let limits = fast_limits();
    let time = Arc::new(ManualTimeSource::at(1_700_000_000_000));
    let sink = sink();
    let (probe, cell) = SharedProbe::at(usage);
    let quota = Arc::new(QuotaMonitor::new(
        Box::new(probe),
        quota_bytes,
        limits.clone(),
        sink.clone(),
    ));
    let keys = Arc::new(KeyManager::derive(b"rig-root", b"salt", true).unwrap());
    let store = Arc::new(
        DurableStore::open_with_retry(
            dir,
            ReplicaId::random(),
            keys,
            limits,
            quota,
            sink.clone(),
            {
                let time_dyn: Arc<dyn echovault::TimeSource> = time.clone();
                time_dyn
            },
        )
        .unwrap(),
    );
    StoreRig {
        store,
        sink,
        time,
        usage: cell,
        quota_bytes,
    }
}
