//! Events: schema-declared payloads with per-producer sequencing.

use serde::{Deserialize, Serialize};

use super::ids::ReplicaId;
use super::seq::Seq1;
use super::stores::StoreName;

/// Usage snapshot attached to quota events.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub usage_bytes: u64,
    pub quota_bytes: u64,
    pub percentage: f64,
}

impl QuotaSnapshot {
    pub fn new(usage_bytes: u64, quota_bytes: u64) -> Self {
        let percentage = if quota_bytes == 0 {
            0.0
        } else {
            usage_bytes as f64 / quota_bytes as f64
        };
        Self {
            usage_bytes,
            quota_bytes,
            percentage,
        }
    }
}

/// Every event the core emits, with its declared payload shape.
///
/// The wire name doubles as the bus topic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    #[serde(rename = "storage:updated")]
    StorageUpdated {
        store: StoreName,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        count: Option<u64>,
    },
    #[serde(rename = "storage:connection_retry")]
    ConnectionRetry {
        attempt: u32,
        max_attempts: u32,
        next_retry_ms: u64,
        error: String,
    },
    #[serde(rename = "storage:connection_blocked")]
    ConnectionBlocked { reason: String, message: String },
    #[serde(rename = "storage:connection_failed")]
    ConnectionFailed { error: String },
    #[serde(rename = "storage:connection_established")]
    ConnectionEstablished { schema_version: u32 },
    #[serde(rename = "storage:quota_warning")]
    QuotaWarning(QuotaSnapshot),
    #[serde(rename = "storage:quota_critical")]
    QuotaCritical(QuotaSnapshot),
    #[serde(rename = "storage:quota_normal")]
    QuotaNormal(QuotaSnapshot),
    #[serde(rename = "storage:tier_changed")]
    TierChanged { tier: String },
    #[serde(rename = "scheduler:breaker_state")]
    BreakerState { resource: String, state: String },
    #[serde(rename = "pool:backpressure")]
    Backpressure { queued: usize },
    #[serde(rename = "pattern:detected")]
    PatternDetected {
        pattern_name: String,
        result: serde_json::Value,
    },
    #[serde(rename = "pattern:all_complete")]
    PatternAllComplete {
        patterns: Vec<String>,
        duration_ms: u64,
    },
    #[serde(rename = "log:compacted")]
    Compacted { through_seq: u64 },
}

impl EventPayload {
    /// The declared wire/topic name.
    pub fn name(&self) -> &'static str {
        match self {
            EventPayload::StorageUpdated { .. } => "storage:updated",
            EventPayload::ConnectionRetry { .. } => "storage:connection_retry",
            EventPayload::ConnectionBlocked { .. } => "storage:connection_blocked",
            EventPayload::ConnectionFailed { .. } => "storage:connection_failed",
            EventPayload::ConnectionEstablished { .. } => "storage:connection_established",
            EventPayload::QuotaWarning(_) => "storage:quota_warning",
            EventPayload::QuotaCritical(_) => "storage:quota_critical",
            EventPayload::QuotaNormal(_) => "storage:quota_normal",
            EventPayload::TierChanged { .. } => "storage:tier_changed",
            EventPayload::BreakerState { .. } => "scheduler:breaker_state",
            EventPayload::Backpressure { .. } => "pool:backpressure",
            EventPayload::PatternDetected { .. } => "pattern:detected",
            EventPayload::PatternAllComplete { .. } => "pattern:all_complete",
            EventPayload::Compacted { .. } => "log:compacted",
        }
    }
}

/// A sequenced event as it lives in the event log.
///
/// `seq` is assigned by the producing replica and is strictly increasing
/// per producer; followers see gaps only during reconnection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq: Seq1,
    #[serde(flatten)]
    pub payload: EventPayload,
    pub ts: u64,
    pub origin: ReplicaId,
}

impl Event {
    pub fn new(seq: Seq1, payload: EventPayload, ts: u64, origin: ReplicaId) -> Self {
        Self {
            seq,
            payload,
            ts,
            origin,
        }
    }
}
