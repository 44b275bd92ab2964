//! Worker wire protocol.
//!
//! Requests carry a reply channel; workers answer with exactly one
//! response per request. Vectors travel either as owned arrays or as a
//! shared block plus per-row metadata (the zero-copy path).

use std::sync::Arc;

use crossbeam::channel::Sender;
use serde_json::Value;

use crate::core::Stream;

use super::search::{SearchHit, SearchStats, VectorBlock};

/// One record in the owned-transfer path.
#[derive(Clone, Debug)]
pub struct VectorEntry {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: Value,
}

/// Row metadata accompanying a shared block.
#[derive(Clone, Debug)]
pub struct EntryMeta {
    pub id: String,
    pub payload: Value,
}

/// Where the candidate vectors live.
#[derive(Clone, Debug)]
pub enum VectorSource {
    /// Vectors copied into the request.
    Owned(Vec<VectorEntry>),
    /// Shared block lent immutably for the duration of the search.
    Shared {
        block: Arc<VectorBlock>,
        entries: Vec<EntryMeta>,
    },
}

impl VectorSource {
    pub fn len(&self) -> usize {
        match self {
            VectorSource::Owned(entries) => entries.len(),
            VectorSource::Shared { entries, .. } => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
pub enum WorkerRequest {
    Search {
        id: u64,
        query_vector: Vec<f32>,
        source: VectorSource,
        threshold: f32,
        limit: usize,
        reply: Sender<WorkerResponse>,
    },
    DetectPatterns {
        id: u64,
        streams: Vec<Stream>,
        reply: Sender<WorkerResponse>,
    },
    Ping {
        id: u64,
        reply: Sender<WorkerResponse>,
    },
}

impl WorkerRequest {
    pub fn id(&self) -> u64 {
        match self {
            WorkerRequest::Search { id, .. }
            | WorkerRequest::DetectPatterns { id, .. }
            | WorkerRequest::Ping { id, .. } => *id,
        }
    }
}

#[derive(Clone, Debug)]
pub enum WorkerResponse {
    Results {
        id: u64,
        results: Vec<SearchHit>,
        stats: SearchStats,
    },
    Patterns {
        id: u64,
        patterns: Vec<(String, Value)>,
        duration_ms: u64,
    },
    Error {
        id: u64,
        message: String,
    },
    Pong {
        id: u64,
    },
}

impl WorkerResponse {
    pub fn id(&self) -> u64 {
        match self {
            WorkerResponse::Results { id, .. }
            | WorkerResponse::Patterns { id, .. }
            | WorkerResponse::Error { id, .. }
            | WorkerResponse::Pong { id } => *id,
        }
    }
}
