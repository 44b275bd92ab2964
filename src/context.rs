//! Core context and the façade composing every subsystem.
//!
//! The context is built once at startup and threaded everywhere; nothing
//! in the crate reads ambient global state. [`Core`] is the thin seam the
//! host application talks to.

use std::path::Path;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::Config;
use crate::coord::locks::LockManager;
use crate::core::clock::Clock;
use crate::core::error::CoreError;
use crate::core::{
    filter_messages_for_storage, EmbeddingRecord, LruCache, ReplicaId, Seq0, Session, SessionId,
    Stream, StreamLog, StoreName, TimeSource, STREAMS_KEY,
};
use crate::crypto::KeyManager;
use crate::eventlog::{EventBus, EventLog, EventSink};
use crate::pool::{EntryMeta, SearchHit, VectorBlock, VectorSource, WorkerPool, WorkerResponse};
use crate::sched::OpScheduler;
use crate::store::quota::{DirUsageProbe, QuotaMonitor};
use crate::store::DurableStore;

/// Explicit ambient dependencies: clock, keys, config, event plumbing.
#[derive(Clone)]
pub struct CoreContext {
    pub replica_id: ReplicaId,
    pub time: Arc<dyn TimeSource>,
    pub clock: Arc<Clock>,
    pub keys: Arc<KeyManager>,
    pub config: Arc<Config>,
    pub sink: EventSink,
}

impl CoreContext {
    pub fn new(config: Config, keys: KeyManager, time: Arc<dyn TimeSource>) -> Self {
        let replica_id = ReplicaId::random();
        let clock = Arc::new(Clock::new(Arc::clone(&time)));
        let log = EventLog::new(replica_id, config.limits.event_retention_events);
        let bus = EventBus::new(config.limits.max_bus_subscribers);
        Self {
            replica_id,
            time,
            clock,
            keys: Arc::new(keys),
            config: Arc::new(config),
            sink: EventSink::new(log, bus),
        }
    }

    pub fn bus(&self) -> &EventBus {
        self.sink.bus()
    }

    pub fn log(&self) -> &EventLog {
        self.sink.log()
    }
}

/// The assembled core: store, scheduler, pool, locks, behind one seam.
pub struct Core {
    pub ctx: CoreContext,
    store: Arc<DurableStore>,
    scheduler: Arc<OpScheduler>,
    pool: WorkerPool,
    locks: Arc<LockManager>,
    /// Content digests of recently saved sessions; an unchanged save is
    /// suppressed before it reaches the WAL.
    save_dedup: Mutex<LruCache<String, [u8; 32]>>,
}

impl Core {
    /// Open every subsystem against `dir`.
    pub fn open(ctx: CoreContext, dir: &Path, workers: usize) -> Result<Self, CoreError> {
        let limits = ctx.config.limits.clone();
        let quota = Arc::new(QuotaMonitor::new(
            Box::new(DirUsageProbe::new(dir)),
            ctx.config.quota_bytes,
            limits.clone(),
            ctx.sink.clone(),
        ));
        let store = Arc::new(DurableStore::open_with_retry(
            dir,
            ctx.replica_id,
            Arc::clone(&ctx.keys),
            limits.clone(),
            quota,
            ctx.sink.clone(),
            Arc::clone(&ctx.time),
        )?);
        let scheduler = Arc::new(OpScheduler::new(
            limits.clone(),
            Arc::clone(&ctx.time),
            ctx.sink.clone(),
        ));
        let pool = WorkerPool::new(
            workers,
            limits.clone(),
            Arc::clone(&ctx.time),
            ctx.sink.clone(),
        );
        let locks = Arc::new(LockManager::new(
            Arc::clone(&ctx.time),
            limits.lock_default_ttl_ms,
            limits.lock_acquire_timeout_ms,
        ));
        let save_dedup = Mutex::new(LruCache::new(
            ctx.config.limits.message_hash_cache_capacity,
        ));
        Ok(Self {
            ctx,
            store,
            scheduler,
            pool,
            locks,
            save_dedup,
        })
    }

    pub fn store(&self) -> &Arc<DurableStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<OpScheduler> {
        &self.scheduler
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    // ---- typed seams ----------------------------------------------------

    /// Append streams to the singleton log.
    pub fn save_streams(&self, streams: Vec<Stream>) -> Result<(), CoreError> {
        self.store.atomic_update(StoreName::Streams, STREAMS_KEY, |current| {
            let mut log: StreamLog = match current {
                Some(value) => serde_json::from_value(value)
                    .map_err(|e| CoreError::validation(format!("malformed stream log: {e}")))?,
                None => StreamLog::new(),
            };
            for stream in streams {
                log.append(stream);
            }
            serde_json::to_value(&log)
                .map_err(|e| CoreError::validation(format!("unserializable stream log: {e}")))
        })
    }

    /// Cheap change fingerprint over the stream log.
    pub fn streams_hash(&self) -> Result<String, CoreError> {
        let log = match self.store.get(StoreName::Streams, STREAMS_KEY)? {
            Some(value) => serde_json::from_value::<StreamLog>(value)
                .map_err(|e| CoreError::validation(format!("malformed stream log: {e}")))?,
            None => StreamLog::new(),
        };
        Ok(log.streams_hash())
    }

    /// Persist a session, applying message retention.
    ///
    /// Saves whose content digest matches the last persisted one are
    /// suppressed (the dedup cache is LRU over session ids).
    pub fn save_session(&self, mut session: Session) -> Result<(), CoreError> {
        session.messages = filter_messages_for_storage(&session.messages);
        let key = session.id.as_str().to_string();

        let digest = session_digest(&session)?;
        {
            let mut cache = self.save_dedup.lock().expect("dedup lock poisoned");
            if cache.get(&key) == Some(&digest) {
                return Ok(());
            }
        }

        session.vclock.increment(self.ctx.replica_id);
        let value = serde_json::to_value(&session)
            .map_err(|e| CoreError::validation(format!("unserializable session: {e}")))?;
        self.store.put(StoreName::ChatSessions, &key, value)?;
        self.save_dedup
            .lock()
            .expect("dedup lock poisoned")
            .insert(key, digest);
        Ok(())
    }

    pub fn load_session(&self, id: &SessionId) -> Result<Option<Session>, CoreError> {
        match self.store.get(StoreName::ChatSessions, id.as_str())? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| CoreError::validation(format!("malformed session: {e}"))),
            None => Ok(None),
        }
    }

    /// Delete sessions idle past the expiry window.
    pub fn sweep_expired_sessions(&self) -> Result<usize, CoreError> {
        let now = self.ctx.time.now_ms();
        let expired: Vec<String> = self
            .store
            .get_all(StoreName::ChatSessions, None)?
            .into_iter()
            .filter(|(_, value)| {
                serde_json::from_value::<Session>(value.clone())
                    .map(|s| s.is_expired(now))
                    .unwrap_or(false)
            })
            .map(|(key, _)| key)
            .collect();
        let removed = expired.len();
        if removed > 0 {
            self.store.transaction(crate::store::TxnMode::ReadWrite, |txn| {
                for key in &expired {
                    txn.delete(StoreName::ChatSessions, key)?;
                }
                Ok(())
            })?;
        }
        Ok(removed)
    }

    /// Store an embedding batch atomically (dimension-validated).
    pub fn save_embeddings(&self, records: Vec<EmbeddingRecord>) -> Result<(), CoreError> {
        self.store.transaction(crate::store::TxnMode::ReadWrite, |txn| {
            for record in &records {
                let value = serde_json::to_value(record)
                    .map_err(|e| CoreError::validation(format!("unserializable embedding: {e}")))?;
                txn.put(StoreName::Embeddings, &record.id, value)?;
            }
            Ok(())
        })
    }

    /// Cosine search over stored embeddings.
    ///
    /// Orchestration of the two layers: the store supplies validated
    /// records, infrastructure packs the shared block, the pool executes.
    pub fn semantic_search(
        &self,
        query: Vec<f32>,
        threshold: f32,
        limit: usize,
    ) -> Result<Vec<SearchHit>, CoreError> {
        let records: Vec<EmbeddingRecord> = self
            .store
            .get_all(StoreName::Embeddings, None)?
            .into_iter()
            .filter_map(|(_, value)| serde_json::from_value(value).ok())
            .collect();
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let block = Arc::new(VectorBlock::from_records(&records)?);
        let entries = records
            .iter()
            .map(|r| EntryMeta {
                id: r.id.clone(),
                payload: r.payload.clone(),
            })
            .collect();

        let ticket = self.pool.submit_search(
            query,
            VectorSource::Shared { block, entries },
            threshold,
            limit,
        )?;
        match ticket.wait()? {
            WorkerResponse::Results { results, .. } => Ok(results),
            WorkerResponse::Error { message, .. } => Err(CoreError::new(
                crate::core::error::classify_message(&message),
                message,
            )),
            other => Err(CoreError::transient(format!(
                "unexpected worker response for request {}",
                other.id()
            ))),
        }
    }

    /// Run pattern detection over the stream log.
    pub fn detect_patterns(&self) -> Result<Vec<(String, Value)>, CoreError> {
        let log = match self.store.get(StoreName::Streams, STREAMS_KEY)? {
            Some(value) => serde_json::from_value::<StreamLog>(value)
                .map_err(|e| CoreError::validation(format!("malformed stream log: {e}")))?,
            None => StreamLog::new(),
        };
        self.pool.detect_patterns(log.streams)
    }

    /// Drop local events at or below `through`, announcing the checkpoint
    /// on the bus so replay cursors behind it reset.
    pub fn compact_events(&self, through: Seq0) {
        self.ctx
            .sink
            .compact_through(through, self.ctx.time.now_ms());
    }

    /// User-initiated full reset.
    pub fn reset_all(&self) -> Result<(), CoreError> {
        self.store.reset()
    }
}

/// Digest of the persistable session content (everything except the
/// vector clock, which changes on every save by construction).
fn session_digest(session: &Session) -> Result<[u8; 32], CoreError> {
    let bytes = serde_json::to_vec(&(
        &session.id,
        &session.title,
        session.created_at,
        session.updated_at,
        &session.messages,
        &session.metadata,
    ))
    .map_err(|e| CoreError::validation(format!("unserializable session: {e}")))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hasher.finalize().into())
}
