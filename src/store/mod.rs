//! Durable store: WAL-first transactions over in-memory object stores.
//!
//! Mutations stage inside a transaction, append signed WAL entries with a
//! single fsync, then apply to memory. Startup loads the latest checkpoint
//! and replays the verified WAL tail. Quota pressure degrades the store
//! through tiers before anything is lost.

pub mod checkpoint;
pub mod connection;
pub mod migrations;
pub mod quota;
pub mod state;
pub mod wal;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;

use crate::config::Limits;
use crate::core::error::{CoreError, ErrorKind};
use crate::core::{EventPayload, ReplicaId, StoreName, TimeSource, TxnId};
use crate::crypto::KeyManager;
use crate::eventlog::EventSink;

use connection::{connect_backoff_ms, ConnError, ConnLock};
use quota::{QuotaMonitor, WriteClass, RECOVERY_STORES};
use state::{IndexQuery, Snapshot, StoreState};
use wal::{ReplayedTail, WalEntry, WalFile, WalOp, HASH_LEN};

const WAL_PAYLOAD_AAD: &[u8] = b"echovault/wal/v1";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxnMode {
    ReadOnly,
    ReadWrite,
}

#[derive(Clone, Debug)]
struct StagedOp {
    op: WalOp,
    store: StoreName,
    key: String,
    value: Option<Value>,
}

/// Transaction handle. The body stages mutations; nothing is visible
/// outside until commit, and a body error discards everything.
pub struct Txn<'a> {
    state: &'a StoreState,
    mode: TxnMode,
    staged: Vec<StagedOp>,
}

impl Txn<'_> {
    pub fn get(&self, store: StoreName, key: &str) -> Option<Value> {
        // Staged ops overlay committed state, newest first.
        for staged in self.staged.iter().rev() {
            match staged.op {
                WalOp::Clear if staged.store == store => return None,
                WalOp::Put if staged.store == store && staged.key == key => {
                    return staged.value.clone();
                }
                WalOp::Delete if staged.store == store && staged.key == key => return None,
                _ => {}
            }
        }
        self.state.get(store, key).cloned()
    }

    pub fn count(&self, store: StoreName) -> usize {
        let mut keys: std::collections::BTreeSet<String> =
            self.state.keys(store).into_iter().collect();
        for staged in &self.staged {
            if staged.store != store {
                continue;
            }
            match staged.op {
                WalOp::Clear => keys.clear(),
                WalOp::Put => {
                    keys.insert(staged.key.clone());
                }
                WalOp::Delete => {
                    keys.remove(&staged.key);
                }
            }
        }
        keys.len()
    }

    pub fn put(&mut self, store: StoreName, key: &str, value: Value) -> Result<(), CoreError> {
        self.stage(WalOp::Put, store, key, Some(value))
    }

    pub fn delete(&mut self, store: StoreName, key: &str) -> Result<(), CoreError> {
        self.stage(WalOp::Delete, store, key, None)
    }

    pub fn clear(&mut self, store: StoreName) -> Result<(), CoreError> {
        self.stage(WalOp::Clear, store, "", None)
    }

    fn stage(
        &mut self,
        op: WalOp,
        store: StoreName,
        key: &str,
        value: Option<Value>,
    ) -> Result<(), CoreError> {
        if self.mode == TxnMode::ReadOnly {
            return Err(CoreError::validation(
                "mutation staged in a read-only transaction",
            ));
        }
        if store.is_internal() {
            return Err(CoreError::validation(format!(
                "store {store} is internal and takes no direct writes"
            )));
        }
        self.staged.push(StagedOp {
            op,
            store,
            key: key.to_string(),
            value,
        });
        Ok(())
    }
}

struct StoreInner {
    state: StoreState,
    wal: WalFile,
    next_seq: u64,
    head_hash: Option<[u8; HASH_LEN]>,
    last_checkpoint_ms: u64,
    lock: ConnLock,
}

/// The durable store for one replica.
pub struct DurableStore {
    dir: PathBuf,
    replica_id: ReplicaId,
    keys: Arc<KeyManager>,
    limits: Limits,
    sink: EventSink,
    time: Arc<dyn TimeSource>,
    quota: Arc<QuotaMonitor>,
    safe_mode: AtomicBool,
    inner: Mutex<StoreInner>,
}

impl std::fmt::Debug for DurableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableStore")
            .field("dir", &self.dir)
            .field("replica_id", &self.replica_id)
            .finish_non_exhaustive()
    }
}

impl DurableStore {
    /// Open with exponential-backoff retries while a live peer holds the
    /// store. Emits the connection lifecycle events along the way.
    #[allow(clippy::too_many_arguments)]
    pub fn open_with_retry(
        dir: &Path,
        replica_id: ReplicaId,
        keys: Arc<KeyManager>,
        limits: Limits,
        quota: Arc<QuotaMonitor>,
        sink: EventSink,
        time: Arc<dyn TimeSource>,
    ) -> Result<Self, CoreError> {
        let max_attempts = limits.connect_max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            let now = time.now_ms();
            match ConnLock::acquire(
                dir,
                replica_id,
                now,
                limits.stale_connection_threshold_ms,
            ) {
                Ok(lock) => {
                    return Self::open_locked(
                        dir, replica_id, keys, limits, quota, sink, time, lock,
                    );
                }
                Err(ConnError::Blocked { meta, .. }) => {
                    let holder = meta
                        .map(|m| format!("pid {}", m.pid))
                        .unwrap_or_else(|| "unknown holder".to_string());
                    last_error = format!("store locked by {holder}");
                    sink.emit(
                        EventPayload::ConnectionBlocked {
                            reason: "version_or_lock_held".to_string(),
                            message: format!(
                                "another replica holds the store ({holder}); close it to continue"
                            ),
                        },
                        now,
                    );
                }
                Err(err) => {
                    last_error = err.to_string();
                }
            }

            if attempt < max_attempts {
                let delay = connect_backoff_ms(
                    attempt,
                    limits.connect_backoff_base_ms,
                    limits.connect_backoff_cap_ms,
                );
                sink.emit(
                    EventPayload::ConnectionRetry {
                        attempt,
                        max_attempts,
                        next_retry_ms: delay,
                        error: last_error.clone(),
                    },
                    time.now_ms(),
                );
                std::thread::sleep(Duration::from_millis(delay));
            }
        }

        sink.emit(
            EventPayload::ConnectionFailed {
                error: last_error.clone(),
            },
            time.now_ms(),
        );
        Err(CoreError::new(
            ErrorKind::Transient,
            format!("store connection failed after {max_attempts} attempts: {last_error}"),
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn open_locked(
        dir: &Path,
        replica_id: ReplicaId,
        keys: Arc<KeyManager>,
        limits: Limits,
        quota: Arc<QuotaMonitor>,
        sink: EventSink,
        time: Arc<dyn TimeSource>,
        lock: ConnLock,
    ) -> Result<Self, CoreError> {
        wal::cleanup_stale(dir);

        let snapshot = checkpoint::read(dir, &keys).map_err(CoreError::from)?;
        let (mut state, base_seq, base_hash) = match snapshot {
            Some(snapshot) => (snapshot.state, snapshot.wal_seq, snapshot.wal_head),
            None => (StoreState::new(), 0, None),
        };

        // Replay the uncheckpointed tail. Verification failure is fatal.
        let ReplayedTail {
            entries,
            head_hash,
            next_seq,
        } = wal::replay_tail(dir, base_seq, base_hash, &keys, limits.max_wal_record_bytes)
            .map_err(CoreError::from)?;
        let replayed = entries.len();
        for entry in entries {
            let value = decode_wal_payload(&entry, &keys)?;
            state.apply(entry.op, entry.store, &entry.key, value);
        }
        if replayed > 0 {
            tracing::info!(replayed, "wal tail replayed");
        }

        let pre_migration_version = state.schema_version;
        migrations::run(&mut state).map_err(CoreError::from)?;
        let schema_changed = state.schema_version != pre_migration_version;
        let schema_version = state.schema_version;

        let wal_file = WalFile::open(dir).map_err(CoreError::from)?;
        let now = time.now_ms();

        let store = Self {
            dir: dir.to_path_buf(),
            replica_id,
            keys,
            limits,
            sink,
            time,
            quota,
            safe_mode: AtomicBool::new(false),
            inner: Mutex::new(StoreInner {
                state,
                wal: wal_file,
                next_seq,
                head_hash,
                last_checkpoint_ms: now,
                lock,
            }),
        };

        // Persist replay + migration results so the next open is clean.
        if replayed > 0 || schema_changed {
            store.checkpoint()?;
        }

        store.sink.emit(
            EventPayload::ConnectionEstablished { schema_version },
            store.time.now_ms(),
        );
        Ok(store)
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    pub fn schema_version(&self) -> Result<u32, CoreError> {
        Ok(self.lock_inner()?.state.schema_version)
    }

    pub fn in_safe_mode(&self) -> bool {
        self.safe_mode.load(Ordering::SeqCst)
    }

    pub fn quota(&self) -> &QuotaMonitor {
        &self.quota
    }

    // ---- reads ----------------------------------------------------------

    pub fn get(&self, store: StoreName, key: &str) -> Result<Option<Value>, CoreError> {
        Ok(self.lock_inner()?.state.get(store, key).cloned())
    }

    pub fn get_all(
        &self,
        store: StoreName,
        query: Option<IndexQuery>,
    ) -> Result<Vec<(String, Value)>, CoreError> {
        Ok(self.lock_inner()?.state.get_all(store, query))
    }

    pub fn count(&self, store: StoreName) -> Result<usize, CoreError> {
        Ok(self.lock_inner()?.state.count(store))
    }

    // ---- writes ---------------------------------------------------------

    pub fn put(&self, store: StoreName, key: &str, value: Value) -> Result<(), CoreError> {
        self.transaction(TxnMode::ReadWrite, |txn| txn.put(store, key, value))
    }

    pub fn delete(&self, store: StoreName, key: &str) -> Result<(), CoreError> {
        self.transaction(TxnMode::ReadWrite, |txn| txn.delete(store, key))
    }

    pub fn clear(&self, store: StoreName) -> Result<(), CoreError> {
        self.transaction(TxnMode::ReadWrite, |txn| txn.clear(store))
    }

    /// Read-modify-write inside a single transaction. The mutator must be
    /// deterministic: no I/O, no clocks.
    pub fn atomic_update<F>(&self, store: StoreName, key: &str, mutator: F) -> Result<(), CoreError>
    where
        F: FnOnce(Option<Value>) -> Result<Value, CoreError>,
    {
        self.transaction(TxnMode::ReadWrite, |txn| {
            let current = txn.get(store, key);
            let next = mutator(current)?;
            txn.put(store, key, next)
        })
    }

    /// Run a transaction. Commits entirely or rolls back entirely.
    pub fn transaction<T, F>(&self, mode: TxnMode, body: F) -> Result<T, CoreError>
    where
        F: FnOnce(&mut Txn<'_>) -> Result<T, CoreError>,
    {
        self.transaction_with(mode, false, body)
    }

    /// Transaction whose writes count as recovery operations: admitted
    /// while the store is read-only, limited to the recovery stores.
    pub fn recovery_transaction<T, F>(&self, body: F) -> Result<T, CoreError>
    where
        F: FnOnce(&mut Txn<'_>) -> Result<T, CoreError>,
    {
        self.transaction_with(TxnMode::ReadWrite, true, body)
    }

    fn transaction_with<T, F>(&self, mode: TxnMode, recovery: bool, body: F) -> Result<T, CoreError>
    where
        F: FnOnce(&mut Txn<'_>) -> Result<T, CoreError>,
    {
        if self.in_safe_mode() && mode == TxnMode::ReadWrite {
            return Err(CoreError::new(
                ErrorKind::WalCorruption,
                "store is in safe mode; export and reset to continue",
            ));
        }

        let mut inner = self.lock_inner()?;
        let (result, staged) = {
            let mut txn = Txn {
                state: &inner.state,
                mode,
                staged: Vec::new(),
            };
            let result = body(&mut txn)?;
            (result, txn.staged)
        };

        if staged.is_empty() {
            return Ok(result);
        }

        self.keys.ensure_secure_context().map_err(CoreError::from)?;
        self.quota.maybe_recompute(self.time.now_ms());
        self.admit_staged(&staged, recovery)?;
        self.validate_staged(&inner.state, &staged)?;

        // WAL-first: build, chain, sign, append with one fsync.
        let txn_id = TxnId::random();
        let now = self.time.now_ms();
        let mut entries = Vec::with_capacity(staged.len());
        let mut head = inner.head_hash;
        let mut seq = inner.next_seq;
        let mut wal_bytes = 0u64;
        for op in &staged {
            let payload = match &op.value {
                Some(value) => {
                    let plain = serde_json::to_vec(value)
                        .map_err(|e| CoreError::validation(format!("unserializable value: {e}")))?;
                    wal_bytes += plain.len() as u64;
                    Bytes::from(self.keys.seal(&plain, WAL_PAYLOAD_AAD).map_err(CoreError::from)?)
                }
                None => Bytes::new(),
            };
            let entry = WalEntry::build(
                seq,
                txn_id,
                now,
                op.op,
                op.store,
                op.key.clone(),
                head,
                payload,
                &self.keys,
            );
            head = Some(entry.hash);
            seq += 1;
            entries.push(entry);
        }

        if let Err(err) = inner
            .wal
            .append(&entries, self.limits.max_wal_record_bytes)
        {
            drop(inner);
            self.quota.on_write_failed(now);
            return Err(CoreError::new(
                ErrorKind::Transient,
                format!("TRANSACTION_ABORTED: wal append failed: {err}"),
            )
            .with_context("operation", "transaction"));
        }

        // Commit point passed: apply to memory and publish.
        inner.next_seq = seq;
        inner.head_hash = head;
        for op in &staged {
            inner.state.apply(op.op, op.store, &op.key, op.value.clone());
        }

        let mut touched: Vec<(StoreName, Option<String>, Option<u64>)> = Vec::new();
        for op in &staged {
            match op.op {
                WalOp::Clear => touched.push((op.store, None, Some(0))),
                _ => touched.push((op.store, Some(op.key.clone()), None)),
            }
        }
        drop(inner);

        for (store, key, count) in touched {
            self.sink
                .emit(EventPayload::StorageUpdated { store, key, count }, now);
        }

        self.quota.on_write_committed(wal_bytes, now);
        self.maybe_checkpoint(now)?;
        Ok(result)
    }

    // ---- checkpointing --------------------------------------------------

    /// Write a checkpoint now and truncate the WAL.
    pub fn checkpoint(&self) -> Result<(), CoreError> {
        let mut inner = self.lock_inner()?;
        let now = self.time.now_ms();
        let snapshot = Snapshot {
            state: inner.state.clone(),
            wal_seq: inner.next_seq - 1,
            wal_head: inner.head_hash,
            written_at_ms: now,
        };
        checkpoint::write(&self.dir, &snapshot, &self.keys).map_err(CoreError::from)?;
        inner.wal.truncate().map_err(CoreError::from)?;
        inner.last_checkpoint_ms = now;
        tracing::debug!(wal_seq = snapshot.wal_seq, "checkpoint written");
        Ok(())
    }

    fn maybe_checkpoint(&self, now: u64) -> Result<(), CoreError> {
        let due = {
            let inner = self.lock_inner()?;
            inner.wal.bytes_written() >= self.limits.wal_checkpoint_max_bytes
                || now.saturating_sub(inner.last_checkpoint_ms)
                    >= self.limits.wal_checkpoint_max_age_ms
        };
        if due {
            self.checkpoint()?;
        }
        Ok(())
    }

    // ---- maintenance ----------------------------------------------------

    /// Renew the connection-lock heartbeat.
    pub fn heartbeat(&self) -> Result<(), CoreError> {
        let now = self.time.now_ms();
        let mut inner = self.lock_inner()?;
        inner
            .lock
            .heartbeat(now)
            .map_err(|e| CoreError::transient(format!("lock heartbeat failed: {e}")))
    }

    /// Periodic quota re-estimation.
    pub fn quota_tick(&self) {
        self.quota.recompute(self.time.now_ms());
    }

    /// Enter safe mode: writes stop, export and reset remain.
    pub fn enter_safe_mode(&self) {
        if !self.safe_mode.swap(true, Ordering::SeqCst) {
            tracing::error!("store entered safe mode");
        }
    }

    /// Plaintext JSON export of the full state, for the safe-mode path.
    pub fn export_state(&self) -> Result<Vec<u8>, CoreError> {
        let inner = self.lock_inner()?;
        serde_json::to_vec_pretty(&inner.state)
            .map_err(|e| CoreError::validation(format!("export failed: {e}")))
    }

    /// Destroy all data and start from an empty schema. Leaves safe mode.
    pub fn reset(&self) -> Result<(), CoreError> {
        let mut inner = self.lock_inner()?;
        inner.state = StoreState::new();
        migrations::run(&mut inner.state).map_err(CoreError::from)?;
        inner.wal.truncate().map_err(CoreError::from)?;
        inner.next_seq = 1;
        inner.head_hash = None;
        let snapshot = Snapshot {
            state: inner.state.clone(),
            wal_seq: 0,
            wal_head: None,
            written_at_ms: self.time.now_ms(),
        };
        checkpoint::write(&self.dir, &snapshot, &self.keys).map_err(CoreError::from)?;
        drop(inner);
        self.safe_mode.store(false, Ordering::SeqCst);
        Ok(())
    }

    // ---- internals ------------------------------------------------------

    fn admit_staged(&self, staged: &[StagedOp], recovery: bool) -> Result<(), CoreError> {
        for op in staged {
            let class = match op.op {
                WalOp::Delete | WalOp::Clear => WriteClass::Reclaim,
                WalOp::Put => {
                    if recovery && RECOVERY_STORES.contains(&op.store) {
                        WriteClass::Recovery
                    } else {
                        WriteClass::Mutation { store: op.store }
                    }
                }
            };
            if let Err(snapshot) = self.quota.admit(class) {
                return Err(CoreError::new(
                    ErrorKind::QuotaExceeded,
                    format!(
                        "write to {} rejected at {:.0}% of quota",
                        op.store,
                        snapshot.percentage * 100.0
                    ),
                )
                .with_context("store", op.store.as_str())
                .with_context("tier", self.quota.tier().as_str()));
            }
        }
        Ok(())
    }

    fn validate_staged(&self, state: &StoreState, staged: &[StagedOp]) -> Result<(), CoreError> {
        let embedding_puts: Vec<&Value> = staged
            .iter()
            .filter(|op| op.store == StoreName::Embeddings && op.op == WalOp::Put)
            .filter_map(|op| op.value.as_ref())
            .collect();
        if !embedding_puts.is_empty() {
            state.validate_embedding_batch(&embedding_puts)?;
        }
        Ok(())
    }

    fn lock_inner(&self) -> Result<std::sync::MutexGuard<'_, StoreInner>, CoreError> {
        self.inner
            .lock()
            .map_err(|_| CoreError::new(ErrorKind::ServerError, "store lock poisoned"))
    }
}

fn decode_wal_payload(entry: &WalEntry, keys: &KeyManager) -> Result<Option<Value>, CoreError> {
    if entry.op != WalOp::Put {
        return Ok(None);
    }
    let plain = keys
        .open(&entry.payload, WAL_PAYLOAD_AAD)
        .map_err(CoreError::from)?;
    let value: Value = serde_json::from_slice(&plain).map_err(|e| {
        CoreError::new(
            ErrorKind::WalCorruption,
            format!("wal payload undecodable at seq {}: {e}", entry.seq),
        )
    })?;
    Ok(Some(value))
}
