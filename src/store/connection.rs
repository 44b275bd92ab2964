//! Connection lifecycle: single-writer lock file and retry backoff.
//!
//! One replica owns the store directory at a time. The lock file carries
//! holder metadata with a heartbeat; a fresh heartbeat means the holder is
//! alive and the opener is blocked (never force-closed). A stale heartbeat
//! is a crashed holder and the lock is reclaimed.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::ReplicaId;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnLockMeta {
    pub replica_id: ReplicaId,
    pub pid: u32,
    pub started_at_ms: u64,
    pub last_heartbeat_ms: u64,
}

impl ConnLockMeta {
    fn new(replica_id: ReplicaId, now_ms: u64) -> Self {
        Self {
            replica_id,
            pid: std::process::id(),
            started_at_ms: now_ms,
            last_heartbeat_ms: now_ms,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnError {
    #[error("store locked by live peer at {path:?}")]
    Blocked {
        path: PathBuf,
        meta: Option<Box<ConnLockMeta>>,
    },
    #[error("lock metadata corrupted at {path:?}: {source}")]
    MetadataCorrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Held connection lock; released on drop.
#[derive(Debug)]
pub struct ConnLock {
    path: PathBuf,
    meta: ConnLockMeta,
    released: bool,
}

impl ConnLock {
    /// Try to take the lock once.
    ///
    /// A live peer (heartbeat within `stale_after_ms`) blocks the attempt;
    /// a stale lock is reclaimed.
    pub fn acquire(
        dir: &Path,
        replica_id: ReplicaId,
        now_ms: u64,
        stale_after_ms: u64,
    ) -> Result<Self, ConnError> {
        fs::create_dir_all(dir)?;
        let path = dir.join("store.lock");
        let meta = ConnLockMeta::new(replica_id, now_ms);

        loop {
            match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    write_meta(&mut file, &path, &meta)?;
                    return Ok(Self {
                        path,
                        meta,
                        released: false,
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    let holder = read_meta(&path).ok();
                    let stale = holder
                        .as_ref()
                        .map(|m| now_ms.saturating_sub(m.last_heartbeat_ms) > stale_after_ms)
                        // Unreadable metadata counts as stale.
                        .unwrap_or(true);
                    if stale {
                        tracing::warn!(?path, "reclaiming stale store lock");
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    return Err(ConnError::Blocked {
                        path,
                        meta: holder.map(Box::new),
                    });
                }
                Err(err) => return Err(ConnError::Io(err)),
            }
        }
    }

    pub fn meta(&self) -> &ConnLockMeta {
        &self.meta
    }

    /// Renew the heartbeat so peers keep seeing a live holder.
    pub fn heartbeat(&mut self, now_ms: u64) -> Result<(), ConnError> {
        self.meta.last_heartbeat_ms = now_ms;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        write_meta(&mut file, &self.path, &self.meta)
    }

    pub fn release(mut self) -> Result<(), ConnError> {
        if !self.released {
            fs::remove_file(&self.path)?;
            self.released = true;
        }
        Ok(())
    }
}

impl Drop for ConnLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = fs::remove_file(&self.path);
        }
    }
}

fn read_meta(path: &Path) -> Result<ConnLockMeta, ConnError> {
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|source| ConnError::MetadataCorrupt {
        path: path.to_path_buf(),
        source,
    })
}

fn write_meta(file: &mut fs::File, path: &Path, meta: &ConnLockMeta) -> Result<(), ConnError> {
    use std::io::Write;
    let bytes = serde_json::to_vec(meta).map_err(|source| ConnError::MetadataCorrupt {
        path: path.to_path_buf(),
        source,
    })?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    Ok(())
}

/// Exponential backoff for connection attempts: `base * 2^(attempt-1)`,
/// capped. `attempt` is 1-based.
pub fn connect_backoff_ms(attempt: u32, base_ms: u64, cap_ms: u64) -> u64 {
    let shift = attempt.saturating_sub(1).min(16);
    base_ms.saturating_mul(1u64 << shift).min(cap_ms)
}
