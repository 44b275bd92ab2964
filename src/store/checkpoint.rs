//! Checkpoint snapshots: sealed full-state files written atomically.
//!
//! A checkpoint captures the state plus the WAL chain position, written
//! via temp + fsync + rename. After a successful checkpoint the WAL is
//! truncated and replay resumes from the recorded head.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::core::error::{CoreError, ErrorKind};
use crate::crypto::{CryptoError, KeyManager};

use super::state::Snapshot;

const CHECKPOINT_VERSION: u32 = 1;
const CHECKPOINT_AAD: &[u8] = b"echovault/checkpoint/v1";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("io error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("checkpoint serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("checkpoint version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u32, got: u32 },
    #[error("checkpoint unreadable: {0}")]
    Crypto(#[from] CryptoError),
    #[error("checkpoint truncated ({got} bytes)")]
    Truncated { got: usize },
}

impl From<CheckpointError> for CoreError {
    fn from(err: CheckpointError) -> Self {
        let kind = match &err {
            CheckpointError::Io { .. } => ErrorKind::Transient,
            _ => ErrorKind::WalCorruption,
        };
        CoreError::new(kind, err.to_string())
    }
}

fn checkpoint_path(dir: &Path) -> PathBuf {
    dir.join("checkpoint.evc")
}

fn tmp_path(dir: &Path) -> PathBuf {
    dir.join("checkpoint.evc.tmp")
}

/// Write a snapshot atomically: serialize, seal, temp + fsync + rename.
pub fn write(dir: &Path, snapshot: &Snapshot, keys: &KeyManager) -> Result<(), CheckpointError> {
    let plaintext = serde_json::to_vec(snapshot)?;
    let sealed = keys.seal(&plaintext, CHECKPOINT_AAD)?;

    let tmp = tmp_path(dir);
    let path = checkpoint_path(dir);

    let mut file = File::create(&tmp).map_err(|source| CheckpointError::Io {
        path: tmp.clone(),
        source,
    })?;
    file.write_all(&CHECKPOINT_VERSION.to_le_bytes())
        .and_then(|_| file.write_all(&sealed))
        .and_then(|_| file.sync_all())
        .map_err(|source| CheckpointError::Io {
            path: tmp.clone(),
            source,
        })?;

    fs::rename(&tmp, &path).map_err(|source| CheckpointError::Io {
        path: path.clone(),
        source,
    })?;

    // fsync the directory so the rename is durable.
    if let Ok(dir_file) = File::open(dir) {
        let _ = dir_file.sync_all();
    }
    Ok(())
}

/// Read the latest snapshot, if one exists.
pub fn read(dir: &Path, keys: &KeyManager) -> Result<Option<Snapshot>, CheckpointError> {
    let path = checkpoint_path(dir);
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(&path).map_err(|source| CheckpointError::Io {
        path: path.clone(),
        source,
    })?;
    if bytes.len() < 4 {
        return Err(CheckpointError::Truncated { got: bytes.len() });
    }
    let version = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if version != CHECKPOINT_VERSION {
        return Err(CheckpointError::VersionMismatch {
            expected: CHECKPOINT_VERSION,
            got: version,
        });
    }
    let plaintext = keys.open(&bytes[4..], CHECKPOINT_AAD)?;
    let snapshot: Snapshot = serde_json::from_slice(&plaintext)?;
    Ok(Some(snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::state::StoreState;
    use tempfile::TempDir;

    fn snapshot() -> Snapshot {
        Snapshot {
            state: StoreState::new(),
            wal_seq: 7,
            wal_head: Some([3u8; 32]),
            written_at_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn write_read_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let keys = KeyManager::derive(b"root", b"salt", true).unwrap();

        write(tmp.path(), &snapshot(), &keys).unwrap();
        let loaded = read(tmp.path(), &keys).unwrap().unwrap();
        assert_eq!(loaded.wal_seq, 7);
        assert_eq!(loaded.wal_head, Some([3u8; 32]));
    }

    #[test]
    fn read_missing_returns_none() {
        let tmp = TempDir::new().unwrap();
        let keys = KeyManager::derive(b"root", b"salt", true).unwrap();
        assert!(read(tmp.path(), &keys).unwrap().is_none());
    }

    #[test]
    fn checkpoint_is_sealed_at_rest() {
        let tmp = TempDir::new().unwrap();
        let keys = KeyManager::derive(b"root", b"salt", true).unwrap();
        write(tmp.path(), &snapshot(), &keys).unwrap();

        let raw = fs::read(tmp.path().join("checkpoint.evc")).unwrap();
        let needle = b"wal_seq";
        assert!(!raw.windows(needle.len()).any(|w| w == needle));
    }

    #[test]
    fn wrong_key_is_corruption() {
        let tmp = TempDir::new().unwrap();
        let keys = KeyManager::derive(b"root", b"salt", true).unwrap();
        write(tmp.path(), &snapshot(), &keys).unwrap();

        let other = KeyManager::derive(b"other", b"salt", true).unwrap();
        assert!(read(tmp.path(), &other).is_err());
    }

    #[test]
    fn rewrite_replaces_previous_checkpoint() {
        let tmp = TempDir::new().unwrap();
        let keys = KeyManager::derive(b"root", b"salt", true).unwrap();
        write(tmp.path(), &snapshot(), &keys).unwrap();

        let mut second = snapshot();
        second.wal_seq = 9;
        write(tmp.path(), &second, &keys).unwrap();

        let loaded = read(tmp.path(), &keys).unwrap().unwrap();
        assert_eq!(loaded.wal_seq, 9);
    }
}
