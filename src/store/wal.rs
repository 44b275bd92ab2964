//! Write-ahead log: signed, hash-chained mutation records.
//!
//! Every mutation appends one WAL entry before the in-memory apply. Entries
//! are framed (magic + length + crc32c), chained by `prev_hash`, and signed
//! with the session signing key. Startup replays the uncheckpointed tail:
//! a torn trailing frame is discarded (the commit never completed); any
//! verification failure before that is corruption and halts replay.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use crc32c::crc32c;
use thiserror::Error;
use uuid::Uuid;

use crate::core::error::{CoreError, ErrorKind};
use crate::core::{StoreName, TxnId};
use crate::crypto::{KeyManager, SIGNATURE_LEN};

const FRAME_MAGIC: u32 = 0x4556_5731; // "EVW1"
const FRAME_HEADER_LEN: usize = 12;
const ENTRY_VERSION: u16 = 1;
pub const HASH_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum WalError {
    #[error("io error on {path:?}: {source}")]
    Io {
        path: Option<PathBuf>,
        #[source]
        source: std::io::Error,
    },
    #[error("frame magic mismatch (got {got:#x})")]
    FrameMagicMismatch { got: u32 },
    #[error("frame length invalid: {reason}")]
    FrameLengthInvalid { reason: String },
    #[error("frame crc mismatch (expected {expected:#x}, got {got:#x})")]
    FrameCrcMismatch { expected: u32, got: u32 },
    #[error("record too large ({got_bytes} bytes, max {max_bytes})")]
    RecordTooLarge { max_bytes: usize, got_bytes: usize },
    #[error("entry header invalid: {reason}")]
    EntryInvalid { reason: String },
    #[error("entry {seq} signature verification failed")]
    SignatureInvalid { seq: u64 },
    #[error("entry {seq} breaks the hash chain")]
    ChainBroken { seq: u64 },
    #[error("entry {seq} is out of sequence (expected {expected})")]
    OutOfSequence { seq: u64, expected: u64 },
}

impl From<WalError> for CoreError {
    fn from(err: WalError) -> Self {
        let kind = match &err {
            WalError::Io { .. } => ErrorKind::Transient,
            WalError::RecordTooLarge { .. } => ErrorKind::Validation,
            _ => ErrorKind::WalCorruption,
        };
        CoreError::new(kind, err.to_string())
    }
}

/// The mutation a WAL entry records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalOp {
    Put,
    Delete,
    Clear,
}

impl WalOp {
    fn to_byte(self) -> u8 {
        match self {
            WalOp::Put => 1,
            WalOp::Delete => 2,
            WalOp::Clear => 3,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, WalError> {
        match byte {
            1 => Ok(WalOp::Put),
            2 => Ok(WalOp::Delete),
            3 => Ok(WalOp::Clear),
            other => Err(WalError::EntryInvalid {
                reason: format!("unknown op byte {other}"),
            }),
        }
    }
}

fn store_to_byte(store: StoreName) -> u8 {
    StoreName::ALL
        .iter()
        .position(|s| *s == store)
        .expect("store present in ALL") as u8
}

fn store_from_byte(byte: u8) -> Result<StoreName, WalError> {
    StoreName::ALL
        .get(byte as usize)
        .copied()
        .ok_or_else(|| WalError::EntryInvalid {
            reason: format!("unknown store byte {byte}"),
        })
}

/// One signed, chained mutation record.
#[derive(Clone, Debug, PartialEq)]
pub struct WalEntry {
    pub seq: u64,
    pub txn_id: TxnId,
    pub ts_ms: u64,
    pub op: WalOp,
    pub store: StoreName,
    pub key: String,
    pub prev_hash: Option<[u8; HASH_LEN]>,
    /// Sealed value bytes for `Put`; empty otherwise.
    pub payload: Bytes,
    pub hash: [u8; HASH_LEN],
    pub signature: [u8; SIGNATURE_LEN],
}

impl WalEntry {
    /// Build, chain, and sign a new entry.
    pub fn build(
        seq: u64,
        txn_id: TxnId,
        ts_ms: u64,
        op: WalOp,
        store: StoreName,
        key: String,
        prev_hash: Option<[u8; HASH_LEN]>,
        payload: Bytes,
        keys: &KeyManager,
    ) -> Self {
        let hash = chain_hash(seq, txn_id, ts_ms, op, store, &key, prev_hash, &payload);
        let signature = keys.sign(&hash);
        Self {
            seq,
            txn_id,
            ts_ms,
            op,
            store,
            key,
            prev_hash,
            payload,
            hash,
            signature,
        }
    }

    /// Re-derive the chain hash and check signature + linkage.
    pub fn verify(
        &self,
        expected_prev: Option<[u8; HASH_LEN]>,
        keys: &KeyManager,
    ) -> Result<(), WalError> {
        if self.prev_hash != expected_prev {
            return Err(WalError::ChainBroken { seq: self.seq });
        }
        let hash = chain_hash(
            self.seq,
            self.txn_id,
            self.ts_ms,
            self.op,
            self.store,
            &self.key,
            self.prev_hash,
            &self.payload,
        );
        if hash != self.hash {
            return Err(WalError::ChainBroken { seq: self.seq });
        }
        keys.verify(&self.hash, &self.signature)
            .map_err(|_| WalError::SignatureInvalid { seq: self.seq })
    }

    fn encode_body(&self) -> Result<Vec<u8>, WalError> {
        let key_bytes = self.key.as_bytes();
        let key_len = u16::try_from(key_bytes.len()).map_err(|_| WalError::EntryInvalid {
            reason: "key too long".to_string(),
        })?;

        let mut buf = Vec::with_capacity(64 + key_bytes.len() + self.payload.len());
        buf.extend_from_slice(&ENTRY_VERSION.to_le_bytes());
        let flags: u16 = if self.prev_hash.is_some() { 1 } else { 0 };
        buf.extend_from_slice(&flags.to_le_bytes());
        buf.extend_from_slice(&self.seq.to_le_bytes());
        buf.extend_from_slice(&self.ts_ms.to_le_bytes());
        buf.extend_from_slice(self.txn_id.as_uuid().as_bytes());
        buf.push(self.op.to_byte());
        buf.push(store_to_byte(self.store));
        buf.extend_from_slice(&key_len.to_le_bytes());
        buf.extend_from_slice(key_bytes);
        if let Some(prev) = self.prev_hash {
            buf.extend_from_slice(&prev);
        }
        buf.extend_from_slice(&self.hash);
        buf.extend_from_slice(&self.signature);
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    fn decode_body(body: &[u8]) -> Result<Self, WalError> {
        let mut offset = 0usize;
        let version = read_u16(body, &mut offset)?;
        if version != ENTRY_VERSION {
            return Err(WalError::EntryInvalid {
                reason: format!("unsupported entry version {version}"),
            });
        }
        let flags = read_u16(body, &mut offset)?;
        if flags & !1 != 0 {
            return Err(WalError::EntryInvalid {
                reason: format!("unknown flag bits {flags:#x}"),
            });
        }
        let seq = read_u64(body, &mut offset)?;
        let ts_ms = read_u64(body, &mut offset)?;
        let txn_id = TxnId::new(Uuid::from_bytes(read_array::<16>(body, &mut offset)?));
        let op = WalOp::from_byte(read_u8(body, &mut offset)?)?;
        let store = store_from_byte(read_u8(body, &mut offset)?)?;
        let key_len = read_u16(body, &mut offset)? as usize;
        let key_bytes = take(body, &mut offset, key_len)?;
        let key = String::from_utf8(key_bytes.to_vec()).map_err(|_| WalError::EntryInvalid {
            reason: "key is not utf-8".to_string(),
        })?;
        let prev_hash = if flags & 1 != 0 {
            Some(read_array::<HASH_LEN>(body, &mut offset)?)
        } else {
            None
        };
        let hash = read_array::<HASH_LEN>(body, &mut offset)?;
        let signature = read_array::<SIGNATURE_LEN>(body, &mut offset)?;
        let payload = Bytes::copy_from_slice(&body[offset..]);

        Ok(Self {
            seq,
            txn_id,
            ts_ms,
            op,
            store,
            key,
            prev_hash,
            payload,
            hash,
            signature,
        })
    }
}

#[allow(clippy::too_many_arguments)]
fn chain_hash(
    seq: u64,
    txn_id: TxnId,
    ts_ms: u64,
    op: WalOp,
    store: StoreName,
    key: &str,
    prev_hash: Option<[u8; HASH_LEN]>,
    payload: &[u8],
) -> [u8; HASH_LEN] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(seq.to_le_bytes());
    hasher.update(ts_ms.to_le_bytes());
    hasher.update(txn_id.as_uuid().as_bytes());
    hasher.update([op.to_byte(), store_to_byte(store)]);
    hasher.update((key.len() as u64).to_le_bytes());
    hasher.update(key.as_bytes());
    match prev_hash {
        Some(prev) => {
            hasher.update([1u8]);
            hasher.update(prev);
        }
        None => hasher.update([0u8]),
    }
    hasher.update((payload.len() as u64).to_le_bytes());
    hasher.update(payload);
    hasher.finalize().into()
}

fn encode_frame(entry: &WalEntry, max_record_bytes: usize) -> Result<Vec<u8>, WalError> {
    let body = entry.encode_body()?;
    if body.len() > max_record_bytes {
        return Err(WalError::RecordTooLarge {
            max_bytes: max_record_bytes,
            got_bytes: body.len(),
        });
    }
    let length = u32::try_from(body.len()).map_err(|_| WalError::FrameLengthInvalid {
        reason: "frame length exceeds u32".to_string(),
    })?;
    let crc = crc32c(&body);

    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    buf.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(&crc.to_le_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

struct FrameReader<R> {
    reader: R,
    max_record_bytes: usize,
}

impl<R: Read> FrameReader<R> {
    fn new(reader: R, max_record_bytes: usize) -> Self {
        Self {
            reader,
            max_record_bytes,
        }
    }

    /// `Ok(None)` means clean EOF or a torn trailing frame.
    fn read_next(&mut self) -> Result<Option<WalEntry>, WalError> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        let mut read = 0usize;
        while read < header.len() {
            let n = self
                .reader
                .read(&mut header[read..])
                .map_err(|source| WalError::Io { path: None, source })?;
            if n == 0 {
                return Ok(None);
            }
            read += n;
        }

        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        if magic != FRAME_MAGIC {
            return Err(WalError::FrameMagicMismatch { got: magic });
        }
        let length = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if length == 0 {
            return Err(WalError::FrameLengthInvalid {
                reason: "frame length cannot be zero".to_string(),
            });
        }
        if length > self.max_record_bytes {
            return Err(WalError::RecordTooLarge {
                max_bytes: self.max_record_bytes,
                got_bytes: length,
            });
        }
        let expected_crc = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);

        let mut body = vec![0u8; length];
        let mut read_body = 0usize;
        while read_body < length {
            let n = self
                .reader
                .read(&mut body[read_body..])
                .map_err(|source| WalError::Io { path: None, source })?;
            if n == 0 {
                return Ok(None);
            }
            read_body += n;
        }

        let actual_crc = crc32c(&body);
        if actual_crc != expected_crc {
            return Err(WalError::FrameCrcMismatch {
                expected: expected_crc,
                got: actual_crc,
            });
        }
        WalEntry::decode_body(&body).map(Some)
    }
}

/// Append-side WAL handle for one store directory.
pub struct WalFile {
    path: PathBuf,
    file: File,
    bytes_written: u64,
}

impl WalFile {
    pub fn open(dir: &Path) -> Result<Self, WalError> {
        let path = dir.join("mutations.wal");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| WalError::Io {
                path: Some(path.clone()),
                source,
            })?;
        let bytes_written = file
            .metadata()
            .map_err(|source| WalError::Io {
                path: Some(path.clone()),
                source,
            })?
            .len();
        Ok(Self {
            path,
            file,
            bytes_written,
        })
    }

    /// Append a batch of entries with a single fsync.
    ///
    /// The commit point is the fsync: a crash before it leaves a torn tail
    /// that replay discards.
    pub fn append(&mut self, entries: &[WalEntry], max_record_bytes: usize) -> Result<(), WalError> {
        let mut buf = Vec::new();
        for entry in entries {
            buf.extend_from_slice(&encode_frame(entry, max_record_bytes)?);
        }
        self.file
            .write_all(&buf)
            .map_err(|source| WalError::Io {
                path: Some(self.path.clone()),
                source,
            })?;
        self.file.sync_all().map_err(|source| WalError::Io {
            path: Some(self.path.clone()),
            source,
        })?;
        self.bytes_written += buf.len() as u64;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Truncate after a successful checkpoint.
    pub fn truncate(&mut self) -> Result<(), WalError> {
        self.file
            .set_len(0)
            .map_err(|source| WalError::Io {
                path: Some(self.path.clone()),
                source,
            })?;
        self.file.sync_all().map_err(|source| WalError::Io {
            path: Some(self.path.clone()),
            source,
        })?;
        self.bytes_written = 0;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Outcome of replaying the WAL tail at startup.
pub struct ReplayedTail {
    pub entries: Vec<WalEntry>,
    pub head_hash: Option<[u8; HASH_LEN]>,
    pub next_seq: u64,
}

impl std::fmt::Debug for ReplayedTail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayedTail")
            .field("entries", &self.entries.len())
            .field("head_hash", &self.head_hash)
            .field("next_seq", &self.next_seq)
            .finish()
    }
}

/// Read and verify the uncheckpointed tail.
///
/// `base_seq`/`base_hash` come from the last checkpoint; the first tail
/// entry must continue that chain. Verification failure is fatal
/// (`WAL_CORRUPTION`); a torn final frame is silently discarded.
pub fn replay_tail(
    dir: &Path,
    base_seq: u64,
    base_hash: Option<[u8; HASH_LEN]>,
    keys: &KeyManager,
    max_record_bytes: usize,
) -> Result<ReplayedTail, WalError> {
    let path = dir.join("mutations.wal");
    let mut entries = Vec::new();
    let mut head_hash = base_hash;
    let mut next_seq = base_seq + 1;

    if !path.exists() {
        return Ok(ReplayedTail {
            entries,
            head_hash,
            next_seq,
        });
    }

    let file = File::open(&path).map_err(|source| WalError::Io {
        path: Some(path.clone()),
        source,
    })?;
    let mut reader = FrameReader::new(BufReader::new(file), max_record_bytes);

    while let Some(entry) = reader.read_next()? {
        if entry.seq != next_seq {
            return Err(WalError::OutOfSequence {
                seq: entry.seq,
                expected: next_seq,
            });
        }
        entry.verify(head_hash, keys)?;
        head_hash = Some(entry.hash);
        next_seq = entry.seq + 1;
        entries.push(entry);
    }

    Ok(ReplayedTail {
        entries,
        head_hash,
        next_seq,
    })
}

/// Remove any stale temp files left by interrupted checkpoint writes.
pub fn cleanup_stale(dir: &Path) {
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "tmp") {
                let _ = fs::remove_file(&path);
            }
        }
    }
}

fn read_u8(bytes: &[u8], offset: &mut usize) -> Result<u8, WalError> {
    Ok(take(bytes, offset, 1)?[0])
}

fn read_u16(bytes: &[u8], offset: &mut usize) -> Result<u16, WalError> {
    let slice = take(bytes, offset, 2)?;
    Ok(u16::from_le_bytes([slice[0], slice[1]]))
}

fn read_u64(bytes: &[u8], offset: &mut usize) -> Result<u64, WalError> {
    let slice = take(bytes, offset, 8)?;
    let mut out = [0u8; 8];
    out.copy_from_slice(slice);
    Ok(u64::from_le_bytes(out))
}

fn read_array<const N: usize>(bytes: &[u8], offset: &mut usize) -> Result<[u8; N], WalError> {
    let slice = take(bytes, offset, N)?;
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    Ok(out)
}

fn take<'a>(bytes: &'a [u8], offset: &mut usize, len: usize) -> Result<&'a [u8], WalError> {
    let end = offset
        .checked_add(len)
        .ok_or_else(|| WalError::EntryInvalid {
            reason: "entry length overflow".to_string(),
        })?;
    if end > bytes.len() {
        return Err(WalError::EntryInvalid {
            reason: "entry truncated".to_string(),
        });
    }
    let slice = &bytes[*offset..end];
    *offset = end;
    Ok(slice)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MAX: usize = 1024 * 1024;

    fn entry_chain(keys: &KeyManager, count: u64) -> Vec<WalEntry> {
        let mut prev = None;
        let mut out = Vec::new();
        for seq in 1..=count {
            let entry = WalEntry::build(
                seq,
                TxnId::new(Uuid::from_bytes([seq as u8; 16])),
                1_700_000_000_000 + seq,
                WalOp::Put,
                StoreName::Streams,
                "all".to_string(),
                prev,
                Bytes::from(vec![seq as u8; 16]),
                keys,
            );
            prev = Some(entry.hash);
            out.push(entry);
        }
        out
    }

    #[test]
    fn append_and_replay_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let keys = KeyManager::derive(b"root", b"salt", true).unwrap();
        let entries = entry_chain(&keys, 3);

        let mut wal = WalFile::open(tmp.path()).unwrap();
        wal.append(&entries, MAX).unwrap();

        let tail = replay_tail(tmp.path(), 0, None, &keys, MAX).unwrap();
        assert_eq!(tail.entries, entries);
        assert_eq!(tail.next_seq, 4);
        assert_eq!(tail.head_hash, Some(entries[2].hash));
    }

    #[test]
    fn torn_trailing_frame_is_discarded() {
        let tmp = TempDir::new().unwrap();
        let keys = KeyManager::derive(b"root", b"salt", true).unwrap();
        let entries = entry_chain(&keys, 2);

        let mut wal = WalFile::open(tmp.path()).unwrap();
        wal.append(&entries, MAX).unwrap();

        // Simulate a crash mid-append of a third entry.
        let third = entry_chain(&keys, 3).pop().unwrap();
        let frame = encode_frame(&third, MAX).unwrap();
        let mut file = OpenOptions::new()
            .append(true)
            .open(tmp.path().join("mutations.wal"))
            .unwrap();
        file.write_all(&frame[..frame.len() / 2]).unwrap();
        drop(file);

        let tail = replay_tail(tmp.path(), 0, None, &keys, MAX).unwrap();
        assert_eq!(tail.entries.len(), 2);
    }

    #[test]
    fn flipped_byte_is_corruption() {
        let tmp = TempDir::new().unwrap();
        let keys = KeyManager::derive(b"root", b"salt", true).unwrap();
        let entries = entry_chain(&keys, 2);

        let mut wal = WalFile::open(tmp.path()).unwrap();
        wal.append(&entries, MAX).unwrap();

        let path = tmp.path().join("mutations.wal");
        let mut bytes = fs::read(&path).unwrap();
        let mid = bytes.len() / 3;
        bytes[mid] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let err = replay_tail(tmp.path(), 0, None, &keys, MAX).unwrap_err();
        assert!(matches!(
            err,
            WalError::FrameCrcMismatch { .. }
                | WalError::FrameMagicMismatch { .. }
                | WalError::ChainBroken { .. }
        ));
    }

    #[test]
    fn wrong_signing_key_fails_verification() {
        let tmp = TempDir::new().unwrap();
        let keys = KeyManager::derive(b"root", b"salt", true).unwrap();
        let entries = entry_chain(&keys, 1);

        let mut wal = WalFile::open(tmp.path()).unwrap();
        wal.append(&entries, MAX).unwrap();

        let other = KeyManager::derive(b"other", b"salt", true).unwrap();
        let err = replay_tail(tmp.path(), 0, None, &other, MAX).unwrap_err();
        assert!(matches!(err, WalError::SignatureInvalid { seq: 1 }));
    }

    #[test]
    fn chain_break_detected() {
        let keys = KeyManager::derive(b"root", b"salt", true).unwrap();
        let entries = entry_chain(&keys, 2);
        // Entry 2 verified against the wrong predecessor.
        let err = entries[1].verify(None, &keys).unwrap_err();
        assert!(matches!(err, WalError::ChainBroken { seq: 2 }));
    }

    #[test]
    fn truncate_resets_for_next_checkpoint_epoch() {
        let tmp = TempDir::new().unwrap();
        let keys = KeyManager::derive(b"root", b"salt", true).unwrap();
        let entries = entry_chain(&keys, 2);

        let mut wal = WalFile::open(tmp.path()).unwrap();
        wal.append(&entries, MAX).unwrap();
        assert!(wal.bytes_written() > 0);

        wal.truncate().unwrap();
        assert_eq!(wal.bytes_written(), 0);

        // Chain resumes from the checkpointed head.
        let tail = replay_tail(tmp.path(), 2, Some(entries[1].hash), &keys, MAX).unwrap();
        assert!(tail.entries.is_empty());
        assert_eq!(tail.next_seq, 3);
    }
}
