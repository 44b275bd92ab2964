//! Advisory locks with TTLs and a strict level hierarchy.
//!
//! Locks coordinate cooperative participants only; nothing is
//! kernel-enforced. Handles release on every exit path via `Drop`, TTLs
//! expire crashed holders, and acquiring a lower-level lock while holding
//! a higher-level one is rejected as a programmer error.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use thiserror::Error;

use crate::core::error::{CoreError, ErrorKind};
use crate::core::{ReplicaId, TimeSource};

/// Hierarchy levels, highest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockLevel {
    TopLevel = 2,
    Resource = 1,
    FineGrained = 0,
}

impl LockLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LockLevel::TopLevel => "top-level",
            LockLevel::Resource => "resource",
            LockLevel::FineGrained => "fine-grained",
        }
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("acquiring {requested} lock `{resource}` while holding a {held} lock inverts the hierarchy")]
    HierarchyViolation {
        resource: String,
        requested: &'static str,
        held: &'static str,
    },
    #[error("timed out acquiring lock `{resource}` after {timeout_ms}ms")]
    Timeout { resource: String, timeout_ms: u64 },
    #[error("lock state poisoned")]
    Poisoned,
}

impl From<LockError> for CoreError {
    fn from(err: LockError) -> Self {
        let kind = match &err {
            LockError::HierarchyViolation { .. } => ErrorKind::Validation,
            LockError::Timeout { .. } => ErrorKind::Cancelled,
            LockError::Poisoned => ErrorKind::ServerError,
        };
        CoreError::new(kind, err.to_string())
    }
}

#[derive(Clone, Debug)]
struct LockRecord {
    holder: ReplicaId,
    level: LockLevel,
    acquired_at_ms: u64,
    expires_at_ms: u64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AcquireOptions {
    pub ttl_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
}

struct LockState {
    records: HashMap<String, LockRecord>,
    /// Levels currently held per holder, for hierarchy checks.
    held_levels: HashMap<ReplicaId, Vec<LockLevel>>,
}

/// In-memory advisory lock table shared by every participant in the
/// process group.
pub struct LockManager {
    time: Arc<dyn TimeSource>,
    default_ttl_ms: u64,
    default_timeout_ms: u64,
    state: Mutex<LockState>,
    released: Condvar,
}

impl LockManager {
    pub fn new(time: Arc<dyn TimeSource>, default_ttl_ms: u64, default_timeout_ms: u64) -> Self {
        Self {
            time,
            default_ttl_ms,
            default_timeout_ms,
            state: Mutex::new(LockState {
                records: HashMap::new(),
                held_levels: HashMap::new(),
            }),
            released: Condvar::new(),
        }
    }

    /// Acquire a scoped lock. Blocks up to the timeout while a live,
    /// unexpired holder exists.
    pub fn acquire(
        self: &Arc<Self>,
        resource: &str,
        level: LockLevel,
        holder: ReplicaId,
        opts: AcquireOptions,
    ) -> Result<LockGuard, LockError> {
        let ttl_ms = opts.ttl_ms.unwrap_or(self.default_ttl_ms);
        let timeout_ms = opts.timeout_ms.unwrap_or(self.default_timeout_ms);
        let deadline = self.time.now_ms().saturating_add(timeout_ms);

        let mut state = self.state.lock().map_err(|_| LockError::Poisoned)?;
        loop {
            let now = self.time.now_ms();

            // Hierarchy check against everything this holder already has.
            if let Some(held) = state.held_levels.get(&holder) {
                if let Some(&highest) = held.iter().max() {
                    if level < highest {
                        return Err(LockError::HierarchyViolation {
                            resource: resource.to_string(),
                            requested: level.as_str(),
                            held: highest.as_str(),
                        });
                    }
                }
            }

            let available = match state.records.get(resource) {
                None => true,
                Some(record) => record.expires_at_ms <= now || record.holder == holder,
            };

            if available {
                state.records.insert(
                    resource.to_string(),
                    LockRecord {
                        holder,
                        level,
                        acquired_at_ms: now,
                        expires_at_ms: now.saturating_add(ttl_ms),
                    },
                );
                state.held_levels.entry(holder).or_default().push(level);
                return Ok(LockGuard {
                    manager: Arc::clone(self),
                    resource: resource.to_string(),
                    holder,
                    level,
                    released: false,
                });
            }

            if now >= deadline {
                return Err(LockError::Timeout {
                    resource: resource.to_string(),
                    timeout_ms,
                });
            }
            let (next, _) = self
                .released
                .wait_timeout(state, Duration::from_millis(10))
                .map_err(|_| LockError::Poisoned)?;
            state = next;
        }
    }

    pub fn holder_of(&self, resource: &str) -> Option<ReplicaId> {
        let state = self.state.lock().ok()?;
        let record = state.records.get(resource)?;
        if record.expires_at_ms <= self.time.now_ms() {
            None
        } else {
            Some(record.holder)
        }
    }

    pub fn acquired_at(&self, resource: &str) -> Option<u64> {
        let state = self.state.lock().ok()?;
        state.records.get(resource).map(|r| r.acquired_at_ms)
    }

    fn refresh(&self, resource: &str, holder: ReplicaId, ttl_ms: u64) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        let now = self.time.now_ms();
        match state.records.get_mut(resource) {
            Some(record) if record.holder == holder => {
                record.expires_at_ms = now.saturating_add(ttl_ms);
                true
            }
            _ => false,
        }
    }

    fn release(&self, resource: &str, holder: ReplicaId, level: LockLevel) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if state
            .records
            .get(resource)
            .is_some_and(|r| r.holder == holder)
        {
            state.records.remove(resource);
        }
        if let Some(held) = state.held_levels.get_mut(&holder) {
            if let Some(pos) = held.iter().position(|&l| l == level) {
                held.remove(pos);
            }
            if held.is_empty() {
                state.held_levels.remove(&holder);
            }
        }
        self.released.notify_all();
    }
}

/// Scoped lock handle; guaranteed release on all exit paths.
pub struct LockGuard {
    manager: Arc<LockManager>,
    resource: String,
    holder: ReplicaId,
    level: LockLevel,
    released: bool,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("resource", &self.resource)
            .field("holder", &self.holder)
            .field("level", &self.level)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl LockGuard {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Renew the TTL; heartbeats call this.
    pub fn refresh(&self, ttl_ms: u64) -> bool {
        self.manager.refresh(&self.resource, self.holder, ttl_ms)
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.manager
                .release(&self.resource, self.holder, self.level);
            self.released = true;
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}
