//! Versioned schema migrations.
//!
//! Each migration is idempotent and applied against a cloned state; a
//! failure restores the pre-migration state and surfaces a fatal,
//! repairable error. Only the leader runs schema-changing migrations.

use thiserror::Error;

use crate::core::error::{CoreError, ErrorKind};
use crate::core::StoreName;

use super::state::StoreState;

pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub apply: fn(&mut StoreState) -> Result<(), String>,
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migration v{version} `{name}` failed: {reason}; schema left at v{left_at}")]
    Failed {
        version: u32,
        name: &'static str,
        reason: String,
        left_at: u32,
    },
    #[error("on-disk schema v{on_disk} is newer than supported v{supported}")]
    SchemaFromTheFuture { on_disk: u32, supported: u32 },
}

impl From<MigrationError> for CoreError {
    fn from(err: MigrationError) -> Self {
        // Partial migration halts writes; this is the repairable fatal path.
        CoreError::new(ErrorKind::Validation, err.to_string())
    }
}

/// All migrations, ascending. The registry is append-only.
pub fn registry() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            name: "create_base_stores",
            apply: |state| {
                for store in [StoreName::Streams, StoreName::ChatSessions, StoreName::Settings] {
                    state.ensure_store(store);
                }
                Ok(())
            },
        },
        Migration {
            version: 2,
            name: "create_retrieval_stores",
            apply: |state| {
                state.ensure_store(StoreName::Chunks);
                state.ensure_store(StoreName::Embeddings);
                Ok(())
            },
        },
        Migration {
            version: 3,
            name: "create_artifact_stores",
            apply: |state| {
                state.ensure_store(StoreName::Artifacts);
                state.ensure_store(StoreName::Personality);
                Ok(())
            },
        },
        Migration {
            version: 4,
            name: "create_bookkeeping_stores",
            apply: |state| {
                state.ensure_store(StoreName::Wal);
                state.ensure_store(StoreName::EventLog);
                Ok(())
            },
        },
        Migration {
            version: 5,
            name: "sessions_updated_at_index",
            apply: |state| {
                state.build_updated_at_index();
                Ok(())
            },
        },
        Migration {
            version: 6,
            name: "embedding_dimension_metadata",
            apply: |state| {
                state.backfill_dimension();
                Ok(())
            },
        },
        Migration {
            version: 7,
            name: "chunks_stream_id_index",
            apply: |state| {
                state.build_stream_id_index();
                Ok(())
            },
        },
    ]
}

pub fn latest_version() -> u32 {
    registry().last().map_or(0, |m| m.version)
}

/// Run every pending migration. On failure the state is rolled back to the
/// last fully-applied version and the error is fatal for writes.
pub fn run(state: &mut StoreState) -> Result<(), MigrationError> {
    let supported = latest_version();
    if state.schema_version > supported {
        return Err(MigrationError::SchemaFromTheFuture {
            on_disk: state.schema_version,
            supported,
        });
    }

    for migration in registry() {
        if migration.version <= state.schema_version {
            continue;
        }
        let rollback = state.clone();
        match (migration.apply)(state) {
            Ok(()) => {
                state.schema_version = migration.version;
                tracing::info!(
                    version = migration.version,
                    name = migration.name,
                    "migration applied"
                );
            }
            Err(reason) => {
                let left_at = rollback.schema_version;
                *state = rollback;
                return Err(MigrationError::Failed {
                    version: migration.version,
                    name: migration.name,
                    reason,
                    left_at,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_versions_are_strictly_ascending() {
        let versions: Vec<_> = registry().iter().map(|m| m.version).collect();
        let mut sorted = versions.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(versions, sorted);
    }

    #[test]
    fn run_from_scratch_reaches_latest() {
        let mut state = StoreState::new();
        run(&mut state).unwrap();
        assert_eq!(state.schema_version, latest_version());
        for store in StoreName::ALL {
            assert!(state.has_store(*store), "missing {store}");
        }
        assert!(state.indexes.stream_id.is_some());
        assert!(state.indexes.updated_at.is_some());
    }

    #[test]
    fn running_twice_is_idempotent() {
        let mut state = StoreState::new();
        run(&mut state).unwrap();
        let once = state.clone();
        run(&mut state).unwrap();
        assert_eq!(state, once);
    }

    #[test]
    fn run_from_partial_version_completes() {
        let mut state = StoreState::new();
        // Apply only the first three by hand.
        for migration in registry().into_iter().take(3) {
            (migration.apply)(&mut state).unwrap();
            state.schema_version = migration.version;
        }
        run(&mut state).unwrap();
        assert_eq!(state.schema_version, latest_version());
    }

    #[test]
    fn future_schema_is_rejected() {
        let mut state = StoreState::new();
        state.schema_version = latest_version() + 1;
        let err = run(&mut state).unwrap_err();
        assert!(matches!(err, MigrationError::SchemaFromTheFuture { .. }));
    }
}
