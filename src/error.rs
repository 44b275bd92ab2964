//! Crate-level convenience error.
//!
//! A thin wrapper over capability errors, not a god error: every variant
//! already carries its own classification, and `kind()` is the single
//! retry-decision surface.

use thiserror::Error;

use crate::coord::locks::LockError;
use crate::core::error::{CoreError, ErrorKind};
use crate::eventlog::{BusError, EventLogError};

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    EventLog(#[from] EventLogError),

    #[error(transparent)]
    Lock(#[from] LockError),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Core(e) => e.kind(),
            Error::Bus(_) | Error::EventLog(_) => ErrorKind::ServerError,
            Error::Lock(e) => match e {
                LockError::HierarchyViolation { .. } => ErrorKind::Validation,
                LockError::Timeout { .. } => ErrorKind::Cancelled,
                LockError::Poisoned => ErrorKind::ServerError,
            },
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}
