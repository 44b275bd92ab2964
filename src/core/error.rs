//! Canonical error taxonomy shared by every subsystem.
//!
//! Errors carry a [`ErrorKind`] classification that drives retry decisions,
//! plus a sanitized message and an allowlisted context map. Raw library
//! errors never cross the crate boundary unscrubbed.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::sanitize;

/// Failure classification. Kinds, not types: each subsystem error maps onto
/// exactly one kind, and the kind alone decides retryability.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Network/IO flake; retry with backoff.
    Transient,
    /// Upstream throttling; retry with longer backoff.
    RateLimit,
    /// 5xx-equivalent; retry.
    ServerError,
    /// Credential/permission failure; never retry.
    Auth,
    /// Schema, dimension, or invariant violation; never retry.
    Validation,
    /// Explicit abort or timeout; never retry.
    Cancelled,
    /// Storage pressure; surface to user, attempt cleanup.
    QuotaExceeded,
    /// Fatal; enter safe mode.
    WalCorruption,
    /// Coordinator role changed mid-op; retry against the new leader.
    LeadershipLost,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Transient
                | ErrorKind::RateLimit
                | ErrorKind::ServerError
                | ErrorKind::LeadershipLost
        )
    }

    /// Fatal kinds stop writes and trigger safe mode.
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorKind::WalCorruption)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Transient => "TRANSIENT",
            ErrorKind::RateLimit => "RATE_LIMIT",
            ErrorKind::ServerError => "SERVER_ERROR",
            ErrorKind::Auth => "AUTH",
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::QuotaExceeded => "QUOTA_EXCEEDED",
            ErrorKind::WalCorruption => "WAL_CORRUPTION",
            ErrorKind::LeadershipLost => "LEADERSHIP_LOST",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a raw upstream message into a kind.
///
/// Used at seams where only a string survives (worker wire errors, provider
/// adapters). Unknown shapes default to `Transient` so a flake is retried
/// rather than surfaced.
pub fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_ascii_lowercase();
    if lower.contains("abort") || lower.contains("cancel") {
        return ErrorKind::Cancelled;
    }
    if lower.contains("429") || lower.contains("rate limit") || lower.contains("too many requests")
    {
        return ErrorKind::RateLimit;
    }
    if lower.contains("401")
        || lower.contains("403")
        || lower.contains("unauthorized")
        || lower.contains("forbidden")
        || lower.contains("invalid api key")
    {
        return ErrorKind::Auth;
    }
    if lower.contains("invalid")
        || lower.contains("validation")
        || lower.contains("dimension mismatch")
    {
        return ErrorKind::Validation;
    }
    if lower.contains("500")
        || lower.contains("502")
        || lower.contains("503")
        || lower.contains("server error")
        || lower.contains("internal error")
    {
        return ErrorKind::ServerError;
    }
    if lower.contains("quota") || lower.contains("storage full") {
        return ErrorKind::QuotaExceeded;
    }
    ErrorKind::Transient
}

/// A classified error with sanitized message and allowlisted context.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct CoreError {
    kind: ErrorKind,
    message: String,
    context: BTreeMap<String, String>,
}

impl CoreError {
    pub fn new(kind: ErrorKind, message: impl AsRef<str>) -> Self {
        Self {
            kind,
            message: sanitize::scrub_message(message.as_ref()),
            context: BTreeMap::new(),
        }
    }

    pub fn validation(message: impl AsRef<str>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn cancelled(message: impl AsRef<str>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn transient(message: impl AsRef<str>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    /// Attach a context field. Non-allowlisted keys are silently dropped.
    pub fn with_context(mut self, key: &str, value: impl AsRef<str>) -> Self {
        if sanitize::ALLOWED_CONTEXT_FIELDS.contains(&key) {
            self.context
                .insert(key.to_string(), sanitize::scrub_message(value.as_ref()));
        }
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &BTreeMap<String, String> {
        &self.context
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}
