//! Error types for the scheduler.

use std::time::Duration;

use thiserror::Error;

use crate::{ItemId, ItemState};

/// Errors that can occur in item store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Item not found.
    #[error("item not found: {0}")]
    NotFound(ItemId),

    /// An item with this id already exists.
    #[error("item already exists: {0}")]
    AlreadyExists(ItemId),

    /// The item changed since the caller read it.
    #[error("version conflict on {id}: expected {expected}, found {actual}")]
    VersionConflict {
        id: ItemId,
        expected: u64,
        actual: u64,
    },

    /// The mutation would move the item along an edge the lifecycle forbids.
    #[error("illegal transition on {id}: {from} -> {to}")]
    IllegalTransition {
        id: ItemId,
        from: ItemState,
        to: ItemState,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether this is a benign lost race rather than a real failure.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::VersionConflict { .. })
    }
}

/// Errors returned by a generation backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// Network or backend hiccup, worth retrying.
    #[error("transient backend error: {0}")]
    Transient(String),

    /// Invalid input (empty prompt, unsupported media). Never retried.
    #[error("permanent backend error: {0}")]
    Permanent(String),
}

/// Errors returned by a publisher.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    /// The platform asked us to slow down.
    #[error("rate limited{}", retry_hint(.retry_after))]
    RateLimited {
        /// Server-suggested delay before the next attempt.
        retry_after: Option<Duration>,
    },

    /// Network or platform hiccup, worth retrying.
    #[error("transient publish error: {0}")]
    Transient(String),

    /// The platform rejected the post. Never retried.
    #[error("permanent publish error: {0}")]
    Permanent(String),
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(delay) => format!(" (retry after {}ms)", delay.as_millis()),
        None => String::new(),
    }
}

/// Errors surfaced synchronously to callers of the orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Item not found.
    #[error("item not found: {0}")]
    NotFound(ItemId),

    /// The item already reached `Published` or `Failed`.
    #[error("item {id} is already terminal ({state})")]
    AlreadyTerminal { id: ItemId, state: ItemState },

    /// `retry_failed` was called on an item that has not failed.
    #[error("item {id} has not failed ({state})")]
    NotFailed { id: ItemId, state: ItemState },

    /// Text edits are only accepted while an item waits for its publish time.
    #[error("item {id} cannot be edited while {state}")]
    NotEditable { id: ItemId, state: ItemState },

    /// The intake request is malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Store error.
    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for OrchestratorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => OrchestratorError::NotFound(id),
            other => OrchestratorError::Store(other),
        }
    }
}
