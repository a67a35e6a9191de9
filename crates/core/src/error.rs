//! Error taxonomy shared by the cache crates.

use serde::{Deserialize, Serialize};

/// Failures reported by a [`crate::ChangeSource`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum SourceError {
    /// Network blip, rate limiting, server-side timeout. Retried with backoff.
    #[error("transient: {0}")]
    Transient(String),
    /// The stream cannot resume from the requested revision; a full relist is required.
    #[error("revision too old: {0}")]
    RevisionTooOld(String),
    /// Authorization or configuration failure. Never retried.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl SourceError {
    pub fn transient(msg: impl std::fmt::Display) -> Self { Self::Transient(msg.to_string()) }
    pub fn fatal(msg: impl std::fmt::Display) -> Self { Self::Fatal(msg.to_string()) }

    pub fn is_fatal(&self) -> bool { matches!(self, Self::Fatal(_)) }
    pub fn is_revision_too_old(&self) -> bool { matches!(self, Self::RevisionTooOld(_)) }
}

/// Errors surfaced by the store, queue, informer and registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum CacheError {
    #[error("source: {0}")]
    Source(#[from] SourceError),
    #[error("unknown index: {0}")]
    UnknownIndex(String),
    #[error("index already registered: {0}")]
    IndexExists(String),
    /// Secondary index and primary table disagree. Fatal to the owning informer.
    #[error("index drift: {0}")]
    IndexDrift(String),
    #[error("delta queue closed")]
    QueueClosed,
    #[error("informer already started: {0}")]
    AlreadyStarted(String),
    #[error("informer stopped: {0}")]
    Stopped(String),
    #[error("informer {0} started outside a tokio runtime")]
    NoRuntime(String),
    #[error("kind {0} already registered with a different payload type")]
    TypeMismatch(String),
}
