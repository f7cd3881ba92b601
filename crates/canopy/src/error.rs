//! # Search Errors
//!
//! Every failure the coordination engine can surface. Nothing in this crate
//! retries; each variant propagates to the caller of the coordinator.
//!
//! Transport desynchronisation (ranks issuing different collective sequences)
//! is deliberately absent: it is prevented by running identical control flow
//! on every rank, and when it does happen the group hangs rather than errors.

use thiserror::Error;

use crate::tree::NodeKey;

/// Errors raised while coordinating a tree-search step.
#[derive(Error, Debug)]
pub enum SearchError {
    /// The request is neither a well-formed root nor a well-formed continuation.
    ///
    /// Rejected on the driving rank before any collective call.
    #[error("malformed search request: {0}")]
    MalformedRequest(String),

    /// The model is configured in a way batched search cannot run with.
    #[error("configuration precondition failed: {0}")]
    ConfigPrecondition(String),

    /// `top_k` is zero or exceeds the true vocabulary size.
    #[error("top_k {top_k} is invalid for a vocabulary of {vocab_size} tokens")]
    InvalidTopK { top_k: usize, vocab_size: usize },

    /// A root already exists for the session with a different payload.
    #[error("root node already exists: {0}")]
    DuplicateNode(NodeKey),

    /// A node exists under the key with a different payload.
    #[error("conflicting registration for node {0}")]
    Conflict(NodeKey),

    /// No node is registered under the key.
    #[error("no node registered for {0}")]
    NotFound(NodeKey),

    /// A peer hung up or a collective was called incorrectly.
    #[error("transport error: {0}")]
    Transport(String),

    /// Another rank of the group failed the step it was running.
    ///
    /// Raised on every rank that did not fail itself, so the whole group
    /// leaves the step together.
    #[error("rank {rank} failed the search step: {reason}")]
    PeerFailed { rank: usize, reason: String },

    /// Packet encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A tensor backend operation failed.
    #[error("backend error: {0}")]
    Backend(String),

    /// The model-specific collaborator reported a failure.
    #[error("strategy error: {0}")]
    Strategy(String),

    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML deserialization error.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl SearchError {
    /// Whether the group can no longer run steps in lock-step after this
    /// error. Every other error is raised at a point every rank reaches.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SearchError::Transport(_) | SearchError::Codec(_))
    }
}

/// Result type alias for search operations.
pub type Result<T> = std::result::Result<T, SearchError>;

#[cfg(feature = "candle")]
impl From<candle_core::Error> for SearchError {
    fn from(e: candle_core::Error) -> Self {
        SearchError::Backend(e.to_string())
    }
}
