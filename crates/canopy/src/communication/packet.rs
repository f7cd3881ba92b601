use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::constant::TokenId;
use crate::error::Result;
use crate::search::{Frontier, TokenBatch};
use crate::tree::SessionId;

/// What the driving rank scatters to its peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Envelope {
    /// Run one search step.
    Search(RequestPacket),
    /// Stop serving; no more requests follow.
    Shutdown,
}

/// The rows of a request after the driving rank prepared them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PacketRows {
    /// Prompts already tokenized by the driving rank.
    Root { tokens: TokenBatch },
    /// `(depth, action)` of the node to expand in each session.
    Continuation { depths: Vec<usize>, actions: Vec<TokenId> },
}

/// A search request in the form every rank can execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPacket {
    pub rows: PacketRows,
    pub sessions: Vec<SessionId>,
    pub tokens_to_generate: usize,
    pub top_k: usize,
    pub end_strings: BTreeSet<String>,
}

impl RequestPacket {
    pub fn is_root(&self) -> bool {
        matches!(self.rows, PacketRows::Root { .. })
    }
}

/// What the frontier source broadcasts once decoding ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StepOutcome {
    Frontier(Frontier),
    /// The source, or a rank it heard from, could not produce the frontier.
    Failed { rank: usize, reason: String },
}

impl StepOutcome {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl Envelope {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
