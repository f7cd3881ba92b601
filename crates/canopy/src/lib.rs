//! # Canopy
//!
//! Distributed, batched tree search over the outputs of an autoregressive
//! model sharded across tensor- and pipeline-parallel ranks.
//!
//! ## Overview
//!
//! Each call either starts new search trees from a batch of prompts or
//! expands existing nodes by an action. Canopy fans the request out to every
//! rank of the model-parallel group, drives the model through as many
//! incremental decode steps as the batch needs, extracts the top-k
//! action/probability frontier of every row, and records the discovered
//! nodes in a keyed tree store that every rank replicates identically.
//!
//! ## Architecture
//!
//! ### Assumptions
//! Regardless of backend used, canopy reserves three logits dimensions:
//!  - The `0th` dimension is the batch dimension
//!  - The `1st` dimension is the sequence dimension
//!  - The `2nd` dimension is the rank's vocabulary shard
//!
//! ### Lock-step ranks
//!
//! Every rank runs a [`search::SearchCoordinator`]. The driving rank accepts
//! requests, the others follow it, and all of them execute the same sequence
//! of collectives through a [`communication::Transport`]. There is no
//! timeout: a rank that never arrives stalls its group.
//!
//! ### Strategy port
//!
//! Tokenization, the sharded forward pass and KV-cache storage are model
//! specific and supplied through [`search::StrategyPort`].
//!
//! ## Features
//!
//! - **candle** - Enables candle backend
//! - **burn** - Enables burn backend
//!

mod tensor;

pub mod backend;
pub mod communication;
pub mod config;
pub mod error;
pub mod logging;
pub mod search;
pub mod tree;

/// Constants for client reference
pub use tensor::constant;

pub use error::{Result, SearchError};
