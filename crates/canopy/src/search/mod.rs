//! The search-step coordination engine.
//!
//! A [`SearchCoordinator`] on every rank turns a [`SearchRequest`] into a
//! batched decode pass through a [`StrategyPort`], extracts the top-k
//! [`Frontier`] and records the discovered nodes in its tree.

mod batch_position;
mod coordinator;
mod core_trait;
mod decode;
mod frontier;
mod request;
mod worker;

#[cfg(test)]
pub(crate) mod mock_strategy;

pub use batch_position::{BatchPosition, TokenBatch};
pub use coordinator::{CoordinatorState, SearchCoordinator, Served};
pub use core_trait::{PreparedStep, Resumed, StrategyPort};
pub use decode::BatchedDecodeLoop;
pub use frontier::Frontier;
pub use request::{Prompt, RequestKind, SearchRequest};
pub use worker::SearchWorker;
