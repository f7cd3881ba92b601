use std::fmt::Debug;

use async_trait::async_trait;

use crate::backend::Backend;
use crate::config::ModelConfig;
use crate::constant::TokenId;
use crate::error::Result;
use crate::tree::{SessionId, TreeNode};

use super::batch_position::TokenBatch;
use super::frontier::Frontier;
use super::request::Prompt;

/// A micro-batch ready for the forward step, with the activation shape the
/// pipeline exchanges between stages.
#[derive(Debug, Clone)]
pub struct PreparedStep<M> {
    pub batch: M,
    pub shape: Vec<usize>,
}

/// What the model needs to continue from a set of tree nodes.
#[derive(Debug, Clone)]
pub struct Resumed<H> {
    /// One incremental token per row: the action that led to the node.
    pub tokens: TokenBatch,
    /// Length of the sequence ending at each node.
    pub context_lengths: Vec<usize>,
    /// Handles faulted in for nodes that had none, `None` where the node
    /// was already materialized.
    pub handles: Vec<Option<H>>,
}

/// # StrategyPort
///
/// The model-specific half of a search step.
///
/// The coordinator owns the search protocol: request fan-out, the decode
/// loop, frontier extraction and the tree. Everything that depends on the
/// model itself (tokenization, the sharded forward pass, and where KV-cache
/// state physically lives) is supplied through this trait.
///
/// Every rank of a model-parallel group holds its own strategy and the
/// coordinator calls the same methods, in the same order, on each of them.
///
/// ## Type Parameters
///
/// * `Logits` - Output of the terminal stage's forward step, shaped
///   `(batch, seq, vocab_shard)`
/// * `MicroBatch` - Whatever `prepare_batch_at_step` builds for `forward_step`
/// * `CacheHandle` - Opaque reference to one node's KV-cache state, stored in
///   the tree
#[async_trait]
pub trait StrategyPort: Send + Sync {
    type Logits: Backend;
    type MicroBatch: Send;
    type CacheHandle: Clone + PartialEq + Debug + Send + Sync;

    fn model_config(&self) -> &ModelConfig;

    /// The true vocabulary size. Logits past it are padding and never chosen.
    fn vocab_size(&self) -> usize {
        self.model_config().vocab_size
    }

    /// Tokenizes and pads a batch of prompts.
    ///
    /// # Parameters
    ///
    /// * `prompts` - One prompt per batch row
    /// * `min_len` - Lower bound on the padded width, `0` for none
    /// * `add_bos` - Whether to prepend the BOS token
    async fn tokenize_batch(&self, prompts: &[Prompt], min_len: usize, add_bos: bool) -> Result<TokenBatch>;

    /// Prepares per-session model state before a root pass.
    async fn init(&self, _tokens: &TokenBatch, _tokens_to_generate: usize, _sessions: &[SessionId]) -> Result<()> {
        Ok(())
    }

    /// Caps the decode loop's exclusive upper bound.
    fn clip_max_len(&self, candidate: usize) -> usize {
        candidate.min(self.model_config().max_sequence_length)
    }

    /// Builds the micro-batch for one decode iteration.
    ///
    /// # Parameters
    ///
    /// * `tokens` - The prompt window on a root pass, the incremental tokens
    ///   on a continuation
    /// * `batch_size` - Micro-batch size
    /// * `cursor` - Sequence position this iteration produces logits for
    /// * `is_root` - Whether this is a root pass
    /// * `sessions` - Session of each row
    /// * `step` - Iteration counter, starting at `0`
    async fn prepare_batch_at_step(
        &self,
        tokens: &TokenBatch,
        batch_size: usize,
        cursor: usize,
        is_root: bool,
        sessions: &[SessionId],
        step: usize,
    ) -> Result<PreparedStep<Self::MicroBatch>>;

    /// Runs this rank's stage of the model on a micro-batch.
    ///
    /// # Returns
    ///
    /// Logits of this rank's vocabulary shard on the terminal stage, `None`
    /// on every other stage.
    async fn forward_step(
        &self,
        batch: Self::MicroBatch,
        shape: Vec<usize>,
        sessions: &[SessionId],
        is_root: bool,
    ) -> Result<Option<Self::Logits>>;

    /// Records KV-cache state for a batch of new nodes.
    ///
    /// Called once for the roots (`parents` all `None`, `actions` all
    /// [`ROOT_ACTION`](crate::constant::ROOT_ACTION), `tokens` set), then once
    /// per top-k column for their children.
    ///
    /// # Returns
    ///
    /// The handle to store with each row's node. Children may return `None`
    /// and be materialized later by [`StrategyPort::resume`].
    async fn save_kv_cache(
        &self,
        sessions: &[SessionId],
        depths: &[usize],
        context_lengths: &[usize],
        parents: &[Option<TreeNode<Self::CacheHandle>>],
        actions: &[TokenId],
        tokens: Option<&TokenBatch>,
    ) -> Result<Vec<Option<Self::CacheHandle>>>;

    /// Recovers the incremental tokens and lengths needed to continue from
    /// `nodes`, faulting in cache state for nodes that lack it.
    async fn resume(
        &self,
        sessions: &[SessionId],
        nodes: &[TreeNode<Self::CacheHandle>],
    ) -> Result<Resumed<Self::CacheHandle>>;

    /// Last chance to rewrite the frontier before it is returned.
    async fn post_generation_process(&self, frontier: Frontier) -> Result<Frontier> {
        Ok(frontier)
    }
}
