//! A deterministic stand-in model for exercising the search protocol.
//!
//! Logits depend only on the token at a position and the position itself,
//! so expected frontiers can be recomputed from a node's last token and its
//! context length. Vocabulary ids at or beyond [`VOCAB_SIZE`] are padding and
//! score higher than any real token, which makes masking observable.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::backend::HostTensor;
use crate::communication::Topology;
use crate::config::ModelConfig;
use crate::constant::TokenId;
use crate::error::{Result, SearchError};
use crate::tree::{NodeKey, SessionId, TreeNode};

use super::batch_position::TokenBatch;
use super::core_trait::{PreparedStep, Resumed, StrategyPort};
use super::request::Prompt;

pub(crate) const VOCAB_SIZE: usize = 6;
pub(crate) const PADDED_VOCAB_SIZE: usize = 8;
const PAD_ID: TokenId = 0;
const PADDING_LOGIT: f32 = 100.0;

pub(crate) type MockHandle = NodeKey;

pub(crate) fn token_of(piece: &str) -> TokenId {
    match piece {
        "A" => 1,
        "B" => 2,
        "C" => 3,
        _ => PAD_ID,
    }
}

/// Logit of `vocab_id` after seeing `token` at `position`.
pub(crate) fn score(token: TokenId, position: usize, vocab_id: usize) -> f32 {
    if vocab_id >= VOCAB_SIZE {
        return PADDING_LOGIT;
    }
    ((token as usize * 7 + position * 3 + vocab_id * 5) % 11) as f32 + vocab_id as f32 / 100.0
}

/// The `k` best real vocabulary ids after `token` at `position`.
pub(crate) fn expected_top_k(token: TokenId, position: usize, k: usize) -> Vec<TokenId> {
    let mut ids: Vec<usize> = (0..VOCAB_SIZE).collect();
    ids.sort_by(|a, b| score(token, position, *b).total_cmp(&score(token, position, *a)));
    ids.into_iter().take(k).map(|id| id as TokenId).collect()
}

#[derive(Debug)]
pub(crate) struct MockBatch {
    windows: Vec<Vec<TokenId>>,
    offset: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SavedCall {
    pub depths: Vec<usize>,
    pub context_lengths: Vec<usize>,
    pub actions: Vec<TokenId>,
    pub with_parents: bool,
    pub with_tokens: bool,
}

pub(crate) struct MockStrategy {
    topology: Topology,
    config: ModelConfig,
    pub forward_calls: AtomicUsize,
    pub tokenize_calls: AtomicUsize,
    /// Terminal-stage forward steps left that yield no logits.
    pub drop_logits: AtomicUsize,
    pub prepared: Mutex<Vec<(usize, bool, usize)>>,
    pub saved: Mutex<Vec<SavedCall>>,
}

impl MockStrategy {
    pub fn new(topology: Topology) -> Self {
        Self::with_config(topology, ModelConfig::new(VOCAB_SIZE, 64))
    }

    pub fn with_config(topology: Topology, config: ModelConfig) -> Self {
        Self {
            topology,
            config,
            forward_calls: AtomicUsize::new(0),
            tokenize_calls: AtomicUsize::new(0),
            drop_logits: AtomicUsize::new(0),
            prepared: Mutex::new(Vec::new()),
            saved: Mutex::new(Vec::new()),
        }
    }

    pub fn forward_calls(&self) -> usize {
        self.forward_calls.load(Ordering::SeqCst)
    }

    pub fn saved_calls(&self) -> Vec<SavedCall> {
        self.saved.lock().unwrap().clone()
    }

    pub fn prepared_cursors(&self) -> Vec<usize> {
        self.prepared.lock().unwrap().iter().map(|(cursor, _, _)| *cursor).collect()
    }

    fn shard_range(&self) -> std::ops::Range<usize> {
        let width = PADDED_VOCAB_SIZE / self.topology.tensor_parallel_size();
        let start = self.topology.tp_rank() * width;
        start..start + width
    }
}

#[async_trait]
impl StrategyPort for MockStrategy {
    type Logits = HostTensor;
    type MicroBatch = MockBatch;
    type CacheHandle = MockHandle;

    fn model_config(&self) -> &ModelConfig {
        &self.config
    }

    async fn tokenize_batch(&self, prompts: &[Prompt], _min_len: usize, _add_bos: bool) -> Result<TokenBatch> {
        self.tokenize_calls.fetch_add(1, Ordering::SeqCst);
        let sequences = prompts
            .iter()
            .map(|prompt| prompt.iter().map(|piece| token_of(piece)).collect())
            .collect();
        Ok(TokenBatch::pad(sequences, PAD_ID, self.config.max_sequence_length))
    }

    async fn prepare_batch_at_step(
        &self,
        tokens: &TokenBatch,
        batch_size: usize,
        cursor: usize,
        is_root: bool,
        _sessions: &[SessionId],
        step: usize,
    ) -> Result<PreparedStep<MockBatch>> {
        if batch_size != tokens.batch_size() {
            return Err(SearchError::Strategy(format!(
                "micro batch of {batch_size} for {} rows",
                tokens.batch_size()
            )));
        }
        self.prepared.lock().unwrap().push((cursor, is_root, step));

        let (windows, offset): (Vec<Vec<TokenId>>, usize) = if is_root {
            let windows = tokens
                .tokens()
                .iter()
                .map(|row| row[..cursor.min(row.len())].to_vec())
                .collect();
            (windows, 0)
        } else {
            (tokens.tokens().to_vec(), cursor.saturating_sub(1))
        };
        let seq = windows.first().map_or(0, Vec::len);
        Ok(PreparedStep {
            batch: MockBatch { windows, offset },
            shape: vec![batch_size, seq],
        })
    }

    async fn forward_step(
        &self,
        batch: MockBatch,
        shape: Vec<usize>,
        _sessions: &[SessionId],
        _is_root: bool,
    ) -> Result<Option<HostTensor>> {
        self.forward_calls.fetch_add(1, Ordering::SeqCst);
        if !self.topology.is_last_stage() {
            return Ok(None);
        }
        let dropped = self
            .drop_logits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        if dropped.is_ok() {
            return Ok(None);
        }
        let range = self.shard_range();
        let mut data = Vec::new();
        for window in &batch.windows {
            for (i, token) in window.iter().enumerate() {
                data.extend(range.clone().map(|vocab_id| score(*token, batch.offset + i, vocab_id)));
            }
        }
        HostTensor::new(vec![shape[0], shape[1], range.len()], data).map(Some)
    }

    async fn save_kv_cache(
        &self,
        sessions: &[SessionId],
        depths: &[usize],
        context_lengths: &[usize],
        parents: &[Option<TreeNode<MockHandle>>],
        actions: &[TokenId],
        tokens: Option<&TokenBatch>,
    ) -> Result<Vec<Option<MockHandle>>> {
        self.saved.lock().unwrap().push(SavedCall {
            depths: depths.to_vec(),
            context_lengths: context_lengths.to_vec(),
            actions: actions.to_vec(),
            with_parents: parents.iter().all(Option::is_some),
            with_tokens: tokens.is_some(),
        });
        Ok(sessions
            .iter()
            .zip(depths)
            .zip(actions)
            .map(|((session, depth), action)| {
                tokens.map(|_| NodeKey::new(*session, *depth, *action))
            })
            .collect())
    }

    async fn resume(&self, _sessions: &[SessionId], nodes: &[TreeNode<MockHandle>]) -> Result<Resumed<MockHandle>> {
        Ok(Resumed {
            tokens: TokenBatch::new(nodes.iter().map(|node| vec![node.action()]).collect(), vec![1; nodes.len()])?,
            context_lengths: nodes.iter().map(TreeNode::context_length).collect(),
            handles: nodes
                .iter()
                .map(|node| (!node.is_materialized()).then(|| node.key()))
                .collect(),
        })
    }
}
