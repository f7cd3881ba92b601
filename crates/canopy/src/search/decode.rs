use tracing::{debug, trace, warn};

use crate::backend::HostTensor;
use crate::communication::{RequestChannel, Transport};
use crate::config::BatchConfig;
use crate::error::{Result, SearchError};
use crate::tensor::operations::{last_position, mask_padded_vocab, select_top_k, softmax};
use crate::tree::SessionId;

use super::batch_position::TokenBatch;
use super::core_trait::StrategyPort;
use super::frontier::Frontier;

/// Drives the model over one batch until every row has produced its
/// frontier.
///
/// The loop starts at the shortest row's length and runs while the cursor is
/// below `clip_max_len(1 + longest)`. Each iteration runs one forward step;
/// on the terminal pipeline stage it then turns the last-position logits
/// into a top-k frontier for exactly the rows whose length equals the
/// cursor, so a short row is never overwritten by later iterations.
///
/// Once a step fails the rank stops calling the model but keeps joining the
/// per-iteration vocabulary gather, so its tensor-parallel peers never wait
/// on it. The failure is returned after the last iteration.
pub struct BatchedDecodeLoop<'a, S, T> {
    strategy: &'a S,
    channel: &'a RequestChannel<T>,
}

impl<'a, S, T> BatchedDecodeLoop<'a, S, T>
where
    S: StrategyPort,
    T: Transport,
{
    pub fn new(strategy: &'a S, channel: &'a RequestChannel<T>) -> Self {
        Self { strategy, channel }
    }

    /// Checks everything that must hold before any model work starts.
    ///
    /// # Errors
    ///
    /// * [`SearchError::ConfigPrecondition`] for a disallowed model setting
    /// * [`SearchError::InvalidTopK`] when `top_k` is zero or larger than the
    ///   true vocabulary
    pub fn check_preconditions(strategy: &S, top_k: usize) -> Result<()> {
        strategy.model_config().check_inference()?;
        let vocab_size = strategy.vocab_size();
        if top_k == 0 || top_k > vocab_size {
            return Err(SearchError::InvalidTopK { top_k, vocab_size });
        }
        Ok(())
    }

    /// Runs the loop.
    ///
    /// # Parameters
    ///
    /// * `tokens` - Token rows fed to `prepare_batch_at_step`
    /// * `context_lengths` - Length each row reaches once its frontier is due
    /// * `sessions` - Session of each row
    /// * `top_k` - Width of the frontier
    /// * `is_root` - Whether this is a root pass
    ///
    /// # Returns
    ///
    /// The frontier on ranks that compute it, `None` on every other rank.
    pub async fn run(
        &self,
        tokens: &TokenBatch,
        context_lengths: &[usize],
        sessions: &[SessionId],
        top_k: usize,
        is_root: bool,
    ) -> Result<Option<Frontier>> {
        Self::check_preconditions(self.strategy, top_k)?;
        let batch_size = context_lengths.len();
        if batch_size == 0 {
            return Err(SearchError::MalformedRequest("cannot decode an empty batch".to_string()));
        }
        if tokens.batch_size() != batch_size || sessions.len() != batch_size {
            return Err(SearchError::MalformedRequest(format!(
                "decode batch has {} token rows, {batch_size} lengths and {} sessions",
                tokens.batch_size(),
                sessions.len()
            )));
        }

        let batch_config = BatchConfig::for_batch(batch_size);
        let computes_frontier = self.channel.roles().computes_frontier();

        let mut cursor = context_lengths.iter().copied().min().unwrap_or(0);
        let longest = context_lengths.iter().copied().max().unwrap_or(0);
        let maxlen = self.strategy.clip_max_len(1 + longest);
        debug!(batch_size, cursor, maxlen, top_k, is_root, "starting decode loop");

        let mut frontier = Frontier::zeros(batch_size, top_k);
        let mut failure: Option<SearchError> = None;
        let mut step = 0;
        while cursor < maxlen {
            let shard = if failure.is_none() {
                let outcome = self
                    .forward(tokens, batch_config.micro_batch_size, cursor, is_root, sessions, step)
                    .await;
                outcome.unwrap_or_else(|e| {
                    failure = Some(e);
                    None
                })
            } else {
                None
            };

            if computes_frontier {
                let local = match (&failure, &shard) {
                    (None, Some(shard)) => Ok(shard),
                    (Some(e), _) => Err(e.to_string()),
                    (None, None) => Err("no logits shard".to_string()),
                };
                match self.channel.gather_vocab(local, batch_size).await {
                    Ok(full) if failure.is_none() => {
                        if let Err(e) = self.extract(&full, context_lengths, cursor, top_k, &mut frontier) {
                            failure = Some(e);
                        }
                        trace!(cursor, step, "extracted frontier rows");
                    }
                    Ok(_) => {}
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        failure.get_or_insert(e);
                    }
                }
            }

            cursor += 1;
            step += 1;
        }

        if let Some(e) = failure {
            warn!(error = %e, "decode loop failed");
            return Err(e);
        }
        if !computes_frontier {
            return Ok(None);
        }
        let skipped = frontier.unreached_rows();
        if skipped > 0 {
            warn!(skipped, maxlen, "rows never reached the cursor; they get no frontier");
        }
        Ok(Some(frontier))
    }

    // One forward step. Frontier ranks get their last-position logits shard.
    async fn forward(
        &self,
        tokens: &TokenBatch,
        micro_batch_size: usize,
        cursor: usize,
        is_root: bool,
        sessions: &[SessionId],
        step: usize,
    ) -> Result<Option<HostTensor>> {
        let prepared = self
            .strategy
            .prepare_batch_at_step(tokens, micro_batch_size, cursor, is_root, sessions, step)
            .await?;
        let logits = self
            .strategy
            .forward_step(prepared.batch, prepared.shape, sessions, is_root)
            .await?;
        if !self.channel.roles().computes_frontier() {
            return Ok(None);
        }
        let logits = logits
            .ok_or_else(|| SearchError::Strategy("terminal stage forward step returned no logits".to_string()))?;
        last_position(&logits).map(Some)
    }

    // Writes the frontier of every row whose length equals the cursor.
    fn extract(
        &self,
        full: &HostTensor,
        context_lengths: &[usize],
        cursor: usize,
        top_k: usize,
        frontier: &mut Frontier,
    ) -> Result<()> {
        let batch_size = context_lengths.len();
        let width = full.shape().get(1).copied().unwrap_or(0);
        if full.shape().first() != Some(&batch_size) || width < top_k {
            return Err(SearchError::Backend(format!(
                "gathered logits of shape {:?} cannot yield a {batch_size}x{top_k} frontier",
                full.shape()
            )));
        }

        let vocab_size = self.strategy.vocab_size();
        for (row, logits) in full.rows()?.into_iter().enumerate() {
            if context_lengths[row] != cursor {
                continue;
            }
            let mut logits = logits.to_vec();
            mask_padded_vocab(&mut logits, vocab_size);
            let (actions, selected) = select_top_k(&logits, top_k);
            frontier.set_row(row, actions, softmax(&selected));
        }
        Ok(())
    }
}
