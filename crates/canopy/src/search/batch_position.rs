use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::constant::TokenId;
use crate::error::{Result, SearchError};
use crate::tree::{SessionId, TreeNode};

/// A padded batch of token rows and the true length of each row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBatch {
    tokens: Vec<Vec<TokenId>>,
    lengths: Vec<usize>,
}

impl TokenBatch {
    /// # Errors
    ///
    /// [`SearchError::MalformedRequest`] when the row and length counts
    /// differ, rows have different widths, or a length exceeds its row.
    pub fn new(tokens: Vec<Vec<TokenId>>, lengths: Vec<usize>) -> Result<Self> {
        if tokens.len() != lengths.len() {
            return Err(SearchError::MalformedRequest(format!(
                "{} token rows but {} lengths",
                tokens.len(),
                lengths.len()
            )));
        }
        let width = tokens.first().map_or(0, Vec::len);
        if tokens.iter().any(|row| row.len() != width) {
            return Err(SearchError::MalformedRequest("token rows are not padded to one width".to_string()));
        }
        if lengths.iter().any(|&length| length > width) {
            return Err(SearchError::MalformedRequest(format!(
                "a row length exceeds the padded width {width}"
            )));
        }
        Ok(Self { tokens, lengths })
    }

    /// Pads every sequence to the longest one.
    ///
    /// Sequences longer than `max_len` are cut to `max_len` tokens first, with
    /// a warning.
    ///
    /// # Parameters
    ///
    /// * `sequences` - Unpadded token sequences
    /// * `pad_id` - Token appended to shorter rows
    /// * `max_len` - Longest row kept
    pub fn pad(sequences: Vec<Vec<TokenId>>, pad_id: TokenId, max_len: usize) -> Self {
        let sequences: Vec<Vec<TokenId>> = sequences
            .into_iter()
            .map(|mut sequence| {
                if sequence.len() > max_len {
                    warn!(length = sequence.len(), max_len, "max sequence length exceeded, truncating");
                    sequence.truncate(max_len);
                }
                sequence
            })
            .collect();
        let width = sequences.iter().map(Vec::len).max().unwrap_or(0);
        let lengths = sequences.iter().map(Vec::len).collect();
        let tokens = sequences
            .into_iter()
            .map(|mut sequence| {
                sequence.resize(width, pad_id);
                sequence
            })
            .collect();
        Self { tokens, lengths }
    }

    pub fn tokens(&self) -> &[Vec<TokenId>] {
        &self.tokens
    }

    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    pub fn batch_size(&self) -> usize {
        self.tokens.len()
    }

    pub fn width(&self) -> usize {
        self.tokens.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// The given rows, in the given order, keeping the padded width.
    pub fn select(&self, rows: &[usize]) -> Result<TokenBatch> {
        let mut tokens = Vec::with_capacity(rows.len());
        let mut lengths = Vec::with_capacity(rows.len());
        for &row in rows {
            let (Some(tokens_row), Some(length)) = (self.tokens.get(row), self.lengths.get(row)) else {
                return Err(SearchError::MalformedRequest(format!(
                    "row {row} is outside a batch of {}",
                    self.batch_size()
                )));
            };
            tokens.push(tokens_row.clone());
            lengths.push(*length);
        }
        Ok(Self { tokens, lengths })
    }
}

/// One row of a decode pass.
///
/// Built by the coordinator from a freshly tokenized prompt or from a
/// resumed tree node, and dropped once the frontier has been extracted.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchPosition<H> {
    pub token_context: Vec<TokenId>,
    pub context_length: usize,
    pub session: SessionId,
    pub depth: usize,
    /// The node being expanded; `None` while its root does not exist yet.
    pub parent: Option<TreeNode<H>>,
}

impl<H> BatchPosition<H> {
    /// Reassembles the token rows of a batch of positions.
    pub fn token_batch(positions: &[Self]) -> Result<TokenBatch> {
        TokenBatch::new(
            positions.iter().map(|position| position.token_context.clone()).collect(),
            positions.iter().map(|position| position.context_length.min(position.token_context.len())).collect(),
        )
    }

    pub fn sessions(positions: &[Self]) -> Vec<SessionId> {
        positions.iter().map(|position| position.session).collect()
    }

    pub fn context_lengths(positions: &[Self]) -> Vec<usize> {
        positions.iter().map(|position| position.context_length).collect()
    }
}
