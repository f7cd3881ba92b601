use serde::{Deserialize, Serialize};

use crate::constant::TokenId;
use crate::error::{Result, SearchError};

/// The top-k candidate actions of every row, with their probabilities.
///
/// Both tables are `[batch][top_k]`. Each policy row is a softmax over its
/// own `top_k` logits, so it sums to at most one and is non-increasing.
///
/// A row the decode loop never reached, because `clip_max_len` stopped it
/// first, stays all zero and is not [`Frontier::is_reached`]. Such rows
/// name no real actions and get no children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frontier {
    actions: Vec<Vec<TokenId>>,
    policy: Vec<Vec<f32>>,
    reached: Vec<bool>,
}

impl Frontier {
    /// An all-zero frontier of the given shape with no row reached yet.
    pub fn zeros(batch_size: usize, top_k: usize) -> Self {
        Self {
            actions: vec![vec![0; top_k]; batch_size],
            policy: vec![vec![0.0; top_k]; batch_size],
            reached: vec![false; batch_size],
        }
    }

    /// # Errors
    ///
    /// [`SearchError::MalformedRequest`] when the tables disagree in shape.
    pub fn new(actions: Vec<Vec<TokenId>>, policy: Vec<Vec<f32>>) -> Result<Self> {
        let same_shape = actions.len() == policy.len()
            && actions.iter().zip(&policy).all(|(a, p)| a.len() == p.len());
        let top_k = actions.first().map_or(0, Vec::len);
        if !same_shape || actions.iter().any(|row| row.len() != top_k) {
            return Err(SearchError::MalformedRequest(
                "frontier actions and policy must both be [batch][top_k]".to_string(),
            ));
        }
        let reached = vec![true; actions.len()];
        Ok(Self { actions, policy, reached })
    }

    pub(crate) fn set_row(&mut self, row: usize, actions: Vec<TokenId>, policy: Vec<f32>) {
        self.actions[row] = actions;
        self.policy[row] = policy;
        self.reached[row] = true;
    }

    pub fn is_reached(&self, row: usize) -> bool {
        self.reached.get(row).copied().unwrap_or(false)
    }

    pub fn unreached_rows(&self) -> usize {
        self.reached.iter().filter(|reached| !**reached).count()
    }

    pub fn batch_size(&self) -> usize {
        self.actions.len()
    }

    pub fn top_k(&self) -> usize {
        self.actions.first().map_or(0, Vec::len)
    }

    pub fn actions(&self) -> &[Vec<TokenId>] {
        &self.actions
    }

    pub fn policy(&self) -> &[Vec<f32>] {
        &self.policy
    }

    /// Column `j` of the action table: the `j`-th best action of every row.
    pub fn action_column(&self, column: usize) -> Vec<TokenId> {
        self.actions.iter().map(|row| row[column]).collect()
    }

    pub fn into_parts(self) -> (Vec<Vec<TokenId>>, Vec<Vec<f32>>) {
        (self.actions, self.policy)
    }
}
