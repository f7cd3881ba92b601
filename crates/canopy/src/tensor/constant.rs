//! # Constants with reserved meanings in Canopy

/// Vocabulary id of a token.
pub type TokenId = i32;

/// In a logits tensor, the `0th` dimension is reserved for batching
pub const BATCH_DIM: usize = 0;

/// In a logits tensor, the `1st` dimension is reserved for sequence
pub const SEQ_DIM: usize = 1;

/// In a logits tensor, the `2nd` dimension holds this rank's vocabulary shard
pub const VOCAB_DIM: usize = 2;

/// Action recorded on the root node of every session
pub const ROOT_ACTION: TokenId = -1;
