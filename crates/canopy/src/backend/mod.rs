//! # Tensor Backend
//!
//! This module provides a unified interface over the tensor types a model may
//! hand back from its forward step, so the frontier extraction can read
//! logits in a backend-agnostic manner.
//!
//! ## Feature Flags
//!
//! The module uses feature flags to conditionally compile support for different backends:
//!
//! - `candle`: Enables support for the Candle tensor library
//! - `burn`: Enables support for the Burn tensor library
//!
//! Without either flag, [`HostTensor`] (a row-major `f32` buffer) is the only
//! implementation. It is also what every backend reads back into before the
//! vocabulary shards are exchanged between ranks.
//!
//! ## Usage
//!
//! A model collaborator picks a tensor type implementing [`Backend`] as its
//! `Logits` type and returns `[batch, seq, vocab_shard]` tensors from
//! `forward_step`. The engine only ever slices, concatenates and reads them
//! back to the host.

mod core_trait;
mod host;

#[cfg_attr(docsrs, doc(cfg(feature = "candle")))]
#[cfg(feature = "candle")]
/// Candle tensor backend implementation.
///
/// This module is only available when the `candle` feature flag is enabled.
/// It provides an implementation of the [`Backend`] trait for Candle's
/// `Tensor` type.
pub mod candle;

#[cfg_attr(docsrs, doc(cfg(feature = "burn")))]
#[cfg(feature = "burn")]
/// Burn tensor backend implementation.
///
/// This module is only available when the `burn` feature flag is enabled.
/// It provides an implementation of the [`Backend`] trait for Burn's float
/// tensors of any rank.
pub mod burn;


// Re-export the core traits for convenient imports
pub use core_trait::*;
pub use host::HostTensor;
