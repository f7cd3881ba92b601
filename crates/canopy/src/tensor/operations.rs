use std::cmp::Ordering;

use crate::backend::{Backend, HostTensor};
use crate::error::{Result, SearchError};

use super::constant::{BATCH_DIM, SEQ_DIM, TokenId, VOCAB_DIM};

const F32_BYTES: usize = size_of::<f32>();

/// Reads the logits of the last sequence position back to the host.
///
/// # Parameters
///
/// * `logits` - Tensor of shape `(batch, seq, vocab_shard)`
///
/// # Returns
///
/// A rank 2 host tensor of shape `(batch, vocab_shard)`.
pub(crate) fn last_position<B>(logits: &B) -> Result<HostTensor>
where
    B: Backend,
{
    let shape = logits.shape();
    if shape.len() != 3 {
        return Err(SearchError::Backend(format!(
            "logits must have shape (batch, seq, vocab), got {shape:?}"
        )));
    }
    let seq = shape[SEQ_DIM];
    if seq == 0 {
        return Err(SearchError::Backend("logits have an empty sequence dimension".to_string()));
    }
    let host = logits.slice(SEQ_DIM, seq - 1, 1)?.to_host()?;
    HostTensor::new(vec![shape[BATCH_DIM], shape[VOCAB_DIM]], host.into_data())
}

/// Serializes a vocabulary shard as little-endian `f32` values.
pub(crate) fn encode_shard(shard: &HostTensor) -> Vec<u8> {
    shard.data().iter().flat_map(|value| value.to_le_bytes()).collect()
}

/// Rebuilds a `(batch, width)` shard from [`encode_shard`] output.
pub(crate) fn decode_shard(bytes: &[u8], batch: usize) -> Result<HostTensor> {
    if bytes.len() % F32_BYTES != 0 {
        return Err(SearchError::Backend(format!(
            "shard payload of {} bytes is not a whole number of f32 values",
            bytes.len()
        )));
    }
    let values: Vec<f32> = bytes
        .chunks_exact(F32_BYTES)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    if batch == 0 {
        return HostTensor::new(vec![0, 0], values);
    }
    if values.len() % batch != 0 {
        return Err(SearchError::Backend(format!(
            "{} shard values cannot be split over {batch} rows",
            values.len()
        )));
    }
    let width = values.len() / batch;
    HostTensor::new(vec![batch, width], values)
}

/// Reassembles the full vocabulary from tensor-parallel shards.
///
/// Shards must be given in tensor-parallel rank order; each one holds the
/// contiguous vocabulary slice owned by that rank.
pub(crate) fn concat_vocab_shards(shards: &[HostTensor]) -> Result<HostTensor> {
    HostTensor::cat(shards, 1)
}

/// Pushes every logit at or beyond the true vocabulary size to `-inf`, so
/// padding slots get zero probability.
pub(crate) fn mask_padded_vocab(row: &mut [f32], vocab_size: usize) {
    for value in row.iter_mut().skip(vocab_size) {
        *value = f32::NEG_INFINITY;
    }
}

/// Selects the `k` largest logits of a row.
///
/// Ordering is by descending value with ties broken by ascending vocabulary
/// id, which is what a stable sort over the ids yields.
///
/// # Returns
///
/// `(ids, logits)` of the selected entries, best first.
pub(crate) fn select_top_k(row: &[f32], k: usize) -> (Vec<TokenId>, Vec<f32>) {
    let mut order: Vec<usize> = (0..row.len()).collect();
    order.sort_by(|&a, &b| descending(row[a], row[b]));
    order
        .into_iter()
        .take(k)
        .map(|id| (id as TokenId, row[id]))
        .unzip()
}

fn descending(a: f32, b: f32) -> Ordering {
    // NaN sorts last
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => b.partial_cmp(&a).unwrap_or(Ordering::Equal),
    }
}

/// Softmax over the given logits only.
///
/// A row of all `-inf` produces zeros rather than NaN.
pub(crate) fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return vec![0.0; logits.len()];
    }
    let exps: Vec<f32> = logits.iter().map(|value| (value - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|value| value / sum).collect()
}
