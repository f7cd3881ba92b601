use std::fmt::Debug;

use crate::error::Result;

use super::HostTensor;

/// The backend trait that must be fulfilled by any tensor type a model returns logits in
pub trait Backend: Debug + Clone + Send + Sync + 'static {
    /// Return the shape of this tensor
    fn shape(&self) -> Vec<usize>;

    /// Concatenate several tensors to each other along dimension `dim`, in the order supplied
    fn cat(tensors: &[Self], dim: usize) -> Result<Self>;

    /// Slice a given `dim` from `start` to `start + len`
    fn slice(&self, dim: usize, start: usize, len: usize) -> Result<Self>;

    /// Copy the tensor to host memory as `f32`, preserving its shape
    fn to_host(&self) -> Result<HostTensor>;
}
