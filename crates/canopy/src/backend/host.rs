use crate::error::{Result, SearchError};

use super::Backend;

/// A dense, row-major `f32` tensor living in host memory.
///
/// Every backend reads its logits back into a `HostTensor` before vocabulary
/// shards are exchanged between ranks, and models that compute on the CPU can
/// return it directly from their forward step.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl HostTensor {
    /// Creates a tensor from a shape and its row-major values.
    ///
    /// # Errors
    ///
    /// [`SearchError::Backend`] when `data` does not hold exactly
    /// `shape.iter().product()` values.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(SearchError::Backend(format!(
                "shape {shape:?} needs {expected} values, got {}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// Creates a rank-2 tensor from equally long rows.
    pub fn from_rows(rows: Vec<Vec<f32>>) -> Result<Self> {
        let width = rows.first().map(Vec::len).unwrap_or(0);
        if rows.iter().any(|row| row.len() != width) {
            return Err(SearchError::Backend("rows have different lengths".to_string()));
        }
        let height = rows.len();
        Self::new(vec![height, width], rows.into_iter().flatten().collect())
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// Views a rank-2 tensor as its rows.
    pub fn rows(&self) -> Result<Vec<&[f32]>> {
        match self.shape.as_slice() {
            [_, 0] => Ok(vec![&[][..]; self.shape[0]]),
            [_, width] => Ok(self.data.chunks(*width).collect()),
            other => Err(SearchError::Backend(format!("expected a rank 2 tensor, got shape {other:?}"))),
        }
    }

    // (outer, dim size, inner) extents around `dim`
    fn extents(&self, dim: usize) -> Result<(usize, usize, usize)> {
        if dim >= self.shape.len() {
            return Err(SearchError::Backend(format!(
                "dim {dim} out of range for shape {:?}",
                self.shape
            )));
        }
        let outer = self.shape[..dim].iter().product();
        let inner = self.shape[dim + 1..].iter().product();
        Ok((outer, self.shape[dim], inner))
    }
}

impl Backend for HostTensor {
    fn shape(&self) -> Vec<usize> {
        self.shape.clone()
    }

    fn cat(tensors: &[Self], dim: usize) -> Result<Self> {
        let first = tensors
            .first()
            .ok_or_else(|| SearchError::Backend("cannot concatenate zero tensors".to_string()))?;
        let (outer, _, inner) = first.extents(dim)?;
        for tensor in tensors {
            let compatible = tensor.shape.len() == first.shape.len()
                && tensor
                    .shape
                    .iter()
                    .zip(&first.shape)
                    .enumerate()
                    .all(|(i, (a, b))| i == dim || a == b);
            if !compatible {
                return Err(SearchError::Backend(format!(
                    "cannot concatenate shape {:?} onto {:?} along dim {dim}",
                    tensor.shape, first.shape
                )));
            }
        }

        let mut shape = first.shape.clone();
        shape[dim] = tensors.iter().map(|t| t.shape[dim]).sum();
        let mut data = Vec::with_capacity(shape.iter().product());
        for o in 0..outer {
            for tensor in tensors {
                let block = tensor.shape[dim] * inner;
                data.extend_from_slice(&tensor.data[o * block..(o + 1) * block]);
            }
        }
        Self::new(shape, data)
    }

    fn slice(&self, dim: usize, start: usize, len: usize) -> Result<Self> {
        let (outer, size, inner) = self.extents(dim)?;
        if start + len > size {
            return Err(SearchError::Backend(format!(
                "slice {start}..{} out of bounds for dim {dim} of {:?}",
                start + len,
                self.shape
            )));
        }
        let mut shape = self.shape.clone();
        shape[dim] = len;
        let mut data = Vec::with_capacity(outer * len * inner);
        for o in 0..outer {
            let begin = (o * size + start) * inner;
            data.extend_from_slice(&self.data[begin..begin + len * inner]);
        }
        Self::new(shape, data)
    }

    fn to_host(&self) -> Result<HostTensor> {
        Ok(self.clone())
    }
}
