//! The burn implementation for backend provision.
//! Burn tensors carry their rank as a const generic; logits are float
//! tensors, so the implementation covers `Tensor<B, D>` for every rank `D`.
use burn::prelude::{Backend as BurnBackend, Tensor};

use super::{Backend, HostTensor};
use crate::error::{Result, SearchError};

impl<B, const D: usize> Backend for Tensor<B, D>
where
    B: BurnBackend,
{
    fn shape(&self) -> Vec<usize> {
        self.dims().to_vec()
    }

    fn cat(tensors: &[Self], dim: usize) -> Result<Self> {
        if tensors.is_empty() {
            return Err(SearchError::Backend("cannot concatenate zero tensors".to_string()));
        }
        Ok(Tensor::cat(tensors.to_vec(), dim))
    }

    fn slice(&self, dim: usize, start: usize, len: usize) -> Result<Self> {
        let dims = self.dims();
        if dim >= D || start + len > dims[dim] {
            return Err(SearchError::Backend(format!(
                "slice {start}..{} out of bounds for dim {dim} of {dims:?}",
                start + len
            )));
        }
        Ok(self.clone().narrow(dim, start, len))
    }

    fn to_host(&self) -> Result<HostTensor> {
        let values = self
            .clone()
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| SearchError::Backend(format!("{e:?}")))?;
        HostTensor::new(self.dims().to_vec(), values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type Cpu = NdArray<f32>;

    #[test]
    fn test_slice_and_read_back() {
        let device = Default::default();
        let logits = Tensor::<Cpu, 3>::from_data(
            [[[0f32, 1., 2.], [3., 4., 5.]], [[6., 7., 8.], [9., 10., 11.]]],
            &device,
        );
        let last = Backend::slice(&logits, 1, 1, 1).unwrap();
        assert_eq!(Backend::shape(&last), vec![2, 1, 3]);
        assert_eq!(last.to_host().unwrap().data(), &[3., 4., 5., 9., 10., 11.]);
    }

    #[test]
    fn test_slice_out_of_bounds() {
        let device = Default::default();
        let logits = Tensor::<Cpu, 2>::from_data([[0f32, 1.], [2., 3.]], &device);
        assert!(Backend::slice(&logits, 1, 1, 2).is_err());
    }
}
