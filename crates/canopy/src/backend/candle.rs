use candle_core::{DType, Tensor};

use super::{Backend, HostTensor};
use crate::error::Result;

impl Backend for Tensor {
    fn shape(&self) -> Vec<usize> {
        self.dims().to_vec()
    }

    fn cat(tensors: &[Self], dim: usize) -> Result<Self> {
        Ok(Tensor::cat(tensors, dim)?)
    }

    fn slice(&self, dim: usize, start: usize, len: usize) -> Result<Self> {
        Ok(self.narrow(dim, start, len)?)
    }

    fn to_host(&self) -> Result<HostTensor> {
        let values = self
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        HostTensor::new(self.dims().to_vec(), values)
    }
}
