use serde::{Deserialize, Serialize};

use crate::error::{Result, SearchError};

/// Named process groups a collective can run over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Group {
    /// Every rank jointly hosting the model replica.
    ModelParallel,
    /// The ranks sharing this rank's pipeline stage.
    TensorParallel,
}

/// Placement of one rank inside a single model-parallel replica.
///
/// Ranks are laid out stage-major: `rank = pp_rank * tp + tp_rank`, so the
/// tensor-parallel peers of a rank are contiguous and rank `0` sits in the
/// first pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    rank: usize,
    tensor_parallel_size: usize,
    pipeline_parallel_size: usize,
}

impl Topology {
    /// # Errors
    ///
    /// [`SearchError::ConfigPrecondition`] when either parallel size is zero
    /// or `rank` falls outside the replica.
    pub fn new(rank: usize, tensor_parallel_size: usize, pipeline_parallel_size: usize) -> Result<Self> {
        if tensor_parallel_size == 0 || pipeline_parallel_size == 0 {
            return Err(SearchError::ConfigPrecondition(format!(
                "parallel sizes must be at least 1, got tp={tensor_parallel_size} pp={pipeline_parallel_size}"
            )));
        }
        let world_size = tensor_parallel_size * pipeline_parallel_size;
        if rank >= world_size {
            return Err(SearchError::ConfigPrecondition(format!(
                "rank {rank} is outside a model-parallel group of {world_size}"
            )));
        }
        Ok(Self {
            rank,
            tensor_parallel_size,
            pipeline_parallel_size,
        })
    }

    /// A one-rank replica.
    pub fn single() -> Self {
        Self {
            rank: 0,
            tensor_parallel_size: 1,
            pipeline_parallel_size: 1,
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn tensor_parallel_size(&self) -> usize {
        self.tensor_parallel_size
    }

    pub fn pipeline_parallel_size(&self) -> usize {
        self.pipeline_parallel_size
    }

    pub fn world_size(&self) -> usize {
        self.tensor_parallel_size * self.pipeline_parallel_size
    }

    pub fn tp_rank(&self) -> usize {
        self.rank % self.tensor_parallel_size
    }

    pub fn pp_rank(&self) -> usize {
        self.rank / self.tensor_parallel_size
    }

    pub fn is_first_stage(&self) -> bool {
        self.pp_rank() == 0
    }

    pub fn is_last_stage(&self) -> bool {
        self.pp_rank() + 1 == self.pipeline_parallel_size
    }

    /// Global rank at a pipeline stage and tensor-parallel index.
    pub fn rank_of(&self, pp_rank: usize, tp_rank: usize) -> usize {
        pp_rank * self.tensor_parallel_size + tp_rank
    }

    /// The rank that receives requests from callers and scatters them.
    pub fn driving_rank(&self) -> usize {
        self.rank_of(0, 0)
    }

    /// The rank that broadcasts the finished frontier.
    pub fn frontier_source(&self) -> usize {
        self.rank_of(self.pipeline_parallel_size - 1, 0)
    }

    /// Global ranks of `group` as seen from this rank, ascending.
    pub fn members(&self, group: Group) -> Vec<usize> {
        match group {
            Group::ModelParallel => (0..self.world_size()).collect(),
            Group::TensorParallel => {
                let stage = self.pp_rank();
                (0..self.tensor_parallel_size)
                    .map(|tp_rank| self.rank_of(stage, tp_rank))
                    .collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_is_stage_major() {
        let topology = Topology::new(5, 2, 3).unwrap();
        assert_eq!(topology.world_size(), 6);
        assert_eq!(topology.tp_rank(), 1);
        assert_eq!(topology.pp_rank(), 2);
        assert!(topology.is_last_stage());
        assert!(!topology.is_first_stage());
        assert_eq!(topology.frontier_source(), 4);
        assert_eq!(topology.driving_rank(), 0);
    }

    #[test]
    fn test_members() {
        let topology = Topology::new(3, 2, 2).unwrap();
        assert_eq!(topology.members(Group::TensorParallel), vec![2, 3]);
        assert_eq!(topology.members(Group::ModelParallel), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_single_stage_is_first_and_last() {
        let topology = Topology::single();
        assert!(topology.is_first_stage());
        assert!(topology.is_last_stage());
        assert_eq!(topology.members(Group::TensorParallel), vec![0]);
    }

    #[test]
    fn test_rejects_bad_layout() {
        assert!(matches!(Topology::new(0, 0, 1), Err(SearchError::ConfigPrecondition(_))));
        assert!(matches!(Topology::new(4, 2, 2), Err(SearchError::ConfigPrecondition(_))));
    }
}
