use tracing::{debug, trace};

use crate::backend::HostTensor;
use crate::error::{Result, SearchError};
use crate::search::Frontier;
use crate::tensor::operations::{concat_vocab_shards, decode_shard, encode_shard};

use super::packet::{Envelope, StepOutcome};
use super::role::Roles;
use super::topology::{Group, Topology};
use super::transport::Transport;

const SHARD_READY: u8 = 0;
const SHARD_FAILED: u8 = 1;

/// The collectives one search step runs, bound to this rank's transport.
///
/// Every method is collective: each rank of the group named in its docs must
/// call it exactly once per step, in the same order as its peers.
pub struct RequestChannel<T> {
    transport: T,
    roles: Roles,
}

impl<T> RequestChannel<T>
where
    T: Transport,
{
    pub fn new(transport: T) -> Self {
        let roles = Roles::resolve(transport.topology());
        Self { transport, roles }
    }

    pub fn topology(&self) -> &Topology {
        self.transport.topology()
    }

    pub fn roles(&self) -> Roles {
        self.roles
    }

    /// Sends the driving rank's envelope to the whole model-parallel group.
    ///
    /// # Parameters
    ///
    /// * `envelope` - The request on the driving rank; ignored elsewhere
    ///
    /// # Returns
    ///
    /// The driving rank's envelope, on every rank.
    pub async fn scatter(&self, envelope: Option<&Envelope>) -> Result<Envelope> {
        let src = self.topology().driving_rank();
        let payload = if self.roles.drives() {
            let envelope = envelope.ok_or_else(|| {
                SearchError::Transport("the driving rank must supply the envelope to scatter".to_string())
            })?;
            Some(envelope.encode()?)
        } else {
            None
        };
        let bytes = self.transport.broadcast(Group::ModelParallel, src, payload).await?;
        let envelope = Envelope::decode(&bytes)?;
        trace!(rank = self.topology().rank(), bytes = bytes.len(), "scattered envelope");
        Ok(envelope)
    }

    /// Broadcasts the frontier from the terminal stage to the whole
    /// model-parallel group, so every rank can persist the same nodes.
    ///
    /// Every rank calls this once per step even when its own decoding
    /// failed, so the group stays balanced. The frontier source then
    /// broadcasts the failure instead of a frontier.
    ///
    /// # Parameters
    ///
    /// * `local` - This rank's decoding outcome; only the frontier source's
    ///   is sent
    ///
    /// # Errors
    ///
    /// [`SearchError::PeerFailed`] when the frontier source failed. A rank
    /// whose own decoding failed reports its own error to its caller.
    pub async fn gather_result(&self, local: std::result::Result<Option<&Frontier>, &SearchError>) -> Result<Frontier> {
        let topology = self.topology();
        let rank = topology.rank();
        let src = topology.frontier_source();
        let payload = if rank == src {
            let outcome = match local {
                Ok(Some(frontier)) => StepOutcome::Frontier(frontier.clone()),
                Ok(None) => StepOutcome::Failed {
                    rank,
                    reason: "the terminal stage has no frontier to broadcast".to_string(),
                },
                Err(e) => StepOutcome::Failed {
                    rank,
                    reason: e.to_string(),
                },
            };
            Some(outcome.encode()?)
        } else {
            None
        };
        let bytes = self.transport.broadcast(Group::ModelParallel, src, payload).await?;
        match StepOutcome::decode(&bytes)? {
            StepOutcome::Frontier(frontier) => {
                debug!(
                    rank,
                    src,
                    batch_size = frontier.batch_size(),
                    top_k = frontier.top_k(),
                    "received frontier"
                );
                Ok(frontier)
            }
            StepOutcome::Failed { rank, reason } => Err(SearchError::PeerFailed { rank, reason }),
        }
    }

    /// Reassembles full-vocabulary logits from the shards held by this
    /// rank's tensor-parallel group.
    ///
    /// A rank that failed to produce its shard still takes part, sending its
    /// failure in place of logits, and every member then fails alike.
    ///
    /// # Parameters
    ///
    /// * `shard` - This rank's `(batch, vocab_shard)` logits, or why it has none
    /// * `batch_size` - Rows in every shard
    ///
    /// # Returns
    ///
    /// `(batch, vocab)` logits with shards in tensor-parallel rank order.
    pub(crate) async fn gather_vocab(
        &self,
        shard: std::result::Result<&HostTensor, String>,
        batch_size: usize,
    ) -> Result<HostTensor> {
        let payload: Vec<u8> = match shard {
            Ok(shard) => [SHARD_READY].into_iter().chain(encode_shard(shard)).collect(),
            Err(reason) => [SHARD_FAILED].into_iter().chain(reason.into_bytes()).collect(),
        };
        let gathered = self.transport.all_gather(Group::TensorParallel, payload).await?;
        let members = self.topology().members(Group::TensorParallel);

        let mut shards = Vec::with_capacity(gathered.len());
        for (rank, bytes) in members.into_iter().zip(&gathered) {
            match bytes.split_first() {
                Some((&SHARD_READY, values)) => shards.push(decode_shard(values, batch_size)?),
                Some((_, reason)) => {
                    return Err(SearchError::PeerFailed {
                        rank,
                        reason: String::from_utf8_lossy(reason).into_owned(),
                    });
                }
                None => return Err(SearchError::Transport(format!("rank {rank} sent an empty shard"))),
            }
        }
        concat_vocab_shards(&shards)
    }
}
