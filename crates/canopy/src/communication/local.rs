use async_trait::async_trait;
use futures::future::try_join_all;
use tokio::sync::Mutex;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::trace;

use crate::error::{Result, SearchError};

use super::topology::{Group, Topology};
use super::transport::Transport;

/// An in-process model-parallel replica.
///
/// Every ordered pair of ranks shares one FIFO channel. Because all ranks run
/// the same sequence of collectives, per-pair FIFO order is enough to match
/// each receive with its send.
pub struct LocalGroup {
    transports: Vec<LocalTransport>,
}

impl LocalGroup {
    /// Wires up `tensor_parallel_size * pipeline_parallel_size` ranks.
    pub fn new(tensor_parallel_size: usize, pipeline_parallel_size: usize) -> Result<Self> {
        let world_size = Topology::new(0, tensor_parallel_size, pipeline_parallel_size)?.world_size();

        let mut outbound: Vec<Vec<Option<UnboundedSender<Vec<u8>>>>> =
            (0..world_size).map(|_| (0..world_size).map(|_| None).collect()).collect();
        let mut inbound: Vec<Vec<Option<Mutex<UnboundedReceiver<Vec<u8>>>>>> =
            (0..world_size).map(|_| (0..world_size).map(|_| None).collect()).collect();
        for from in 0..world_size {
            for to in (0..world_size).filter(|to| *to != from) {
                let (sender, receiver) = unbounded_channel();
                outbound[from][to] = Some(sender);
                inbound[to][from] = Some(Mutex::new(receiver));
            }
        }

        let transports = outbound
            .into_iter()
            .zip(inbound)
            .enumerate()
            .map(|(rank, (outbound, inbound))| {
                Ok(LocalTransport {
                    topology: Topology::new(rank, tensor_parallel_size, pipeline_parallel_size)?,
                    outbound,
                    inbound,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { transports })
    }

    pub fn world_size(&self) -> usize {
        self.transports.len()
    }

    /// Hands out one transport per rank, in rank order.
    pub fn into_transports(self) -> Vec<LocalTransport> {
        self.transports
    }
}

/// One rank's endpoint of a [`LocalGroup`].
pub struct LocalTransport {
    topology: Topology,
    outbound: Vec<Option<UnboundedSender<Vec<u8>>>>,
    inbound: Vec<Option<Mutex<UnboundedReceiver<Vec<u8>>>>>,
}

impl LocalTransport {
    fn send(&self, peer: usize, payload: Vec<u8>) -> Result<()> {
        let sender = self
            .outbound
            .get(peer)
            .and_then(Option::as_ref)
            .ok_or_else(|| SearchError::Transport(format!("rank {peer} is not a peer")))?;
        sender
            .send(payload)
            .map_err(|_| SearchError::Transport(format!("rank {peer} hung up")))
    }

    async fn recv(&self, peer: usize) -> Result<Vec<u8>> {
        let receiver = self
            .inbound
            .get(peer)
            .and_then(Option::as_ref)
            .ok_or_else(|| SearchError::Transport(format!("rank {peer} is not a peer")))?;
        receiver
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| SearchError::Transport(format!("rank {peer} hung up")))
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn topology(&self) -> &Topology {
        &self.topology
    }

    async fn broadcast(&self, group: Group, src: usize, payload: Option<Vec<u8>>) -> Result<Vec<u8>> {
        let members = self.topology.members(group);
        if !members.contains(&src) {
            return Err(SearchError::Transport(format!(
                "broadcast source {src} is not in {group:?} of rank {}",
                self.topology.rank()
            )));
        }
        let rank = self.topology.rank();
        trace!(rank, src, ?group, "broadcast");
        if rank != src {
            return self.recv(src).await;
        }

        let payload = payload
            .ok_or_else(|| SearchError::Transport("broadcast source has no payload".to_string()))?;
        for peer in members.into_iter().filter(|peer| *peer != rank) {
            self.send(peer, payload.clone())?;
        }
        Ok(payload)
    }

    async fn all_gather(&self, group: Group, payload: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        let members = self.topology.members(group);
        let rank = self.topology.rank();
        trace!(rank, ?group, bytes = payload.len(), "all_gather");
        for peer in members.iter().filter(|peer| **peer != rank) {
            self.send(*peer, payload.clone())?;
        }

        let own = &payload;
        try_join_all(members.into_iter().map(|member| async move {
            if member == rank {
                Ok(own.clone())
            } else {
                self.recv(member).await
            }
        }))
        .await
    }
}
