//! Rank layout and the collectives that keep a model-parallel group in
//! lock-step.

mod channel;
mod local;
mod packet;
mod role;
mod topology;
mod transport;

pub use channel::RequestChannel;
pub use local::{LocalGroup, LocalTransport};
pub use packet::{Envelope, PacketRows, RequestPacket, StepOutcome};
pub use role::{Role, Roles};
pub use topology::{Group, Topology};
pub use transport::Transport;
