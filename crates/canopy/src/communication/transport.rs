use async_trait::async_trait;

use crate::error::Result;

use super::topology::{Group, Topology};

/// Blocking collectives over the named groups of one model-parallel replica.
///
/// Every member of a group must enter each collective exactly once and in
/// the same order as its peers. Implementations neither retry nor time out:
/// a rank that never arrives stalls the whole group.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Where this rank sits in the replica.
    fn topology(&self) -> &Topology;

    /// Broadcasts `payload` from global rank `src` to every member of `group`.
    ///
    /// # Parameters
    ///
    /// * `group` - The group to broadcast over
    /// * `src` - Global rank of the sender, which must be a member of `group`
    /// * `payload` - `Some` on the sender, ignored on receivers
    ///
    /// # Returns
    ///
    /// The sender's payload, on every member.
    async fn broadcast(&self, group: Group, src: usize, payload: Option<Vec<u8>>) -> Result<Vec<u8>>;

    /// Gathers one payload from each member of `group` onto every member.
    ///
    /// # Returns
    ///
    /// The payloads ordered by ascending global rank.
    async fn all_gather(&self, group: Group, payload: Vec<u8>) -> Result<Vec<Vec<u8>>>;
}
