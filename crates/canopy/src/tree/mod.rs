//! # Search Tree
//!
//! The explicit arena holding every tree node discovered during a search
//! session. Nodes are addressed by a composite [`NodeKey`]
//! `(session, depth, action)`; parent links are keys, never owning
//! references, so the arena has no reference cycles.
//!
//! * [`TreeStore`] - the keyed registry (root creation, child registration,
//!   lookup, lazy cache materialisation)
//! * [`TreeNode`] - one immutable node with its opaque cache handle
//! * [`SessionId`] - identifies one search tree

mod node;
mod store;

pub use node::{NodeKey, SessionId, TreeNode};
pub use store::TreeStore;
