use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constant::{ROOT_ACTION, TokenId};

/// Identifies one search tree.
///
/// Session lifetime, and therefore node lifetime, is owned by whoever drives
/// the search; the store never deletes nodes on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Creates a fresh random session id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a session id from a fixed value, useful for reproducible runs.
    pub fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for SessionId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Composite key of a tree node.
///
/// `action` is the token that led from the parent to this node;
/// [`ROOT_ACTION`] marks a root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey {
    pub session: SessionId,
    pub depth: usize,
    pub action: TokenId,
}

impl NodeKey {
    pub fn new(session: SessionId, depth: usize, action: TokenId) -> Self {
        Self { session, depth, action }
    }

    /// Key of the root of `session`.
    pub fn root(session: SessionId) -> Self {
        Self::new(session, 0, ROOT_ACTION)
    }

    pub fn is_root(&self) -> bool {
        self.action == ROOT_ACTION
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session {} depth {} action {}", self.session, self.depth, self.action)
    }
}

/// One node of a search tree.
///
/// A node is immutable once registered, except that a lazily registered
/// child receives its cache handle the first time it is resumed.
///
/// # Type Parameters
///
/// * `H` - The opaque KV-cache handle type supplied by the model collaborator
#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode<H> {
    key: NodeKey,
    parent: Option<NodeKey>,
    context_length: usize,
    handle: Option<H>,
}

impl<H> TreeNode<H> {
    pub(crate) fn new(key: NodeKey, parent: Option<NodeKey>, context_length: usize, handle: Option<H>) -> Self {
        Self {
            key,
            parent,
            context_length,
            handle,
        }
    }

    pub fn key(&self) -> NodeKey {
        self.key
    }

    pub fn session(&self) -> SessionId {
        self.key.session
    }

    pub fn depth(&self) -> usize {
        self.key.depth
    }

    pub fn action(&self) -> TokenId {
        self.key.action
    }

    /// Key of the parent node, `None` for a root. Lookup only.
    pub fn parent(&self) -> Option<NodeKey> {
        self.parent
    }

    /// Number of tokens in the sequence that ends at this node.
    pub fn context_length(&self) -> usize {
        self.context_length
    }

    /// Cache handle, `None` until the collaborator materialises it.
    pub fn handle(&self) -> Option<&H> {
        self.handle.as_ref()
    }

    pub fn is_root(&self) -> bool {
        self.key.is_root()
    }

    pub fn is_materialized(&self) -> bool {
        self.handle.is_some()
    }

    pub(crate) fn set_handle(&mut self, handle: H) {
        self.handle = Some(handle);
    }
}
