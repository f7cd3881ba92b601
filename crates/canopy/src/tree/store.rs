use std::collections::HashMap;
use std::fmt::Debug;

use tracing::{debug, trace};

use crate::constant::{ROOT_ACTION, TokenId};
use crate::error::{Result, SearchError};

use super::node::{NodeKey, SessionId, TreeNode};

/// Keyed registry of every node discovered in every live search session.
///
/// The `(session, depth, action)` triple is unique across the store. A key is
/// registered at most once; registering it again is a no-op when the payload
/// is identical and an error otherwise. Every mutating call validates its
/// whole batch before inserting anything, so a failed call leaves the store
/// untouched.
///
/// Nodes are never deleted: their lifetime is the session's, which is owned
/// by the caller.
///
/// # Type Parameters
///
/// * `H` - The opaque cache handle stored with each node
#[derive(Debug)]
pub struct TreeStore<H> {
    nodes: HashMap<NodeKey, TreeNode<H>>,
}

impl<H> Default for TreeStore<H> {
    fn default() -> Self {
        Self {
            nodes: HashMap::new(),
        }
    }
}

impl<H> TreeStore<H>
where
    H: Clone + PartialEq + Debug,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one root per session.
    ///
    /// # Parameters
    ///
    /// * `sessions` - One session per batch row
    /// * `context_lengths` - Prompt length of each row
    /// * `handles` - Cache handle produced for each root
    ///
    /// # Returns
    ///
    /// The root of every row, in row order. A row whose root already exists
    /// with an identical payload yields the existing node.
    ///
    /// # Errors
    ///
    /// [`SearchError::DuplicateNode`] when a session already has a root with a
    /// different payload.
    pub fn create_root(
        &mut self,
        sessions: &[SessionId],
        context_lengths: &[usize],
        handles: Vec<Option<H>>,
    ) -> Result<Vec<TreeNode<H>>> {
        if sessions.len() != context_lengths.len() || sessions.len() != handles.len() {
            return Err(SearchError::MalformedRequest(format!(
                "create_root got {} sessions, {} lengths and {} handles",
                sessions.len(),
                context_lengths.len(),
                handles.len()
            )));
        }

        let mut staged: HashMap<NodeKey, TreeNode<H>> = HashMap::new();
        let mut roots = Vec::with_capacity(sessions.len());
        for ((session, &length), handle) in sessions.iter().zip(context_lengths).zip(handles) {
            let key = NodeKey::root(*session);
            let candidate = TreeNode::new(key, None, length, handle);
            let existing = self.nodes.get(&key).or_else(|| staged.get(&key));
            match existing {
                Some(existing) if *existing == candidate => {
                    roots.push(existing.clone());
                }
                Some(_) => return Err(SearchError::DuplicateNode(key)),
                None => {
                    staged.insert(key, candidate.clone());
                    roots.push(candidate);
                }
            }
        }

        for (key, node) in staged {
            debug!(session = %key.session, context_length = node.context_length(), "registered root");
            self.nodes.insert(key, node);
        }
        Ok(roots)
    }

    /// Registers the top-k children of each parent at `depth`.
    ///
    /// Child `j` of row `i` is keyed by `actions[i][j]`. Children are
    /// registered lazily: they carry no cache handle until they are resumed
    /// and [`TreeStore::materialize`] is called.
    ///
    /// # Parameters
    ///
    /// * `parents` - One registered parent per batch row
    /// * `depth` - Depth of the children, one below the parents
    /// * `actions` - `[batch][top_k]` actions selected under each parent
    /// * `context_lengths` - Context length of the children of each row
    ///
    /// # Returns
    ///
    /// The children ordered by top-k column, then by row.
    ///
    /// # Errors
    ///
    /// * [`SearchError::NotFound`] when a parent is not registered
    /// * [`SearchError::Conflict`] when a child key exists with a different
    ///   parent or context length
    pub fn register_children(
        &mut self,
        parents: &[TreeNode<H>],
        depth: usize,
        actions: &[Vec<TokenId>],
        context_lengths: &[usize],
    ) -> Result<Vec<TreeNode<H>>> {
        self.expand(parents, depth, actions, context_lengths, Vec::new())
    }

    /// [`TreeStore::register_children`], attaching `handles` to some of the
    /// children in the same all-or-nothing step.
    ///
    /// # Errors
    ///
    /// Everything [`TreeStore::register_children`] and
    /// [`TreeStore::materialize_all`] raise.
    pub fn expand(
        &mut self,
        parents: &[TreeNode<H>],
        depth: usize,
        actions: &[Vec<TokenId>],
        context_lengths: &[usize],
        handles: Vec<(NodeKey, H)>,
    ) -> Result<Vec<TreeNode<H>>> {
        let (mut staged, keys) = self.stage_children(parents, depth, actions, context_lengths)?;
        self.stage_handles(&mut staged, handles)?;
        debug!(depth, staged = staged.len(), "registered children");
        self.commit(staged, &keys)
    }

    /// Attaches a cache handle to a node registered without one.
    ///
    /// # Errors
    ///
    /// * [`SearchError::NotFound`] when the key is not registered
    /// * [`SearchError::Conflict`] when the node already holds a different handle
    pub fn materialize(&mut self, key: &NodeKey, handle: H) -> Result<TreeNode<H>> {
        self.materialize_all(vec![(*key, handle)])?
            .pop()
            .ok_or(SearchError::NotFound(*key))
    }

    /// Attaches every handle or none of them.
    ///
    /// # Returns
    ///
    /// The updated nodes, in the order of `handles`.
    ///
    /// # Errors
    ///
    /// * [`SearchError::NotFound`] when a key is not registered
    /// * [`SearchError::Conflict`] when a node already holds a different
    ///   handle, or two entries give one key different handles
    pub fn materialize_all(&mut self, handles: Vec<(NodeKey, H)>) -> Result<Vec<TreeNode<H>>> {
        let keys: Vec<NodeKey> = handles.iter().map(|(key, _)| *key).collect();
        let mut staged = HashMap::new();
        self.stage_handles(&mut staged, handles)?;
        self.commit(staged, &keys)
    }

    fn stage_children(
        &self,
        parents: &[TreeNode<H>],
        depth: usize,
        actions: &[Vec<TokenId>],
        context_lengths: &[usize],
    ) -> Result<(HashMap<NodeKey, TreeNode<H>>, Vec<NodeKey>)> {
        if parents.len() != actions.len() || parents.len() != context_lengths.len() {
            return Err(SearchError::MalformedRequest(format!(
                "register_children got {} parents, {} action rows and {} lengths",
                parents.len(),
                actions.len(),
                context_lengths.len()
            )));
        }
        let top_k = actions.iter().map(Vec::len).max().unwrap_or(0);
        if actions.iter().any(|row| row.len() != top_k) {
            return Err(SearchError::MalformedRequest(
                "register_children action rows have different widths".to_string(),
            ));
        }

        for parent in parents {
            if !self.nodes.contains_key(&parent.key()) {
                return Err(SearchError::NotFound(parent.key()));
            }
            if parent.depth() + 1 != depth {
                return Err(SearchError::MalformedRequest(format!(
                    "children at depth {depth} cannot hang below {}",
                    parent.key()
                )));
            }
        }

        let mut staged: HashMap<NodeKey, TreeNode<H>> = HashMap::new();
        let mut keys = Vec::with_capacity(parents.len() * top_k);
        for column in 0..top_k {
            for ((parent, row), &length) in parents.iter().zip(actions).zip(context_lengths) {
                let action = row[column];
                if action == ROOT_ACTION {
                    return Err(SearchError::MalformedRequest(format!(
                        "action {ROOT_ACTION} is reserved for roots"
                    )));
                }
                let key = NodeKey::new(parent.session(), depth, action);
                let candidate = TreeNode::new(key, Some(parent.key()), length, None);
                match self.nodes.get(&key).or_else(|| staged.get(&key)) {
                    Some(existing) if lazily_equal(existing, &candidate) => {}
                    Some(_) => return Err(SearchError::Conflict(key)),
                    None => {
                        staged.insert(key, candidate);
                    }
                }
                keys.push(key);
            }
        }
        Ok((staged, keys))
    }

    // Applies `handles` on top of `staged`, copying stored nodes in as needed.
    fn stage_handles(&self, staged: &mut HashMap<NodeKey, TreeNode<H>>, handles: Vec<(NodeKey, H)>) -> Result<()> {
        for (key, handle) in handles {
            if !staged.contains_key(&key) {
                let stored = self.nodes.get(&key).cloned().ok_or(SearchError::NotFound(key))?;
                staged.insert(key, stored);
            }
            let node = staged.get_mut(&key).ok_or(SearchError::NotFound(key))?;
            match node.handle() {
                Some(existing) if *existing == handle => {}
                Some(_) => return Err(SearchError::Conflict(key)),
                None => node.set_handle(handle),
            }
        }
        Ok(())
    }

    fn commit(&mut self, staged: HashMap<NodeKey, TreeNode<H>>, keys: &[NodeKey]) -> Result<Vec<TreeNode<H>>> {
        for (key, node) in staged {
            if node.is_materialized() {
                trace!(node = %key, "materialized cache handle");
            }
            self.nodes.insert(key, node);
        }
        keys.iter()
            .map(|key| self.nodes.get(key).cloned().ok_or(SearchError::NotFound(*key)))
            .collect()
    }

    /// Looks up the node registered under `(session, depth, action)`.
    ///
    /// Reads never mutate the store: repeated lookups return identical nodes.
    pub fn lookup(&self, session: SessionId, depth: usize, action: TokenId) -> Result<TreeNode<H>> {
        let key = NodeKey::new(session, depth, action);
        self.get(&key).cloned().ok_or(SearchError::NotFound(key))
    }

    pub fn get(&self, key: &NodeKey) -> Option<&TreeNode<H>> {
        self.nodes.get(key)
    }

    pub fn contains(&self, key: &NodeKey) -> bool {
        self.nodes.contains_key(key)
    }

    /// Follows the non-owning parent link of `node`.
    pub fn parent_of(&self, node: &TreeNode<H>) -> Option<&TreeNode<H>> {
        node.parent().and_then(|key| self.nodes.get(&key))
    }

    /// Children registered below `parent`, in ascending action order.
    pub fn children(&self, parent: &NodeKey) -> Vec<&TreeNode<H>> {
        let mut children: Vec<_> = self
            .nodes
            .values()
            .filter(|node| node.parent() == Some(*parent))
            .collect();
        children.sort_by_key(|node| node.action());
        children
    }

    /// Sessions that have a root, in ascending order.
    pub fn sessions(&self) -> Vec<SessionId> {
        let mut sessions: Vec<_> = self
            .nodes
            .keys()
            .filter(|key| key.is_root())
            .map(|key| key.session)
            .collect();
        sessions.sort();
        sessions
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

// A lazy registration carries no handle, so it only has to agree on
// position in the tree with whatever is already stored.
fn lazily_equal<H: PartialEq>(existing: &TreeNode<H>, candidate: &TreeNode<H>) -> bool {
    existing.parent() == candidate.parent()
        && existing.context_length() == candidate.context_length()
        && (candidate.handle().is_none() || existing.handle() == candidate.handle())
}
