use std::fmt;

use tracing::{debug, info, warn};

use crate::communication::{Envelope, PacketRows, RequestChannel, RequestPacket, Roles, Topology, Transport};
use crate::constant::{ROOT_ACTION, TokenId};
use crate::error::{Result, SearchError};
use crate::tree::{NodeKey, SessionId, TreeNode, TreeStore};

use super::batch_position::{BatchPosition, TokenBatch};
use super::core_trait::StrategyPort;
use super::decode::BatchedDecodeLoop;
use super::frontier::Frontier;
use super::request::{RequestKind, SearchRequest};

/// Where the coordinator is in the current search step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    AwaitingRequest,
    Classifying,
    RootInit,
    Continuation,
    Decoding,
    Broadcasting,
    /// Saving new roots and their first children.
    Persisting,
    /// Registering the children of continued nodes.
    Expanding,
    Done,
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What one [`SearchCoordinator::follow`] call served.
#[derive(Debug, Clone, PartialEq)]
pub enum Served {
    /// A search step ran; the frontier is present on ranks that return output.
    Step(Option<Frontier>),
    /// The driving rank ended the session.
    Shutdown,
}

/// Runs search steps on one rank of a model-parallel group.
///
/// Every rank owns a coordinator. The driving rank calls
/// [`SearchCoordinator::search`]; every other rank calls
/// [`SearchCoordinator::follow`] in a loop. Both end up in the same state
/// sequence and issue the same collectives, which keeps the group in
/// lock-step:
///
/// `AwaitingRequest → Classifying → RootInit | Continuation → Decoding →
/// Broadcasting → Persisting | Expanding → Done`
///
/// Each rank keeps its own [`TreeStore`] and replicates the same writes from
/// the broadcast frontier.
pub struct SearchCoordinator<S, T>
where
    S: StrategyPort,
{
    strategy: S,
    channel: RequestChannel<T>,
    store: TreeStore<S::CacheHandle>,
    state: CoordinatorState,
}

impl<S, T> SearchCoordinator<S, T>
where
    S: StrategyPort,
    T: Transport,
{
    pub fn new(strategy: S, transport: T) -> Self {
        let channel = RequestChannel::new(transport);
        info!(
            rank = channel.topology().rank(),
            roles = %channel.roles(),
            "search coordinator ready"
        );
        Self {
            strategy,
            channel,
            store: TreeStore::new(),
            state: CoordinatorState::AwaitingRequest,
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn roles(&self) -> Roles {
        self.channel.roles()
    }

    pub fn topology(&self) -> &Topology {
        self.channel.topology()
    }

    pub fn store(&self) -> &TreeStore<S::CacheHandle> {
        &self.store
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    /// Runs one search step from the driving rank.
    ///
    /// The request is validated here before anything is sent, so a rejected
    /// request never reaches the peers.
    ///
    /// # Errors
    ///
    /// * [`SearchError::MalformedRequest`] when the request mixes or lacks
    ///   root and continuation fields
    /// * [`SearchError::InvalidTopK`] or [`SearchError::ConfigPrecondition`]
    ///   when decoding could not start
    /// * [`SearchError::NotFound`] when a continuation names an unknown node
    /// * anything raised while decoding or persisting
    pub async fn search(&mut self, request: SearchRequest) -> Result<Frontier> {
        if !self.roles().drives() {
            return Err(SearchError::Transport(format!(
                "rank {} cannot drive a search",
                self.topology().rank()
            )));
        }
        self.transition(CoordinatorState::Classifying);
        let packet = self.prepare(request).await.inspect_err(|e| {
            warn!(error = %e, "rejected search request");
        })?;

        self.channel.scatter(Some(&Envelope::Search(packet.clone()))).await?;
        self.execute(packet)
            .await?
            .ok_or_else(|| SearchError::Transport("driving rank produced no output".to_string()))
    }

    /// Serves one envelope scattered by the driving rank.
    pub async fn follow(&mut self) -> Result<Served> {
        self.transition(CoordinatorState::AwaitingRequest);
        match self.channel.scatter(None).await? {
            Envelope::Shutdown => {
                debug!(rank = self.topology().rank(), "received shutdown");
                Ok(Served::Shutdown)
            }
            Envelope::Search(packet) => {
                self.transition(CoordinatorState::Classifying);
                Ok(Served::Step(self.execute(packet).await?))
            }
        }
    }

    /// Tells every peer to stop following.
    pub async fn shutdown_group(&mut self) -> Result<()> {
        if !self.roles().drives() {
            return Err(SearchError::Transport(format!(
                "rank {} cannot shut the group down",
                self.topology().rank()
            )));
        }
        info!(rank = self.topology().rank(), "shutting down search group");
        self.channel.scatter(Some(&Envelope::Shutdown)).await?;
        self.transition(CoordinatorState::AwaitingRequest);
        Ok(())
    }

    // Driving-rank validation and tokenization, before any collective.
    async fn prepare(&self, request: SearchRequest) -> Result<RequestPacket> {
        let kind = request.classify()?;
        BatchedDecodeLoop::<S, T>::check_preconditions(&self.strategy, request.top_k)?;

        let rows = match kind {
            RequestKind::RootInit => {
                let prompts = request.prompts.unwrap_or_default();
                let tokens = self.strategy.tokenize_batch(&prompts, 0, false).await?;
                if tokens.batch_size() != request.sessions.len() {
                    return Err(SearchError::Strategy(format!(
                        "tokenizer returned {} rows for {} prompts",
                        tokens.batch_size(),
                        request.sessions.len()
                    )));
                }
                if let Some(row) = tokens.lengths().iter().position(|&length| length == 0) {
                    return Err(SearchError::MalformedRequest(format!("prompt of row {row} is empty")));
                }
                for (session, &length) in request.sessions.iter().zip(tokens.lengths()) {
                    match self.store.get(&NodeKey::root(*session)) {
                        Some(root) if root.context_length() != length => {
                            return Err(SearchError::DuplicateNode(root.key()));
                        }
                        _ => {}
                    }
                }
                PacketRows::Root { tokens }
            }
            RequestKind::Continuation => {
                let depths = request.depths.unwrap_or_default();
                let actions = request.actions.unwrap_or_default();
                if depths.windows(2).any(|pair| pair[0] != pair[1]) {
                    return Err(SearchError::MalformedRequest(
                        "continuation rows must share one depth".to_string(),
                    ));
                }
                self.lookup_all(&request.sessions, &depths, &actions)?;
                PacketRows::Continuation { depths, actions }
            }
        };
        Ok(RequestPacket {
            rows,
            sessions: request.sessions,
            tokens_to_generate: request.tokens_to_generate,
            top_k: request.top_k,
            end_strings: request.end_strings,
        })
    }

    // Everything after the scatter, identical on every rank.
    async fn execute(&mut self, packet: RequestPacket) -> Result<Option<Frontier>> {
        let is_root = packet.is_root();
        let decoded = match self.decode(packet).await {
            Err(e) if e.is_fatal() => return Err(e),
            decoded => decoded,
        };

        // reached even when decoding failed, so no peer waits on this rank
        self.transition(CoordinatorState::Broadcasting);
        let frontier = self
            .channel
            .gather_result(decoded.as_ref().map(|(_, _, frontier)| frontier.as_ref()))
            .await;
        let (positions, tokens, _) = decoded?;
        let frontier = frontier?;

        if is_root {
            self.transition(CoordinatorState::Persisting);
            self.persist_roots(&positions, &tokens, &frontier).await?;
        } else {
            self.transition(CoordinatorState::Expanding);
            let parents = positions
                .iter()
                .map(|position| {
                    let parent = position.parent.as_ref().ok_or_else(|| {
                        SearchError::MalformedRequest("continuation row has no node".to_string())
                    })?;
                    self.store.lookup(parent.session(), parent.depth(), parent.action())
                })
                .collect::<Result<Vec<_>>>()?;
            let depth = parents.first().map_or(1, |parent| parent.depth() + 1);
            if parents.iter().any(|parent| parent.depth() + 1 != depth) {
                return Err(SearchError::MalformedRequest(
                    "continuation rows must share one depth to be expanded together".to_string(),
                ));
            }
            self.register_expansion(&parents, depth, &frontier).await?;
        }

        self.transition(CoordinatorState::Done);
        if !self.roles().returns_output() {
            return Ok(None);
        }
        Ok(Some(self.strategy.post_generation_process(frontier).await?))
    }

    // RootInit or Continuation, then Decoding.
    async fn decode(
        &mut self,
        packet: RequestPacket,
    ) -> Result<(Vec<BatchPosition<S::CacheHandle>>, TokenBatch, Option<Frontier>)> {
        let is_root = packet.is_root();
        let RequestPacket {
            rows,
            sessions,
            tokens_to_generate,
            top_k,
            ..
        } = packet;

        let (positions, tokens) = match rows {
            PacketRows::Root { tokens } => {
                self.transition(CoordinatorState::RootInit);
                self.strategy.init(&tokens, tokens_to_generate, &sessions).await?;
                (root_positions(&tokens, &sessions), tokens)
            }
            PacketRows::Continuation { depths, actions } => {
                self.transition(CoordinatorState::Continuation);
                let positions = self.resume_positions(&sessions, &depths, &actions).await?;
                let tokens = BatchPosition::token_batch(&positions)?;
                (positions, tokens)
            }
        };

        self.transition(CoordinatorState::Decoding);
        let context_lengths = BatchPosition::context_lengths(&positions);
        let frontier = BatchedDecodeLoop::new(&self.strategy, &self.channel)
            .run(&tokens, &context_lengths, &sessions, top_k, is_root)
            .await?;
        Ok((positions, tokens, frontier))
    }

    fn lookup_all(
        &self,
        sessions: &[SessionId],
        depths: &[usize],
        actions: &[TokenId],
    ) -> Result<Vec<TreeNode<S::CacheHandle>>> {
        if sessions.len() != depths.len() || sessions.len() != actions.len() {
            return Err(SearchError::MalformedRequest(format!(
                "{} sessions, {} depths and {} actions",
                sessions.len(),
                depths.len(),
                actions.len()
            )));
        }
        sessions
            .iter()
            .zip(depths)
            .zip(actions)
            .map(|((session, depth), action)| self.store.lookup(*session, *depth, *action))
            .collect()
    }

    async fn resume_positions(
        &mut self,
        sessions: &[SessionId],
        depths: &[usize],
        actions: &[TokenId],
    ) -> Result<Vec<BatchPosition<S::CacheHandle>>> {
        let nodes = self.lookup_all(sessions, depths, actions)?;
        let resumed = self.strategy.resume(sessions, &nodes).await?;
        if resumed.tokens.batch_size() != nodes.len()
            || resumed.context_lengths.len() != nodes.len()
            || resumed.handles.len() != nodes.len()
        {
            return Err(SearchError::Strategy(format!(
                "resume returned a batch of the wrong size for {} nodes",
                nodes.len()
            )));
        }

        let faulted_in: Vec<_> = nodes
            .iter()
            .zip(resumed.handles)
            .filter_map(|(node, handle)| handle.map(|handle| (node.key(), handle)))
            .collect();
        self.store.materialize_all(faulted_in)?;

        let mut positions = Vec::with_capacity(nodes.len());
        for ((node, context_length), row) in nodes
            .into_iter()
            .zip(resumed.context_lengths)
            .zip(resumed.tokens.tokens())
        {
            let node = self.store.get(&node.key()).cloned().unwrap_or(node);
            positions.push(BatchPosition {
                token_context: row.clone(),
                context_length,
                session: node.session(),
                depth: node.depth(),
                parent: Some(node),
            });
        }
        Ok(positions)
    }

    // Saves new roots and registers their first children. A root that is
    // already stored with the same length keeps its node and cache.
    async fn persist_roots(
        &mut self,
        positions: &[BatchPosition<S::CacheHandle>],
        tokens: &TokenBatch,
        frontier: &Frontier,
    ) -> Result<()> {
        let sessions = BatchPosition::sessions(positions);
        let context_lengths = BatchPosition::context_lengths(positions);
        let stored: Vec<Option<TreeNode<S::CacheHandle>>> = sessions
            .iter()
            .map(|session| self.store.get(&NodeKey::root(*session)).cloned())
            .collect();
        let fresh: Vec<usize> = (0..positions.len()).filter(|row| stored[*row].is_none()).collect();

        let mut handles: Vec<Option<S::CacheHandle>> = stored
            .iter()
            .map(|root| root.as_ref().and_then(|root| root.handle().cloned()))
            .collect();
        if !fresh.is_empty() {
            let fresh_tokens = tokens.select(&fresh)?;
            let saved = self
                .strategy
                .save_kv_cache(
                    &fresh.iter().map(|row| sessions[*row]).collect::<Vec<_>>(),
                    &vec![0; fresh.len()],
                    &fresh.iter().map(|row| context_lengths[*row]).collect::<Vec<_>>(),
                    &vec![None; fresh.len()],
                    &vec![ROOT_ACTION; fresh.len()],
                    Some(&fresh_tokens),
                )
                .await?;
            if saved.len() != fresh.len() {
                return Err(SearchError::Strategy(format!(
                    "save_kv_cache returned {} handles for {} roots",
                    saved.len(),
                    fresh.len()
                )));
            }
            for (row, handle) in fresh.into_iter().zip(saved) {
                handles[row] = handle;
            }
        }

        let roots = self.store.create_root(&sessions, &context_lengths, handles)?;
        self.register_expansion(&roots, 1, frontier).await
    }

    // Registers the frontier's actions as children of `parents` at `depth`.
    // Rows the decode loop never reached get no children.
    async fn register_expansion(
        &mut self,
        parents: &[TreeNode<S::CacheHandle>],
        depth: usize,
        frontier: &Frontier,
    ) -> Result<()> {
        if frontier.batch_size() != parents.len() {
            return Err(SearchError::MalformedRequest(format!(
                "frontier of {} rows for {} parents",
                frontier.batch_size(),
                parents.len()
            )));
        }
        let reached: Vec<usize> = (0..parents.len()).filter(|row| frontier.is_reached(*row)).collect();
        if reached.is_empty() {
            return Ok(());
        }
        let parents: Vec<TreeNode<S::CacheHandle>> = reached.iter().map(|row| parents[*row].clone()).collect();
        let actions: Vec<Vec<TokenId>> = reached.iter().map(|row| frontier.actions()[*row].clone()).collect();

        let batch_size = parents.len();
        let sessions: Vec<SessionId> = parents.iter().map(TreeNode::session).collect();
        let context_lengths: Vec<usize> = parents.iter().map(|parent| parent.context_length() + 1).collect();
        let parent_nodes: Vec<_> = parents.iter().cloned().map(Some).collect();

        let mut materialized = Vec::new();
        for column in 0..frontier.top_k() {
            let column_actions: Vec<TokenId> = actions.iter().map(|row| row[column]).collect();
            let handles = self
                .strategy
                .save_kv_cache(
                    &sessions,
                    &vec![depth; batch_size],
                    &context_lengths,
                    &parent_nodes,
                    &column_actions,
                    None,
                )
                .await?;
            for ((session, action), handle) in sessions.iter().zip(&column_actions).zip(handles) {
                if let Some(handle) = handle {
                    materialized.push((NodeKey::new(*session, depth, *action), handle));
                }
            }
        }

        let children = self
            .store
            .expand(&parents, depth, &actions, &context_lengths, materialized)?;
        debug!(
            rank = self.topology().rank(),
            depth,
            children = children.len(),
            nodes = self.store.len(),
            "expanded frontier"
        );
        Ok(())
    }

    fn transition(&mut self, next: CoordinatorState) {
        debug!(rank = self.topology().rank(), from = %self.state, to = %next, "coordinator state");
        self.state = next;
    }
}

fn root_positions<H>(tokens: &TokenBatch, sessions: &[SessionId]) -> Vec<BatchPosition<H>> {
    tokens
        .tokens()
        .iter()
        .zip(tokens.lengths())
        .zip(sessions)
        .map(|((row, length), session)| BatchPosition {
            token_context: row.clone(),
            context_length: *length,
            session: *session,
            depth: 0,
            parent: None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use futures::future::join_all;

    use super::*;
    use crate::communication::{LocalGroup, LocalTransport};
    use crate::config::ModelConfig;
    use crate::search::mock_strategy::{MockStrategy, VOCAB_SIZE, expected_top_k, token_of};

    type Coordinator = SearchCoordinator<MockStrategy, LocalTransport>;

    fn single() -> Coordinator {
        single_with(ModelConfig::new(VOCAB_SIZE, 64))
    }

    fn single_with(config: ModelConfig) -> Coordinator {
        let transport = LocalGroup::new(1, 1).unwrap().into_transports().remove(0);
        SearchCoordinator::new(MockStrategy::with_config(*transport.topology(), config), transport)
    }

    fn group(tp: usize, pp: usize) -> Vec<Coordinator> {
        LocalGroup::new(tp, pp)
            .unwrap()
            .into_transports()
            .into_iter()
            .map(|transport| SearchCoordinator::new(MockStrategy::new(*transport.topology()), transport))
            .collect()
    }

    fn prompt(pieces: &[&str]) -> Vec<String> {
        pieces.iter().map(|piece| piece.to_string()).collect()
    }

    fn sessions() -> Vec<SessionId> {
        vec![SessionId::from_u128(1), SessionId::from_u128(2)]
    }

    fn root_request() -> SearchRequest {
        SearchRequest::root(vec![prompt(&["A"]), prompt(&["A", "B"])], sessions(), 3)
    }

    fn assert_well_formed(frontier: &Frontier, batch_size: usize, top_k: usize) {
        assert_eq!(frontier.batch_size(), batch_size);
        assert_eq!(frontier.top_k(), top_k);
        for (actions, policy) in frontier.actions().iter().zip(frontier.policy()) {
            assert_eq!(actions.len(), top_k);
            assert!(policy.windows(2).all(|pair| pair[0] >= pair[1]));
            assert!(policy.iter().sum::<f32>() <= 1.0 + 1e-5);
            assert!(actions.iter().all(|action| (*action as usize) < VOCAB_SIZE));
        }
    }

    #[tokio::test]
    async fn test_root_request_builds_roots_and_children() {
        let mut coordinator = single();
        let frontier = coordinator.search(root_request()).await.unwrap();

        assert_well_formed(&frontier, 2, 3);
        assert_eq!(frontier.actions()[0], expected_top_k(token_of("A"), 0, 3));
        assert_eq!(frontier.actions()[1], expected_top_k(token_of("B"), 1, 3));
        assert_eq!(coordinator.state(), CoordinatorState::Done);
        // cursor 1 then cursor 2
        assert_eq!(coordinator.strategy().forward_calls(), 2);

        let store = coordinator.store();
        assert_eq!(store.len(), 2 + 2 * 3);
        for (row, session) in sessions().into_iter().enumerate() {
            let root = store.lookup(session, 0, ROOT_ACTION).unwrap();
            assert_eq!(root.context_length(), row + 1);
            assert!(root.is_materialized());

            let children = store.children(&root.key());
            assert_eq!(children.len(), 3);
            let mut expected = frontier.actions()[row].clone();
            expected.sort();
            assert_eq!(children.iter().map(|child| child.action()).collect::<Vec<_>>(), expected);

            for action in &frontier.actions()[row] {
                let child = store.lookup(session, 1, *action).unwrap();
                assert_eq!(store.parent_of(&child), Some(&root));
                assert_eq!(child.context_length(), root.context_length() + 1);
                assert!(!child.is_materialized());
            }
        }
    }

    #[tokio::test]
    async fn test_root_persistence_calls_strategy_per_column() {
        let mut coordinator = single();
        coordinator.search(root_request()).await.unwrap();

        let saved = coordinator.strategy().saved_calls();
        assert_eq!(saved.len(), 1 + 3);
        assert_eq!(saved[0].actions, vec![ROOT_ACTION, ROOT_ACTION]);
        assert!(saved[0].with_tokens);
        assert!(!saved[0].with_parents);
        for call in &saved[1..] {
            assert_eq!(call.depths, vec![1, 1]);
            assert_eq!(call.context_lengths, vec![2, 3]);
            assert!(call.with_parents);
            assert!(!call.with_tokens);
        }
    }

    #[tokio::test]
    async fn test_boundary_runs_exactly_one_iteration() {
        let mut coordinator = single();
        let request = SearchRequest::root(vec![prompt(&["A", "B", "C"])], vec![SessionId::from_u128(9)], 2);
        let frontier = coordinator.search(request).await.unwrap();

        assert_eq!(coordinator.strategy().prepared_cursors(), vec![3]);
        assert_eq!(frontier.actions()[0], expected_top_k(token_of("C"), 2, 2));
    }

    #[tokio::test]
    async fn test_continuation_expands_selected_children() {
        let mut coordinator = single();
        let root_frontier = coordinator.search(root_request()).await.unwrap();
        let first = root_frontier.actions()[0][0];
        let second = root_frontier.actions()[1][1];
        let forward_before = coordinator.strategy().forward_calls();

        let request = SearchRequest::continuation(sessions(), vec![1, 1], vec![first, second], 2);
        let frontier = coordinator.search(request).await.unwrap();

        assert_well_formed(&frontier, 2, 2);
        // the children sit at context lengths 2 and 3
        assert_eq!(frontier.actions()[0], expected_top_k(first, 1, 2));
        assert_eq!(frontier.actions()[1], expected_top_k(second, 2, 2));
        assert_eq!(coordinator.strategy().forward_calls() - forward_before, 2);

        let store = coordinator.store();
        let continued = store.lookup(sessions()[0], 1, first).unwrap();
        assert!(continued.is_materialized());
        let grandchildren = store.children(&continued.key());
        assert_eq!(grandchildren.len(), 2);
        assert!(grandchildren.iter().all(|node| node.depth() == 2 && node.context_length() == 3));
        assert_eq!(store.len(), 8 + 4);
    }

    #[tokio::test]
    async fn test_equal_length_continuation_runs_one_iteration() {
        let mut coordinator = single();
        let root_frontier = coordinator.search(root_request()).await.unwrap();
        let action = root_frontier.actions()[0][2];
        let cursors_before = coordinator.strategy().prepared_cursors().len();

        let request = SearchRequest::continuation(vec![sessions()[0]], vec![1], vec![action], 3);
        coordinator.search(request.clone()).await.unwrap();
        let cursors = coordinator.strategy().prepared_cursors();
        assert_eq!(cursors[cursors_before..], [2]);

        // expanding the same node again changes nothing
        let nodes = coordinator.store().len();
        coordinator.search(request).await.unwrap();
        assert_eq!(coordinator.store().len(), nodes);
    }

    #[tokio::test]
    async fn test_unknown_node_is_not_found_without_mutation() {
        let mut coordinator = single();
        coordinator.search(root_request()).await.unwrap();
        let nodes = coordinator.store().len();
        let forward_calls = coordinator.strategy().forward_calls();

        let request = SearchRequest::continuation(sessions(), vec![4, 4], vec![1, 1], 2);
        let result = coordinator.search(request).await;

        assert!(matches!(result, Err(SearchError::NotFound(key)) if key.depth == 4));
        assert_eq!(coordinator.store().len(), nodes);
        assert_eq!(coordinator.strategy().forward_calls(), forward_calls);
    }

    #[tokio::test]
    async fn test_mixed_depth_continuation_is_malformed() {
        let mut coordinator = single();
        let frontier = coordinator.search(root_request()).await.unwrap();
        let forward_calls = coordinator.strategy().forward_calls();

        let actions = vec![ROOT_ACTION, frontier.actions()[1][0]];
        let request = SearchRequest::continuation(sessions(), vec![0, 1], actions, 2);
        assert!(matches!(coordinator.search(request).await, Err(SearchError::MalformedRequest(_))));
        assert_eq!(coordinator.strategy().forward_calls(), forward_calls);
    }

    #[tokio::test]
    async fn test_top_k_above_vocabulary_is_rejected_before_forward() {
        let mut coordinator = single();
        let mut request = root_request();
        request.top_k = VOCAB_SIZE + 1;

        let result = coordinator.search(request).await;
        assert!(matches!(
            result,
            Err(SearchError::InvalidTopK { top_k, vocab_size }) if top_k == VOCAB_SIZE + 1 && vocab_size == VOCAB_SIZE
        ));
        assert_eq!(coordinator.strategy().forward_calls(), 0);
        assert_eq!(coordinator.strategy().tokenize_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert!(coordinator.store().is_empty());
    }

    #[tokio::test]
    async fn test_top_k_of_full_vocabulary_never_picks_padding() {
        let mut coordinator = single();
        let mut request = root_request();
        request.top_k = VOCAB_SIZE;
        let frontier = coordinator.search(request).await.unwrap();
        assert_well_formed(&frontier, 2, VOCAB_SIZE);
        let sum: f32 = frontier.policy()[0].iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_malformed_request_is_rejected_locally() {
        let mut coordinator = single();
        let mut request = root_request();
        request.depths = Some(vec![0, 0]);
        request.actions = Some(vec![1, 1]);

        assert!(matches!(coordinator.search(request).await, Err(SearchError::MalformedRequest(_))));
        assert!(coordinator.store().is_empty());
        assert_eq!(coordinator.strategy().forward_calls(), 0);
    }

    #[tokio::test]
    async fn test_disallowed_model_config_fails_before_compute() {
        let mut config = ModelConfig::new(VOCAB_SIZE, 64);
        config.sequence_parallel = true;
        let mut coordinator = single_with(config);

        let result = coordinator.search(root_request()).await;
        assert!(matches!(result, Err(SearchError::ConfigPrecondition(_))));
        assert_eq!(coordinator.strategy().forward_calls(), 0);
    }

    #[tokio::test]
    async fn test_clipped_rows_keep_zero_frontier() {
        let mut coordinator = single_with(ModelConfig::new(VOCAB_SIZE, 2));
        let frontier = coordinator.search(root_request()).await.unwrap();

        assert_eq!(coordinator.strategy().prepared_cursors(), vec![1]);
        assert_eq!(frontier.actions()[0], expected_top_k(token_of("A"), 0, 3));
        assert_eq!(frontier.policy()[1], vec![0.0; 3]);
        assert!(frontier.is_reached(0));
        assert!(!frontier.is_reached(1));

        let store = coordinator.store();
        let clipped = store.lookup(sessions()[1], 0, ROOT_ACTION).unwrap();
        assert!(store.children(&clipped.key()).is_empty());
        assert!(store.lookup(sessions()[1], 1, 0).is_err());
        assert_eq!(store.len(), 2 + 3);
        for call in &coordinator.strategy().saved_calls()[1..] {
            assert_eq!(call.context_lengths, vec![2]);
        }
    }

    #[tokio::test]
    async fn test_root_twice() {
        let mut coordinator = single();
        coordinator.search(root_request()).await.unwrap();
        let nodes = coordinator.store().len();

        let saved = coordinator.strategy().saved_calls().len();

        // identical payload is a no-op and keeps the stored root cache
        coordinator.search(root_request()).await.unwrap();
        assert_eq!(coordinator.store().len(), nodes);
        let again = coordinator.strategy().saved_calls();
        assert_eq!(again.len(), saved + 3);
        assert!(again[saved..].iter().all(|call| !call.with_tokens));

        let forward_calls = coordinator.strategy().forward_calls();
        let saved = again.len();
        let request = SearchRequest::root(vec![prompt(&["B", "B", "B"])], vec![sessions()[0]], 3);
        let result = coordinator.search(request).await;
        assert!(matches!(result, Err(SearchError::DuplicateNode(key)) if key.session == sessions()[0]));
        assert_eq!(coordinator.store().len(), nodes);
        assert_eq!(coordinator.strategy().forward_calls(), forward_calls);
        assert_eq!(coordinator.strategy().saved_calls().len(), saved);
    }

    #[tokio::test]
    async fn test_new_and_known_roots_in_one_batch() {
        let mut coordinator = single();
        coordinator
            .search(SearchRequest::root(vec![prompt(&["A"])], vec![sessions()[0]], 2))
            .await
            .unwrap();
        let saved = coordinator.strategy().saved_calls().len();

        coordinator.search(SearchRequest::root(vec![prompt(&["A"]), prompt(&["C"])], sessions(), 2)).await.unwrap();
        let root_save = &coordinator.strategy().saved_calls()[saved];
        assert!(root_save.with_tokens);
        assert_eq!(root_save.actions, vec![ROOT_ACTION]);
        assert_eq!(coordinator.store().sessions(), sessions());
    }

    #[tokio::test]
    async fn test_empty_prompt_is_rejected_before_scatter() {
        let mut coordinator = single();
        let request = SearchRequest::root(vec![prompt(&["A"]), vec![]], sessions(), 2);

        assert!(matches!(coordinator.search(request).await, Err(SearchError::MalformedRequest(_))));
        assert_eq!(coordinator.strategy().forward_calls(), 0);
        assert!(coordinator.store().is_empty());
    }

    #[tokio::test]
    async fn test_terminal_failure_fails_the_whole_group() {
        let coordinators = group(2, 2);
        coordinators[3].strategy().drop_logits.store(1, std::sync::atomic::Ordering::SeqCst);

        let ranks = join_all(coordinators.into_iter().map(|mut coordinator| async move {
            let mut results = Vec::new();
            if coordinator.roles().drives() {
                results.push(coordinator.search(root_request()).await.map(|_| ()));
                coordinator.shutdown_group().await.unwrap();
            } else {
                loop {
                    match coordinator.follow().await {
                        Ok(Served::Shutdown) => break,
                        served => results.push(served.map(|_| ())),
                    }
                }
            }
            (coordinator, results)
        }))
        .await;

        for (coordinator, results) in &ranks {
            assert_eq!(results.len(), 1);
            assert!(coordinator.store().is_empty());
        }
        assert!(matches!(ranks[0].1[0], Err(SearchError::PeerFailed { rank: 2, .. })));
        assert!(matches!(ranks[1].1[0], Err(SearchError::PeerFailed { rank: 2, .. })));
        assert!(matches!(ranks[2].1[0], Err(SearchError::PeerFailed { rank: 3, .. })));
        assert!(matches!(ranks[3].1[0], Err(SearchError::Strategy(_))));
    }

    #[tokio::test]
    async fn test_only_driving_rank_searches() {
        let mut coordinators = group(1, 2);
        let mut peer = coordinators.pop().unwrap();
        assert!(matches!(peer.search(root_request()).await, Err(SearchError::Transport(_))));
        assert!(matches!(peer.shutdown_group().await, Err(SearchError::Transport(_))));
    }

    #[tokio::test]
    async fn test_sharded_group_replicates_the_tree() {
        let expected = single().search(root_request()).await.unwrap();

        let ranks = join_all(group(2, 2).into_iter().map(|mut coordinator| async move {
            let mut outputs = Vec::new();
            if coordinator.roles().drives() {
                // rejected before scatter, so the peers never see it
                let missing = SearchRequest::continuation(sessions(), vec![1, 1], vec![1, 1], 2);
                assert!(matches!(coordinator.search(missing).await, Err(SearchError::NotFound(_))));

                outputs.push(Some(coordinator.search(root_request()).await.unwrap()));
                coordinator.shutdown_group().await.unwrap();
            } else {
                loop {
                    match coordinator.follow().await.unwrap() {
                        Served::Step(output) => outputs.push(output),
                        Served::Shutdown => break,
                    }
                }
            }
            (coordinator, outputs)
        }))
        .await;

        for (coordinator, outputs) in &ranks {
            assert_eq!(outputs.len(), 1);
            assert!(coordinator.roles().returns_output());
            assert_eq!(outputs[0].as_ref(), Some(&expected));
            assert_eq!(coordinator.store().len(), 8);
            assert_eq!(coordinator.state(), CoordinatorState::AwaitingRequest);
        }
        // every stage runs the forward step
        assert_eq!(ranks[0].0.strategy().forward_calls(), 2);
        assert_eq!(ranks[3].0.strategy().forward_calls(), 2);
    }

    #[tokio::test]
    async fn test_middle_stage_returns_nothing() {
        let ranks = join_all(group(1, 3).into_iter().map(|mut coordinator| async move {
            if coordinator.roles().drives() {
                let frontier = coordinator.search(root_request()).await.unwrap();
                coordinator.shutdown_group().await.unwrap();
                vec![Some(frontier)]
            } else {
                let mut outputs = Vec::new();
                while let Served::Step(output) = coordinator.follow().await.unwrap() {
                    outputs.push(output);
                }
                outputs
            }
        }))
        .await;

        assert!(ranks[0][0].is_some());
        assert_eq!(ranks[1], vec![None]);
        assert!(ranks[2][0].is_some());
    }
}
