use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::constant::TokenId;
use crate::error::{Result, SearchError};
use crate::tree::SessionId;

/// A prompt as the sequence of raw token pieces a tokenizer understands.
pub type Prompt = Vec<String>;

/// One tree-search call.
///
/// A request either starts new trees (`prompts` set, `depths` and `actions`
/// unset) or continues existing ones (`depths` and `actions` set, `prompts`
/// unset). [`SearchRequest::classify`] tells the two apart and rejects
/// anything else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub prompts: Option<Vec<Prompt>>,
    pub depths: Option<Vec<usize>>,
    pub actions: Option<Vec<TokenId>>,
    pub sessions: Vec<SessionId>,
    pub tokens_to_generate: usize,
    pub top_k: usize,
    pub end_strings: BTreeSet<String>,
}

/// The validated shape of a [`SearchRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Create one root per session and expand its children.
    RootInit,
    /// Expand the node reached from `(session, depth)` by `action`.
    Continuation,
}

impl SearchRequest {
    /// A request that starts one tree per prompt.
    pub fn root(prompts: Vec<Prompt>, sessions: Vec<SessionId>, top_k: usize) -> Self {
        Self {
            prompts: Some(prompts),
            depths: None,
            actions: None,
            sessions,
            tokens_to_generate: 1,
            top_k,
            end_strings: BTreeSet::new(),
        }
    }

    /// A request that expands the node `(sessions[i], depths[i], actions[i])`
    /// of every row.
    pub fn continuation(sessions: Vec<SessionId>, depths: Vec<usize>, actions: Vec<TokenId>, top_k: usize) -> Self {
        Self {
            prompts: None,
            depths: Some(depths),
            actions: Some(actions),
            sessions,
            tokens_to_generate: 1,
            top_k,
            end_strings: BTreeSet::new(),
        }
    }

    pub fn with_tokens_to_generate(mut self, tokens_to_generate: usize) -> Self {
        self.tokens_to_generate = tokens_to_generate;
        self
    }

    pub fn with_end_strings<I, S>(mut self, end_strings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.end_strings = end_strings.into_iter().map(Into::into).collect();
        self
    }

    pub fn batch_size(&self) -> usize {
        self.sessions.len()
    }

    /// Decides whether this is a root or a continuation request.
    ///
    /// # Errors
    ///
    /// [`SearchError::MalformedRequest`] when prompts are mixed with
    /// depth/action rows, when neither is present, when only one of depths
    /// and actions is given, or when row counts disagree with `sessions`.
    pub fn classify(&self) -> Result<RequestKind> {
        let kind = match (&self.prompts, &self.depths, &self.actions) {
            (Some(_), None, None) => RequestKind::RootInit,
            (None, Some(_), Some(_)) => RequestKind::Continuation,
            (Some(_), _, _) => {
                return Err(SearchError::MalformedRequest(
                    "prompts cannot be combined with depths or actions".to_string(),
                ));
            }
            (None, None, None) => {
                return Err(SearchError::MalformedRequest(
                    "request carries neither prompts nor depths and actions".to_string(),
                ));
            }
            (None, _, _) => {
                return Err(SearchError::MalformedRequest(
                    "continuation needs both depths and actions".to_string(),
                ));
            }
        };

        if self.sessions.is_empty() {
            return Err(SearchError::MalformedRequest("request has no sessions".to_string()));
        }
        let rows = match kind {
            RequestKind::RootInit => vec![self.prompts.as_ref().map_or(0, Vec::len)],
            RequestKind::Continuation => vec![
                self.depths.as_ref().map_or(0, Vec::len),
                self.actions.as_ref().map_or(0, Vec::len),
            ],
        };
        if rows.iter().any(|&len| len != self.sessions.len()) {
            return Err(SearchError::MalformedRequest(format!(
                "{} sessions but {rows:?} rows",
                self.sessions.len()
            )));
        }
        Ok(kind)
    }
}
