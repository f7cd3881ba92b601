use std::fmt;

use super::topology::Topology;

/// A responsibility a rank can hold during a search step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Accepts requests from callers and scatters them to the group.
    Driving,
    /// Hosts the first pipeline stage, feeding tokens into the model.
    PipelineFirst,
    /// Hosts the terminal pipeline stage and computes the frontier.
    PipelineLast,
    /// A middle stage that only relays activations.
    Other,
}

/// The roles one rank holds, resolved once from its [`Topology`].
///
/// A rank can hold several roles at once: with a single pipeline stage every
/// rank is both first and last, and rank `0` also drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Roles {
    driving: bool,
    first: bool,
    last: bool,
}

impl Roles {
    pub fn resolve(topology: &Topology) -> Self {
        Self {
            driving: topology.rank() == topology.driving_rank(),
            first: topology.is_first_stage(),
            last: topology.is_last_stage(),
        }
    }

    pub fn has(&self, role: Role) -> bool {
        match role {
            Role::Driving => self.driving,
            Role::PipelineFirst => self.first,
            Role::PipelineLast => self.last,
            Role::Other => !(self.driving || self.first || self.last),
        }
    }

    /// Whether this rank takes requests from callers.
    pub fn drives(&self) -> bool {
        self.has(Role::Driving)
    }

    /// Whether this rank sees logits and builds the frontier.
    pub fn computes_frontier(&self) -> bool {
        self.has(Role::PipelineLast)
    }

    /// Whether this rank hands the frontier back to its caller.
    pub fn returns_output(&self) -> bool {
        self.drives() || self.has(Role::PipelineFirst) || self.has(Role::PipelineLast)
    }

    pub fn iter(&self) -> impl Iterator<Item = Role> + '_ {
        [Role::Driving, Role::PipelineFirst, Role::PipelineLast, Role::Other]
            .into_iter()
            .filter(|role| self.has(*role))
    }
}

impl fmt::Display for Roles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.iter().map(|role| format!("{role:?}")).collect();
        write!(f, "{}", names.join("+"))
    }
}
