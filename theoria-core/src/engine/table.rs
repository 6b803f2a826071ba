//! Phase tables: the declared phases of an agent and the guarded edges
//! between them.

use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::hash::Hash;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Marker for the enumerations agents use as phases.
pub trait PhaseTag:
    Copy + Eq + Hash + Debug + Display + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

impl<T> PhaseTag for T where
    T: Copy + Eq + Hash + Debug + Display + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

/// A pure test over agent state.
pub type Predicate<S> = fn(&S) -> bool;

/// Predicate that always holds.
pub fn always<S>(_: &S) -> bool {
    true
}

/// One guarded edge out of a phase.
pub struct Transition<P, S> {
    /// Name used in logs
    pub label: &'static str,
    pub guard: Predicate<S>,
    pub target: P,
}

impl<P: Copy, S> Clone for Transition<P, S> {
    fn clone(&self) -> Self {
        Self {
            label: self.label,
            guard: self.guard,
            target: self.target,
        }
    }
}

impl<P: Debug, S> Debug for Transition<P, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transition")
            .field("label", &self.label)
            .field("target", &self.target)
            .finish()
    }
}

/// How many entry actions one user turn may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum TurnPolicy {
    /// Run the current phase's action once, then take at most one edge.
    SingleStep,
    /// Keep entering successor phases until a self-loop, a terminal phase
    /// or `max_steps` actions.
    RunToRest { max_steps: usize },
}

impl TurnPolicy {
    pub fn max_steps(&self) -> usize {
        match self {
            Self::SingleStep => 1,
            Self::RunToRest { max_steps } => (*max_steps).max(1),
        }
    }
}

/// Validated transition table over phases `P` and state `S`.
pub struct PhaseTable<P, S> {
    initial: P,
    phases: Vec<P>,
    edges: HashMap<P, Vec<Transition<P, S>>>,
}

impl<P: PhaseTag, S> PhaseTable<P, S> {
    pub fn builder(initial: P) -> PhaseTableBuilder<P, S> {
        PhaseTableBuilder::new(initial)
    }

    pub fn initial(&self) -> P {
        self.initial
    }

    /// Declared phases in declaration order.
    pub fn phases(&self) -> &[P] {
        &self.phases
    }

    pub fn is_declared(&self, phase: P) -> bool {
        self.phases.contains(&phase)
    }

    pub fn transitions(&self, phase: P) -> &[Transition<P, S>] {
        self.edges.get(&phase).map(Vec::as_slice).unwrap_or(&[])
    }

    /// A phase without outgoing edges.
    pub fn is_terminal(&self, phase: P) -> bool {
        self.transitions(phase).is_empty()
    }

    /// First edge whose guard holds, if any.
    pub fn select(&self, phase: P, state: &S) -> Option<&Transition<P, S>> {
        self.transitions(phase).iter().find(|t| (t.guard)(state))
    }

    /// Successor of `phase`; the phase itself when no guard holds.
    pub fn next(&self, phase: P, state: &S) -> P {
        self.select(phase, state).map(|t| t.target).unwrap_or(phase)
    }
}

impl<P: Debug, S> Debug for PhaseTable<P, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseTable")
            .field("initial", &self.initial)
            .field("phases", &self.phases)
            .finish_non_exhaustive()
    }
}

/// Builder for [`PhaseTable`]. Validation happens once, in [`build`].
///
/// [`build`]: PhaseTableBuilder::build
pub struct PhaseTableBuilder<P, S> {
    initial: P,
    phases: Vec<P>,
    edges: Vec<(P, Transition<P, S>)>,
}

impl<P: PhaseTag, S> PhaseTableBuilder<P, S> {
    pub fn new(initial: P) -> Self {
        Self {
            initial,
            phases: Vec::new(),
            edges: Vec::new(),
        }
    }

    /// Declare a phase. Redeclaring is harmless.
    pub fn phase(mut self, phase: P) -> Self {
        if !self.phases.contains(&phase) {
            self.phases.push(phase);
        }
        self
    }

    /// Append an edge; edges out of one phase are tried in insertion order.
    pub fn edge(mut self, from: P, label: &'static str, guard: Predicate<S>, target: P) -> Self {
        self.edges.push((
            from,
            Transition {
                label,
                guard,
                target,
            },
        ));
        self
    }

    pub fn build(self) -> Result<PhaseTable<P, S>> {
        if !self.phases.contains(&self.initial) {
            return Err(Error::invalid_transition("(start)", self.initial.to_string()));
        }

        let mut edges: HashMap<P, Vec<Transition<P, S>>> = HashMap::new();
        for (from, transition) in self.edges {
            if !self.phases.contains(&from) || !self.phases.contains(&transition.target) {
                return Err(Error::invalid_transition(
                    from.to_string(),
                    transition.target.to_string(),
                ));
            }
            edges.entry(from).or_default().push(transition);
        }

        Ok(PhaseTable {
            initial: self.initial,
            phases: self.phases,
            edges,
        })
    }
}
