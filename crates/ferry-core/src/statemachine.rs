//! Generic finite state machine.
//!
//! A machine *kind* is described by a [`Graph`]: a static table associating
//! each state with the set of states it may move to. A [`Machine`] is one
//! running instance of a graph. The graph is plain data, so the machines used
//! by the pipeline and by the file stream are declared as constants:
//!
//! ```
//! use ferry_core::statemachine::{Graph, Machine};
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq)]
//! enum Door { Closed, Open, Broken }
//!
//! impl std::fmt::Display for Door {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         std::fmt::Debug::fmt(self, f)
//!     }
//! }
//!
//! static DOOR: Graph<Door> = Graph::new("door", Door::Closed, &[
//!     (Door::Closed, &[Door::Open, Door::Broken]),
//!     (Door::Open, &[Door::Closed, Door::Broken]),
//!     (Door::Broken, &[]),
//! ]);
//!
//! let machine = Machine::new(&DOOR);
//! machine.transition(Door::Open).unwrap();
//! assert!(machine.transition(Door::Open).is_err());
//! machine.transition(Door::Broken).unwrap();
//! assert!(machine.has_ended());
//! ```

use std::fmt;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

/// State machine errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    /// Target state is not declared in the machine's graph
    #[error("{machine}: unknown state \"{state}\"")]
    UnknownState {
        /// Machine kind
        machine: &'static str,
        /// Offending state
        state: String,
    },

    /// Target state is not a successor of the current state
    #[error("{machine}: invalid transition from \"{from}\" to \"{to}\"")]
    InvalidTransition {
        /// Machine kind
        machine: &'static str,
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },
}

/// Static transition graph of a machine kind
#[derive(Debug)]
pub struct Graph<S: 'static> {
    name: &'static str,
    initial: S,
    edges: &'static [(S, &'static [S])],
}

impl<S> Graph<S>
where
    S: Copy + PartialEq + 'static,
{
    /// Declare a graph. `edges` lists every state with its allowed successors;
    /// states with no successors are terminal.
    #[must_use]
    pub const fn new(name: &'static str, initial: S, edges: &'static [(S, &'static [S])]) -> Self {
        Self {
            name,
            initial,
            edges,
        }
    }

    /// Machine kind name, used in error messages
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Initial state
    #[must_use]
    pub fn initial(&self) -> S {
        self.initial
    }

    /// Successors of `state`, or `None` if the state is not declared
    #[must_use]
    pub fn successors(&self, state: S) -> Option<&'static [S]> {
        self.edges
            .iter()
            .find(|(from, _)| *from == state)
            .map(|(_, to)| *to)
    }

    /// All declared states, in declaration order
    pub fn states(&self) -> impl Iterator<Item = S> + '_ {
        self.edges.iter().map(|(state, _)| *state)
    }
}

#[derive(Debug, Clone, Copy)]
struct Position<S> {
    current: S,
    last: S,
}

/// A running state machine
#[derive(Debug)]
pub struct Machine<S: 'static> {
    graph: &'static Graph<S>,
    position: RwLock<Position<S>>,
}

impl<S> Machine<S>
where
    S: Copy + PartialEq + fmt::Display + 'static,
{
    /// Create a machine in the graph's initial state
    #[must_use]
    pub fn new(graph: &'static Graph<S>) -> Self {
        let initial = graph.initial();
        Self {
            graph,
            position: RwLock::new(Position {
                current: initial,
                last: initial,
            }),
        }
    }

    /// Move to `to`. On failure the current state is left unchanged.
    pub fn transition(&self, to: S) -> Result<(), StateError> {
        let mut position = self
            .position
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if self.graph.successors(to).is_none() {
            return Err(StateError::UnknownState {
                machine: self.graph.name(),
                state: to.to_string(),
            });
        }

        let allowed = self
            .graph
            .successors(position.current)
            .is_some_and(|next| next.contains(&to));
        if !allowed {
            return Err(StateError::InvalidTransition {
                machine: self.graph.name(),
                from: position.current.to_string(),
                to: to.to_string(),
            });
        }

        position.last = position.current;
        position.current = to;

        Ok(())
    }

    /// Current state
    #[must_use]
    pub fn current(&self) -> S {
        self.position
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .current
    }

    /// State the machine was in before its last successful transition
    #[must_use]
    pub fn last(&self) -> S {
        self.position
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .last
    }

    /// True when the current state is terminal
    #[must_use]
    pub fn has_ended(&self) -> bool {
        self.graph
            .successors(self.current())
            .is_none_or(<[S]>::is_empty)
    }

    /// Graph this machine runs
    #[must_use]
    pub fn graph(&self) -> &'static Graph<S> {
        self.graph
    }
}
