//! Environment store: facts about the outside world plus unconsumed changes.
//!
//! The projector and the control loop record what they observe; queued
//! commands consume the change they are waiting for.

use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvironmentFact {
    AudioServerStarted,
}

#[derive(Debug, Default)]
pub struct Environment {
    state: HashMap<EnvironmentFact, bool>,
    changed: HashSet<EnvironmentFact>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, fact: EnvironmentFact) -> bool {
        self.state.get(&fact).copied().unwrap_or(false)
    }

    /// Record a value. Only an actual change is remembered as pending.
    pub fn set(&mut self, fact: EnvironmentFact, value: bool) {
        if self.get(fact) != value {
            self.changed.insert(fact);
        }
        self.state.insert(fact, value);
    }

    /// Take a pending change, returning the current value.
    pub fn consume_change(&mut self, fact: EnvironmentFact) -> Option<bool> {
        self.changed.remove(&fact).then(|| self.get(fact))
    }
}
