//! Run state machine: `Idle -> Fetching -> Staging -> Compiling -> Done`,
//! with `Failed` reachable from every non-terminal state.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Fetching,
    Staging,
    Compiling,
    Done,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Fetching => "fetching",
            RunState::Staging => "staging",
            RunState::Compiling => "compiling",
            RunState::Done => "done",
            RunState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }

    /// The only forward successor of this state, if any.
    fn next(&self) -> Option<RunState> {
        match self {
            RunState::Idle => Some(RunState::Fetching),
            RunState::Fetching => Some(RunState::Staging),
            RunState::Staging => Some(RunState::Compiling),
            RunState::Compiling => Some(RunState::Done),
            RunState::Done | RunState::Failed => None,
        }
    }

    pub fn can_transition_to(&self, to: RunState) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == RunState::Failed || self.next() == Some(to)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks the state of one run. Never re-enters a state; a retry needs a
/// fresh tracker.
#[derive(Debug, Clone)]
pub struct RunTracker {
    current: RunState,
    history: Vec<RunState>,
}

impl RunTracker {
    pub fn new() -> Self {
        Self {
            current: RunState::Idle,
            history: vec![RunState::Idle],
        }
    }

    pub fn current(&self) -> RunState {
        self.current
    }

    pub fn history(&self) -> &[RunState] {
        &self.history
    }

    pub fn advance(&mut self, to: RunState) -> PipelineResult<()> {
        if !self.current.can_transition_to(to) {
            return Err(PipelineError::InvalidTransition {
                from: self.current,
                to,
            });
        }
        self.current = to;
        self.history.push(to);
        Ok(())
    }

    /// Move to `Failed`. Returns the state the run failed in.
    pub fn fail(&mut self) -> RunState {
        let failed_in = self.current;
        if !self.current.is_terminal() {
            self.current = RunState::Failed;
            self.history.push(RunState::Failed);
        }
        failed_in
    }
}

impl Default for RunTracker {
    fn default() -> Self {
        Self::new()
    }
}
