//! Per-task state machine of a recursive computation.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pool::WorkerId;

/// State of one recursive task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecursionState {
    /// Payload received, base case not yet evaluated.
    Created,
    /// Solving the payload directly.
    DirectCompute,
    /// Partitioning the payload.
    Splitting,
    /// Child pool running.
    AwaitingChildren,
    /// Associating child results with their sub-payloads.
    Combining,
    /// Result emitted.
    Completed,
    /// Failed; reported as this worker's error.
    Failed,
}

impl RecursionState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: RecursionState) -> bool {
        use RecursionState::*;

        matches!(
            (self, target),
            (Created, DirectCompute) | (Created, Splitting) |
            (DirectCompute, Completed) |
            (Splitting, AwaitingChildren) |
            (AwaitingChildren, Combining) |
            (Combining, Completed) |
            // Any live state may fail
            (Created, Failed) | (DirectCompute, Failed) | (Splitting, Failed) |
            (AwaitingChildren, Failed) | (Combining, Failed)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for RecursionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::DirectCompute => "direct_compute",
            Self::Splitting => "splitting",
            Self::AwaitingChildren => "awaiting_children",
            Self::Combining => "combining",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A state transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: RecursionState,
    pub to: RecursionState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Transition history of one recursive task.
#[derive(Debug, Clone, Serialize)]
pub struct RecursionTrace {
    pub worker_id: WorkerId,
    /// Number of enclosing workers, this one included.
    pub depth: usize,
    pub state: RecursionState,
    pub created_at: DateTime<Utc>,
    pub transitions: Vec<StateTransition>,
}

impl RecursionTrace {
    pub fn new(worker_id: WorkerId, depth: usize) -> Self {
        Self {
            worker_id,
            depth,
            state: RecursionState::Created,
            created_at: Utc::now(),
            transitions: Vec::new(),
        }
    }

    /// Transition to a new state.
    pub fn transition_to(
        &mut self,
        new_state: RecursionState,
        reason: Option<String>,
    ) -> Result<(), String> {
        if !self.state.can_transition_to(new_state) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.state, new_state
            ));
        }

        tracing::trace!(
            worker_id = self.worker_id,
            depth = self.depth,
            from = %self.state,
            to = %new_state,
            "Recursion state change"
        );

        self.transitions.push(StateTransition {
            from: self.state,
            to: new_state,
            timestamp: Utc::now(),
            reason,
        });
        self.state = new_state;
        Ok(())
    }

    /// Fail from whatever live state the task is in.
    pub fn fail(&mut self, reason: impl Into<String>) {
        if !self.state.is_terminal() {
            let _ = self.transition_to(RecursionState::Failed, Some(reason.into()));
        }
    }

    /// Time from creation to the last transition.
    pub fn elapsed(&self) -> Duration {
        let end = self
            .transitions
            .last()
            .map(|t| t.timestamp)
            .unwrap_or(self.created_at);
        end.signed_duration_since(self.created_at)
            .to_std()
            .unwrap_or_default()
    }

    /// States visited, in order.
    pub fn path(&self) -> Vec<RecursionState> {
        std::iter::once(RecursionState::Created)
            .chain(self.transitions.iter().map(|t| t.to))
            .collect()
    }
}
