//! Lifecycle of the cyclic measuring loop.
//!
//! The loop has exactly two states: RUNNING while it is scheduling wake-ups,
//! and STOPPED once the iteration budget is spent or shutdown was observed.
//! STOPPED is terminal.

use crate::error::{LatError, LatResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Loop states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoopState {
    /// Scheduling and measuring wake-ups.
    #[default]
    Running,
    /// Finished; no further samples are produced.
    Stopped,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "RUNNING"),
            Self::Stopped => write!(f, "STOPPED"),
        }
    }
}

impl LoopState {
    /// Check if a transition to `target` is valid from the current state.
    #[must_use]
    pub fn can_transition_to(&self, target: LoopState) -> bool {
        matches!((self, target), (Self::Running, Self::Stopped))
    }

    /// Returns true once the loop can no longer produce samples.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The configured number of periods elapsed.
    IterationsExhausted,
    /// Shutdown was requested from outside the loop.
    ShutdownRequested,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IterationsExhausted => write!(f, "iterations exhausted"),
            Self::ShutdownRequested => write!(f, "shutdown requested"),
        }
    }
}

/// State holder for the loop with the reason it stopped.
#[derive(Debug, Clone, Default)]
pub struct LoopStateMachine {
    current: LoopState,
    stop_reason: Option<StopReason>,
}

impl LoopStateMachine {
    /// Create a machine in RUNNING.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> LoopState {
        self.current
    }

    /// Reason for stopping, once stopped.
    #[must_use]
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    /// Transition RUNNING → STOPPED.
    ///
    /// # Errors
    ///
    /// Returns an error when already stopped.
    pub fn stop(&mut self, reason: StopReason) -> LatResult<()> {
        if self.current.can_transition_to(LoopState::Stopped) {
            self.current = LoopState::Stopped;
            self.stop_reason = Some(reason);
            Ok(())
        } else {
            Err(LatError::InvalidStateTransition {
                from: self.current.to_string(),
                to: LoopState::Stopped.to_string(),
            })
        }
    }
}
