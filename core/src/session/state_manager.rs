//! Session State Machine - single source of truth for valid session transitions
//!
//! State diagram:
//! ```text
//! Idle ──Begin──> Validating ──Validated──> Active ──End──> Inferring ──Finished──> Idle
//!                     │                       │
//!                  [Cancel]                [Cancel]
//!                     └────────> Idle <───────┘
//!
//! any state ──Fail──> Error ──Acknowledge──> Idle
//! ```

use std::sync::Mutex;

/// Events that can trigger state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum SessionEvent {
    /// A caller asked to open a session
    Begin,
    /// Model and runtime are validated, capture may start
    Validated,
    /// Capture finished, run inference
    End,
    /// Inference returned a transcript
    Finished,
    /// Unrecoverable failure
    Fail,
    /// Caller saw the error
    Acknowledge,
    /// Abandon the session without inference
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum SessionState {
    Idle,
    Validating,
    /// Capturing audio
    Active,
    Inferring,
    Error,
}

impl SessionState {
    pub fn is_busy(self) -> bool {
        !matches!(self, Self::Idle | Self::Error)
    }
}

/// Result of a successful state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionResult {
    Changed { from: SessionState, to: SessionState },
    /// Event was valid but state didn't change
    Unchanged,
}

/// Reason a transition was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{attempted_event} event rejected in {current_state} state")]
pub struct TransitionRejection {
    pub current_state: SessionState,
    pub attempted_event: SessionEvent,
}

/// Thread-safe session state manager
#[derive(Debug)]
pub struct SessionStateManager {
    state: Mutex<SessionState>,
}

impl SessionStateManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SessionState::Idle),
        }
    }

    pub fn current(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    pub fn is_busy(&self) -> bool {
        self.current().is_busy()
    }

    /// Attempt a state transition based on an event
    ///
    /// This is the ONLY way to change state.
    pub fn transition(&self, event: SessionEvent) -> Result<TransitionResult, TransitionRejection> {
        let mut state = self.state.lock().unwrap();
        let current = *state;

        match compute_transition(current, event) {
            Some(next) if next == current => Ok(TransitionResult::Unchanged),
            Some(next) => {
                *state = next;
                Ok(TransitionResult::Changed {
                    from: current,
                    to: next,
                })
            }
            None => Err(TransitionRejection {
                current_state: current,
                attempted_event: event,
            }),
        }
    }
}

impl Default for SessionStateManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Pure function: the state `event` leads to from `current`, if allowed
fn compute_transition(current: SessionState, event: SessionEvent) -> Option<SessionState> {
    use SessionEvent as E;
    use SessionState as S;

    match (current, event) {
        (_, E::Fail) => Some(S::Error),
        (S::Idle, E::Begin) => Some(S::Validating),
        (S::Validating, E::Validated) => Some(S::Active),
        (S::Validating | S::Active, E::Cancel) => Some(S::Idle),
        (S::Active, E::End) => Some(S::Inferring),
        (S::Inferring, E::Finished) => Some(S::Idle),
        (S::Error, E::Acknowledge) => Some(S::Idle),
        _ => None,
    }
}
