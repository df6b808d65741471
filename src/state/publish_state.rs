//! Publish state machine
//!
//! IDLE → EXPORTING → BUILDING_METADATA → CREATING_DEPOSITION →
//! ATTACHING_METADATA → UPLOADING → FINALIZING → DONE, with FAILED reachable
//! from every non-terminal state. A resumed publish enters the chain from
//! IDLE at the step after the furthest one already completed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{next_seq, now_rfc3339, TerminalState};

/// Publish state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PublishState {
    Idle,
    Exporting,
    BuildingMetadata,
    CreatingDeposition,
    AttachingMetadata,
    Uploading,
    Finalizing,
    Done,
    Failed,
}

impl TerminalState for PublishState {
    fn is_terminal(&self) -> bool {
        matches!(self, PublishState::Done | PublishState::Failed)
    }
}

impl PublishState {
    /// Position in the happy path; `Failed` has none.
    pub fn step_index(&self) -> Option<u8> {
        match self {
            PublishState::Idle => Some(0),
            PublishState::Exporting => Some(1),
            PublishState::BuildingMetadata => Some(2),
            PublishState::CreatingDeposition => Some(3),
            PublishState::AttachingMetadata => Some(4),
            PublishState::Uploading => Some(5),
            PublishState::Finalizing => Some(6),
            PublishState::Done => Some(7),
            PublishState::Failed => None,
        }
    }

    /// Check if transition from this state to target is valid
    pub fn can_transition_to(&self, target: PublishState) -> bool {
        use PublishState::*;
        match (self, target) {
            (s, Failed) => !s.is_terminal(),

            // Fresh publish
            (Idle, Exporting) => true,
            // Resume entry points
            (Idle, CreatingDeposition) => true,
            (Idle, AttachingMetadata) => true,
            (Idle, Uploading) => true,
            (Idle, Finalizing) => true,
            // Record found already published
            (Idle, Done) => true,

            (Exporting, BuildingMetadata) => true,
            (BuildingMetadata, CreatingDeposition) => true,
            (CreatingDeposition, AttachingMetadata) => true,
            (AttachingMetadata, Uploading) => true,
            (Uploading, Finalizing) => true,
            (Finalizing, Done) => true,

            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PublishState::Idle => "IDLE",
            PublishState::Exporting => "EXPORTING",
            PublishState::BuildingMetadata => "BUILDING_METADATA",
            PublishState::CreatingDeposition => "CREATING_DEPOSITION",
            PublishState::AttachingMetadata => "ATTACHING_METADATA",
            PublishState::Uploading => "UPLOADING",
            PublishState::Finalizing => "FINALIZING",
            PublishState::Done => "DONE",
            PublishState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for PublishState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: PublishState,
    pub to: PublishState,
    pub at: DateTime<Utc>,
    /// Monotonic sequence counter for ordering
    pub seq: u64,
}

/// Errors for publish state operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishStateError {
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: PublishState, to: PublishState },

    #[error("Publish is in terminal state {0}")]
    TerminalState(PublishState),
}

/// Tracks the current state of one publish attempt.
#[derive(Debug, Clone)]
pub struct PublishMachine {
    state: PublishState,
    furthest_completed: Option<PublishState>,
    transitions: Vec<Transition>,
}

impl Default for PublishMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PublishMachine {
    pub fn new() -> Self {
        Self {
            state: PublishState::Idle,
            furthest_completed: None,
            transitions: Vec::new(),
        }
    }

    /// Start from a journal that already records completed steps.
    pub fn resumed(furthest_completed: Option<PublishState>) -> Self {
        Self {
            furthest_completed,
            ..Self::new()
        }
    }

    pub fn state(&self) -> PublishState {
        self.state
    }

    pub fn furthest_completed(&self) -> Option<PublishState> {
        self.furthest_completed
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    /// Move to `target`. Leaving a working state marks it completed unless
    /// the target is `Failed`.
    pub fn transition(&mut self, target: PublishState) -> Result<(), PublishStateError> {
        if self.state.is_terminal() {
            return Err(PublishStateError::TerminalState(self.state));
        }
        if !self.state.can_transition_to(target) {
            return Err(PublishStateError::InvalidTransition {
                from: self.state,
                to: target,
            });
        }

        if target != PublishState::Failed && self.state != PublishState::Idle {
            self.mark_completed(self.state);
        }
        if target == PublishState::Done {
            self.mark_completed(PublishState::Done);
        }

        self.transitions.push(Transition {
            from: self.state,
            to: target,
            at: now_rfc3339(),
            seq: next_seq(),
        });
        self.state = target;
        Ok(())
    }

    /// Move to `Failed`, returning the state that failed.
    pub fn fail(&mut self) -> PublishState {
        let failed_step = self.state;
        if !self.state.is_terminal() {
            self.transitions.push(Transition {
                from: self.state,
                to: PublishState::Failed,
                at: now_rfc3339(),
                seq: next_seq(),
            });
            self.state = PublishState::Failed;
        }
        failed_step
    }

    fn mark_completed(&mut self, step: PublishState) {
        let further = match (self.furthest_completed.and_then(|s| s.step_index()), step.step_index()) {
            (Some(current), Some(candidate)) => candidate > current,
            (None, Some(_)) => true,
            _ => false,
        };
        if further {
            self.furthest_completed = Some(step);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut machine = PublishMachine::new();
        for next in [
            PublishState::Exporting,
            PublishState::BuildingMetadata,
            PublishState::CreatingDeposition,
            PublishState::AttachingMetadata,
            PublishState::Uploading,
            PublishState::Finalizing,
        ] {
            machine.transition(next).unwrap();
        }
        assert_eq!(machine.furthest_completed(), Some(PublishState::Uploading));

        machine.transition(PublishState::Done).unwrap();
        assert_eq!(machine.state(), PublishState::Done);
        assert_eq!(machine.furthest_completed(), Some(PublishState::Done));
        assert_eq!(machine.transitions().len(), 7);
    }

    #[test]
    fn test_steps_cannot_be_skipped() {
        let mut machine = PublishMachine::new();
        machine.transition(PublishState::Exporting).unwrap();
        let err = machine.transition(PublishState::Finalizing).unwrap_err();
        assert_eq!(
            err,
            PublishStateError::InvalidTransition {
                from: PublishState::Exporting,
                to: PublishState::Finalizing,
            }
        );
        assert!(!PublishState::Uploading.can_transition_to(PublishState::Done));
        assert!(!PublishState::CreatingDeposition.can_transition_to(PublishState::Uploading));
    }

    #[test]
    fn test_fail_records_failed_step() {
        let mut machine = PublishMachine::new();
        machine.transition(PublishState::Exporting).unwrap();
        machine.transition(PublishState::BuildingMetadata).unwrap();

        assert_eq!(machine.fail(), PublishState::BuildingMetadata);
        assert_eq!(machine.state(), PublishState::Failed);
        assert_eq!(machine.furthest_completed(), Some(PublishState::Exporting));
        assert_eq!(
            machine.transition(PublishState::CreatingDeposition),
            Err(PublishStateError::TerminalState(PublishState::Failed))
        );
    }

    #[test]
    fn test_resume_keeps_furthest_step() {
        let mut machine = PublishMachine::resumed(Some(PublishState::AttachingMetadata));
        machine.transition(PublishState::Uploading).unwrap();
        assert_eq!(machine.fail(), PublishState::Uploading);
        assert_eq!(machine.furthest_completed(), Some(PublishState::AttachingMetadata));
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&PublishState::CreatingDeposition).unwrap();
        assert_eq!(json, "\"CREATING_DEPOSITION\"");
        assert_eq!(PublishState::AttachingMetadata.to_string(), "ATTACHING_METADATA");
    }
}
