//! Worker state machine.

use serde::{Deserialize, Serialize};

/// Why a worker stopped. Every run ends in exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// Reached the configured action cap.
    Finished,
    /// The session driver failed.
    DriverError,
    /// The exit signal was observed.
    Forced,
    /// Any other failure.
    Unknown,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Finished => "finished",
            Self::DriverError => "driver_error",
            Self::Forced => "forced",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// State of a worker session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    LoggingIn,
    SwitchingTarget,
    OpeningResource,
    Voting,
    Terminated(ExitReason),
}

impl WorkerState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: WorkerState) -> bool {
        use WorkerState::*;

        match (self, target) {
            (Terminated(_), _) => false,
            (_, Terminated(_)) => true,
            (Idle, LoggingIn)
            | (LoggingIn, SwitchingTarget)
            | (SwitchingTarget, OpeningResource)
            | (OpeningResource, Voting) => true,
            _ => false,
        }
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        match self {
            Self::Terminated(reason) => Some(*reason),
            _ => None,
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::LoggingIn => write!(f, "logging_in"),
            Self::SwitchingTarget => write!(f, "switching_target"),
            Self::OpeningResource => write!(f, "opening_resource"),
            Self::Voting => write!(f, "voting"),
            Self::Terminated(reason) => write!(f, "terminated({reason})"),
        }
    }
}
