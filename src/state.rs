// ABOUTME: Container lifecycle states and the transition rules between them.
// ABOUTME: Shared by the dispatcher (operation legality) and the poller (reconciliation).

use serde::Serialize;
use std::fmt;

/// Normalized lifecycle state of a container.
///
/// `Exited(None)` means the container is gone or stopped but no exit code was
/// observed. `Unknown` is what a handle reads as while its backend cannot be
/// reached; it is never terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "exit_code", rename_all = "lowercase")]
pub enum LifecycleState {
    Created,
    Running,
    Paused,
    Exited(Option<i64>),
    Unknown,
}

impl LifecycleState {
    pub fn is_exited(&self) -> bool {
        matches!(self, Self::Exited(_))
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    /// Whether a handle may move from `self` to `next` without a re-create.
    ///
    /// Moves are forward along created, running/paused, exited. Running and
    /// paused alternate freely. Entering `Unknown` is always allowed; leaving it
    /// must be judged against the last confirmed state by the caller.
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        match (self, next) {
            (_, Unknown) => true,
            (Unknown, _) => true,
            (Created, _) => true,
            (Running | Paused, Running | Paused | Exited(_)) => true,
            (Running | Paused, Created) => false,
            (Exited(_), Exited(_)) => true,
            (Exited(_), _) => false,
        }
    }

    /// Combine an observed state with the cached one, keeping a known exit
    /// code when the observation carries none.
    pub fn merge_observed(&self, observed: LifecycleState) -> LifecycleState {
        match (self, observed) {
            (Self::Exited(Some(code)), Self::Exited(None)) => Self::Exited(Some(*code)),
            _ => observed,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::Running => f.write_str("running"),
            Self::Paused => f.write_str("paused"),
            Self::Exited(Some(code)) => write!(f, "exited ({code})"),
            Self::Exited(None) => f.write_str("exited"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

/// State-changing operations the dispatcher gates on the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Start,
    Stop,
    Signal,
    Pause,
    Unpause,
    Remove,
    ForceRemove,
    Exec,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Signal => "signal",
            Self::Pause => "pause",
            Self::Unpause => "unpause",
            Self::Remove => "remove",
            Self::ForceRemove => "force remove",
            Self::Exec => "exec",
        }
    }

    /// Whether the operation may be issued against a handle in `state`.
    pub fn allowed_from(&self, state: LifecycleState) -> bool {
        use LifecycleState::*;
        match self {
            Self::Start => matches!(state, Created),
            Self::Stop | Self::Signal => matches!(state, Running | Paused),
            Self::Pause | Self::Exec => matches!(state, Running),
            Self::Unpause => matches!(state, Paused),
            Self::Remove => matches!(state, Created | Exited(_)),
            Self::ForceRemove => true,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
