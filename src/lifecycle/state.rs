use crate::error::InvalidStateError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle states of a server instance.
///
/// The discriminant order follows lifecycle progression, so states compare
/// with `<` along `Created < Starting < Running < Stopping < Stopped`.
/// `Failed` sorts last but is reached as a shortcut from `Created` or
/// `Starting`. `Stopped` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum LifecycleState {
    /// Instance built, `start` not called yet
    Created = 0,
    /// Startup in progress, resources being acquired
    Starting = 1,
    /// Accepting connections
    Running = 2,
    /// Graceful shutdown in progress
    Stopping = 3,
    /// Fully stopped (terminal)
    Stopped = 4,
    /// Failed to start or hit a fatal error (terminal)
    Failed = 5,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 6] = [
        LifecycleState::Created,
        LifecycleState::Starting,
        LifecycleState::Running,
        LifecycleState::Stopping,
        LifecycleState::Stopped,
        LifecycleState::Failed,
    ];

    /// Human-readable label
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Created => "created",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Failed => "failed",
        }
    }

    /// Label for a raw stored value, `"unknown"` when it is out of range.
    pub fn label(raw: u8) -> &'static str {
        match LifecycleState::try_from(raw) {
            Ok(state) => state.as_str(),
            Err(_) => "unknown",
        }
    }

    /// No transition leaves a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Stopped | LifecycleState::Failed)
    }

    pub fn is_valid_raw(raw: u8) -> bool {
        LifecycleState::try_from(raw).is_ok()
    }

    pub(crate) fn as_raw(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for LifecycleState {
    type Error = InvalidStateError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(LifecycleState::Created),
            1 => Ok(LifecycleState::Starting),
            2 => Ok(LifecycleState::Running),
            3 => Ok(LifecycleState::Stopping),
            4 => Ok(LifecycleState::Stopped),
            5 => Ok(LifecycleState::Failed),
            _ => Err(InvalidStateError { value }),
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
