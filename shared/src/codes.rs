//! Result codes, task status and lifecycle enums shared across the lane

use serde::{Deserialize, Serialize};

/// Result code returned by every command and carried by terminal task updates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ResultCode {
    Ok = 0,
    Queued = 1,
    Started = 2,
    Failed = 3,
    Rejected = 4,
    NotAllowed = 5,
    Aborted = 6,
    NotImplemented = 7,
}

impl ResultCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Lifecycle status of a submitted task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Queued,
    InProgress,
    Completed,
    Aborted,
    Failed,
    Rejected,
    NotAllowed,
}

impl TaskStatus {
    /// A terminal status ends the task's callback sequence
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Queued | TaskStatus::InProgress)
    }
}

/// Per-check and aggregate health verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HealthState {
    Ok,
    Degraded,
    Failed,
    Unknown,
}

impl HealthState {
    /// Aggregation order, worst first
    pub const SEVERITY_ORDER: [HealthState; 4] = [
        HealthState::Failed,
        HealthState::Degraded,
        HealthState::Unknown,
        HealthState::Ok,
    ];
}

/// Administrative mode of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminMode {
    Online,
    Offline,
    Engineering,
    NotFitted,
    Reserved,
}

/// Internal observation state, including refinement states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObsState {
    Idle,
    Configuring,
    Ready,
    Starting,
    Scanning,
    Stopping,
    Aborting,
    Aborted,
    Resetting,
    Fault,
}

impl ObsState {
    /// Collapse internal refinement states to the externally published state.
    ///
    /// The mapping is surjective: `Starting` and `Stopping` publish as
    /// `Ready`, everything else publishes as itself.
    pub fn published(self) -> ObsState {
        match self {
            ObsState::Starting | ObsState::Stopping => ObsState::Ready,
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_code_values() {
        assert_eq!(ResultCode::Ok.as_u8(), 0);
        assert_eq!(ResultCode::Queued.as_u8(), 1);
        assert_eq!(ResultCode::Started.as_u8(), 2);
        assert_eq!(ResultCode::Failed.as_u8(), 3);
        assert_eq!(ResultCode::Rejected.as_u8(), 4);
        assert_eq!(ResultCode::NotAllowed.as_u8(), 5);
        assert_eq!(ResultCode::Aborted.as_u8(), 6);
        assert_eq!(ResultCode::NotImplemented.as_u8(), 7);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Aborted.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Rejected.is_terminal());
        assert!(TaskStatus::NotAllowed.is_terminal());
    }

    #[test]
    fn test_published_state_collapse() {
        assert_eq!(ObsState::Starting.published(), ObsState::Ready);
        assert_eq!(ObsState::Stopping.published(), ObsState::Ready);
        assert_eq!(ObsState::Scanning.published(), ObsState::Scanning);
        assert_eq!(ObsState::Idle.published(), ObsState::Idle);
        assert_eq!(ObsState::Fault.published(), ObsState::Fault);
    }
}
