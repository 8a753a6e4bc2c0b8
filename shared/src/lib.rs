//! VCC Lane Shared Types
//!
//! This crate provides the types shared between the per-block device
//! engine and the lane controller: result codes, task status, health
//! state, the observation state machine and the scan configuration
//! schema.

pub mod codes;
pub mod config;
pub mod obs_state;

pub use codes::{AdminMode, HealthState, ObsState, ResultCode, TaskStatus};
pub use obs_state::{ObsAction, ObsStateModel, StateModelError};

use std::time::{SystemTime, UNIX_EPOCH};

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Timing and sizing parameters for the lane
pub mod timing {
    /// Minimum admissible health-poll period
    pub const MIN_POLL_PERIOD_MS: u64 = 100;

    /// Default health-poll period
    pub const DEFAULT_POLL_PERIOD_MS: u64 = 1000;

    /// Timeout for a single back-end request (emulator HTTP, register I/O)
    pub const BACKEND_REQUEST_TIMEOUT_MS: u64 = 5000;

    /// Overall bound on waiting for subordinate terminal results during ObsReset
    pub const OBS_RESET_WAIT_TIMEOUT_MS: u64 = 10000;

    /// Maximum number of queued tasks per device
    pub const TASK_QUEUE_DEPTH: usize = 32;

    /// How many terminal task records are retained for late subscribers
    pub const TASK_RETENTION: usize = 64;

    /// Highest subarray id a lane can be assigned to
    pub const MAX_SUBARRAY_ID: u16 = 16;
}
