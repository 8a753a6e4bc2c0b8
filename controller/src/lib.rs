//! VCC lane controller
//!
//! Coordinates the nine per-block devices of one VCC lane: ordered scan
//! configuration with rollback, scan start/stop fan-out, abort, reset and
//! subarray membership, with lane-level obs-state and health rollup.

pub mod coordinator;

pub use coordinator::{LaneController, LaneDevices};
