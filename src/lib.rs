//! VCC per-block device engine
//!
//! One `DeviceCore` wraps a single IP block of the lane through an
//! interchangeable back-end (simulator, emulator or firmware) and exposes
//! the long-running command surface: admission against the observation
//! state model, bounded task execution with cooperative abort, health
//! polling and attribute publication.

pub mod attribute;
pub mod backend;
pub mod blocks;
pub mod device;
pub mod executor;
pub mod health;
