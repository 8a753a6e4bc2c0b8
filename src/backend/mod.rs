//! Back-end adapters for a single IP block
//!
//! Every block talks to exactly one back-end, selected at construction:
//! a pure in-process simulator, an HTTP-reachable emulator, or the
//! firmware register driver. The three share one operation surface so
//! the block manager never cares which it owns.

mod emulator;
mod firmware;
mod simulator;

pub use emulator::EmulatorBackend;
pub use firmware::{FileRegisterDriver, FirmwareBackend, RegisterDriver};
pub use simulator::SimulatorBackend;

use crate::blocks::BlockKind;
use anyhow::{bail, Result};
use serde_json::Value;
use std::path::PathBuf;
use vcc_shared::ResultCode;

/// Result of one back-end operation
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub code: ResultCode,
    pub message: String,
}

impl BackendResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            code: ResultCode::Ok,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            code: ResultCode::Failed,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == ResultCode::Ok
    }
}

/// Raw block telemetry as returned by `status`
pub type StatusReport = serde_json::Map<String, Value>;

/// Construction parameters selecting and locating the back-end
#[derive(Debug, Clone)]
pub struct BackendSettings {
    /// Identifier of the IP block within the lane (also the URL path segment)
    pub block_id: String,
    /// simulation ⇒ simulator, regardless of emulation
    pub simulation_mode: bool,
    /// ¬simulation ∧ emulation ⇒ emulator
    pub emulation_mode: bool,
    /// Base URL of the emulator host, without scheme
    pub emulator_base_url: String,
    /// Emulator instance identifier; required when emulation is requested
    pub emulator_id: Option<String>,
    /// Directory holding the packaged firmware image and driver bindings
    pub bitstream_dir: PathBuf,
}

impl BackendSettings {
    /// Settings for a simulator-backed block, the default for tests
    pub fn simulated(block_id: impl Into<String>) -> Self {
        Self {
            block_id: block_id.into(),
            simulation_mode: true,
            emulation_mode: false,
            emulator_base_url: String::new(),
            emulator_id: None,
            bitstream_dir: PathBuf::new(),
        }
    }
}

/// The back-end bound to one IP block.
///
/// A tagged variant rather than a trait object: the manager owns it
/// exclusively and dispatch is static.
pub enum Backend {
    Simulator(SimulatorBackend),
    Emulator(EmulatorBackend),
    Firmware(FirmwareBackend),
}

impl Backend {
    /// Bind the back-end described by `settings`.
    ///
    /// Selection rule: simulation ⇒ simulator; ¬simulation ∧ emulation ⇒
    /// emulator; otherwise ⇒ firmware. A missing emulator id when
    /// emulation is requested is a `not-implemented` construction failure.
    /// Firmware driver load failures are fatal to device initialisation.
    pub fn from_settings(settings: &BackendSettings, kind: BlockKind) -> Result<Self> {
        if settings.simulation_mode {
            return Ok(Backend::Simulator(SimulatorBackend::new(kind)));
        }
        if settings.emulation_mode {
            let emulator_id = match &settings.emulator_id {
                Some(id) => id.clone(),
                None => bail!(
                    "not-implemented: emulation requested for {} without an emulator id",
                    settings.block_id
                ),
            };
            return Ok(Backend::Emulator(EmulatorBackend::new(
                &settings.emulator_base_url,
                &emulator_id,
                &settings.block_id,
            )?));
        }
        let firmware = FirmwareBackend::load(&settings.bitstream_dir, &settings.block_id)?;
        Ok(Backend::Firmware(firmware))
    }

    /// Reset the block to a known-good state
    pub async fn recover(&mut self) -> BackendResponse {
        match self {
            Backend::Simulator(b) => b.recover(),
            Backend::Emulator(b) => b.recover().await,
            Backend::Firmware(b) => b.recover().await,
        }
    }

    /// Apply a block configuration
    pub async fn configure(&mut self, payload: &Value) -> BackendResponse {
        match self {
            Backend::Simulator(b) => b.configure(payload),
            Backend::Emulator(b) => b.configure(payload).await,
            Backend::Firmware(b) => b.configure(payload).await,
        }
    }

    /// Revert a configuration, optionally scoped by a payload
    pub async fn deconfigure(&mut self, payload: Option<&Value>) -> BackendResponse {
        match self {
            Backend::Simulator(b) => b.deconfigure(payload),
            Backend::Emulator(b) => b.deconfigure(payload).await,
            Backend::Firmware(b) => b.deconfigure(payload).await,
        }
    }

    /// Enter runtime operation
    pub async fn start(&mut self) -> BackendResponse {
        match self {
            Backend::Simulator(b) => b.start(),
            Backend::Emulator(b) => b.start().await,
            Backend::Firmware(b) => b.start().await,
        }
    }

    /// Leave runtime operation
    pub async fn stop(&mut self, force: bool) -> BackendResponse {
        match self {
            Backend::Simulator(b) => b.stop(force),
            Backend::Emulator(b) => b.stop(force).await,
            Backend::Firmware(b) => b.stop(force).await,
        }
    }

    /// Fetch block telemetry, optionally clearing latched counters
    pub async fn status(&mut self, clear: bool) -> (BackendResponse, StatusReport) {
        match self {
            Backend::Simulator(b) => b.status(clear),
            Backend::Emulator(b) => b.status(clear).await,
            Backend::Firmware(b) => b.status(clear).await,
        }
    }
}
