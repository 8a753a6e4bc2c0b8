//! IP-block managers
//!
//! One manager per IP block of the lane. A manager owns its back-end
//! exclusively, validates caller payloads against the block's schema,
//! translates raw adapter results into a uniform (code, message) pair and
//! supplies the block-specific status-to-health mapping.

pub mod channeliser;

use crate::backend::{Backend, BackendSettings, StatusReport};
use crate::health::{expect_equal, HealthMapping, StatusPoller};
use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::warn;
use vcc_shared::{HealthState, ResultCode};

/// The IP blocks making up one VCC lane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    Mac,
    PacketValidator,
    WidebandInputBuffer,
    WidebandFrequencyShifter,
    Channeliser,
    FrequencySliceSelector,
    PowerMeter,
    Packetizer,
}

impl BlockKind {
    /// Identifier used in URLs, bitstream directories and log lines
    pub fn block_id(self) -> &'static str {
        match self {
            BlockKind::Mac => "mac",
            BlockKind::PacketValidator => "packet_validator",
            BlockKind::WidebandInputBuffer => "wideband_input_buffer",
            BlockKind::WidebandFrequencyShifter => "wideband_frequency_shifter",
            BlockKind::Channeliser => "channeliser",
            BlockKind::FrequencySliceSelector => "frequency_slice_selector",
            BlockKind::PowerMeter => "power_meter",
            BlockKind::Packetizer => "packetizer",
        }
    }

    /// Blocks whose health is polled while they run
    pub fn is_monitored(self) -> bool {
        matches!(
            self,
            BlockKind::Mac | BlockKind::PacketValidator | BlockKind::WidebandInputBuffer
        )
    }

    /// The ingress blocks take configuration only through start/stop; the
    /// signal-path blocks are configured but never started directly.
    pub fn supports_configure(self) -> bool {
        !matches!(self, BlockKind::Mac | BlockKind::PacketValidator)
    }

    pub fn supports_runtime(self) -> bool {
        matches!(
            self,
            BlockKind::Mac | BlockKind::PacketValidator | BlockKind::WidebandInputBuffer
        )
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.block_id())
    }
}

/// Per-block wrapper around the back-end adapter
pub struct BlockManager {
    kind: BlockKind,
    backend: tokio::sync::Mutex<Backend>,
    /// Dish id the input buffer was configured to expect, checked against
    /// the stream metadata by the health mapping
    expected_dish_id: Arc<Mutex<Option<String>>>,
}

impl BlockManager {
    /// Bind the back-end described by `settings` and wrap it
    pub fn new(settings: &BackendSettings, kind: BlockKind) -> Result<Self> {
        let backend = Backend::from_settings(settings, kind)?;
        Ok(Self {
            kind,
            backend: tokio::sync::Mutex::new(backend),
            expected_dish_id: Arc::new(Mutex::new(None)),
        })
    }

    /// Simulator-backed manager, the default for tests
    pub fn simulated(kind: BlockKind) -> Self {
        Self::new(&BackendSettings::simulated(kind.block_id()), kind)
            .expect("simulator construction is infallible")
    }

    /// Wrap an already-bound back-end
    pub fn with_backend(kind: BlockKind, backend: Backend) -> Self {
        Self {
            kind,
            backend: tokio::sync::Mutex::new(backend),
            expected_dish_id: Arc::new(Mutex::new(None)),
        }
    }

    pub fn kind(&self) -> BlockKind {
        self.kind
    }

    pub async fn recover(&self) -> (ResultCode, String) {
        let resp = self.backend.lock().await.recover().await;
        (resp.code, resp.message)
    }

    /// Validate and apply a configuration.
    ///
    /// Schema violations are `Rejected` and never reach the back-end; the
    /// channeliser splits its payload into per-gain sub-configurations.
    pub async fn configure(&self, payload: &Value) -> (ResultCode, String) {
        if !payload.is_object() {
            return (
                ResultCode::Rejected,
                vcc_shared::config::SchemaError::new("payload is not an object").to_string(),
            );
        }

        match self.kind {
            BlockKind::Channeliser => channeliser::configure(self, payload).await,
            BlockKind::WidebandInputBuffer => {
                if let Some(dish) = payload.get("expected_dish_id").and_then(Value::as_str) {
                    *self.expected_dish_id.lock().unwrap() = Some(dish.to_string());
                }
                self.apply_configure(payload).await
            }
            _ => self.apply_configure(payload).await,
        }
    }

    /// Forward one configuration payload to the back-end
    pub(crate) async fn apply_configure(&self, payload: &Value) -> (ResultCode, String) {
        let resp = self.backend.lock().await.configure(payload).await;
        if !resp.is_ok() {
            warn!("{} configure failed: {}", self.kind, resp.message);
        }
        (resp.code, resp.message)
    }

    pub async fn deconfigure(&self, payload: Option<&Value>) -> (ResultCode, String) {
        if self.kind == BlockKind::WidebandInputBuffer {
            *self.expected_dish_id.lock().unwrap() = None;
        }
        let resp = self.backend.lock().await.deconfigure(payload).await;
        (resp.code, resp.message)
    }

    pub async fn start(&self) -> (ResultCode, String) {
        let resp = self.backend.lock().await.start().await;
        (resp.code, resp.message)
    }

    pub async fn stop(&self, force: bool) -> (ResultCode, String) {
        let resp = self.backend.lock().await.stop(force).await;
        (resp.code, resp.message)
    }

    pub async fn status(&self, clear: bool) -> (ResultCode, StatusReport, String) {
        let (resp, report) = self.backend.lock().await.status(clear).await;
        (resp.code, report, resp.message)
    }

    /// Mutable access to the simulator, for driving status in tests
    #[cfg(test)]
    pub(crate) async fn with_simulator<R>(
        &self,
        f: impl FnOnce(&mut crate::backend::SimulatorBackend) -> R,
    ) -> R {
        match &mut *self.backend.lock().await {
            Backend::Simulator(sim) => f(sim),
            _ => panic!("not a simulator backend"),
        }
    }

    /// Poll closure handed to the health monitor
    pub fn status_poller(self: &Arc<Self>) -> StatusPoller {
        let manager = self.clone();
        Arc::new(move || {
            let manager = manager.clone();
            Box::pin(async move {
                let (code, report, message) = manager.status(false).await;
                if code == ResultCode::Ok {
                    Ok(report)
                } else {
                    Err(message)
                }
            })
        })
    }

    /// Block-specific translation from raw status to per-check verdicts
    pub fn health_mapping(&self) -> HealthMapping {
        match self.kind {
            BlockKind::Mac => Arc::new(|report, memo| {
                let mut verdicts = HashMap::new();
                for key in ["phys_ready", "link_up"] {
                    let value = report.get(key).and_then(Value::as_bool).unwrap_or(false);
                    verdicts.insert(key.to_string(), memo.observe(key, value));
                }
                let losses = report.get("rx_loss_count").and_then(Value::as_u64).unwrap_or(0);
                let verdict = if losses > 0 { HealthState::Degraded } else { HealthState::Ok };
                verdicts.insert("rx_loss_count".into(), verdict);
                verdicts
            }),
            BlockKind::PacketValidator => Arc::new(|report, _| {
                let mut verdicts = HashMap::new();
                let link_failure = report
                    .get("link_failure")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                verdicts.insert(
                    "link_failure".into(),
                    if link_failure { HealthState::Failed } else { HealthState::Ok },
                );
                let crc_errors = report
                    .get("packet_crc_error_count")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                verdicts.insert(
                    "packet_crc_error_count".into(),
                    if crc_errors > 0 { HealthState::Degraded } else { HealthState::Ok },
                );
                verdicts
            }),
            BlockKind::WidebandInputBuffer => {
                let expected_dish_id = self.expected_dish_id.clone();
                Arc::new(move |report, memo| {
                    let mut verdicts = HashMap::new();
                    let rx_ready = report.get("rx_ready").and_then(Value::as_bool).unwrap_or(false);
                    verdicts.insert("rx_ready".into(), memo.observe("rx_ready", rx_ready));
                    let error = report.get("error").and_then(Value::as_bool).unwrap_or(false);
                    verdicts.insert(
                        "error".into(),
                        if error { HealthState::Failed } else { HealthState::Ok },
                    );
                    let silent_seconds = report
                        .get("loss_of_signal_seconds")
                        .and_then(Value::as_u64)
                        .unwrap_or(0);
                    verdicts.insert(
                        "loss_of_signal_seconds".into(),
                        if silent_seconds > 0 { HealthState::Degraded } else { HealthState::Ok },
                    );
                    if let Some(expected) = expected_dish_id.lock().unwrap().as_deref() {
                        let meta = report
                            .get("meta_dish_id")
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        // The stream is allowed to be silent before the
                        // first frame arrives
                        if !meta.is_empty() {
                            verdicts.insert(
                                "meta_dish_id".into(),
                                expect_equal("meta_dish_id", &expected, &meta),
                            );
                        }
                    }
                    verdicts
                })
            }
            _ => Arc::new(|_, _| HashMap::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::EdgeMemo;
    use serde_json::json;

    #[tokio::test]
    async fn test_uniform_result_shape() {
        let manager = BlockManager::simulated(BlockKind::Mac);
        let (code, message) = manager.recover().await;
        assert_eq!(code, ResultCode::Ok);
        assert!(message.contains("mac"));

        let (code, _) = manager.start().await;
        assert_eq!(code, ResultCode::Ok);
        let (code, _) = manager.stop(false).await;
        assert_eq!(code, ResultCode::Ok);
    }

    #[tokio::test]
    async fn test_non_object_payload_rejected() {
        let manager = BlockManager::simulated(BlockKind::Packetizer);
        let (code, message) = manager.configure(&json!([1, 2, 3])).await;
        assert_eq!(code, ResultCode::Rejected);
        assert_eq!(
            message,
            "Validation error: argin doesn't match the required schema"
        );
    }

    #[tokio::test]
    async fn test_status_returns_canned_payload() {
        let manager = BlockManager::simulated(BlockKind::WidebandInputBuffer);
        let (code, report, _) = manager.status(false).await;
        assert_eq!(code, ResultCode::Ok);
        assert_eq!(report["rx_ready"], json!(true));
    }

    #[tokio::test]
    async fn test_mac_mapping_degrades_on_losses() {
        let manager = BlockManager::simulated(BlockKind::Mac);
        let mapping = manager.health_mapping();
        let mut memo = EdgeMemo::default();

        let (_, report, _) = manager.status(false).await;
        let verdicts = mapping(&report, &mut memo);
        assert_eq!(verdicts["link_up"], HealthState::Ok);
        assert_eq!(verdicts["rx_loss_count"], HealthState::Ok);

        manager
            .with_simulator(|sim| sim.set_status_field("rx_loss_count", json!(2)))
            .await;
        let (_, report, _) = manager.status(false).await;
        let verdicts = mapping(&report, &mut memo);
        assert_eq!(verdicts["rx_loss_count"], HealthState::Degraded);
    }

    #[tokio::test]
    async fn test_input_buffer_dish_id_check() {
        let manager = BlockManager::simulated(BlockKind::WidebandInputBuffer);
        manager
            .configure(&json!({ "expected_dish_id": "SKA063", "expected_sample_rate": 3_960_000_000u64 }))
            .await;
        let mapping = manager.health_mapping();
        let mut memo = EdgeMemo::default();

        // No metadata yet: no verdict for the dish id
        let (_, report, _) = manager.status(false).await;
        let verdicts = mapping(&report, &mut memo);
        assert!(!verdicts.contains_key("meta_dish_id"));

        manager
            .with_simulator(|sim| sim.set_status_field("meta_dish_id", json!("SKA100")))
            .await;
        let (_, report, _) = manager.status(false).await;
        let verdicts = mapping(&report, &mut memo);
        assert_eq!(verdicts["meta_dish_id"], HealthState::Failed);
    }

    #[tokio::test]
    async fn test_deconfigure_clears_expected_dish_id() {
        let manager = BlockManager::simulated(BlockKind::WidebandInputBuffer);
        manager
            .configure(&json!({ "expected_dish_id": "SKA063" }))
            .await;
        manager.deconfigure(None).await;
        assert!(manager.expected_dish_id.lock().unwrap().is_none());
    }
}
