//! In-process simulator back-end
//!
//! Every operation succeeds; `status` returns a block-specific canned
//! payload. Used for deterministic tests and development without hardware.

use super::{BackendResponse, StatusReport};
use crate::blocks::BlockKind;
use serde_json::{json, Value};

/// Pure in-memory model of one IP block
pub struct SimulatorBackend {
    kind: BlockKind,
    status: StatusReport,
    configured: Option<Value>,
    running: bool,
}

impl SimulatorBackend {
    pub fn new(kind: BlockKind) -> Self {
        Self {
            kind,
            status: canned_status(kind),
            configured: None,
            running: false,
        }
    }

    /// The configuration last applied, if any
    pub fn configured(&self) -> Option<&Value> {
        self.configured.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Overwrite one status field, for driving health scenarios in tests
    pub fn set_status_field(&mut self, key: &str, value: Value) {
        self.status.insert(key.to_string(), value);
    }

    pub fn recover(&mut self) -> BackendResponse {
        self.configured = None;
        self.running = false;
        self.status = canned_status(self.kind);
        BackendResponse::ok(format!("{} recovered", self.kind))
    }

    pub fn configure(&mut self, payload: &Value) -> BackendResponse {
        self.configured = Some(payload.clone());
        BackendResponse::ok(format!("{} configured", self.kind))
    }

    pub fn deconfigure(&mut self, _payload: Option<&Value>) -> BackendResponse {
        self.configured = None;
        BackendResponse::ok(format!("{} deconfigured", self.kind))
    }

    pub fn start(&mut self) -> BackendResponse {
        self.running = true;
        BackendResponse::ok(format!("{} started", self.kind))
    }

    pub fn stop(&mut self, _force: bool) -> BackendResponse {
        self.running = false;
        BackendResponse::ok(format!("{} stopped", self.kind))
    }

    pub fn status(&mut self, clear: bool) -> (BackendResponse, StatusReport) {
        let report = self.status.clone();
        if clear {
            clear_counters(&mut self.status);
        }
        (BackendResponse::ok("status read"), report)
    }
}

/// Reset latched counters, keeping readiness fields intact
fn clear_counters(status: &mut StatusReport) {
    for (_, value) in status.iter_mut() {
        if value.is_u64() || value.is_i64() {
            *value = json!(0);
        }
    }
}

/// Block-specific telemetry shape at power-on
fn canned_status(kind: BlockKind) -> StatusReport {
    let value = match kind {
        BlockKind::Mac => json!({
            "phys_ready": true,
            "link_up": true,
            "rx_cnt": 0,
            "tx_cnt": 0,
            "rx_loss_count": 0,
        }),
        BlockKind::PacketValidator => json!({
            "link_failure": false,
            "packet_crc_error_count": 0,
            "packet_ethertype_error_count": 0,
            "packet_seq_error_count": 0,
        }),
        BlockKind::WidebandInputBuffer => json!({
            "rx_ready": true,
            "error": false,
            "rx_sample_rate": 0,
            "loss_of_signal_seconds": 0,
            "meta_dish_id": "",
        }),
        BlockKind::WidebandFrequencyShifter => json!({
            "shift_frequency": 0,
        }),
        BlockKind::Channeliser => json!({
            "frame_count": 0,
        }),
        BlockKind::FrequencySliceSelector => json!({
            "band_select": 0,
        }),
        BlockKind::PowerMeter => json!({
            "avg_power_pol_x": 0.0,
            "avg_power_pol_y": 0.0,
            "overflow": false,
        }),
        BlockKind::Packetizer => json!({
            "packet_count": 0,
        }),
    };
    match value {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_configure_roundtrip() {
        let mut sim = SimulatorBackend::new(BlockKind::Channeliser);
        assert!(sim.configured().is_none());

        let payload = json!({ "sample_rate": 3_960_000_000u64 });
        assert!(sim.configure(&payload).is_ok());
        assert_eq!(sim.configured(), Some(&payload));

        assert!(sim.deconfigure(None).is_ok());
        assert!(sim.configured().is_none());
    }

    #[test]
    fn test_start_stop() {
        let mut sim = SimulatorBackend::new(BlockKind::Mac);
        assert!(!sim.is_running());
        sim.start();
        assert!(sim.is_running());
        sim.stop(false);
        assert!(!sim.is_running());
    }

    #[test]
    fn test_status_clear_resets_counters_not_readiness() {
        let mut sim = SimulatorBackend::new(BlockKind::Mac);
        sim.set_status_field("rx_loss_count", json!(7));

        let (resp, report) = sim.status(true);
        assert!(resp.is_ok());
        assert_eq!(report["rx_loss_count"], json!(7));

        let (_, report) = sim.status(false);
        assert_eq!(report["rx_loss_count"], json!(0));
        assert_eq!(report["link_up"], json!(true));
    }

    #[test]
    fn test_recover_restores_canned_status() {
        let mut sim = SimulatorBackend::new(BlockKind::WidebandInputBuffer);
        sim.set_status_field("rx_ready", json!(false));
        sim.configure(&json!({"expected_sample_rate": 1}));
        sim.recover();
        let (_, report) = sim.status(false);
        assert_eq!(report["rx_ready"], json!(true));
        assert!(sim.configured().is_none());
    }
}
