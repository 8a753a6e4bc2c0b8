//! HTTP emulator back-end
//!
//! Each operation maps to a single request against the emulator's block
//! endpoint: `http://<emulator-id>.<base-url>/<block-id>/<op>`. Any 2xx
//! response is success; everything else, including transport failures,
//! surfaces as `Failed` with the reason.

use super::{BackendResponse, StatusReport};
use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;
use vcc_shared::timing;

/// Client for one block of a software emulator instance
pub struct EmulatorBackend {
    client: reqwest::Client,
    emulator_id: String,
    base_url: String,
    block_id: String,
}

impl EmulatorBackend {
    pub fn new(base_url: &str, emulator_id: &str, block_id: &str) -> Result<Self> {
        // The per-request timeout is part of the contract; a client
        // without it must not be constructed
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timing::BACKEND_REQUEST_TIMEOUT_MS))
            .build()
            .with_context(|| format!("emulator client for {} failed to build", block_id))?;
        Ok(Self {
            client,
            emulator_id: emulator_id.to_string(),
            base_url: base_url.to_string(),
            block_id: block_id.to_string(),
        })
    }

    /// Endpoint for one operation on this block
    pub fn endpoint(&self, op: &str) -> String {
        format!(
            "http://{}.{}/{}/{}",
            self.emulator_id, self.base_url, self.block_id, op
        )
    }

    async fn post(&self, op: &str, body: Value) -> BackendResponse {
        let url = self.endpoint(op);
        debug!("emulator request: {}", url);
        match self.client.post(&url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                BackendResponse::ok(format!("{} {} succeeded", self.block_id, op))
            }
            Ok(resp) => BackendResponse::failed(format!(
                "{} {} returned HTTP {}",
                self.block_id,
                op,
                resp.status()
            )),
            Err(e) => BackendResponse::failed(format!("{} {} failed: {}", self.block_id, op, e)),
        }
    }

    pub async fn recover(&self) -> BackendResponse {
        self.post("recover", json!({})).await
    }

    pub async fn configure(&self, payload: &Value) -> BackendResponse {
        self.post("configure", payload.clone()).await
    }

    pub async fn deconfigure(&self, payload: Option<&Value>) -> BackendResponse {
        let body = payload.cloned().unwrap_or_else(|| json!({}));
        self.post("deconfigure", body).await
    }

    pub async fn start(&self) -> BackendResponse {
        self.post("start", json!({})).await
    }

    pub async fn stop(&self, force: bool) -> BackendResponse {
        self.post("stop", json!({ "force": force })).await
    }

    pub async fn status(&self, clear: bool) -> (BackendResponse, StatusReport) {
        let url = self.endpoint("status");
        let resp = match self
            .client
            .post(&url)
            .json(&json!({ "clear": clear }))
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                return (
                    BackendResponse::failed(format!(
                        "{} status returned HTTP {}",
                        self.block_id,
                        resp.status()
                    )),
                    StatusReport::new(),
                )
            }
            Err(e) => {
                return (
                    BackendResponse::failed(format!("{} status failed: {}", self.block_id, e)),
                    StatusReport::new(),
                )
            }
        };

        match resp.json::<StatusReport>().await {
            Ok(report) => (BackendResponse::ok("status read"), report),
            Err(e) => (
                BackendResponse::failed(format!("{} status body invalid: {}", self.block_id, e)),
                StatusReport::new(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_template() {
        let backend =
            EmulatorBackend::new("emulators.mid.internal", "vcc-emu-3", "wideband_input_buffer")
                .unwrap();
        assert_eq!(
            backend.endpoint("configure"),
            "http://vcc-emu-3.emulators.mid.internal/wideband_input_buffer/configure"
        );
        assert_eq!(
            backend.endpoint("status"),
            "http://vcc-emu-3.emulators.mid.internal/wideband_input_buffer/status"
        );
    }

    #[tokio::test]
    async fn test_unreachable_emulator_reports_failed() {
        // Host cannot resolve, so the request errors out rather than 2xx
        let backend = EmulatorBackend::new("invalid.test:9", "emu", "mac").unwrap();
        let resp = backend.recover().await;
        assert_eq!(resp.code, vcc_shared::ResultCode::Failed);
        assert!(resp.message.contains("recover"));
    }
}
