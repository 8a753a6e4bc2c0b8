//! Firmware back-end
//!
//! Binds a register driver from the bitstream directory at construction
//! and forwards every operation to it. The in-tree `FileRegisterDriver`
//! works against a JSON register file, which is what the packaged
//! bitstreams ship for bring-up; a real memory-mapped driver implements
//! the same trait. A missing driver binding aborts device initialisation.

use super::{BackendResponse, StatusReport};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Low-level register access for one IP block
#[async_trait]
pub trait RegisterDriver: Send + Sync {
    /// Reset the block's registers to their power-on values
    async fn recover(&self) -> Result<()>;
    /// Write a configuration into the block's registers
    async fn write_config(&self, payload: &Value) -> Result<()>;
    /// Clear the written configuration, optionally scoped by a payload
    async fn clear_config(&self, payload: Option<&Value>) -> Result<()>;
    /// Set the block's run enable bit
    async fn set_running(&self, running: bool, force: bool) -> Result<()>;
    /// Read the block's status registers
    async fn read_status(&self, clear: bool) -> Result<StatusReport>;
}

/// Register driver working against a JSON register file in the bitstream
/// directory
pub struct FileRegisterDriver {
    register_file: PathBuf,
}

impl FileRegisterDriver {
    /// Bind the driver for `block_id` under `bitstream_dir`.
    ///
    /// Requires `<bitstream_dir>/<block_id>/driver.json` to exist; the
    /// registers live next to it in `registers.json`.
    pub fn load(bitstream_dir: &Path, block_id: &str) -> Result<Self> {
        let block_dir = bitstream_dir.join(block_id);
        let manifest = block_dir.join("driver.json");
        if !manifest.is_file() {
            anyhow::bail!(
                "no driver binding for block '{}' in bitstream directory {}",
                block_id,
                bitstream_dir.display()
            );
        }
        Ok(Self {
            register_file: block_dir.join("registers.json"),
        })
    }

    async fn read_registers(&self) -> Result<StatusReport> {
        let raw = tokio::fs::read_to_string(&self.register_file)
            .await
            .with_context(|| format!("reading {}", self.register_file.display()))?;
        let value: Value = serde_json::from_str(&raw)
            .with_context(|| format!("parsing {}", self.register_file.display()))?;
        match value {
            Value::Object(map) => Ok(map),
            _ => anyhow::bail!("register file {} is not an object", self.register_file.display()),
        }
    }

    async fn write_registers(&self, registers: &StatusReport) -> Result<()> {
        let raw = serde_json::to_string_pretty(&Value::Object(registers.clone()))?;
        tokio::fs::write(&self.register_file, raw)
            .await
            .with_context(|| format!("writing {}", self.register_file.display()))?;
        Ok(())
    }
}

#[async_trait]
impl RegisterDriver for FileRegisterDriver {
    async fn recover(&self) -> Result<()> {
        let mut registers = self.read_registers().await?;
        registers.remove("config");
        registers.insert("running".into(), json!(false));
        self.write_registers(&registers).await
    }

    async fn write_config(&self, payload: &Value) -> Result<()> {
        let mut registers = self.read_registers().await?;
        registers.insert("config".into(), payload.clone());
        self.write_registers(&registers).await
    }

    async fn clear_config(&self, _payload: Option<&Value>) -> Result<()> {
        let mut registers = self.read_registers().await?;
        registers.remove("config");
        self.write_registers(&registers).await
    }

    async fn set_running(&self, running: bool, _force: bool) -> Result<()> {
        let mut registers = self.read_registers().await?;
        registers.insert("running".into(), json!(running));
        self.write_registers(&registers).await
    }

    async fn read_status(&self, clear: bool) -> Result<StatusReport> {
        let mut registers = self.read_registers().await?;
        let report = registers.clone();
        if clear {
            for (key, value) in registers.iter_mut() {
                if key.ends_with("_count") && (value.is_u64() || value.is_i64()) {
                    *value = json!(0);
                }
            }
            self.write_registers(&registers).await?;
        }
        Ok(report)
    }
}

/// Firmware-backed block, forwarding each operation to its driver
pub struct FirmwareBackend {
    block_id: String,
    driver: Box<dyn RegisterDriver>,
}

impl FirmwareBackend {
    /// Load the driver binding for `block_id` from the bitstream directory
    pub fn load(bitstream_dir: &Path, block_id: &str) -> Result<Self> {
        let driver = FileRegisterDriver::load(bitstream_dir, block_id)?;
        Ok(Self {
            block_id: block_id.to_string(),
            driver: Box::new(driver),
        })
    }

    /// Wrap an existing driver, used by driver implementations and tests
    pub fn with_driver(block_id: impl Into<String>, driver: Box<dyn RegisterDriver>) -> Self {
        Self {
            block_id: block_id.into(),
            driver,
        }
    }

    fn failed(&self, op: &str, err: anyhow::Error) -> BackendResponse {
        warn!("{} {} driver error: {:#}", self.block_id, op, err);
        BackendResponse::failed(format!("{} {} failed: {:#}", self.block_id, op, err))
    }

    pub async fn recover(&self) -> BackendResponse {
        match self.driver.recover().await {
            Ok(()) => BackendResponse::ok(format!("{} recovered", self.block_id)),
            Err(e) => self.failed("recover", e),
        }
    }

    pub async fn configure(&self, payload: &Value) -> BackendResponse {
        match self.driver.write_config(payload).await {
            Ok(()) => BackendResponse::ok(format!("{} configured", self.block_id)),
            Err(e) => self.failed("configure", e),
        }
    }

    pub async fn deconfigure(&self, payload: Option<&Value>) -> BackendResponse {
        match self.driver.clear_config(payload).await {
            Ok(()) => BackendResponse::ok(format!("{} deconfigured", self.block_id)),
            Err(e) => self.failed("deconfigure", e),
        }
    }

    pub async fn start(&self) -> BackendResponse {
        match self.driver.set_running(true, false).await {
            Ok(()) => BackendResponse::ok(format!("{} started", self.block_id)),
            Err(e) => self.failed("start", e),
        }
    }

    pub async fn stop(&self, force: bool) -> BackendResponse {
        match self.driver.set_running(false, force).await {
            Ok(()) => BackendResponse::ok(format!("{} stopped", self.block_id)),
            Err(e) => self.failed("stop", e),
        }
    }

    pub async fn status(&self, clear: bool) -> (BackendResponse, StatusReport) {
        match self.driver.read_status(clear).await {
            Ok(report) => (BackendResponse::ok("status read"), report),
            Err(e) => (self.failed("status", e), StatusReport::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage_bitstream(dir: &Path, block_id: &str) {
        let block_dir = dir.join(block_id);
        std::fs::create_dir_all(&block_dir).unwrap();
        std::fs::write(block_dir.join("driver.json"), r#"{"driver": "file"}"#).unwrap();
        std::fs::write(
            block_dir.join("registers.json"),
            r#"{"running": false, "rx_error_count": 3}"#,
        )
        .unwrap();
    }

    #[test]
    fn test_load_requires_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let err = FirmwareBackend::load(dir.path(), "mac")
            .err()
            .expect("load must fail without a driver binding");
        assert!(err.to_string().contains("no driver binding"));
    }

    #[tokio::test]
    async fn test_configure_and_status_via_register_file() {
        let dir = tempfile::tempdir().unwrap();
        stage_bitstream(dir.path(), "mac");
        let backend = FirmwareBackend::load(dir.path(), "mac").unwrap();

        let resp = backend.configure(&json!({ "rx_loopback": true })).await;
        assert!(resp.is_ok());

        let (resp, report) = backend.status(false).await;
        assert!(resp.is_ok());
        assert_eq!(report["config"], json!({ "rx_loopback": true }));

        let resp = backend.deconfigure(None).await;
        assert!(resp.is_ok());
        let (_, report) = backend.status(false).await;
        assert!(!report.contains_key("config"));
    }

    #[tokio::test]
    async fn test_status_clear_resets_counters() {
        let dir = tempfile::tempdir().unwrap();
        stage_bitstream(dir.path(), "mac");
        let backend = FirmwareBackend::load(dir.path(), "mac").unwrap();

        let (_, report) = backend.status(true).await;
        assert_eq!(report["rx_error_count"], json!(3));
        let (_, report) = backend.status(false).await;
        assert_eq!(report["rx_error_count"], json!(0));
    }

    #[tokio::test]
    async fn test_start_stop_toggle_run_bit() {
        let dir = tempfile::tempdir().unwrap();
        stage_bitstream(dir.path(), "wib");
        let backend = FirmwareBackend::load(dir.path(), "wib").unwrap();

        backend.start().await;
        let (_, report) = backend.status(false).await;
        assert_eq!(report["running"], json!(true));

        backend.stop(true).await;
        let (_, report) = backend.status(false).await;
        assert_eq!(report["running"], json!(false));
    }
}
