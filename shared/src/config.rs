//! Scan and block configuration schemas
//!
//! Typed models of the JSON documents accepted by `ConfigureScan` (lane
//! controller) and `Configure` (per-block devices). Unknown fields are
//! rejected at deserialisation; numeric ranges are checked by `validate`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Admissible dish sample rate range in samples per second
pub const DISH_SAMPLE_RATE_RANGE: (u64, u64) = (3_960_000_000, 11_891_998_800);

/// Admissible magnitude of a frequency band offset
pub const FREQUENCY_BAND_OFFSET_LIMIT: i64 = 100_000_000;

/// Maximum noise diode transition holdoff in seconds
pub const NOISE_DIODE_HOLDOFF_MAX: u32 = 65_535;

/// A payload did not match the block's configuration schema.
///
/// The display form is the uniform message surfaced to callers; `detail`
/// carries the specific reason for diagnostic logs.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Validation error: argin doesn't match the required schema")]
pub struct SchemaError {
    pub detail: String,
}

impl SchemaError {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

/// Observing frequency band of the dish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrequencyBand {
    #[serde(rename = "1")]
    Band1,
    #[serde(rename = "2")]
    Band2,
    #[serde(rename = "3")]
    Band3,
    #[serde(rename = "4")]
    Band4,
    #[serde(rename = "5a")]
    Band5a,
    #[serde(rename = "5b")]
    Band5b,
}

impl FrequencyBand {
    /// Numeric index published as the device's band attribute
    pub fn index(self) -> u8 {
        match self {
            FrequencyBand::Band1 => 0,
            FrequencyBand::Band2 => 1,
            FrequencyBand::Band3 => 2,
            FrequencyBand::Band4 => 3,
            FrequencyBand::Band5a => 4,
            FrequencyBand::Band5b => 5,
        }
    }
}

/// Power meter section of the scan configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PowerMeterParams {
    pub averaging_time: u32,
    pub flagging: u32,
}

/// The ConfigureScan document accepted by the lane controller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScanConfiguration {
    pub config_id: String,
    pub expected_dish_id: String,
    pub dish_sample_rate: u64,
    pub samples_per_frame: u32,
    pub frequency_band: FrequencyBand,
    pub frequency_band_offset_stream_1: i64,
    #[serde(default)]
    pub frequency_band_offset_stream_2: Option<i64>,
    pub vcc_gain: Vec<f64>,
    pub noise_diode_transition_holdoff_seconds: u32,
    pub b123_pwrm: PowerMeterParams,
    pub b45a_pwrm: PowerMeterParams,
    pub b5b_pwrm: PowerMeterParams,
    #[serde(default)]
    pub band_5_tuning: Option<Vec<f64>>,
    #[serde(default)]
    pub fs_lanes: Option<Value>,
    #[serde(default)]
    pub transaction_id: Option<String>,
}

impl ScanConfiguration {
    /// Parse and range-check a ConfigureScan document
    pub fn from_json(document: &str) -> Result<Self, SchemaError> {
        let config: ScanConfiguration =
            serde_json::from_str(document).map_err(|e| SchemaError::new(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Range checks that the type system cannot express
    pub fn validate(&self) -> Result<(), SchemaError> {
        let (rate_min, rate_max) = DISH_SAMPLE_RATE_RANGE;
        if self.dish_sample_rate < rate_min || self.dish_sample_rate > rate_max {
            return Err(SchemaError::new(format!(
                "dish_sample_rate {} outside [{}, {}]",
                self.dish_sample_rate, rate_min, rate_max
            )));
        }
        if self.frequency_band_offset_stream_1.abs() > FREQUENCY_BAND_OFFSET_LIMIT {
            return Err(SchemaError::new(format!(
                "frequency_band_offset_stream_1 {} outside [-{1}, {1}]",
                self.frequency_band_offset_stream_1, FREQUENCY_BAND_OFFSET_LIMIT
            )));
        }
        if let Some(offset) = self.frequency_band_offset_stream_2 {
            if offset.abs() > FREQUENCY_BAND_OFFSET_LIMIT {
                return Err(SchemaError::new(format!(
                    "frequency_band_offset_stream_2 {} outside [-{1}, {1}]",
                    offset, FREQUENCY_BAND_OFFSET_LIMIT
                )));
            }
        }
        if self.noise_diode_transition_holdoff_seconds > NOISE_DIODE_HOLDOFF_MAX {
            return Err(SchemaError::new(format!(
                "noise_diode_transition_holdoff_seconds {} exceeds {}",
                self.noise_diode_transition_holdoff_seconds, NOISE_DIODE_HOLDOFF_MAX
            )));
        }
        if self.vcc_gain.is_empty() {
            return Err(SchemaError::new("vcc_gain must not be empty"));
        }
        Ok(())
    }
}

/// The Configure payload accepted by the channeliser device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChanneliserConfig {
    pub sample_rate: u64,
    pub gains: Vec<f64>,
}

impl ChanneliserConfig {
    /// Parse and check a channeliser Configure payload
    pub fn from_value(payload: &Value) -> Result<Self, SchemaError> {
        let config: ChanneliserConfig =
            serde_json::from_value(payload.clone()).map_err(|e| SchemaError::new(e.to_string()))?;
        let (rate_min, rate_max) = DISH_SAMPLE_RATE_RANGE;
        if config.sample_rate < rate_min || config.sample_rate > rate_max {
            return Err(SchemaError::new(format!(
                "sample_rate {} outside [{}, {}]",
                config.sample_rate, rate_min, rate_max
            )));
        }
        if config.gains.is_empty() {
            return Err(SchemaError::new("gains must not be empty"));
        }
        Ok(config)
    }
}
