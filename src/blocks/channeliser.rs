//! Channeliser manager specifics
//!
//! The channeliser carries a multi-part configuration: one base part for
//! the sample rate, then one part per (channel, polarisation) gain. The
//! iteration is channel-outer, polarisation-inner; the loop short-circuits
//! on the first failing part.

use super::BlockManager;
use serde_json::{json, Value};
use vcc_shared::config::{ChanneliserConfig, SchemaError};
use vcc_shared::ResultCode;

/// Polarisations per channel in the gain vector
pub const POLARISATIONS: usize = 2;

pub(crate) async fn configure(manager: &BlockManager, payload: &Value) -> (ResultCode, String) {
    let config = match ChanneliserConfig::from_value(payload) {
        Ok(config) => config,
        Err(e) => return (ResultCode::Rejected, e.to_string()),
    };
    if config.gains.len() % POLARISATIONS != 0 {
        return (
            ResultCode::Rejected,
            SchemaError::new(format!(
                "gain vector length {} is not a multiple of {}",
                config.gains.len(),
                POLARISATIONS
            ))
            .to_string(),
        );
    }

    let (code, message) = manager
        .apply_configure(&json!({ "sample_rate": config.sample_rate }))
        .await;
    if code != ResultCode::Ok {
        return (code, format!("channeliser sample rate failed: {}", message));
    }

    let channels = config.gains.len() / POLARISATIONS;
    for channel in 0..channels {
        for pol in 0..POLARISATIONS {
            let gain = config.gains[channel * POLARISATIONS + pol];
            let part = json!({ "channel": channel, "pol": pol, "gain": gain });
            let (code, message) = manager.apply_configure(&part).await;
            if code != ResultCode::Ok {
                return (
                    code,
                    format!(
                        "channeliser gain (channel {}, pol {}) failed: {}",
                        channel, pol, message
                    ),
                );
            }
        }
    }

    (
        ResultCode::Ok,
        "channeliser configured successfully".to_string(),
    )
}
