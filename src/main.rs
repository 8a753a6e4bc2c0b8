use std::time::Duration;
use vcc_device::blocks::BlockKind;
use vcc_device::device::{DeviceCore, DeviceSettings};

use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    info!("VCC lane device starting (simulated back-ends)");

    let kinds = [
        BlockKind::Mac,
        BlockKind::PacketValidator,
        BlockKind::WidebandInputBuffer,
        BlockKind::WidebandFrequencyShifter,
        BlockKind::Channeliser,
        BlockKind::FrequencySliceSelector,
        BlockKind::PowerMeter,
        BlockKind::Packetizer,
    ];

    let mut devices = Vec::new();
    for kind in kinds {
        let mut settings =
            DeviceSettings::simulated(format!("vcc-{}-001", kind.block_id()), kind);
        settings.poll_period = Duration::from_millis(1000);
        let device = DeviceCore::new(settings)?;
        info!(
            "  {} up: obs state {:?}, health {:?}",
            device.device_id(),
            device.obs_state(),
            device.health_state()
        );
        devices.push(device);
    }

    info!("{} block devices up; Ctrl-C to exit", devices.len());
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    for device in &devices {
        let _ = device.abort().await;
    }

    Ok(())
}
