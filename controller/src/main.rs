use vcc_controller::LaneController;

use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    info!("VCC lane controller starting (simulated back-ends)");
    let controller = LaneController::simulated("vcc-001");

    for device in controller.devices().all() {
        info!(
            "  {} up: obs state {:?}, health {:?}",
            device.device_id(),
            device.obs_state(),
            device.health_state()
        );
    }

    info!(
        "lane {} up: obs state {:?}; Ctrl-C to exit",
        controller.lane_id(),
        controller.obs_state()
    );
    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    let _ = controller.abort().await;
    Ok(())
}
