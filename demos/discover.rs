//! Lists every pump that answers a discovery broadcast.

use jebao::{discover_devices_with, ConnectionParams, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let params = ConnectionParams::default();
    info!(
        "📡 Broadcasting discovery to {}:{}",
        params.broadcast_address, params.discovery_port
    );

    let devices = discover_devices_with(&params).await?;
    if devices.is_empty() {
        println!("No devices found. Make sure pumps are on the network.");
        return Ok(());
    }

    println!("{:<12} {:<24} {:<16} {:<18} Firmware", "Model", "Device ID", "IP", "MAC");
    for device in &devices {
        println!(
            "{:<12} {:<24} {:<16} {:<18} {}",
            device.model,
            device.device_id,
            device.ip_address.to_string(),
            device.mac_address.as_deref().unwrap_or("-"),
            device.firmware_version.as_deref().unwrap_or("-"),
        );
    }

    Ok(())
}
