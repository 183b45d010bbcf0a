//! Runs the pump at 60% and prints its status until the time is up or
//! Ctrl+C is pressed. The pump is turned off afterwards either way.
//!
//! Usage: `cargo run --example pump_monitor -- [host] [seconds]`

use jebao::{
    demo::{ctrl_c, monitoring_example, MonitorExit},
    discover_devices, JebaoError, MDP20000Device, Result,
};
use std::{env, time::Duration};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

async fn find_pump(host: Option<String>) -> Result<MDP20000Device> {
    if let Some(host) = host {
        return MDP20000Device::from_host(&host);
    }

    info!("🔍 Searching for MDP-20000 pumps...");
    let devices = discover_devices(Duration::from_secs(3)).await?;
    let info = devices
        .into_iter()
        .find(|d| d.is_mdp20000())
        .ok_or(JebaoError::DeviceNotFound)?;

    info!("✅ Found {} at {}", info.device_id, info.ip_address);
    Ok(MDP20000Device::new(info.ip_address))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = env::args().skip(1);
    let host = args.next().or_else(|| env::var("JEBAO_HOST").ok());
    let seconds = args
        .next()
        .or_else(|| env::var("JEBAO_MONITOR_SECS").ok())
        .and_then(|secs| secs.parse::<u64>().ok())
        .unwrap_or(60);

    let pump = match find_pump(host).await {
        Ok(pump) => pump,
        Err(e) => {
            error!("❌ No pump to monitor: {}", e);
            return Err(e);
        }
    };

    match monitoring_example(&pump, Duration::from_secs(seconds), ctrl_c()).await? {
        MonitorExit::Completed => info!("🏁 Monitoring completed"),
        MonitorExit::Interrupted => info!("🛑 Monitoring interrupted, pump turned off"),
    }

    Ok(())
}
