//! Runs the demo routines against the first MDP-20000 on the network.
//!
//! Environment:
//! - `JEBAO_HOST`: skip discovery and use this pump address
//! - `JEBAO_EXAMPLE`: comma separated list of `basic`, `feed`, `monitor`
//!   (default `basic`)
//! - `JEBAO_MONITOR_SECS`: monitoring duration in seconds (default 60)
//! - `RUST_LOG`: log filter (default `info`)

use jebao::{
    demo::{self, Example},
    ConnectionParams, MDP20000Device, Result, TimeoutConfig,
};
use std::{env, time::Duration};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn selected_examples() -> Result<Vec<Example>> {
    let monitor_secs = env::var("JEBAO_MONITOR_SECS")
        .ok()
        .and_then(|secs| secs.parse::<u64>().ok());

    let Ok(selection) = env::var("JEBAO_EXAMPLE") else {
        return Ok(vec![Example::BasicControl]);
    };

    selection
        .split(',')
        .filter(|name| !name.trim().is_empty())
        .map(|name| {
            let example = name.parse::<Example>()?;
            Ok(match (example, monitor_secs) {
                (Example::Monitoring(_), Some(secs)) => {
                    Example::Monitoring(Duration::from_secs(secs))
                }
                (example, _) => example,
            })
        })
        .collect()
}

async fn run() -> Result<()> {
    let examples = selected_examples()?;
    info!("🐟 Jebao MDP-20000 demo: {:?}", examples);

    let params = ConnectionParams::default();
    let timeouts = TimeoutConfig::default();

    match env::var("JEBAO_HOST") {
        Ok(host) => {
            info!("🔗 Using pump at {}", host);
            let pump = MDP20000Device::from_host(&host)?;
            demo::run_examples(&pump, &examples, demo::ctrl_c()).await
        }
        Err(_) => {
            let picked = demo::run(&params, &timeouts, &examples, demo::ctrl_c()).await?;
            if let Some(device) = picked {
                info!("✅ Finished with {} at {}", device.device_id, device.ip_address);
            }
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let result = run().await;
    if let Err(e) = &result {
        error!("❌ Demo failed: {}", e);
    }
    result
}
