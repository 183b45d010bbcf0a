//! Walkthroughs of the device API.
//!
//! Each routine prints what it does as it goes and paces itself with short
//! sleeps so changes are visible on the pump. The `basic_control` demo program
//! wires them to discovery and Ctrl+C.

use std::{fmt, future::Future, io, str::FromStr, time::Duration};
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

use crate::{
    device::MDP20000Device,
    discovery::discover_devices_with,
    error::{JebaoError, Result},
    types::{ConnectionParams, DeviceInfo, PumpState, TimeoutConfig},
};

/// Time between status polls in [`monitoring_example`]
pub const MONITOR_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Speed the monitoring example runs the pump at
pub const MONITOR_SPEED: u8 = 60;

/// A demo routine that can be selected to run against a discovered pump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Example {
    /// [`basic_control_example`]
    BasicControl,
    /// [`feed_mode_example`]
    FeedMode,
    /// [`monitoring_example`] for the given duration
    Monitoring(Duration),
}

impl FromStr for Example {
    type Err = JebaoError;

    /// Parses `basic`, `feed`, `monitor` or `monitor:<seconds>`
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(Self::BasicControl),
            "feed" => Ok(Self::FeedMode),
            "monitor" => Ok(Self::Monitoring(Duration::from_secs(60))),
            other => {
                let secs = other
                    .strip_prefix("monitor:")
                    .and_then(|secs| secs.parse::<u64>().ok())
                    .ok_or_else(|| {
                        JebaoError::InvalidParameters(format!("Unknown example: {s}"))
                    })?;
                Ok(Self::Monitoring(Duration::from_secs(secs)))
            }
        }
    }
}

impl fmt::Display for Example {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BasicControl => write!(f, "basic"),
            Self::FeedMode => write!(f, "feed"),
            Self::Monitoring(duration) => write!(f, "monitor:{}", duration.as_secs()),
        }
    }
}

/// States observed during [`feed_mode_example`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedReport {
    /// State read right after starting feed
    pub during_feed: PumpState,
    /// State read after cancelling feed
    pub after_cancel: PumpState,
    /// Speed read after cancelling feed
    pub resumed_speed: u8,
}

/// How [`monitoring_example`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    /// The requested duration elapsed
    Completed,
    /// The shutdown signal fired first
    Interrupted,
}

/// Resolves on Ctrl+C
///
/// If the handler cannot be installed the error is logged and the future
/// never resolves, so a demo runs to completion instead of stopping at once.
pub async fn ctrl_c() {
    interrupt_or_pending(tokio::signal::ctrl_c()).await;
}

async fn interrupt_or_pending<F>(signal: F)
where
    F: Future<Output = io::Result<()>>,
{
    if let Err(e) = signal.await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Discover devices and print them
///
/// Uses the broadcast address, port and timeout from `params`.
///
/// # Errors
///
/// Returns discovery socket errors.
pub async fn discovery_example(params: &ConnectionParams) -> Result<Vec<DeviceInfo>> {
    println!("\n=== Discovery Example ===");

    let devices = discover_devices_with(params).await?;

    println!("\nFound {} device(s):", devices.len());
    for device in &devices {
        println!(
            "  - {} ({}) at {}",
            device.model, device.device_id, device.ip_address
        );
    }

    Ok(devices)
}

/// Switch to manual mode, run at two speeds, then turn off
///
/// Connects for the duration of the routine and always disconnects.
///
/// # Errors
///
/// Returns any connection or command error.
pub async fn basic_control_example(pump: &MDP20000Device) -> Result<()> {
    println!("\n=== Basic Control Example ({}) ===", pump.host());

    pump.session(|pump| {
        Box::pin(async move {
            println!("\nEnsuring manual mode...");
            pump.ensure_manual_mode().await?;

            println!("\nGetting initial status...");
            pump.update().await?;
            println!("State: {}", pump.state().await);
            println!("Speed: {}%", pump.speed().await);
            println!("Is on: {}", pump.is_on().await);

            println!("\nTurning on...");
            pump.turn_on().await?;
            sleep(Duration::from_secs(1)).await;

            println!("Setting speed to 50%...");
            pump.set_speed(50).await?;
            sleep(Duration::from_secs(2)).await;

            println!("Setting speed to 75%...");
            pump.set_speed(75).await?;
            sleep(Duration::from_secs(2)).await;

            pump.update().await?;
            println!(
                "\nCurrent state: {} @ {}%",
                pump.state().await,
                pump.speed().await
            );

            println!("\nTurning off...");
            pump.turn_off().await?;
            sleep(Duration::from_secs(1)).await;

            pump.update().await?;
            println!("Final state: {}", pump.state().await);
            Ok(())
        })
    })
    .await
}

/// Run at 75%, start a one minute feed, cancel it and resume at 50%
///
/// # Errors
///
/// Returns any connection or command error.
pub async fn feed_mode_example(pump: &MDP20000Device) -> Result<FeedReport> {
    println!("\n=== Feed Mode Example ({}) ===", pump.host());

    pump.session(|pump| {
        Box::pin(async move {
            pump.ensure_manual_mode().await?;

            println!("\nStarting pump at 75%...");
            pump.turn_on().await?;
            pump.set_speed(75).await?;
            sleep(Duration::from_secs(2)).await;

            println!("\nStarting 1-minute feed mode...");
            pump.start_feed(1).await?;

            pump.update().await?;
            let during_feed = pump.state().await;
            println!("State: {during_feed} (should be FEED)");

            println!("\nWaiting 5 seconds...");
            sleep(Duration::from_secs(5)).await;

            println!("Canceling feed, resuming at 50%...");
            pump.cancel_feed(50).await?;

            pump.update().await?;
            let after_cancel = pump.state().await;
            let resumed_speed = pump.speed().await;
            println!("State: {after_cancel} @ {resumed_speed}% (should be ON @ 50%)");

            sleep(Duration::from_secs(2)).await;
            pump.turn_off().await?;

            Ok(FeedReport {
                during_feed,
                after_cancel,
                resumed_speed,
            })
        })
    })
    .await
}

/// Run at 60% and print the status every few seconds
///
/// Stops when `duration` has elapsed or `shutdown` resolves, whichever comes
/// first. The pump is turned off and disconnected exactly once on every exit
/// path, including errors.
///
/// # Errors
///
/// Returns the first connection or command error; cleanup errors are only
/// returned when the routine itself succeeded.
pub async fn monitoring_example<S>(
    pump: &MDP20000Device,
    duration: Duration,
    shutdown: S,
) -> Result<MonitorExit>
where
    S: Future<Output = ()>,
{
    println!(
        "\n=== Monitoring Example ({}, {}s) ===",
        pump.host(),
        duration.as_secs()
    );

    let body = async {
        pump.connect().await?;
        pump.ensure_manual_mode().await?;

        pump.turn_on().await?;
        pump.set_speed(MONITOR_SPEED).await?;

        println!("\nMonitoring pump for {} seconds...", duration.as_secs());
        println!("Press Ctrl+C to stop\n");

        let started = Instant::now();
        let end = started + duration;
        while Instant::now() < end {
            pump.update().await?;
            println!(
                "[{:>4}] State: {:8} | Speed: {:3}% | Connected: {}",
                started.elapsed().as_secs(),
                pump.state().await,
                pump.speed().await,
                pump.is_connected().await
            );
            sleep(MONITOR_POLL_INTERVAL).await;
        }

        Ok::<_, JebaoError>(MonitorExit::Completed)
    };

    let outcome = tokio::select! {
        result = body => result,
        () = shutdown => {
            println!("\nStopping...");
            Ok(MonitorExit::Interrupted)
        }
    };

    // nothing to turn off if the connection never came up or was lost
    let turned_off = if pump.is_connected().await {
        pump.turn_off().await
    } else {
        Ok(())
    };
    if let Err(e) = &turned_off {
        warn!("Failed to turn pump off: {}", e);
    }
    let closed = pump.disconnect().await;

    let exit = outcome?;
    turned_off?;
    closed?;

    info!("Monitoring finished: {:?}", exit);
    Ok(exit)
}

/// Discover pumps, pick the first MDP-20000 and run `examples` on it
///
/// Returns the pump the examples ran against, or `None` after printing a
/// message when nothing suitable was found or `shutdown` fired during
/// discovery. `shutdown` ends the run early, see [`run_examples`].
///
/// # Errors
///
/// Returns discovery errors and the first failing example's error.
pub async fn run<S>(
    params: &ConnectionParams,
    timeout_config: &TimeoutConfig,
    examples: &[Example],
    shutdown: S,
) -> Result<Option<DeviceInfo>>
where
    S: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    let devices = tokio::select! {
        devices = discovery_example(params) => devices?,
        () = &mut shutdown => {
            println!("\nExiting...");
            return Ok(None);
        }
    };

    if devices.is_empty() {
        println!("\nNo devices found. Make sure pumps are on the network.");
        return Ok(None);
    }

    let Some(device) = devices.into_iter().find(DeviceInfo::is_mdp20000) else {
        println!("\nNo MDP-20000 devices found.");
        return Ok(None);
    };

    println!("\nUsing device: {} at {}", device.device_id, device.ip_address);

    let pump = MDP20000Device::with_params(
        device.ip_address,
        params.clone(),
        timeout_config.clone(),
    );
    run_examples(&pump, examples, shutdown).await?;
    Ok(Some(device))
}

/// Run `examples` in order against `pump`
///
/// When `shutdown` resolves the current example stops and no further
/// examples run. A monitoring example cleans up by itself; any other example
/// is abandoned and the pump disconnected.
///
/// # Errors
///
/// Returns the first failing example's error.
pub async fn run_examples<S>(
    pump: &MDP20000Device,
    examples: &[Example],
    shutdown: S,
) -> Result<()>
where
    S: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    for example in examples {
        info!("Running {} example", example);
        let interrupted = match example {
            Example::BasicControl => {
                tokio::select! {
                    result = basic_control_example(pump) => result.map(|()| false)?,
                    () = &mut shutdown => true,
                }
            }
            Example::FeedMode => {
                tokio::select! {
                    result = feed_mode_example(pump) => result.map(|_| false)?,
                    () = &mut shutdown => true,
                }
            }
            Example::Monitoring(duration) => {
                monitoring_example(pump, *duration, &mut shutdown).await?
                    == MonitorExit::Interrupted
            }
        };

        if interrupted {
            if !matches!(example, Example::Monitoring(_)) {
                println!("\nExiting...");
                pump.disconnect().await?;
            }
            break;
        }
    }

    Ok(())
}
