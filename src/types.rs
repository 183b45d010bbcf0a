use serde::{Deserialize, Serialize};
use std::{fmt, net::IpAddr, time::SystemTime};

use crate::{CONTROL_PORT, DISCOVERY_PORT, MDP20000_MODEL, MDP20000_PRODUCT_KEY};

/// Pump running state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PumpState {
    /// Motor stopped
    Off,
    /// Running at the configured speed
    On,
    /// Timed feed override active
    Feed,
    /// No status read yet
    Unknown,
}

impl PumpState {
    /// Upper-case state name as shown by the vendor app
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::On => "ON",
            Self::Feed => "FEED",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for PumpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

/// Operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PumpMode {
    /// Speed and power follow direct commands
    Manual,
    /// Speed follows the pump's stored program
    Program,
    /// No status read yet
    Unknown,
}

impl fmt::Display for PumpMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manual => write!(f, "Manual"),
            Self::Program => write!(f, "Program"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Device status information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Running state
    pub state: PumpState,
    /// Operating mode
    pub mode: PumpMode,
    /// Speed in percent (0-100)
    pub speed: u8,
    /// Feed override duration in minutes
    pub feed_minutes: u8,
    /// Last status update timestamp
    pub timestamp: SystemTime,
}

impl DeviceStatus {
    /// Whether the motor is running, including during feed
    #[must_use]
    pub const fn is_on(&self) -> bool {
        matches!(self.state, PumpState::On | PumpState::Feed)
    }
}

impl Default for DeviceStatus {
    fn default() -> Self {
        Self {
            state: PumpState::Unknown,
            mode: PumpMode::Unknown,
            speed: 0,
            feed_minutes: 0,
            timestamp: SystemTime::now(),
        }
    }
}

/// Device record returned by discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Model name derived from the product key
    pub model: String,
    /// Cloud device id
    pub device_id: String,
    /// Address the discovery reply came from
    pub ip_address: IpAddr,
    /// Wi-Fi module MAC address
    pub mac_address: Option<String>,
    /// Product key
    pub product_key: String,
    /// Wi-Fi module firmware version
    pub firmware_version: Option<String>,
}

impl DeviceInfo {
    /// Create new device info, resolving the model from the product key
    #[must_use]
    pub fn new(device_id: String, ip_address: IpAddr, product_key: String) -> Self {
        Self {
            model: model_for_product_key(&product_key).to_string(),
            device_id,
            ip_address,
            mac_address: None,
            product_key,
            firmware_version: None,
        }
    }

    /// Whether this record describes an MDP-20000 pump
    #[must_use]
    pub fn is_mdp20000(&self) -> bool {
        self.product_key.eq_ignore_ascii_case(MDP20000_PRODUCT_KEY) || self.model == MDP20000_MODEL
    }
}

fn model_for_product_key(product_key: &str) -> &'static str {
    if product_key.eq_ignore_ascii_case(MDP20000_PRODUCT_KEY) {
        MDP20000_MODEL
    } else {
        "Unknown"
    }
}

/// Connection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// TCP control port
    pub port: u16,
    /// UDP discovery port
    pub discovery_port: u16,
    /// Address discovery requests are broadcast to
    pub broadcast_address: IpAddr,
    /// TCP connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// How long discovery collects replies, in milliseconds
    pub discovery_timeout_ms: u64,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            port: CONTROL_PORT,
            discovery_port: DISCOVERY_PORT,
            broadcast_address: IpAddr::from([255, 255, 255, 255]),
            connect_timeout_ms: 5_000,
            discovery_timeout_ms: 3_000,
        }
    }
}

/// Timeout and retry configuration for device commands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Attribute write acknowledgment timeout in milliseconds
    pub command_timeout_ms: u64,
    /// Status read timeout in milliseconds
    pub status_timeout_ms: u64,
    /// Passcode and login timeout in milliseconds
    pub login_timeout_ms: u64,
    /// Idle time before a heartbeat is sent, in milliseconds
    pub heartbeat_interval_ms: u64,
    /// Maximum retry attempts for failed commands
    pub max_retry_attempts: u32,
    /// Retry delay in milliseconds
    pub retry_delay_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 3_000,
            status_timeout_ms: 2_000,
            login_timeout_ms: 5_000,
            heartbeat_interval_ms: 4_000,
            max_retry_attempts: 2,
            retry_delay_ms: 500,
        }
    }
}
