use async_trait::async_trait;
use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};
use tokio::{
    net::UdpSocket,
    time::{timeout_at, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    error::Result,
    protocol::{parse_discovery_response, Command, Packet},
    types::{ConnectionParams, DeviceInfo},
};

/// Largest discovery reply we expect from a module
const MAX_DATAGRAM: usize = 1024;

/// Discover pumps on the local network
///
/// Broadcasts a discovery request and collects replies for `timeout`. The
/// returned list holds one entry per device id, in the order replies arrived.
///
/// # Errors
///
/// Returns [`crate::JebaoError::Io`] if the UDP socket cannot be opened or the
/// broadcast cannot be sent.
///
/// # Examples
///
/// ```no_run
/// use jebao::discover_devices;
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     for device in discover_devices(Duration::from_secs(3)).await? {
///         println!("{} ({}) at {}", device.model, device.device_id, device.ip_address);
///     }
///     Ok(())
/// }
/// ```
pub async fn discover_devices(timeout: Duration) -> Result<Vec<DeviceInfo>> {
    let params = ConnectionParams {
        discovery_timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        ..ConnectionParams::default()
    };
    discover_devices_with(&params).await
}

/// Discover pumps using explicit broadcast address, port and timeout
///
/// # Errors
///
/// Returns [`crate::JebaoError::Io`] if the UDP socket cannot be opened or the
/// broadcast cannot be sent.
pub async fn discover_devices_with(params: &ConnectionParams) -> Result<Vec<DeviceInfo>> {
    info!(
        "Starting discovery on {}:{} for {}ms",
        params.broadcast_address, params.discovery_port, params.discovery_timeout_ms
    );

    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_broadcast(true)?;

    let request = Packet::command(Command::DiscoveryRequest).to_bytes()?;
    socket
        .send_to(&request, (params.broadcast_address, params.discovery_port))
        .await?;

    let window = Duration::from_millis(params.discovery_timeout_ms);
    let devices = collect_responses(&socket, Instant::now() + window).await;

    info!("Discovery completed. Found {} device(s)", devices.len());
    Ok(devices)
}

/// Source of discovery reply datagrams
#[async_trait]
trait DatagramSource: Send + Sync {
    async fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

#[async_trait]
impl DatagramSource for UdpSocket {
    async fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.recv_from(buf).await
    }
}

/// Collect replies until `deadline`
///
/// A receive error ends collection early; the replies gathered so far are kept.
async fn collect_responses(source: &dyn DatagramSource, deadline: Instant) -> Vec<DeviceInfo> {
    let mut devices: Vec<DeviceInfo> = Vec::new();
    let mut buf = [0u8; MAX_DATAGRAM];

    loop {
        let (len, from) = match timeout_at(deadline, source.recv_datagram(&mut buf)).await {
            Err(_) => break,
            Ok(Ok(received)) => received,
            Ok(Err(e)) => {
                warn!("Discovery receive failed, stopping early: {}", e);
                break;
            }
        };

        let parsed = Packet::from_bytes(&buf[..len])
            .and_then(|packet| parse_discovery_response(&packet, from.ip()));
        match parsed {
            Ok(device) => {
                if devices.iter().any(|d| d.device_id == device.device_id) {
                    debug!("Duplicate reply from {}", device.device_id);
                    continue;
                }
                info!(
                    "Found {} ({}) at {}",
                    device.model, device.device_id, device.ip_address
                );
                devices.push(device);
            }
            Err(e) => debug!("Ignoring datagram from {}: {}", from, e),
        }
    }

    devices
}
