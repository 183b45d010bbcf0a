use crate::{
    error::{JebaoError, Result},
    protocol::{
        parse_login_result, parse_passcode, parse_status, read_status_request, split_sn, Action,
        AttributeWrite, Command, Packet,
    },
    transport::{Connector, TcpConnector, Transport},
    types::{ConnectionParams, DeviceStatus, PumpMode, PumpState, TimeoutConfig},
};
use bytes::Bytes;
use futures::future::BoxFuture;
use std::{
    future::Future,
    net::{IpAddr, SocketAddr},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{Mutex, RwLock},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, error, info, warn};

/// Longest feed override the pump accepts, in minutes
pub const MAX_FEED_MINUTES: u8 = 60;

/// Highest speed percent
pub const MAX_SPEED: u8 = 100;

type SharedConnection = Arc<Mutex<Option<Box<dyn Transport>>>>;

/// Main interface for controlling an MDP-20000 pump
///
/// `MDP20000Device` is created disconnected from the pump's address. It
/// connects with [`connect`](Self::connect) (passcode login included) and
/// keeps the connection alive with heartbeats while idle. The last status the
/// pump reported is cached and read through [`state`](Self::state),
/// [`speed`](Self::speed) and [`is_on`](Self::is_on); call
/// [`update`](Self::update) to refresh it.
///
/// Commands issued on one handle are serialized: each waits for the pump's
/// acknowledgment before the next one is sent.
///
/// # Examples
///
/// ## Manual lifecycle
///
/// ```no_run
/// use jebao::MDP20000Device;
/// use std::net::Ipv4Addr;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let pump = MDP20000Device::new(Ipv4Addr::new(192, 168, 1, 40).into());
///     pump.connect().await?;
///
///     pump.ensure_manual_mode().await?;
///     pump.turn_on().await?;
///     pump.set_speed(60).await?;
///
///     pump.disconnect().await?;
///     Ok(())
/// }
/// ```
///
/// ## Scoped session
///
/// ```no_run
/// use jebao::MDP20000Device;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let pump = MDP20000Device::from_host("192.168.1.40")?;
///     pump.session(|pump| Box::pin(async move {
///         pump.update().await?;
///         println!("State: {}", pump.state().await);
///         Ok(())
///     }))
///     .await?;
///     Ok(())
/// }
/// ```
pub struct MDP20000Device {
    addr: SocketAddr,
    params: ConnectionParams,
    timeout_config: TimeoutConfig,
    connector: Arc<dyn Connector>,
    connection: SharedConnection,
    status: Arc<RwLock<DeviceStatus>>,
    last_message_time: Arc<RwLock<Instant>>,
    sequence: AtomicU32,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl MDP20000Device {
    /// Create a handle for the pump at `ip` with default settings
    #[must_use]
    pub fn new(ip: IpAddr) -> Self {
        Self::with_params(ip, ConnectionParams::default(), TimeoutConfig::default())
    }

    /// Create a handle from a textual IP address
    ///
    /// # Errors
    ///
    /// Returns [`JebaoError::InvalidParameters`] if `host` is not an IP address.
    pub fn from_host(host: &str) -> Result<Self> {
        let ip = host
            .trim()
            .parse::<IpAddr>()
            .map_err(|e| JebaoError::InvalidParameters(format!("Invalid host {host:?}: {e}")))?;
        Ok(Self::new(ip))
    }

    /// Create a handle with custom connection and timeout settings
    #[must_use]
    pub fn with_params(ip: IpAddr, params: ConnectionParams, timeout_config: TimeoutConfig) -> Self {
        Self::with_connector(ip, params, timeout_config, Arc::new(TcpConnector))
    }

    /// Create a handle that opens its transport through `connector`
    #[must_use]
    pub fn with_connector(
        ip: IpAddr,
        params: ConnectionParams,
        timeout_config: TimeoutConfig,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            addr: SocketAddr::new(ip, params.port),
            params,
            timeout_config,
            connector,
            connection: Arc::new(Mutex::new(None)),
            status: Arc::new(RwLock::new(DeviceStatus::default())),
            last_message_time: Arc::new(RwLock::new(Instant::now())),
            sequence: AtomicU32::new(1),
            heartbeat: Mutex::new(None),
        }
    }

    /// Address of the pump's control server
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// IP address of the pump
    #[must_use]
    pub const fn host(&self) -> IpAddr {
        self.addr.ip()
    }

    /// Get timeout configuration
    #[must_use]
    pub const fn timeout_config(&self) -> &TimeoutConfig {
        &self.timeout_config
    }

    /// Get the last reported status
    pub async fn status(&self) -> DeviceStatus {
        self.status.read().await.clone()
    }

    /// Running state from the last status
    pub async fn state(&self) -> PumpState {
        self.status.read().await.state
    }

    /// Speed percent from the last status
    pub async fn speed(&self) -> u8 {
        self.status.read().await.speed
    }

    /// Operating mode from the last status
    pub async fn mode(&self) -> PumpMode {
        self.status.read().await.mode
    }

    /// Whether the last status shows the motor running
    pub async fn is_on(&self) -> bool {
        self.status.read().await.is_on()
    }

    /// Check if the control connection is open
    pub async fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .await
            .as_ref()
            .is_some_and(|transport| transport.is_open())
    }

    /// Open the control connection and log in
    ///
    /// Does nothing if already connected. Starts the heartbeat task on success.
    ///
    /// # Errors
    ///
    /// Returns [`JebaoError::Timeout`] or [`JebaoError::ConnectionFailed`] if the
    /// TCP connection cannot be established, and
    /// [`JebaoError::AuthenticationFailed`] if the pump rejects the login.
    pub async fn connect(&self) -> Result<()> {
        let mut connection = self.connection.lock().await;
        if connection.as_ref().is_some_and(|t| t.is_open()) {
            debug!("Already connected to {}", self.addr);
            return Ok(());
        }

        let mut transport = self
            .connector
            .connect(self.addr, self.params.connect_timeout_ms)
            .await?;

        if let Err(e) = self.login(transport.as_mut()).await {
            error!("Login to {} failed: {}", self.addr, e);
            let _ = transport.close().await;
            return Err(e);
        }

        *connection = Some(transport);
        drop(connection);

        *self.last_message_time.write().await = Instant::now();
        self.start_heartbeat().await;

        info!("Connected to pump at {}", self.addr);
        Ok(())
    }

    /// Passcode request followed by login
    async fn login(&self, transport: &mut dyn Transport) -> Result<()> {
        let timeout_ms = self.timeout_config.login_timeout_ms;

        transport.send(&Packet::command(Command::PasscodeRequest)).await?;
        let reply = receive_matching(transport, &self.status, timeout_ms, |p| {
            p.command == Command::PasscodeResponse
        })
        .await?;
        let passcode =
            parse_passcode(&reply).map_err(|e| JebaoError::AuthenticationFailed(e.to_string()))?;
        debug!("Received passcode ({} bytes)", passcode.len());

        transport.send(&Packet::login(&passcode)).await?;
        let reply = receive_matching(transport, &self.status, timeout_ms, |p| {
            p.command == Command::LoginResponse
        })
        .await?;

        if !parse_login_result(&reply)? {
            return Err(JebaoError::AuthenticationFailed(
                "Pump rejected login passcode".to_string(),
            ));
        }

        info!("Logged in to pump at {}", self.addr);
        Ok(())
    }

    /// Close the control connection
    ///
    /// Stops the heartbeat task. Calling this on a disconnected handle is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`JebaoError::Io`] if shutting down the socket fails; the handle
    /// is disconnected either way.
    pub async fn disconnect(&self) -> Result<()> {
        if let Some(handle) = self.heartbeat.lock().await.take() {
            handle.abort();
        }

        let transport = self.connection.lock().await.take();
        if let Some(mut transport) = transport {
            info!("Disconnecting from pump at {}", self.addr);
            transport.close().await?;
        }

        Ok(())
    }

    /// Run `f` with a connected handle and always disconnect afterwards
    ///
    /// The error from `f` takes precedence over a disconnect error.
    ///
    /// # Errors
    ///
    /// Returns connection errors from [`connect`](Self::connect), the error
    /// returned by `f`, or a disconnect error.
    pub async fn session<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a Self) -> BoxFuture<'a, Result<T>>,
    {
        self.connect().await?;

        let result = f(self).await;
        let closed = self.disconnect().await;

        match (result, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), closed) => {
                if let Err(close_error) = closed {
                    warn!("Disconnect after failed session also failed: {}", close_error);
                }
                Err(e)
            }
        }
    }

    /// Read the pump status and refresh the cache
    ///
    /// # Errors
    ///
    /// Returns [`JebaoError::NotConnected`] when disconnected,
    /// [`JebaoError::Timeout`] if the pump does not answer, or
    /// [`JebaoError::Protocol`] if the reply carries something other than a
    /// status, or [`JebaoError::ParseError`] if the status is malformed.
    pub async fn update(&self) -> Result<()> {
        let status = self
            .with_retry(
                "Status read",
                self.timeout_config.status_timeout_ms,
                |timeout_ms| self.read_status(timeout_ms),
            )
            .await?;

        debug!(
            "Status: {} @ {}% ({} mode)",
            status.state, status.speed, status.mode
        );
        *self.status.write().await = status;
        Ok(())
    }

    /// Switch the pump to manual mode unless it already is
    ///
    /// Reads the current status first so that a pump already in manual mode
    /// receives no write.
    ///
    /// # Errors
    ///
    /// Returns communication errors from the status read or the mode write.
    pub async fn ensure_manual_mode(&self) -> Result<()> {
        self.update().await?;

        if self.mode().await == PumpMode::Manual {
            debug!("Pump already in manual mode");
            return Ok(());
        }

        info!("Switching pump to manual mode");
        self.write_attributes(AttributeWrite::default().mode(PumpMode::Manual))
            .await?;
        self.status.write().await.mode = PumpMode::Manual;
        Ok(())
    }

    /// Start the motor
    ///
    /// # Errors
    ///
    /// Returns communication errors if the write is not acknowledged.
    pub async fn turn_on(&self) -> Result<()> {
        info!("Turning pump on");
        self.write_attributes(AttributeWrite::default().switch(true))
            .await?;

        let mut status = self.status.write().await;
        if status.state != PumpState::Feed {
            status.state = PumpState::On;
        }
        Ok(())
    }

    /// Stop the motor
    ///
    /// # Errors
    ///
    /// Returns communication errors if the write is not acknowledged.
    pub async fn turn_off(&self) -> Result<()> {
        info!("Turning pump off");
        self.write_attributes(AttributeWrite::default().switch(false))
            .await?;

        self.status.write().await.state = PumpState::Off;
        Ok(())
    }

    /// Set the speed in percent
    ///
    /// # Errors
    ///
    /// Returns [`JebaoError::InvalidParameters`] if `percent` is above 100,
    /// without contacting the pump.
    pub async fn set_speed(&self, percent: u8) -> Result<()> {
        validate_speed(percent)?;
        info!("Setting speed to {}%", percent);

        self.write_attributes(AttributeWrite::default().speed(percent))
            .await?;

        self.status.write().await.speed = percent;
        Ok(())
    }

    /// Start a timed feed override
    ///
    /// The pump reverts to its previous behavior after `minutes`.
    ///
    /// # Errors
    ///
    /// Returns [`JebaoError::InvalidParameters`] if `minutes` is outside
    /// 1..=60, without contacting the pump.
    pub async fn start_feed(&self, minutes: u8) -> Result<()> {
        if !(1..=MAX_FEED_MINUTES).contains(&minutes) {
            return Err(JebaoError::InvalidParameters(format!(
                "Feed duration {minutes} min is out of range (1 - {MAX_FEED_MINUTES})"
            )));
        }
        info!("Starting {} minute feed", minutes);

        self.write_attributes(AttributeWrite::default().feed(true).feed_minutes(minutes))
            .await?;

        let mut status = self.status.write().await;
        status.state = PumpState::Feed;
        status.feed_minutes = minutes;
        Ok(())
    }

    /// End feed early and resume running at `resume_speed`
    ///
    /// # Errors
    ///
    /// Returns [`JebaoError::InvalidParameters`] if `resume_speed` is above 100,
    /// without contacting the pump.
    pub async fn cancel_feed(&self, resume_speed: u8) -> Result<()> {
        validate_speed(resume_speed)?;
        info!("Cancelling feed, resuming at {}%", resume_speed);

        self.write_attributes(
            AttributeWrite::default()
                .feed(false)
                .switch(true)
                .speed(resume_speed),
        )
        .await?;

        let mut status = self.status.write().await;
        status.state = PumpState::On;
        status.speed = resume_speed;
        Ok(())
    }

    /// Write attributes with retry on recoverable errors
    async fn write_attributes(&self, write: AttributeWrite) -> Result<Packet> {
        let data = write.to_bytes();
        self.with_retry(
            &format!("Write {write:?}"),
            self.timeout_config.command_timeout_ms,
            |timeout_ms| self.request(data.clone(), timeout_ms),
        )
        .await
    }

    /// One status read; the reply must be a status reply
    async fn read_status(&self, timeout_ms: u64) -> Result<DeviceStatus> {
        let ack = self.request(read_status_request(), timeout_ms).await?;
        let (_, data) = split_sn(&ack.payload)?;

        match data.first().copied().and_then(Action::from_u8) {
            Some(Action::StatusReply) => parse_status(data),
            other => Err(JebaoError::Protocol(format!(
                "Expected status reply to read, got action {other:?}"
            ))),
        }
    }

    /// Run `op` until it succeeds, retrying recoverable errors
    ///
    /// The timeout passed to `op` grows by half on every retry.
    async fn with_retry<T, F, Fut>(&self, what: &str, timeout_ms: u64, mut op: F) -> Result<T>
    where
        F: FnMut(u64) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_retries = self.timeout_config.max_retry_attempts;
        let mut current_timeout = timeout_ms;
        let mut attempt = 0;

        loop {
            match op(current_timeout).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_recoverable() && attempt < max_retries => {
                    warn!(
                        "{} failed on attempt {}/{}, retrying in {}ms: {}",
                        what,
                        attempt + 1,
                        max_retries + 1,
                        self.timeout_config.retry_delay_ms,
                        e
                    );
                    attempt += 1;
                    current_timeout = current_timeout.saturating_mul(3).saturating_div(2);
                    tokio::time::sleep(Duration::from_millis(self.timeout_config.retry_delay_ms))
                        .await;
                }
                Err(e) => {
                    if attempt > 0 {
                        error!("{} failed after {} attempts", what, attempt + 1);
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Send a data frame and wait for the acknowledgment with the same sequence number
    async fn request(&self, data: Bytes, timeout_ms: u64) -> Result<Packet> {
        let sn = self.sequence.fetch_add(1, Ordering::Relaxed);

        let mut connection = self.connection.lock().await;
        let transport = match connection.as_mut() {
            Some(transport) if transport.is_open() => transport,
            _ => return Err(JebaoError::NotConnected),
        };

        let result = async {
            transport.send(&Packet::data(sn, &data)).await?;
            receive_matching(transport.as_mut(), &self.status, timeout_ms, |p| {
                p.command == Command::DataAck
                    && split_sn(&p.payload).is_ok_and(|(ack_sn, _)| ack_sn == sn)
            })
            .await
        }
        .await;

        match result {
            Ok(ack) => {
                *self.last_message_time.write().await = Instant::now();
                Ok(ack)
            }
            Err(e) => {
                if e.is_connection_error() {
                    warn!("Connection to {} lost: {}", self.addr, e);
                    if let Some(mut transport) = connection.take() {
                        let _ = transport.close().await;
                    }
                }
                Err(e)
            }
        }
    }

    async fn start_heartbeat(&self) {
        let connection = self.connection.clone();
        let status = self.status.clone();
        let last_message_time = self.last_message_time.clone();
        let interval = Duration::from_millis(self.timeout_config.heartbeat_interval_ms);
        let timeout_ms = self.timeout_config.status_timeout_ms;

        let handle = tokio::spawn(async move {
            heartbeat_loop(connection, status, last_message_time, interval, timeout_ms).await;
        });

        if let Some(previous) = self.heartbeat.lock().await.replace(handle) {
            previous.abort();
        }
    }
}

impl Drop for MDP20000Device {
    fn drop(&mut self) {
        if let Some(handle) = self.heartbeat.get_mut().take() {
            handle.abort();
        }

        let connection = self.connection.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let transport = connection.lock().await.take();
                if let Some(mut transport) = transport {
                    let _ = transport.close().await;
                }
            });
        }
    }
}

fn validate_speed(percent: u8) -> Result<()> {
    if percent > MAX_SPEED {
        return Err(JebaoError::InvalidParameters(format!(
            "Speed {percent}% is out of range (0 - {MAX_SPEED})"
        )));
    }
    Ok(())
}

/// Receive until `accept` matches, folding status data from every packet into the cache
async fn receive_matching<F>(
    transport: &mut dyn Transport,
    status: &RwLock<DeviceStatus>,
    timeout_ms: u64,
    mut accept: F,
) -> Result<Packet>
where
    F: FnMut(&Packet) -> bool + Send,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let remaining_ms = u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX);
        if remaining_ms == 0 {
            return Err(JebaoError::Timeout { timeout_ms });
        }

        let packet = transport
            .receive(remaining_ms)
            .await
            .map_err(|e| match e {
                JebaoError::Timeout { .. } => JebaoError::Timeout { timeout_ms },
                other => other,
            })?;
        absorb_status(status, &packet).await;

        if accept(&packet) {
            return Ok(packet);
        }
        debug!("Skipping {:?} while waiting for reply", packet.command);
    }
}

/// Apply status carried by a push or acknowledgment to the cache
async fn absorb_status(status: &RwLock<DeviceStatus>, packet: &Packet) {
    let data = match packet.command {
        Command::DataPush => &packet.payload[..],
        Command::DataAck => match split_sn(&packet.payload) {
            Ok((_, data)) => data,
            Err(_) => return,
        },
        _ => return,
    };
    if data.is_empty() {
        return;
    }

    match parse_status(data) {
        Ok(new_status) => *status.write().await = new_status,
        Err(e) => debug!("Ignoring non-status data: {}", e),
    }
}

/// Keep the connection alive while idle
///
/// Exits when the connection is gone; drops the connection if a heartbeat
/// goes unanswered.
async fn heartbeat_loop(
    connection: SharedConnection,
    status: Arc<RwLock<DeviceStatus>>,
    last_message_time: Arc<RwLock<Instant>>,
    interval: Duration,
    timeout_ms: u64,
) {
    loop {
        let due = *last_message_time.read().await + interval;
        tokio::time::sleep_until(due).await;

        if last_message_time.read().await.elapsed() < interval {
            continue;
        }

        let mut guard = connection.lock().await;
        let Some(transport) = guard.as_mut() else {
            debug!("Connection closed, stopping heartbeat");
            return;
        };

        let result = async {
            transport.send(&Packet::command(Command::Heartbeat)).await?;
            receive_matching(transport.as_mut(), &status, timeout_ms, |p| {
                p.command == Command::HeartbeatReply
            })
            .await
        }
        .await;

        match result {
            Ok(_) => {
                debug!("Heartbeat acknowledged");
                *last_message_time.write().await = Instant::now();
            }
            Err(e) => {
                warn!("Heartbeat failed, dropping connection: {}", e);
                if let Some(mut transport) = guard.take() {
                    let _ = transport.close().await;
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_status, Action};
    use crate::testing::{ScriptedTransport, SimEvent, SimPump};
    use std::net::Ipv4Addr;

    fn device(sim: &SimPump) -> MDP20000Device {
        MDP20000Device::with_connector(
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 40)),
            ConnectionParams::default(),
            TimeoutConfig::default(),
            Arc::new(sim.clone()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_logs_in_and_disconnects() {
        let sim = SimPump::new();
        let pump = device(&sim);

        assert!(!pump.is_connected().await);
        pump.connect().await.unwrap();
        assert!(pump.is_connected().await);

        pump.disconnect().await.unwrap();
        assert!(!pump.is_connected().await);
        pump.disconnect().await.unwrap();

        assert_eq!(
            sim.events(),
            vec![
                SimEvent::Connect,
                SimEvent::PasscodeRequest,
                SimEvent::Login,
                SimEvent::Close
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_login_fails_and_closes() {
        let sim = SimPump::new();
        sim.with_state(|s| s.reject_login = true);
        let pump = device(&sim);

        let result = pump.connect().await;
        assert!(matches!(result, Err(JebaoError::AuthenticationFailed(_))));
        assert!(!pump.is_connected().await);
        assert_eq!(sim.events().last(), Some(&SimEvent::Close));
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_require_connection() {
        let sim = SimPump::new();
        let pump = device(&sim);

        assert!(matches!(pump.update().await, Err(JebaoError::NotConnected)));
        assert!(matches!(pump.turn_on().await, Err(JebaoError::NotConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_parameters_send_nothing() {
        let sim = SimPump::new();
        let pump = device(&sim);
        pump.connect().await.unwrap();
        let before = sim.events().len();

        assert!(matches!(
            pump.set_speed(101).await,
            Err(JebaoError::InvalidParameters(_))
        ));
        assert!(matches!(
            pump.start_feed(0).await,
            Err(JebaoError::InvalidParameters(_))
        ));
        assert!(matches!(
            pump.start_feed(61).await,
            Err(JebaoError::InvalidParameters(_))
        ));
        assert!(matches!(
            pump.cancel_feed(150).await,
            Err(JebaoError::InvalidParameters(_))
        ));

        assert_eq!(sim.events().len(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_turn_on_and_set_speed_reports_on() {
        let sim = SimPump::new();
        let pump = device(&sim);
        pump.connect().await.unwrap();

        pump.turn_on().await.unwrap();
        pump.set_speed(50).await.unwrap();
        pump.update().await.unwrap();

        assert!(pump.is_on().await);
        assert_eq!(pump.state().await, PumpState::On);
        assert_eq!(pump.speed().await, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_feed_and_cancel() {
        let sim = SimPump::new();
        let pump = device(&sim);
        pump.connect().await.unwrap();
        pump.turn_on().await.unwrap();
        pump.set_speed(75).await.unwrap();

        pump.start_feed(1).await.unwrap();
        pump.update().await.unwrap();
        assert_eq!(pump.state().await.name(), "FEED");
        assert!(pump.is_on().await);

        pump.cancel_feed(50).await.unwrap();
        pump.update().await.unwrap();
        assert_eq!(pump.state().await.name(), "ON");
        assert_eq!(pump.speed().await, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_manual_mode_writes_only_when_needed() {
        let sim = SimPump::new();
        sim.with_state(|s| s.status.mode = PumpMode::Program);
        let pump = device(&sim);
        pump.connect().await.unwrap();

        pump.ensure_manual_mode().await.unwrap();
        assert_eq!(pump.mode().await, PumpMode::Manual);
        assert_eq!(sim.with_state(|s| s.status.mode), PumpMode::Manual);
        let writes = sim.writes().len();
        assert_eq!(writes, 1);

        pump.ensure_manual_mode().await.unwrap();
        assert_eq!(sim.writes().len(), writes);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_is_retried_after_timeout() {
        let sim = SimPump::new();
        sim.with_state(|s| s.drop_writes = 1);
        let pump = device(&sim);
        pump.connect().await.unwrap();

        pump.set_speed(40).await.unwrap();
        assert_eq!(sim.writes().len(), 2);
        assert_eq!(sim.with_state(|s| s.status.speed), 40);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_gives_up_after_max_retries() {
        let sim = SimPump::new();
        sim.with_state(|s| s.drop_writes = 10);
        let pump = device(&sim);
        pump.connect().await.unwrap();

        let result = pump.turn_on().await;
        assert!(matches!(result, Err(JebaoError::Timeout { .. })));
        assert_eq!(
            sim.writes().len(),
            TimeoutConfig::default().max_retry_attempts as usize + 1
        );
        assert!(pump.is_connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_retries_reply_without_status() {
        let sim = SimPump::new();
        let pump = device(&sim);
        pump.connect().await.unwrap();
        sim.with_state(|s| {
            s.status.speed = 42;
            s.garble_reads = 1;
        });

        pump.update().await.unwrap();

        assert_eq!(sim.count(&SimEvent::Read), 2);
        assert_eq!(pump.speed().await, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_gives_up_on_persistent_protocol_error() {
        let sim = SimPump::new();
        let pump = device(&sim);
        pump.connect().await.unwrap();
        sim.with_state(|s| s.garble_reads = 10);

        let result = pump.update().await;

        assert!(matches!(result, Err(JebaoError::Protocol(_))));
        assert_eq!(
            sim.count(&SimEvent::Read),
            TimeoutConfig::default().max_retry_attempts as usize + 1
        );
        assert!(pump.is_connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_replaces_optimistic_cache() {
        let sim = SimPump::new();
        let pump = device(&sim);
        pump.connect().await.unwrap();

        pump.turn_on().await.unwrap();
        pump.set_speed(80).await.unwrap();
        assert_eq!(pump.speed().await, 80);

        // pump changed behind our back, e.g. from the vendor app
        sim.with_state(|s| {
            s.status.state = PumpState::Off;
            s.status.speed = 15;
        });
        pump.update().await.unwrap();

        assert_eq!(pump.state().await, PumpState::Off);
        assert_eq!(pump.speed().await, 15);
        assert!(!pump.is_on().await);
    }

    #[tokio::test]
    async fn test_status_push_updates_cache_while_waiting() {
        let pushed = DeviceStatus {
            state: PumpState::On,
            mode: PumpMode::Manual,
            speed: 33,
            feed_minutes: 0,
            timestamp: std::time::SystemTime::now(),
        };
        let mut transport = ScriptedTransport::new(vec![
            Packet::new(Command::DataPush, encode_status(Action::StatusPush, &pushed)),
            Packet::new(Command::DataPush, vec![0x7F]),
            Packet::command(Command::HeartbeatReply),
        ]);
        let status = RwLock::new(DeviceStatus::default());

        let reply = receive_matching(&mut transport, &status, 1_000, |p| {
            p.command == Command::HeartbeatReply
        })
        .await
        .unwrap();

        assert_eq!(reply.command, Command::HeartbeatReply);
        let cached = status.read().await;
        assert_eq!(cached.state, PumpState::On);
        assert_eq!(cached.speed, 33);
    }

    #[tokio::test]
    async fn test_receive_matching_times_out() {
        let mut transport = ScriptedTransport::new(vec![Packet::command(Command::HeartbeatReply)]);
        let status = RwLock::new(DeviceStatus::default());

        let result = receive_matching(&mut transport, &status, 250, |p| {
            p.command == Command::LoginResponse
        })
        .await;
        assert!(matches!(result, Err(JebaoError::Timeout { timeout_ms: 250 })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_keeps_idle_connection() {
        let sim = SimPump::new();
        let pump = device(&sim);
        pump.connect().await.unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(pump.is_connected().await);
        assert!(sim.events().contains(&SimEvent::Heartbeat));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_heartbeat_drops_connection() {
        let sim = SimPump::new();
        let pump = device(&sim);
        pump.connect().await.unwrap();
        sim.with_state(|s| s.ignore_heartbeats = true);

        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(!pump.is_connected().await);
        assert!(matches!(pump.update().await, Err(JebaoError::NotConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_always_disconnects() {
        let sim = SimPump::new();
        let pump = device(&sim);

        let result: Result<()> = pump
            .session(|pump| {
                Box::pin(async move {
                    pump.turn_on().await?;
                    Err(JebaoError::Protocol("boom".to_string()))
                })
            })
            .await;

        assert!(matches!(result, Err(JebaoError::Protocol(_))));
        assert!(!pump.is_connected().await);
        assert_eq!(sim.events().last(), Some(&SimEvent::Close));
    }

    #[test]
    fn test_from_host() {
        let pump = MDP20000Device::from_host("10.0.0.7").unwrap();
        assert_eq!(pump.host(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)));
        assert_eq!(pump.addr().port(), crate::CONTROL_PORT);

        assert!(matches!(
            MDP20000Device::from_host("pump.local"),
            Err(JebaoError::InvalidParameters(_))
        ));
    }
}
