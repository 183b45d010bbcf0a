use crate::{
    error::{JebaoError, Result},
    types::{DeviceInfo, DeviceStatus, PumpMode, PumpState},
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::{net::IpAddr, time::SystemTime};
use tracing::debug;

/// Fixed header that starts every packet
pub const HEADER: [u8; 4] = [0x00, 0x00, 0x00, 0x03];

/// Maximum number of bytes in the variable-length size field
pub const MAX_LENGTH_BYTES: usize = 4;

/// Largest body (flag + command + payload) accepted from the wire
pub const MAX_BODY_SIZE: usize = 4096;

/// Flag byte + command word
const BODY_PREFIX_SIZE: usize = 3;

/// Command words of the LAN protocol
///
/// Requests from the app use odd-numbered or explicitly paired codes; the
/// module answers with the paired reply code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Command {
    /// Discovery broadcast from the app
    DiscoveryRequest = 0x0003,
    /// Discovery reply from a module
    DiscoveryResponse = 0x0004,
    /// Ask the module for its login passcode
    PasscodeRequest = 0x0006,
    /// Passcode reply
    PasscodeResponse = 0x0007,
    /// Login with passcode
    LoginRequest = 0x0008,
    /// Login result
    LoginResponse = 0x0009,
    /// Keepalive from the app
    Heartbeat = 0x0015,
    /// Keepalive reply
    HeartbeatReply = 0x0016,
    /// Unsolicited device data (status pushes)
    DataPush = 0x0091,
    /// App data carrying a sequence number
    DataWithSn = 0x0093,
    /// Device acknowledgment echoing the sequence number
    DataAck = 0x0094,
}

impl Command {
    /// Convert from the wire value
    #[must_use]
    pub const fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0003 => Some(Self::DiscoveryRequest),
            0x0004 => Some(Self::DiscoveryResponse),
            0x0006 => Some(Self::PasscodeRequest),
            0x0007 => Some(Self::PasscodeResponse),
            0x0008 => Some(Self::LoginRequest),
            0x0009 => Some(Self::LoginResponse),
            0x0015 => Some(Self::Heartbeat),
            0x0016 => Some(Self::HeartbeatReply),
            0x0091 => Some(Self::DataPush),
            0x0093 => Some(Self::DataWithSn),
            0x0094 => Some(Self::DataAck),
            _ => None,
        }
    }
}

/// First byte of every data payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Action {
    /// Write one or more attributes
    WriteAttributes = 0x01,
    /// Request a status reply
    ReadStatus = 0x02,
    /// Status reply to a read
    StatusReply = 0x03,
    /// Status sent on the device's own initiative
    StatusPush = 0x04,
}

impl Action {
    /// Convert from u8
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::WriteAttributes),
            0x02 => Some(Self::ReadStatus),
            0x03 => Some(Self::StatusReply),
            0x04 => Some(Self::StatusPush),
            _ => None,
        }
    }
}

/// Attribute presence flags of a write
pub mod attr {
    /// Power switch
    pub const SWITCH: u8 = 0x01;
    /// Manual/program mode
    pub const MODE: u8 = 0x02;
    /// Feed override
    pub const FEED: u8 = 0x04;
    /// Speed percent
    pub const SPEED: u8 = 0x08;
    /// Feed duration
    pub const FEED_MINUTES: u8 = 0x10;
}

/// Bits of the state byte in writes and status replies
pub mod state_bits {
    /// Motor running
    pub const ON: u8 = 0x01;
    /// Program mode selected
    pub const PROGRAM: u8 = 0x02;
    /// Feed override active
    pub const FEED: u8 = 0x04;
}

/// A single protocol packet
///
/// Wire layout, big-endian:
/// - Bytes 0-3: header `00 00 00 03`
/// - Size: 1-4 byte varint (7 bits per byte, low group first) counting the bytes that follow
/// - Flag: one byte, always zero from the app
/// - Command: u16
/// - Payload: remaining bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Flag byte
    pub flag: u8,
    /// Command word
    pub command: Command,
    /// Payload data
    pub payload: Bytes,
}

impl Packet {
    /// Create a new packet
    pub fn new(command: Command, payload: impl Into<Bytes>) -> Self {
        Self {
            flag: 0,
            command,
            payload: payload.into(),
        }
    }

    /// Create a packet with empty payload
    #[must_use]
    pub fn command(command: Command) -> Self {
        Self::new(command, Bytes::new())
    }

    /// Login with the passcode returned by [`Command::PasscodeResponse`]
    #[must_use]
    pub fn login(passcode: &[u8]) -> Self {
        let mut payload = BytesMut::with_capacity(2 + passcode.len());
        put_prefixed(&mut payload, passcode);
        Self::new(Command::LoginRequest, payload.freeze())
    }

    /// Data frame tagged with a sequence number
    #[must_use]
    pub fn data(sn: u32, data: &[u8]) -> Self {
        let mut payload = BytesMut::with_capacity(4 + data.len());
        payload.put_u32(sn);
        payload.extend_from_slice(data);
        Self::new(Command::DataWithSn, payload.freeze())
    }

    /// Serialize packet to bytes
    ///
    /// # Errors
    ///
    /// Returns [`JebaoError::InvalidParameters`] if the body would exceed
    /// [`MAX_BODY_SIZE`].
    pub fn to_bytes(&self) -> Result<Bytes> {
        let body_len = BODY_PREFIX_SIZE + self.payload.len();
        if body_len > MAX_BODY_SIZE {
            return Err(JebaoError::InvalidParameters(format!(
                "Packet body of {body_len} bytes exceeds maximum of {MAX_BODY_SIZE}"
            )));
        }

        let mut buf = BytesMut::with_capacity(HEADER.len() + MAX_LENGTH_BYTES + body_len);
        buf.extend_from_slice(&HEADER);
        encode_length(body_len, &mut buf);
        buf.put_u8(self.flag);
        buf.put_u16(self.command as u16);
        buf.extend_from_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Parse one complete packet
    ///
    /// # Errors
    ///
    /// Returns [`JebaoError::ParseError`] if the header, size or command is invalid
    /// or the data is not exactly one packet long.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER.len() || data[..HEADER.len()] != HEADER {
            return Err(JebaoError::ParseError("Missing packet header".to_string()));
        }

        let (body_len, size_len) = decode_length(&data[HEADER.len()..])?.ok_or_else(|| {
            JebaoError::ParseError("Truncated packet size field".to_string())
        })?;

        let body = &data[HEADER.len() + size_len..];
        if body.len() != body_len {
            return Err(JebaoError::ParseError(format!(
                "Packet body is {} bytes, size field says {body_len}",
                body.len()
            )));
        }

        Self::from_body(body)
    }

    fn from_body(mut body: &[u8]) -> Result<Self> {
        if body.len() < BODY_PREFIX_SIZE {
            return Err(JebaoError::ParseError(format!(
                "Packet body too short: {} bytes",
                body.len()
            )));
        }

        let flag = body.get_u8();
        let raw = body.get_u16();
        let command = Command::from_u16(raw)
            .ok_or_else(|| JebaoError::ParseError(format!("Unknown command: {raw:04X}")))?;

        Ok(Self {
            flag,
            command,
            payload: Bytes::copy_from_slice(body),
        })
    }
}

/// Append the varint size field
pub fn encode_length(mut len: usize, buf: &mut BytesMut) {
    loop {
        let mut byte = (len & 0x7F) as u8;
        len >>= 7;
        if len > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if len == 0 {
            break;
        }
    }
}

/// Decode the varint size field
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the decoded
/// length and the number of bytes the field occupied.
///
/// # Errors
///
/// Returns [`JebaoError::ParseError`] if the field runs past [`MAX_LENGTH_BYTES`].
pub fn decode_length(data: &[u8]) -> Result<Option<(usize, usize)>> {
    let mut value = 0usize;
    for (i, &byte) in data.iter().enumerate().take(MAX_LENGTH_BYTES) {
        value |= usize::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }

    if data.len() >= MAX_LENGTH_BYTES {
        return Err(JebaoError::ParseError(
            "Packet size field longer than 4 bytes".to_string(),
        ));
    }
    Ok(None)
}

/// Streaming decoder for packets read from a TCP connection
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Create an empty decoder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet consumed
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Take the next complete packet, if any
    ///
    /// Bytes before a header are discarded. Complete frames carrying an
    /// unknown command are skipped.
    pub fn next_packet(&mut self) -> Option<Packet> {
        loop {
            self.resync();
            if self.buffer.len() <= HEADER.len() {
                return None;
            }

            let (body_len, size_len) = match decode_length(&self.buffer[HEADER.len()..]) {
                Ok(Some(decoded)) => decoded,
                Ok(None) => return None,
                Err(e) => {
                    debug!("Dropping corrupt frame: {}", e);
                    self.buffer.advance(1);
                    continue;
                }
            };

            if body_len > MAX_BODY_SIZE {
                debug!("Dropping frame with oversized body: {} bytes", body_len);
                self.buffer.advance(1);
                continue;
            }

            let frame_len = HEADER.len() + size_len + body_len;
            if self.buffer.len() < frame_len {
                return None;
            }

            let frame = self.buffer.split_to(frame_len);
            match Packet::from_body(&frame[HEADER.len() + size_len..]) {
                Ok(packet) => return Some(packet),
                Err(e) => debug!("Skipping undecodable frame: {}", e),
            }
        }
    }

    /// Drop bytes up to the next header candidate
    fn resync(&mut self) {
        let start = self
            .buffer
            .windows(HEADER.len())
            .position(|w| w == HEADER)
            .unwrap_or_else(|| {
                // keep a possible partial header at the tail
                let keep = self.buffer.len().min(HEADER.len() - 1);
                self.buffer.len() - keep
            });
        if start > 0 {
            debug!("Discarding {} bytes before packet header", start);
            self.buffer.advance(start);
        }
    }
}

/// Attribute write for the pump's data points
///
/// Only attributes that are set are flagged as present; the device keeps its
/// current value for the others.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttributeWrite {
    /// Power switch
    pub switch: Option<bool>,
    /// Operating mode
    pub mode: Option<PumpMode>,
    /// Feed override
    pub feed: Option<bool>,
    /// Speed percent
    pub speed: Option<u8>,
    /// Feed duration in minutes
    pub feed_minutes: Option<u8>,
}

impl AttributeWrite {
    /// Set the power switch
    #[must_use]
    pub const fn switch(mut self, on: bool) -> Self {
        self.switch = Some(on);
        self
    }

    /// Set the operating mode
    #[must_use]
    pub const fn mode(mut self, mode: PumpMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Start or stop feed
    #[must_use]
    pub const fn feed(mut self, active: bool) -> Self {
        self.feed = Some(active);
        self
    }

    /// Set the speed percent
    #[must_use]
    pub const fn speed(mut self, percent: u8) -> Self {
        self.speed = Some(percent);
        self
    }

    /// Set the feed duration
    #[must_use]
    pub const fn feed_minutes(mut self, minutes: u8) -> Self {
        self.feed_minutes = Some(minutes);
        self
    }

    /// Encode as a data payload: action, flags, state bits, speed, feed minutes
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut flags = 0u8;
        let mut bits = 0u8;

        if let Some(on) = self.switch {
            flags |= attr::SWITCH;
            if on {
                bits |= state_bits::ON;
            }
        }
        if let Some(mode) = self.mode {
            flags |= attr::MODE;
            if mode == PumpMode::Program {
                bits |= state_bits::PROGRAM;
            }
        }
        if let Some(active) = self.feed {
            flags |= attr::FEED;
            if active {
                bits |= state_bits::FEED;
            }
        }
        if self.speed.is_some() {
            flags |= attr::SPEED;
        }
        if self.feed_minutes.is_some() {
            flags |= attr::FEED_MINUTES;
        }

        let mut buf = BytesMut::with_capacity(5);
        buf.put_u8(Action::WriteAttributes as u8);
        buf.put_u8(flags);
        buf.put_u8(bits);
        buf.put_u8(self.speed.unwrap_or(0));
        buf.put_u8(self.feed_minutes.unwrap_or(0));
        buf.freeze()
    }

    /// Parse a write payload (used by device simulators)
    ///
    /// # Errors
    ///
    /// Returns [`JebaoError::ParseError`] if the payload is not an attribute write.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 5 || data[0] != Action::WriteAttributes as u8 {
            return Err(JebaoError::ParseError(
                "Not an attribute write payload".to_string(),
            ));
        }

        let (flags, bits, speed, minutes) = (data[1], data[2], data[3], data[4]);
        let present = |flag: u8| flags & flag != 0;

        Ok(Self {
            switch: present(attr::SWITCH).then_some(bits & state_bits::ON != 0),
            mode: present(attr::MODE).then_some(if bits & state_bits::PROGRAM != 0 {
                PumpMode::Program
            } else {
                PumpMode::Manual
            }),
            feed: present(attr::FEED).then_some(bits & state_bits::FEED != 0),
            speed: present(attr::SPEED).then_some(speed),
            feed_minutes: present(attr::FEED_MINUTES).then_some(minutes),
        })
    }
}

/// Data payload requesting a status reply
#[must_use]
pub fn read_status_request() -> Bytes {
    Bytes::from_static(&[Action::ReadStatus as u8])
}

/// Encode a status reply or push payload (used by device simulators)
#[must_use]
pub fn encode_status(action: Action, status: &DeviceStatus) -> Bytes {
    let mut bits = 0u8;
    match status.state {
        PumpState::On => bits |= state_bits::ON,
        PumpState::Feed => bits |= state_bits::ON | state_bits::FEED,
        PumpState::Off | PumpState::Unknown => {}
    }
    if status.mode == PumpMode::Program {
        bits |= state_bits::PROGRAM;
    }

    let mut buf = BytesMut::with_capacity(4);
    buf.put_u8(action as u8);
    buf.put_u8(bits);
    buf.put_u8(status.speed);
    buf.put_u8(status.feed_minutes);
    buf.freeze()
}

/// Parse a status reply or push payload
///
/// Payload structure:
/// - Byte 0: action (`StatusReply` or `StatusPush`)
/// - Byte 1: state bits (bit 0 = on, bit 1 = program mode, bit 2 = feed)
/// - Byte 2: speed percent, clamped to 100
/// - Byte 3: feed duration in minutes
///
/// # Errors
///
/// Returns [`JebaoError::ParseError`] if the payload is short or not a status payload.
pub fn parse_status(data: &[u8]) -> Result<DeviceStatus> {
    if data.len() < 4 {
        return Err(JebaoError::ParseError(
            "Status payload too short".to_string(),
        ));
    }

    let mut buf = data;
    match Action::from_u8(buf.get_u8()) {
        Some(Action::StatusReply | Action::StatusPush) => {}
        other => {
            return Err(JebaoError::ParseError(format!(
                "Expected status payload, got action {other:?}"
            )))
        }
    }

    let bits = buf.get_u8();
    let speed = buf.get_u8().min(100);
    let feed_minutes = buf.get_u8();

    let state = if bits & state_bits::FEED != 0 {
        PumpState::Feed
    } else if bits & state_bits::ON != 0 {
        PumpState::On
    } else {
        PumpState::Off
    };
    let mode = if bits & state_bits::PROGRAM != 0 {
        PumpMode::Program
    } else {
        PumpMode::Manual
    };

    Ok(DeviceStatus {
        state,
        mode,
        speed,
        feed_minutes,
        timestamp: SystemTime::now(),
    })
}

/// Split a sequence-numbered payload into sequence number and data
///
/// # Errors
///
/// Returns [`JebaoError::ParseError`] if the payload is shorter than the sequence number.
pub fn split_sn(payload: &[u8]) -> Result<(u32, &[u8])> {
    if payload.len() < 4 {
        return Err(JebaoError::ParseError(
            "Payload too short for sequence number".to_string(),
        ));
    }
    let mut buf = payload;
    let sn = buf.get_u32();
    Ok((sn, buf))
}

/// Extract the passcode from a [`Command::PasscodeResponse`]
///
/// # Errors
///
/// Returns [`JebaoError::ParseError`] if the packet is not a passcode response
/// or its length prefix is inconsistent.
pub fn parse_passcode(packet: &Packet) -> Result<Bytes> {
    if packet.command != Command::PasscodeResponse {
        return Err(JebaoError::ParseError(format!(
            "Expected passcode response, got {:?}",
            packet.command
        )));
    }
    let mut buf = &packet.payload[..];
    let passcode = get_prefixed(&mut buf, "passcode")?;
    if passcode.is_empty() {
        return Err(JebaoError::ParseError("Empty passcode".to_string()));
    }
    Ok(Bytes::copy_from_slice(passcode))
}

/// Whether a [`Command::LoginResponse`] reports success
///
/// # Errors
///
/// Returns [`JebaoError::ParseError`] if the packet is not a login response.
pub fn parse_login_result(packet: &Packet) -> Result<bool> {
    if packet.command != Command::LoginResponse || packet.payload.is_empty() {
        return Err(JebaoError::ParseError(format!(
            "Expected login response, got {:?}",
            packet.command
        )));
    }
    Ok(packet.payload[0] == 0)
}

/// Parse a discovery reply received from `ip_address`
///
/// Payload structure, each field a u16 length followed by bytes:
/// device id, MAC address, module firmware version, product key.
///
/// # Errors
///
/// Returns [`JebaoError::ParseError`] if the packet is not a discovery
/// response or a field is truncated.
pub fn parse_discovery_response(packet: &Packet, ip_address: IpAddr) -> Result<DeviceInfo> {
    if packet.command != Command::DiscoveryResponse {
        return Err(JebaoError::ParseError(format!(
            "Expected discovery response, got {:?}",
            packet.command
        )));
    }

    let mut buf = &packet.payload[..];
    let device_id = prefixed_string(&mut buf, "device id")?;
    let mac = get_prefixed(&mut buf, "mac address")?;
    let firmware = prefixed_string(&mut buf, "firmware version")?;
    let product_key = prefixed_string(&mut buf, "product key")?;

    if device_id.is_empty() {
        return Err(JebaoError::ParseError("Empty device id".to_string()));
    }

    let mut info = DeviceInfo::new(device_id, ip_address, product_key);
    info.mac_address = (!mac.is_empty()).then(|| format_mac(mac));
    info.firmware_version = (!firmware.is_empty()).then_some(firmware);
    Ok(info)
}

/// Encode a discovery reply (used by device simulators)
#[must_use]
pub fn encode_discovery_response(
    device_id: &str,
    mac: &[u8],
    firmware: &str,
    product_key: &str,
) -> Packet {
    let mut payload = BytesMut::new();
    put_prefixed(&mut payload, device_id.as_bytes());
    put_prefixed(&mut payload, mac);
    put_prefixed(&mut payload, firmware.as_bytes());
    put_prefixed(&mut payload, product_key.as_bytes());
    Packet::new(Command::DiscoveryResponse, payload.freeze())
}

fn format_mac(mac: &[u8]) -> String {
    mac.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn put_prefixed(buf: &mut BytesMut, data: &[u8]) {
    let len = u16::try_from(data.len()).unwrap_or(u16::MAX);
    buf.put_u16(len);
    buf.extend_from_slice(&data[..usize::from(len)]);
}

fn get_prefixed<'a>(buf: &mut &'a [u8], field: &str) -> Result<&'a [u8]> {
    if buf.remaining() < 2 {
        return Err(JebaoError::ParseError(format!("Missing {field} length")));
    }
    let len = usize::from(buf.get_u16());
    if buf.remaining() < len {
        return Err(JebaoError::ParseError(format!(
            "Truncated {field}: {len} bytes announced, {} available",
            buf.remaining()
        )));
    }
    let data: &'a [u8] = *buf;
    let (value, rest) = data.split_at(len);
    *buf = rest;
    Ok(value)
}

fn prefixed_string(buf: &mut &[u8], field: &str) -> Result<String> {
    let raw = get_prefixed(buf, field)?;
    Ok(String::from_utf8_lossy(raw).trim_end_matches('\0').to_string())
}
