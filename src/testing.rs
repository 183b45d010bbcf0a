//! In-memory pump used by unit tests.

use async_trait::async_trait;
use std::{
    collections::VecDeque,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex},
};
use tokio::{net::UdpSocket, task::JoinHandle};

use crate::{
    error::{JebaoError, Result},
    protocol::{
        encode_discovery_response, encode_status, split_sn, Action, AttributeWrite, Command,
        Packet,
    },
    transport::{Connector, Transport},
    types::{ConnectionParams, DeviceStatus, PumpMode, PumpState},
};

/// What the simulated pump saw, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEvent {
    Connect,
    PasscodeRequest,
    Login,
    Heartbeat,
    Read,
    Write(AttributeWrite),
    Close,
}

#[derive(Debug)]
pub struct SimState {
    pub status: DeviceStatus,
    pub events: Vec<SimEvent>,
    pub reject_login: bool,
    pub ignore_heartbeats: bool,
    /// Number of upcoming writes that get applied but never acknowledged
    pub drop_writes: usize,
    /// Number of upcoming reads acknowledged without a status reply
    pub garble_reads: usize,
}

impl SimState {
    fn apply(&mut self, write: &AttributeWrite) {
        let status = &mut self.status;
        if let Some(mode) = write.mode {
            status.mode = mode;
        }
        if let Some(speed) = write.speed {
            status.speed = speed;
        }
        if let Some(minutes) = write.feed_minutes {
            status.feed_minutes = minutes;
        }
        if let Some(on) = write.switch {
            status.state = match (on, status.state) {
                (true, PumpState::Feed) => PumpState::Feed,
                (true, _) => PumpState::On,
                (false, _) => PumpState::Off,
            };
        }
        if let Some(feed) = write.feed {
            if feed {
                status.state = PumpState::Feed;
            } else if status.state == PumpState::Feed {
                status.state = PumpState::On;
            }
        }
    }
}

/// Connector handing out transports to one shared simulated pump
#[derive(Clone)]
pub struct SimPump {
    state: Arc<Mutex<SimState>>,
}

impl SimPump {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                status: DeviceStatus {
                    state: PumpState::Off,
                    mode: PumpMode::Manual,
                    ..DeviceStatus::default()
                },
                events: Vec::new(),
                reject_login: false,
                ignore_heartbeats: false,
                drop_writes: 0,
                garble_reads: 0,
            })),
        }
    }

    pub fn with_state<T>(&self, f: impl FnOnce(&mut SimState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn events(&self) -> Vec<SimEvent> {
        self.with_state(|s| s.events.clone())
    }

    pub fn writes(&self) -> Vec<AttributeWrite> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SimEvent::Write(w) => Some(w),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, event: &SimEvent) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }
}

#[async_trait]
impl Connector for SimPump {
    async fn connect(&self, _addr: SocketAddr, _timeout_ms: u64) -> Result<Box<dyn Transport>> {
        self.with_state(|s| s.events.push(SimEvent::Connect));
        Ok(Box::new(SimTransport {
            state: self.state.clone(),
            inbox: VecDeque::new(),
            open: true,
        }))
    }
}

struct SimTransport {
    state: Arc<Mutex<SimState>>,
    inbox: VecDeque<Packet>,
    open: bool,
}

impl SimTransport {
    fn handle(&mut self, packet: &Packet) {
        let mut state = self.state.lock().unwrap();
        match packet.command {
            Command::PasscodeRequest => {
                state.events.push(SimEvent::PasscodeRequest);
                self.inbox.push_back(Packet::new(
                    Command::PasscodeResponse,
                    vec![0x00, 0x04, b'1', b'2', b'3', b'4'],
                ));
            }
            Command::LoginRequest => {
                state.events.push(SimEvent::Login);
                let result = u8::from(state.reject_login || &packet.payload[2..] != b"1234");
                self.inbox
                    .push_back(Packet::new(Command::LoginResponse, vec![result]));
            }
            Command::Heartbeat => {
                state.events.push(SimEvent::Heartbeat);
                if !state.ignore_heartbeats {
                    self.inbox.push_back(Packet::command(Command::HeartbeatReply));
                }
            }
            Command::DataWithSn => {
                let (sn, data) = split_sn(&packet.payload).unwrap();
                let mut ack = sn.to_be_bytes().to_vec();
                if data.first() == Some(&(Action::ReadStatus as u8)) {
                    state.events.push(SimEvent::Read);
                    if state.garble_reads > 0 {
                        state.garble_reads -= 1;
                        ack.push(Action::WriteAttributes as u8);
                    } else {
                        ack.extend_from_slice(&encode_status(Action::StatusReply, &state.status));
                    }
                } else {
                    let write = AttributeWrite::from_bytes(data).unwrap();
                    state.apply(&write);
                    state.events.push(SimEvent::Write(write));
                    if state.drop_writes > 0 {
                        state.drop_writes -= 1;
                        return;
                    }
                }
                self.inbox.push_back(Packet::new(Command::DataAck, ack));
            }
            other => panic!("simulated pump got unexpected {other:?}"),
        }
    }
}

#[async_trait]
impl Transport for SimTransport {
    async fn send(&mut self, packet: &Packet) -> Result<()> {
        if !self.open {
            return Err(JebaoError::Disconnected);
        }
        self.handle(packet);
        Ok(())
    }

    async fn receive(&mut self, timeout_ms: u64) -> Result<Packet> {
        if !self.open {
            return Err(JebaoError::Disconnected);
        }
        self.inbox
            .pop_front()
            .ok_or(JebaoError::Timeout { timeout_ms })
    }

    async fn close(&mut self) -> Result<()> {
        if self.open {
            self.open = false;
            self.state.lock().unwrap().events.push(SimEvent::Close);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

/// Transport replaying a fixed list of packets
pub struct ScriptedTransport {
    inbox: VecDeque<Packet>,
    pub sent: Vec<Packet>,
}

impl ScriptedTransport {
    pub fn new(packets: Vec<Packet>) -> Self {
        Self {
            inbox: packets.into(),
            sent: Vec::new(),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&mut self, packet: &Packet) -> Result<()> {
        self.sent.push(packet.clone());
        Ok(())
    }

    async fn receive(&mut self, timeout_ms: u64) -> Result<Packet> {
        self.inbox
            .pop_front()
            .ok_or(JebaoError::Timeout { timeout_ms })
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_open(&self) -> bool {
        true
    }
}

/// Discovery reply datagram for a module with the given id and product key
pub fn discovery_reply(device_id: &str, product_key: &str) -> Vec<u8> {
    encode_discovery_response(device_id, &[1, 2, 3, 4, 5, 6], "04020020", product_key)
        .to_bytes()
        .unwrap()
        .to_vec()
}

/// Localhost UDP responder answering one discovery request with `replies`
pub async fn fake_discovery_module(replies: Vec<Vec<u8>>) -> (u16, JoinHandle<()>) {
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let port = socket.local_addr().unwrap().port();

    let handle = tokio::spawn(async move {
        let mut buf = [0u8; 64];
        let (len, from) = socket.recv_from(&mut buf).await.unwrap();
        let request = Packet::from_bytes(&buf[..len]).unwrap();
        assert_eq!(request.command, Command::DiscoveryRequest);

        for reply in replies {
            socket.send_to(&reply, from).await.unwrap();
        }
    });

    (port, handle)
}

/// Discovery parameters aimed at a [`fake_discovery_module`]
pub fn local_discovery_params(port: u16) -> ConnectionParams {
    ConnectionParams {
        discovery_port: port,
        broadcast_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        discovery_timeout_ms: 300,
        ..ConnectionParams::default()
    }
}
