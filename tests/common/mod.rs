// In-process stand-in for a hub device, answering on 127.0.0.1 the way
// hardware does.

#![allow(dead_code)]

use broadlink_local::crypto::DEFAULT_KEY;
use broadlink_local::protocol::{
    self, Codec, CommandType, DeviceTypeCode, HelloReply, MacAddress, Packet, SessionCredentials,
};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

pub const SESSION_KEY: [u8; 16] = *b"fake-hub-key-016";
pub const DEVICE_ID: u32 = 0x0001_0203;
pub const MAC: MacAddress = MacAddress([0x34, 0xea, 0x34, 0x12, 0x34, 0x56]);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    Normal,
    /// Never answers anything
    Silent,
    /// Answers auth, then flips a byte in every command reply
    CorruptCommands,
    /// Rejects the first command with the device's auth error code
    ExpireKeyOnce,
    /// Rejects every command with the device's auth error code
    RejectKey,
    /// Answers the first command (and its resend) only after `LATE_REPLY`
    LateFirstCommand,
}

pub const LATE_REPLY: Duration = Duration::from_millis(600);

#[derive(Default)]
pub struct HubLog {
    pub datagrams: AtomicUsize,
    pub auths: AtomicUsize,
    pub counters: Mutex<Vec<u16>>,
}

pub struct FakeHub {
    pub addr: SocketAddr,
    pub log: Arc<HubLog>,
    pub relays: Arc<Mutex<u8>>,
    task: JoinHandle<()>,
}

impl FakeHub {
    pub async fn spawn(device_type: u16, behaviour: Behaviour) -> Self {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();
        let log = Arc::new(HubLog::default());
        let relays = Arc::new(Mutex::new(0u8));

        let task = {
            let log = log.clone();
            let relays = relays.clone();
            tokio::spawn(async move {
                let mut key_expired = behaviour == Behaviour::ExpireKeyOnce;
                let mut late_counter = None;
                let mut buf = vec![0u8; 2048];
                loop {
                    let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                        return;
                    };
                    log.datagrams.fetch_add(1, Ordering::SeqCst);
                    if behaviour == Behaviour::Silent {
                        continue;
                    }
                    let data = &buf[..len];
                    let Some(reply) = answer(
                        device_type,
                        behaviour,
                        data,
                        &log,
                        &relays,
                        &mut key_expired,
                    ) else {
                        continue;
                    };
                    if behaviour == Behaviour::LateFirstCommand
                        && protocol::peek_command(data) == Some(CommandType::Command.code())
                    {
                        let counter = protocol::peek_counter(data);
                        if *late_counter.get_or_insert(counter) == counter {
                            let socket = socket.clone();
                            tokio::spawn(async move {
                                tokio::time::sleep(LATE_REPLY).await;
                                let _ = socket.send_to(&reply, from).await;
                            });
                            continue;
                        }
                    }
                    let _ = socket.send_to(&reply, from).await;
                }
            })
        };

        Self {
            addr,
            log,
            relays,
            task,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn datagrams(&self) -> usize {
        self.log.datagrams.load(Ordering::SeqCst)
    }

    pub fn auths(&self) -> usize {
        self.log.auths.load(Ordering::SeqCst)
    }

    pub fn counters(&self) -> Vec<u16> {
        self.log.counters.lock().clone()
    }
}

impl Drop for FakeHub {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn credentials(key: [u8; 16]) -> SessionCredentials {
    SessionCredentials {
        mac: MAC,
        device_id: DEVICE_ID,
        key,
        counter: 0,
    }
}

fn answer(
    device_type: u16,
    behaviour: Behaviour,
    data: &[u8],
    log: &HubLog,
    relays: &Mutex<u8>,
    key_expired: &mut bool,
) -> Option<Vec<u8>> {
    let codec = Codec::new(DeviceTypeCode(device_type));
    let command = CommandType::from_u16(protocol::peek_command(data)?);

    match command {
        Some(CommandType::Hello) => Some(protocol::encode_hello_reply(&HelloReply {
            device_type: DeviceTypeCode(device_type),
            mac: MAC,
            name: Some("Fake hub".into()),
            is_locked: false,
        })),
        Some(CommandType::Auth) => {
            let request = codec.decode(data, &credentials(DEFAULT_KEY)).ok()?;
            log.auths.fetch_add(1, Ordering::SeqCst);
            log.counters.lock().push(request.counter);
            let mut payload = DEVICE_ID.to_le_bytes().to_vec();
            payload.extend_from_slice(&SESSION_KEY);
            protocol::encode_device_reply(&request, 0, &payload, &DEFAULT_KEY, false).ok()
        }
        _ => {
            let request = codec.decode(data, &credentials(SESSION_KEY)).ok()?;
            log.counters.lock().push(request.counter);
            if *key_expired || behaviour == Behaviour::RejectKey {
                *key_expired = false;
                return protocol::encode_device_reply(&request, 0xFFFF, &[], &SESSION_KEY, false)
                    .ok();
            }
            let payload = command_reply(device_type, &request, relays);
            let mut reply =
                protocol::encode_device_reply(&request, 0, &payload, &SESSION_KEY, false).ok()?;
            if behaviour == Behaviour::CorruptCommands {
                let last = reply.len() - 1;
                reply[last] ^= 0x5a;
            }
            Some(reply)
        }
    }
}

fn command_reply(device_type: u16, request: &Packet, relays: &Mutex<u8>) -> Vec<u8> {
    let p = &request.payload;
    let mut reply = vec![0u8; 16];
    match device_type {
        // MP1
        0x4eb5 => match p.first() {
            Some(0x0d) => {
                let mask = p[0x0d];
                let mut state = relays.lock();
                if p[0x0e] != 0 {
                    *state |= mask;
                } else {
                    *state &= !mask;
                }
            }
            Some(0x0a) => reply[0x0e] = *relays.lock(),
            _ => {}
        },
        // A1
        0x2714 => {
            reply[0x04] = 21;
            reply[0x05] = 5;
            reply[0x06] = 48;
            reply[0x07] = 2;
            reply[0x08] = 1;
            reply[0x0a] = 0;
            reply[0x0c] = 2;
        }
        _ => {}
    }
    reply
}
