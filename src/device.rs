//! Authenticated command sessions with a single paired device.

use crate::config::Config;
use crate::error::{BroadlinkError, Result};
use crate::family::{
    self, Climate, CoverAction, Family, RelayMask, Request, SensorReading, SwitchStatus,
    ThermostatStatus,
};
use crate::protocol::{
    self, Codec, CommandType, DeviceTypeCode, MacAddress, Packet, SessionCredentials,
};
use crate::registry::{CompatClass, DeviceDescriptor, DeviceRegistry};
use crate::state::DeviceState;
use crate::transport::TransportChannel;
use byteorder::{ByteOrder, LittleEndian};
use futures_core::stream::Stream;
use log::{debug, info, warn};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

const AUTH_PAYLOAD_LEN: usize = 0x50;
/// Device id plus session key
const AUTH_REPLY_LEN: usize = 0x14;
/// Sends per request before a silent device is declared unreachable
const SEND_ATTEMPTS: usize = 2;

fn auth_payload() -> Vec<u8> {
    let mut payload = vec![0u8; AUTH_PAYLOAD_LEN];
    payload[0x04..0x13].fill(b'1');
    payload[0x1e] = 0x01;
    payload[0x2d] = 0x01;
    payload[0x30..0x37].copy_from_slice(b"Test  1");
    payload
}

/// Mutable half of a session; held for the whole of one request.
struct SessionCore {
    credentials: SessionCredentials,
    authenticated: bool,
}

struct SessionInner {
    id: String,
    address: SocketAddr,
    descriptor: DeviceDescriptor,
    family: Family,
    codec: Codec,
    command_timeout: Duration,
    transport: TransportChannel,
    core: Mutex<SessionCore>,
    notice_tx: broadcast::Sender<BroadlinkError>,
    cancel_token: CancellationToken,
}

/// A long-lived session with one paired device.
///
/// Requests on a session are strictly sequential; separate sessions share
/// nothing and run in parallel. Cloning yields another handle to the same
/// session.
#[derive(Clone)]
pub struct DeviceSession {
    inner: Arc<SessionInner>,
}

impl DeviceSession {
    // -------------------------------------------------------------------------
    // Public API
    // -------------------------------------------------------------------------

    /// Create a session for a device. No traffic happens until the first command.
    pub fn new(mac: MacAddress, ip_address: IpAddr, device_type: DeviceTypeCode, config: &Config) -> Self {
        let descriptor = DeviceRegistry::new(config).lookup(device_type);
        let bind_ip = match (ip_address, config.bind_address) {
            (IpAddr::V4(_), bind @ IpAddr::V4(_)) => bind,
            (IpAddr::V6(_), bind @ IpAddr::V6(_)) => bind,
            (IpAddr::V4(_), _) => IpAddr::from([0, 0, 0, 0]),
            (IpAddr::V6(_), _) => IpAddr::from([0u16; 8]),
        };
        let (notice_tx, _) = broadcast::channel(16);

        info!(
            "Creating session for {} ({}) at {}",
            mac, descriptor.display_name, ip_address
        );
        Self {
            inner: Arc::new(SessionInner {
                id: mac.to_id(),
                address: SocketAddr::new(ip_address, config.device_port),
                family: Family::new(descriptor.class),
                descriptor,
                codec: Codec::new(device_type),
                command_timeout: config.command_timeout(),
                transport: TransportChannel::new(bind_ip),
                core: Mutex::new(SessionCore {
                    credentials: SessionCredentials::new(mac),
                    authenticated: false,
                }),
                notice_tx,
                cancel_token: CancellationToken::new(),
            }),
        }
    }

    /// Stable identifier: the MAC as twelve hex digits.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn address(&self) -> SocketAddr {
        self.inner.address
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.inner.descriptor
    }

    pub fn family(&self) -> Family {
        self.inner.family
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel_token.is_cancelled()
    }

    /// Counter value stamped on the most recent packet.
    pub async fn counter(&self) -> u16 {
        self.inner.core.lock().await.credentials.counter
    }

    /// Session-level failures (`Unreachable`, `AuthFailure`, `ChecksumMismatch`).
    pub fn notices(&self) -> impl Stream<Item = BroadlinkError> + Send + use<> {
        let mut rx = self.inner.notice_tx.subscribe();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(err) => yield err,
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
        }
    }

    /// Tear the session down, aborting any outstanding request.
    pub async fn close(&self) {
        info!("Closing session for {}", self.inner.id);
        self.inner.cancel_token.cancel();
        self.inner.transport.close().await;
    }

    /// Run the key exchange now instead of before the first command.
    pub async fn authenticate(&self) -> Result<()> {
        self.check_open()?;
        let mut core = self.inner.core.lock().await;
        let res = self.authenticate_locked(&mut core).await;
        self.report(res)
    }

    /// Send one command and return the decrypted reply payload.
    pub async fn invoke(&self, request: Request) -> Result<Vec<u8>> {
        self.check_open()?;
        let mut core = self.inner.core.lock().await;
        let res = self.invoke_locked(&mut core, &request).await;
        self.report(res.map(|packet| packet.payload))
    }

    /// Read the family's polled fields.
    pub async fn read_state(&self) -> Result<DeviceState> {
        let family = self.family();
        let request = family
            .state_request()
            .ok_or_else(|| family.unsupported("read_state"))?;
        let payload = self.invoke(request).await?;
        family.parse_state(&payload)
    }
}

// -------------------------------------------------------------------------
// Typed commands
// -------------------------------------------------------------------------
impl DeviceSession {
    pub async fn set_power(&self, on: bool) -> Result<()> {
        match self.family().class() {
            CompatClass::Sp1 => self.invoke(family::sp1::set_power(on)).await.map(|_| ()),
            CompatClass::Sp2 | CompatClass::Sp3s => {
                let status = self.read_switch().await?;
                self.write_switch(SwitchStatus { power: on, ..status }).await
            }
            CompatClass::Hysen => {
                let status = self.read_thermostat().await?;
                let payload = self
                    .invoke(family::hysen::set_power(on, status.parental_mode))
                    .await?;
                family::hysen::check_ack(&payload)
            }
            _ => Err(self.family().unsupported("set_power")),
        }
    }

    pub async fn read_power(&self) -> Result<bool> {
        match self.family().class() {
            CompatClass::Sp2 | CompatClass::Sp3s => Ok(self.read_switch().await?.power),
            CompatClass::Hysen => Ok(self.read_thermostat().await?.power),
            _ => Err(self.family().unsupported("read_power")),
        }
    }

    pub async fn set_nightlight(&self, on: bool) -> Result<()> {
        self.require("set_nightlight", &[CompatClass::Sp2, CompatClass::Sp3s])?;
        let status = self.read_switch().await?;
        self.write_switch(SwitchStatus {
            nightlight: on,
            ..status
        })
        .await
    }

    pub async fn read_nightlight(&self) -> Result<bool> {
        self.require("read_nightlight", &[CompatClass::Sp2, CompatClass::Sp3s])?;
        Ok(self.read_switch().await?.nightlight)
    }

    /// Accumulated consumption in kWh.
    pub async fn read_energy(&self) -> Result<f64> {
        self.require("read_energy", &[CompatClass::Sp3s])?;
        let payload = self.invoke(family::switch::energy_request()).await?;
        family::switch::parse_energy(&payload)
    }

    /// Switch relay `relay` (1..=4) of a power strip.
    pub async fn set_relay(&self, relay: u8, on: bool) -> Result<()> {
        self.require("set_relay", &[CompatClass::Mp1])?;
        let request = family::mp1::set_relay(relay, on)?;
        debug!("Setting relay {} of {} to {}", relay, self.inner.id, on);
        self.invoke(request).await.map(|_| ())
    }

    pub async fn read_relays(&self) -> Result<RelayMask> {
        self.require("read_relays", &[CompatClass::Mp1])?;
        let payload = self.invoke(family::mp1::status_request()).await?;
        family::mp1::parse_status(&payload)
    }

    pub async fn read_sensors(&self) -> Result<SensorReading> {
        self.require("read_sensors", &[CompatClass::A1])?;
        let payload = self.invoke(family::a1::sensors_request()).await?;
        family::a1::parse_sensors(&payload)
    }

    pub async fn set_target_temperature(&self, temperature: f32) -> Result<()> {
        self.require("set_target_temperature", &[CompatClass::Hysen])?;
        let request = family::hysen::set_target(temperature)?;
        let payload = self.invoke(request).await?;
        family::hysen::check_ack(&payload)
    }

    pub async fn read_target_temperature(&self) -> Result<f32> {
        Ok(self.read_thermostat().await?.target_temperature)
    }

    pub async fn read_thermostat(&self) -> Result<ThermostatStatus> {
        self.require("read_thermostat", &[CompatClass::Hysen])?;
        let payload = self.invoke(family::hysen::status_request()).await?;
        family::hysen::parse_status(&payload)
    }

    /// Lock or unlock the thermostat's own buttons.
    pub async fn set_parental_mode(&self, on: bool) -> Result<()> {
        self.require("set_parental_mode", &[CompatClass::Hysen])?;
        let status = self.read_thermostat().await?;
        let payload = self
            .invoke(family::hysen::set_power(status.power, on))
            .await?;
        family::hysen::check_ack(&payload)
    }

    pub async fn open_cover(&self) -> Result<()> {
        self.cover(CoverAction::Open, "open_cover").await
    }

    pub async fn close_cover(&self) -> Result<()> {
        self.cover(CoverAction::Close, "close_cover").await
    }

    pub async fn stop_cover(&self) -> Result<()> {
        self.cover(CoverAction::Stop, "stop_cover").await
    }

    pub async fn read_climate(&self) -> Result<Climate> {
        self.require("read_climate", &[CompatClass::Rm4])?;
        let payload = self.invoke(family::rm4::sensors_request()).await?;
        family::rm4::parse_sensors(&payload)
    }

    async fn cover(&self, action: CoverAction, operation: &'static str) -> Result<()> {
        self.require(operation, &[CompatClass::Dooya])?;
        self.invoke(family::dooya::command(action)).await.map(|_| ())
    }

    async fn read_switch(&self) -> Result<SwitchStatus> {
        let payload = self.invoke(family::switch::status_request()).await?;
        family::switch::parse_status(&payload)
    }

    async fn write_switch(&self, status: SwitchStatus) -> Result<()> {
        self.invoke(family::switch::set_status(status)).await.map(|_| ())
    }

    fn require(&self, operation: &'static str, allowed: &[CompatClass]) -> Result<()> {
        self.check_open()?;
        self.family().require(operation, allowed)
    }
}

// -------------------------------------------------------------------------
// Request pipeline
// -------------------------------------------------------------------------
impl DeviceSession {
    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(BroadlinkError::SessionClosed)
        } else {
            Ok(())
        }
    }

    /// Broadcasts session-level failures before handing the result back.
    fn report<T>(&self, res: Result<T>) -> Result<T> {
        if let Err(e) = &res
            && e.is_session_level()
        {
            warn!("Session {} failed: {}", self.inner.id, e);
            let _ = self.inner.notice_tx.send(e.clone());
        }
        res
    }

    async fn invoke_locked(&self, core: &mut SessionCore, request: &Request) -> Result<Packet> {
        if !core.authenticated {
            self.authenticate_locked(core).await?;
        }
        match self.exchange(core, request.command, &request.payload).await {
            Err(BroadlinkError::AuthFailure) => {
                warn!("Key rejected by {}, re-authenticating", self.inner.id);
                self.authenticate_locked(core).await?;
                self.exchange(core, request.command, &request.payload).await
            }
            other => other,
        }
    }

    async fn authenticate_locked(&self, core: &mut SessionCore) -> Result<()> {
        core.authenticated = false;
        core.credentials.reset();

        let reply = self.exchange(core, CommandType::Auth, &auth_payload()).await?;
        if reply.payload.len() < AUTH_REPLY_LEN {
            return Err(BroadlinkError::AuthFailure);
        }
        core.credentials.device_id = LittleEndian::read_u32(&reply.payload[..4]);
        core.credentials.key.copy_from_slice(&reply.payload[4..AUTH_REPLY_LEN]);
        core.authenticated = true;
        info!(
            "Authenticated with {} (device id 0x{:08X})",
            self.inner.id, core.credentials.device_id
        );
        Ok(())
    }

    /// One encode/send/decode round trip under a fresh counter.
    async fn exchange(
        &self,
        core: &mut SessionCore,
        command: CommandType,
        payload: &[u8],
    ) -> Result<Packet> {
        let counter = core.credentials.next_counter();
        let packet = self.inner.codec.encode(command, payload, &core.credentials)?;
        let raw = self.send_with_retry(&packet, counter).await?;
        let reply = self.inner.codec.decode(&raw, &core.credentials)?;
        if reply.error_code != 0 {
            debug!(
                "{} answered {} with error 0x{:04X}",
                self.inner.id, command, reply.error_code
            );
            return Err(BroadlinkError::from_device_code(reply.error_code));
        }
        Ok(reply)
    }

    /// Resends the identical packet once on timeout; the device treats a
    /// repeated counter as the same request. Replies carrying any other
    /// counter belong to an earlier request and are skipped.
    async fn send_with_retry(&self, packet: &[u8], counter: u16) -> Result<Vec<u8>> {
        for attempt in 1..=SEND_ATTEMPTS {
            match self
                .inner
                .transport
                .send_matching(packet, self.inner.address, self.inner.command_timeout, |raw| {
                    protocol::peek_counter(raw) == Some(counter)
                })
                .await
            {
                Ok(raw) => return Ok(raw),
                Err(BroadlinkError::Timeout) => {
                    debug!(
                        "No reply from {} (attempt {}/{})",
                        self.inner.address, attempt, SEND_ATTEMPTS
                    );
                }
                Err(BroadlinkError::Io(e)) => {
                    warn!("Socket failure talking to {}: {}", self.inner.address, e);
                    return Err(BroadlinkError::Unreachable);
                }
                Err(e) => return Err(e),
            }
        }
        Err(BroadlinkError::Unreachable)
    }
}
