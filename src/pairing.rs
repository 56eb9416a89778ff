//! Pairing state machine.
//!
//! A pairing session drives one discovery run and hands exactly one device
//! record to the host. States move `Idle -> Discovering -> Resolved -> Listed`,
//! with `Discovering -> Idle` on cancel and any state `-> Closed` on close.

use crate::config::Config;
use crate::error::{BroadlinkError, Result};
use crate::protocol::{DeviceTypeCode, MacAddress};
use crate::scanner::{DiscoveredDevice, Scanner};
use futures_core::stream::Stream;
use futures_util::StreamExt;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingState {
    Idle,
    Discovering,
    Resolved,
    Listed,
    Closed,
}

/// Record handed to the host for persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceRecord {
    /// MAC as twelve upper-case hex digits
    pub id: String,
    /// Display name annotated with the MAC
    pub name: String,
    pub display_name: String,
    pub mac: MacAddress,
    pub device_type: u16,
    pub type_name: String,
    pub ip_address: IpAddr,
    pub is_compatible: bool,
}

impl From<&DiscoveredDevice> for DeviceRecord {
    fn from(device: &DiscoveredDevice) -> Self {
        let display_name = device.descriptor.display_name.to_string();
        Self {
            id: device.mac.to_id(),
            name: format!("{} ({})", display_name, device.mac),
            display_name,
            mac: device.mac,
            device_type: device.device_type.0,
            type_name: device.device_type.type_name(),
            ip_address: device.ip_address,
            is_compatible: device.is_compatible,
        }
    }
}

/// Outbound notifications of a pairing session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingEvent {
    StateChanged(PairingState),
    /// A reply replaced the held candidate
    Candidate(DiscoveredDevice),
    /// The discovery window closed without a single reply
    NothingFound,
    Listed(DeviceRecord),
}

struct PairingCore {
    state: PairingState,
    /// Only the latest resolved reply is kept
    candidate: Option<DiscoveredDevice>,
    discovery: Option<CancellationToken>,
    /// Bumped whenever a discovery run is started or abandoned
    generation: u64,
}

struct PairingInner {
    scanner: Scanner,
    core: Mutex<PairingCore>,
    event_tx: broadcast::Sender<PairingEvent>,
    cancel_token: CancellationToken,
}

/// A short-lived pairing attempt. Create a fresh one per attempt.
#[derive(Clone)]
pub struct PairingSession {
    inner: Arc<PairingInner>,
}

impl PairingSession {
    /// `expected` is the model the host is pairing for; it decides the
    /// compatibility flag of every candidate.
    pub fn new(config: &Config, expected: Option<DeviceTypeCode>) -> Self {
        let mut scanner = Scanner::new(config);
        if let Some(code) = expected {
            scanner = scanner.expecting(code);
        }
        Self::with_scanner(scanner)
    }

    pub fn with_scanner(scanner: Scanner) -> Self {
        let (event_tx, _) = broadcast::channel(32);
        Self {
            inner: Arc::new(PairingInner {
                scanner,
                core: Mutex::new(PairingCore {
                    state: PairingState::Idle,
                    candidate: None,
                    discovery: None,
                    generation: 0,
                }),
                event_tx,
                cancel_token: CancellationToken::new(),
            }),
        }
    }

    /// Current state; fails once the session is closed.
    pub fn state(&self) -> Result<PairingState> {
        match self.inner.core.lock().state {
            PairingState::Closed => Err(BroadlinkError::SessionClosed),
            state => Ok(state),
        }
    }

    /// The device currently held, if any.
    pub fn candidate(&self) -> Result<Option<DiscoveredDevice>> {
        let core = self.inner.core.lock();
        if core.state == PairingState::Closed {
            return Err(BroadlinkError::SessionClosed);
        }
        Ok(core.candidate.clone())
    }

    /// Stream of pairing notifications.
    pub fn events(&self) -> impl Stream<Item = PairingEvent> + Send + use<> {
        let mut rx = self.inner.event_tx.subscribe();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
        }
    }

    /// Run discovery in the background.
    pub fn start_discovery(
        &self,
        max_wait: Duration,
        local_address: Ipv4Addr,
        target: Option<Ipv4Addr>,
    ) -> JoinHandle<Result<Option<DiscoveredDevice>>> {
        let session = self.clone();
        tokio::spawn(async move { session.discover(max_wait, local_address, target).await })
    }

    /// Run one discovery window and return the candidate held at its end.
    ///
    /// Starting while a run is in flight abandons the older run. A window
    /// with no replies leaves the session in `Discovering`. A socket failure
    /// is returned as an error and moves `Discovering` back to `Idle`.
    pub async fn discover(
        &self,
        max_wait: Duration,
        local_address: Ipv4Addr,
        target: Option<Ipv4Addr>,
    ) -> Result<Option<DiscoveredDevice>> {
        let (generation, token, entered) = {
            let mut core = self.inner.core.lock();
            match core.state {
                PairingState::Closed => return Err(BroadlinkError::SessionClosed),
                PairingState::Listed => {
                    return Err(BroadlinkError::InvalidArgument(
                        "pairing already listed its device".into(),
                    ));
                }
                _ => {}
            }
            if let Some(previous) = core.discovery.take() {
                debug!("Abandoning previous discovery run");
                previous.cancel();
            }
            let token = self.inner.cancel_token.child_token();
            core.generation += 1;
            core.discovery = Some(token.clone());
            let entered = core.candidate.is_none() && core.state != PairingState::Discovering;
            if core.candidate.is_none() {
                core.state = PairingState::Discovering;
            }
            (core.generation, token, entered)
        };
        if entered {
            self.emit(PairingEvent::StateChanged(PairingState::Discovering));
        }

        let stream = self
            .inner
            .scanner
            .discover_stream(max_wait, local_address, target);
        tokio::pin!(stream);
        let mut replies = 0usize;
        let mut failure = None;
        loop {
            let item = tokio::select! {
                _ = token.cancelled() => break,
                item = stream.next() => item,
            };
            match item {
                Some(Ok(device)) => {
                    replies += 1;
                    self.offer(generation, device);
                }
                Some(Err(e)) => {
                    warn!("Discovery failed: {}", e);
                    failure = Some(e);
                    break;
                }
                None => break,
            }
        }

        let mut core = self.inner.core.lock();
        if core.generation != generation {
            // Cancelled, closed or superseded.
            return match core.state {
                PairingState::Closed => Err(BroadlinkError::SessionClosed),
                _ => Ok(core.candidate.clone()),
            };
        }
        core.discovery = None;
        if let Some(e) = failure {
            // Socket failure, not an empty window.
            let fell_back = core.state == PairingState::Discovering;
            if fell_back {
                core.state = PairingState::Idle;
            }
            drop(core);
            if fell_back {
                self.emit(PairingEvent::StateChanged(PairingState::Idle));
            }
            return Err(e);
        }
        let candidate = core.candidate.clone();
        drop(core);

        if replies == 0 && candidate.is_none() {
            info!("Discovery window closed without replies");
            self.emit(PairingEvent::NothingFound);
        }
        Ok(candidate)
    }

    /// Abort an in-flight discovery. `Discovering` falls back to `Idle`;
    /// a held candidate is kept.
    pub fn cancel(&self) -> Result<()> {
        let mut core = self.inner.core.lock();
        if core.state == PairingState::Closed {
            return Err(BroadlinkError::SessionClosed);
        }
        if let Some(token) = core.discovery.take() {
            token.cancel();
        }
        core.generation += 1;
        if core.state == PairingState::Discovering {
            core.state = PairingState::Idle;
            drop(core);
            info!("Discovery cancelled");
            self.emit(PairingEvent::StateChanged(PairingState::Idle));
        }
        Ok(())
    }

    /// Produce the record for the held device and release it.
    pub fn finalize_listing(&self) -> Result<DeviceRecord> {
        let mut core = self.inner.core.lock();
        match core.state {
            PairingState::Closed => return Err(BroadlinkError::SessionClosed),
            PairingState::Listed => return Err(BroadlinkError::NothingDiscovered),
            _ => {}
        }
        let device = core.candidate.take().ok_or(BroadlinkError::NothingDiscovered)?;
        if let Some(token) = core.discovery.take() {
            token.cancel();
        }
        core.generation += 1;
        core.state = PairingState::Listed;
        drop(core);

        let record = DeviceRecord::from(&device);
        info!("Listing device {} ({})", record.name, record.type_name);
        self.emit(PairingEvent::StateChanged(PairingState::Listed));
        self.emit(PairingEvent::Listed(record.clone()));
        Ok(record)
    }

    /// Release everything; later queries fail with `SessionClosed`.
    pub fn close(&self) {
        let mut core = self.inner.core.lock();
        if core.state == PairingState::Closed {
            return;
        }
        self.inner.cancel_token.cancel();
        core.discovery = None;
        core.candidate = None;
        core.generation += 1;
        core.state = PairingState::Closed;
        drop(core);
        debug!("Pairing session closed");
        self.emit(PairingEvent::StateChanged(PairingState::Closed));
    }

    fn offer(&self, generation: u64, device: DiscoveredDevice) {
        let mut core = self.inner.core.lock();
        if core.generation != generation {
            return;
        }
        let first = core.candidate.is_none();
        core.candidate = Some(device.clone());
        core.state = PairingState::Resolved;
        drop(core);

        self.emit(PairingEvent::Candidate(device));
        if first {
            self.emit(PairingEvent::StateChanged(PairingState::Resolved));
        }
    }

    fn emit(&self, event: PairingEvent) {
        let _ = self.inner.event_tx.send(event);
    }
}

impl Drop for PairingInner {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
