//! Host-facing management of discovery, pairing and device sessions.
//! Provides a unified event stream over every managed session.

use crate::config::Config;
use crate::device::DeviceSession;
use crate::error::{BroadlinkError, Result};
use crate::pairing::PairingSession;
use crate::poller::{PollEvent, PollHandle, PollingEngine};
use crate::protocol::{DeviceTypeCode, MacAddress};
use crate::scanner::{DiscoveredDevice, Scanner};
use crate::state::StateEvent;
use futures_util::{Stream, StreamExt};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// An event from any session managed by a [`Manager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    /// A polled field changed
    State { device_id: String, event: StateEvent },
    /// A session-level failure (`Unreachable`, `AuthFailure`, `ChecksumMismatch`)
    SessionError {
        device_id: String,
        error: BroadlinkError,
    },
}

impl ManagerEvent {
    pub fn device_id(&self) -> &str {
        match self {
            ManagerEvent::State { device_id, .. } | ManagerEvent::SessionError { device_id, .. } => {
                device_id
            }
        }
    }
}

struct ManagedSession {
    session: DeviceSession,
    token: CancellationToken,
    poller: Option<PollHandle>,
}

struct ManagerInner {
    config: Config,
    sessions: RwLock<HashMap<String, ManagedSession>>,
    event_tx: broadcast::Sender<ManagerEvent>,
    cancel_token: CancellationToken,
}

/// Entry point for an automation host.
///
/// Sessions are keyed by their MAC-derived id and are independent of one
/// another; the manager only forwards what they report.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

impl Manager {
    pub fn new(config: Config) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(ManagerInner {
                config,
                sessions: RwLock::new(HashMap::new()),
                event_tx,
                cancel_token: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Returns a Stream of events from all managed sessions.
    pub fn stream(&self) -> impl Stream<Item = ManagerEvent> + Send + use<> {
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

    /// Discover devices; the stream ends when the window closes.
    pub fn start_discovery(
        &self,
        timeout: Duration,
        local_address: Ipv4Addr,
        target: Option<Ipv4Addr>,
    ) -> impl Stream<Item = Result<DiscoveredDevice>> + Send + use<> {
        Scanner::new(&self.inner.config).discover_stream(timeout, local_address, target)
    }

    /// Begin a fresh pairing attempt for the expected model.
    pub fn pairing(&self, expected: Option<DeviceTypeCode>) -> PairingSession {
        PairingSession::new(&self.inner.config, expected)
    }

    /// Create and register a session for a paired device.
    ///
    /// Returns an error if a session with the same id already exists.
    pub async fn create_session(
        &self,
        mac: MacAddress,
        ip_address: IpAddr,
        device_type: DeviceTypeCode,
    ) -> Result<DeviceSession> {
        let id = mac.to_id();
        let mut sessions = self.inner.sessions.write().await;
        if sessions.contains_key(&id) {
            return Err(BroadlinkError::InvalidArgument(format!(
                "session {} already exists",
                id
            )));
        }

        let session = DeviceSession::new(mac, ip_address, device_type, &self.inner.config);
        let token = self.inner.cancel_token.child_token();
        self.spawn_notice_monitor(&session, token.clone());
        sessions.insert(
            id.clone(),
            ManagedSession {
                session: session.clone(),
                token,
                poller: None,
            },
        );
        info!("Session {} added to manager", id);
        Ok(session)
    }

    /// Get a session by id.
    pub async fn session(&self, id: &str) -> Option<DeviceSession> {
        self.inner
            .sessions
            .read()
            .await
            .get(id)
            .map(|m| m.session.clone())
    }

    /// Session ids mapped to whether they are being polled.
    pub async fn list(&self) -> HashMap<String, bool> {
        self.inner
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, m)| (id.clone(), m.poller.is_some()))
            .collect()
    }

    /// Poll a session on a timer; `None` uses the configured interval.
    ///
    /// Families without a state read-back are accepted and left idle.
    /// Restarting replaces any running poller.
    pub async fn start_polling(&self, id: &str, interval: Option<Duration>) -> Result<()> {
        let mut sessions = self.inner.sessions.write().await;
        let managed = sessions
            .get_mut(id)
            .ok_or_else(|| BroadlinkError::InvalidArgument(format!("no session {}", id)))?;

        if !managed.session.family().polls() {
            info!(
                "{} ({}) has nothing to poll",
                id,
                managed.session.family().name()
            );
            return Ok(());
        }
        if let Some(old) = managed.poller.take() {
            old.stop();
        }

        let interval = interval.unwrap_or_else(|| self.inner.config.poll_interval());
        let poll_token = managed.token.child_token();
        let (poll_tx, poll_rx) = broadcast::channel(32);
        self.spawn_poll_forwarder(poll_rx, poll_token.clone());
        let handle = PollingEngine::new(id, managed.session.clone()).spawn(
            interval,
            poll_tx,
            poll_token,
        );
        managed.poller = Some(handle);
        Ok(())
    }

    pub async fn stop_polling(&self, id: &str) {
        let mut sessions = self.inner.sessions.write().await;
        match sessions.get_mut(id).and_then(|m| m.poller.take()) {
            Some(handle) => {
                handle.stop();
                info!("Stopped polling {}", id);
            }
            None => debug!("{} was not being polled", id),
        }
    }

    /// Stop polling, close the session and forget it.
    pub async fn remove(&self, id: &str) {
        let removed = self.inner.sessions.write().await.remove(id);
        if let Some(managed) = removed {
            managed.token.cancel();
            managed.session.close().await;
            info!("Session {} removed from manager", id);
        } else {
            warn!("Attempted to remove non-existent session {}", id);
        }
    }

    /// Close every session and stop all background tasks.
    pub async fn shutdown(self) {
        self.inner.cancel_token.cancel();
        let drained: Vec<ManagedSession> = self
            .inner
            .sessions
            .write()
            .await
            .drain()
            .map(|(_, m)| m)
            .collect();
        for managed in drained {
            managed.session.close().await;
        }
        info!("Manager shut down");
    }

    fn spawn_notice_monitor(&self, session: &DeviceSession, token: CancellationToken) {
        let device_id = session.id().to_string();
        let notices = session.notices();
        let event_tx = self.inner.event_tx.clone();

        tokio::spawn(async move {
            tokio::pin!(notices);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    notice = notices.next() => match notice {
                        Some(error) => {
                            let _ = event_tx.send(ManagerEvent::SessionError {
                                device_id: device_id.clone(),
                                error,
                            });
                        }
                        None => break,
                    }
                }
            }
            debug!("Notice monitor for {} stopped", device_id);
        });
    }

    fn spawn_poll_forwarder(
        &self,
        mut poll_rx: broadcast::Receiver<PollEvent>,
        token: CancellationToken,
    ) {
        let event_tx = self.inner.event_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    res = poll_rx.recv() => match res {
                        Ok(PollEvent { device_id, event }) => {
                            let _ = event_tx.send(ManagerEvent::State { device_id, event });
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Dropped {} state events", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        // Stops monitors and pollers; sessions close when their last handle drops.
        self.cancel_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(last: u8) -> MacAddress {
        MacAddress([0x34, 0xea, 0x34, 0, 0, last])
    }

    fn localhost() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    #[tokio::test]
    async fn sessions_are_keyed_by_mac() {
        let manager = Manager::new(Config::default());
        let session = manager
            .create_session(mac(1), localhost(), DeviceTypeCode(0x4eb5))
            .await
            .unwrap();
        assert_eq!(session.id(), "34EA34000001");
        assert!(manager.session("34EA34000001").await.is_some());
        assert!(
            manager
                .create_session(mac(1), localhost(), DeviceTypeCode(0x4eb5))
                .await
                .is_err()
        );

        manager.remove("34EA34000001").await;
        assert!(manager.session("34EA34000001").await.is_none());
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn non_polling_family_stays_idle() {
        let manager = Manager::new(Config::default());
        manager
            .create_session(mac(2), localhost(), DeviceTypeCode(0x4e4d))
            .await
            .unwrap();
        manager.start_polling("34EA34000002", None).await.unwrap();
        assert_eq!(manager.list().await.get("34EA34000002"), Some(&false));
    }

    #[tokio::test]
    async fn polling_unknown_session_fails() {
        let manager = Manager::new(Config::default());
        assert!(manager.start_polling("nope", None).await.is_err());
    }

    #[tokio::test]
    async fn shutdown_closes_sessions() {
        let manager = Manager::new(Config::default());
        let session = manager
            .create_session(mac(3), localhost(), DeviceTypeCode(0x2714))
            .await
            .unwrap();
        manager.clone().shutdown().await;
        assert!(session.is_closed());
        assert!(manager.list().await.is_empty());
    }
}
