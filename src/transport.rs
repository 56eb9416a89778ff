//! UDP transport for the command and discovery channels.
//! One lazily opened socket per channel; requests on a channel never overlap.

use crate::error::{BroadlinkError, Result};
use futures_core::stream::Stream;
use log::{debug, warn};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant, sleep_until};
use tokio_util::sync::CancellationToken;

const RECV_BUFFER_LEN: usize = 2048;

/// A single UDP socket owned by one session or one discovery run.
pub struct TransportChannel {
    bind_addr: SocketAddr,
    broadcast: bool,
    // Held for the whole request so counter-bearing writes stay ordered.
    socket: Mutex<Option<Arc<UdpSocket>>>,
    cancel_token: CancellationToken,
}

impl TransportChannel {
    /// Create a channel that binds an ephemeral port on `bind_ip` on first use.
    pub fn new(bind_ip: IpAddr) -> Self {
        Self {
            bind_addr: SocketAddr::new(bind_ip, 0),
            broadcast: false,
            socket: Mutex::new(None),
            cancel_token: CancellationToken::new(),
        }
    }

    /// Allow sending to broadcast addresses.
    pub fn with_broadcast(mut self, enabled: bool) -> Self {
        self.broadcast = enabled;
        self
    }

    /// Create and configure the UDP socket.
    fn create_socket(&self) -> Result<UdpSocket> {
        debug!("Creating UDP socket on {}...", self.bind_addr);
        let socket = Socket::new(
            Domain::for_address(self.bind_addr),
            Type::DGRAM,
            Some(Protocol::UDP),
        )?;

        if self.broadcast
            && let Err(e) = socket.set_broadcast(true)
        {
            warn!("Failed to set broadcast on {}: {}", self.bind_addr, e);
        }

        socket.bind(&SockAddr::from(self.bind_addr))?;
        socket.set_nonblocking(true)?;

        let std_socket: std::net::UdpSocket = socket.into();
        Ok(UdpSocket::from_std(std_socket)?)
    }

    fn ensure_socket(&self, slot: &mut Option<Arc<UdpSocket>>) -> Result<Arc<UdpSocket>> {
        if let Some(socket) = slot {
            return Ok(socket.clone());
        }
        let socket = Arc::new(self.create_socket()?);
        *slot = Some(socket.clone());
        Ok(socket)
    }

    fn check_open(&self) -> Result<()> {
        if self.cancel_token.is_cancelled() {
            Err(BroadlinkError::SessionClosed)
        } else {
            Ok(())
        }
    }

    /// Local port of the socket, opening it if needed.
    pub async fn local_port(&self) -> Result<u16> {
        self.check_open()?;
        let mut slot = self.socket.lock().await;
        let socket = self.ensure_socket(&mut slot)?;
        Ok(socket.local_addr()?.port())
    }

    /// Send one request and wait for the first datagram from the destination host.
    ///
    /// No retries happen here; callers that know the protocol decide.
    pub async fn send(&self, packet: &[u8], dest: SocketAddr, timeout: Duration) -> Result<Vec<u8>> {
        self.send_matching(packet, dest, timeout, |_| true).await
    }

    /// Like [`send`](Self::send), but datagrams rejected by `accept` are
    /// dropped and the wait goes on until the same deadline.
    pub async fn send_matching<F>(
        &self,
        packet: &[u8],
        dest: SocketAddr,
        timeout: Duration,
        accept: F,
    ) -> Result<Vec<u8>>
    where
        F: Fn(&[u8]) -> bool,
    {
        self.check_open()?;
        let mut slot = self.socket.lock().await;
        self.check_open()?;
        let socket = self.ensure_socket(&mut slot)?;

        socket.send_to(packet, dest).await?;
        debug!("Sent {} bytes to {}", packet.len(), dest);

        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; RECV_BUFFER_LEN];
        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => return Err(BroadlinkError::SessionClosed),
                _ = sleep_until(deadline) => return Err(BroadlinkError::Timeout),
                res = socket.recv_from(&mut buf) => {
                    let (len, from) = res?;
                    if from.ip() != dest.ip() {
                        debug!("Ignoring {} bytes from unexpected peer {}", len, from);
                        continue;
                    }
                    if !accept(&buf[..len]) {
                        debug!("Dropping stale {} byte reply from {}", len, from);
                        continue;
                    }
                    return Ok(buf[..len].to_vec());
                }
            }
        }
    }

    /// Send one datagram and yield every reply until `window` elapses or
    /// `quota` replies have arrived.
    pub fn collect(
        &self,
        packet: Vec<u8>,
        dest: SocketAddr,
        window: Duration,
        quota: Option<usize>,
    ) -> impl Stream<Item = Result<(Vec<u8>, SocketAddr)>> + Send + '_ {
        async_stream::stream! {
            if let Err(e) = self.check_open() {
                yield Err(e);
                return;
            }
            let mut slot = self.socket.lock().await;
            let socket = match self.ensure_socket(&mut slot) {
                Ok(s) => s,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            if let Err(e) = socket.send_to(&packet, dest).await {
                yield Err(e.into());
                return;
            }
            debug!("Sent {} bytes to {}, collecting for {:?}", packet.len(), dest, window);

            let deadline = Instant::now() + window;
            let mut received = 0usize;
            let mut buf = vec![0u8; RECV_BUFFER_LEN];
            loop {
                if quota.is_some_and(|q| received >= q) {
                    break;
                }
                let next = tokio::select! {
                    _ = self.cancel_token.cancelled() => None,
                    _ = sleep_until(deadline) => None,
                    res = socket.recv_from(&mut buf) => Some(res),
                };
                match next {
                    Some(Ok((len, from))) => {
                        received += 1;
                        yield Ok((buf[..len].to_vec(), from));
                    }
                    Some(Err(e)) => {
                        warn!("Receive failed while collecting replies: {}", e);
                        break;
                    }
                    None => break,
                }
            }
            debug!("Collected {} replies", received);
        }
    }

    /// Abort any outstanding wait and release the socket.
    pub async fn close(&self) {
        self.cancel_token.cancel();
        self.socket.lock().await.take();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::net::Ipv4Addr;

    async fn echo_peer() -> (Arc<UdpSocket>, SocketAddr) {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    #[tokio::test]
    async fn send_returns_reply() {
        let (peer, addr) = echo_peer().await;
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (len, from) = peer.recv_from(&mut buf).await.unwrap();
            peer.send_to(&buf[..len], from).await.unwrap();
        });

        let channel = TransportChannel::new(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let reply = channel
            .send(b"ping", addr, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply, b"ping");
    }

    #[tokio::test]
    async fn rejected_replies_are_skipped() {
        let (peer, addr) = echo_peer().await;
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (_, from) = peer.recv_from(&mut buf).await.unwrap();
            peer.send_to(b"old", from).await.unwrap();
            peer.send_to(b"new", from).await.unwrap();
        });

        let channel = TransportChannel::new(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let reply = channel
            .send_matching(b"ping", addr, Duration::from_secs(2), |raw| raw == b"new")
            .await
            .unwrap();
        assert_eq!(reply, b"new");
    }

    #[tokio::test]
    async fn only_rejected_replies_is_a_timeout() {
        let (peer, addr) = echo_peer().await;
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (_, from) = peer.recv_from(&mut buf).await.unwrap();
            peer.send_to(b"old", from).await.unwrap();
        });

        let channel = TransportChannel::new(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let res = channel
            .send_matching(b"ping", addr, Duration::from_millis(100), |_| false)
            .await;
        assert_eq!(res, Err(BroadlinkError::Timeout));
    }

    #[tokio::test]
    async fn silence_is_a_timeout() {
        let (_peer, addr) = echo_peer().await;
        let channel = TransportChannel::new(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let res = channel.send(b"ping", addr, Duration::from_millis(50)).await;
        assert_eq!(res, Err(BroadlinkError::Timeout));
    }

    #[tokio::test]
    async fn closed_channel_refuses_requests() {
        let (_peer, addr) = echo_peer().await;
        let channel = TransportChannel::new(IpAddr::V4(Ipv4Addr::LOCALHOST));
        channel.close().await;
        assert!(channel.is_closed());
        let res = channel.send(b"ping", addr, Duration::from_millis(50)).await;
        assert_eq!(res, Err(BroadlinkError::SessionClosed));
    }

    #[tokio::test]
    async fn close_aborts_outstanding_wait() {
        let (_peer, addr) = echo_peer().await;
        let channel = Arc::new(TransportChannel::new(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        let waiter = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.send(b"ping", addr, Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        channel.close().await;
        let res = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("send should be aborted")
            .unwrap();
        assert_eq!(res, Err(BroadlinkError::SessionClosed));
    }

    #[tokio::test]
    async fn collect_stops_at_quota() {
        let (peer, addr) = echo_peer().await;
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (_, from) = peer.recv_from(&mut buf).await.unwrap();
            for i in 0..3u8 {
                peer.send_to(&[i], from).await.unwrap();
            }
        });

        let channel = TransportChannel::new(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let replies: Vec<_> = channel
            .collect(b"hello".to_vec(), addr, Duration::from_secs(2), Some(2))
            .collect()
            .await;
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].as_ref().unwrap().0, vec![0]);
    }

    #[tokio::test]
    async fn collect_with_no_replies_is_empty() {
        let (_peer, addr) = echo_peer().await;
        let channel = TransportChannel::new(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let replies: Vec<_> = channel
            .collect(b"hello".to_vec(), addr, Duration::from_millis(50), None)
            .collect()
            .await;
        assert!(replies.is_empty());
    }
}
