//! UDP-based device discovery.
//! Broadcasts a hello packet and resolves every reply through the device registry.

use crate::config::Config;
use crate::error::Result;
use crate::protocol::{self, DeviceTypeCode, HelloClock, HelloReply, MacAddress};
use crate::registry::{DeviceDescriptor, DeviceRegistry};
use crate::transport::TransportChannel;
use futures_core::stream::Stream;
use futures_util::StreamExt;
use log::{debug, info};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::time::Duration;

/// A device that answered a discovery broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub device_type: DeviceTypeCode,
    /// Display order (already re-reversed from the wire)
    pub mac: MacAddress,
    pub ip_address: IpAddr,
    pub is_compatible: bool,
    pub descriptor: DeviceDescriptor,
    /// Name the device reports for itself, if any
    pub name: Option<String>,
    pub is_locked: bool,
}

/// Scanner discovers hub devices on the local network using UDP broadcast.
///
/// Each call opens its own socket, so discovery is restartable and no state
/// is shared between runs.
#[derive(Debug, Clone)]
pub struct Scanner {
    registry: DeviceRegistry,
    /// Code the caller is pairing for; drives `is_compatible`
    expected: Option<DeviceTypeCode>,
    bind_address: IpAddr,
    device_port: u16,
}

impl Scanner {
    pub fn new(config: &Config) -> Self {
        Self {
            registry: DeviceRegistry::new(config),
            expected: None,
            bind_address: config.bind_address,
            device_port: config.device_port,
        }
    }

    /// Judge compatibility against this model.
    pub fn expecting(mut self, code: DeviceTypeCode) -> Self {
        self.expected = Some(code);
        self
    }

    /// Port devices are addressed on.
    pub fn with_port(mut self, port: u16) -> Self {
        self.device_port = port;
        self
    }

    /// Best-effort guess of the local IPv4 address used for the default route.
    pub fn local_ipv4() -> Option<Ipv4Addr> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect("8.8.8.8:80").ok()?;
        match socket.local_addr().ok()?.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        }
    }

    /// Resolve a decoded reply into a device record.
    pub fn resolve(&self, reply: HelloReply, ip_address: IpAddr) -> DiscoveredDevice {
        let descriptor = self.registry.lookup(reply.device_type);
        let is_compatible = match self.expected {
            Some(expected) => self.registry.is_compatible(reply.device_type, expected),
            None => descriptor.is_known(),
        };
        DiscoveredDevice {
            device_type: reply.device_type,
            mac: reply.mac,
            ip_address,
            is_compatible,
            descriptor,
            name: reply.name,
            is_locked: reply.is_locked,
        }
    }

    /// Discover devices lazily.
    ///
    /// Broadcasts (or unicasts to `target`) one hello packet and yields each
    /// resolved reply until `max_wait` elapses. An empty stream is a valid
    /// outcome; only socket failures are reported as errors.
    pub fn discover_stream(
        &self,
        max_wait: Duration,
        local_address: Ipv4Addr,
        target: Option<Ipv4Addr>,
    ) -> impl Stream<Item = Result<DiscoveredDevice>> + Send + use<> {
        let scanner = self.clone();
        async_stream::stream! {
            let bind_ip = if local_address.is_unspecified() {
                scanner.bind_address
            } else {
                IpAddr::V4(local_address)
            };
            let transport = TransportChannel::new(bind_ip).with_broadcast(target.is_none());

            let session = match transport.local_port().await {
                Ok(port) => port,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            let hello = protocol::encode_hello(local_address, session, HelloClock::now());
            let dest = SocketAddr::new(
                IpAddr::V4(target.unwrap_or(Ipv4Addr::BROADCAST)),
                scanner.device_port,
            );
            info!(
                "Starting device discovery (dest: {}, window: {:?}, session: {})...",
                dest, max_wait, session
            );

            // A targeted hello can only be answered by one device.
            let quota = target.map(|_| 1);
            let mut seen = HashSet::new();
            let mut found = 0usize;
            {
                let replies = transport.collect(hello, dest, max_wait, quota);
                tokio::pin!(replies);
                while let Some(item) = replies.next().await {
                    let (data, from) = match item {
                        Ok(r) => r,
                        Err(e) => {
                            yield Err(e);
                            break;
                        }
                    };
                    match protocol::decode_hello_reply(&data) {
                        Ok(reply) => {
                            if !seen.insert(reply.mac) {
                                debug!("Duplicate discovery reply from {}", reply.mac);
                                continue;
                            }
                            let device = scanner.resolve(reply, from.ip());
                            info!(
                                "Found device: type={} ({}), MAC={}, IP={}, compatible={}",
                                device.device_type,
                                device.descriptor.display_name,
                                device.mac,
                                device.ip_address,
                                device.is_compatible
                            );
                            found += 1;
                            yield Ok(device);
                        }
                        Err(e) => debug!("Ignoring {} byte packet from {}: {}", data.len(), from, e),
                    }
                }
            }
            transport.close().await;
            info!("Discovery finished. Found {} devices.", found);
        }
    }

    /// Discover devices and collect them once the window closes.
    pub async fn discover(
        &self,
        max_wait: Duration,
        local_address: Ipv4Addr,
        target: Option<Ipv4Addr>,
    ) -> Result<Vec<DiscoveredDevice>> {
        let stream = self.discover_stream(max_wait, local_address, target);
        tokio::pin!(stream);
        let mut devices = Vec::new();
        while let Some(item) = stream.next().await {
            devices.push(item?);
        }
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UdpSocket;

    async fn fake_device(replies: Vec<HelloReply>) -> u16 {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 128];
            let (len, from) = socket.recv_from(&mut buf).await.unwrap();
            assert_eq!(len, protocol::DISCOVERY_LEN);
            for reply in replies {
                socket
                    .send_to(&protocol::encode_hello_reply(&reply), from)
                    .await
                    .unwrap();
            }
        });
        port
    }

    fn reply(code: u16, last: u8) -> HelloReply {
        HelloReply {
            device_type: DeviceTypeCode(code),
            mac: MacAddress([0x34, 0xea, 0x34, 0x00, 0x00, last]),
            name: None,
            is_locked: false,
        }
    }

    #[test]
    fn resolve_without_expectation_uses_table_membership() {
        let scanner = Scanner::new(&Config::default());
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        assert!(scanner.resolve(reply(0x2714, 1), ip).is_compatible);
        assert!(!scanner.resolve(reply(0xBEEF, 1), ip).is_compatible);
    }

    #[tokio::test]
    async fn targeted_discovery_resolves_reply() {
        let port = fake_device(vec![reply(0x2714, 1)]).await;
        let scanner = Scanner::new(&Config::default())
            .expecting(DeviceTypeCode(0x2714))
            .with_port(port);

        let devices = scanner
            .discover(
                Duration::from_secs(2),
                Ipv4Addr::LOCALHOST,
                Some(Ipv4Addr::LOCALHOST),
            )
            .await
            .unwrap();

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].device_type, DeviceTypeCode(0x2714));
        assert!(devices[0].is_compatible);
        assert_eq!(devices[0].mac.to_string(), "34:EA:34:00:00:01");
        assert_eq!(devices[0].ip_address, IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[tokio::test]
    async fn stream_outlives_its_scanner() {
        let port = fake_device(vec![reply(0x4eb5, 2)]).await;
        let stream = Scanner::new(&Config::default()).with_port(port).discover_stream(
            Duration::from_secs(2),
            Ipv4Addr::LOCALHOST,
            Some(Ipv4Addr::LOCALHOST),
        );
        let found: Vec<_> = tokio::task::spawn(stream.collect::<Vec<_>>()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].as_ref().unwrap().device_type, DeviceTypeCode(0x4eb5));
    }

    #[tokio::test]
    async fn silent_network_yields_empty_sequence() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        let scanner = Scanner::new(&Config::default()).with_port(port);

        let devices = scanner
            .discover(
                Duration::from_millis(100),
                Ipv4Addr::LOCALHOST,
                Some(Ipv4Addr::LOCALHOST),
            )
            .await
            .unwrap();
        assert!(devices.is_empty());
    }
}
