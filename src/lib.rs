//! # broadlink-local
//!
//! Asynchronous local-network control of Broadlink smart-home hubs:
//! UDP discovery, the encrypted command channel, and polling that turns
//! device state into edge-triggered events. No cloud involved.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use broadlink_local::{Config, Manager};
//! use std::net::Ipv4Addr;
//! use std::time::Duration;
//!
//! # async fn run() -> broadlink_local::error::Result<()> {
//! let manager = Manager::new(Config::default());
//! let pairing = manager.pairing(None);
//! pairing
//!     .discover(Duration::from_secs(5), Ipv4Addr::UNSPECIFIED, None)
//!     .await?;
//! let record = pairing.finalize_listing()?;
//! let session = manager
//!     .create_session(record.mac, record.ip_address, record.device_type.into())
//!     .await?;
//! session.set_relay(2, true).await?;
//! # Ok(())
//! # }
//! ```
//!
#[macro_use]
pub mod macros;
pub mod config;
pub mod crypto;
pub mod device;
pub mod error;
pub mod family;
pub mod manager;
pub mod pairing;
pub mod poller;
pub mod protocol;
pub mod registry;
pub mod scanner;
pub mod state;
pub mod transport;

pub use config::Config;
pub use device::DeviceSession;
pub use error::BroadlinkError;
pub use manager::{Manager, ManagerEvent};
pub use pairing::{DeviceRecord, PairingEvent, PairingSession, PairingState};
pub use poller::{PollingEngine, StateSource};
pub use protocol::{CommandType, DeviceTypeCode, MacAddress};
pub use registry::DeviceRegistry;
pub use scanner::{DiscoveredDevice, Scanner};
pub use state::{DeviceState, FieldValue, StateEvent};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}

#[cfg(test)]
mod tests {
    #[test]
    fn version_matches_package() {
        assert_eq!(super::version(), env!("CARGO_PKG_VERSION"));
        assert!(!super::version().is_empty());
    }
}
