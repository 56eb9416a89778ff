mod common;

use broadlink_local::{Config, DeviceTypeCode, Manager, PairingState};
use common::{Behaviour, FakeHub};
use futures_util::StreamExt;
use std::net::Ipv4Addr;
use std::time::Duration;

#[tokio::test]
async fn targeted_discovery_finds_compatible_sensor() {
    let hub = FakeHub::spawn(0x2714, Behaviour::Normal).await;
    let manager = Manager::new(Config::default().with_device_port(hub.port()));

    let found: Vec<_> = manager
        .start_discovery(
            Duration::from_secs(2),
            Ipv4Addr::LOCALHOST,
            Some(Ipv4Addr::LOCALHOST),
        )
        .collect()
        .await;

    assert_eq!(found.len(), 1);
    let device = found[0].as_ref().unwrap();
    assert_eq!(device.device_type, DeviceTypeCode(0x2714));
    assert!(device.is_compatible);
    assert_eq!(device.name.as_deref(), Some("Fake hub"));
}

#[tokio::test]
async fn pairing_lists_a_persistable_record() {
    let hub = FakeHub::spawn(0x4eb5, Behaviour::Normal).await;
    let manager = Manager::new(Config::default().with_device_port(hub.port()));
    let pairing = manager.pairing(Some(DeviceTypeCode(0x4eb5)));

    pairing
        .discover(
            Duration::from_secs(2),
            Ipv4Addr::LOCALHOST,
            Some(Ipv4Addr::LOCALHOST),
        )
        .await
        .unwrap();
    assert_eq!(pairing.state(), Ok(PairingState::Resolved));

    let record = pairing.finalize_listing().unwrap();
    let json = serde_json::to_value(&record).unwrap();
    assert_eq!(json["id"], "34EA34123456");
    assert_eq!(json["name"], "MP1 (34:EA:34:12:34:56)");
    assert_eq!(json["mac"], "34:EA:34:12:34:56");
    assert_eq!(json["type_name"], "4EB5");
    assert_eq!(json["is_compatible"], true);

    // The listed record is enough to open a working session.
    let strip = manager
        .create_session(record.mac, record.ip_address, record.device_type.into())
        .await
        .unwrap();
    strip.set_relay(1, true).await.unwrap();
    assert!(strip.read_relays().await.unwrap().is_on(1));

    pairing.close();
    assert!(pairing.state().is_err());
}

#[tokio::test]
async fn incompatible_model_is_flagged() {
    let hub = FakeHub::spawn(0x2714, Behaviour::Normal).await;
    let manager = Manager::new(Config::default().with_device_port(hub.port()));
    let pairing = manager.pairing(Some(DeviceTypeCode(0x4eb5)));

    let candidate = pairing
        .discover(
            Duration::from_secs(2),
            Ipv4Addr::LOCALHOST,
            Some(Ipv4Addr::LOCALHOST),
        )
        .await
        .unwrap()
        .unwrap();
    assert!(!candidate.is_compatible);
    assert!(!pairing.finalize_listing().unwrap().is_compatible);
}
