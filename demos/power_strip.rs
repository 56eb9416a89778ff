/**
 * Power Strip Example
 *
 * Pairs with the first MP1 power strip found on the network, toggles one
 * outlet and prints state changes reported by the poller.
 *
 * Usage: cargo run --example power_strip [relay]
 */
use broadlink_local::config::{Config, init_logging};
use broadlink_local::{DeviceTypeCode, Manager, ManagerEvent, Scanner};
use futures_util::StreamExt;
use std::net::Ipv4Addr;
use tokio::time::{Duration, sleep};

#[tokio::main]
async fn main() {
    let relay: u8 = std::env::args()
        .nth(1)
        .and_then(|a| a.parse().ok())
        .unwrap_or(1);

    let config = Config::default();
    init_logging(&config);
    let manager = Manager::new(config.clone());
    println!(
        "--- broadlink-local v{} - Power Strip ---",
        broadlink_local::version()
    );

    // 1. Pair
    let pairing = manager.pairing(Some(DeviceTypeCode(0x4eb5)));
    let local = Scanner::local_ipv4().unwrap_or(Ipv4Addr::UNSPECIFIED);
    if let Err(e) = pairing.discover(config.discovery_window(), local, None).await {
        println!("[ERROR] Discovery failed: {}", e);
        return;
    }
    let record = match pairing.finalize_listing() {
        Ok(record) => record,
        Err(e) => {
            println!("[ERROR] No power strip found: {}", e);
            return;
        }
    };
    pairing.close();
    println!("[INFO] Paired with {} at {}", record.name, record.ip_address);
    if !record.is_compatible {
        println!("[WARN] {} is not an MP1; commands may fail", record.type_name);
    }

    // 2. Open a session and watch it
    let strip = match manager
        .create_session(record.mac, record.ip_address, record.device_type.into())
        .await
    {
        Ok(session) => session,
        Err(e) => {
            println!("[ERROR] {}", e);
            return;
        }
    };
    let events = manager.stream();
    tokio::spawn(async move {
        tokio::pin!(events);
        while let Some(event) = events.next().await {
            match event {
                ManagerEvent::State { device_id, event } => {
                    println!("[EVENT] {}: {:?}", device_id, event)
                }
                ManagerEvent::SessionError { device_id, error } => {
                    println!("[ERROR] {}: {}", device_id, error)
                }
            }
        }
    });
    if let Err(e) = manager
        .start_polling(strip.id(), Some(Duration::from_secs(2)))
        .await
    {
        println!("[ERROR] Polling failed to start: {}", e);
    }

    // 3. Toggle
    match strip.read_relays().await {
        Ok(mask) => {
            let target = !mask.is_on(relay);
            println!("Switching relay {} {}...", relay, if target { "ON" } else { "OFF" });
            if let Err(e) = strip.set_relay(relay, target).await {
                println!("[ERROR] {}", e);
            }
        }
        Err(e) => println!("[ERROR] Reading relays failed: {}", e),
    }

    sleep(Duration::from_secs(6)).await;
    manager.shutdown().await;
    println!("Example finished.");
}
