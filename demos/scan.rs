/**
 * Scanner Example (Async Stream)
 *
 * Broadcasts a discovery packet and prints every hub that answers within
 * the configured window.
 */
use broadlink_local::config::{Config, init_logging};
use broadlink_local::scanner::Scanner;
use futures_util::StreamExt;
use std::net::Ipv4Addr;

#[tokio::main]
async fn main() {
    let config = Config::default();
    init_logging(&config);
    println!("--- broadlink-local v{} - Scanner ---", broadlink_local::version());

    let local = Scanner::local_ipv4().unwrap_or(Ipv4Addr::UNSPECIFIED);
    println!("[INFO] Scanning from {} for {:?}...", local, config.discovery_window());

    let stream = Scanner::new(&config).discover_stream(config.discovery_window(), local, None);
    tokio::pin!(stream);

    let mut count = 0;
    while let Some(result) = stream.next().await {
        match result {
            Ok(device) => {
                count += 1;
                println!(
                    "[{}] {} {} type={} MAC={} IP={} name={:?}",
                    count,
                    if device.is_compatible { "+" } else { "?" },
                    device.descriptor.display_name,
                    device.device_type,
                    device.mac,
                    device.ip_address,
                    device.name
                );
            }
            Err(e) => println!("[ERROR] Discovery failed: {}", e),
        }
    }

    println!("[INFO] Scan finished. Total devices found: {count}");
}
