//! Example that scans for Ledger devices of every known family.
//!
//! Run with:
//! `cargo run -p ble-transport --example scan_devices`

use std::time::Duration;

use anyhow::Result;
use ble_transport::{BleManager, TransportConfig, TransportError};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().compact().init();

    let manager = BleManager::new(TransportConfig::default()).await?;
    println!("Scanning for Ledger devices…");

    let mut scanner = manager.scan(Duration::from_secs(5)).await?;
    let mut last = Vec::new();
    while let Some(snapshot) = scanner.next().await {
        match snapshot {
            Ok(devices) => {
                last = devices;
                println!("-- {} device(s) in range", last.len());
            }
            Err(TransportError::ScanTimedOut) => break,
            Err(err) => return Err(err.into()),
        }
    }

    if last.is_empty() {
        println!("No devices discovered.");
        return Ok(());
    }
    for device in last {
        println!("• {} [{}]", device.id, device.model);
        if let Some(rssi) = device.rssi {
            println!("  RSSI: {rssi} dBm");
        }
    }

    Ok(())
}
