//! Example that connects to the first Ledger in range and opens an app.
//!
//! Run with:
//! `cargo run -p ledger-connect --example open_app -- Bitcoin`

use std::time::Duration;

use anyhow::Result;
use ledger_connect::{get_app_and_version, open_app_if_needed, BleManager, TransportConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().compact().init();

    let app_name = std::env::args().nth(1).unwrap_or_else(|| "Bitcoin".to_owned());

    let manager = BleManager::new(TransportConfig::default()).await?;
    println!("Scanning…");
    let device = manager.create(Duration::from_secs(10)).await?;
    println!("Connected to {} (mtu {})", device.id(), device.mtu());

    open_app_if_needed(&device, &app_name).await?;
    let info = get_app_and_version(&device).await?;
    println!("Running {} {}", info.name, info.version);

    device.disconnect().await?;
    Ok(())
}
