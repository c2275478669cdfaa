use tracing::{error, info};
use stridesense::{HubConfig, Result, ScanFilterConfig, SensorHub};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("📡 Stridesense Scan Example");

    let hub = match SensorHub::with_btleplug(HubConfig::default()).await {
        Ok(hub) => hub,
        Err(e) => {
            error!("❌ Failed to open Bluetooth adapter: {}", e);
            return Err(e);
        }
    };

    // Anything closer than -90 dBm, reported once per device
    let filter = ScanFilterConfig {
        min_signal_strength: Some(-90),
        ..ScanFilterConfig::default()
    };

    let scan_ms = hub.config().scan_duration_ms;
    info!("🔍 Scanning for {} seconds...", scan_ms / 1000);
    let mut discovered = hub.start_scan(filter, scan_ms).await?;

    while let Some(device) = discovered.recv().await {
        info!(
            "  ✅ {} [{}] {} dBm ({})",
            device.display_name(),
            device.id,
            device.rssi,
            device.device_type
        );
    }

    let devices = hub.discovered_devices().await;
    println!("\n📋 Scan Summary ({} device(s)):", devices.len());
    for device in &devices {
        println!(
            "  {:<24} {:<18} {:>4} dBm  {}",
            device.display_name(),
            device.id,
            device.rssi,
            device.device_type
        );
        for service in &device.services {
            println!("      service {service}");
        }
    }

    info!("🎉 Scan completed!");
    Ok(())
}
