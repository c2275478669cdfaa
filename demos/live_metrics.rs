use std::time::Duration;
use tokio::{sync::broadcast::error::RecvError, time::interval};
use tracing::{error, info, warn};
use stridesense::{
    DeviceType, HubConfig, Result, RunnerProfile, ScanFilterConfig, SensorHub, SensorType,
    TelemetryEvent,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🏃 Stridesense Live Metrics Example");

    let config = HubConfig {
        runner: RunnerProfile {
            weight_kg: 68.0,
            ftp_watts: 260.0,
        },
        ..HubConfig::default()
    };
    let hub = SensorHub::with_btleplug(config).await?;
    let mut events = hub.subscribe();

    // Connect to every running sensor found in one scan window
    info!("🔍 Searching for sensors...");
    let mut discovered = hub
        .start_scan(ScanFilterConfig::default(), hub.config().scan_duration_ms)
        .await?;
    let mut sensors = Vec::new();
    while let Some(device) = discovered.recv().await {
        if device.device_type != DeviceType::Unknown {
            info!("  ✅ Found {} ({})", device.display_name(), device.device_type);
            sensors.push(device);
        }
    }

    if sensors.is_empty() {
        warn!("❌ No running sensors found");
        return Ok(());
    }

    for device in &sensors {
        match hub.connect_to_device(&device.id, true).await {
            Ok(snapshot) => info!("🔗 Connected to {}", snapshot.device.display_name()),
            Err(e) => error!("❌ Failed to connect to {}: {}", device.display_name(), e),
        }
    }

    info!("Press Ctrl+C to stop");
    let mut report = interval(Duration::from_secs(5));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = report.tick() => {
                let readings = hub.get_readings(None).await;
                println!("\n📊 Latest readings");
                for sensor in [
                    SensorType::HeartRate,
                    SensorType::Cadence,
                    SensorType::Power,
                    SensorType::StrideLength,
                    SensorType::Battery,
                ] {
                    if let Some(reading) = readings.get(&sensor) {
                        println!("  {:<14} {:>8.1}", sensor.to_string(), reading.value);
                    }
                }
            }
            event = events.recv() => match event {
                Ok(TelemetryEvent::MetricsUpdated(metrics)) => {
                    info!(
                        "{}: {} steps, {:.0} m, pace {:.0} s/km, TSS {:.1}",
                        metrics.device_id,
                        metrics.steps,
                        metrics.distance_m,
                        metrics.pace_seconds_per_km,
                        metrics.training_stress_score
                    );
                }
                Ok(TelemetryEvent::DeviceDisconnected { device_id, unexpected: true }) => {
                    warn!("⚠️  {} dropped out, reconnecting", device_id);
                }
                Ok(TelemetryEvent::ConnectionError { device_id, error }) => {
                    error!("❌ {}: {}", device_id, error);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {} telemetry events", skipped),
                Err(RecvError::Closed) => break,
            },
        }
    }

    for device in &sensors {
        if let Some(totals) = hub.get_cumulative_metrics(&device.id).await {
            println!(
                "\n🏁 {}: {} steps, {:.2} km, TSS {:.1}",
                device.display_name(),
                totals.steps,
                totals.distance_m / 1000.0,
                totals.training_stress_score
            );
        }
    }

    info!("🔌 Disconnecting...");
    hub.shutdown().await?;
    info!("🎉 Session completed!");
    Ok(())
}
