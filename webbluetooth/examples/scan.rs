use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use futures_lite::StreamExt;
use tracing::info;
use tracing::metadata::LevelFilter;
use webbluetooth::binding::simulated::{SimulatedBinding, SimulatedPeripheral};
use webbluetooth::binding::uuids::from_u16;
use webbluetooth::{Bluetooth, BluetoothOptions, RequestDeviceOptions};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{EnvFilter, fmt};

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let binding = Arc::new(SimulatedBinding::new());
    binding.set_enabled(false);
    binding.add_peripheral(
        SimulatedPeripheral::new("C4:7C:8D:6A:11:02")
            .name("Polar H10")
            .rssi(-58)
            .advertise_service(from_u16(0x180d)),
    );
    let beacon = binding.add_peripheral(
        SimulatedPeripheral::new("F0:99:19:00:3B:7E")
            .rssi(-81)
            .manufacturer_data(0x004c, [0x02, 0x15])
            .silent(),
    );

    let bluetooth = Bluetooth::open(binding.clone(), BluetoothOptions::default())?;
    let mut availability = bluetooth.adapter().availability_updates();

    let radio = binding.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        radio.set_enabled(true);
        tokio::time::sleep(Duration::from_millis(200)).await;
        radio.advertise(&beacon);
    });

    if !bluetooth.get_availability() {
        while let Some(enabled) = availability.next().await {
            if enabled {
                break;
            }
        }
    }

    info!("starting scan");
    let scan = bluetooth.scan(RequestDeviceOptions::accept_all())?;
    for device in scan.collect_for(Duration::from_secs(1)).await? {
        info!(
            "{} [{}] ({}dBm): {:?}",
            device.name().unwrap_or("(unknown)"),
            device.id(),
            device.rssi().unwrap_or_default(),
            device.advertisement()
        );
    }

    Ok(())
}
