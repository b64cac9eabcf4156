use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing::metadata::LevelFilter;
use webbluetooth::binding::simulated::{
    SimulatedBinding, SimulatedCharacteristic, SimulatedPeripheral, SimulatedService,
};
use webbluetooth::binding::uuids::from_u16;
use webbluetooth::events::{
    CharacteristicEvent, CharacteristicEventType, DeviceEvent, DeviceEventType,
};
use webbluetooth::{
    Bluetooth, BluetoothOptions, CharacteristicProperties, RequestDeviceOptions, ScanFilter,
};

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
    let strap = binding.add_peripheral(
        SimulatedPeripheral::new("C4:7C:8D:6A:11:02")
            .name("Polar H10")
            .rssi(-58)
            .advertise_service(from_u16(0x180d))
            .service(
                SimulatedService::primary(from_u16(0x180d))
                    .characteristic(SimulatedCharacteristic::new(
                        from_u16(0x2a37),
                        CharacteristicProperties::from_bits(CharacteristicProperties::NOTIFY),
                    ))
                    .characteristic(
                        SimulatedCharacteristic::new(
                            from_u16(0x2a38),
                            CharacteristicProperties::from_bits(CharacteristicProperties::READ),
                        )
                        .value([1]),
                    ),
            )
            .service(
                SimulatedService::primary(from_u16(0x180f)).characteristic(
                    SimulatedCharacteristic::new(
                        from_u16(0x2a19),
                        CharacteristicProperties::from_bits(CharacteristicProperties::READ),
                    )
                    .value([87]),
                ),
            ),
    );

    let bluetooth = Bluetooth::open(binding.clone(), BluetoothOptions::default())?;
    let device = bluetooth
        .request_device(
            RequestDeviceOptions::filter(ScanFilter::new().service("heart_rate")?)
                .with_optional_service("battery_service")?
                .with_timeout(Duration::from_secs(5)),
        )
        .await?;
    info!(
        "found {} ({})",
        device.name().unwrap_or("(unknown)"),
        device.id()
    );

    device.add_event_listener(DeviceEventType::GattServerDisconnected, |event| {
        if let DeviceEvent::GattServerDisconnected { device_id } = event {
            info!("{device_id} disconnected");
        }
    });

    let gatt = device.gatt();
    gatt.connect().await?;

    let battery = gatt
        .get_primary_service("battery_service")
        .await?
        .get_characteristic("battery_level")
        .await?
        .read_value()
        .await?;
    info!("battery level: {}%", battery.first().copied().unwrap_or_default());

    let heart_rate = gatt.get_primary_service("heart_rate").await?;
    let location = heart_rate
        .get_characteristic("body_sensor_location")
        .await?
        .read_value()
        .await?;
    info!("sensor location: {location:?}");

    let measurement = heart_rate
        .get_characteristic("heart_rate_measurement")
        .await?;
    measurement.add_event_listener(
        CharacteristicEventType::CharacteristicValueChanged,
        |event| {
            let CharacteristicEvent::CharacteristicValueChanged(change) = event;
            if let [_flags, bpm, ..] = change.value[..] {
                info!("heart rate: {bpm} bpm");
            }
        },
    );
    measurement.start_notifications().await?;

    let handle = binding
        .characteristic_handle(&strap, from_u16(0x180d), from_u16(0x2a37))
        .ok_or("the strap has no heart rate measurement")?;
    for bpm in [72, 75, 74, 78] {
        binding.notify(&strap, &handle, [0, bpm]);
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    measurement.stop_notifications().await?;
    gatt.disconnect();
    Ok(())
}
