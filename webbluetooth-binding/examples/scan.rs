use std::error::Error;
use std::sync::Arc;

use tracing::info;
use tracing::metadata::LevelFilter;
use webbluetooth_binding::advertisement_data::PeripheralInfo;
use webbluetooth_binding::simulated::{SimulatedBinding, SimulatedPeripheral};
use webbluetooth_binding::uuids::from_u16;
use webbluetooth_binding::{NativeBinding, PeripheralHandle};

fn main() -> Result<(), Box<dyn Error>> {
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

    let binding = SimulatedBinding::new();
    binding.add_peripheral(
        SimulatedPeripheral::new("C4:7C:8D:6A:11:02")
            .name("Polar H10")
            .rssi(-58)
            .advertise_service(from_u16(0x180d)),
    );
    binding.add_peripheral(
        SimulatedPeripheral::new("F0:99:19:00:3B:7E")
            .rssi(-81)
            .manufacturer_data(0x004c, [0x02, 0x15]),
    );

    let Some(adapter) = binding.adapters()?.into_iter().next() else {
        return Err("no Bluetooth adapter".into());
    };
    info!("using adapter {} ({})", adapter.identifier, adapter.handle);

    binding.set_delegate(&adapter.handle, Arc::new(AdapterDelegate));
    binding.start_scan(&adapter.handle, None);
    binding.stop_scan(&adapter.handle);

    Ok(())
}

struct AdapterDelegate;

impl webbluetooth_binding::AdapterDelegate for AdapterDelegate {
    fn peripheral_delegate(
        &self,
        _peripheral: &PeripheralHandle,
    ) -> Option<Arc<dyn webbluetooth_binding::PeripheralDelegate>> {
        None
    }

    fn did_discover(&self, peripheral: PeripheralInfo) {
        info!(
            "{} [{}] ({}): {:?}",
            peripheral.display_name().unwrap_or("(unknown)"),
            peripheral.id,
            peripheral.rssi.unwrap_or_default(),
            peripheral.advertisement,
        );
    }
}
