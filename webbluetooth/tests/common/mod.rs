#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use uuid::Uuid;
use webbluetooth::binding::simulated::{
    Call, SimulatedBinding, SimulatedCharacteristic, SimulatedPeripheral, SimulatedService,
};
use webbluetooth::binding::uuids::from_u16;
use webbluetooth::binding::{CharacteristicHandle, CharacteristicProperties, PeripheralHandle};
use webbluetooth::{Bluetooth, BluetoothDevice, BluetoothOptions, RequestDeviceOptions};

pub const HEART_RATE: Uuid = from_u16(0x180d);
pub const HEART_RATE_MEASUREMENT: Uuid = from_u16(0x2a37);
pub const BODY_SENSOR_LOCATION: Uuid = from_u16(0x2a38);
pub const HEART_RATE_CONTROL_POINT: Uuid = from_u16(0x2a39);
pub const BATTERY: Uuid = from_u16(0x180f);
pub const BATTERY_LEVEL: Uuid = from_u16(0x2a19);
pub const DEVICE_INFORMATION: Uuid = from_u16(0x180a);
pub const MANUFACTURER_NAME: Uuid = from_u16(0x2a29);
pub const CURRENT_TIME: Uuid = from_u16(0x1805);
pub const CLIENT_CONFIGURATION: Uuid = from_u16(0x2902);

pub const HRM_ID: &str = "C4:7C:8D:6A:11:02";

const READ: u16 = CharacteristicProperties::READ;
const WRITE: u16 = CharacteristicProperties::WRITE;
const NOTIFY: u16 = CharacteristicProperties::NOTIFY;

fn characteristic(uuid: Uuid, bits: u16) -> SimulatedCharacteristic {
    SimulatedCharacteristic::new(uuid, CharacteristicProperties::from_bits(bits))
}

/// A heart rate monitor with a battery service that includes a secondary device
/// information service.
pub fn heart_rate_monitor(id: &str) -> SimulatedPeripheral {
    SimulatedPeripheral::new(id)
        .name("Polar H10")
        .rssi(-58)
        .advertise_service(HEART_RATE)
        .service(
            SimulatedService::primary(HEART_RATE)
                .characteristic(
                    characteristic(HEART_RATE_MEASUREMENT, NOTIFY)
                        .descriptor(CLIENT_CONFIGURATION, [0, 0]),
                )
                .characteristic(characteristic(BODY_SENSOR_LOCATION, READ).value([1]))
                .characteristic(characteristic(HEART_RATE_CONTROL_POINT, READ | WRITE)),
        )
        .service(
            SimulatedService::primary(BATTERY)
                .include(DEVICE_INFORMATION)
                .characteristic(characteristic(BATTERY_LEVEL, READ | NOTIFY).value([87])),
        )
        .service(
            SimulatedService::secondary(DEVICE_INFORMATION)
                .characteristic(characteristic(MANUFACTURER_NAME, READ).value(*b"Polar")),
        )
}

pub struct Fixture {
    pub binding: Arc<SimulatedBinding>,
    pub bluetooth: Bluetooth,
    pub hrm: PeripheralHandle,
}

impl Fixture {
    pub fn new() -> Self {
        let binding = Arc::new(SimulatedBinding::new());
        let hrm = binding.add_peripheral(heart_rate_monitor(HRM_ID));
        let bluetooth = Bluetooth::open(binding.clone(), BluetoothOptions::default())
            .expect("the simulated binding has an adapter");
        Fixture {
            binding,
            bluetooth,
            hrm,
        }
    }

    pub async fn device(&self) -> BluetoothDevice {
        self.bluetooth
            .request_device(RequestDeviceOptions::accept_all())
            .await
            .expect("the heart rate monitor is advertising")
    }

    pub async fn connected(&self) -> BluetoothDevice {
        let device = self.device().await;
        device.gatt().connect().await.expect("connect");
        device
    }

    pub fn characteristic_handle(&self, service: Uuid, characteristic: Uuid) -> CharacteristicHandle {
        self.binding
            .characteristic_handle(&self.hrm, service, characteristic)
            .expect("characteristic exists")
    }

    pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.binding.count_calls(predicate)
    }
}

/// A thread-safe log for listeners.
#[derive(Clone)]
pub struct Log<T>(Arc<Mutex<Vec<T>>>);

impl<T> Default for Log<T> {
    fn default() -> Self {
        Log(Arc::new(Mutex::new(Vec::new())))
    }
}

impl<T: Clone> Log<T> {
    pub fn push(&self, item: T) {
        self.0.lock().unwrap().push(item);
    }

    pub fn items(&self) -> Vec<T> {
        self.0.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}
