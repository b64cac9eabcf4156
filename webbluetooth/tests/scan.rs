mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use common::*;
use futures_lite::StreamExt;
use webbluetooth::binding::error::ErrorKind as NativeErrorKind;
use webbluetooth::binding::simulated::{Call, Operation, SimulatedBinding, SimulatedPeripheral};
use webbluetooth::binding::uuids::from_u16;
use webbluetooth::{
    Bluetooth, BluetoothOptions, ErrorKind, ManufacturerDataFilter, RequestDeviceOptions,
    ScanFilter, ServiceDataFilter,
};

fn open(binding: &Arc<SimulatedBinding>) -> Bluetooth {
    Bluetooth::open(binding.clone(), BluetoothOptions::default()).unwrap()
}

#[tokio::test]
async fn non_matching_devices_are_skipped_and_released() {
    let binding = Arc::new(SimulatedBinding::new());
    let watch = binding.add_peripheral(SimulatedPeripheral::new("watch").name("Garmin Fenix"));
    let strap = binding.add_peripheral(SimulatedPeripheral::new("strap").name("Polar H10"));
    let bluetooth = open(&binding);

    let device = bluetooth
        .request_device(RequestDeviceOptions::filter(ScanFilter::new().name_prefix("Polar")))
        .await
        .unwrap();

    assert_eq!(device.id(), "strap");
    assert_eq!(device.name(), Some("Polar H10"));
    assert_eq!(
        binding.count_calls(|c| *c == Call::Release(watch.clone().into())),
        1
    );
    assert_eq!(
        binding.count_calls(|c| *c == Call::Release(strap.clone().into())),
        0
    );
    // The adapter and the accepted peripheral.
    assert_eq!(bluetooth.adapter().handle_count(), 2);
}

#[tokio::test]
async fn first_match_wins_and_stops_the_scan() {
    let binding = Arc::new(SimulatedBinding::new());
    binding.add_peripheral(heart_rate_monitor("first"));
    binding.add_peripheral(heart_rate_monitor("second"));
    let bluetooth = open(&binding);

    let device = bluetooth
        .request_device(RequestDeviceOptions::filter(
            ScanFilter::new().service("heart_rate").unwrap(),
        ))
        .await
        .unwrap();

    assert_eq!(device.id(), "first");
    assert!(!binding.is_scanning());
    let calls = binding.calls();
    assert_eq!(calls[0], Call::StartScan(Some(vec![HEART_RATE])));
    assert_eq!(binding.count_calls(|c| *c == Call::StopScan), 1);
    assert_eq!(bluetooth.get_devices(), vec![device]);
}

#[tokio::test]
async fn filters_on_advertised_data() {
    let binding = Arc::new(SimulatedBinding::new());
    binding.add_peripheral(
        SimulatedPeripheral::new("beacon").manufacturer_data(0x004c, [0x02, 0x15, 0xaa]),
    );
    binding.add_peripheral(
        SimulatedPeripheral::new("thermometer").service_data(from_u16(0x181a), [0x07, 0x01]),
    );
    let bluetooth = open(&binding);

    let beacon = bluetooth
        .request_device(RequestDeviceOptions::filter(
            ScanFilter::new()
                .manufacturer_data(ManufacturerDataFilter::new(0x004c).with_prefix([0x02, 0x15])),
        ))
        .await
        .unwrap();
    assert_eq!(beacon.id(), "beacon");

    let options = RequestDeviceOptions::filter(ScanFilter::new().service_data(
        ServiceDataFilter::new(0x181a_u32)
            .unwrap()
            .with_prefix([0x00, 0x01])
            .with_mask([0x00, 0xff]),
    ));
    let thermometer = bluetooth.request_device(options).await.unwrap();
    assert_eq!(thermometer.id(), "thermometer");
    // Service data filters grant access to their service.
    assert!(thermometer.allowed_services().contains(&from_u16(0x181a)));
}

#[tokio::test]
async fn timeout_without_a_match_is_not_found() {
    let binding = Arc::new(SimulatedBinding::new());
    let bluetooth = open(&binding);
    let timeout = Duration::from_millis(50);

    let start = Instant::now();
    let err = bluetooth
        .request_device(RequestDeviceOptions::accept_all().with_timeout(timeout))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(start.elapsed() >= timeout);
    assert!(!binding.is_scanning());
}

#[tokio::test]
async fn request_devices_collects_every_match() {
    let binding = Arc::new(SimulatedBinding::new());
    binding.add_peripheral(heart_rate_monitor("left"));
    binding.add_peripheral(heart_rate_monitor("right"));
    binding.add_peripheral(SimulatedPeripheral::new("other").name("Speaker"));
    let bluetooth = open(&binding);

    let devices = bluetooth
        .request_devices(
            RequestDeviceOptions::filter(ScanFilter::new().name("Polar H10"))
                .with_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap();

    let ids: Vec<_> = devices.iter().map(|d| d.id().to_owned()).collect();
    assert_eq!(ids, ["left", "right"]);
}

#[tokio::test]
async fn cancel_scan_fails_the_request() {
    let binding = Arc::new(SimulatedBinding::new());
    let bluetooth = open(&binding);

    let (result, cancelled) = tokio::join!(
        bluetooth.request_device(RequestDeviceOptions::accept_all()),
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            bluetooth.cancel_scan()
        }
    );

    assert!(cancelled);
    assert_eq!(result.unwrap_err().kind(), ErrorKind::Cancelled);
    assert!(!binding.is_scanning());
    assert!(!bluetooth.cancel_scan());
}

#[tokio::test]
async fn interrupted_scan_is_cancelled() {
    let binding = Arc::new(SimulatedBinding::new());
    let bluetooth = open(&binding);

    let (result, ()) = tokio::join!(
        bluetooth.request_device(RequestDeviceOptions::accept_all()),
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            binding.interrupt_scan();
        }
    );

    assert_eq!(result.unwrap_err().kind(), ErrorKind::Cancelled);
}

#[tokio::test]
async fn native_scan_failures_are_classified() {
    let binding = Arc::new(SimulatedBinding::new());
    binding.add_peripheral(heart_rate_monitor(HRM_ID));
    let bluetooth = open(&binding);

    binding.fail_next(Operation::StartScan, NativeErrorKind::PermissionDenied);
    let err = bluetooth
        .request_device(RequestDeviceOptions::accept_all())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Security);

    binding.set_enabled(false);
    assert!(!bluetooth.get_availability());
    let err = bluetooth
        .request_device(RequestDeviceOptions::accept_all())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn invalid_options_are_rejected_before_scanning() {
    let binding = Arc::new(SimulatedBinding::new());
    let bluetooth = open(&binding);

    let err = bluetooth
        .request_device(RequestDeviceOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let err = bluetooth
        .request_device(RequestDeviceOptions::accept_all().with_filter(ScanFilter::new().name("x")))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert!(binding.calls().is_empty());
}

#[tokio::test]
async fn repeated_advertisements_are_reported_once() {
    let binding = Arc::new(SimulatedBinding::new());
    let hrm = binding.add_peripheral(heart_rate_monitor(HRM_ID));
    let bluetooth = open(&binding);

    let evaluated = Arc::new(AtomicUsize::new(0));
    let counter = evaluated.clone();
    let options = RequestDeviceOptions::default().with_predicate(move |info| {
        counter.fetch_add(1, Ordering::SeqCst);
        info.name.as_deref() == Some("Polar H10")
    });

    let scan = bluetooth.scan(options).unwrap();
    assert!(binding.advertise(&hrm));
    assert!(binding.advertise(&hrm));
    let devices = scan.collect_for(Duration::from_millis(50)).await.unwrap();

    assert_eq!(devices.len(), 1);
    assert_eq!(evaluated.load(Ordering::SeqCst), 1);
    assert!(!binding.is_scanning());
}

#[tokio::test]
async fn scan_stream_yields_late_advertisers() {
    let binding = Arc::new(SimulatedBinding::new());
    let sensor = binding.add_peripheral(heart_rate_monitor("late").silent());
    let bluetooth = open(&binding);

    let mut scan = bluetooth.scan(RequestDeviceOptions::accept_all()).unwrap();
    assert!(binding.is_scanning());
    assert!(binding.advertise(&sensor));

    let device = scan.next().await.unwrap().unwrap();
    assert_eq!(device.id(), "late");

    drop(scan);
    assert!(!binding.is_scanning());
}

#[tokio::test]
async fn dropping_the_request_stops_the_scan() {
    let binding = Arc::new(SimulatedBinding::new());
    binding.add_peripheral(SimulatedPeripheral::new("unrelated"));
    let bluetooth = open(&binding);

    let outcome = tokio::time::timeout(
        Duration::from_millis(20),
        bluetooth.request_device(RequestDeviceOptions::filter(ScanFilter::new().name("nobody"))),
    )
    .await;

    assert!(outcome.is_err());
    assert!(!binding.is_scanning());
    // Only the adapter is still registered.
    assert_eq!(bluetooth.adapter().handle_count(), 1);
}

#[tokio::test]
async fn requesting_a_known_device_returns_the_same_object() {
    let fixture = Fixture::new();
    let heart_rate = RequestDeviceOptions::filter(ScanFilter::new().service(HEART_RATE).unwrap());
    let first = fixture.bluetooth.request_device(heart_rate.clone()).await.unwrap();
    assert_eq!(first.allowed_services().len(), 1);

    let again = fixture
        .bluetooth
        .request_device(heart_rate.with_optional_service("battery_service").unwrap())
        .await
        .unwrap();

    assert_eq!(first, again);
    assert_eq!(fixture.bluetooth.get_devices().len(), 1);
    assert_eq!(fixture.bluetooth.adapter().handle_count(), 2);
    let allowed = again.allowed_services();
    assert!(allowed.contains(&HEART_RATE));
    assert!(allowed.contains(&BATTERY));

    // A request that names no services lifts the restriction.
    fixture.device().await;
    assert!(first.allowed_services().is_empty());
}
