mod common;

use common::*;
use uuid::Uuid;
use webbluetooth::binding::error::{AttError, ErrorKind as NativeErrorKind};
use webbluetooth::binding::simulated::{Call, Operation, SimulatedBinding};
use webbluetooth::{ErrorKind, RequestDeviceOptions, ScanFilter, Service, WriteType};

#[tokio::test]
async fn operations_require_a_connection() {
    let fixture = Fixture::new();
    let device = fixture.device().await;
    let gatt = device.gatt();
    assert!(!gatt.connected());

    let err = gatt.get_primary_service(HEART_RATE).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Network);

    gatt.connect().await.unwrap();
    assert!(gatt.connected());
    assert!(fixture.binding.is_connected(&fixture.hrm));
    let location = gatt
        .get_primary_service(HEART_RATE)
        .await
        .unwrap()
        .get_characteristic(BODY_SENSOR_LOCATION)
        .await
        .unwrap();

    gatt.disconnect();
    assert!(!gatt.connected());
    assert!(!fixture.binding.is_connected(&fixture.hrm));
    assert_eq!(
        location.read_value().await.unwrap_err().kind(),
        ErrorKind::Network
    );
    assert_eq!(
        location.write_value(&[2]).await.unwrap_err().kind(),
        ErrorKind::Network
    );
    assert_eq!(
        fixture.count(|c| matches!(c, Call::ReadCharacteristic(_) | Call::WriteCharacteristic(..))),
        0
    );
}

#[tokio::test]
async fn discovery_runs_once_per_connection() {
    let fixture = Fixture::new();
    let device = fixture.connected().await;
    let gatt = device.gatt();

    let first = gatt.get_primary_services().await.unwrap();
    let second = gatt.get_primary_services().await.unwrap();
    assert_eq!(first, second);
    let uuids: Vec<_> = first.iter().map(Service::uuid).collect();
    assert_eq!(uuids, [HEART_RATE, BATTERY]);

    let battery = gatt.get_primary_service(BATTERY).await.unwrap();
    assert_eq!(battery, first[1]);
    battery.get_characteristics().await.unwrap();
    battery.get_characteristic(BATTERY_LEVEL).await.unwrap();

    assert_eq!(fixture.count(|c| matches!(c, Call::DiscoverServices(..))), 1);
    assert_eq!(
        fixture.count(|c| matches!(c, Call::DiscoverCharacteristics(..))),
        1
    );
}

#[tokio::test]
async fn failed_discovery_can_be_retried() {
    let fixture = Fixture::new();
    let device = fixture.connected().await;
    let gatt = device.gatt();

    fixture
        .binding
        .fail_next(Operation::DiscoverServices, AttError::UNLIKELY_ERROR);
    let err = gatt.get_primary_services().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Network);

    assert_eq!(gatt.get_primary_services().await.unwrap().len(), 2);
    assert_eq!(fixture.count(|c| matches!(c, Call::DiscoverServices(..))), 2);
}

#[tokio::test]
async fn names_and_aliases_resolve_to_full_uuids() {
    let fixture = Fixture::new();
    let device = fixture.connected().await;
    let gatt = device.gatt();
    let full: Uuid = "0000180d-0000-1000-8000-00805f9b34fb".parse().unwrap();

    let by_alias = gatt.get_primary_service("0x180d").await.unwrap();
    assert_eq!(by_alias.uuid(), full);
    assert_eq!(gatt.get_primary_service("heart_rate").await.unwrap(), by_alias);
    assert_eq!(gatt.get_primary_service(0x180d_u16).await.unwrap(), by_alias);

    let measurement = by_alias
        .get_characteristic("heart_rate_measurement")
        .await
        .unwrap();
    assert_eq!(measurement.uuid(), HEART_RATE_MEASUREMENT);
    let configuration = measurement
        .get_descriptor("gatt.client_characteristic_configuration")
        .await
        .unwrap();
    assert_eq!(configuration.uuid(), CLIENT_CONFIGURATION);

    let err = gatt.get_primary_service("heart rate").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[tokio::test]
async fn missing_attributes_are_not_found() {
    let fixture = Fixture::new();
    let device = fixture.connected().await;
    let gatt = device.gatt();

    let err = gatt.get_primary_service(CURRENT_TIME).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = gatt
        .get_primary_services_matching(CURRENT_TIME)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let heart_rate = gatt.get_primary_service(HEART_RATE).await.unwrap();
    let err = heart_rate
        .get_characteristic(BATTERY_LEVEL)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    // A plural lookup without a UUID may be empty.
    assert!(heart_rate.get_included_services().await.unwrap().is_empty());
}

#[tokio::test]
async fn secondary_services_are_reached_through_includes() {
    let fixture = Fixture::new();
    let device = fixture.connected().await;
    let gatt = device.gatt();

    let services = gatt.get_primary_services().await.unwrap();
    assert!(services.iter().all(|s| s.uuid() != DEVICE_INFORMATION));

    let battery = gatt.get_primary_service(BATTERY).await.unwrap();
    let included = battery.get_included_services().await.unwrap();
    assert_eq!(included.len(), 1);
    assert!(!included[0].is_primary());

    let information = battery
        .get_included_service("device_information")
        .await
        .unwrap();
    assert_eq!(information, included[0]);
    let name = information
        .get_characteristic(MANUFACTURER_NAME)
        .await
        .unwrap()
        .read_value()
        .await
        .unwrap();
    assert_eq!(name, b"Polar");
}

#[tokio::test]
async fn written_values_are_read_back_from_the_cache() {
    let fixture = Fixture::new();
    let device = fixture.connected().await;
    let service = device.gatt().get_primary_service(HEART_RATE).await.unwrap();
    let control = service
        .get_characteristic(HEART_RATE_CONTROL_POINT)
        .await
        .unwrap();

    control.write_value(&[1, 2, 3]).await.unwrap();
    assert_eq!(control.read_value().await.unwrap(), [1, 2, 3]);
    assert_eq!(control.value(), Some(vec![1, 2, 3]));

    assert_eq!(fixture.count(|c| matches!(c, Call::ReadCharacteristic(_))), 0);
    assert_eq!(
        fixture.count(|c| matches!(
            c,
            Call::WriteCharacteristic(_, data, WriteType::WithResponse) if *data == [1, 2, 3]
        )),
        1
    );
    let handle = fixture.characteristic_handle(HEART_RATE, HEART_RATE_CONTROL_POINT);
    assert_eq!(
        fixture.binding.characteristic_value(&fixture.hrm, &handle),
        Some(vec![1, 2, 3])
    );
}

#[tokio::test]
async fn reads_without_a_prior_write_reach_the_device() {
    let fixture = Fixture::new();
    let device = fixture.connected().await;
    let location = device
        .gatt()
        .get_primary_service(HEART_RATE)
        .await
        .unwrap()
        .get_characteristic(BODY_SENSOR_LOCATION)
        .await
        .unwrap();
    assert_eq!(location.value(), None);

    assert_eq!(location.read_value().await.unwrap(), [1]);
    assert_eq!(location.read_value().await.unwrap(), [1]);
    assert_eq!(location.value(), Some(vec![1]));
    assert_eq!(fixture.count(|c| matches!(c, Call::ReadCharacteristic(_))), 2);
}

#[tokio::test]
async fn unsupported_operations_are_rejected() {
    let fixture = Fixture::new();
    let device = fixture.connected().await;
    let service = device.gatt().get_primary_service(HEART_RATE).await.unwrap();
    let measurement = service
        .get_characteristic(HEART_RATE_MEASUREMENT)
        .await
        .unwrap();
    let location = service
        .get_characteristic(BODY_SENSOR_LOCATION)
        .await
        .unwrap();
    let control = service
        .get_characteristic(HEART_RATE_CONTROL_POINT)
        .await
        .unwrap();

    assert!(!measurement.properties().read);
    assert_eq!(
        measurement.read_value().await.unwrap_err().kind(),
        ErrorKind::NotSupported
    );
    assert_eq!(
        location.write_value(&[2]).await.unwrap_err().kind(),
        ErrorKind::NotSupported
    );
    assert_eq!(
        control
            .write_value_without_response(&[1])
            .await
            .unwrap_err()
            .kind(),
        ErrorKind::NotSupported
    );
    assert_eq!(
        location.start_notifications().await.unwrap_err().kind(),
        ErrorKind::NotSupported
    );
    assert_eq!(
        control.write_value(&[0; 513]).await.unwrap_err().kind(),
        ErrorKind::InvalidModification
    );
    assert!(control.write_value(&[0; 512]).await.is_ok());
}

#[tokio::test]
async fn native_gatt_errors_are_classified() {
    let fixture = Fixture::new();
    let device = fixture.connected().await;
    let location = device
        .gatt()
        .get_primary_service(HEART_RATE)
        .await
        .unwrap()
        .get_characteristic(BODY_SENSOR_LOCATION)
        .await
        .unwrap();

    fixture
        .binding
        .fail_next(Operation::ReadCharacteristic, AttError::READ_NOT_PERMITTED);
    assert_eq!(
        location.read_value().await.unwrap_err().kind(),
        ErrorKind::Network
    );
    fixture.binding.fail_next(
        Operation::ReadCharacteristic,
        AttError::INSUFFICIENT_AUTHENTICATION,
    );
    assert_eq!(
        location.read_value().await.unwrap_err().kind(),
        ErrorKind::Security
    );
    assert_eq!(location.read_value().await.unwrap(), [1]);
}

#[tokio::test]
async fn notification_subscriptions_are_not_repeated() {
    let fixture = Fixture::new();
    let device = fixture.connected().await;
    let measurement = device
        .gatt()
        .get_primary_service(HEART_RATE)
        .await
        .unwrap()
        .get_characteristic(HEART_RATE_MEASUREMENT)
        .await
        .unwrap();
    let handle = fixture.characteristic_handle(HEART_RATE, HEART_RATE_MEASUREMENT);

    measurement.start_notifications().await.unwrap();
    measurement.start_notifications().await.unwrap();
    assert!(measurement.is_notifying());
    assert!(fixture.binding.is_notifying(&fixture.hrm, &handle));
    assert_eq!(fixture.count(|c| matches!(c, Call::SetNotify(_, true))), 1);

    measurement.stop_notifications().await.unwrap();
    measurement.stop_notifications().await.unwrap();
    assert!(!measurement.is_notifying());
    assert!(!fixture.binding.is_notifying(&fixture.hrm, &handle));
    assert_eq!(fixture.count(|c| matches!(c, Call::SetNotify(_, false))), 1);
}

#[tokio::test]
async fn descriptors_cache_written_values() {
    let fixture = Fixture::new();
    let device = fixture.connected().await;
    let measurement = device
        .gatt()
        .get_primary_service(HEART_RATE)
        .await
        .unwrap()
        .get_characteristic(HEART_RATE_MEASUREMENT)
        .await
        .unwrap();

    let descriptors = measurement.get_descriptors().await.unwrap();
    assert_eq!(descriptors.len(), 1);
    let configuration = &descriptors[0];
    assert_eq!(configuration.value(), None);

    assert_eq!(configuration.read_value().await.unwrap(), [0, 0]);
    configuration.write_value(&[1, 0]).await.unwrap();
    assert_eq!(configuration.read_value().await.unwrap(), [1, 0]);
    assert_eq!(configuration.value(), Some(vec![1, 0]));

    assert_eq!(fixture.count(|c| matches!(c, Call::ReadDescriptor(_))), 1);
    assert_eq!(fixture.count(|c| matches!(c, Call::DiscoverDescriptors(_))), 1);
}

#[tokio::test]
async fn operations_run_one_at_a_time_in_order() {
    let fixture = Fixture::new();
    let device = fixture.connected().await;
    let service = device.gatt().get_primary_service(HEART_RATE).await.unwrap();
    let location = service
        .get_characteristic(BODY_SENSOR_LOCATION)
        .await
        .unwrap();
    let control = service
        .get_characteristic(HEART_RATE_CONTROL_POINT)
        .await
        .unwrap();

    fixture.binding.hold(Operation::ReadCharacteristic);
    let (first, second, ()) = tokio::join!(location.read_value(), control.read_value(), async {
        tokio::task::yield_now().await;
        // The second read waits for the first to complete before it is issued.
        assert_eq!(fixture.binding.held_count(), 1);
        assert_eq!(fixture.binding.release_held(), 1);
        while fixture.binding.held_count() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(fixture.binding.release_held(), 1);
    });

    assert_eq!(first.unwrap(), [1]);
    assert!(second.is_ok());
    let reads: Vec<_> = fixture
        .binding
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::ReadCharacteristic(_)))
        .collect();
    assert_eq!(
        reads,
        [
            Call::ReadCharacteristic(
                fixture.characteristic_handle(HEART_RATE, BODY_SENSOR_LOCATION)
            ),
            Call::ReadCharacteristic(
                fixture.characteristic_handle(HEART_RATE, HEART_RATE_CONTROL_POINT)
            ),
        ]
    );
}

#[tokio::test]
async fn disconnect_fails_operations_in_flight() {
    let fixture = Fixture::new();
    let device = fixture.connected().await;
    let gatt = device.gatt();
    let location = gatt
        .get_primary_service(HEART_RATE)
        .await
        .unwrap()
        .get_characteristic(BODY_SENSOR_LOCATION)
        .await
        .unwrap();

    fixture.binding.hold(Operation::ReadCharacteristic);
    let (result, ()) = tokio::join!(location.read_value(), async {
        tokio::task::yield_now().await;
        assert_eq!(fixture.binding.held_count(), 1);
        gatt.disconnect();
    });

    assert_eq!(result.unwrap_err().kind(), ErrorKind::Network);
    assert_eq!(fixture.binding.held_count(), 0);
    assert!(!gatt.connected());
}

#[tokio::test]
async fn concurrent_connects_share_one_attempt() {
    let fixture = Fixture::new();
    let device = fixture.device().await;
    let gatt = device.gatt();

    fixture.binding.hold(Operation::Connect);
    let (a, b, ()) = tokio::join!(gatt.connect(), gatt.connect(), async {
        tokio::task::yield_now().await;
        assert!(!gatt.connected());
        assert_eq!(fixture.binding.release_held(), 1);
    });

    a.unwrap();
    b.unwrap();
    assert!(gatt.connected());
    assert_eq!(fixture.count(|c| matches!(c, Call::Connect(_))), 1);

    // Already connected.
    gatt.connect().await.unwrap();
    assert_eq!(fixture.count(|c| matches!(c, Call::Connect(_))), 1);
}

#[tokio::test]
async fn connection_failures_are_classified() {
    let fixture = Fixture::new();
    let device = fixture.device().await;
    let gatt = device.gatt();

    fixture
        .binding
        .fail_next(Operation::Connect, NativeErrorKind::ConnectionFailed);
    assert_eq!(gatt.connect().await.unwrap_err().kind(), ErrorKind::Network);
    assert!(!gatt.connected());

    fixture
        .binding
        .fail_next(Operation::Connect, NativeErrorKind::PermissionDenied);
    assert_eq!(gatt.connect().await.unwrap_err().kind(), ErrorKind::Security);

    gatt.connect().await.unwrap();
    assert!(gatt.connected());
}

#[tokio::test]
async fn disconnect_aborts_a_connection_attempt() {
    let fixture = Fixture::new();
    let device = fixture.device().await;
    let gatt = device.gatt();

    fixture.binding.hold(Operation::Connect);
    let (result, ()) = tokio::join!(gatt.connect(), async {
        tokio::task::yield_now().await;
        gatt.disconnect();
    });

    assert_eq!(result.unwrap_err().kind(), ErrorKind::Network);
    assert!(!gatt.connected());
    assert!(!fixture.binding.is_connected(&fixture.hrm));

    fixture.binding.unhold(Operation::Connect);
    gatt.connect().await.unwrap();
    assert!(gatt.connected());
}

#[tokio::test]
async fn objects_from_an_earlier_connection_are_stale() {
    let fixture = Fixture::new();
    let device = fixture.connected().await;
    let gatt = device.gatt();
    let service = gatt.get_primary_service(HEART_RATE).await.unwrap();
    let location = service
        .get_characteristic(BODY_SENSOR_LOCATION)
        .await
        .unwrap();
    location.read_value().await.unwrap();

    gatt.disconnect();
    gatt.connect().await.unwrap();

    assert_eq!(location.value(), None);
    assert_eq!(
        location.read_value().await.unwrap_err().kind(),
        ErrorKind::Network
    );
    assert_eq!(
        service.get_characteristics().await.unwrap_err().kind(),
        ErrorKind::Network
    );

    let fresh = gatt.get_primary_service(HEART_RATE).await.unwrap();
    assert_ne!(fresh, service);
    assert_eq!(
        fresh
            .get_characteristic(BODY_SENSOR_LOCATION)
            .await
            .unwrap()
            .read_value()
            .await
            .unwrap(),
        [1]
    );
    assert_eq!(fixture.count(|c| matches!(c, Call::DiscoverServices(..))), 2);
}

#[tokio::test]
async fn access_is_limited_to_requested_services() {
    let fixture = Fixture::new();
    let device = fixture
        .bluetooth
        .request_device(RequestDeviceOptions::filter(
            ScanFilter::new().service(HEART_RATE).unwrap(),
        ))
        .await
        .unwrap();
    let gatt = device.gatt();
    gatt.connect().await.unwrap();

    let err = gatt.get_primary_service(BATTERY).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Security);

    let services = gatt.get_primary_services().await.unwrap();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].uuid(), HEART_RATE);
    assert_eq!(
        fixture.count(|c| matches!(
            c,
            Call::DiscoverServices(_, Some(filter)) if *filter == [HEART_RATE]
        )),
        1
    );
}

#[tokio::test]
async fn closing_the_adapter_releases_every_handle_once() {
    let fixture = Fixture::new();
    let device = fixture.connected().await;
    let gatt = device.gatt();
    for service in gatt.get_primary_services().await.unwrap() {
        for characteristic in service.get_characteristics().await.unwrap() {
            characteristic.get_descriptors().await.unwrap();
        }
    }

    let adapter = fixture.bluetooth.adapter().clone();
    let held = adapter.handle_count();
    // The adapter, the peripheral, two services, four characteristics and a descriptor.
    assert_eq!(held, 9);

    adapter.close();
    assert!(adapter.is_closed());
    assert_eq!(adapter.handle_count(), 0);
    assert!(!gatt.connected());
    let released = |binding: &SimulatedBinding| binding.count_calls(|c| matches!(c, Call::Release(_)));
    assert_eq!(released(&fixture.binding), held);

    // Dropping the last references must not release anything twice.
    let Fixture {
        binding, bluetooth, ..
    } = fixture;
    drop((gatt, device, adapter, bluetooth));
    assert_eq!(released(&binding), held);
}
