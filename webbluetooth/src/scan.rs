//! Device discovery: request options, filters and the scan session that resolves them.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_io::Timer;
use futures_lite::{Stream, StreamExt, future};
use tracing::{debug, info};
use uuid::Uuid;
use webbluetooth_binding::advertisement_data::PeripheralInfo;

use crate::adapter::{ScanEvent, ScanEvents};
use crate::bluetooth::BluetoothInner;
use crate::device::BluetoothDevice;
use crate::error::{Error, ErrorKind, Result};
use crate::registry::{HandleId, HandleMeta};
use crate::uuids::{AttributeKind, ToUuid};

/// A custom device filter.
pub type DevicePredicate = Arc<dyn Fn(&PeripheralInfo) -> bool + Send + Sync>;

/// Matches manufacturer specific advertising data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManufacturerDataFilter {
    pub company_id: u16,
    pub data_prefix: Vec<u8>,
    /// Bits of `data_prefix` that are compared. Must have the same length as `data_prefix`.
    pub mask: Option<Vec<u8>>,
}

impl ManufacturerDataFilter {
    pub fn new(company_id: u16) -> Self {
        Self {
            company_id,
            ..Default::default()
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<Vec<u8>>) -> Self {
        self.data_prefix = prefix.into();
        self
    }

    pub fn with_mask(mut self, mask: impl Into<Vec<u8>>) -> Self {
        self.mask = Some(mask.into());
        self
    }
}

/// Matches service data in advertisements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDataFilter {
    pub service: Uuid,
    pub data_prefix: Vec<u8>,
    pub mask: Option<Vec<u8>>,
}

impl ServiceDataFilter {
    pub fn new(service: impl ToUuid) -> Result<Self> {
        Ok(Self {
            service: service.to_uuid(AttributeKind::Service)?,
            data_prefix: Vec::new(),
            mask: None,
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<Vec<u8>>) -> Self {
        self.data_prefix = prefix.into();
        self
    }

    pub fn with_mask(mut self, mask: impl Into<Vec<u8>>) -> Self {
        self.mask = Some(mask.into());
        self
    }
}

/// One alternative of a device request. Every criterion that is set must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    pub name: Option<String>,
    pub name_prefix: Option<String>,
    /// Matches if any of these services is advertised.
    pub services: Vec<Uuid>,
    /// Matches if any of these entries matches.
    pub manufacturer_data: Vec<ManufacturerDataFilter>,
    /// Matches if any of these entries matches.
    pub service_data: Vec<ServiceDataFilter>,
}

impl ScanFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = Some(prefix.into());
        self
    }

    pub fn service(mut self, service: impl ToUuid) -> Result<Self> {
        self.services.push(service.to_uuid(AttributeKind::Service)?);
        Ok(self)
    }

    pub fn manufacturer_data(mut self, filter: ManufacturerDataFilter) -> Self {
        self.manufacturer_data.push(filter);
        self
    }

    pub fn service_data(mut self, filter: ServiceDataFilter) -> Self {
        self.service_data.push(filter);
        self
    }

    fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.name_prefix.is_none()
            && self.services.is_empty()
            && self.manufacturer_data.is_empty()
            && self.service_data.is_empty()
    }

    fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "a scan filter must set at least one criterion",
            ));
        }
        if self.name_prefix.as_deref() == Some("") {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "name_prefix must not be empty",
            ));
        }
        let masks = self
            .manufacturer_data
            .iter()
            .map(|f| (&f.data_prefix, &f.mask))
            .chain(self.service_data.iter().map(|f| (&f.data_prefix, &f.mask)));
        for (prefix, mask) in masks {
            if mask.as_ref().is_some_and(|mask| mask.len() != prefix.len()) {
                return Err(Error::new(
                    ErrorKind::InvalidArgument,
                    "a data mask must be as long as its prefix",
                ));
            }
        }
        Ok(())
    }

    /// Returns `true` if `info` satisfies every criterion of this filter.
    pub fn matches(&self, info: &PeripheralInfo) -> bool {
        let name = info.display_name();
        if self.name.is_some() && self.name.as_deref() != name {
            return false;
        }
        if let Some(prefix) = &self.name_prefix {
            if !name.is_some_and(|name| name.starts_with(prefix.as_str())) {
                return false;
            }
        }

        let adv = &info.advertisement;
        if !self.services.is_empty()
            && !self.services.iter().any(|uuid| {
                adv.service_uuids.contains(uuid) || adv.service_data.contains_key(uuid)
            })
        {
            return false;
        }
        if !self.manufacturer_data.is_empty()
            && !self.manufacturer_data.iter().any(|f| {
                adv.manufacturer_data_for(f.company_id)
                    .is_some_and(|data| prefix_matches(data, &f.data_prefix, f.mask.as_deref()))
            })
        {
            return false;
        }
        if !self.service_data.is_empty()
            && !self.service_data.iter().any(|f| {
                adv.service_data
                    .get(&f.service)
                    .is_some_and(|data| prefix_matches(data, &f.data_prefix, f.mask.as_deref()))
            })
        {
            return false;
        }
        true
    }
}

fn prefix_matches(data: &[u8], prefix: &[u8], mask: Option<&[u8]>) -> bool {
    if data.len() < prefix.len() {
        return false;
    }
    prefix.iter().enumerate().all(|(i, expected)| {
        let mask = mask.and_then(|mask| mask.get(i)).copied().unwrap_or(0xff);
        data[i] & mask == expected & mask
    })
}

/// Options of [`Bluetooth::request_device()`][crate::Bluetooth::request_device].
#[derive(Clone, Default)]
pub struct RequestDeviceOptions {
    /// A device is accepted if any filter matches.
    pub filters: Option<Vec<ScanFilter>>,
    /// Services the application may access in addition to those named by the filters.
    pub optional_services: Vec<Uuid>,
    /// Accept every device. Cannot be combined with `filters`.
    pub accept_all_devices: bool,
    /// Must also hold for a device to be accepted.
    pub predicate: Option<DevicePredicate>,
    /// How long to scan. Defaults to the adapter's scan timeout.
    pub timeout: Option<Duration>,
}

impl std::fmt::Debug for RequestDeviceOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDeviceOptions")
            .field("filters", &self.filters)
            .field("optional_services", &self.optional_services)
            .field("accept_all_devices", &self.accept_all_devices)
            .field("predicate", &self.predicate.as_ref().map(|_| ".."))
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RequestDeviceOptions {
    pub fn accept_all() -> Self {
        Self {
            accept_all_devices: true,
            ..Default::default()
        }
    }

    pub fn filter(filter: ScanFilter) -> Self {
        Self {
            filters: Some(vec![filter]),
            ..Default::default()
        }
    }

    pub fn with_filter(mut self, filter: ScanFilter) -> Self {
        self.filters.get_or_insert_with(Vec::new).push(filter);
        self
    }

    pub fn with_optional_service(mut self, service: impl ToUuid) -> Result<Self> {
        self.optional_services
            .push(service.to_uuid(AttributeKind::Service)?);
        Ok(self)
    }

    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&PeripheralInfo) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        match &self.filters {
            None if !self.accept_all_devices && self.predicate.is_none() => Err(Error::new(
                ErrorKind::InvalidArgument,
                "filters, a predicate or accept_all_devices must be given",
            )),
            Some(_) if self.accept_all_devices => Err(Error::new(
                ErrorKind::InvalidArgument,
                "accept_all_devices cannot be combined with filters",
            )),
            Some(filters) if filters.is_empty() => Err(Error::new(
                ErrorKind::InvalidArgument,
                "filters must not be empty",
            )),
            Some(filters) => filters.iter().try_for_each(ScanFilter::validate),
            None => Ok(()),
        }
    }

    /// Returns `true` if a device passes the filters and the predicate.
    pub fn matches(&self, info: &PeripheralInfo) -> bool {
        let filtered = match &self.filters {
            Some(filters) => filters.iter().any(|f| f.matches(info)),
            None => true,
        };
        filtered && self.predicate.as_ref().is_none_or(|predicate| predicate(info))
    }

    /// The services an accepted device may access.
    pub fn allowed_services(&self) -> HashSet<Uuid> {
        let filters = self.filters.iter().flatten();
        filters
            .clone()
            .flat_map(|f| f.services.iter().copied())
            .chain(
                filters.flat_map(|f| f.service_data.iter().map(|s| s.service)),
            )
            .chain(self.optional_services.iter().copied())
            .collect()
    }

    /// The services the native scan may be restricted to, if every filter names some.
    fn scan_services(&self) -> Option<Vec<Uuid>> {
        let filters = self.filters.as_ref()?;
        if filters.iter().any(|f| f.services.is_empty()) {
            return None;
        }
        let mut services: Vec<_> = filters.iter().flat_map(|f| f.services.clone()).collect();
        services.sort_unstable();
        services.dedup();
        Some(services)
    }
}

/// The state of one scan: filters, the set of devices already seen and the handles it
/// registered. Dropping it stops the scan and releases the handles of every peripheral it
/// did not accept.
pub(crate) struct ScanSession {
    bluetooth: Arc<BluetoothInner>,
    options: RequestDeviceOptions,
    allowed: HashSet<Uuid>,
    events: ScanEvents,
    seen: HashSet<String>,
    registered: Vec<HandleId>,
    accepted: HashSet<HandleId>,
    finished: bool,
}

impl ScanSession {
    pub fn start(bluetooth: Arc<BluetoothInner>, options: RequestDeviceOptions) -> Result<Self> {
        options.validate()?;
        let adapter = bluetooth.adapter.inner.clone();
        let services = options.scan_services();
        let events = adapter.start_scan(services.as_deref())?;
        let allowed = options.allowed_services();
        Ok(ScanSession {
            bluetooth,
            options,
            allowed,
            events,
            seen: HashSet::new(),
            registered: Vec::new(),
            accepted: HashSet::new(),
            finished: false,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.options
            .timeout
            .unwrap_or(self.bluetooth.adapter.options().scan_timeout)
    }

    pub fn stop(&self) {
        self.events.stop();
    }

    /// Polls for the next accepted device.
    ///
    /// Yields an error if the scan fails or is cancelled, then ends.
    pub fn poll_next_match(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<BluetoothDevice>>> {
        while !self.finished {
            let event = match Pin::new(&mut self.events).poll_next(cx) {
                Poll::Ready(Some(event)) => event,
                Poll::Ready(None) => break,
                Poll::Pending => return Poll::Pending,
            };

            match event {
                ScanEvent::Discovered(info) => {
                    if let Some(device) = self.process(info) {
                        return Poll::Ready(Some(Ok(device)));
                    }
                }
                ScanEvent::Stopped(Some(error)) => {
                    self.finished = true;
                    return Poll::Ready(Some(Err(error.into())));
                }
                ScanEvent::Stopped(None) | ScanEvent::Cancelled => {
                    self.finished = true;
                    return Poll::Ready(Some(Err(Error::new(
                        ErrorKind::Cancelled,
                        "the scan was cancelled",
                    ))));
                }
            }
        }
        self.finished = true;
        Poll::Ready(None)
    }

    pub async fn next_match(&mut self) -> Option<Result<BluetoothDevice>> {
        future::poll_fn(|cx| self.poll_next_match(cx)).await
    }

    fn process(&mut self, info: PeripheralInfo) -> Option<BluetoothDevice> {
        if !self.seen.insert(info.id.clone()) {
            return None;
        }

        let adapter = &self.bluetooth.adapter.inner;
        let (id, new) = adapter.register(
            info.handle.as_native().clone(),
            HandleMeta::Peripheral {
                device_id: info.id.clone(),
            },
        );
        if new {
            self.registered.push(id);
        }

        if !self.options.matches(&info) {
            debug!(device = %info.id, "device does not match");
            return None;
        }

        info!(
            device = %info.id,
            name = ?info.display_name(),
            rssi = ?info.rssi,
            "device matched"
        );
        self.accepted.insert(id);
        Some(self.bluetooth.accept(info, id, &self.allowed))
    }
}

impl Drop for ScanSession {
    fn drop(&mut self) {
        self.events.stop();
        let unmatched: Vec<_> = self
            .registered
            .iter()
            .copied()
            .filter(|id| !self.accepted.contains(id))
            .collect();
        if !unmatched.is_empty() {
            debug!(count = unmatched.len(), "releasing unmatched peripherals");
            self.bluetooth.adapter.inner.release_many(unmatched);
        }
    }
}

/// Resolves the first device accepted before the timeout.
pub(crate) async fn request_device(
    bluetooth: Arc<BluetoothInner>,
    options: RequestDeviceOptions,
) -> Result<BluetoothDevice> {
    let mut session = ScanSession::start(bluetooth, options)?;
    let timeout = session.timeout();

    let found = future::or(async { Some(session.next_match().await) }, async {
        Timer::after(timeout).await;
        None
    })
    .await;
    session.stop();

    match found {
        Some(Some(result)) => result,
        Some(None) => Err(Error::new(ErrorKind::Cancelled, "the scan was cancelled")),
        None => Err(Error::new(
            ErrorKind::NotFound,
            format!("no matching device found within {timeout:?}"),
        )),
    }
}

/// Collects every device accepted before the timeout.
pub(crate) async fn request_devices(
    bluetooth: Arc<BluetoothInner>,
    options: RequestDeviceOptions,
) -> Result<Vec<BluetoothDevice>> {
    let mut session = ScanSession::start(bluetooth, options)?;
    let timeout = session.timeout();
    let mut deadline = Timer::after(timeout);
    let mut devices = Vec::new();

    loop {
        let next = future::or(async { Some(session.next_match().await) }, async {
            (&mut deadline).await;
            None
        })
        .await;
        match next {
            Some(Some(Ok(device))) => devices.push(device),
            Some(Some(Err(err))) => return Err(err),
            Some(None) | None => break,
        }
    }
    session.stop();

    if devices.is_empty() {
        Err(Error::new(
            ErrorKind::NotFound,
            format!("no matching devices found within {timeout:?}"),
        ))
    } else {
        Ok(devices)
    }
}

/// A long-running scan, returned by [`Bluetooth::scan()`][crate::Bluetooth::scan].
///
/// Yields each newly accepted device. The scan runs until this stream is dropped, the
/// scan is cancelled or the native stack fails it.
pub struct Scan {
    session: ScanSession,
}

impl std::fmt::Debug for Scan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scan")
            .field("seen", &self.session.seen.len())
            .field("finished", &self.session.finished)
            .finish_non_exhaustive()
    }
}

impl Scan {
    pub(crate) fn new(session: ScanSession) -> Self {
        Scan { session }
    }

    /// Collects the devices accepted within `duration`, then stops.
    pub async fn collect_for(mut self, duration: Duration) -> Result<Vec<BluetoothDevice>> {
        let mut deadline = Timer::after(duration);
        let mut devices = Vec::new();
        loop {
            let next = future::or(async { Some(self.next().await) }, async {
                (&mut deadline).await;
                None
            })
            .await;
            match next {
                Some(Some(Ok(device))) => devices.push(device),
                Some(Some(Err(err))) => return Err(err),
                Some(None) | None => return Ok(devices),
            }
        }
    }
}

impl Stream for Scan {
    type Item = Result<BluetoothDevice>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.session.poll_next_match(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use webbluetooth_binding::PeripheralHandle;
    use webbluetooth_binding::advertisement_data::{AdvertisementData, ManufacturerData};
    use webbluetooth_binding::uuids::from_u16;

    use super::*;

    fn info(name: Option<&str>, advertisement: AdvertisementData) -> PeripheralInfo {
        PeripheralInfo {
            handle: PeripheralHandle::new(1),
            id: "dev".into(),
            name: name.map(Into::into),
            rssi: Some(-40),
            advertisement,
        }
    }

    #[test]
    fn options_are_validated() {
        let kind = |options: RequestDeviceOptions| options.validate().unwrap_err().kind();
        assert_eq!(
            kind(RequestDeviceOptions::default()),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            kind(RequestDeviceOptions::accept_all().with_filter(ScanFilter::new().name("x"))),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            kind(RequestDeviceOptions {
                filters: Some(Vec::new()),
                ..Default::default()
            }),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            kind(RequestDeviceOptions::filter(ScanFilter::new())),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            kind(RequestDeviceOptions::filter(
                ScanFilter::new().manufacturer_data(
                    ManufacturerDataFilter::new(1)
                        .with_prefix([1, 2])
                        .with_mask([1])
                )
            )),
            ErrorKind::InvalidArgument
        );
        assert!(RequestDeviceOptions::accept_all().validate().is_ok());
        assert!(
            RequestDeviceOptions::default()
                .with_predicate(|_| true)
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn name_and_prefix_use_the_advertised_name() {
        let adv = AdvertisementData {
            local_name: Some("Polar H10".into()),
            ..Default::default()
        };
        assert!(ScanFilter::new().name("Polar H10").matches(&info(None, adv.clone())));
        assert!(ScanFilter::new().name_prefix("Polar").matches(&info(None, adv.clone())));
        assert!(!ScanFilter::new().name_prefix("Garmin").matches(&info(None, adv)));
        assert!(!ScanFilter::new().name("x").matches(&info(None, Default::default())));
    }

    #[test]
    fn services_match_advertised_uuids_and_service_data() {
        let heart_rate = from_u16(0x180d);
        let adv = AdvertisementData {
            service_data: HashMap::from([(heart_rate, vec![1])]),
            ..Default::default()
        };
        let filter = ScanFilter::new().service(0x180d_u16).unwrap();
        assert!(filter.matches(&info(None, adv)));
        assert!(!filter.matches(&info(None, Default::default())));
    }

    #[test]
    fn data_prefixes_honor_masks() {
        let adv = AdvertisementData {
            manufacturer_data: vec![ManufacturerData {
                company_id: 0x004c,
                data: vec![0x02, 0x15, 0xaa],
            }],
            ..Default::default()
        };
        let exact = ManufacturerDataFilter::new(0x004c).with_prefix([0x02, 0x15]);
        let masked = ManufacturerDataFilter::new(0x004c)
            .with_prefix([0x00, 0x15])
            .with_mask([0x00, 0xff]);
        let wrong = ManufacturerDataFilter::new(0x004c).with_prefix([0x03]);
        let long = ManufacturerDataFilter::new(0x004c).with_prefix([0x02, 0x15, 0xaa, 0x00]);

        let device = info(None, adv);
        assert!(ScanFilter::new().manufacturer_data(exact).matches(&device));
        assert!(ScanFilter::new().manufacturer_data(masked).matches(&device));
        assert!(!ScanFilter::new().manufacturer_data(wrong).matches(&device));
        assert!(!ScanFilter::new().manufacturer_data(long).matches(&device));
        assert!(
            !ScanFilter::new()
                .manufacturer_data(ManufacturerDataFilter::new(0x0006))
                .matches(&device)
        );
    }

    #[test]
    fn predicate_must_also_hold() {
        let options = RequestDeviceOptions::accept_all().with_predicate(|i| i.rssi > Some(-50));
        assert!(options.matches(&info(None, Default::default())));
        let options = RequestDeviceOptions::accept_all().with_predicate(|i| i.rssi > Some(-30));
        assert!(!options.matches(&info(None, Default::default())));
    }

    #[test]
    fn allowed_services_union_filters_and_optional_services() {
        let options = RequestDeviceOptions::filter(ScanFilter::new().service(0x180d_u16).unwrap())
            .with_filter(
                ScanFilter::new().service_data(ServiceDataFilter::new(0x180f_u16).unwrap()),
            )
            .with_optional_service("device_information")
            .unwrap();
        let allowed = options.allowed_services();
        assert_eq!(allowed.len(), 3);
        assert!(allowed.contains(&from_u16(0x180a)));
        assert!(allowed.contains(&from_u16(0x180d)));
        assert!(allowed.contains(&from_u16(0x180f)));
        // The second filter names no advertised service, so the scan is unrestricted.
        assert_eq!(options.scan_services(), None);
    }
}
