//! USB backend on nusb: device listing, hotplug watching, and the bulk/interrupt
//! transport a session talks through.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::StreamExt;
use log::{debug, info, warn};
use nusb::descriptors::TransferType;
use nusb::hotplug::HotplugEvent;
use nusb::transfer::{Buffer, Bulk, ControlIn, ControlOut, ControlType, Direction, In, Interrupt, Out, Recipient};
use nusb::{DeviceId, Endpoint, MaybeFuture};

use crate::device::{DeviceDescriptor, InterfaceDescriptor};
use crate::error::TransportError;
use crate::transport::{Transport, TransportFactory};

/// PTP event containers are small; one interrupt transfer holds a whole event.
const EVENT_BUFFER_LEN: usize = 64;

/// Grace period for cancelled transfers to come back from the host controller.
const CANCEL_DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

// ============================================================================
// Discovery
// ============================================================================

/// `"{bus}-{address}"`, matching [`DeviceDescriptor::location`].
pub fn location(bus_id: &str, address: u8) -> String {
    format!("{}-{}", bus_id, address)
}

fn descriptor_from(info: &nusb::DeviceInfo) -> DeviceDescriptor {
    DeviceDescriptor {
        vendor_id: info.vendor_id(),
        product_id: info.product_id(),
        class: info.class(),
        subclass: info.subclass(),
        protocol: info.protocol(),
        serial_number: info.serial_number().map(str::to_string),
        manufacturer: info.manufacturer_string().map(str::to_string),
        product: info.product_string().map(str::to_string),
        interfaces: info
            .interfaces()
            .map(|i| InterfaceDescriptor {
                number: i.interface_number(),
                class: i.class(),
                subclass: i.subclass(),
                protocol: i.protocol(),
                name: i.interface_string().map(str::to_string),
            })
            .collect(),
        location: location(info.bus_id(), info.device_address()),
    }
}

/// Lists connected still-image devices without opening them.
///
/// Returns an empty list if enumeration fails.
pub fn list_devices() -> Vec<DeviceDescriptor> {
    match nusb::list_devices().wait() {
        Ok(devices) => {
            let cameras: Vec<DeviceDescriptor> = devices
                .map(|d| descriptor_from(&d))
                .filter(DeviceDescriptor::is_still_image_device)
                .collect();
            debug!("Found {} camera(s)", cameras.len());
            for camera in &cameras {
                debug!(
                    "Camera: {} at {}, vendor={:04x}, product={:04x}",
                    camera.display_name(),
                    camera.location,
                    camera.vendor_id,
                    camera.product_id
                );
            }
            cameras
        }
        Err(e) => {
            warn!("Failed to enumerate USB devices: {}", e);
            Vec::new()
        }
    }
}

/// A camera appeared or went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceChange {
    Attached(DeviceDescriptor),
    Detached(DeviceDescriptor),
}

/// Watches USB hotplug events and reports cameras only.
///
/// nusb reports a disconnect by device ID alone, so the watcher remembers the
/// descriptor of every camera it has seen.
pub struct CameraWatcher {
    events: nusb::hotplug::HotplugWatch,
    known: HashMap<DeviceId, DeviceDescriptor>,
}

/// Starts watching for cameras. Cameras already plugged in are known but not reported.
pub fn watch_hotplug() -> Result<CameraWatcher, TransportError> {
    CameraWatcher::start()
}

impl CameraWatcher {
    fn start() -> Result<Self, TransportError> {
        let events = nusb::watch_devices().map_err(map_error)?;
        let mut known = HashMap::new();
        match nusb::list_devices().wait() {
            Ok(devices) => {
                for device in devices {
                    let descriptor = descriptor_from(&device);
                    if descriptor.is_still_image_device() {
                        known.insert(device.id(), descriptor);
                    }
                }
            }
            Err(e) => warn!("Failed to enumerate USB devices: {}", e),
        }
        debug!("USB hotplug watcher started ({} camera(s) present)", known.len());
        Ok(Self { events, known })
    }

    /// Waits for the next camera change. `None` when the hotplug stream ends.
    pub async fn next(&mut self) -> Option<DeviceChange> {
        while let Some(event) = self.events.next().await {
            match event {
                HotplugEvent::Connected(device) => {
                    let descriptor = descriptor_from(&device);
                    if !descriptor.is_still_image_device() {
                        continue;
                    }
                    info!("Camera connected: {} at {}", descriptor.display_name(), descriptor.location);
                    self.known.insert(device.id(), descriptor.clone());
                    return Some(DeviceChange::Attached(descriptor));
                }
                HotplugEvent::Disconnected(id) => {
                    if let Some(descriptor) = self.known.remove(&id) {
                        info!(
                            "Camera disconnected: {} at {}",
                            descriptor.display_name(),
                            descriptor.location
                        );
                        return Some(DeviceChange::Detached(descriptor));
                    }
                }
            }
        }
        warn!("USB hotplug watcher stream ended unexpectedly");
        None
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Opens devices by location.
#[derive(Debug, Default, Clone, Copy)]
pub struct NusbTransportFactory;

impl TransportFactory for NusbTransportFactory {
    fn open(&self, device: &DeviceDescriptor) -> Result<Box<dyn Transport>, TransportError> {
        let interface_number = device.ptp_interface().ok_or(TransportError::NotFound)?;
        let info = nusb::list_devices()
            .wait()
            .map_err(map_error)?
            .find(|d| location(d.bus_id(), d.device_address()) == device.location)
            .ok_or(TransportError::NotFound)?;
        if info.vendor_id() != device.vendor_id || info.product_id() != device.product_id {
            // Another device took the address.
            return Err(TransportError::NotFound);
        }

        let handle = info.open().wait().map_err(map_error)?;
        let endpoints = find_endpoints(&handle, interface_number)?;
        let interface = handle
            .detach_and_claim_interface(interface_number)
            .wait()
            .map_err(map_error)?;

        let bulk_in = interface.endpoint::<Bulk, In>(endpoints.bulk_in).map_err(map_error)?;
        let bulk_out = interface.endpoint::<Bulk, Out>(endpoints.bulk_out).map_err(map_error)?;
        let interrupt = match endpoints.interrupt {
            Some(address) => match interface.endpoint::<Interrupt, In>(address) {
                Ok(ep) => Some(ep),
                Err(e) => {
                    warn!("{}: interrupt endpoint unusable: {}", device.location, e);
                    None
                }
            },
            None => None,
        };
        debug!(
            "{}: claimed interface {} (bulk in 0x{:02x}, bulk out 0x{:02x}, events {:?})",
            device.location, interface_number, endpoints.bulk_in, endpoints.bulk_out, endpoints.interrupt
        );

        Ok(Box::new(NusbTransport {
            interface,
            interface_number,
            bulk_in,
            bulk_out,
            interrupt,
            event_pending: false,
        }))
    }
}

#[derive(Debug, PartialEq, Eq)]
struct EndpointAddresses {
    bulk_in: u8,
    bulk_out: u8,
    interrupt: Option<u8>,
}

fn find_endpoints(device: &nusb::Device, interface_number: u8) -> Result<EndpointAddresses, TransportError> {
    let config = device.active_configuration().map_err(|e| TransportError::Io(e.to_string()))?;
    let alt = config
        .interface_alt_settings()
        .find(|alt| alt.interface_number() == interface_number)
        .ok_or(TransportError::NotFound)?;
    pick_endpoints(
        alt.endpoints()
            .map(|ep| (ep.address(), ep.transfer_type(), ep.direction())),
    )
}

/// PTP needs one bulk-in and one bulk-out endpoint; the interrupt-in endpoint is optional.
fn pick_endpoints(
    endpoints: impl IntoIterator<Item = (u8, TransferType, Direction)>,
) -> Result<EndpointAddresses, TransportError> {
    let (mut bulk_in, mut bulk_out, mut interrupt) = (None, None, None);
    for (address, kind, direction) in endpoints {
        match (kind, direction) {
            (TransferType::Bulk, Direction::In) => bulk_in = bulk_in.or(Some(address)),
            (TransferType::Bulk, Direction::Out) => bulk_out = bulk_out.or(Some(address)),
            (TransferType::Interrupt, Direction::In) => interrupt = interrupt.or(Some(address)),
            _ => {}
        }
    }
    match (bulk_in, bulk_out) {
        (Some(bulk_in), Some(bulk_out)) => Ok(EndpointAddresses {
            bulk_in,
            bulk_out,
            interrupt,
        }),
        _ => Err(TransportError::Io("interface has no bulk endpoint pair".to_string())),
    }
}

/// A claimed PTP interface.
pub struct NusbTransport {
    interface: nusb::Interface,
    interface_number: u8,
    bulk_in: Endpoint<Bulk, In>,
    bulk_out: Endpoint<Bulk, Out>,
    interrupt: Option<Endpoint<Interrupt, In>>,
    /// An interrupt read is submitted and not yet completed. It stays queued across
    /// `read_event` calls so events are never lost to a short wait.
    event_pending: bool,
}

/// IN transfers must request a whole number of packets.
fn round_up_to_packet(len: usize, packet: usize) -> usize {
    let packet = packet.max(1);
    len.max(1).div_ceil(packet) * packet
}

impl NusbTransport {
    fn control_index(&self) -> u16 {
        u16::from(self.interface_number)
    }
}

impl Transport for NusbTransport {
    fn write_bulk(&mut self, data: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        self.bulk_out.submit(Buffer::from(data.to_vec()));
        let Some(completion) = self.bulk_out.wait_next_complete(timeout) else {
            self.bulk_out.cancel_all();
            let _ = self.bulk_out.wait_next_complete(CANCEL_DRAIN_TIMEOUT);
            return Err(TransportError::Timeout);
        };
        completion.status.map_err(map_transfer_error)?;
        Ok(completion.actual_len)
    }

    fn read_bulk(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let len = round_up_to_packet(max_len, self.bulk_in.max_packet_size());
        let mut buffer = Buffer::new(len);
        buffer.set_requested_len(len);
        self.bulk_in.submit(buffer);
        let Some(completion) = self.bulk_in.wait_next_complete(timeout) else {
            self.bulk_in.cancel_all();
            let _ = self.bulk_in.wait_next_complete(CANCEL_DRAIN_TIMEOUT);
            return Err(TransportError::Timeout);
        };
        completion.status.map_err(map_transfer_error)?;
        Ok(completion.buffer[..completion.actual_len].to_vec())
    }

    fn read_event(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
        let Some(endpoint) = self.interrupt.as_mut() else {
            return Err(TransportError::Io("no interrupt endpoint".to_string()));
        };
        if !self.event_pending {
            let len = round_up_to_packet(EVENT_BUFFER_LEN, endpoint.max_packet_size());
            let mut buffer = Buffer::new(len);
            buffer.set_requested_len(len);
            endpoint.submit(buffer);
            self.event_pending = true;
        }
        let Some(completion) = endpoint.wait_next_complete(timeout) else {
            return Ok(None);
        };
        self.event_pending = false;
        completion.status.map_err(map_transfer_error)?;
        Ok(Some(completion.buffer[..completion.actual_len].to_vec()))
    }

    fn has_event_channel(&self) -> bool {
        self.interrupt.is_some()
    }

    fn control_in(
        &mut self,
        request: u8,
        value: u16,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.interface
            .control_in(
                ControlIn {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request,
                    value,
                    index: self.control_index(),
                    length,
                },
                timeout,
            )
            .wait()
            .map_err(map_transfer_error)
    }

    fn control_out(&mut self, request: u8, value: u16, data: &[u8], timeout: Duration) -> Result<(), TransportError> {
        self.interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request,
                    value,
                    index: self.control_index(),
                    data,
                },
                timeout,
            )
            .wait()
            .map_err(map_transfer_error)
    }

    fn clear_halt(&mut self) -> Result<(), TransportError> {
        self.bulk_in.clear_halt().wait().map_err(map_error)?;
        self.bulk_out.clear_halt().wait().map_err(map_error)
    }

    fn max_packet_size(&self) -> usize {
        self.bulk_in.max_packet_size()
    }
}

impl Drop for NusbTransport {
    fn drop(&mut self) {
        if self.event_pending
            && let Some(endpoint) = self.interrupt.as_mut()
        {
            endpoint.cancel_all();
            let _ = endpoint.wait_next_complete(CANCEL_DRAIN_TIMEOUT);
        }
    }
}

// ============================================================================
// Error mapping
// ============================================================================

fn map_error(e: nusb::Error) -> TransportError {
    match e.kind() {
        nusb::ErrorKind::Disconnected => TransportError::Disconnected,
        nusb::ErrorKind::Busy => TransportError::Busy,
        nusb::ErrorKind::PermissionDenied => TransportError::AccessDenied,
        nusb::ErrorKind::NotFound => TransportError::NotFound,
        _ => TransportError::Io(e.to_string()),
    }
}

fn map_transfer_error(e: nusb::transfer::TransferError) -> TransportError {
    use nusb::transfer::TransferError;
    match e {
        TransferError::Stall => TransportError::Stall,
        TransferError::Disconnected => TransportError::Disconnected,
        TransferError::Cancelled => TransportError::Cancelled,
        other => TransportError::Io(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_format() {
        assert_eq!(location("1", 5), "1-5");
        assert_eq!(location("20", 12), "20-12");
    }

    #[test]
    fn test_round_up_to_packet() {
        assert_eq!(round_up_to_packet(65536, 512), 65536);
        assert_eq!(round_up_to_packet(100, 512), 512);
        assert_eq!(round_up_to_packet(513, 512), 1024);
        assert_eq!(round_up_to_packet(0, 64), 64);
        assert_eq!(round_up_to_packet(10, 0), 10);
    }

    #[test]
    fn test_pick_endpoints() {
        let endpoints = pick_endpoints([
            (0x81, TransferType::Bulk, Direction::In),
            (0x02, TransferType::Bulk, Direction::Out),
            (0x83, TransferType::Interrupt, Direction::In),
        ])
        .unwrap();
        assert_eq!(
            endpoints,
            EndpointAddresses {
                bulk_in: 0x81,
                bulk_out: 0x02,
                interrupt: Some(0x83),
            }
        );
    }

    #[test]
    fn test_pick_endpoints_without_interrupt() {
        let endpoints = pick_endpoints([
            (0x02, TransferType::Bulk, Direction::Out),
            (0x81, TransferType::Bulk, Direction::In),
        ])
        .unwrap();
        assert_eq!(endpoints.interrupt, None);
    }

    #[test]
    fn test_pick_endpoints_requires_bulk_pair() {
        let result = pick_endpoints([(0x81, TransferType::Bulk, Direction::In)]);
        assert!(matches!(result, Err(TransportError::Io(_))));
    }

    #[test]
    fn test_transfer_error_mapping() {
        use nusb::transfer::TransferError;
        assert_eq!(map_transfer_error(TransferError::Stall), TransportError::Stall);
        assert_eq!(map_transfer_error(TransferError::Disconnected), TransportError::Disconnected);
        assert_eq!(map_transfer_error(TransferError::Cancelled), TransportError::Cancelled);
    }

    #[test]
    fn test_list_devices_returns_vec() {
        // Actual device testing requires hardware
        let cameras = list_devices();
        assert!(cameras.iter().all(DeviceDescriptor::is_still_image_device));
    }
}
