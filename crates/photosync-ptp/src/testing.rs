//! In-process virtual camera for tests and demos.
//!
//! [`VirtualCamera`] answers PTP commands from an in-memory object store and lets a
//! test inject the failures real cameras produce: a transfer that times out partway,
//! an unplug, a busy device, a stale session left by a previous run, slow reads, and
//! a missing or failing event endpoint.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};

use crate::ObjectHandle;
use crate::codes::{EventCode, ObjectFormat, OperationCode, ResponseCode, class_request};
use crate::container::{Container, ContainerKind, HEADER_LEN};
use crate::dataset::{self, DeviceInfo, ObjectInfo};
use crate::device::{DeviceDescriptor, InterfaceDescriptor, STILL_IMAGE_CLASS};
use crate::error::TransportError;
use crate::ignore_poison::IgnorePoison;
use crate::transport::{Transport, TransportFactory};

pub const CANON_VENDOR_ID: u16 = 0x04a9;
pub const NIKON_VENDOR_ID: u16 = 0x04b0;
pub const SONY_VENDOR_ID: u16 = 0x054c;

/// Builds a descriptor for a still-image class camera.
pub fn camera_descriptor(vendor_id: u16, product_id: u16, product: &str) -> DeviceDescriptor {
    DeviceDescriptor {
        vendor_id,
        product_id,
        class: 0,
        subclass: 0,
        protocol: 0,
        serial_number: Some(format!("VC{:04x}{:04x}", vendor_id, product_id)),
        manufacturer: Some("Virtual".to_string()),
        product: Some(product.to_string()),
        interfaces: vec![InterfaceDescriptor {
            number: 0,
            class: STILL_IMAGE_CLASS,
            subclass: 1,
            protocol: 1,
            name: None,
        }],
        location: format!("0-{}", product_id & 0x7f),
    }
}

struct VirtualObject {
    info: ObjectInfo,
    data: Vec<u8>,
}

struct TransferFault {
    /// Payload bytes served before the fault fires.
    after: usize,
    error: TransportError,
}

struct CameraState {
    objects: BTreeMap<u32, VirtualObject>,
    events: VecDeque<Vec<u8>>,
    session_open: bool,
    stale_session: bool,
    busy_opens: u32,
    transfer_fault: Option<TransferFault>,
    disconnected: bool,
    access_denied: bool,
    has_event_channel: bool,
    event_channel_failed: bool,
    operations: Vec<u16>,
    read_delay: Duration,
    handle_list_requests: usize,
    object_requests: usize,
    cancel_requests: usize,
}

/// A virtual PTP camera. Clones share the same device.
#[derive(Clone)]
pub struct VirtualCamera {
    descriptor: DeviceDescriptor,
    state: Arc<Mutex<CameraState>>,
}

impl VirtualCamera {
    pub fn new(descriptor: DeviceDescriptor) -> Self {
        Self {
            descriptor,
            state: Arc::new(Mutex::new(CameraState {
                objects: BTreeMap::new(),
                events: VecDeque::new(),
                session_open: false,
                stale_session: false,
                busy_opens: 0,
                transfer_fault: None,
                disconnected: false,
                access_denied: false,
                has_event_channel: true,
                event_channel_failed: false,
                operations: vec![0x1001, 0x1002, 0x1003, 0x1007, 0x1008, 0x1009],
                read_delay: Duration::ZERO,
                handle_list_requests: 0,
                object_requests: 0,
                cancel_requests: 0,
            })),
        }
    }

    pub fn baseline() -> Self {
        Self::new(camera_descriptor(0x1234, 0x0001, "Virtual PTP Camera"))
    }

    pub fn canon() -> Self {
        Self::new(camera_descriptor(CANON_VENDOR_ID, 0x32d9, "Canon EOS R6"))
    }

    pub fn nikon() -> Self {
        Self::new(camera_descriptor(NIKON_VENDOR_ID, 0x0442, "Nikon Z 6"))
    }

    pub fn sony() -> Self {
        Self::new(camera_descriptor(SONY_VENDOR_ID, 0x0d9f, "ILCE-7M4"))
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn factory(&self) -> Arc<dyn TransportFactory> {
        Arc::new(VirtualCameraFactory { camera: self.clone() })
    }

    /// Adds a JPEG of `size` bytes with deterministic content.
    pub fn add_photo(&self, handle: u32, name: &str, size: usize) -> ObjectHandle {
        let info = ObjectInfo {
            storage_id: 0x0001_0001,
            format: ObjectFormat::EXIF_JPEG.0,
            compressed_size: size as u32,
            parent: 0,
            filename: name.to_string(),
            capture_date: "20240101T120000".to_string(),
            ..Default::default()
        };
        self.add_object(handle, info, photo_bytes(size))
    }

    pub fn add_folder(&self, handle: u32, name: &str) -> ObjectHandle {
        let info = ObjectInfo {
            storage_id: 0x0001_0001,
            format: ObjectFormat::ASSOCIATION.0,
            association_type: 1,
            filename: name.to_string(),
            ..Default::default()
        };
        self.add_object(handle, info, Vec::new())
    }

    pub fn add_object(&self, handle: u32, info: ObjectInfo, data: Vec<u8>) -> ObjectHandle {
        self.state
            .lock_ignore_poison()
            .objects
            .insert(handle, VirtualObject { info, data });
        ObjectHandle(handle)
    }

    /// Queues an event on the interrupt endpoint.
    pub fn push_event(&self, code: EventCode, params: &[u32]) {
        let bytes = Container::event(code, 0, params).encode().to_vec();
        self.state.lock_ignore_poison().events.push_back(bytes);
    }

    /// Next GetObject fails with `error` after `after` payload bytes. One-shot.
    pub fn fail_transfer_after(&self, after: usize, error: TransportError) {
        self.state.lock_ignore_poison().transfer_fault = Some(TransferFault { after, error });
    }

    /// Simulates an unplug: every transport call fails with `Disconnected`, and new
    /// opens fail with `NotFound`.
    pub fn disconnect(&self) {
        self.state.lock_ignore_poison().disconnected = true;
    }

    pub fn deny_access(&self) {
        self.state.lock_ignore_poison().access_denied = true;
    }

    /// The next `count` OpenSession commands answer DeviceBusy.
    pub fn set_busy_opens(&self, count: u32) {
        self.state.lock_ignore_poison().busy_opens = count;
    }

    /// Pretends a previous run left a session open on the device.
    pub fn set_stale_session(&self) {
        self.state.lock_ignore_poison().stale_session = true;
    }

    pub fn set_event_channel(&self, present: bool) {
        self.state.lock_ignore_poison().has_event_channel = present;
    }

    /// Event reads fail from now on, without the device going away.
    pub fn fail_event_channel(&self) {
        self.state.lock_ignore_poison().event_channel_failed = true;
    }

    /// Every bulk-in read of a data phase sleeps this long first.
    /// Replaces the operation list DeviceInfo advertises.
    pub fn set_operations(&self, operations: &[u16]) {
        self.state.lock_ignore_poison().operations = operations.to_vec();
    }

    pub fn set_read_delay(&self, delay: Duration) {
        self.state.lock_ignore_poison().read_delay = delay;
    }

    pub fn is_session_open(&self) -> bool {
        self.state.lock_ignore_poison().session_open
    }

    pub fn handle_list_requests(&self) -> usize {
        self.state.lock_ignore_poison().handle_list_requests
    }

    pub fn object_requests(&self) -> usize {
        self.state.lock_ignore_poison().object_requests
    }

    pub fn cancel_requests(&self) -> usize {
        self.state.lock_ignore_poison().cancel_requests
    }
}

/// Deterministic photo content, so tests can compare downloaded bytes.
pub fn photo_bytes(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

struct VirtualCameraFactory {
    camera: VirtualCamera,
}

impl TransportFactory for VirtualCameraFactory {
    fn open(&self, device: &DeviceDescriptor) -> Result<Box<dyn Transport>, TransportError> {
        if device.location != self.camera.descriptor.location {
            return Err(TransportError::NotFound);
        }
        let state = self.camera.state.lock_ignore_poison();
        if state.disconnected {
            return Err(TransportError::NotFound);
        }
        if state.access_denied {
            return Err(TransportError::AccessDenied);
        }
        drop(state);
        Ok(Box::new(VirtualTransport {
            camera: self.camera.clone(),
            outgoing: VecDeque::new(),
        }))
    }
}

/// One container queued for the host, served across as many reads as needed.
struct Outgoing {
    bytes: Vec<u8>,
    pos: usize,
    is_data: bool,
    /// Byte offset within `bytes` at which the read fails.
    fault: Option<(usize, TransportError)>,
}

struct VirtualTransport {
    camera: VirtualCamera,
    outgoing: VecDeque<Outgoing>,
}

impl VirtualTransport {
    fn queue(&mut self, container: Container) {
        self.outgoing.push_back(Outgoing {
            is_data: container.kind == ContainerKind::Data,
            bytes: container.encode().to_vec(),
            pos: 0,
            fault: None,
        });
    }

    fn respond(&mut self, code: ResponseCode, tid: u32) {
        self.queue(Container::response(code, tid, &[]));
    }

    fn handle_command(&mut self, command: &Container) {
        let op = OperationCode(command.code);
        let tid = command.transaction_id;
        let params = command.params().unwrap_or_default();
        let mut state = self.camera.state.lock_ignore_poison();

        let needs_session = !matches!(op, OperationCode::GET_DEVICE_INFO | OperationCode::OPEN_SESSION);
        if needs_session && !state.session_open {
            drop(state);
            self.respond(ResponseCode::SESSION_NOT_OPEN, tid);
            return;
        }

        match op {
            OperationCode::GET_DEVICE_INFO => {
                let info = DeviceInfo {
                    standard_version: 100,
                    vendor_extension_desc: "virtual".to_string(),
                    operations_supported: state.operations.clone(),
                    events_supported: vec![0x4002],
                    manufacturer: self.camera.descriptor.manufacturer.clone().unwrap_or_default(),
                    model: self.camera.descriptor.product.clone().unwrap_or_default(),
                    device_version: "1.0".to_string(),
                    serial_number: self.camera.descriptor.serial_number.clone().unwrap_or_default(),
                    ..Default::default()
                };
                drop(state);
                self.queue(Container::data(op, tid, info.encode().freeze()));
                self.respond(ResponseCode::OK, tid);
            }
            OperationCode::OPEN_SESSION => {
                let code = if state.busy_opens > 0 {
                    state.busy_opens -= 1;
                    ResponseCode::DEVICE_BUSY
                } else if state.stale_session {
                    state.stale_session = false;
                    state.session_open = true;
                    ResponseCode::SESSION_ALREADY_OPEN
                } else if state.session_open {
                    ResponseCode::SESSION_ALREADY_OPEN
                } else {
                    state.session_open = true;
                    ResponseCode::OK
                };
                drop(state);
                self.respond(code, tid);
            }
            OperationCode::CLOSE_SESSION => {
                state.session_open = false;
                drop(state);
                self.respond(ResponseCode::OK, tid);
            }
            OperationCode::GET_OBJECT_HANDLES => {
                state.handle_list_requests += 1;
                let handles: Vec<u32> = state.objects.keys().copied().collect();
                drop(state);
                let mut buf = BytesMut::new();
                dataset::put_u32_array(&mut buf, &handles);
                self.queue(Container::data(op, tid, buf.freeze()));
                self.respond(ResponseCode::OK, tid);
            }
            OperationCode::GET_OBJECT_INFO => {
                let handle = params.first().copied().unwrap_or_default();
                let info = state.objects.get(&handle).map(|o| o.info.encode());
                drop(state);
                match info {
                    Some(info) => {
                        self.queue(Container::data(op, tid, info.freeze()));
                        self.respond(ResponseCode::OK, tid);
                    }
                    None => self.respond(ResponseCode::INVALID_OBJECT_HANDLE, tid),
                }
            }
            OperationCode::GET_OBJECT => {
                state.object_requests += 1;
                let handle = params.first().copied().unwrap_or_default();
                let Some(data) = state.objects.get(&handle).map(|o| o.data.clone()) else {
                    drop(state);
                    self.respond(ResponseCode::INVALID_OBJECT_HANDLE, tid);
                    return;
                };
                let fault = state
                    .transfer_fault
                    .take()
                    .map(|f| (HEADER_LEN + f.after, f.error));
                drop(state);
                self.queue(Container::data(op, tid, data));
                if let Some(last) = self.outgoing.back_mut() {
                    last.fault = fault;
                }
                self.respond(ResponseCode::OK, tid);
            }
            _ => {
                drop(state);
                self.respond(ResponseCode::OPERATION_NOT_SUPPORTED, tid);
            }
        }
    }

    fn check_connected(&self) -> Result<(), TransportError> {
        if self.camera.state.lock_ignore_poison().disconnected {
            return Err(TransportError::Disconnected);
        }
        Ok(())
    }
}

impl Transport for VirtualTransport {
    fn write_bulk(&mut self, data: &[u8], _timeout: Duration) -> Result<usize, TransportError> {
        self.check_connected()?;
        let command = Container::decode(data).map_err(|e| TransportError::Io(e.to_string()))?;
        if command.kind != ContainerKind::Command {
            return Err(TransportError::Stall);
        }
        self.handle_command(&command);
        Ok(data.len())
    }

    fn read_bulk(&mut self, max_len: usize, _timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.check_connected()?;
        let Some(front) = self.outgoing.front_mut() else {
            return Err(TransportError::Timeout);
        };

        if front.is_data {
            let delay = self.camera.state.lock_ignore_poison().read_delay;
            if !delay.is_zero() {
                thread::sleep(delay);
                self.check_connected()?;
            }
        }
        // The delay may have raced with a disconnect or cancel.
        let Some(front) = self.outgoing.front_mut() else {
            return Err(TransportError::Timeout);
        };

        let mut end = (front.pos + max_len).min(front.bytes.len());
        if let Some(fault_at) = front.fault.as_ref().map(|(at, _)| *at) {
            if front.pos >= fault_at
                && let Some((_, error)) = front.fault.take()
            {
                return Err(error);
            }
            end = end.min(fault_at);
        }

        let chunk = front.bytes[front.pos..end].to_vec();
        front.pos = end;
        if front.pos >= front.bytes.len() {
            self.outgoing.pop_front();
        }
        Ok(chunk)
    }

    fn read_event(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.camera.state.lock_ignore_poison();
                if state.disconnected {
                    return Err(TransportError::Disconnected);
                }
                if !state.has_event_channel || state.event_channel_failed {
                    return Err(TransportError::Io("interrupt endpoint unavailable".to_string()));
                }
                if let Some(event) = state.events.pop_front() {
                    return Ok(Some(event));
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn has_event_channel(&self) -> bool {
        self.camera.state.lock_ignore_poison().has_event_channel
    }

    fn control_in(
        &mut self,
        request: u8,
        _value: u16,
        _length: u16,
        _timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.check_connected()?;
        match request {
            class_request::GET_DEVICE_STATUS => {
                let mut reply = BytesMut::with_capacity(4);
                reply.put_u16_le(4);
                reply.put_u16_le(ResponseCode::OK.0);
                Ok(reply.to_vec())
            }
            _ => Err(TransportError::Stall),
        }
    }

    fn control_out(&mut self, request: u8, _value: u16, _data: &[u8], _timeout: Duration) -> Result<(), TransportError> {
        self.check_connected()?;
        match request {
            class_request::CANCEL => {
                self.camera.state.lock_ignore_poison().cancel_requests += 1;
                self.outgoing.clear();
                Ok(())
            }
            class_request::DEVICE_RESET => {
                self.camera.state.lock_ignore_poison().session_open = false;
                self.outgoing.clear();
                Ok(())
            }
            _ => Err(TransportError::Stall),
        }
    }

    fn clear_halt(&mut self) -> Result<(), TransportError> {
        self.check_connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_rejects_other_devices() {
        let camera = VirtualCamera::canon();
        let other = camera_descriptor(0x1111, 0x2222, "Other");
        assert!(matches!(camera.factory().open(&other), Err(TransportError::NotFound)));
        assert!(camera.factory().open(camera.descriptor()).is_ok());
    }

    #[test]
    fn test_reads_do_not_cross_containers() {
        let camera = VirtualCamera::baseline();
        let mut transport = camera.factory().open(camera.descriptor()).unwrap();
        let command = Container::command(OperationCode::GET_DEVICE_INFO, 0, &[]).encode();
        transport.write_bulk(&command, Duration::from_secs(1)).unwrap();

        let data = transport.read_bulk(4096, Duration::from_secs(1)).unwrap();
        assert_eq!(Container::decode(&data).unwrap().kind, ContainerKind::Data);
        let response = transport.read_bulk(4096, Duration::from_secs(1)).unwrap();
        assert_eq!(Container::decode(&response).unwrap().response_code(), ResponseCode::OK);
        assert!(matches!(
            transport.read_bulk(4096, Duration::from_secs(1)),
            Err(TransportError::Timeout)
        ));
    }

    #[test]
    fn test_disconnect_fails_every_call() {
        let camera = VirtualCamera::baseline();
        let mut transport = camera.factory().open(camera.descriptor()).unwrap();
        camera.disconnect();
        assert!(matches!(
            transport.read_event(Duration::ZERO),
            Err(TransportError::Disconnected)
        ));
        assert!(matches!(
            camera.factory().open(camera.descriptor()),
            Err(TransportError::NotFound)
        ));
    }
}
