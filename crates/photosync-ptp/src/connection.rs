//! One PTP transaction at a time over a [`Transport`].
//!
//! A transaction is command → optional data phase → response. Data phases are
//! streamed: each bulk read is handed to a [`DataSink`] as it arrives, so a 100 MB RAW
//! file never sits in memory. If a data phase is abandoned halfway (timeout, sink
//! error, cancellation), the connection cancels the transaction on the device and
//! drains the pipe so the next transaction starts clean.

use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::ObjectHandle;
use crate::codes::{EventCode, OperationCode, ResponseCode, class_request};
use crate::container::{Container, ContainerKind, HEADER_LEN, Header};
use crate::dataset::{self, DeviceInfo, ObjectInfo};
use crate::error::{PtpError, TransportError};
use crate::transfer::ObjectSource;
use crate::transport::Transport;

/// Poll interval while waiting for the device to finish cancelling a transaction.
const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Short timeout for reads that only discard stale data.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(50);
const MAX_DRAIN_READS: usize = 64;

/// Zero-length packets tolerated before a response container.
const MAX_EMPTY_READS: usize = 2;

/// Smallest first read that still fits a header plus a full parameter block.
const MIN_READ_LEN: usize = 64;

/// Receives a data phase as it streams in.
pub(crate) trait DataSink {
    /// Called once when the data header arrives. `total` is `None` for data phases of
    /// unknown length (4 GiB and above).
    fn begin(&mut self, total: Option<u64>) -> Result<(), PtpError>;

    fn write(&mut self, chunk: &[u8]) -> Result<(), PtpError>;
}

/// Collects small datasets in memory.
impl DataSink for Vec<u8> {
    fn begin(&mut self, total: Option<u64>) -> Result<(), PtpError> {
        if let Some(total) = total
            && total <= 1024 * 1024
        {
            self.reserve(total as usize);
        }
        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> Result<(), PtpError> {
        self.extend_from_slice(chunk);
        Ok(())
    }
}

enum DataPhase {
    Received,
    /// The device answered with a response instead of data.
    Skipped(Container),
}

pub(crate) struct PtpConnection {
    transport: Box<dyn Transport>,
    /// For log lines, e.g. "Canon EOS R6 (1-4)".
    label: String,
    timeout: Duration,
    chunk_size: usize,
    session_open: bool,
    next_tid: u32,
}

impl PtpConnection {
    pub fn new(transport: Box<dyn Transport>, label: String, timeout: Duration, chunk_size: usize) -> Self {
        Self {
            transport,
            label,
            timeout,
            chunk_size,
            session_open: false,
            next_tid: 0,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn has_event_channel(&self) -> bool {
        self.transport.has_event_channel()
    }

    /// Session-less operations use transaction ID 0; inside a session IDs start at 1
    /// after OpenSession and skip 0 and 0xFFFFFFFF on wrap.
    fn next_transaction_id(&mut self) -> u32 {
        if !self.session_open {
            return 0;
        }
        let tid = self.next_tid;
        self.next_tid = match self.next_tid.wrapping_add(1) {
            0 | u32::MAX => 1,
            next => next,
        };
        tid
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Runs a transaction without a data phase and returns the response parameters.
    pub fn transact(&mut self, operation: OperationCode, params: &[u32]) -> Result<Vec<u32>, PtpError> {
        let tid = self.next_transaction_id();
        self.send_command(operation, tid, params)?;
        self.read_response(operation, tid, None)
    }

    /// Runs a transaction with a device-to-host data phase streamed into `sink`.
    pub fn transact_data_in(
        &mut self,
        operation: OperationCode,
        params: &[u32],
        handle: Option<ObjectHandle>,
        sink: &mut dyn DataSink,
    ) -> Result<Vec<u32>, PtpError> {
        let tid = self.next_transaction_id();
        self.send_command(operation, tid, params)?;

        match self.receive_data(operation, tid, sink) {
            Ok(DataPhase::Received) => self.read_response(operation, tid, handle),
            Ok(DataPhase::Skipped(response)) => {
                let params = check_response(operation, tid, &response, handle)?;
                sink.begin(Some(0))?;
                Ok(params)
            }
            Err(e) => Err(self.recover_from_aborted_phase(tid, e)),
        }
    }

    fn send_command(&mut self, operation: OperationCode, tid: u32, params: &[u32]) -> Result<(), PtpError> {
        debug!("{}: -> {} tid={} params={:x?}", self.label, operation, tid, params);
        let bytes = Container::command(operation, tid, params).encode();
        self.transport.write_bulk(&bytes, self.timeout)?;
        Ok(())
    }

    fn read_response(
        &mut self,
        operation: OperationCode,
        tid: u32,
        handle: Option<ObjectHandle>,
    ) -> Result<Vec<u32>, PtpError> {
        let max_len = self.transport.max_packet_size().max(MIN_READ_LEN);
        let mut empty_reads = 0;
        let buf = loop {
            let buf = self.transport.read_bulk(max_len, self.timeout)?;
            if !buf.is_empty() {
                break buf;
            }
            empty_reads += 1;
            if empty_reads > MAX_EMPTY_READS {
                return Err(PtpError::malformed(format!("no response to {operation}")));
            }
        };
        let response = Container::decode(&buf)?;
        let params = check_response(operation, tid, &response, handle)?;
        debug!("{}: <- {} {}", self.label, operation, response.response_code());
        Ok(params)
    }

    fn receive_data(
        &mut self,
        operation: OperationCode,
        tid: u32,
        sink: &mut dyn DataSink,
    ) -> Result<DataPhase, PtpError> {
        let read_len = self.chunk_size.max(MIN_READ_LEN);
        let first = self.transport.read_bulk(read_len, self.timeout)?;
        let header = Header::parse(&first)?;

        if header.kind == ContainerKind::Response {
            return Ok(DataPhase::Skipped(Container::decode(&first)?));
        }
        if header.kind != ContainerKind::Data || header.transaction_id != tid || header.code != operation.0 {
            return Err(PtpError::malformed(format!(
                "expected data for {} tid={}, got {:?} code=0x{:04x} tid={}",
                operation, tid, header.kind, header.code, header.transaction_id
            )));
        }

        let expected = header.payload_len();
        sink.begin(expected.map(|len| len as u64))?;

        let mut received = first.len() - HEADER_LEN;
        if let Some(expected) = expected
            && received > expected
        {
            return Err(PtpError::malformed(format!(
                "data phase overran its header: {received} > {expected} bytes"
            )));
        }
        if received > 0 {
            sink.write(&first[HEADER_LEN..])?;
        }

        let mut last_len = first.len();
        loop {
            let done = match expected {
                Some(expected) => received >= expected,
                // Unknown length ends with a short transfer (possibly zero-length).
                None => last_len < read_len,
            };
            if done {
                break;
            }

            let chunk = self.transport.read_bulk(read_len, self.timeout)?;
            last_len = chunk.len();
            if chunk.is_empty() && expected.is_some() {
                return Err(PtpError::malformed(format!(
                    "data phase ended early at {received} of {} bytes",
                    expected.unwrap_or_default()
                )));
            }
            received += chunk.len();
            if let Some(expected) = expected
                && received > expected
            {
                return Err(PtpError::malformed(format!(
                    "data phase overran its header: {received} > {expected} bytes"
                )));
            }
            if !chunk.is_empty() {
                sink.write(&chunk)?;
            }
        }

        debug!("{}: <- {} data, {} bytes", self.label, operation, received);
        Ok(DataPhase::Received)
    }

    /// Puts the pipe back into a usable state after a data phase was abandoned and
    /// returns the original error.
    fn recover_from_aborted_phase(&mut self, tid: u32, err: PtpError) -> PtpError {
        if err.is_device_gone() {
            return err;
        }
        info!("{}: aborting transaction {} after: {}", self.label, tid, err);
        if let Err(e) = self.abort_transaction(tid) {
            warn!("{}: couldn't recover after aborted transaction {}: {}", self.label, tid, e);
        }
        err
    }

    /// Cancels `tid` on the device, waits for it to settle, clears halts, and discards
    /// whatever is left in the bulk-in pipe.
    pub fn abort_transaction(&mut self, tid: u32) -> Result<(), PtpError> {
        let mut request = [0u8; 6];
        request[..2].copy_from_slice(&EventCode::CANCEL_TRANSACTION.0.to_le_bytes());
        request[2..].copy_from_slice(&tid.to_le_bytes());
        self.transport
            .control_out(class_request::CANCEL, 0, &request, self.timeout)?;

        let deadline = Instant::now() + self.timeout;
        loop {
            let status = self.device_status()?;
            if status == ResponseCode::OK {
                break;
            }
            if Instant::now() >= deadline {
                warn!("{}: device still reports {} after cancel", self.label, status);
                return Err(PtpError::DeviceBusy);
            }
            thread::sleep(STATUS_POLL_INTERVAL);
        }

        self.transport.clear_halt()?;
        self.drain_bulk_in();
        Ok(())
    }

    /// Reads the still-image class device status. Returns the status code.
    fn device_status(&mut self) -> Result<ResponseCode, PtpError> {
        let reply = self
            .transport
            .control_in(class_request::GET_DEVICE_STATUS, 0, 20, self.timeout)?;
        if reply.len() < 4 {
            return Err(PtpError::malformed(format!(
                "device status reply of {} bytes",
                reply.len()
            )));
        }
        Ok(ResponseCode(u16::from_le_bytes([reply[2], reply[3]])))
    }

    fn drain_bulk_in(&mut self) {
        let read_len = self.chunk_size.max(MIN_READ_LEN);
        let mut drained = 0usize;
        for _ in 0..MAX_DRAIN_READS {
            match self.transport.read_bulk(read_len, DRAIN_TIMEOUT) {
                Ok(buf) if !buf.is_empty() => drained += buf.len(),
                _ => break,
            }
        }
        if drained > 0 {
            debug!("{}: drained {} stale bytes", self.label, drained);
        }
    }

    /// Device status / clear-stall request. Recovers a device that a previous run left
    /// mid-transaction.
    pub fn clear_status(&mut self) -> Result<(), PtpError> {
        match self.device_status() {
            Ok(ResponseCode::OK) => {
                debug!("{}: device status OK", self.label);
                Ok(())
            }
            Ok(status) => {
                info!("{}: device status {}, clearing halts", self.label, status);
                self.transport.clear_halt()?;
                self.drain_bulk_in();
                Ok(())
            }
            Err(PtpError::Transport {
                source: TransportError::Stall,
            }) => {
                info!("{}: status request stalled, clearing halts", self.label);
                self.transport.clear_halt()?;
                self.drain_bulk_in();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // ========================================================================
    // Operations
    // ========================================================================

    pub fn get_device_info(&mut self) -> Result<DeviceInfo, PtpError> {
        let mut buf = Vec::new();
        self.transact_data_in(OperationCode::GET_DEVICE_INFO, &[], None, &mut buf)?;
        DeviceInfo::parse(&buf)
    }

    pub fn open_session(&mut self, session_id: u32) -> Result<(), PtpError> {
        self.session_open = false;
        self.send_command(OperationCode::OPEN_SESSION, 0, &[session_id])?;
        self.read_response(OperationCode::OPEN_SESSION, 0, None)?;
        self.session_open = true;
        self.next_tid = 1;
        Ok(())
    }

    /// Treats the device's leftover session as ours so it can be closed.
    pub fn open_session_assumed(&mut self) {
        self.session_open = true;
        self.next_tid = 1;
    }

    /// Closes the session. The connection considers itself session-less afterwards even
    /// if the device errors.
    pub fn close_session(&mut self) -> Result<(), PtpError> {
        let result = self.transact(OperationCode::CLOSE_SESSION, &[]);
        self.session_open = false;
        self.next_tid = 0;
        result.map(|_| ())
    }

    /// All object handles on all storages, every format, every folder.
    pub fn object_handles(&mut self) -> Result<Vec<u32>, PtpError> {
        let mut buf = Vec::new();
        self.transact_data_in(OperationCode::GET_OBJECT_HANDLES, &[u32::MAX, 0, 0], None, &mut buf)?;
        dataset::parse_handles(&buf)
    }

    /// Waits up to `wait` for a device event. `Ok(None)` means nothing arrived.
    pub fn read_event(&mut self, wait: Duration) -> Result<Option<Container>, PtpError> {
        match self.transport.read_event(wait)? {
            Some(buf) => {
                let event = Container::decode(&buf)?;
                debug!("{}: <- event {} {:x?}", self.label, event.event_code(), event.params());
                Ok(Some(event))
            }
            None => Ok(None),
        }
    }
}

impl ObjectSource for PtpConnection {
    fn object_info(&mut self, handle: ObjectHandle) -> Result<ObjectInfo, PtpError> {
        let mut buf = Vec::new();
        self.transact_data_in(OperationCode::GET_OBJECT_INFO, &[handle.0], Some(handle), &mut buf)?;
        ObjectInfo::parse(&buf)
    }

    fn read_object(&mut self, handle: ObjectHandle, sink: &mut dyn DataSink) -> Result<(), PtpError> {
        self.transact_data_in(OperationCode::GET_OBJECT, &[handle.0], Some(handle), sink)?;
        Ok(())
    }
}

fn check_response(
    operation: OperationCode,
    tid: u32,
    response: &Container,
    handle: Option<ObjectHandle>,
) -> Result<Vec<u32>, PtpError> {
    if response.kind != ContainerKind::Response {
        return Err(PtpError::malformed(format!(
            "expected response to {}, got {:?}",
            operation, response.kind
        )));
    }
    if response.transaction_id != tid {
        return Err(PtpError::malformed(format!(
            "response to {} has tid {}, expected {}",
            operation, response.transaction_id, tid
        )));
    }
    let code = response.response_code();
    if code != ResponseCode::OK {
        return Err(PtpError::from_response(operation, code, handle));
    }
    response.params()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{UNKNOWN_LENGTH, encode_header};
    use crate::testing::{VirtualCamera, photo_bytes};
    use bytes::BytesMut;
    use std::collections::VecDeque;

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn connect(camera: &VirtualCamera, chunk_size: usize) -> PtpConnection {
        let transport = camera.factory().open(camera.descriptor()).unwrap();
        PtpConnection::new(transport, "test".to_string(), TIMEOUT, chunk_size)
    }

    /// Replays canned bulk-in transfers; records what was written.
    struct ScriptedTransport {
        reads: VecDeque<Vec<u8>>,
        written: Vec<Vec<u8>>,
    }

    impl Transport for ScriptedTransport {
        fn write_bulk(&mut self, data: &[u8], _timeout: Duration) -> Result<usize, TransportError> {
            self.written.push(data.to_vec());
            Ok(data.len())
        }

        fn read_bulk(&mut self, _max_len: usize, _timeout: Duration) -> Result<Vec<u8>, TransportError> {
            self.reads.pop_front().ok_or(TransportError::Timeout)
        }

        fn read_event(&mut self, _timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
            Ok(None)
        }

        fn has_event_channel(&self) -> bool {
            false
        }

        fn control_in(&mut self, _: u8, _: u16, _: u16, _: Duration) -> Result<Vec<u8>, TransportError> {
            Ok(vec![4, 0, 0x01, 0x20])
        }

        fn control_out(&mut self, _: u8, _: u16, _: &[u8], _: Duration) -> Result<(), TransportError> {
            Ok(())
        }

        fn clear_halt(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn scripted(reads: Vec<Vec<u8>>) -> PtpConnection {
        let transport = ScriptedTransport {
            reads: reads.into(),
            written: Vec::new(),
        };
        PtpConnection::new(Box::new(transport), "scripted".to_string(), TIMEOUT, 64)
    }

    #[test]
    fn test_open_session_and_list_handles() {
        let camera = VirtualCamera::canon();
        camera.add_photo(0x10, "IMG_0001.JPG", 10);
        camera.add_photo(0x11, "IMG_0002.JPG", 10);
        let mut conn = connect(&camera, 512);

        let info = conn.get_device_info().unwrap();
        assert_eq!(info.model, "Canon EOS R6");
        assert!(info.supports_operation(OperationCode::GET_OBJECT));

        conn.open_session(1).unwrap();
        assert!(camera.is_session_open());
        assert_eq!(conn.object_handles().unwrap(), vec![0x10, 0x11]);

        conn.close_session().unwrap();
        assert!(!camera.is_session_open());
    }

    #[test]
    fn test_queries_before_open_session_fail() {
        let camera = VirtualCamera::baseline();
        let mut conn = connect(&camera, 512);
        assert_eq!(conn.object_handles(), Err(PtpError::SessionNotOpen));
    }

    #[test]
    fn test_unknown_handle_maps_to_object_not_found() {
        let camera = VirtualCamera::baseline();
        let mut conn = connect(&camera, 512);
        conn.open_session(1).unwrap();
        assert_eq!(
            conn.object_info(ObjectHandle(0x99)),
            Err(PtpError::ObjectNotFound {
                handle: ObjectHandle(0x99)
            })
        );
    }

    #[test]
    fn test_object_streams_in_chunks() {
        let camera = VirtualCamera::baseline();
        camera.add_photo(1, "A.JPG", 1000);
        let mut conn = connect(&camera, 100);
        conn.open_session(1).unwrap();

        struct Recorder {
            total: Option<Option<u64>>,
            chunks: Vec<usize>,
            bytes: Vec<u8>,
        }
        impl DataSink for Recorder {
            fn begin(&mut self, total: Option<u64>) -> Result<(), PtpError> {
                self.total = Some(total);
                Ok(())
            }
            fn write(&mut self, chunk: &[u8]) -> Result<(), PtpError> {
                self.chunks.push(chunk.len());
                self.bytes.extend_from_slice(chunk);
                Ok(())
            }
        }

        let mut recorder = Recorder {
            total: None,
            chunks: Vec::new(),
            bytes: Vec::new(),
        };
        conn.read_object(ObjectHandle(1), &mut recorder).unwrap();
        assert_eq!(recorder.total, Some(Some(1000)));
        assert_eq!(recorder.bytes, photo_bytes(1000));
        assert!(recorder.chunks.iter().all(|len| *len <= 100));
    }

    #[test]
    fn test_timeout_mid_data_recovers_connection() {
        let camera = VirtualCamera::baseline();
        camera.add_photo(1, "A.JPG", 1000);
        camera.add_photo(2, "B.JPG", 300);
        camera.fail_transfer_after(400, TransportError::Timeout);
        let mut conn = connect(&camera, 100);
        conn.open_session(1).unwrap();

        let mut buf = Vec::new();
        assert_eq!(
            conn.read_object(ObjectHandle(1), &mut buf),
            Err(PtpError::TransportTimeout)
        );
        assert_eq!(buf.len(), 400);
        assert_eq!(camera.cancel_requests(), 1);

        let mut buf = Vec::new();
        conn.read_object(ObjectHandle(2), &mut buf).unwrap();
        assert_eq!(buf, photo_bytes(300));
    }

    #[test]
    fn test_disconnect_mid_data_skips_recovery() {
        let camera = VirtualCamera::baseline();
        camera.add_photo(1, "A.JPG", 1000);
        camera.fail_transfer_after(200, TransportError::Disconnected);
        let mut conn = connect(&camera, 100);
        conn.open_session(1).unwrap();

        let err = conn.read_object(ObjectHandle(1), &mut Vec::new()).unwrap_err();
        assert!(err.is_device_gone());
        assert_eq!(camera.cancel_requests(), 0);
    }

    #[test]
    fn test_transaction_ids_increment() {
        let response = |tid| Container::response(ResponseCode::OK, tid, &[]).encode().to_vec();
        let mut conn = scripted(vec![response(0), response(1), response(2)]);
        conn.open_session(1).unwrap();
        conn.transact(OperationCode(0x9001), &[]).unwrap();
        conn.transact(OperationCode(0x9002), &[]).unwrap();
    }

    #[test]
    fn test_response_with_wrong_tid_is_malformed() {
        let mut conn = scripted(vec![Container::response(ResponseCode::OK, 7, &[]).encode().to_vec()]);
        let err = conn.transact(OperationCode::GET_STORAGE_IDS, &[]).unwrap_err();
        assert!(matches!(err, PtpError::MalformedResponse { .. }), "got {err:?}");
    }

    #[test]
    fn test_device_skipping_data_phase_reports_response() {
        let mut conn = scripted(vec![
            Container::response(ResponseCode::STORE_NOT_AVAILABLE, 0, &[])
                .encode()
                .to_vec(),
        ]);
        let err = conn.get_device_info().unwrap_err();
        assert_eq!(
            err,
            PtpError::Protocol {
                operation: 0x1001,
                response: 0x2013
            }
        );
    }

    #[test]
    fn test_unknown_length_reads_until_short_packet() {
        let mut first = BytesMut::new();
        encode_header(
            &Header {
                length: UNKNOWN_LENGTH,
                kind: ContainerKind::Data,
                code: OperationCode::GET_OBJECT.0,
                transaction_id: 0,
            },
            &mut first,
        );
        first.extend_from_slice(&[1u8; 52]);
        let mut conn = scripted(vec![
            first.to_vec(),
            vec![2u8; 64],
            vec![3u8; 10],
            Container::response(ResponseCode::OK, 0, &[]).encode().to_vec(),
        ]);

        let mut buf = Vec::new();
        conn.transact_data_in(OperationCode::GET_OBJECT, &[1], None, &mut buf)
            .unwrap();
        assert_eq!(buf.len(), 52 + 64 + 10);
    }

    #[test]
    fn test_zero_length_packet_before_response_is_tolerated() {
        let mut data = Container::data(OperationCode::GET_OBJECT, 0, vec![5u8; 52])
            .encode()
            .to_vec();
        data.truncate(64);
        let mut conn = scripted(vec![
            data,
            Vec::new(),
            Container::response(ResponseCode::OK, 0, &[]).encode().to_vec(),
        ]);
        let mut buf = Vec::new();
        conn.transact_data_in(OperationCode::GET_OBJECT, &[1], None, &mut buf)
            .unwrap();
        assert_eq!(buf, vec![5u8; 52]);
    }

    #[test]
    fn test_clear_status_on_healthy_device() {
        let camera = VirtualCamera::baseline();
        let mut conn = connect(&camera, 512);
        conn.clear_status().unwrap();
    }
}
