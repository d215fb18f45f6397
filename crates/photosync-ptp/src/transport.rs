//! Raw USB I/O abstraction.
//!
//! A transport moves bytes: bulk out, bulk in, interrupt (event) in, and class
//! control requests. It knows nothing about containers or transactions; that is the
//! connection's job. The real implementation lives in [`crate::usb`], the virtual one
//! in `testing`.

use std::time::Duration;

use crate::device::DeviceDescriptor;
use crate::error::TransportError;

/// An opened, claimed PTP interface.
///
/// Calls are synchronous and bounded by the given timeout. Implementations are used
/// from one thread at a time (the session serializes access), but must be `Send`
/// because the session worker owns the transport while it runs.
pub trait Transport: Send {
    /// Writes all of `data` to the bulk-out endpoint. Returns the number of bytes written.
    fn write_bulk(&mut self, data: &[u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Reads one bulk-in transfer of at most `max_len` bytes.
    ///
    /// A transfer shorter than `max_packet_size()` (or a multiple of it shorter than
    /// `max_len`) ends a data phase. A timeout is `Err(TransportError::Timeout)`.
    fn read_bulk(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Waits up to `timeout` for one event container on the interrupt endpoint.
    /// `Ok(None)` means nothing arrived in time.
    fn read_event(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError>;

    /// Whether the interface has an interrupt-in endpoint for device events.
    fn has_event_channel(&self) -> bool;

    /// Class-specific control transfer, device to host, addressed to the interface.
    fn control_in(
        &mut self,
        request: u8,
        value: u16,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Class-specific control transfer, host to device, addressed to the interface.
    fn control_out(&mut self, request: u8, value: u16, data: &[u8], timeout: Duration) -> Result<(), TransportError>;

    /// Clears a halt condition on both bulk endpoints.
    fn clear_halt(&mut self) -> Result<(), TransportError>;

    fn max_packet_size(&self) -> usize {
        512
    }
}

/// Opens transports for devices. The resolver hands one to every session so the
/// session can open (and reopen) the device without knowing the USB backend.
pub trait TransportFactory: Send + Sync {
    fn open(&self, device: &DeviceDescriptor) -> Result<Box<dyn Transport>, TransportError>;
}
