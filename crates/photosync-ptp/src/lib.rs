//! PTP camera tethering engine.
//!
//! Opens a Picture Transfer Protocol session with a USB camera, discovers newly
//! captured photos (by polling the object list or by listening for device
//! events), and streams each one to a local directory while reporting progress.
//!
//! # Architecture
//!
//! - `transport`, `usb`: raw bulk/control/interrupt I/O, no protocol knowledge
//! - `container`, `codes`, `dataset`: PTP container framing and datasets
//! - `connection`: one PTP transaction at a time over a transport
//! - `variant`, `resolver`: vendor capability differences and variant selection
//! - `session`: session state machine
//! - `sync`, `transfer`: discovery strategies and the download pipeline
//! - `events`: caller-owned event channel
//! - `camera`, `worker`: the session handle and its background worker
//!
//! # Example
//!
//! ```ignore
//! let resolver = CapabilityResolver::new();
//! let session = resolver.resolve(descriptor, factory, TetherConfig::default())?;
//! let mut events = session.subscribe();
//! session.clear_status()?;
//! session.set_sync_mode(SyncMode::Polling)?;
//! session.open()?;
//! while let Some(event) = events.recv().await {
//!     // react to TetherEvent::TransferCompleted, ...
//! }
//! ```

// Use log::* macros instead of println!/eprintln! for proper log level control
#![deny(clippy::print_stdout, clippy::print_stderr)]
#![warn(unused_qualifications)]

mod camera;
pub mod codes;
pub mod config;
mod connection;
pub mod container;
pub mod dataset;
pub mod device;
pub mod error;
pub mod events;
mod ignore_poison;
pub mod resolver;
mod session;
pub mod sync;
pub mod transfer;
pub mod transport;
pub mod variant;
mod worker;

#[cfg(feature = "usb")]
pub mod usb;

#[cfg(any(test, feature = "virtual-camera"))]
pub mod testing;


pub use camera::CameraSession;
pub use config::{TetherConfig, load_config};
pub use dataset::{DeviceInfo, ObjectInfo};
pub use device::{DeviceDescriptor, InterfaceDescriptor};
pub use error::{PtpError, TransportError};
pub use events::{EventReceiver, TetherEvent};
pub use resolver::{CapabilityResolver, VendorProfile};
pub use session::SessionState;
pub use sync::SyncMode;
pub use transfer::{TransferOutcome, TransferProgress};
pub use transport::{Transport, TransportFactory};
pub use variant::SessionVariant;

/// Device-assigned identifier of a file-like object (one photo) on the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ObjectHandle(pub u32);

impl std::fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// Identifier of an open PTP session, chosen by the host at `OpenSession`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(transparent)]
pub struct SessionId(pub u32);
