//! Error types for transport and PTP session operations.

use crate::ObjectHandle;
use crate::codes::{OperationCode, ResponseCode};

/// Failure reported by a [`Transport`](crate::Transport) implementation.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "message")]
pub enum TransportError {
    /// The transfer did not complete within its timeout.
    Timeout,
    /// The device went away (unplugged, powered off, or reset by the host).
    Disconnected,
    /// Another process or driver has claimed the interface.
    Busy,
    /// The host refused access (missing udev rule, permission not granted).
    AccessDenied,
    /// No device matched the descriptor.
    NotFound,
    /// The endpoint stalled.
    Stall,
    /// The transfer was cancelled by the host.
    Cancelled,
    /// Other I/O failure.
    Io(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "transfer timed out"),
            Self::Disconnected => write!(f, "device disconnected"),
            Self::Busy => write!(f, "interface is claimed by another process"),
            Self::AccessDenied => write!(f, "access to the device was denied"),
            Self::NotFound => write!(f, "device not found"),
            Self::Stall => write!(f, "endpoint stalled"),
            Self::Cancelled => write!(f, "transfer cancelled"),
            Self::Io(message) => write!(f, "I/O error: {message}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Error taxonomy for the tethering engine.
///
/// Each user-visible situation ("no camera", "permission not granted", "connected but
/// the transfer failed") maps to its own variant so a presentation layer can pick a
/// message without looking at transport internals.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum PtpError {
    /// The descriptor has no still-image or MTP interface.
    UnsupportedDevice { vendor_id: u16, product_id: u16 },
    /// The device could not be found (never attached, or unplugged before opening).
    NoDevice,
    /// The host did not grant access to the device.
    PermissionDenied,
    /// `open()` was called on a session that is already open.
    SessionAlreadyOpen,
    /// A session operation was called while the session is not open.
    SessionNotOpen,
    /// The device reported it is busy (retryable).
    DeviceBusy,
    /// A transport call timed out.
    TransportTimeout,
    /// The device sent something that does not parse as the expected container.
    MalformedResponse { message: String },
    /// The device does not implement the operation.
    OperationUnsupported { operation: u16 },
    /// The object handle is not (or no longer) valid on the device.
    ObjectNotFound { handle: ObjectHandle },
    /// The device answered with a response code not covered above.
    Protocol { operation: u16, response: u16 },
    /// A download failed; `cause` says why.
    TransferFailed { handle: ObjectHandle, cause: Box<PtpError> },
    /// The operation was aborted because the session is closing.
    Cancelled,
    /// Unrecoverable session failure; close and open again.
    Faulted { reason: String },
    /// Transport failure not covered by a more specific variant.
    Transport { source: TransportError },
    /// Local filesystem error while writing a download.
    Io { path: String, message: String },
}

impl PtpError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedResponse {
            message: message.into(),
        }
    }

    pub fn io(path: &std::path::Path, err: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }

    pub fn transfer_failed(handle: ObjectHandle, cause: PtpError) -> Self {
        Self::TransferFailed {
            handle,
            cause: Box::new(cause),
        }
    }

    /// Maps a non-OK response code to an error.
    pub fn from_response(operation: OperationCode, response: ResponseCode, handle: Option<ObjectHandle>) -> Self {
        match response {
            ResponseCode::DEVICE_BUSY => Self::DeviceBusy,
            ResponseCode::OPERATION_NOT_SUPPORTED => Self::OperationUnsupported { operation: operation.0 },
            ResponseCode::SESSION_ALREADY_OPEN => Self::SessionAlreadyOpen,
            ResponseCode::SESSION_NOT_OPEN => Self::SessionNotOpen,
            ResponseCode::TRANSACTION_CANCELLED => Self::Cancelled,
            ResponseCode::INVALID_OBJECT_HANDLE => Self::ObjectNotFound {
                handle: handle.unwrap_or(ObjectHandle(0)),
            },
            _ => Self::Protocol {
                operation: operation.0,
                response: response.0,
            },
        }
    }

    /// Returns true if the operation may succeed if retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransportTimeout | Self::DeviceBusy => true,
            Self::TransferFailed { cause, .. } => cause.is_retryable(),
            _ => false,
        }
    }

    /// Returns true if the error means the physical device is gone.
    pub fn is_device_gone(&self) -> bool {
        match self {
            Self::Transport { source } => *source == TransportError::Disconnected,
            Self::TransferFailed { cause, .. } => cause.is_device_gone(),
            _ => false,
        }
    }

    /// Returns a user-friendly message for this error.
    pub fn user_message(&self) -> String {
        match self {
            Self::UnsupportedDevice { .. } => "This USB device is not a camera that supports PTP.".to_string(),
            Self::NoDevice => "No camera found. Connect it over USB and switch it on.".to_string(),
            Self::PermissionDenied => "Permission to access the camera was not granted.".to_string(),
            Self::SessionAlreadyOpen => "The camera is already connected.".to_string(),
            Self::SessionNotOpen => "The camera is not connected.".to_string(),
            Self::DeviceBusy => "The camera is busy. Wait a moment and try again.".to_string(),
            Self::TransportTimeout => "The camera did not respond in time. Try again.".to_string(),
            Self::MalformedResponse { .. } | Self::Protocol { .. } => {
                "The camera sent an unexpected response. Try reconnecting.".to_string()
            }
            Self::OperationUnsupported { .. } => "The camera does not support this operation.".to_string(),
            Self::ObjectNotFound { .. } => "The photo is no longer on the camera.".to_string(),
            Self::TransferFailed { cause, .. } => {
                format!("Connected, but the transfer failed: {}", cause.user_message())
            }
            Self::Cancelled => "The transfer was cancelled.".to_string(),
            Self::Faulted { .. } => "The connection to the camera was lost. Reconnect it to continue.".to_string(),
            Self::Transport { source } => format!("USB error: {source}."),
            Self::Io { path, message } => format!("Could not write {path}: {message}"),
        }
    }
}

impl std::fmt::Display for PtpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedDevice { vendor_id, product_id } => {
                write!(f, "Unsupported device {vendor_id:04x}:{product_id:04x}")
            }
            Self::NoDevice => write!(f, "No device found"),
            Self::PermissionDenied => write!(f, "Permission to access the device was not granted"),
            Self::SessionAlreadyOpen => write!(f, "Session already open"),
            Self::SessionNotOpen => write!(f, "Session not open"),
            Self::DeviceBusy => write!(f, "Device busy"),
            Self::TransportTimeout => write!(f, "Transport timed out"),
            Self::MalformedResponse { message } => write!(f, "Malformed response: {message}"),
            Self::OperationUnsupported { operation } => {
                write!(f, "Operation {} not supported by device", OperationCode(*operation))
            }
            Self::ObjectNotFound { handle } => write!(f, "Object {handle} not found"),
            Self::Protocol { operation, response } => write!(
                f,
                "{} failed with {}",
                OperationCode(*operation),
                ResponseCode(*response)
            ),
            Self::TransferFailed { handle, cause } => write!(f, "Transfer of {handle} failed: {cause}"),
            Self::Cancelled => write!(f, "Operation cancelled"),
            Self::Faulted { reason } => write!(f, "Session faulted: {reason}"),
            Self::Transport { source } => write!(f, "Transport error: {source}"),
            Self::Io { path, message } => write!(f, "I/O error on {path}: {message}"),
        }
    }
}

impl std::error::Error for PtpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport { source } => Some(source),
            Self::TransferFailed { cause, .. } => Some(cause.as_ref()),
            _ => None,
        }
    }
}

impl From<TransportError> for PtpError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout => Self::TransportTimeout,
            TransportError::Busy => Self::DeviceBusy,
            TransportError::AccessDenied => Self::PermissionDenied,
            TransportError::NotFound => Self::NoDevice,
            TransportError::Cancelled => Self::Cancelled,
            other => Self::Transport { source: other },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_mapping() {
        assert_eq!(PtpError::from(TransportError::Timeout), PtpError::TransportTimeout);
        assert_eq!(PtpError::from(TransportError::Busy), PtpError::DeviceBusy);
        assert_eq!(PtpError::from(TransportError::AccessDenied), PtpError::PermissionDenied);
        assert_eq!(PtpError::from(TransportError::NotFound), PtpError::NoDevice);
        assert_eq!(
            PtpError::from(TransportError::Disconnected),
            PtpError::Transport {
                source: TransportError::Disconnected
            }
        );
    }

    #[test]
    fn test_response_mapping() {
        let op = OperationCode::GET_OBJECT;
        assert_eq!(
            PtpError::from_response(op, ResponseCode::DEVICE_BUSY, None),
            PtpError::DeviceBusy
        );
        assert_eq!(
            PtpError::from_response(op, ResponseCode::INVALID_OBJECT_HANDLE, Some(ObjectHandle(7))),
            PtpError::ObjectNotFound {
                handle: ObjectHandle(7)
            }
        );
        assert_eq!(
            PtpError::from_response(op, ResponseCode::OPERATION_NOT_SUPPORTED, None),
            PtpError::OperationUnsupported { operation: 0x1009 }
        );
        assert_eq!(
            PtpError::from_response(op, ResponseCode::STORE_NOT_AVAILABLE, None),
            PtpError::Protocol {
                operation: 0x1009,
                response: 0x2013
            }
        );
    }

    #[test]
    fn test_is_retryable() {
        assert!(PtpError::TransportTimeout.is_retryable());
        assert!(PtpError::DeviceBusy.is_retryable());
        assert!(PtpError::transfer_failed(ObjectHandle(1), PtpError::TransportTimeout).is_retryable());
        assert!(!PtpError::NoDevice.is_retryable());
        assert!(!PtpError::PermissionDenied.is_retryable());
        assert!(!PtpError::SessionAlreadyOpen.is_retryable());
    }

    #[test]
    fn test_is_device_gone() {
        let gone = PtpError::from(TransportError::Disconnected);
        assert!(gone.is_device_gone());
        assert!(PtpError::transfer_failed(ObjectHandle(1), gone).is_device_gone());
        assert!(!PtpError::TransportTimeout.is_device_gone());
    }

    #[test]
    fn test_user_messages_are_distinct_for_boundary_cases() {
        let no_device = PtpError::NoDevice.user_message();
        let permission = PtpError::PermissionDenied.user_message();
        let transfer = PtpError::transfer_failed(ObjectHandle(3), PtpError::TransportTimeout).user_message();
        assert_ne!(no_device, permission);
        assert_ne!(permission, transfer);
        assert!(transfer.starts_with("Connected, but the transfer failed"));
    }

    #[test]
    fn test_display() {
        let err = PtpError::UnsupportedDevice {
            vendor_id: 0x046d,
            product_id: 0xc52b,
        };
        assert_eq!(err.to_string(), "Unsupported device 046d:c52b");
        let err = PtpError::ObjectNotFound {
            handle: ObjectHandle(0x10),
        };
        assert_eq!(err.to_string(), "Object 0x00000010 not found");
    }

    #[test]
    fn test_serialization() {
        let err = PtpError::transfer_failed(ObjectHandle(5), PtpError::TransportTimeout);
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"type\":\"transferFailed\""), "JSON: {}", json);
        assert!(json.contains("\"handle\":5"), "JSON: {}", json);
        assert!(json.contains("\"type\":\"transportTimeout\""), "JSON: {}", json);

        let err = PtpError::Transport {
            source: TransportError::Io("pipe error".to_string()),
        };
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"kind\":\"io\""), "JSON: {}", json);
        assert!(json.contains("\"message\":\"pipe error\""), "JSON: {}", json);
    }
}
