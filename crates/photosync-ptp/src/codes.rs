//! PTP operation, response, event, and format codes.
//!
//! Codes are newtypes over `u16` rather than enums: vendors extend every code space,
//! and an unknown code must survive a round-trip through the codec.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationCode(pub u16);

impl OperationCode {
    pub const GET_DEVICE_INFO: Self = Self(0x1001);
    pub const OPEN_SESSION: Self = Self(0x1002);
    pub const CLOSE_SESSION: Self = Self(0x1003);
    pub const GET_STORAGE_IDS: Self = Self(0x1004);
    pub const GET_NUM_OBJECTS: Self = Self(0x1006);
    pub const GET_OBJECT_HANDLES: Self = Self(0x1007);
    pub const GET_OBJECT_INFO: Self = Self(0x1008);
    pub const GET_OBJECT: Self = Self(0x1009);
    pub const GET_THUMB: Self = Self(0x100A);

    pub fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::GET_DEVICE_INFO => "GetDeviceInfo",
            Self::OPEN_SESSION => "OpenSession",
            Self::CLOSE_SESSION => "CloseSession",
            Self::GET_STORAGE_IDS => "GetStorageIDs",
            Self::GET_NUM_OBJECTS => "GetNumObjects",
            Self::GET_OBJECT_HANDLES => "GetObjectHandles",
            Self::GET_OBJECT_INFO => "GetObjectInfo",
            Self::GET_OBJECT => "GetObject",
            Self::GET_THUMB => "GetThumb",
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResponseCode(pub u16);

impl ResponseCode {
    pub const OK: Self = Self(0x2001);
    pub const GENERAL_ERROR: Self = Self(0x2002);
    pub const SESSION_NOT_OPEN: Self = Self(0x2003);
    pub const INVALID_TRANSACTION_ID: Self = Self(0x2004);
    pub const OPERATION_NOT_SUPPORTED: Self = Self(0x2005);
    pub const PARAMETER_NOT_SUPPORTED: Self = Self(0x2006);
    pub const INCOMPLETE_TRANSFER: Self = Self(0x2007);
    pub const INVALID_STORAGE_ID: Self = Self(0x2008);
    pub const INVALID_OBJECT_HANDLE: Self = Self(0x2009);
    pub const STORE_NOT_AVAILABLE: Self = Self(0x2013);
    pub const DEVICE_BUSY: Self = Self(0x2019);
    pub const SESSION_ALREADY_OPEN: Self = Self(0x201E);
    pub const TRANSACTION_CANCELLED: Self = Self(0x201F);

    pub fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::OK => "OK",
            Self::GENERAL_ERROR => "GeneralError",
            Self::SESSION_NOT_OPEN => "SessionNotOpen",
            Self::INVALID_TRANSACTION_ID => "InvalidTransactionID",
            Self::OPERATION_NOT_SUPPORTED => "OperationNotSupported",
            Self::PARAMETER_NOT_SUPPORTED => "ParameterNotSupported",
            Self::INCOMPLETE_TRANSFER => "IncompleteTransfer",
            Self::INVALID_STORAGE_ID => "InvalidStorageID",
            Self::INVALID_OBJECT_HANDLE => "InvalidObjectHandle",
            Self::STORE_NOT_AVAILABLE => "StoreNotAvailable",
            Self::DEVICE_BUSY => "DeviceBusy",
            Self::SESSION_ALREADY_OPEN => "SessionAlreadyOpen",
            Self::TRANSACTION_CANCELLED => "TransactionCancelled",
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventCode(pub u16);

impl EventCode {
    pub const CANCEL_TRANSACTION: Self = Self(0x4001);
    pub const OBJECT_ADDED: Self = Self(0x4002);
    pub const OBJECT_REMOVED: Self = Self(0x4003);
    pub const STORE_ADDED: Self = Self(0x4004);
    pub const STORE_REMOVED: Self = Self(0x4005);
    pub const DEVICE_PROP_CHANGED: Self = Self(0x4006);
    pub const OBJECT_INFO_CHANGED: Self = Self(0x4007);
    pub const DEVICE_INFO_CHANGED: Self = Self(0x4008);
    pub const REQUEST_OBJECT_TRANSFER: Self = Self(0x4009);
    pub const STORE_FULL: Self = Self(0x400A);
    pub const DEVICE_RESET: Self = Self(0x400B);
    pub const CAPTURE_COMPLETE: Self = Self(0x400D);
    pub const NIKON_OBJECT_ADDED_IN_SDRAM: Self = Self(0xC101);
    pub const SONY_OBJECT_ADDED: Self = Self(0xC201);

    pub fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::CANCEL_TRANSACTION => "CancelTransaction",
            Self::OBJECT_ADDED => "ObjectAdded",
            Self::OBJECT_REMOVED => "ObjectRemoved",
            Self::STORE_ADDED => "StoreAdded",
            Self::STORE_REMOVED => "StoreRemoved",
            Self::DEVICE_PROP_CHANGED => "DevicePropChanged",
            Self::OBJECT_INFO_CHANGED => "ObjectInfoChanged",
            Self::DEVICE_INFO_CHANGED => "DeviceInfoChanged",
            Self::REQUEST_OBJECT_TRANSFER => "RequestObjectTransfer",
            Self::STORE_FULL => "StoreFull",
            Self::DEVICE_RESET => "DeviceReset",
            Self::CAPTURE_COMPLETE => "CaptureComplete",
            Self::NIKON_OBJECT_ADDED_IN_SDRAM => "NikonObjectAddedInSdram",
            Self::SONY_OBJECT_ADDED => "SonyObjectAdded",
            _ => return None,
        })
    }
}

/// Object format codes that matter to the transfer pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectFormat(pub u16);

impl ObjectFormat {
    pub const UNDEFINED: Self = Self(0x3000);
    /// Folder-like object; has no data phase worth downloading.
    pub const ASSOCIATION: Self = Self(0x3001);
    pub const EXIF_JPEG: Self = Self(0x3801);
}

/// Still Image class-specific control requests (USB Still Image Capture Device class definition).
pub mod class_request {
    pub const CANCEL: u8 = 0x64;
    pub const GET_EXTENDED_EVENT_DATA: u8 = 0x65;
    pub const DEVICE_RESET: u8 = 0x66;
    pub const GET_DEVICE_STATUS: u8 = 0x67;
}

macro_rules! impl_code_display {
    ($($ty:ty),*) => {$(
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.name() {
                    Some(name) => write!(f, "{name}"),
                    None => write!(f, "0x{:04x}", self.0),
                }
            }
        }
    )*};
}

impl_code_display!(OperationCode, ResponseCode, EventCode);
