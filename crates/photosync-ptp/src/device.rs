//! USB device descriptors as seen by the host, before any session is opened.

use serde::{Deserialize, Serialize};

/// USB class code for Still Image Capture devices (PTP).
pub const STILL_IMAGE_CLASS: u8 = 0x06;

/// Vendor-specific class; MTP devices use it with an interface string of "MTP".
pub const VENDOR_SPECIFIC_CLASS: u8 = 0xff;

/// One interface of a device descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceDescriptor {
    pub number: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl InterfaceDescriptor {
    /// Still-image class, or a vendor-class interface that names itself "MTP".
    pub fn is_ptp(&self) -> bool {
        if self.class == STILL_IMAGE_CLASS {
            return true;
        }
        self.class == VENDOR_SPECIFIC_CLASS && self.name.as_deref().is_some_and(|n| n.trim() == "MTP")
    }
}

/// Immutable snapshot of a USB device, supplied by the host USB stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    /// For example, 0x04a9 for Canon.
    pub vendor_id: u16,
    pub product_id: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    /// Only readable once the host has granted access to the device.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    pub interfaces: Vec<InterfaceDescriptor>,
    /// Format: "{bus}-{address}". Stable while the device stays plugged in.
    pub location: String,
}

impl DeviceDescriptor {
    pub fn interface_count(&self) -> usize {
        self.interfaces.len()
    }

    /// Returns a display name for the device.
    ///
    /// Prefers product name, falls back to "Camera (vendor:product)".
    pub fn display_name(&self) -> String {
        if let Some(product) = &self.product {
            return product.clone();
        }
        if let Some(manufacturer) = &self.manufacturer {
            return format!("{} camera", manufacturer);
        }
        format!("Camera ({:04x}:{:04x})", self.vendor_id, self.product_id)
    }

    /// Stable per-device key, used to remember which photos were already synced.
    ///
    /// `"{manufacturer}_{product}_{serial}"`. Without permission the serial cannot be
    /// read, so the last part becomes `"no-permission-{vendor}:{product}"`.
    pub fn unique_name(&self) -> String {
        let serial = match &self.serial_number {
            Some(serial) if !serial.is_empty() => serial.clone(),
            _ => format!("no-permission-{}:{}", self.vendor_id, self.product_id),
        };
        format!(
            "{}_{}_{}",
            self.manufacturer.as_deref().unwrap_or_default(),
            self.product.as_deref().unwrap_or_default(),
            serial
        )
    }

    /// True if the device exposes a PTP-capable interface or is itself still-image class.
    pub fn is_still_image_device(&self) -> bool {
        self.class == STILL_IMAGE_CLASS || self.interfaces.iter().any(InterfaceDescriptor::is_ptp)
    }

    /// The interface a transport should claim. A class-6 device without interface
    /// descriptors falls back to interface 0.
    pub fn ptp_interface(&self) -> Option<u8> {
        if let Some(iface) = self.interfaces.iter().find(|i| i.is_ptp()) {
            return Some(iface.number);
        }
        (self.class == STILL_IMAGE_CLASS).then_some(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(class: u8, interfaces: Vec<InterfaceDescriptor>) -> DeviceDescriptor {
        DeviceDescriptor {
            vendor_id: 0x04a9,
            product_id: 0x32d9,
            class,
            subclass: 0,
            protocol: 0,
            serial_number: Some("0123456789".to_string()),
            manufacturer: Some("Canon Inc.".to_string()),
            product: Some("Canon EOS R6".to_string()),
            interfaces,
            location: "1-4".to_string(),
        }
    }

    fn iface(number: u8, class: u8, name: Option<&str>) -> InterfaceDescriptor {
        InterfaceDescriptor {
            number,
            class,
            subclass: 1,
            protocol: 1,
            name: name.map(str::to_string),
        }
    }

    #[test]
    fn test_display_name_fallbacks() {
        let mut device = descriptor(0, vec![]);
        assert_eq!(device.display_name(), "Canon EOS R6");
        device.product = None;
        assert_eq!(device.display_name(), "Canon Inc. camera");
        device.manufacturer = None;
        assert_eq!(device.display_name(), "Camera (04a9:32d9)");
    }

    #[test]
    fn test_unique_name_with_serial() {
        let device = descriptor(0, vec![]);
        assert_eq!(device.unique_name(), "Canon Inc._Canon EOS R6_0123456789");
    }

    #[test]
    fn test_unique_name_without_permission() {
        let mut device = descriptor(0, vec![]);
        device.serial_number = None;
        assert_eq!(device.unique_name(), "Canon Inc._Canon EOS R6_no-permission-1193:13017");
    }

    #[test]
    fn test_still_image_interface_detected() {
        let device = descriptor(0, vec![iface(0, STILL_IMAGE_CLASS, None)]);
        assert!(device.is_still_image_device());
        assert_eq!(device.ptp_interface(), Some(0));
    }

    #[test]
    fn test_mtp_vendor_interface_detected() {
        let device = descriptor(
            0,
            vec![
                iface(0, 0x08, None),
                iface(1, VENDOR_SPECIFIC_CLASS, Some("MTP")),
            ],
        );
        assert!(device.is_still_image_device());
        assert_eq!(device.ptp_interface(), Some(1));
    }

    #[test]
    fn test_mass_storage_only_is_not_a_camera() {
        let device = descriptor(0, vec![iface(0, 0x08, None), iface(1, VENDOR_SPECIFIC_CLASS, Some("ADB"))]);
        assert!(!device.is_still_image_device());
        assert_eq!(device.ptp_interface(), None);
    }

    #[test]
    fn test_class_six_device_without_interfaces() {
        let device = descriptor(STILL_IMAGE_CLASS, vec![]);
        assert!(device.is_still_image_device());
        assert_eq!(device.ptp_interface(), Some(0));
        assert_eq!(device.interface_count(), 0);
    }

    #[test]
    fn test_serialization() {
        let mut device = descriptor(0, vec![iface(0, STILL_IMAGE_CLASS, None)]);
        device.serial_number = None;
        let json = serde_json::to_string(&device).unwrap();
        assert!(json.contains("\"vendorId\":1193"));
        assert!(json.contains("\"location\":\"1-4\""));
        assert!(!json.contains("serialNumber"));
    }
}
