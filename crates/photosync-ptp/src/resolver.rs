//! Picks the session variant for a device and builds its session.

use std::sync::Arc;

use log::{debug, info};
use serde::Serialize;

use crate::camera::CameraSession;
use crate::config::TetherConfig;
use crate::device::DeviceDescriptor;
use crate::error::PtpError;
use crate::transport::TransportFactory;
use crate::variant::SessionVariant;

/// Registry entry. A profile without a product ID covers the whole vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VendorProfile {
    pub vendor_id: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_id: Option<u16>,
    pub variant: SessionVariant,
}

impl VendorProfile {
    pub const fn vendor(vendor_id: u16, variant: SessionVariant) -> Self {
        Self {
            vendor_id,
            product_id: None,
            variant,
        }
    }

    pub const fn product(vendor_id: u16, product_id: u16, variant: SessionVariant) -> Self {
        Self {
            vendor_id,
            product_id: Some(product_id),
            variant,
        }
    }

    fn matches(&self, device: &DeviceDescriptor) -> bool {
        self.vendor_id == device.vendor_id && self.product_id.is_none_or(|p| p == device.product_id)
    }
}

const BUILTIN_PROFILES: [VendorProfile; 3] = [
    VendorProfile::vendor(0x04a9, SessionVariant::Canon),
    VendorProfile::vendor(0x04b0, SessionVariant::Nikon),
    VendorProfile::vendor(0x054c, SessionVariant::Sony),
];

/// Maps device descriptors to session variants. Resolving does no I/O.
#[derive(Debug, Clone)]
pub struct CapabilityResolver {
    profiles: Vec<VendorProfile>,
}

impl Default for CapabilityResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityResolver {
    /// Resolver with the built-in Canon, Nikon, and Sony profiles.
    pub fn new() -> Self {
        Self {
            profiles: BUILTIN_PROFILES.to_vec(),
        }
    }

    /// Adds a profile. Product-specific profiles win over vendor-wide ones; among
    /// equally specific profiles the one added last wins.
    pub fn with_profile(mut self, profile: VendorProfile) -> Self {
        self.profiles.push(profile);
        self
    }

    pub fn profiles(&self) -> &[VendorProfile] {
        &self.profiles
    }

    /// The variant for `device`, falling back to Baseline. Does not check that the
    /// device speaks PTP.
    pub fn variant_for(&self, device: &DeviceDescriptor) -> SessionVariant {
        let matching = || self.profiles.iter().rev().filter(|p| p.matches(device));
        matching()
            .find(|p| p.product_id.is_some())
            .or_else(|| matching().next())
            .map(|p| p.variant)
            .unwrap_or(SessionVariant::Baseline)
    }

    /// Builds a closed session for `device`. No transport is opened until
    /// [`CameraSession::open`] or [`CameraSession::clear_status`].
    pub fn resolve(
        &self,
        device: DeviceDescriptor,
        factory: Arc<dyn TransportFactory>,
        config: TetherConfig,
    ) -> Result<CameraSession, PtpError> {
        if !device.is_still_image_device() {
            debug!(
                "resolver: {:04x}:{:04x} has no still-image or MTP interface",
                device.vendor_id, device.product_id
            );
            return Err(PtpError::UnsupportedDevice {
                vendor_id: device.vendor_id,
                product_id: device.product_id,
            });
        }

        let variant = self.variant_for(&device);
        info!(
            "resolver: {} ({:04x}:{:04x}) uses the {} variant",
            device.display_name(),
            device.vendor_id,
            device.product_id,
            variant
        );
        Ok(CameraSession::new(device, variant, factory, config))
    }
}
