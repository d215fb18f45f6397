//! PTP datasets: DeviceInfo and ObjectInfo, plus the primitive readers they are built from.

use bytes::{Buf, BufMut, BytesMut};
use serde::Serialize;

use crate::codes::{ObjectFormat, OperationCode};
use crate::error::PtpError;

/// Little-endian cursor over a dataset with bounds-checked reads.
pub struct DatasetReader<'a> {
    buf: &'a [u8],
    what: &'static str,
}

impl<'a> DatasetReader<'a> {
    pub fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, what }
    }

    fn need(&self, n: usize) -> Result<(), PtpError> {
        if self.buf.remaining() < n {
            return Err(PtpError::malformed(format!(
                "{} truncated: needed {n} more bytes, {} left",
                self.what,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn u8(&mut self) -> Result<u8, PtpError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn u16(&mut self) -> Result<u16, PtpError> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    pub fn u32(&mut self) -> Result<u32, PtpError> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    /// PTP string: u8 character count (terminator included), then UTF-16LE code units.
    /// A count of 0 is the empty string.
    pub fn string(&mut self) -> Result<String, PtpError> {
        let count = self.u8()? as usize;
        if count == 0 {
            return Ok(String::new());
        }
        self.need(count * 2)?;
        let mut units = Vec::with_capacity(count);
        for _ in 0..count {
            units.push(self.buf.get_u16_le());
        }
        if units.last() == Some(&0) {
            units.pop();
        }
        Ok(String::from_utf16_lossy(&units))
    }

    pub fn u16_array(&mut self) -> Result<Vec<u16>, PtpError> {
        let count = self.u32()? as usize;
        self.need(count.saturating_mul(2))?;
        Ok((0..count).map(|_| self.buf.get_u16_le()).collect())
    }

    pub fn u32_array(&mut self) -> Result<Vec<u32>, PtpError> {
        let count = self.u32()? as usize;
        self.need(count.saturating_mul(4))?;
        Ok((0..count).map(|_| self.buf.get_u32_le()).collect())
    }
}

/// Writes a PTP string. Strings longer than 254 code units are truncated.
pub fn put_string(buf: &mut BytesMut, value: &str) {
    if value.is_empty() {
        buf.put_u8(0);
        return;
    }
    let units: Vec<u16> = value.encode_utf16().take(254).collect();
    buf.put_u8((units.len() + 1) as u8);
    for unit in units {
        buf.put_u16_le(unit);
    }
    buf.put_u16_le(0);
}

pub fn put_u16_array(buf: &mut BytesMut, values: &[u16]) {
    buf.put_u32_le(values.len() as u32);
    for value in values {
        buf.put_u16_le(*value);
    }
}

pub fn put_u32_array(buf: &mut BytesMut, values: &[u32]) {
    buf.put_u32_le(values.len() as u32);
    for value in values {
        buf.put_u32_le(*value);
    }
}

/// Reads the object handle list returned by GetObjectHandles.
pub fn parse_handles(payload: &[u8]) -> Result<Vec<u32>, PtpError> {
    DatasetReader::new(payload, "ObjectHandles").u32_array()
}

/// The device's self-description returned by GetDeviceInfo.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub standard_version: u16,
    pub vendor_extension_id: u32,
    pub vendor_extension_version: u16,
    pub vendor_extension_desc: String,
    pub functional_mode: u16,
    pub operations_supported: Vec<u16>,
    pub events_supported: Vec<u16>,
    pub device_properties_supported: Vec<u16>,
    pub capture_formats: Vec<u16>,
    pub image_formats: Vec<u16>,
    pub manufacturer: String,
    pub model: String,
    pub device_version: String,
    pub serial_number: String,
}

impl DeviceInfo {
    pub fn parse(payload: &[u8]) -> Result<Self, PtpError> {
        let mut r = DatasetReader::new(payload, "DeviceInfo");
        Ok(Self {
            standard_version: r.u16()?,
            vendor_extension_id: r.u32()?,
            vendor_extension_version: r.u16()?,
            vendor_extension_desc: r.string()?,
            functional_mode: r.u16()?,
            operations_supported: r.u16_array()?,
            events_supported: r.u16_array()?,
            device_properties_supported: r.u16_array()?,
            capture_formats: r.u16_array()?,
            image_formats: r.u16_array()?,
            manufacturer: r.string()?,
            model: r.string()?,
            device_version: r.string()?,
            serial_number: r.string()?,
        })
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u16_le(self.standard_version);
        buf.put_u32_le(self.vendor_extension_id);
        buf.put_u16_le(self.vendor_extension_version);
        put_string(&mut buf, &self.vendor_extension_desc);
        buf.put_u16_le(self.functional_mode);
        put_u16_array(&mut buf, &self.operations_supported);
        put_u16_array(&mut buf, &self.events_supported);
        put_u16_array(&mut buf, &self.device_properties_supported);
        put_u16_array(&mut buf, &self.capture_formats);
        put_u16_array(&mut buf, &self.image_formats);
        put_string(&mut buf, &self.manufacturer);
        put_string(&mut buf, &self.model);
        put_string(&mut buf, &self.device_version);
        put_string(&mut buf, &self.serial_number);
        buf
    }

    pub fn supports_operation(&self, operation: OperationCode) -> bool {
        self.operations_supported.contains(&operation.0)
    }
}

/// Metadata for one object, returned by GetObjectInfo.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectInfo {
    pub storage_id: u32,
    pub format: u16,
    pub protection_status: u16,
    /// `0xFFFFFFFF` when the object is 4 GiB or larger.
    pub compressed_size: u32,
    pub thumb_format: u16,
    pub thumb_compressed_size: u32,
    pub thumb_width: u32,
    pub thumb_height: u32,
    pub image_width: u32,
    pub image_height: u32,
    pub image_bit_depth: u32,
    pub parent: u32,
    pub association_type: u16,
    pub association_desc: u32,
    pub sequence_number: u32,
    pub filename: String,
    /// ISO 8601 basic format as sent by the device, e.g. "20240101T120000".
    pub capture_date: String,
    pub modification_date: String,
    pub keywords: String,
}

impl ObjectInfo {
    pub fn parse(payload: &[u8]) -> Result<Self, PtpError> {
        let mut r = DatasetReader::new(payload, "ObjectInfo");
        Ok(Self {
            storage_id: r.u32()?,
            format: r.u16()?,
            protection_status: r.u16()?,
            compressed_size: r.u32()?,
            thumb_format: r.u16()?,
            thumb_compressed_size: r.u32()?,
            thumb_width: r.u32()?,
            thumb_height: r.u32()?,
            image_width: r.u32()?,
            image_height: r.u32()?,
            image_bit_depth: r.u32()?,
            parent: r.u32()?,
            association_type: r.u16()?,
            association_desc: r.u32()?,
            sequence_number: r.u32()?,
            filename: r.string()?,
            capture_date: r.string()?,
            modification_date: r.string()?,
            // Some firmware omits trailing fields.
            keywords: r.string().unwrap_or_default(),
        })
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u32_le(self.storage_id);
        buf.put_u16_le(self.format);
        buf.put_u16_le(self.protection_status);
        buf.put_u32_le(self.compressed_size);
        buf.put_u16_le(self.thumb_format);
        buf.put_u32_le(self.thumb_compressed_size);
        buf.put_u32_le(self.thumb_width);
        buf.put_u32_le(self.thumb_height);
        buf.put_u32_le(self.image_width);
        buf.put_u32_le(self.image_height);
        buf.put_u32_le(self.image_bit_depth);
        buf.put_u32_le(self.parent);
        buf.put_u16_le(self.association_type);
        buf.put_u32_le(self.association_desc);
        buf.put_u32_le(self.sequence_number);
        put_string(&mut buf, &self.filename);
        put_string(&mut buf, &self.capture_date);
        put_string(&mut buf, &self.modification_date);
        put_string(&mut buf, &self.keywords);
        buf
    }

    /// Folders (and other associations) have no data worth downloading.
    pub fn is_association(&self) -> bool {
        self.format == ObjectFormat::ASSOCIATION.0
    }

    /// Size from the dataset, or `None` when the device uses the 4 GiB sentinel.
    pub fn size(&self) -> Option<u64> {
        (self.compressed_size != u32::MAX).then_some(u64::from(self.compressed_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_object() -> ObjectInfo {
        ObjectInfo {
            storage_id: 0x0001_0001,
            format: ObjectFormat::EXIF_JPEG.0,
            compressed_size: 4_812_334,
            image_width: 6000,
            image_height: 4000,
            parent: 0x20,
            filename: "IMG_0042.JPG".to_string(),
            capture_date: "20240101T120000".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_string_wire_format() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "AB");
        assert_eq!(&buf[..], &[3, b'A', 0, b'B', 0, 0, 0]);

        let mut r = DatasetReader::new(&buf, "test");
        assert_eq!(r.string().unwrap(), "AB");
    }

    #[test]
    fn test_empty_string_is_single_zero_byte() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "");
        assert_eq!(&buf[..], &[0]);
        assert_eq!(DatasetReader::new(&buf, "test").string().unwrap(), "");
    }

    #[test]
    fn test_non_ascii_filename() {
        let info = ObjectInfo {
            filename: "Über_1.ARW".to_string(),
            ..sample_object()
        };
        let parsed = ObjectInfo::parse(&info.encode()).unwrap();
        assert_eq!(parsed.filename, "Über_1.ARW");
    }

    #[test]
    fn test_object_info_fields_survive_encoding() {
        let info = sample_object();
        let parsed = ObjectInfo::parse(&info.encode()).unwrap();
        assert_eq!(parsed, info);
        assert_eq!(parsed.size(), Some(4_812_334));
        assert!(!parsed.is_association());
    }

    #[test]
    fn test_object_info_size_sentinel() {
        let info = ObjectInfo {
            compressed_size: u32::MAX,
            ..sample_object()
        };
        assert_eq!(info.size(), None);
    }

    #[test]
    fn test_object_info_truncated_is_malformed() {
        let bytes = sample_object().encode();
        let err = ObjectInfo::parse(&bytes[..20]).unwrap_err();
        assert!(matches!(err, PtpError::MalformedResponse { .. }));
        assert!(err.to_string().contains("ObjectInfo truncated"));
    }

    #[test]
    fn test_association_detected() {
        let folder = ObjectInfo {
            format: ObjectFormat::ASSOCIATION.0,
            filename: "100CANON".to_string(),
            ..Default::default()
        };
        assert!(folder.is_association());
    }

    #[test]
    fn test_device_info_supports_operation() {
        let info = DeviceInfo {
            standard_version: 100,
            operations_supported: vec![0x1001, 0x1002, 0x1007, 0x1009],
            manufacturer: "Nikon Corporation".to_string(),
            model: "Z 6".to_string(),
            ..Default::default()
        };
        let parsed = DeviceInfo::parse(&info.encode()).unwrap();
        assert_eq!(parsed.model, "Z 6");
        assert!(parsed.supports_operation(OperationCode::GET_OBJECT));
        assert!(!parsed.supports_operation(OperationCode::GET_THUMB));
    }

    #[test]
    fn test_array_count_beyond_payload_is_malformed() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(1000);
        buf.put_u32_le(1);
        assert!(parse_handles(&buf).is_err());
    }

    #[test]
    fn test_parse_handles() {
        let mut buf = BytesMut::new();
        put_u32_array(&mut buf, &[1, 2, 0xA]);
        assert_eq!(parse_handles(&buf).unwrap(), vec![1, 2, 0xA]);
    }
}
