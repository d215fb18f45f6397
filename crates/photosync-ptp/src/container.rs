//! PTP-over-USB container framing.
//!
//! Every command, data phase, response, and event travels in a container:
//!
//! ```text
//! offset  size  field
//! 0       4     total length (header included), little-endian
//! 4       2     container type (1 command, 2 data, 3 response, 4 event)
//! 6       2     operation / response / event code
//! 8       4     transaction ID
//! 12      ..    payload (parameter words, or raw bytes for data phases)
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codes::{EventCode, OperationCode, ResponseCode};
use crate::error::PtpError;

pub const HEADER_LEN: usize = 12;

/// Commands, responses, and events carry at most this many parameters.
pub const MAX_PARAMS: usize = 5;

/// Data-phase length meaning "larger than 4 GiB, read until a short packet".
pub const UNKNOWN_LENGTH: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerKind {
    Command,
    Data,
    Response,
    Event,
}

impl ContainerKind {
    fn to_wire(self) -> u16 {
        match self {
            Self::Command => 1,
            Self::Data => 2,
            Self::Response => 3,
            Self::Event => 4,
        }
    }

    fn from_wire(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::Command),
            2 => Some(Self::Data),
            3 => Some(Self::Response),
            4 => Some(Self::Event),
            _ => None,
        }
    }
}

/// Decoded fixed header of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub length: u32,
    pub kind: ContainerKind,
    pub code: u16,
    pub transaction_id: u32,
}

impl Header {
    /// Parses the first [`HEADER_LEN`] bytes of `buf`.
    pub fn parse(buf: &[u8]) -> Result<Self, PtpError> {
        if buf.len() < HEADER_LEN {
            return Err(PtpError::malformed(format!(
                "container shorter than header ({} bytes)",
                buf.len()
            )));
        }
        let mut cursor = &buf[..HEADER_LEN];
        let length = cursor.get_u32_le();
        let raw_kind = cursor.get_u16_le();
        let code = cursor.get_u16_le();
        let transaction_id = cursor.get_u32_le();

        let kind = ContainerKind::from_wire(raw_kind)
            .ok_or_else(|| PtpError::malformed(format!("unknown container type {raw_kind}")))?;
        if length != UNKNOWN_LENGTH && (length as usize) < HEADER_LEN {
            return Err(PtpError::malformed(format!("container length {length} below header size")));
        }

        Ok(Self {
            length,
            kind,
            code,
            transaction_id,
        })
    }

    /// Payload length announced by the header, `None` for [`UNKNOWN_LENGTH`].
    pub fn payload_len(&self) -> Option<usize> {
        if self.length == UNKNOWN_LENGTH {
            None
        } else {
            Some(self.length as usize - HEADER_LEN)
        }
    }
}

/// One complete container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub kind: ContainerKind,
    pub code: u16,
    pub transaction_id: u32,
    pub payload: Bytes,
}

impl Container {
    pub fn command(operation: OperationCode, transaction_id: u32, params: &[u32]) -> Self {
        debug_assert!(params.len() <= MAX_PARAMS);
        Self {
            kind: ContainerKind::Command,
            code: operation.0,
            transaction_id,
            payload: encode_params(params),
        }
    }

    pub fn response(response: ResponseCode, transaction_id: u32, params: &[u32]) -> Self {
        Self {
            kind: ContainerKind::Response,
            code: response.0,
            transaction_id,
            payload: encode_params(params),
        }
    }

    pub fn event(event: EventCode, transaction_id: u32, params: &[u32]) -> Self {
        Self {
            kind: ContainerKind::Event,
            code: event.0,
            transaction_id,
            payload: encode_params(params),
        }
    }

    pub fn data(operation: OperationCode, transaction_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: ContainerKind::Data,
            code: operation.0,
            transaction_id,
            payload: payload.into(),
        }
    }

    pub fn header(&self) -> Header {
        let total = HEADER_LEN + self.payload.len();
        Header {
            length: u32::try_from(total).unwrap_or(UNKNOWN_LENGTH),
            kind: self.kind,
            code: self.code,
            transaction_id: self.transaction_id,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        encode_header(&self.header(), &mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decodes a complete container. Trailing bytes beyond the announced length are
    /// rejected, since USB never packs two containers into one transfer.
    pub fn decode(buf: &[u8]) -> Result<Self, PtpError> {
        let header = Header::parse(buf)?;
        let payload = match header.payload_len() {
            Some(len) => {
                let available = buf.len() - HEADER_LEN;
                if available != len {
                    return Err(PtpError::malformed(format!(
                        "container announces {len} payload bytes, got {available}"
                    )));
                }
                Bytes::copy_from_slice(&buf[HEADER_LEN..])
            }
            None => Bytes::copy_from_slice(&buf[HEADER_LEN..]),
        };
        Ok(Self {
            kind: header.kind,
            code: header.code,
            transaction_id: header.transaction_id,
            payload,
        })
    }

    /// Reads the payload as parameter words.
    pub fn params(&self) -> Result<Vec<u32>, PtpError> {
        if self.payload.len() % 4 != 0 {
            return Err(PtpError::malformed(format!(
                "parameter block of {} bytes is not word aligned",
                self.payload.len()
            )));
        }
        let count = self.payload.len() / 4;
        if count > MAX_PARAMS {
            return Err(PtpError::malformed(format!("{count} parameters, at most {MAX_PARAMS} allowed")));
        }
        let mut cursor = &self.payload[..];
        Ok((0..count).map(|_| cursor.get_u32_le()).collect())
    }

    pub fn response_code(&self) -> ResponseCode {
        ResponseCode(self.code)
    }

    pub fn event_code(&self) -> EventCode {
        EventCode(self.code)
    }
}

/// Writes a header only; used for data phases whose payload is streamed separately.
pub fn encode_header(header: &Header, buf: &mut BytesMut) {
    buf.put_u32_le(header.length);
    buf.put_u16_le(header.kind.to_wire());
    buf.put_u16_le(header.code);
    buf.put_u32_le(header.transaction_id);
}

fn encode_params(params: &[u32]) -> Bytes {
    let mut buf = BytesMut::with_capacity(params.len() * 4);
    for param in params {
        buf.put_u32_le(*param);
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_layout() {
        let container = Container::command(OperationCode::OPEN_SESSION, 0, &[1]);
        let bytes = container.encode();
        assert_eq!(
            &bytes[..],
            &[0x10, 0, 0, 0, 0x01, 0x00, 0x02, 0x10, 0, 0, 0, 0, 0x01, 0, 0, 0]
        );
    }

    #[test]
    fn test_decode_response_with_params() {
        let bytes = Container::response(ResponseCode::OK, 7, &[0x10001, 2]).encode();
        let decoded = Container::decode(&bytes).unwrap();
        assert_eq!(decoded.kind, ContainerKind::Response);
        assert_eq!(decoded.response_code(), ResponseCode::OK);
        assert_eq!(decoded.transaction_id, 7);
        assert_eq!(decoded.params().unwrap(), vec![0x10001, 2]);
    }

    #[test]
    fn test_header_rejects_short_buffer() {
        let err = Header::parse(&[0x0c, 0, 0, 0, 3, 0]).unwrap_err();
        assert!(matches!(err, PtpError::MalformedResponse { .. }));
    }

    #[test]
    fn test_header_rejects_unknown_type() {
        let mut bytes = Container::response(ResponseCode::OK, 1, &[]).encode().to_vec();
        bytes[4] = 9;
        let err = Header::parse(&bytes).unwrap_err();
        assert!(err.to_string().contains("unknown container type 9"));
    }

    #[test]
    fn test_header_rejects_length_below_header() {
        let bytes = [0x04, 0, 0, 0, 0x03, 0, 0x01, 0x20, 0, 0, 0, 0];
        assert!(Header::parse(&bytes).is_err());
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        let mut bytes = Container::response(ResponseCode::OK, 1, &[5]).encode().to_vec();
        bytes.push(0);
        assert!(Container::decode(&bytes).is_err());
    }

    #[test]
    fn test_params_reject_unaligned_payload() {
        let container = Container {
            kind: ContainerKind::Response,
            code: ResponseCode::OK.0,
            transaction_id: 1,
            payload: Bytes::from_static(&[1, 0, 0]),
        };
        assert!(container.params().is_err());
    }

    #[test]
    fn test_params_reject_too_many_words() {
        let container = Container {
            kind: ContainerKind::Event,
            code: EventCode::OBJECT_ADDED.0,
            transaction_id: 0,
            payload: Bytes::from(vec![0u8; 24]),
        };
        assert!(container.params().is_err());
    }

    #[test]
    fn test_unknown_length_header() {
        let mut buf = BytesMut::new();
        encode_header(
            &Header {
                length: UNKNOWN_LENGTH,
                kind: ContainerKind::Data,
                code: OperationCode::GET_OBJECT.0,
                transaction_id: 3,
            },
            &mut buf,
        );
        let header = Header::parse(&buf).unwrap();
        assert_eq!(header.payload_len(), None);
        assert_eq!(header.kind, ContainerKind::Data);
    }
}
