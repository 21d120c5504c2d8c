use crate::error::DecodeError;

/// SOME/IP message types carried in byte 14 of the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Request = 0x00,
    RequestNoReturn = 0x01,
    Notification = 0x02,
    Response = 0x80,
    Error = 0x81,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Result<Self, DecodeError> {
        match value {
            0x00 => Ok(MessageType::Request),
            0x01 => Ok(MessageType::RequestNoReturn),
            0x02 => Ok(MessageType::Notification),
            0x80 => Ok(MessageType::Response),
            0x81 => Ok(MessageType::Error),
            other => Err(DecodeError::UnknownMessageType(other)),
        }
    }
}

/// Standard AUTOSAR return codes (byte 15 of the header).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReturnCode {
    Ok = 0x00,
    NotOk = 0x01,
    UnknownService = 0x02,
    UnknownMethod = 0x03,
    NotReady = 0x04,
    NotReachable = 0x05,
    Timeout = 0x06,
    WrongProtocolVersion = 0x07,
    WrongInterfaceVersion = 0x08,
    MalformedMessage = 0x09,
}

impl ReturnCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(ReturnCode::Ok),
            0x01 => Some(ReturnCode::NotOk),
            0x02 => Some(ReturnCode::UnknownService),
            0x03 => Some(ReturnCode::UnknownMethod),
            0x04 => Some(ReturnCode::NotReady),
            0x05 => Some(ReturnCode::NotReachable),
            0x06 => Some(ReturnCode::Timeout),
            0x07 => Some(ReturnCode::WrongProtocolVersion),
            0x08 => Some(ReturnCode::WrongInterfaceVersion),
            0x09 => Some(ReturnCode::MalformedMessage),
            _ => None,
        }
    }
}

/// The 16-byte SOME/IP header.
///
/// `length` covers everything after the length field itself: Request ID (4)
/// plus the version/type/code bytes (4) plus the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SomeIpHeader {
    pub service_id: u16,
    pub method_id: u16,
    pub length: u32,
    pub client_id: u16,
    pub session_id: u16,
    pub protocol_version: u8,
    pub interface_version: u8,
    pub message_type: MessageType,
    pub return_code: u8,
}

impl SomeIpHeader {
    pub const WIRE_LENGTH: usize = 16;
    pub const PROTOCOL_VERSION: u8 = 0x01;
    pub const DEFAULT_INTERFACE_VERSION: u8 = 0x01;
    /// Bytes after the length field that the length field always covers.
    pub const LENGTH_COVERED_FIXED: u32 = 8;

    pub fn new(
        service_id: u16,
        method_id: u16,
        client_id: u16,
        session_id: u16,
        message_type: MessageType,
        payload_len: u32,
    ) -> Self {
        SomeIpHeader {
            service_id,
            method_id,
            length: payload_len + Self::LENGTH_COVERED_FIXED,
            client_id,
            session_id,
            protocol_version: Self::PROTOCOL_VERSION,
            interface_version: Self::DEFAULT_INTERFACE_VERSION,
            message_type,
            return_code: ReturnCode::Ok as u8,
        }
    }

    pub fn payload_len(&self) -> Result<usize, DecodeError> {
        if self.length < Self::LENGTH_COVERED_FIXED {
            return Err(DecodeError::BadLength(self.length));
        }
        Ok((self.length - Self::LENGTH_COVERED_FIXED) as usize)
    }

    /// Request ID as transmitted: client id in the upper 16 bits, session id
    /// in the lower 16.
    pub fn request_id(&self) -> u32 {
        (u32::from(self.client_id) << 16) | u32::from(self.session_id)
    }

    pub fn serialize(&self) -> [u8; Self::WIRE_LENGTH] {
        let mut buffer = [0u8; Self::WIRE_LENGTH];

        // Message ID (Service ID + Method ID)
        buffer[0..2].copy_from_slice(&self.service_id.to_be_bytes());
        buffer[2..4].copy_from_slice(&self.method_id.to_be_bytes());

        // Length
        buffer[4..8].copy_from_slice(&self.length.to_be_bytes());

        // Request ID (Client ID + Session ID)
        buffer[8..10].copy_from_slice(&self.client_id.to_be_bytes());
        buffer[10..12].copy_from_slice(&self.session_id.to_be_bytes());

        buffer[12] = self.protocol_version;
        buffer[13] = self.interface_version;
        buffer[14] = self.message_type as u8;
        buffer[15] = self.return_code;

        buffer
    }

    pub fn deserialize(buffer: &[u8]) -> Result<Self, DecodeError> {
        if buffer.len() < Self::WIRE_LENGTH {
            return Err(DecodeError::Truncated {
                expected: Self::WIRE_LENGTH,
                actual: buffer.len(),
            });
        }

        let protocol_version = buffer[12];
        if protocol_version != Self::PROTOCOL_VERSION {
            return Err(DecodeError::UnsupportedVersion(protocol_version));
        }

        Ok(SomeIpHeader {
            service_id: u16::from_be_bytes([buffer[0], buffer[1]]),
            method_id: u16::from_be_bytes([buffer[2], buffer[3]]),
            length: u32::from_be_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]),
            client_id: u16::from_be_bytes([buffer[8], buffer[9]]),
            session_id: u16::from_be_bytes([buffer[10], buffer[11]]),
            protocol_version,
            interface_version: buffer[13],
            message_type: MessageType::from_u8(buffer[14])?,
            return_code: buffer[15],
        })
    }
}
