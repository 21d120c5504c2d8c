use crate::codec::header::{MessageType, ReturnCode, SomeIpHeader};
use crate::error::DecodeError;

/// A complete SOME/IP frame: header plus payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: SomeIpHeader,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(header: SomeIpHeader, payload: Vec<u8>) -> Self {
        Message { header, payload }
    }

    /// Builds a response frame mirroring the identifiers of `request`.
    pub fn response_to(request: &SomeIpHeader, payload: Vec<u8>) -> Self {
        let mut header = SomeIpHeader::new(
            request.service_id,
            request.method_id,
            request.client_id,
            request.session_id,
            MessageType::Response,
            payload.len() as u32,
        );
        header.interface_version = request.interface_version;
        Message { header, payload }
    }

    /// Builds an error frame mirroring the identifiers of `request`.
    /// Error responses carry no payload.
    pub fn error_to(request: &SomeIpHeader, return_code: ReturnCode) -> Self {
        let mut header = SomeIpHeader::new(
            request.service_id,
            request.method_id,
            request.client_id,
            request.session_id,
            MessageType::Error,
            0,
        );
        header.interface_version = request.interface_version;
        header.return_code = return_code as u8;
        Message {
            header,
            payload: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(SomeIpHeader::WIRE_LENGTH + self.payload.len());
        buffer.extend_from_slice(&self.header.serialize());
        buffer.extend_from_slice(&self.payload);
        buffer
    }

    /// Decodes one frame from `bytes`. Trailing bytes beyond the declared
    /// length are ignored (datagram framing). No partial state is consumed
    /// on failure.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let header = SomeIpHeader::deserialize(bytes)?;
        let payload_len = header.payload_len()?;

        let total = SomeIpHeader::WIRE_LENGTH + payload_len;
        if bytes.len() < total {
            return Err(DecodeError::Truncated {
                expected: total,
                actual: bytes.len(),
            });
        }

        let payload = bytes[SomeIpHeader::WIRE_LENGTH..total].to_vec();
        Ok(Message { header, payload })
    }
}
