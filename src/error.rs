use std::io;

use thiserror::Error;

/// Errors produced while decoding inbound wire data.
///
/// Decode failures never tear down the client; the offending datagram is
/// logged and dropped.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer bytes were available than the header (or its length field)
    /// declares.
    #[error("truncated frame: need {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// The protocol version byte does not match the supported version.
    #[error("unsupported protocol version 0x{0:02x}")]
    UnsupportedVersion(u8),

    /// The message type byte is not a known SOME/IP message type.
    #[error("unknown message type 0x{0:02x}")]
    UnknownMessageType(u8),

    /// The length field is smaller than the fixed part it must cover.
    #[error("bad length field: {0}")]
    BadLength(u32),
}

/// Caller-facing error taxonomy of the client facade.
#[derive(Debug, Error)]
pub enum SomeIpError {
    /// Bad initialization parameters (empty name, zero client id, ...).
    /// Fatal to `initialize`.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Operation called in the wrong lifecycle state or from a context
    /// where it cannot complete.
    #[error("invalid state: cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    /// Send on a service/event that was never offered.
    #[error("not offered: service 0x{service_id:04x} instance 0x{instance_id:04x} event 0x{event_id:04x}")]
    NotOffered {
        service_id: u16,
        instance_id: u16,
        event_id: u16,
    },

    /// A pending entry already exists for this request id.
    #[error("duplicate request id 0x{0:08x}")]
    DuplicateId(u32),

    /// No pending entry matches this request id (stale, duplicate or
    /// already answered).
    #[error("no pending request with id 0x{0:08x}")]
    NotFound(u32),

    /// Malformed inbound bytes.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// A request exceeded its deadline.
    #[error("request timed out")]
    TimedOut,

    /// The remote peer answered a request with an error frame.
    #[error("remote error: return code 0x{0:02x}")]
    Remote(u8),

    /// Transport-level send failure surfaced to the caller.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}

impl SomeIpError {
    pub(crate) fn invalid_state(operation: &'static str, state: &'static str) -> Self {
        SomeIpError::InvalidState { operation, state }
    }
}
