//! # SOME/IP Codec Module
//!
//! Serialization and deserialization of SOME/IP frames.
//!
//! ## Key Types
//!
//! - [`SomeIpHeader`] - 16-byte SOME/IP header with message metadata
//! - [`Message`] - header plus payload, the unit handed to/from transport
//! - [`MessageType`] - Request, Response, Notification, Error types
//! - [`ReturnCode`] - Standard AUTOSAR return codes
//!
//! Encoding and decoding are pure transforms; decode failures are reported
//! as [`DecodeError`](crate::error::DecodeError) and never consume state.

pub mod header;
pub mod message;

pub use header::{MessageType, ReturnCode, SomeIpHeader};
pub use message::Message;
