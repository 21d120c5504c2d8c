//! # SOME/IP client-side core
//!
//! The minimal engine behind a SOME/IP client API: wire codec, session
//! table, dispatch core, event publisher and a client facade with the
//! lifecycle operations `initialize`, `offer_service`,
//! `register_request_handler`, `offer_event`, `send_event`,
//! `send_response`, `send_request` and `shutdown`.
//!
//! Transport and service-discovery wire protocols are external
//! collaborators behind the [`transport::Transport`] and
//! [`discovery::DiscoveryListener`] traits.

pub mod client;
pub mod codec;
pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod publisher;
pub mod session;
pub mod transport;

pub use client::{Responder, SomeIpClient};
pub use codec::{Message, MessageType, ReturnCode, SomeIpHeader};
pub use config::ClientConfig;
pub use discovery::{DiscoveryListener, NullDiscovery};
pub use dispatch::{LifecycleState, Request, RequestHandler};
pub use error::{DecodeError, SomeIpError};
pub use session::{PendingRequest, SessionTable};
pub use transport::{InProcNetwork, InProcTransport, Transport};
