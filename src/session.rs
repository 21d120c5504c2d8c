//! Session bookkeeping for both directions of request/response traffic.
//!
//! Outbound: requests this client originates get a session id from
//! [`SessionTable::allocate_request_id`] and a oneshot response slot that the
//! dispatch thread fulfils when the matching response (or the timeout sweep)
//! arrives.
//!
//! Inbound: requests dispatched to an application handler are parked as
//! [`PendingRequest`] entries until `send_response` claims them or the sweep
//! expires them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::warn;
use tokio::sync::oneshot;

use crate::error::SomeIpError;

/// Packs client id and session id into the 32-bit wire request id.
pub fn pack_request_id(client_id: u16, session_id: u16) -> u32 {
    (u32::from(client_id) << 16) | u32::from(session_id)
}

/// An inbound request handed to a handler and awaiting its response.
///
/// At most one entry exists per `client_request_id` per instance.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub client_request_id: u32,
    pub session_id: u16,
    pub service_id: u16,
    pub method_id: u16,
    pub interface_version: u8,
    pub arrival: Instant,
    pub source: SocketAddr,
}

/// Slot fulfilled with the response payload, or the error that ended the
/// request (timeout, shutdown).
pub type ResponseSlot = oneshot::Sender<Result<Vec<u8>, SomeIpError>>;

struct OutboundRequest {
    slot: ResponseSlot,
    method_id: u16,
    sent_at: Instant,
}

pub struct SessionTable {
    client_id: u16,
    next_session: u16,
    outbound: HashMap<u32, OutboundRequest>,
    inbound: HashMap<u32, PendingRequest>,
}

impl SessionTable {
    pub fn new(client_id: u16) -> Self {
        SessionTable {
            client_id,
            next_session: 1,
            outbound: HashMap::new(),
            inbound: HashMap::new(),
        }
    }

    /// Next free session id for an outbound request. Monotonically
    /// increasing, wraps at the 16-bit boundary, skips 0 and ids that are
    /// still pending.
    pub fn allocate_request_id(&mut self) -> u16 {
        for _ in 0..=u16::MAX as u32 {
            let candidate = self.next_session;
            self.next_session = if candidate == u16::MAX { 1 } else { candidate + 1 };
            if candidate == 0 {
                continue;
            }
            if !self
                .outbound
                .contains_key(&pack_request_id(self.client_id, candidate))
            {
                return candidate;
            }
        }
        // Every session id is pending. Reuse the oldest slot's successor;
        // the duplicate check in register_outbound still applies.
        warn!("session table exhausted, reusing session id");
        self.next_session
    }

    /// Park a response slot for an outbound request.
    pub fn register_outbound(
        &mut self,
        session_id: u16,
        method_id: u16,
        slot: ResponseSlot,
    ) -> Result<u32, SomeIpError> {
        let id = pack_request_id(self.client_id, session_id);
        if self.outbound.contains_key(&id) {
            return Err(SomeIpError::DuplicateId(id));
        }
        self.outbound.insert(
            id,
            OutboundRequest {
                slot,
                method_id,
                sent_at: Instant::now(),
            },
        );
        Ok(id)
    }

    /// Fulfil (and remove) the slot for an inbound response. `Err(NotFound)`
    /// marks a stale, duplicate or spoofed response; callers log and drop it.
    pub fn resolve(
        &mut self,
        client_request_id: u32,
        outcome: Result<Vec<u8>, SomeIpError>,
    ) -> Result<u16, SomeIpError> {
        match self.outbound.remove(&client_request_id) {
            Some(entry) => {
                // The requester may have given up already; that is fine.
                let _ = entry.slot.send(outcome);
                Ok(entry.method_id)
            }
            None => Err(SomeIpError::NotFound(client_request_id)),
        }
    }

    /// Park an inbound request that was handed to a handler.
    pub fn register_pending(&mut self, pending: PendingRequest) -> Result<(), SomeIpError> {
        let id = pending.client_request_id;
        if self.inbound.contains_key(&id) {
            return Err(SomeIpError::DuplicateId(id));
        }
        self.inbound.insert(id, pending);
        Ok(())
    }

    /// Claim the pending entry for `send_response`.
    pub fn take_pending(&mut self, client_request_id: u32) -> Option<PendingRequest> {
        self.inbound.remove(&client_request_id)
    }

    /// Expire entries older than `timeout`.
    ///
    /// Outbound entries are resolved as timed out through their slot.
    /// Expired inbound entries are returned so the caller can report the
    /// timeout to the original requester.
    pub fn sweep(&mut self, now: Instant, timeout: Duration) -> Vec<PendingRequest> {
        let expired_outbound: Vec<u32> = self
            .outbound
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.sent_at) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in expired_outbound {
            if let Some(entry) = self.outbound.remove(&id) {
                let _ = entry.slot.send(Err(SomeIpError::TimedOut));
            }
        }

        let expired_inbound: Vec<u32> = self
            .inbound
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.arrival) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        expired_inbound
            .into_iter()
            .filter_map(|id| self.inbound.remove(&id))
            .collect()
    }

    /// Fail every outstanding outbound request. Used on shutdown.
    pub fn fail_all_outbound(&mut self) {
        for (_, entry) in self.outbound.drain() {
            let _ = entry.slot.send(Err(SomeIpError::TimedOut));
        }
    }

    #[cfg(test)]
    fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    pub fn pending_len(&self) -> usize {
        self.inbound.len()
    }
}
