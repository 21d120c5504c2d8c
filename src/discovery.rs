//! Service-discovery boundary.
//!
//! The SD wire protocol lives outside this crate. The engine only announces
//! offer/withdraw transitions to a listener and accepts subscription changes
//! pushed back in through the client facade
//! ([`subscribe`](crate::client::SomeIpClient::subscribe) /
//! [`unsubscribe`](crate::client::SomeIpClient::unsubscribe)).

/// Receives offer-state changes from a client handle.
///
/// Callbacks are invoked outside the client's internal lock, so an
/// implementation may call back into the client if it needs to.
pub trait DiscoveryListener: Send + Sync {
    fn service_offered(&self, service_id: u16, instance_id: u16);
    fn service_withdrawn(&self, service_id: u16, instance_id: u16);
    fn event_offered(&self, service_id: u16, instance_id: u16, event_id: u16, groups: &[u16]);
    fn event_withdrawn(&self, service_id: u16, instance_id: u16, event_id: u16);
}

/// Listener used when no service discovery is attached.
pub struct NullDiscovery;

impl DiscoveryListener for NullDiscovery {
    fn service_offered(&self, _service_id: u16, _instance_id: u16) {}
    fn service_withdrawn(&self, _service_id: u16, _instance_id: u16) {}
    fn event_offered(&self, _service_id: u16, _instance_id: u16, _event_id: u16, _groups: &[u16]) {}
    fn event_withdrawn(&self, _service_id: u16, _instance_id: u16, _event_id: u16) {}
}
