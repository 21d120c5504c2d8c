//! The public client handle.
//!
//! One [`SomeIpClient`] owns a session table, its offered services/events
//! and a transport binding, and runs one dedicated dispatch thread that
//! decodes inbound frames and invokes registered handlers synchronously.
//! Application threads call the send/offer operations concurrently with
//! dispatch; all shared state sits behind a single mutex that is never held
//! while a handler runs or a socket write happens, so `send_response` and
//! `send_event` are safe to call from inside a handler.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use tokio::sync::oneshot;

use crate::codec::{Message, MessageType, ReturnCode, SomeIpHeader};
use crate::config::ClientConfig;
use crate::discovery::{DiscoveryListener, NullDiscovery};
use crate::dispatch::{Dispatch, DispatchCore, LifecycleState, RequestHandler};
use crate::error::SomeIpError;
use crate::publisher::{DeliveryErrorCallback, EventPublisher};
use crate::session::PendingRequest;
use crate::transport::Transport;

struct Inner {
    name: String,
    client_id: u16,
    config: ClientConfig,
    core: Mutex<DispatchCore>,
    transport: Arc<dyn Transport>,
    discovery: Arc<dyn DiscoveryListener>,
    publisher: EventPublisher,
    running: AtomicBool,
    dispatch_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

/// Handle to one initialized SOME/IP client context. Cheap to clone.
#[derive(Clone)]
pub struct SomeIpClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SomeIpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SomeIpClient").finish_non_exhaustive()
    }
}

/// Weak handle for use inside request handlers. Holding one does not keep
/// the client alive, which avoids a reference cycle between the handler
/// registry and the handlers themselves.
#[derive(Clone)]
pub struct Responder {
    inner: Weak<Inner>,
}

impl SomeIpClient {
    /// Initialize a client with default config and no discovery listener.
    pub fn initialize(
        name: &str,
        transport: Arc<dyn Transport>,
    ) -> Result<SomeIpClient, SomeIpError> {
        Self::initialize_with(name, transport, Arc::new(NullDiscovery), ClientConfig::default())
    }

    /// Initialize a client with an explicit discovery listener and config.
    pub fn initialize_with(
        name: &str,
        transport: Arc<dyn Transport>,
        discovery: Arc<dyn DiscoveryListener>,
        config: ClientConfig,
    ) -> Result<SomeIpClient, SomeIpError> {
        if name.is_empty() {
            return Err(SomeIpError::Configuration("client name is empty".into()));
        }
        if name.contains('\0') {
            return Err(SomeIpError::Configuration(
                "client name contains NUL".into(),
            ));
        }
        config.validate()?;

        let client_id = config.client_id.unwrap_or_else(|| derive_client_id(name));

        let inner = Arc::new(Inner {
            name: name.to_string(),
            client_id,
            core: Mutex::new(DispatchCore::new(client_id)),
            publisher: EventPublisher::new(Arc::clone(&transport)),
            transport,
            discovery,
            config,
            running: AtomicBool::new(true),
            dispatch_thread: Mutex::new(None),
        });

        inner.core.lock().unwrap().begin_initializing();

        let weak = Arc::downgrade(&inner);
        let handle = thread::Builder::new()
            .name(format!("someip-dispatch-{name}"))
            .spawn(move || dispatch_loop(weak))
            .map_err(|e| SomeIpError::Configuration(format!("cannot spawn dispatch thread: {e}")))?;
        *inner.dispatch_thread.lock().unwrap() = Some(handle);

        inner.core.lock().unwrap().mark_running();
        info!("client '{name}' initialized (client_id=0x{client_id:04x})");

        Ok(SomeIpClient { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn client_id(&self) -> u16 {
        self.inner.client_id
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.core.lock().unwrap().state()
    }

    /// Register (or replace) the handler for one method. Independent of
    /// `offer_service`; both are idempotent and may happen in any order.
    pub fn register_request_handler(
        &self,
        service_id: u16,
        instance_id: u16,
        method_id: u16,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<(), SomeIpError> {
        self.inner
            .core
            .lock()
            .unwrap()
            .register_request_handler(service_id, instance_id, method_id, handler)
    }

    /// Declare that this client provides `(service_id, instance_id)`.
    pub fn offer_service(&self, service_id: u16, instance_id: u16) -> Result<(), SomeIpError> {
        let newly_offered = self
            .inner
            .core
            .lock()
            .unwrap()
            .offer_service(service_id, instance_id)?;
        if newly_offered {
            info!(
                "offered service 0x{service_id:04x} instance 0x{instance_id:04x}"
            );
            self.inner.discovery.service_offered(service_id, instance_id);
        }
        Ok(())
    }

    /// Declare a provided event and its event-group membership.
    pub fn offer_event(
        &self,
        service_id: u16,
        instance_id: u16,
        event_id: u16,
        event_groups: &[u16],
    ) -> Result<(), SomeIpError> {
        let announce = self
            .inner
            .core
            .lock()
            .unwrap()
            .offer_event(service_id, instance_id, event_id, event_groups)?;
        if let Some(groups) = announce {
            info!(
                "offered event 0x{event_id:04x} on 0x{service_id:04x}/0x{instance_id:04x} groups {groups:?}"
            );
            self.inner
                .discovery
                .event_offered(service_id, instance_id, event_id, &groups);
        }
        Ok(())
    }

    /// Record a subscriber for an event group (fed by service discovery).
    pub fn subscribe(&self, event_group_id: u16, subscriber: SocketAddr) -> Result<(), SomeIpError> {
        self.inner
            .core
            .lock()
            .unwrap()
            .subscribe(event_group_id, subscriber)
    }

    pub fn unsubscribe(
        &self,
        event_group_id: u16,
        subscriber: SocketAddr,
    ) -> Result<(), SomeIpError> {
        self.inner
            .core
            .lock()
            .unwrap()
            .unsubscribe(event_group_id, subscriber)
    }

    /// Publish an event to every current subscriber of its groups.
    /// Best-effort: per-subscriber failures go to the delivery-error
    /// callback, never to this caller.
    pub fn send_event(
        &self,
        service_id: u16,
        instance_id: u16,
        event_id: u16,
        payload: &[u8],
    ) -> Result<(), SomeIpError> {
        self.inner.send_event(service_id, instance_id, event_id, payload)
    }

    /// Answer a previously dispatched request.
    pub fn send_response(
        &self,
        client_request_id: u32,
        payload: &[u8],
    ) -> Result<(), SomeIpError> {
        self.inner.send_response(client_request_id, payload)
    }

    /// Send a request to a remote service and block until its response
    /// arrives or the request timeout expires.
    ///
    /// Fails fast with `InvalidState` when called from the dispatch thread
    /// (i.e. from inside a handler): the reply and the timeout sweep are
    /// both driven by that thread, so waiting on it can never complete.
    pub fn send_request(
        &self,
        service_id: u16,
        method_id: u16,
        payload: &[u8],
        destination: SocketAddr,
    ) -> Result<Vec<u8>, SomeIpError> {
        self.inner
            .send_request(service_id, method_id, payload, destination)
    }

    /// Replace the non-fatal delivery-error callback.
    pub fn set_delivery_error_callback(&self, callback: DeliveryErrorCallback) {
        self.inner.publisher.set_delivery_error_callback(callback);
    }

    /// A weak handle for use inside handlers.
    pub fn responder(&self) -> Responder {
        Responder {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Withdraw all offers, drain the dispatch thread and stop. Idempotent;
    /// the second call is a no-op.
    pub fn shutdown(&self) -> Result<(), SomeIpError> {
        self.inner.shutdown();
        Ok(())
    }
}

impl Responder {
    pub fn send_response(
        &self,
        client_request_id: u32,
        payload: &[u8],
    ) -> Result<(), SomeIpError> {
        let inner = self.upgrade("send_response")?;
        inner.send_response(client_request_id, payload)
    }

    pub fn send_event(
        &self,
        service_id: u16,
        instance_id: u16,
        event_id: u16,
        payload: &[u8],
    ) -> Result<(), SomeIpError> {
        let inner = self.upgrade("send_event")?;
        inner.send_event(service_id, instance_id, event_id, payload)
    }

    fn upgrade(&self, operation: &'static str) -> Result<Arc<Inner>, SomeIpError> {
        self.inner
            .upgrade()
            .ok_or(SomeIpError::invalid_state(operation, "Stopped"))
    }
}

impl Inner {
    fn send_event(
        &self,
        service_id: u16,
        instance_id: u16,
        event_id: u16,
        payload: &[u8],
    ) -> Result<(), SomeIpError> {
        self.check_payload_len(payload)?;
        let (session_id, targets) = self
            .core
            .lock()
            .unwrap()
            .prepare_event(service_id, instance_id, event_id)?;

        let header = SomeIpHeader::new(
            service_id,
            event_id,
            self.client_id,
            session_id,
            MessageType::Notification,
            payload.len() as u32,
        );
        let frame = Message::new(header, payload.to_vec()).encode();

        let delivered = self.publisher.publish(&frame, &targets);
        debug!(
            "event 0x{event_id:04x}: {delivered}/{} subscriber(s) reached",
            targets.len()
        );
        Ok(())
    }

    fn send_response(&self, client_request_id: u32, payload: &[u8]) -> Result<(), SomeIpError> {
        self.check_payload_len(payload)?;
        let pending = {
            let mut core = self.core.lock().unwrap();
            match core.state() {
                // Handlers may still answer while shutdown drains them.
                LifecycleState::Running | LifecycleState::ShuttingDown => {}
                state => {
                    return Err(SomeIpError::invalid_state("send_response", state.as_str()));
                }
            }
            core.sessions
                .take_pending(client_request_id)
                .ok_or(SomeIpError::NotFound(client_request_id))?
        };

        let frame = response_frame(&pending, MessageType::Response, ReturnCode::Ok, payload);
        self.transport.send(&frame, pending.source)?;
        Ok(())
    }

    fn send_request(
        &self,
        service_id: u16,
        method_id: u16,
        payload: &[u8],
        destination: SocketAddr,
    ) -> Result<Vec<u8>, SomeIpError> {
        self.check_payload_len(payload)?;
        // The reply and the timeout sweep are both delivered by the
        // dispatch thread; blocking it on its own loop would never resolve.
        if self.is_dispatch_thread() {
            return Err(SomeIpError::invalid_state(
                "send_request",
                "on the dispatch thread",
            ));
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        let (session_id, request_id) = {
            let mut core = self.core.lock().unwrap();
            core.ensure_running("send_request")?;
            let session_id = core.sessions.allocate_request_id();
            let request_id = core
                .sessions
                .register_outbound(session_id, method_id, reply_tx)?;
            (session_id, request_id)
        };

        let header = SomeIpHeader::new(
            service_id,
            method_id,
            self.client_id,
            session_id,
            MessageType::Request,
            payload.len() as u32,
        );
        let frame = Message::new(header, payload.to_vec()).encode();

        if let Err(err) = self.transport.send(&frame, destination) {
            // Reclaim the slot so the id does not linger until the sweep.
            let _ = self
                .core
                .lock()
                .unwrap()
                .sessions
                .resolve(request_id, Err(SomeIpError::TimedOut));
            return Err(SomeIpError::Transport(err));
        }

        match reply_rx.blocking_recv() {
            Ok(outcome) => outcome,
            // Slot dropped without an answer: the client shut down.
            Err(_) => Err(SomeIpError::TimedOut),
        }
    }

    fn is_dispatch_thread(&self) -> bool {
        self.dispatch_thread
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|handle| handle.thread().id() == thread::current().id())
    }

    fn check_payload_len(&self, payload: &[u8]) -> Result<(), SomeIpError> {
        if payload.len() > self.config.max_payload_len {
            return Err(SomeIpError::Configuration(format!(
                "payload of {} bytes exceeds max_payload_len {}",
                payload.len(),
                self.config.max_payload_len
            )));
        }
        Ok(())
    }

    fn handle_inbound(&self, frame: &[u8], source: SocketAddr) {
        let outcome = self
            .core
            .lock()
            .unwrap()
            .dispatch_inbound(frame, source, Instant::now());
        // Lock released: handler invocation and socket writes happen here.
        match outcome {
            Ok(Dispatch::Invoke { handler, request }) => handler.handle(request),
            Ok(Dispatch::Reply { message, destination }) => {
                if let Err(err) = self.transport.send(&message.encode(), destination) {
                    warn!("failed to send synthesized reply to {destination}: {err}");
                }
            }
            Ok(Dispatch::Absorbed) => {}
            Err(err) => warn!("dropping malformed frame from {source}: {err}"),
        }
    }

    fn run_sweep(&self) {
        let expired = {
            let mut core = self.core.lock().unwrap();
            core.sweep(Instant::now(), self.config.request_timeout())
        };
        for pending in expired {
            warn!(
                "request 0x{:08x} (method 0x{:04x}) timed out without a response",
                pending.client_request_id, pending.method_id
            );
            let frame = response_frame(&pending, MessageType::Error, ReturnCode::Timeout, &[]);
            if let Err(err) = self.transport.send(&frame, pending.source) {
                debug!("failed to report timeout to {}: {err}", pending.source);
            }
        }
    }

    fn shutdown(&self) {
        let (services, events) = {
            let mut core = self.core.lock().unwrap();
            if !core.begin_shutdown() {
                return;
            }
            core.sessions.fail_all_outbound();
            core.withdraw_all()
        };

        // Withdraw offers before Stopped is observable.
        for (service_id, instance_id, event_id) in &events {
            self.discovery
                .event_withdrawn(*service_id, *instance_id, *event_id);
        }
        for (service_id, instance_id) in &services {
            self.discovery.service_withdrawn(*service_id, *instance_id);
        }

        self.running.store(false, Ordering::SeqCst);
        let handle = self.dispatch_thread.lock().unwrap().take();
        if let Some(handle) = handle {
            if thread::current().id() == handle.thread().id() {
                // Shutdown called from inside a handler; the loop exits on
                // its own once the handler returns.
                debug!("shutdown from dispatch thread, skipping join");
            } else {
                let deadline = Instant::now() + self.config.drain_timeout();
                while !handle.is_finished() && Instant::now() < deadline {
                    thread::sleep(Duration::from_millis(5));
                }
                if handle.is_finished() {
                    let _ = handle.join();
                } else {
                    warn!(
                        "dispatch thread for '{}' did not drain within {:?}",
                        self.name,
                        self.config.drain_timeout()
                    );
                }
            }
        }

        self.core.lock().unwrap().mark_stopped();
        info!("client '{}' stopped", self.name);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Backstop when the last handle is dropped without an explicit
        // shutdown: withdraws offers, notifies discovery and drains the
        // dispatch thread. The thread only holds a Weak, so it cannot keep
        // this Inner alive and exits promptly once joined here.
        self.shutdown();
    }
}

fn derive_client_id(name: &str) -> u16 {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    let id = (hasher.finish() & 0xFFFF) as u16;
    if id == 0 { 1 } else { id }
}

fn response_frame(
    pending: &PendingRequest,
    message_type: MessageType,
    return_code: ReturnCode,
    payload: &[u8],
) -> Vec<u8> {
    let mut header = SomeIpHeader::new(
        pending.service_id,
        pending.method_id,
        (pending.client_request_id >> 16) as u16,
        pending.session_id,
        message_type,
        payload.len() as u32,
    );
    header.interface_version = pending.interface_version;
    header.return_code = return_code as u8;
    Message::new(header, payload.to_vec()).encode()
}

fn dispatch_loop(weak: Weak<Inner>) {
    let mut buffer: Vec<u8> = Vec::new();
    let mut last_sweep = Instant::now();
    loop {
        let Some(inner) = weak.upgrade() else { break };
        if !inner.running.load(Ordering::SeqCst) {
            break;
        }
        if buffer.is_empty() {
            buffer = vec![0u8; SomeIpHeader::WIRE_LENGTH + inner.config.max_payload_len];
        }

        match inner
            .transport
            .recv_timeout(&mut buffer, inner.config.recv_poll())
        {
            Ok(Some((len, source))) => inner.handle_inbound(&buffer[..len], source),
            Ok(None) => {}
            Err(err) => {
                error!("transport receive failed: {err}");
                thread::sleep(inner.config.recv_poll());
            }
        }

        if last_sweep.elapsed() >= inner.config.sweep_interval() {
            inner.run_sweep();
            last_sweep = Instant::now();
        }
        // Strong reference dropped each iteration so the last application
        // handle going away lets the loop exit.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InProcNetwork;

    #[test]
    fn test_initialize_rejects_empty_name() {
        let net = InProcNetwork::new();
        let err = SomeIpClient::initialize("", Arc::new(net.endpoint())).unwrap_err();
        assert!(matches!(err, SomeIpError::Configuration(_)));
    }

    #[test]
    fn test_initialize_rejects_nul_in_name() {
        let net = InProcNetwork::new();
        let err = SomeIpClient::initialize("bad\0name", Arc::new(net.endpoint())).unwrap_err();
        assert!(matches!(err, SomeIpError::Configuration(_)));
    }

    #[test]
    fn test_derive_client_id_is_stable_and_nonzero() {
        assert_eq!(derive_client_id("Test Service"), derive_client_id("Test Service"));
        assert_ne!(derive_client_id("a"), 0);
    }

    #[test]
    fn test_configured_client_id_wins() {
        let net = InProcNetwork::new();
        let config = ClientConfig {
            client_id: Some(0x00AB),
            ..ClientConfig::default()
        };
        let client = SomeIpClient::initialize_with(
            "Test Service",
            Arc::new(net.endpoint()),
            Arc::new(NullDiscovery),
            config,
        )
        .unwrap();
        assert_eq!(client.client_id(), 0x00AB);
        client.shutdown().unwrap();
    }

    #[test]
    fn test_lifecycle_reaches_running_and_stops() {
        let net = InProcNetwork::new();
        let client = SomeIpClient::initialize("Test Service", Arc::new(net.endpoint())).unwrap();
        assert_eq!(client.state(), LifecycleState::Running);

        client.shutdown().unwrap();
        assert_eq!(client.state(), LifecycleState::Stopped);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let net = InProcNetwork::new();
        let client = SomeIpClient::initialize("Test Service", Arc::new(net.endpoint())).unwrap();
        client.shutdown().unwrap();
        client.shutdown().unwrap();
        assert_eq!(client.state(), LifecycleState::Stopped);
    }

    #[test]
    fn test_operations_fail_after_shutdown() {
        let net = InProcNetwork::new();
        let client = SomeIpClient::initialize("Test Service", Arc::new(net.endpoint())).unwrap();
        client.shutdown().unwrap();

        assert!(matches!(
            client.offer_service(4, 1),
            Err(SomeIpError::InvalidState { .. })
        ));
        assert!(matches!(
            client.send_event(4, 1, 0x8000, b"x"),
            Err(SomeIpError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_send_event_requires_offer() {
        let net = InProcNetwork::new();
        let client = SomeIpClient::initialize("Test Service", Arc::new(net.endpoint())).unwrap();
        assert!(matches!(
            client.send_event(4, 1, 0x8000, b"x"),
            Err(SomeIpError::NotOffered { .. })
        ));
        client.shutdown().unwrap();
    }

    #[test]
    fn test_send_response_without_pending_is_not_found() {
        let net = InProcNetwork::new();
        let client = SomeIpClient::initialize("Test Service", Arc::new(net.endpoint())).unwrap();
        assert!(matches!(
            client.send_response(0x0042_0007, b"late"),
            Err(SomeIpError::NotFound(0x0042_0007))
        ));
        client.shutdown().unwrap();
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let net = InProcNetwork::new();
        let config = ClientConfig {
            max_payload_len: 8,
            ..ClientConfig::default()
        };
        let client = SomeIpClient::initialize_with(
            "Test Service",
            Arc::new(net.endpoint()),
            Arc::new(NullDiscovery),
            config,
        )
        .unwrap();
        client.offer_event(4, 1, 0x8000, &[1]).unwrap();
        assert!(matches!(
            client.send_event(4, 1, 0x8000, &[0u8; 9]),
            Err(SomeIpError::Configuration(_))
        ));
        client.shutdown().unwrap();
    }
}
