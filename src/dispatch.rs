//! Routing of inbound frames to registered handlers, plus offer state.
//!
//! [`DispatchCore`] is the locked heart of a client handle. It never touches
//! the transport itself: `dispatch_inbound` returns a [`Dispatch`] describing
//! what the caller must do after releasing the lock (invoke a handler, send a
//! reply, or nothing). That keeps handler invocation and socket writes
//! outside the lock, which is what makes `send_response`/`send_event` safe to
//! call from inside a handler.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::codec::{Message, MessageType, ReturnCode};
use crate::error::{DecodeError, SomeIpError};
use crate::session::{PendingRequest, SessionTable};

/// Lifecycle of a client handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Initializing,
    Running,
    ShuttingDown,
    Stopped,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Uninitialized => "Uninitialized",
            LifecycleState::Initializing => "Initializing",
            LifecycleState::Running => "Running",
            LifecycleState::ShuttingDown => "ShuttingDown",
            LifecycleState::Stopped => "Stopped",
        }
    }
}

/// The view of an inbound request handed to a handler.
#[derive(Debug, Clone)]
pub struct Request {
    pub client_request_id: u32,
    pub method_id: u16,
    pub payload: Vec<u8>,
}

/// Application-supplied request handler.
///
/// Invoked synchronously on the dispatch thread. The handler must call
/// `send_response` zero or one times; a request it never answers is expired
/// by the timeout sweep.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, request: Request);
}

impl<F> RequestHandler for F
where
    F: Fn(Request) + Send + Sync,
{
    fn handle(&self, request: Request) {
        self(request)
    }
}

/// What the caller must do after `dispatch_inbound` returns.
pub enum Dispatch {
    /// Invoke the handler outside the lock.
    Invoke {
        handler: Arc<dyn RequestHandler>,
        request: Request,
    },
    /// Send a synthesized reply (e.g. UnknownMethod).
    Reply {
        message: Message,
        destination: SocketAddr,
    },
    /// Nothing further; the frame was consumed or dropped.
    Absorbed,
}

struct EventOffer {
    groups: BTreeSet<u16>,
    next_notification_session: u16,
}

/// Per-handle dispatch state: lifecycle, registries and the session table.
pub struct DispatchCore {
    state: LifecycleState,
    handlers: HashMap<(u16, u16, u16), Arc<dyn RequestHandler>>,
    services: HashSet<(u16, u16)>,
    events: HashMap<(u16, u16, u16), EventOffer>,
    subscriptions: HashMap<u16, BTreeSet<SocketAddr>>,
    pub sessions: SessionTable,
}

impl DispatchCore {
    pub fn new(client_id: u16) -> Self {
        DispatchCore {
            state: LifecycleState::Uninitialized,
            handlers: HashMap::new(),
            services: HashSet::new(),
            events: HashMap::new(),
            subscriptions: HashMap::new(),
            sessions: SessionTable::new(client_id),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn begin_initializing(&mut self) {
        self.state = LifecycleState::Initializing;
    }

    pub fn mark_running(&mut self) {
        self.state = LifecycleState::Running;
    }

    /// Returns false when shutdown already happened (second call no-op).
    pub fn begin_shutdown(&mut self) -> bool {
        match self.state {
            LifecycleState::ShuttingDown | LifecycleState::Stopped => false,
            _ => {
                self.state = LifecycleState::ShuttingDown;
                true
            }
        }
    }

    pub fn mark_stopped(&mut self) {
        self.state = LifecycleState::Stopped;
    }

    pub fn ensure_running(&self, operation: &'static str) -> Result<(), SomeIpError> {
        if self.state == LifecycleState::Running {
            Ok(())
        } else {
            Err(SomeIpError::invalid_state(operation, self.state.as_str()))
        }
    }

    /// Register (or replace) the handler for a method. Registration is
    /// independent of `offer_service`; neither implies the other.
    pub fn register_request_handler(
        &mut self,
        service_id: u16,
        instance_id: u16,
        method_id: u16,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<(), SomeIpError> {
        self.ensure_running("register_request_handler")?;
        self.handlers
            .insert((service_id, instance_id, method_id), handler);
        Ok(())
    }

    /// Declare a provided service. Returns true when the offer is new, so
    /// the caller can announce it to discovery. Idempotent.
    pub fn offer_service(&mut self, service_id: u16, instance_id: u16) -> Result<bool, SomeIpError> {
        self.ensure_running("offer_service")?;
        Ok(self.services.insert((service_id, instance_id)))
    }

    /// Declare a provided event with its event-group membership.
    ///
    /// Idempotent for identical membership; different membership replaces
    /// the set. Returns the groups to announce to discovery, or None when
    /// nothing changed.
    pub fn offer_event(
        &mut self,
        service_id: u16,
        instance_id: u16,
        event_id: u16,
        event_groups: &[u16],
    ) -> Result<Option<Vec<u16>>, SomeIpError> {
        self.ensure_running("offer_event")?;
        let groups: BTreeSet<u16> = event_groups.iter().copied().collect();
        let key = (service_id, instance_id, event_id);
        match self.events.get_mut(&key) {
            Some(existing) if existing.groups == groups => Ok(None),
            Some(existing) => {
                existing.groups = groups.clone();
                Ok(Some(groups.into_iter().collect()))
            }
            None => {
                self.events.insert(
                    key,
                    EventOffer {
                        groups: groups.clone(),
                        next_notification_session: 1,
                    },
                );
                Ok(Some(groups.into_iter().collect()))
            }
        }
    }

    /// Record a subscriber for an event group. Fed by the external service
    /// discovery collaborator.
    pub fn subscribe(&mut self, event_group_id: u16, subscriber: SocketAddr) -> Result<(), SomeIpError> {
        self.ensure_running("subscribe")?;
        self.subscriptions
            .entry(event_group_id)
            .or_default()
            .insert(subscriber);
        Ok(())
    }

    pub fn unsubscribe(
        &mut self,
        event_group_id: u16,
        subscriber: SocketAddr,
    ) -> Result<(), SomeIpError> {
        self.ensure_running("unsubscribe")?;
        if let Some(set) = self.subscriptions.get_mut(&event_group_id) {
            set.remove(&subscriber);
            if set.is_empty() {
                self.subscriptions.remove(&event_group_id);
            }
        }
        Ok(())
    }

    /// Resolve an event offer for publishing: checks it exists, bumps its
    /// notification session id and returns the deduplicated subscriber set
    /// across all its groups.
    pub fn prepare_event(
        &mut self,
        service_id: u16,
        instance_id: u16,
        event_id: u16,
    ) -> Result<(u16, Vec<SocketAddr>), SomeIpError> {
        self.ensure_running("send_event")?;
        let offer = self
            .events
            .get_mut(&(service_id, instance_id, event_id))
            .ok_or(SomeIpError::NotOffered {
                service_id,
                instance_id,
                event_id,
            })?;

        let session_id = offer.next_notification_session;
        offer.next_notification_session = if session_id == u16::MAX { 1 } else { session_id + 1 };

        // BTreeSet per group keeps the fan-out deterministic; collecting
        // through one set deduplicates subscribers that joined several of
        // the event's groups.
        let mut targets = BTreeSet::new();
        for group in &offer.groups {
            if let Some(subscribers) = self.subscriptions.get(group) {
                targets.extend(subscribers.iter().copied());
            }
        }
        Ok((session_id, targets.into_iter().collect()))
    }

    /// Route one inbound frame. Returns what to do after unlocking.
    pub fn dispatch_inbound(
        &mut self,
        frame: &[u8],
        source: SocketAddr,
        now: Instant,
    ) -> Result<Dispatch, DecodeError> {
        if self.state != LifecycleState::Running {
            debug!(
                "dropping inbound frame in state {}",
                self.state.as_str()
            );
            return Ok(Dispatch::Absorbed);
        }

        let Message { header, payload } = Message::decode(frame)?;

        match header.message_type {
            MessageType::Response => {
                if let Err(err) = self.sessions.resolve(header.request_id(), Ok(payload)) {
                    // Stale, duplicate or spoofed response. Never fatal.
                    warn!("discarding response with no matching request: {err}");
                }
                Ok(Dispatch::Absorbed)
            }
            MessageType::Error => {
                if let Err(err) = self
                    .sessions
                    .resolve(header.request_id(), Err(SomeIpError::Remote(header.return_code)))
                {
                    warn!("discarding error frame with no matching request: {err}");
                }
                Ok(Dispatch::Absorbed)
            }
            MessageType::Notification => {
                info!(
                    "received notification: service 0x{:04x} event 0x{:04x} payload {} bytes",
                    header.service_id,
                    header.method_id,
                    payload.len()
                );
                Ok(Dispatch::Absorbed)
            }
            MessageType::Request | MessageType::RequestNoReturn => {
                let Some(handler) = self.find_handler(header.service_id, header.method_id) else {
                    if header.message_type == MessageType::Request {
                        // Exactly one error response per unhandled request.
                        return Ok(Dispatch::Reply {
                            message: Message::error_to(&header, ReturnCode::UnknownMethod),
                            destination: source,
                        });
                    }
                    debug!(
                        "no handler for fire-and-forget request 0x{:04x}/0x{:04x}",
                        header.service_id, header.method_id
                    );
                    return Ok(Dispatch::Absorbed);
                };

                let request = Request {
                    client_request_id: header.request_id(),
                    method_id: header.method_id,
                    payload,
                };

                if header.message_type == MessageType::Request {
                    let pending = PendingRequest {
                        client_request_id: header.request_id(),
                        session_id: header.session_id,
                        service_id: header.service_id,
                        method_id: header.method_id,
                        interface_version: header.interface_version,
                        arrival: now,
                        source,
                    };
                    if let Err(err) = self.sessions.register_pending(pending) {
                        warn!("dropping request: {err}");
                        return Ok(Dispatch::Absorbed);
                    }
                }

                Ok(Dispatch::Invoke { handler, request })
            }
        }
    }

    /// The instance is implied by this handle's single transport binding:
    /// prefer a registration whose (service, instance) is offered, fall back
    /// to any registration for the method.
    fn find_handler(&self, service_id: u16, method_id: u16) -> Option<Arc<dyn RequestHandler>> {
        let mut fallback = None;
        for ((sid, iid, mid), handler) in &self.handlers {
            if *sid == service_id && *mid == method_id {
                if self.services.contains(&(*sid, *iid)) {
                    return Some(Arc::clone(handler));
                }
                fallback = Some(Arc::clone(handler));
            }
        }
        fallback
    }

    /// Expire stale session entries. Returns timed-out inbound requests so
    /// the caller can answer them with a Timeout error frame.
    pub fn sweep(&mut self, now: Instant, timeout: Duration) -> Vec<PendingRequest> {
        self.sessions.sweep(now, timeout)
    }

    /// Drop all offers, returning what was withdrawn so the caller can
    /// notify discovery. Used by shutdown.
    pub fn withdraw_all(&mut self) -> (Vec<(u16, u16)>, Vec<(u16, u16, u16)>) {
        let services: Vec<_> = self.services.drain().collect();
        let events: Vec<_> = self.events.drain().map(|(key, _)| key).collect();
        self.subscriptions.clear();
        (services, events)
    }
}
