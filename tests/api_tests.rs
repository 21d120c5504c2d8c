//! End-to-end tests of the client facade over the in-process transport.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use someip_core::{
    ClientConfig, DiscoveryListener, InProcNetwork, InProcTransport, LifecycleState, Message,
    MessageType, NullDiscovery, Request, ReturnCode, SomeIpClient, SomeIpError, SomeIpHeader,
    Transport,
};

const SERVICE_ID: u16 = 4;
const INSTANCE_ID: u16 = 1;
const METHOD_ID: u16 = 1;
const EVENT_ID: u16 = 0x8000;
const EVENT_GROUP_ID: u16 = 1;

/// A raw protocol peer: sends hand-built frames and collects replies.
struct Peer {
    transport: InProcTransport,
}

impl Peer {
    fn new(network: &InProcNetwork) -> Self {
        Peer {
            transport: network.endpoint(),
        }
    }

    fn addr(&self) -> SocketAddr {
        self.transport.local_endpoint().unwrap()
    }

    fn send(&self, message: &Message, to: SocketAddr) {
        self.transport.send(&message.encode(), to).unwrap();
    }

    fn recv(&self) -> Option<Message> {
        let mut buffer = [0u8; 2048];
        match self
            .transport
            .recv_timeout(&mut buffer, Duration::from_secs(1))
            .unwrap()
        {
            Some((len, _)) => Some(Message::decode(&buffer[..len]).unwrap()),
            None => None,
        }
    }

    fn recv_nothing(&self, wait: Duration) -> bool {
        let mut buffer = [0u8; 2048];
        self.transport.recv_timeout(&mut buffer, wait).unwrap().is_none()
    }
}

fn request_message(session_id: u16, payload: &[u8]) -> Message {
    request_message_for(METHOD_ID, session_id, payload)
}

fn request_message_for(method_id: u16, session_id: u16, payload: &[u8]) -> Message {
    let header = SomeIpHeader::new(
        SERVICE_ID,
        method_id,
        0x0000,
        session_id,
        MessageType::Request,
        payload.len() as u32,
    );
    Message::new(header, payload.to_vec())
}

fn start_client(network: &InProcNetwork) -> (SomeIpClient, SocketAddr) {
    let transport = network.endpoint();
    let addr = transport.local_endpoint().unwrap();
    let client = SomeIpClient::initialize("Test Service", Arc::new(transport)).unwrap();
    (client, addr)
}

#[test]
fn test_request_response_scenario() {
    let network = InProcNetwork::new();
    let (client, client_addr) = start_client(&network);
    let peer = Peer::new(&network);

    client.offer_service(SERVICE_ID, INSTANCE_ID).unwrap();
    let responder = client.responder();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in_handler = Arc::clone(&seen);
    client
        .register_request_handler(
            SERVICE_ID,
            INSTANCE_ID,
            METHOD_ID,
            Arc::new(move |request: Request| {
                seen_in_handler.lock().unwrap().push(request.payload.clone());
                responder
                    .send_response(
                        request.client_request_id,
                        b"This is the response to the request",
                    )
                    .unwrap();
            }),
        )
        .unwrap();

    peer.send(&request_message(7, b"X"), client_addr);

    let response = peer.recv().expect("expected a response");
    assert_eq!(response.header.message_type, MessageType::Response);
    assert_eq!(response.header.request_id(), 7);
    assert_eq!(response.payload, b"This is the response to the request");
    assert_eq!(*seen.lock().unwrap(), vec![b"X".to_vec()]);

    // Exactly one response.
    assert!(peer.recv_nothing(Duration::from_millis(200)));

    client.shutdown().unwrap();
}

#[test]
fn test_unknown_method_yields_one_error_response() {
    let network = InProcNetwork::new();
    let (client, client_addr) = start_client(&network);
    let peer = Peer::new(&network);

    client.offer_service(SERVICE_ID, INSTANCE_ID).unwrap();
    peer.send(&request_message_for(99, 3, b"?"), client_addr);

    let reply = peer.recv().expect("expected an error response");
    assert_eq!(reply.header.message_type, MessageType::Error);
    assert_eq!(reply.header.return_code, ReturnCode::UnknownMethod as u8);
    assert_eq!(reply.header.session_id, 3);
    assert!(reply.payload.is_empty());

    assert!(peer.recv_nothing(Duration::from_millis(200)));

    client.shutdown().unwrap();
}

#[test]
fn test_last_registered_handler_wins() {
    let network = InProcNetwork::new();
    let (client, client_addr) = start_client(&network);
    let peer = Peer::new(&network);

    let first_hits = Arc::new(AtomicUsize::new(0));
    let second_hits = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&first_hits);
    let responder = client.responder();
    client
        .register_request_handler(
            SERVICE_ID,
            INSTANCE_ID,
            METHOD_ID,
            Arc::new(move |request: Request| {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = responder.send_response(request.client_request_id, b"first");
            }),
        )
        .unwrap();

    let counter = Arc::clone(&second_hits);
    let responder = client.responder();
    client
        .register_request_handler(
            SERVICE_ID,
            INSTANCE_ID,
            METHOD_ID,
            Arc::new(move |request: Request| {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = responder.send_response(request.client_request_id, b"second");
            }),
        )
        .unwrap();

    peer.send(&request_message(11, b"X"), client_addr);
    let reply = peer.recv().expect("expected a response");
    assert_eq!(reply.payload, b"second");
    assert_eq!(first_hits.load(Ordering::SeqCst), 0);
    assert_eq!(second_hits.load(Ordering::SeqCst), 1);

    client.shutdown().unwrap();
}

#[test]
fn test_ten_events_arrive_in_order() {
    let network = InProcNetwork::new();
    let (client, _) = start_client(&network);
    let subscriber = Peer::new(&network);

    client.offer_service(SERVICE_ID, INSTANCE_ID).unwrap();
    client
        .offer_event(SERVICE_ID, INSTANCE_ID, EVENT_ID, &[EVENT_GROUP_ID])
        .unwrap();
    client.subscribe(EVENT_GROUP_ID, subscriber.addr()).unwrap();

    for i in 0..10 {
        client
            .send_event(
                SERVICE_ID,
                INSTANCE_ID,
                EVENT_ID,
                format!("Event Number {i}").as_bytes(),
            )
            .unwrap();
    }

    for i in 0..10 {
        let notification = subscriber.recv().expect("missing notification");
        assert_eq!(notification.header.message_type, MessageType::Notification);
        assert_eq!(notification.header.method_id, EVENT_ID);
        assert_eq!(
            String::from_utf8(notification.payload).unwrap(),
            format!("Event Number {i}")
        );
    }

    client.shutdown().unwrap();
}

#[test]
fn test_event_without_subscribers_sends_nothing() {
    let network = InProcNetwork::new();
    let (client, _) = start_client(&network);
    let bystander = Peer::new(&network);

    client
        .offer_event(SERVICE_ID, INSTANCE_ID, EVENT_ID, &[EVENT_GROUP_ID])
        .unwrap();
    client
        .send_event(SERVICE_ID, INSTANCE_ID, EVENT_ID, b"nobody listens")
        .unwrap();

    assert!(bystander.recv_nothing(Duration::from_millis(200)));

    client.shutdown().unwrap();
}

#[test]
fn test_subscriber_in_two_groups_gets_event_once() {
    let network = InProcNetwork::new();
    let (client, _) = start_client(&network);
    let subscriber = Peer::new(&network);

    client
        .offer_event(SERVICE_ID, INSTANCE_ID, EVENT_ID, &[1, 2])
        .unwrap();
    client.subscribe(1, subscriber.addr()).unwrap();
    client.subscribe(2, subscriber.addr()).unwrap();

    client
        .send_event(SERVICE_ID, INSTANCE_ID, EVENT_ID, b"once")
        .unwrap();

    assert!(subscriber.recv().is_some());
    assert!(subscriber.recv_nothing(Duration::from_millis(200)));

    client.shutdown().unwrap();
}

/// Records discovery callbacks with the lifecycle state implied by order.
#[derive(Default)]
struct RecordingDiscovery {
    log: Mutex<Vec<String>>,
}

impl DiscoveryListener for RecordingDiscovery {
    fn service_offered(&self, service_id: u16, instance_id: u16) {
        self.log
            .lock()
            .unwrap()
            .push(format!("offer {service_id}/{instance_id}"));
    }
    fn service_withdrawn(&self, service_id: u16, instance_id: u16) {
        self.log
            .lock()
            .unwrap()
            .push(format!("withdraw {service_id}/{instance_id}"));
    }
    fn event_offered(&self, _: u16, _: u16, event_id: u16, groups: &[u16]) {
        self.log
            .lock()
            .unwrap()
            .push(format!("offer-event {event_id} {groups:?}"));
    }
    fn event_withdrawn(&self, _: u16, _: u16, event_id: u16) {
        self.log
            .lock()
            .unwrap()
            .push(format!("withdraw-event {event_id}"));
    }
}

#[test]
fn test_shutdown_withdraws_offers_before_stopped() {
    let network = InProcNetwork::new();
    let discovery = Arc::new(RecordingDiscovery::default());
    let client = SomeIpClient::initialize_with(
        "Test Service",
        Arc::new(network.endpoint()),
        Arc::clone(&discovery) as Arc<dyn DiscoveryListener>,
        ClientConfig::default(),
    )
    .unwrap();

    client.offer_service(SERVICE_ID, INSTANCE_ID).unwrap();
    client
        .offer_event(SERVICE_ID, INSTANCE_ID, EVENT_ID, &[EVENT_GROUP_ID])
        .unwrap();
    client.shutdown().unwrap();

    // By the time shutdown returns (Stopped observable) the withdrawals
    // have been announced.
    assert_eq!(client.state(), LifecycleState::Stopped);
    let log = discovery.log.lock().unwrap();
    assert!(log.contains(&format!("withdraw {SERVICE_ID}/{INSTANCE_ID}")));
    assert!(log.contains(&format!("withdraw-event {EVENT_ID}")));
}

#[test]
fn test_drop_of_last_handle_withdraws_offers() {
    let network = InProcNetwork::new();
    let discovery = Arc::new(RecordingDiscovery::default());
    let client = SomeIpClient::initialize_with(
        "Test Service",
        Arc::new(network.endpoint()),
        Arc::clone(&discovery) as Arc<dyn DiscoveryListener>,
        ClientConfig::default(),
    )
    .unwrap();

    client.offer_service(SERVICE_ID, INSTANCE_ID).unwrap();
    client
        .offer_event(SERVICE_ID, INSTANCE_ID, EVENT_ID, &[EVENT_GROUP_ID])
        .unwrap();
    drop(client);

    // Dropping the last handle runs the same shutdown path as an explicit
    // call. The dispatch thread may briefly hold the final strong reference,
    // so allow a moment for the withdrawals to land.
    let deadline = Instant::now() + Duration::from_secs(1);
    loop {
        {
            let log = discovery.log.lock().unwrap();
            if log.contains(&format!("withdraw {SERVICE_ID}/{INSTANCE_ID}"))
                && log.contains(&format!("withdraw-event {EVENT_ID}"))
            {
                break;
            }
        }
        assert!(
            Instant::now() < deadline,
            "dropping the client did not withdraw its offers"
        );
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_request_from_handler_fails_fast() {
    let network = InProcNetwork::new();
    let (client, client_addr) = start_client(&network);
    let peer = Peer::new(&network);
    let silent = Peer::new(&network);
    let silent_addr = silent.addr();

    let nested_result = Arc::new(Mutex::new(None));
    let recorded = Arc::clone(&nested_result);
    let requester = client.clone();
    let responder = client.responder();
    client
        .register_request_handler(
            SERVICE_ID,
            INSTANCE_ID,
            METHOD_ID,
            Arc::new(move |request: Request| {
                // Issuing a request from inside a handler would block the
                // thread that delivers its reply; it must fail immediately.
                let result =
                    requester.send_request(SERVICE_ID, METHOD_ID, b"nested", silent_addr);
                *recorded.lock().unwrap() = Some(result);
                responder
                    .send_response(request.client_request_id, b"done")
                    .unwrap();
            }),
        )
        .unwrap();

    peer.send(&request_message(21, b"X"), client_addr);

    // Peer::recv waits at most one second, well under the default request
    // timeout; the reply arriving proves the handler returned promptly.
    let reply = peer.recv().expect("handler should reply without waiting");
    assert_eq!(reply.payload, b"done");
    assert!(matches!(
        nested_result.lock().unwrap().take(),
        Some(Err(SomeIpError::InvalidState { .. }))
    ));

    client.shutdown().unwrap();
}

#[test]
fn test_no_dispatch_after_shutdown() {
    let network = InProcNetwork::new();
    let (client, client_addr) = start_client(&network);
    let peer = Peer::new(&network);

    let responder = client.responder();
    client
        .register_request_handler(
            SERVICE_ID,
            INSTANCE_ID,
            METHOD_ID,
            Arc::new(move |request: Request| {
                let _ = responder.send_response(request.client_request_id, b"alive");
            }),
        )
        .unwrap();
    client.shutdown().unwrap();

    peer.send(&request_message(5, b"X"), client_addr);
    assert!(peer.recv_nothing(Duration::from_millis(300)));
}

#[test]
fn test_request_between_two_clients() {
    let network = InProcNetwork::new();
    let (server, server_addr) = start_client(&network);
    let client_transport = network.endpoint();
    let client =
        SomeIpClient::initialize("Requester", Arc::new(client_transport)).unwrap();

    server.offer_service(SERVICE_ID, INSTANCE_ID).unwrap();
    let responder = server.responder();
    server
        .register_request_handler(
            SERVICE_ID,
            INSTANCE_ID,
            METHOD_ID,
            Arc::new(move |request: Request| {
                let mut reply = b"echo: ".to_vec();
                reply.extend_from_slice(&request.payload);
                responder.send_response(request.client_request_id, &reply).unwrap();
            }),
        )
        .unwrap();

    let reply = client
        .send_request(SERVICE_ID, METHOD_ID, b"ping", server_addr)
        .unwrap();
    assert_eq!(reply, b"echo: ping");

    client.shutdown().unwrap();
    server.shutdown().unwrap();
}

#[test]
fn test_request_times_out_without_responder() {
    let network = InProcNetwork::new();
    let silent = Peer::new(&network);

    let config = ClientConfig {
        request_timeout_ms: 100,
        sweep_interval_ms: 25,
        ..ClientConfig::default()
    };
    let client = SomeIpClient::initialize_with(
        "Requester",
        Arc::new(network.endpoint()),
        Arc::new(NullDiscovery),
        config,
    )
    .unwrap();

    let err = client
        .send_request(SERVICE_ID, METHOD_ID, b"anyone?", silent.addr())
        .unwrap_err();
    assert!(matches!(err, SomeIpError::TimedOut));

    client.shutdown().unwrap();
}

#[test]
fn test_unanswered_request_reported_as_timeout() {
    let network = InProcNetwork::new();
    let config = ClientConfig {
        request_timeout_ms: 100,
        sweep_interval_ms: 25,
        ..ClientConfig::default()
    };
    let transport = network.endpoint();
    let addr = transport.local_endpoint().unwrap();
    let client = SomeIpClient::initialize_with(
        "Test Service",
        Arc::new(transport),
        Arc::new(NullDiscovery),
        config,
    )
    .unwrap();
    let peer = Peer::new(&network);

    // Handler that never answers.
    client
        .register_request_handler(
            SERVICE_ID,
            INSTANCE_ID,
            METHOD_ID,
            Arc::new(|_request: Request| {}),
        )
        .unwrap();

    peer.send(&request_message(9, b"X"), addr);

    let reply = peer.recv().expect("expected a timeout error frame");
    assert_eq!(reply.header.message_type, MessageType::Error);
    assert_eq!(reply.header.return_code, ReturnCode::Timeout as u8);
    assert_eq!(reply.header.session_id, 9);

    client.shutdown().unwrap();
}

#[test]
fn test_malformed_frame_does_not_kill_dispatch() {
    let network = InProcNetwork::new();
    let (client, client_addr) = start_client(&network);
    let peer = Peer::new(&network);

    let responder = client.responder();
    client
        .register_request_handler(
            SERVICE_ID,
            INSTANCE_ID,
            METHOD_ID,
            Arc::new(move |request: Request| {
                responder.send_response(request.client_request_id, b"ok").unwrap();
            }),
        )
        .unwrap();

    // Garbage, then a valid request: dispatch must survive the garbage.
    peer.transport.send(&[0xFF; 7], client_addr).unwrap();
    peer.send(&request_message(13, b"X"), client_addr);

    let reply = peer.recv().expect("dispatch should still be alive");
    assert_eq!(reply.payload, b"ok");

    client.shutdown().unwrap();
}
