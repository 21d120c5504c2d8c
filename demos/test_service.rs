//! Example service: offers one method and one event, answers requests with
//! a canned payload and publishes ten numbered events two seconds apart.
//!
//! Everything runs over the in-process transport so the demo is
//! self-contained: a subscriber endpoint on the same network prints the
//! notifications it receives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{error, info};

use someip_core::{InProcNetwork, Message, Request, SomeIpClient, Transport};

const NAME: &str = "Test Service";
const SERVICE_ID: u16 = 4;
const INSTANCE_ID: u16 = 1;
const METHOD_ID: u16 = 1;
const EVENT_ID: u16 = 0x8000;
const EVENT_GROUP_ID: u16 = 1;

fn main() {
    env_logger::init();

    let network = InProcNetwork::new();

    let client = match SomeIpClient::initialize(NAME, Arc::new(network.endpoint())) {
        Ok(client) => client,
        Err(err) => {
            error!("failed to initialize SOME/IP: {err}");
            std::process::exit(1);
        }
    };

    let responder = client.responder();
    if let Err(err) = client.register_request_handler(
        SERVICE_ID,
        INSTANCE_ID,
        METHOD_ID,
        Arc::new(move |request: Request| {
            info!(
                "received request (method = {}), payload length = {}",
                request.method_id,
                request.payload.len()
            );
            // A real service would parse the request and act on it. This one
            // just sends back a canned response.
            if let Err(err) = responder.send_response(
                request.client_request_id,
                b"This is the response to the request",
            ) {
                error!("failed to send response: {err}");
            }
        }),
    ) {
        error!("failed to register request handler: {err}");
        let _ = client.shutdown();
        std::process::exit(1);
    }

    if let Err(err) = client.offer_event(SERVICE_ID, INSTANCE_ID, EVENT_ID, &[EVENT_GROUP_ID]) {
        error!("failed to offer event: {err}");
        let _ = client.shutdown();
        std::process::exit(1);
    }

    if let Err(err) = client.offer_service(SERVICE_ID, INSTANCE_ID) {
        error!("failed to offer service: {err}");
        let _ = client.shutdown();
        std::process::exit(1);
    }

    // A subscriber on the same network that prints every notification.
    let subscriber = network.endpoint();
    let subscriber_addr = subscriber.local_endpoint().unwrap();
    client
        .subscribe(EVENT_GROUP_ID, subscriber_addr)
        .expect("subscribe");
    thread::spawn(move || {
        let mut buffer = [0u8; 2048];
        loop {
            match subscriber.recv_timeout(&mut buffer, Duration::from_millis(200)) {
                Ok(Some((len, _))) => {
                    if let Ok(message) = Message::decode(&buffer[..len]) {
                        info!(
                            "subscriber got: {}",
                            String::from_utf8_lossy(&message.payload)
                        );
                    }
                }
                Ok(None) => {}
                Err(_) => break,
            }
        }
    });

    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);
    ctrlc::set_handler(move || stop_flag.store(true, Ordering::SeqCst))
        .expect("install signal handler");

    let num_events = 10;
    for i in 0..num_events {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        let payload = format!("Event Number {i}");
        if let Err(err) = client.send_event(SERVICE_ID, INSTANCE_ID, EVENT_ID, payload.as_bytes())
        {
            error!("failed to send event: {err}");
        }
        thread::sleep(Duration::from_secs(2));
    }

    if let Err(err) = client.shutdown() {
        error!("shutdown failed: {err}");
    }
}
