//! Best-effort fan-out of event notifications.
//!
//! Delivery failures to one subscriber never block delivery to the others
//! and never surface to the `send_event` caller; they go through the
//! delivery-error callback (default: a warn log).

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use log::warn;

use crate::transport::Transport;

/// Called once per failed subscriber delivery.
pub type DeliveryErrorCallback = Arc<dyn Fn(SocketAddr, &io::Error) + Send + Sync>;

pub struct EventPublisher {
    transport: Arc<dyn Transport>,
    on_delivery_error: Mutex<Option<DeliveryErrorCallback>>,
}

impl EventPublisher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        EventPublisher {
            transport,
            on_delivery_error: Mutex::new(None),
        }
    }

    /// Replace the delivery-error callback.
    pub fn set_delivery_error_callback(&self, callback: DeliveryErrorCallback) {
        *self.on_delivery_error.lock().unwrap() = Some(callback);
    }

    /// Send `frame` to every target. Returns the number of successful sends.
    pub fn publish(&self, frame: &[u8], targets: &[SocketAddr]) -> usize {
        let mut delivered = 0;
        for target in targets {
            match self.transport.send(frame, *target) {
                Ok(_) => delivered += 1,
                Err(err) => self.report_failure(*target, &err),
            }
        }
        delivered
    }

    fn report_failure(&self, target: SocketAddr, err: &io::Error) {
        // Cloned out of the lock: the callback may replace itself or
        // publish again without deadlocking on this mutex.
        let callback = self.on_delivery_error.lock().unwrap().clone();
        match callback {
            Some(callback) => callback(target, err),
            None => warn!("event delivery to {target} failed: {err}"),
        }
    }
}
