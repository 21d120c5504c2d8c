//! Transport boundary.
//!
//! The engine treats transport as an external collaborator: unreliable,
//! unordered across destinations, ordered per connection. Real deployments
//! plug in a UDP or TCP binding; tests and demos use [`InProcNetwork`].

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Trait representing a SOME/IP transport channel.
/// Designed to be object-safe and pluggable (e.g. for mocking).
pub trait Transport: Send + Sync {
    /// Send a frame to `destination`. Fire-and-forget; failures are surfaced
    /// to the caller, who decides whether they are fatal.
    fn send(&self, data: &[u8], destination: SocketAddr) -> io::Result<usize>;

    /// Wait up to `timeout` for one inbound frame. `Ok(None)` means the
    /// timeout elapsed with nothing to read, so the dispatch loop can check
    /// its shutdown flag.
    fn recv_timeout(
        &self,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> io::Result<Option<(usize, SocketAddr)>>;

    /// The local endpoint this transport is bound to.
    fn local_endpoint(&self) -> io::Result<SocketAddr>;
}

type Frame = (Vec<u8>, SocketAddr);

struct NetworkInner {
    links: HashMap<SocketAddr, Sender<Frame>>,
    next_port: u16,
}

/// An in-process message switch connecting [`InProcTransport`] endpoints.
///
/// Each endpoint gets a synthetic loopback address; frames sent to a known
/// address are delivered in order, frames to an unknown address fail with
/// `NotConnected` (the best-effort paths absorb that).
#[derive(Clone)]
pub struct InProcNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

impl InProcNetwork {
    pub fn new() -> Self {
        InProcNetwork {
            inner: Arc::new(Mutex::new(NetworkInner {
                links: HashMap::new(),
                next_port: 30500,
            })),
        }
    }

    /// Allocate a new endpoint on this network.
    pub fn endpoint(&self) -> InProcTransport {
        let (tx, rx) = mpsc::channel();
        let mut inner = self.inner.lock().unwrap();
        let local = SocketAddr::from((Ipv4Addr::LOCALHOST, inner.next_port));
        inner.next_port += 1;
        inner.links.insert(local, tx.clone());
        InProcTransport {
            local,
            network: Arc::clone(&self.inner),
            rx: Mutex::new(rx),
            _keepalive: tx,
        }
    }

    /// Drop the link for `endpoint`, making subsequent sends to it fail.
    /// Used to simulate an unreachable subscriber.
    pub fn disconnect(&self, endpoint: SocketAddr) {
        self.inner.lock().unwrap().links.remove(&endpoint);
    }
}

impl Default for InProcNetwork {
    fn default() -> Self {
        Self::new()
    }
}

pub struct InProcTransport {
    local: SocketAddr,
    network: Arc<Mutex<NetworkInner>>,
    rx: Mutex<Receiver<Frame>>,
    // Keeps our own receiver alive even if the network drops the link.
    _keepalive: Sender<Frame>,
}

impl Transport for InProcTransport {
    fn send(&self, data: &[u8], destination: SocketAddr) -> io::Result<usize> {
        let tx = {
            let inner = self.network.lock().unwrap();
            inner.links.get(&destination).cloned()
        };
        match tx {
            Some(tx) => {
                tx.send((data.to_vec(), self.local)).map_err(|_| {
                    io::Error::new(io::ErrorKind::NotConnected, "endpoint closed")
                })?;
                Ok(data.len())
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("no endpoint at {destination}"),
            )),
        }
    }

    fn recv_timeout(
        &self,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> io::Result<Option<(usize, SocketAddr)>> {
        let rx = self.rx.lock().unwrap();
        match rx.recv_timeout(timeout) {
            Ok((data, source)) => {
                // Datagram semantics: anything beyond the buffer is cut off.
                let len = data.len().min(buffer.len());
                buffer[..len].copy_from_slice(&data[..len]);
                Ok(Some((len, source)))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "transport channel closed",
            )),
        }
    }

    fn local_endpoint(&self) -> io::Result<SocketAddr> {
        Ok(self.local)
    }
}
