use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::SomeIpError;

/// Per-client tuning knobs.
/// All timing values are in milliseconds unless otherwise specified.
#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    /// Fixed client id. If absent one is derived from the client name.
    #[serde(default)]
    pub client_id: Option<u16>,
    /// Deadline for a pending request before it is timed out (ms, default: 2000)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    /// Interval between timeout sweeps of the session table (ms, default: 250)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
    /// How long the dispatch thread blocks on the transport per iteration
    /// (ms, default: 20). Bounds shutdown latency.
    #[serde(default = "default_recv_poll")]
    pub recv_poll_ms: u64,
    /// How long `shutdown` waits for the dispatch thread to drain (ms, default: 1000)
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_ms: u64,
    /// Largest accepted payload in bytes (default: 1400, one UDP datagram)
    #[serde(default = "default_max_payload_len")]
    pub max_payload_len: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            client_id: None,
            request_timeout_ms: default_request_timeout(),
            sweep_interval_ms: default_sweep_interval(),
            recv_poll_ms: default_recv_poll(),
            drain_timeout_ms: default_drain_timeout(),
            max_payload_len: default_max_payload_len(),
        }
    }
}

fn default_request_timeout() -> u64 { 2000 }
fn default_sweep_interval() -> u64 { 250 }
fn default_recv_poll() -> u64 { 20 }
fn default_drain_timeout() -> u64 { 1000 }
fn default_max_payload_len() -> usize { 1400 }

impl ClientConfig {
    /// Load a config from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SomeIpError> {
        let file = File::open(path.as_ref())
            .map_err(|e| SomeIpError::Configuration(format!("cannot open config: {e}")))?;
        let reader = BufReader::new(file);
        let config: ClientConfig = serde_json::from_reader(reader)
            .map_err(|e| SomeIpError::Configuration(format!("cannot parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SomeIpError> {
        if self.client_id == Some(0) {
            return Err(SomeIpError::Configuration(
                "client_id 0 is reserved".into(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(SomeIpError::Configuration(
                "request_timeout_ms must be non-zero".into(),
            ));
        }
        if self.recv_poll_ms == 0 {
            return Err(SomeIpError::Configuration(
                "recv_poll_ms must be non-zero".into(),
            ));
        }
        if self.max_payload_len == 0 {
            return Err(SomeIpError::Configuration(
                "max_payload_len must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn recv_poll(&self) -> Duration {
        Duration::from_millis(self.recv_poll_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}
