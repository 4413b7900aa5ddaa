//! Channel implementations for the three gateway protocols
//!
//! The gateway exposes three independent surfaces: an encrypted UDP
//! control/handshake protocol, a line-oriented remote shell, and a
//! publish/subscribe message bus. None of them is reliable on its own; the
//! reconciliation loop owns all reconnect decisions, so every channel here
//! reports failure explicitly instead of retrying in place.

pub mod bus;
pub mod control;
pub mod shell;

use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Identity reported by the control protocol's info query
#[derive(Debug, Clone)]
pub struct TransportInfo {
    /// Product model of the gateway itself
    pub model: String,

    /// Network interface hardware address (the Wi-Fi mac, not the mesh
    /// coordinator mac)
    pub mac_address: String,

    /// Firmware version, when reported
    pub fw_version: Option<String>,
}

/// Seam over the control protocol's handshake/encryption primitives.
///
/// The encrypted request/response framing lives outside this crate; the
/// embedding host supplies an implementation. `handshake` doubles as the
/// liveness probe.
#[async_trait]
pub trait ControlTransport: Send + Sync {
    /// Perform the handshake with the gateway
    async fn handshake(&self) -> Result<()>;

    /// Send one command and return its decoded response
    async fn send(&self, command: &str, params: Value) -> Result<Value>;

    /// Query gateway identity
    async fn info(&self) -> Result<TransportInfo>;
}

/// Inbound message handler attached to the bus receive loop
#[async_trait]
pub trait BusHandler: Send + Sync {
    /// Called once per inbound message
    async fn handle(&self, topic: &str, payload: &[u8]);
}

/// Outbound publish handle, safe to call from any thread while the receive
/// loop runs
pub trait BusPublisher: Send + Sync {
    /// Fire-and-forget publish
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
}

/// Seam over the message bus connection lifecycle.
///
/// `connect` and `run` are separate on purpose: the reconciliation loop
/// re-decides connectivity between a failed connect and the next attempt,
/// and a disconnect must end `run` rather than trigger an internal retry.
#[async_trait]
pub trait MessageBus: Send {
    /// Connect and subscribe to all topics
    async fn connect(&mut self) -> Result<()>;

    /// Block dispatching inbound messages until the connection drops.
    /// Always returns an error describing why the loop ended.
    async fn run(&mut self, handler: &dyn BusHandler) -> Result<()>;

    /// Outbound handle usable independently of the receive loop
    fn publisher(&self) -> Arc<dyn BusPublisher>;
}

/// Seam over a connected shell session
#[async_trait]
pub trait ShellRunner: Send {
    /// Run a command and capture everything it printed before the next
    /// prompt
    async fn run_and_capture(&mut self, command: &str) -> Result<Vec<u8>>;

    /// Run a command without waiting for a prompt, draining any immediate
    /// output
    async fn run_fire_and_forget(&mut self, command: &str) -> Result<()>;
}

/// Factory opening shell sessions on demand; each reconciliation pass uses a
/// fresh session
#[async_trait]
pub trait ShellConnector: Send + Sync {
    async fn open(&self) -> Result<Box<dyn ShellRunner>>;
}
