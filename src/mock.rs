//! Mock implementations for testing
//!
//! Mock channels and external collaborators used by the crate's tests and
//! by embedding hosts that want to exercise their glue without a physical
//! gateway.

use crate::client::{
    BusHandler, BusPublisher, ControlTransport, MessageBus, ShellConnector, ShellRunner,
    TransportInfo,
};
use crate::discovery::BlobReader;
use crate::error::{GatewayError, Result};
use crate::services::device_registry::HUB_MODEL;
use crate::services::pipeline::BleDecoder;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Mock control transport with scripted per-command responses
pub struct MockTransport {
    reachable: AtomicBool,
    responses: Mutex<HashMap<String, VecDeque<Value>>>,
    info: TransportInfo,
    /// Every command sent, in order
    pub sent: Mutex<Vec<(String, Value)>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::with_identity(HUB_MODEL, "aa:bb:cc:dd:ee:ff")
    }

    pub fn with_identity(model: &str, mac: &str) -> Self {
        Self {
            reachable: AtomicBool::new(true),
            responses: Mutex::new(HashMap::new()),
            info: TransportInfo {
                model: model.to_string(),
                mac_address: mac.to_string(),
                fw_version: None,
            },
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Queue one response for a command; responses are consumed in order
    pub fn enqueue_response(&self, command: &str, response: Value) {
        self.responses
            .lock()
            .unwrap()
            .entry(command.to_string())
            .or_default()
            .push_back(response);
    }

    /// Number of times a command was sent
    pub fn sent_count(&self, command: &str) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == command)
            .count()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ControlTransport for MockTransport {
    async fn handshake(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(GatewayError::control("Mock gateway unreachable"))
        }
    }

    async fn send(&self, command: &str, params: Value) -> Result<Value> {
        self.sent
            .lock()
            .unwrap()
            .push((command.to_string(), params));

        self.responses
            .lock()
            .unwrap()
            .get_mut(command)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| GatewayError::control(format!("No scripted response for {command}")))
    }

    async fn info(&self) -> Result<TransportInfo> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(self.info.clone())
        } else {
            Err(GatewayError::control("Mock gateway unreachable"))
        }
    }
}

/// Mock shell session returning canned output per command
pub struct MockShell {
    outputs: HashMap<String, Vec<u8>>,
    commands: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl ShellRunner for MockShell {
    async fn run_and_capture(&mut self, command: &str) -> Result<Vec<u8>> {
        self.commands.lock().unwrap().push(command.to_string());
        self.outputs
            .get(command)
            .cloned()
            .ok_or_else(|| GatewayError::shell(format!("No scripted output for {command}")))
    }

    async fn run_fire_and_forget(&mut self, command: &str) -> Result<()> {
        self.commands.lock().unwrap().push(command.to_string());
        Ok(())
    }
}

/// Mock shell connector handing out [`MockShell`] sessions
pub struct MockShellConnector {
    outputs: Mutex<HashMap<String, Vec<u8>>>,
    available: AtomicBool,
    /// Every shell command run across all sessions, in order
    pub commands: Arc<Mutex<Vec<String>>>,
}

impl MockShellConnector {
    pub fn new() -> Self {
        Self {
            outputs: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            commands: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn set_output(&self, command: &str, output: &[u8]) {
        self.outputs
            .lock()
            .unwrap()
            .insert(command.to_string(), output.to_vec());
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

impl Default for MockShellConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ShellConnector for MockShellConnector {
    async fn open(&self) -> Result<Box<dyn ShellRunner>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(GatewayError::shell("Mock shell service not running"));
        }
        Ok(Box::new(MockShell {
            outputs: self.outputs.lock().unwrap().clone(),
            commands: self.commands.clone(),
        }))
    }
}

/// Outbound publish handle that records instead of sending
#[derive(Default)]
pub struct RecordingPublisher {
    pub published: Mutex<Vec<(String, Vec<u8>)>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payloads published to one topic
    pub fn payloads(&self, topic: &str) -> Vec<Vec<u8>> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

impl BusPublisher for RecordingPublisher {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
        Ok(())
    }
}

/// Mock message bus delivering scripted batches.
///
/// Each connect/run cycle pops one batch, delivers it to the handler and
/// then simulates a disconnect. When no batches remain the receive loop
/// parks forever, modelling a healthy idle connection.
pub struct MockBus {
    batches: Mutex<VecDeque<Vec<(String, Vec<u8>)>>>,
    connect_failures: AtomicUsize,
    publisher: Arc<RecordingPublisher>,
}

impl MockBus {
    pub fn new() -> Self {
        Self {
            batches: Mutex::new(VecDeque::new()),
            connect_failures: AtomicUsize::new(0),
            publisher: Arc::new(RecordingPublisher::new()),
        }
    }

    /// Queue one receive-loop batch; the loop disconnects after it
    pub fn enqueue_batch(&self, batch: Vec<(String, Vec<u8>)>) {
        self.batches.lock().unwrap().push_back(batch);
    }

    /// Fail the next `count` connect attempts
    pub fn fail_next_connects(&self, count: usize) {
        self.connect_failures.store(count, Ordering::SeqCst);
    }

    pub fn recorded(&self) -> Arc<RecordingPublisher> {
        self.publisher.clone()
    }
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for MockBus {
    async fn connect(&mut self) -> Result<()> {
        let remaining = self.connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.connect_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(GatewayError::bus("Mock broker refused connection"));
        }
        Ok(())
    }

    async fn run(&mut self, handler: &dyn BusHandler) -> Result<()> {
        let batch = self.batches.lock().unwrap().pop_front();

        match batch {
            Some(messages) => {
                for (topic, payload) in messages {
                    handler.handle(&topic, &payload).await;
                }
                Err(GatewayError::bus("Mock broker dropped the connection"))
            }
            None => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }

    fn publisher(&self) -> Arc<dyn BusPublisher> {
        self.publisher.clone()
    }
}

/// Mock database reader returning a fixed key-value map
pub struct MockBlobReader {
    entries: HashMap<String, String>,
}

impl MockBlobReader {
    pub fn new(entries: HashMap<String, String>) -> Self {
        Self { entries }
    }

    /// Reader for an empty database
    pub fn empty() -> Self {
        Self {
            entries: HashMap::from([("dev_list".to_string(), "[]".to_string())]),
        }
    }
}

impl BlobReader for MockBlobReader {
    fn read_all(&self, _raw: &[u8]) -> Result<HashMap<String, String>> {
        Ok(self.entries.clone())
    }
}

/// Mock Bluetooth decoder returning fixed measurements
pub struct MockBleDecoder {
    measurements: Option<HashMap<String, Value>>,
}

impl MockBleDecoder {
    pub fn new(measurements: Option<HashMap<String, Value>>) -> Self {
        Self { measurements }
    }

    /// Decoder that understands nothing
    pub fn unsupported() -> Self {
        Self { measurements: None }
    }
}

impl BleDecoder for MockBleDecoder {
    fn decode(&self, _event: &Value) -> Option<HashMap<String, Value>> {
        self.measurements.clone()
    }
}
