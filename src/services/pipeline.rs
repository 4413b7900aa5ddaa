//! Event pipeline: inbound normalization and outbound write mapping
//!
//! Inbound bus traffic arrives in three command envelope shapes plus relayed
//! Bluetooth advertisement log lines. All of them converge on one normalized
//! update format keyed by stable device identity, with wire names resolved
//! to canonical names and encoding fixups applied. The inverse path maps a
//! canonical write back to its wire name and publishes it.

use crate::catalog::{self, Catalog};
use crate::client::{BusHandler, BusPublisher};
use crate::config::DebugFlags;
use crate::error::{GatewayError, Result};
use crate::services::device_registry::{
    DeviceDescriptor, DeviceRecord, DeviceRegistry, NormalizedUpdate,
};
use crate::services::value_parsers::normalize_value;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Inbound topic carrying mesh command envelopes
pub const TOPIC_MESH_SEND: &str = "zigbee/send";

/// Outbound topic for write commands
pub const TOPIC_MESH_RECV: &str = "zigbee/recv";

/// Inbound topic carrying relayed Bluetooth log lines
pub const TOPIC_BT_LOG: &str = "log/bt";

/// Method name marking Bluetooth advertisement notifications in the relay
const BLE_EVENT_MARKER: &str = "_async.ble_event";

/// Synthetic property announcing a hub-initiated device addition
const ADDED_DEVICE: &str = "added_device";

/// External decoder for Bluetooth advertisement payloads
pub trait BleDecoder: Send + Sync {
    /// Decode one advertisement event into canonical measurements, or
    /// `None` for event types the decoder does not understand
    fn decode(&self, event: &Value) -> Option<HashMap<String, Value>>;
}

/// Command envelope shapes accepted on the mesh topic.
///
/// Anything else on the topic is a protocol violation: an unknown `cmd`
/// means a wire-format assumption has changed and must not be coerced.
#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum CommandEnvelope {
    Heartbeat {
        params: Vec<HeartbeatEntry>,
    },
    Report {
        did: String,
        params: Option<Vec<ResourceEntry>>,
        mi_spec: Option<Vec<ResourceEntry>>,
    },
    WriteRsp {
        did: String,
        results: Vec<ResourceEntry>,
    },
}

/// Heartbeats nest their resources one level deeper than reports
#[derive(Debug, Deserialize)]
struct HeartbeatEntry {
    did: String,
    res_list: Vec<ResourceEntry>,
}

/// One reported resource value
#[derive(Debug, Deserialize)]
struct ResourceEntry {
    res_name: Option<String>,
    siid: Option<i64>,
    piid: Option<i64>,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    error_code: i64,
}

impl ResourceEntry {
    /// The entry's wire name: `res_name`, or the dotted service/property
    /// identifier pair
    fn wire_name(&self) -> Result<String> {
        if let Some(name) = &self.res_name {
            return Ok(name.clone());
        }
        match (self.siid, self.piid) {
            (Some(siid), Some(piid)) => Ok(format!("{siid}.{piid}")),
            _ => Err(GatewayError::protocol(
                "Resource entry without res_name or siid/piid",
            )),
        }
    }
}

/// Descriptor carried by a hub-initiated device addition
#[derive(Debug, Deserialize)]
struct AddedDevice {
    did: String,
    mac: String,
    model: String,
    #[serde(default)]
    zb_ver: Option<String>,
}

#[derive(Debug, Serialize)]
struct WriteCommand<'a> {
    cmd: &'static str,
    did: &'a str,
    params: [WriteParam<'a>; 1],
}

#[derive(Debug, Serialize)]
struct WriteParam<'a> {
    res_name: &'a str,
    value: Value,
}

/// Normalizes inbound bus traffic and maps outbound writes
pub struct EventPipeline {
    registry: Arc<DeviceRegistry>,
    catalog: Arc<dyn Catalog>,
    decoder: Arc<dyn BleDecoder>,
    publisher: Arc<dyn BusPublisher>,
    debug: DebugFlags,
}

impl EventPipeline {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        catalog: Arc<dyn Catalog>,
        decoder: Arc<dyn BleDecoder>,
        publisher: Arc<dyn BusPublisher>,
        debug: DebugFlags,
    ) -> Self {
        Self {
            registry,
            catalog,
            decoder,
            publisher,
            debug,
        }
    }

    /// Process one mesh command envelope
    pub async fn handle_command(&self, payload: &[u8]) -> Result<()> {
        let envelope: CommandEnvelope = serde_json::from_slice(payload)
            .map_err(|e| GatewayError::protocol(format!("Bad command envelope: {e}")))?;

        let (did, entries) = match envelope {
            CommandEnvelope::Heartbeat { mut params } => {
                if params.len() != 1 {
                    return Err(GatewayError::protocol(format!(
                        "Heartbeat with {} elements",
                        params.len()
                    )));
                }
                let entry = params.remove(0);
                (entry.did, entry.res_list)
            }
            CommandEnvelope::Report {
                did,
                params,
                mi_spec,
            } => {
                let entries = params.or(mi_spec).ok_or_else(|| {
                    GatewayError::protocol("Report without params or mi_spec")
                })?;
                (did, entries)
            }
            CommandEnvelope::WriteRsp { did, results } => (did, results),
        };

        // nobody listens: skip resolution entirely
        if !self.registry.has_update_subscribers(&did) {
            return Ok(());
        }

        let device = self.registry.get(&did).ok_or_else(|| {
            GatewayError::protocol(format!("Update for unregistered device {did}"))
        })?;

        let mut properties = HashMap::new();
        for entry in entries {
            if entry.error_code != 0 {
                continue;
            }
            let wire = entry.wire_name()?;
            let name = resolve_name(&device, &wire);
            let value = normalize_value(&name, entry.value);
            properties.insert(name, value);
        }

        debug!("{} {} <= {properties:?}", device.did, device.model);

        let update = NormalizedUpdate {
            did: did.clone(),
            properties,
        };
        self.registry.apply_update(&did, &update.properties);
        for handler in self.registry.update_handlers(&did) {
            handler(&update);
        }

        if let Some(added) = update.properties.get(ADDED_DEVICE) {
            self.setup_added_device(added.clone()).await?;
        }

        Ok(())
    }

    /// Register a device the hub paired while the bus was live
    async fn setup_added_device(&self, value: Value) -> Result<()> {
        let added: AddedDevice = serde_json::from_value(value)
            .map_err(|e| GatewayError::protocol(format!("Bad added_device payload: {e}")))?;

        let descriptor = DeviceDescriptor {
            did: added.did,
            mac: format!("0x{}", added.mac),
            model: added.model,
            zb_version: added.zb_ver,
            init: HashMap::new(),
        };
        self.registry.setup_device(descriptor).await;

        Ok(())
    }

    /// Process one relayed Bluetooth log line
    pub async fn handle_bluetooth(&self, payload: &[u8]) -> Result<()> {
        let text = String::from_utf8_lossy(payload);

        // the relay forwards every BT log line; only advertisement
        // notifications matter here
        if !text.contains(BLE_EVENT_MARKER) {
            return Ok(());
        }

        let start = text.find('{').ok_or_else(|| {
            GatewayError::protocol("Bluetooth notification without a body")
        })?;
        let notification = first_json_value(&text[start..])
            .map_err(|e| GatewayError::protocol(format!("Bad Bluetooth notification: {e}")))?;
        let params = notification
            .get("params")
            .ok_or_else(|| GatewayError::protocol("Bluetooth notification without params"))?;

        debug!("Process BLE {params}");

        let device = params.get("dev");
        let did = device
            .and_then(|dev| dev.get("did"))
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::protocol("Bluetooth event without device id"))?;
        let mac = device
            .and_then(|dev| dev.get("mac"))
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::protocol("Bluetooth event without hardware address"))?;

        self.registry.ensure_ble_record(did, mac);

        let events = params
            .get("evt")
            .and_then(Value::as_array)
            .ok_or_else(|| GatewayError::protocol("Bluetooth event without evt list"))?;
        if events.len() != 1 {
            return Err(GatewayError::protocol(format!(
                "Bluetooth event with {} entries",
                events.len()
            )));
        }

        let Some(measurements) = self.decoder.decode(&events[0]) else {
            debug!("Unsupported BLE event: {params}");
            return Ok(());
        };

        for (name, value) in &measurements {
            if !self.registry.note_property(did, name, value) {
                continue;
            }
            let Some(domain) = self.catalog.ble_domain(name) else {
                continue;
            };
            // discovery and host registration are unordered; block until
            // the domain's setup hook exists
            let handler = self.registry.setups().wait_for(&domain).await;
            if let Some(record) = self.registry.get(did) {
                handler(&record, name);
            }
        }

        if self.registry.has_update_subscribers(did) {
            let update = NormalizedUpdate {
                did: did.to_string(),
                properties: measurements,
            };
            for handler in self.registry.update_handlers(did) {
                handler(&update);
            }
        }

        Ok(())
    }

    /// Map a canonical write back to its wire name and publish it
    pub fn send_write(&self, did: &str, canonical: &str, value: Value) -> Result<()> {
        let device = self
            .registry
            .get(did)
            .ok_or_else(|| GatewayError::not_found(format!("Unknown device {did}")))?;

        let wire = device
            .params
            .iter()
            .find(|param| param.canonical == canonical)
            .map(|param| param.wire.clone())
            .ok_or_else(|| {
                GatewayError::unknown_parameter(format!(
                    "{canonical} has no wire mapping on {}",
                    device.model
                ))
            })?;

        let command = WriteCommand {
            cmd: "write",
            did,
            params: [WriteParam {
                res_name: &wire,
                value,
            }],
        };

        debug!("{} {} => {command:?}", device.did, device.model);

        let payload = serde_json::to_vec(&command)?;
        self.publisher.publish(TOPIC_MESH_RECV, payload)
    }
}

#[async_trait]
impl BusHandler for EventPipeline {
    async fn handle(&self, topic: &str, payload: &[u8]) {
        if self.debug.mqtt {
            debug!("[MQ] {topic} {}", String::from_utf8_lossy(payload));
        }
        if self.debug.bluetooth && topic == TOPIC_BT_LOG {
            debug!("[BT] {}", String::from_utf8_lossy(payload));
        }

        let result = match topic {
            TOPIC_MESH_SEND => self.handle_command(payload).await,
            TOPIC_BT_LOG => self.handle_bluetooth(payload).await,
            _ => Ok(()),
        };

        // a bad message is dropped, never fatal to the worker
        if let Err(e) = result {
            warn!("Dropped message on {topic}: {e}");
        }
    }
}

/// Resolve a wire name to its canonical name: hub-global resources first,
/// then the device's parameter descriptors, falling back to the raw wire
/// name
fn resolve_name(device: &DeviceRecord, wire: &str) -> String {
    if let Some(name) = catalog::global_resource(wire) {
        return name.to_string();
    }
    device
        .params
        .iter()
        .find(|param| param.wire == wire)
        .map(|param| param.canonical.clone())
        .unwrap_or_else(|| wire.to_string())
}

/// Parse the first complete JSON value in `text`, ignoring trailing bytes
fn first_json_value(text: &str) -> std::result::Result<Value, serde_json::Error> {
    let mut stream = serde_json::Deserializer::from_str(text).into_iter::<Value>();
    match stream.next() {
        Some(value) => value,
        None => serde_json::from_str(""),
    }
}
