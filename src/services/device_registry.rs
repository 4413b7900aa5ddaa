//! In-memory device registry and subscription management
//!
//! The registry owns every DeviceRecord for the lifetime of a run. Records
//! are created by discovery (or lazily on the first Bluetooth sighting),
//! mutated in place by property updates, and never removed; absence of
//! updates is not removal.
//!
//! Update subscriptions and setup hooks are registered from caller threads
//! while the worker mutates records, so the maps live behind short-lived
//! sync locks that are never held across an await point.

use crate::catalog::{Catalog, ParameterSpec};
use crate::config::DeviceOverride;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Notify;
use tracing::debug;

/// Device identity the hub uses for itself
pub const HUB_DID: &str = "lumi.0";

/// Product model of the supported gateway generation
pub const HUB_MODEL: &str = "lumi.gateway.mgl03";

/// Device descriptor produced by discovery
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceDescriptor {
    /// Stable device identity
    pub did: String,

    /// Hardware address, hex-prefixed for mesh devices
    pub mac: String,

    /// Hub-side product model
    pub model: String,

    /// Mesh protocol revision, when the hub reports one
    pub zb_version: Option<String>,

    /// Initial property values keyed by canonical name
    pub init: HashMap<String, Value>,
}

impl DeviceDescriptor {
    /// Descriptor without initial values, the shape produced by stub-only
    /// discovery paths
    pub fn bare(did: &str, mac: &str, model: &str) -> Self {
        Self {
            did: did.to_string(),
            mac: mac.to_string(),
            model: model.to_string(),
            zb_version: None,
            init: HashMap::new(),
        }
    }
}

/// A registered device: descriptor merged with live state
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub did: String,
    pub mac: String,

    /// Hub-side product model; empty for lazily-created Bluetooth records,
    /// which the hub never names
    pub model: String,

    pub zb_version: Option<String>,

    /// Display name, set for Bluetooth records
    pub device_name: Option<String>,

    /// Parameter descriptors from the catalog; empty for Bluetooth records
    pub params: ParameterSpec,

    /// Last-known property values keyed by canonical name
    pub properties: HashMap<String, Value>,
}

/// Normalized state update dispatched to subscribers
#[derive(Debug, Clone)]
pub struct NormalizedUpdate {
    pub did: String,

    /// Canonical name to value, fixups already applied
    pub properties: HashMap<String, Value>,
}

/// Per-device update subscriber
pub type UpdateHandler = Arc<dyn Fn(&NormalizedUpdate) + Send + Sync>;

/// Host-side entity setup hook, called once per (device, property) pair
pub type SetupHandler = Arc<dyn Fn(&DeviceRecord, &str) + Send + Sync>;

/// Domain-keyed setup hooks with a wakeup signal.
///
/// Discovery and host handler registration are not ordered; setup waits on
/// the signal instead of polling until the needed domain appears.
pub struct SetupRegistry {
    handlers: Mutex<HashMap<String, SetupHandler>>,
    changed: Notify,
}

impl SetupRegistry {
    fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            changed: Notify::new(),
        }
    }

    /// Register the setup hook for a domain
    pub fn register(&self, domain: &str, handler: SetupHandler) {
        self.handlers
            .lock()
            .unwrap()
            .insert(domain.to_string(), handler);
        self.changed.notify_waiters();
    }

    /// Current hook for a domain, if registered
    pub fn get(&self, domain: &str) -> Option<SetupHandler> {
        self.handlers.lock().unwrap().get(domain).cloned()
    }

    /// Wait until the domain's hook is registered
    pub async fn wait_for(&self, domain: &str) -> SetupHandler {
        loop {
            let changed = self.changed.notified();
            if let Some(handler) = self.get(domain) {
                return handler;
            }
            changed.await;
        }
    }
}

/// Registry of known devices and their subscribers
pub struct DeviceRegistry {
    catalog: Arc<dyn Catalog>,
    overrides: HashMap<String, DeviceOverride>,
    devices: RwLock<HashMap<String, DeviceRecord>>,
    updates: RwLock<HashMap<String, Vec<UpdateHandler>>>,
    setups: SetupRegistry,
}

impl DeviceRegistry {
    pub fn new(catalog: Arc<dyn Catalog>, overrides: HashMap<String, DeviceOverride>) -> Self {
        Self {
            catalog,
            overrides,
            devices: RwLock::new(HashMap::new()),
            updates: RwLock::new(HashMap::new()),
            setups: SetupRegistry::new(),
        }
    }

    pub fn contains(&self, did: &str) -> bool {
        self.devices.read().unwrap().contains_key(did)
    }

    /// Snapshot of a record
    pub fn get(&self, did: &str) -> Option<DeviceRecord> {
        self.devices.read().unwrap().get(did).cloned()
    }

    /// The gateway's own record, present once bootstrap finished
    pub fn hub(&self) -> Option<DeviceRecord> {
        self.get(HUB_DID)
    }

    pub fn len(&self) -> usize {
        self.devices.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().unwrap().is_empty()
    }

    /// Subscribe to a device's normalized updates. Handlers run in
    /// registration order.
    pub fn add_update(&self, did: &str, handler: UpdateHandler) {
        self.updates
            .write()
            .unwrap()
            .entry(did.to_string())
            .or_default()
            .push(handler);
    }

    /// Whether anyone subscribed to this device
    pub fn has_update_subscribers(&self, did: &str) -> bool {
        self.updates
            .read()
            .unwrap()
            .get(did)
            .is_some_and(|handlers| !handlers.is_empty())
    }

    /// Snapshot of a device's subscribers, in registration order
    pub fn update_handlers(&self, did: &str) -> Vec<UpdateHandler> {
        self.updates
            .read()
            .unwrap()
            .get(did)
            .cloned()
            .unwrap_or_default()
    }

    /// Register a host setup hook for an entity domain
    pub fn add_setup(&self, domain: &str, handler: SetupHandler) {
        self.setups.register(domain, handler);
    }

    pub fn setups(&self) -> &SetupRegistry {
        &self.setups
    }

    /// Register all discovered devices
    pub async fn setup_devices(&self, descriptors: Vec<DeviceDescriptor>) {
        for descriptor in descriptors {
            self.setup_device(descriptor).await;
        }
    }

    /// Register one discovered device: merge the catalog descriptor and any
    /// per-device override, store the record, and run the host setup hook
    /// for every parameter with an entity domain. Returns false for models
    /// the catalog does not know.
    pub async fn setup_device(&self, descriptor: DeviceDescriptor) -> bool {
        let Some(params) = self.catalog.parameter_spec(&descriptor.model) else {
            debug!(
                "Unsupported model {} for device {}",
                descriptor.model, descriptor.did
            );
            return false;
        };

        debug!("Setup device {} ({})", descriptor.did, descriptor.model);

        let mut record = DeviceRecord {
            did: descriptor.did,
            mac: descriptor.mac,
            model: descriptor.model,
            zb_version: descriptor.zb_version,
            device_name: None,
            params: params.clone(),
            properties: descriptor.init,
        };

        if let Some(overrides) = self.overrides.get(&record.mac) {
            for (name, value) in overrides {
                record.properties.insert(name.clone(), value.clone());
            }
        }

        self.devices
            .write()
            .unwrap()
            .insert(record.did.clone(), record.clone());

        for param in params.iter() {
            let Some(domain) = &param.domain else {
                continue;
            };
            let handler = self.setups.wait_for(domain).await;
            handler(&record, &param.canonical);
        }

        true
    }

    /// Record for a Bluetooth device, created on first sighting
    pub fn ensure_ble_record(&self, did: &str, mac: &str) -> DeviceRecord {
        let mut devices = self.devices.write().unwrap();
        devices
            .entry(did.to_string())
            .or_insert_with(|| {
                debug!("First sighting of Bluetooth device {did}");
                DeviceRecord {
                    did: did.to_string(),
                    mac: mac.replace(':', "").to_lowercase(),
                    model: String::new(),
                    zb_version: None,
                    device_name: Some("BLE".to_string()),
                    params: Arc::from(Vec::new()),
                    properties: HashMap::new(),
                }
            })
            .clone()
    }

    /// Record a property value; returns true when the key was not seen
    /// before on this device
    pub fn note_property(&self, did: &str, name: &str, value: &Value) -> bool {
        let mut devices = self.devices.write().unwrap();
        let Some(record) = devices.get_mut(did) else {
            return false;
        };

        if record.properties.contains_key(name) {
            false
        } else {
            record.properties.insert(name.to_string(), value.clone());
            true
        }
    }

    /// Merge an update's values into the device's live state
    pub fn apply_update(&self, did: &str, properties: &HashMap<String, Value>) {
        let mut devices = self.devices.write().unwrap();
        if let Some(record) = devices.get_mut(did) {
            for (name, value) in properties {
                record.properties.insert(name.clone(), value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ParamSpec, StaticCatalog};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_catalog() -> Arc<StaticCatalog> {
        Arc::new(StaticCatalog::new().with_model(
            "lumi.sensor_ht",
            vec![
                ParamSpec::new("0.1.85", Some("temperature"), "temperature", Some("sensor")),
                ParamSpec::new("0.2.85", Some("humidity"), "humidity", Some("sensor")),
            ],
        ))
    }

    #[tokio::test]
    async fn setup_registers_record_and_runs_hooks() {
        let registry = DeviceRegistry::new(test_catalog(), HashMap::new());

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        registry.add_setup(
            "sensor",
            Arc::new(move |record, attr| {
                assert_eq!(record.did, "lumi.1");
                assert!(attr == "temperature" || attr == "humidity");
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let registered = registry
            .setup_device(DeviceDescriptor::bare("lumi.1", "0x1", "lumi.sensor_ht"))
            .await;

        assert!(registered);
        assert!(registry.contains("lumi.1"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unsupported_model_is_skipped() {
        let registry = DeviceRegistry::new(test_catalog(), HashMap::new());
        let registered = registry
            .setup_device(DeviceDescriptor::bare("lumi.2", "0x2", "lumi.mystery"))
            .await;
        assert!(!registered);
        assert!(!registry.contains("lumi.2"));
    }

    #[tokio::test]
    async fn overrides_merge_by_mac() {
        let mut overrides = HashMap::new();
        overrides.insert(
            "0x1".to_string(),
            HashMap::from([("occupancy_timeout".to_string(), json!(120))]),
        );
        let registry = DeviceRegistry::new(test_catalog(), overrides);
        registry.add_setup("sensor", Arc::new(|_, _| {}));

        registry
            .setup_device(DeviceDescriptor::bare("lumi.1", "0x1", "lumi.sensor_ht"))
            .await;

        let record = registry.get("lumi.1").unwrap();
        assert_eq!(record.properties["occupancy_timeout"], json!(120));
    }

    #[test]
    fn ble_records_are_created_once() {
        let registry = DeviceRegistry::new(test_catalog(), HashMap::new());

        let record = registry.ensure_ble_record("blt.3.abc", "A4:C1:38:00:11:22");
        assert_eq!(record.mac, "a4c138001122");
        assert_eq!(record.device_name.as_deref(), Some("BLE"));

        assert!(registry.note_property("blt.3.abc", "temperature", &json!(21.5)));
        assert!(!registry.note_property("blt.3.abc", "temperature", &json!(22.0)));

        // a second sighting reuses the record with its noted properties
        let record = registry.ensure_ble_record("blt.3.abc", "A4:C1:38:00:11:22");
        assert!(record.properties.contains_key("temperature"));
    }
}
