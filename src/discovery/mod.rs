//! Device discovery strategies
//!
//! Three structurally different procedures converge on the same output
//! contract, a list of [`DeviceDescriptor`]s: a live paginated query over
//! the control channel, a scrape of the gateway's JSON info files, and a
//! dump of its embedded key-value database. Which strategy runs, and in
//! what fallback order, is decided by the reconciliation loop, not here.

use crate::catalog::Catalog;
use crate::client::control::ControlChannel;
use crate::client::ShellRunner;
use crate::error::{GatewayError, Result};
use crate::services::device_registry::{DeviceDescriptor, HUB_DID, HUB_MODEL};
use crate::services::value_parsers::normalize_value;
use base64::Engine;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

const COORDINATOR_INFO_CMD: &str = "cat /data/zigbee/coordinator.info";
const DEVICE_INFO_CMD: &str = "cat /data/zigbee/device.info";
const DEVICE_DB_CMD: &str = "cat /data/zigbee_gw/zigbee_gw.db | base64";

/// External reader for the embedded key-value database format.
///
/// Must expose at least `dev_list` (JSON array of device ids) and, per id,
/// the `.model`, `.mac`, `.version` and `.prop` keys.
pub trait BlobReader: Send + Sync {
    fn read_all(&self, raw: &[u8]) -> Result<HashMap<String, String>>;
}

/// Mesh coordinator identity file
#[derive(Debug, Deserialize)]
struct CoordinatorInfo {
    mac: String,
}

/// Device info file: a list of mesh device entries
#[derive(Debug, Deserialize)]
struct DeviceInfoFile {
    #[serde(rename = "devInfo")]
    devices: Vec<DeviceInfoEntry>,
}

#[derive(Debug, Deserialize)]
struct DeviceInfoEntry {
    did: String,
    mac: String,
    model: String,
}

/// Retained-property blob stored per device in the database
#[derive(Debug, Deserialize)]
struct RetainedProps {
    props: HashMap<String, Value>,
}

/// Discovery strategy implementations
pub struct DiscoveryEngine {
    catalog: Arc<dyn Catalog>,
    blob_reader: Arc<dyn BlobReader>,
}

impl DiscoveryEngine {
    pub fn new(catalog: Arc<dyn Catalog>, blob_reader: Arc<dyn BlobReader>) -> Self {
        Self {
            catalog,
            blob_reader,
        }
    }

    /// Live strategy: paginated listing over the control channel, then a
    /// batched retained-property read per supported device. The gateway's
    /// own descriptor is appended from the control identity query.
    pub async fn live(&self, control: &ControlChannel) -> Result<Vec<DeviceDescriptor>> {
        let stubs = control.list_devices_paged().await?;
        let mut devices = Vec::with_capacity(stubs.len() + 1);

        for stub in stubs {
            let mut descriptor = DeviceDescriptor::bare(&stub.did, &stub.mac, &stub.model);

            // unknown models stay in the result without initial values;
            // registration filters them later
            if let Some(params) = self.catalog.parameter_spec(&stub.model) {
                let retained: Vec<(&str, &str)> = params
                    .iter()
                    .filter_map(|p| p.hub_key.as_deref().map(|key| (p.canonical.as_str(), key)))
                    .collect();

                if !retained.is_empty() {
                    let mut query = vec![Value::String(stub.did.clone())];
                    query.extend(
                        retained
                            .iter()
                            .map(|(_, key)| Value::String(key.to_string())),
                    );

                    let values = control.send("get_device_prop", Value::Array(query)).await?;
                    let values = values.as_array().ok_or_else(|| {
                        GatewayError::protocol("get_device_prop returned a non-list")
                    })?;

                    for ((canonical, _), value) in retained.iter().copied().zip(values.iter()) {
                        descriptor.init.insert(
                            canonical.to_string(),
                            normalize_value(canonical, value.clone()),
                        );
                    }
                }
            }

            devices.push(descriptor);
        }

        let info = control.info().await?;
        devices.push(DeviceDescriptor::bare(HUB_DID, &info.mac_address, &info.model));

        Ok(devices)
    }

    /// File strategy: scrape the coordinator and device info files. No
    /// per-device property values are available on this path.
    pub async fn from_info_files(
        &self,
        shell: &mut dyn ShellRunner,
    ) -> Result<Vec<DeviceDescriptor>> {
        let coordinator = read_coordinator(shell).await?;
        let mut devices = vec![DeviceDescriptor::bare(HUB_DID, &coordinator.mac, HUB_MODEL)];

        let raw = shell.run_and_capture(DEVICE_INFO_CMD).await?;
        let file: DeviceInfoFile = serde_json::from_slice(&raw)
            .map_err(|e| GatewayError::discovery(format!("Bad device info file: {e}")))?;

        devices.extend(
            file.devices
                .into_iter()
                .map(|entry| DeviceDescriptor::bare(&entry.did, &entry.mac, &entry.model)),
        );

        Ok(devices)
    }

    /// Database strategy: dump the embedded key-value database and rebuild
    /// descriptors with retained property values. Preferred on the current
    /// gateway generation. Models the catalog does not know are skipped,
    /// not failed.
    pub async fn from_database(
        &self,
        shell: &mut dyn ShellRunner,
    ) -> Result<Vec<DeviceDescriptor>> {
        let raw = shell.run_and_capture(DEVICE_DB_CMD).await?;
        let encoded: Vec<u8> = raw
            .iter()
            .copied()
            .filter(|byte| !byte.is_ascii_whitespace())
            .collect();
        let blob = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| GatewayError::discovery(format!("Bad database dump: {e}")))?;

        let data = self.blob_reader.read_all(&blob)?;

        let dev_list = data
            .get("dev_list")
            .ok_or_else(|| GatewayError::discovery("Database missing dev_list"))?;
        let dids: Vec<String> = serde_json::from_str(dev_list)
            .map_err(|e| GatewayError::discovery(format!("Bad dev_list: {e}")))?;

        let mut devices = Vec::with_capacity(dids.len() + 1);

        for did in dids {
            let model = db_value(&data, &did, "model")?;

            let Some(params) = self.catalog.parameter_spec(model) else {
                debug!("Unsupported model: {model}");
                continue;
            };

            let retained: RetainedProps = serde_json::from_str(db_value(&data, &did, "prop")?)
                .map_err(|e| GatewayError::discovery(format!("Bad prop blob for {did}: {e}")))?;

            let mut init = HashMap::new();
            for param in params.iter() {
                let Some(hub_key) = &param.hub_key else {
                    continue;
                };
                if let Some(value) = retained.props.get(hub_key) {
                    init.insert(
                        param.canonical.clone(),
                        normalize_value(&param.canonical, value.clone()),
                    );
                }
            }

            devices.push(DeviceDescriptor {
                mac: format!("0x{}", db_value(&data, &did, "mac")?),
                model: model.to_string(),
                zb_version: data.get(&format!("{did}.version")).cloned(),
                init,
                did,
            });
        }

        let coordinator = read_coordinator(shell).await?;
        devices.insert(
            0,
            DeviceDescriptor::bare(HUB_DID, &coordinator.mac, HUB_MODEL),
        );

        Ok(devices)
    }
}

async fn read_coordinator(shell: &mut dyn ShellRunner) -> Result<CoordinatorInfo> {
    let raw = shell.run_and_capture(COORDINATOR_INFO_CMD).await?;
    serde_json::from_slice(&raw)
        .map_err(|e| GatewayError::discovery(format!("Bad coordinator info: {e}")))
}

fn db_value<'a>(data: &'a HashMap<String, String>, did: &str, key: &str) -> Result<&'a str> {
    data.get(&format!("{did}.{key}"))
        .map(String::as_str)
        .ok_or_else(|| GatewayError::discovery(format!("Database missing {did}.{key}")))
}
