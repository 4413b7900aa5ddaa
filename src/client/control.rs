//! Control channel over the encrypted handshake protocol
//!
//! Wraps a [`ControlTransport`] with bounded retries and the small set of
//! administrative commands the reconciliation loop needs: reachability
//! probing, paginated device listing, property reads and shell enablement.

use crate::client::{ControlTransport, TransportInfo};
use crate::error::{GatewayError, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Elevated retry count for the paging command; the hub drops it noticeably
/// more often than ordinary commands
const PAGED_LIST_RETRIES: u32 = 10;

/// Device stub returned by paginated discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStub {
    /// Stable device identity
    pub did: String,

    /// Hardware address derived from the identity
    pub mac: String,

    /// Hub-side product model
    pub model: String,
}

/// One entry of a `get_device_list` response page
#[derive(Debug, Deserialize)]
struct DeviceListItem {
    /// Hub-assigned slot number, stable across pages
    num: u64,
    did: String,
    model: String,
    /// Total device count, repeated in every entry
    total: u64,
}

/// Control channel with bounded-retry command dispatch
pub struct ControlChannel {
    transport: Arc<dyn ControlTransport>,
    retries: u32,
    page_cap: usize,
}

impl ControlChannel {
    /// Create a channel over the given transport
    pub fn new(transport: Arc<dyn ControlTransport>, retries: u32, page_cap: usize) -> Self {
        Self {
            transport,
            retries,
            page_cap,
        }
    }

    /// Lightweight reachability probe. Never fails; an unreachable gateway
    /// is an ordinary answer for the reconciliation loop.
    pub async fn probe(&self) -> bool {
        match self.transport.handshake().await {
            Ok(()) => true,
            Err(e) => {
                debug!("Control probe failed: {e}");
                false
            }
        }
    }

    /// Send one command, retrying up to `retries` times before failing
    pub async fn send_command(&self, name: &str, params: Value, retries: u32) -> Result<Value> {
        let mut last_error = None;

        for attempt in 1..=retries.max(1) {
            debug!("Control command '{name}' attempt {attempt}");

            match self.transport.send(name, params.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) => last_error = Some(e),
            }

            if attempt < retries {
                let delay = Duration::from_millis(100 * u64::from(attempt));
                tokio::time::sleep(delay).await;
            }
        }

        Err(last_error
            .unwrap_or_else(|| GatewayError::control(format!("Command '{name}' failed"))))
    }

    /// Send one command with the configured default retry count
    pub async fn send(&self, name: &str, params: Value) -> Result<Value> {
        self.send_command(name, params, self.retries).await
    }

    /// Query gateway identity
    pub async fn info(&self) -> Result<TransportInfo> {
        self.transport.info().await
    }

    /// Enumerate attached devices through the paginated listing command.
    ///
    /// The hub returns up to 8 devices per page and repeats the expected
    /// total in every entry. Pages are accumulated by slot number until the
    /// total is reached, bounded by the configured page cap. The cap is a
    /// loop-safety bound, not a protocol limit, so hitting it returns what
    /// accumulated so far rather than failing.
    pub async fn list_devices_paged(&self) -> Result<Vec<DeviceStub>> {
        let mut devices: BTreeMap<u64, DeviceStub> = BTreeMap::new();

        for _ in 0..self.page_cap {
            let page = self
                .send_command("get_device_list", Value::Array(Vec::new()), PAGED_LIST_RETRIES)
                .await?;

            let page: Vec<DeviceListItem> = serde_json::from_value(page)
                .map_err(|e| GatewayError::protocol(format!("Bad device list page: {e}")))?;

            let Some(first) = page.first() else {
                return Ok(Vec::new());
            };
            let total = first.total as usize;

            for item in page {
                let mac = mac_from_did(&item.did);
                devices.insert(
                    item.num,
                    DeviceStub {
                        did: item.did,
                        mac,
                        model: item.model,
                    },
                );
            }

            if devices.len() == total {
                break;
            }
        }

        Ok(devices.into_values().collect())
    }

    /// Ask the gateway to start its remote shell service. The response's
    /// first token carries the success marker.
    pub async fn enable_shell(&self) -> bool {
        match self
            .send_command("enable_telnet_service", Value::Array(Vec::new()), self.retries)
            .await
        {
            Ok(response) => {
                let ok = response
                    .get(0)
                    .and_then(Value::as_str)
                    .map(|token| token == "ok")
                    .unwrap_or(false);
                if !ok {
                    warn!("Shell enable rejected: {response}");
                }
                ok
            }
            Err(e) => {
                debug!("Shell enable failed: {e}");
                false
            }
        }
    }
}

/// Hardware address as the hub derives it from a device identity
fn mac_from_did(did: &str) -> String {
    format!("0x{}", did.strip_prefix("lumi.").unwrap_or(did))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_derivation_strips_prefix() {
        assert_eq!(mac_from_did("lumi.158d0002c81234"), "0x158d0002c81234");
        assert_eq!(mac_from_did("158d0002c81234"), "0x158d0002c81234");
    }
}
