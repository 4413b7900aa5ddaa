//! Configuration for the gateway worker

use crate::error::{GatewayError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::{env, time::Duration};

/// Per-device overrides merged into the matching device record at setup
/// time, keyed by hardware address
pub type DeviceOverride = HashMap<String, Value>;

/// Raw-traffic debug flags
#[derive(Debug, Clone, Default)]
pub struct DebugFlags {
    /// Log every inbound bus message at debug level
    pub mqtt: bool,

    /// Log every Bluetooth relay line at debug level
    pub bluetooth: bool,
}

/// Gateway connection configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Gateway host address (all three channels share it)
    pub host: String,

    /// Message bus port
    pub mqtt_port: u16,

    /// Remote shell port
    pub shell_port: u16,

    /// Connect timeout for shell sessions and bus/control probes
    pub connect_timeout: Duration,

    /// Default retry count for control channel commands
    pub command_retries: u32,

    /// Hard iteration cap for paginated discovery. A loop-safety bound: the
    /// paging command is not trusted to ever report a matching total.
    pub discovery_page_cap: usize,

    /// Pause before retrying after a failed reconciliation pass
    pub retry_backoff: Duration,

    /// Raw-traffic debug flags
    pub debug: DebugFlags,

    /// Per-device overrides keyed by hardware address
    pub devices: HashMap<String, DeviceOverride>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            mqtt_port: 1883,
            shell_port: 23,
            connect_timeout: Duration::from_secs(5),
            command_retries: 3,
            discovery_page_cap: 16,
            retry_backoff: Duration::from_secs(30),
            debug: DebugFlags::default(),
            devices: HashMap::new(),
        }
    }
}

impl GatewayConfig {
    /// Create a configuration for the given host with default knobs
    pub fn new<S: Into<String>>(host: S) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(host) = env::var("LUMI_HOST") {
            config.host = host;
        }

        if let Ok(port) = env::var("LUMI_MQTT_PORT") {
            config.mqtt_port = port
                .parse()
                .map_err(|e| GatewayError::config(format!("Invalid LUMI_MQTT_PORT: {e}")))?;
        }

        if let Ok(port) = env::var("LUMI_SHELL_PORT") {
            config.shell_port = port
                .parse()
                .map_err(|e| GatewayError::config(format!("Invalid LUMI_SHELL_PORT: {e}")))?;
        }

        if let Ok(timeout) = env::var("LUMI_CONNECT_TIMEOUT") {
            config.connect_timeout = Duration::from_secs(
                timeout
                    .parse()
                    .map_err(|e| GatewayError::config(format!("Invalid LUMI_CONNECT_TIMEOUT: {e}")))?,
            );
        }

        if let Ok(backoff) = env::var("LUMI_RETRY_BACKOFF") {
            config.retry_backoff = Duration::from_secs(
                backoff
                    .parse()
                    .map_err(|e| GatewayError::config(format!("Invalid LUMI_RETRY_BACKOFF: {e}")))?,
            );
        }

        if let Ok(debug) = env::var("LUMI_DEBUG") {
            config.debug.mqtt = debug.contains("mqtt");
            config.debug.bluetooth = debug.contains("bluetooth");
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(GatewayError::config("Gateway host cannot be empty"));
        }

        if self.connect_timeout.is_zero() {
            return Err(GatewayError::config(
                "Connect timeout must be greater than zero",
            ));
        }

        if self.discovery_page_cap == 0 {
            return Err(GatewayError::config(
                "Discovery page cap must be at least one page",
            ));
        }

        Ok(())
    }
}
