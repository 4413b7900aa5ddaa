//! Gateway worker: the connection reconciliation loop
//!
//! One worker task owns all connectivity state and continuously reconciles
//! desired connectivity against actual connectivity. It moves through four
//! phases: bootstrapping (no hub record yet), connected (bus receive loop
//! running), recovering (restoring connectivity through control and shell)
//! and a fixed idle backoff. The loop never terminates on transient
//! failure; persistent unreachability shows up as an indefinitely repeating
//! backoff, torn down only with the task itself.

use crate::catalog::Catalog;
use crate::client::bus::MqttBus;
use crate::client::control::ControlChannel;
use crate::client::shell::TelnetConnector;
use crate::client::{ControlTransport, MessageBus, ShellConnector};
use crate::config::GatewayConfig;
use crate::discovery::{BlobReader, DiscoveryEngine};
use crate::error::{GatewayError, Result};
use crate::services::device_registry::{
    DeviceDescriptor, DeviceRecord, DeviceRegistry, SetupHandler, UpdateHandler, HUB_MODEL,
};
use crate::services::pipeline::{BleDecoder, EventPipeline};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Shell recovery sequence opening up the on-device broker and the
/// Bluetooth log relay. Completion timing of these commands is not
/// observable, so each step gets a short fixed settle pause.
const BUS_ENABLE_SEQUENCE: &[(&str, Duration)] = &[
    ("killall mosquitto", Duration::from_millis(500)),
    ("mosquitto -d", Duration::from_secs(1)),
    ("killall tail", Duration::from_millis(500)),
    (
        "tail -F /var/log/messages | awk '/BT/{print $0}' | mosquitto_pub -l -t log/bt &",
        Duration::from_secs(1),
    ),
];

/// Pre-check for host setup flows: confirm the reachable device is the
/// supported gateway generation before building a worker for it
pub async fn verify_gateway(transport: &dyn ControlTransport) -> Result<()> {
    let info = transport.info().await?;
    if info.model != HUB_MODEL {
        return Err(GatewayError::control(format!(
            "Wrong device model: {}",
            info.model
        )));
    }
    Ok(())
}

/// Caller-facing handle, usable from any thread while the worker runs
#[derive(Clone)]
pub struct GatewayHandle {
    registry: Arc<DeviceRegistry>,
    pipeline: Arc<EventPipeline>,
}

impl GatewayHandle {
    /// Subscribe to a device's normalized updates
    pub fn add_update(&self, did: &str, handler: UpdateHandler) {
        self.registry.add_update(did, handler);
    }

    /// Register the host setup hook for an entity domain
    pub fn add_setup(&self, domain: &str, handler: SetupHandler) {
        self.registry.add_setup(domain, handler);
    }

    /// Push a normalized write out through the bus
    pub fn send(&self, did: &str, canonical: &str, value: Value) -> Result<()> {
        self.pipeline.send_write(did, canonical, value)
    }

    /// Snapshot of a device record
    pub fn device(&self, did: &str) -> Option<DeviceRecord> {
        self.registry.get(did)
    }

    /// The gateway's own record, present once bootstrap finished
    pub fn hub(&self) -> Option<DeviceRecord> {
        self.registry.hub()
    }
}

/// The gateway worker
pub struct LumiGateway {
    config: GatewayConfig,
    control: ControlChannel,
    bus: Box<dyn MessageBus>,
    shell: Arc<dyn ShellConnector>,
    engine: DiscoveryEngine,
    registry: Arc<DeviceRegistry>,
    pipeline: Arc<EventPipeline>,
}

impl LumiGateway {
    /// Create a worker with the default MQTT and telnet channels
    pub fn new(
        config: GatewayConfig,
        transport: Arc<dyn ControlTransport>,
        catalog: Arc<dyn Catalog>,
        blob_reader: Arc<dyn BlobReader>,
        decoder: Arc<dyn BleDecoder>,
    ) -> Result<Self> {
        let bus = Box::new(MqttBus::new(
            &config.host,
            config.mqtt_port,
            config.connect_timeout,
        ));
        let shell = Arc::new(TelnetConnector::new(
            &config.host,
            config.shell_port,
            config.connect_timeout,
        ));
        Self::with_channels(config, transport, catalog, blob_reader, decoder, bus, shell)
    }

    /// Create a worker over explicit channel implementations
    pub fn with_channels(
        config: GatewayConfig,
        transport: Arc<dyn ControlTransport>,
        catalog: Arc<dyn Catalog>,
        blob_reader: Arc<dyn BlobReader>,
        decoder: Arc<dyn BleDecoder>,
        bus: Box<dyn MessageBus>,
        shell: Arc<dyn ShellConnector>,
    ) -> Result<Self> {
        config.validate()?;

        let control = ControlChannel::new(
            transport,
            config.command_retries,
            config.discovery_page_cap,
        );
        let registry = Arc::new(DeviceRegistry::new(catalog.clone(), config.devices.clone()));
        let pipeline = Arc::new(EventPipeline::new(
            registry.clone(),
            catalog.clone(),
            decoder,
            bus.publisher(),
            config.debug.clone(),
        ));
        let engine = DiscoveryEngine::new(catalog, blob_reader);

        Ok(Self {
            config,
            control,
            bus,
            shell,
            engine,
            registry,
            pipeline,
        })
    }

    /// Caller-facing handle; create before spawning the worker
    pub fn handle(&self) -> GatewayHandle {
        GatewayHandle {
            registry: self.registry.clone(),
            pipeline: self.pipeline.clone(),
        }
    }

    pub fn registry(&self) -> Arc<DeviceRegistry> {
        self.registry.clone()
    }

    /// Launch the worker task
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run the reconciliation loop. Never returns; stop it by dropping or
    /// aborting the worker task.
    pub async fn run(mut self) {
        info!("Gateway worker for {} starting", self.config.host);

        self.bootstrap().await;

        loop {
            match self.bus.connect().await {
                Ok(()) => {
                    let pipeline = self.pipeline.clone();
                    if let Err(e) = self.bus.run(&*pipeline).await {
                        warn!("Bus receive loop ended: {e}");
                    }
                }
                Err(e) => {
                    debug!("Bus connect failed: {e}");
                    if self.control.probe().await && self.control.enable_shell().await {
                        if let Err(e) = self.enable_bus().await {
                            debug!("Bus recovery failed: {e}");
                        }
                    } else {
                        debug!("Backing off {:?}", self.config.retry_backoff);
                        sleep(self.config.retry_backoff).await;
                    }
                }
            }
        }
    }

    /// Bootstrap until the hub record exists: probe control, run database
    /// discovery, enable the shell when discovery cannot reach it yet
    async fn bootstrap(&mut self) {
        while self.registry.hub().is_none() {
            if self.control.probe().await {
                match self.discover().await {
                    Ok(devices) => {
                        info!("Discovered {} devices", devices.len());
                        self.registry.setup_devices(devices).await;
                    }
                    Err(e) => {
                        debug!("Database discovery failed: {e}");
                        self.control.enable_shell().await;
                    }
                }
            } else {
                debug!(
                    "Gateway unreachable, backing off {:?}",
                    self.config.retry_backoff
                );
                sleep(self.config.retry_backoff).await;
            }
        }

        info!("Bootstrap complete, {} devices registered", self.registry.len());
    }

    /// Database-strategy discovery over a fresh shell session; the only
    /// strategy exercised in steady state
    async fn discover(&mut self) -> Result<Vec<DeviceDescriptor>> {
        let mut shell = self.shell.open().await?;
        self.engine.from_database(&mut *shell).await
    }

    /// Restart the broker and the Bluetooth log relay through the shell
    async fn enable_bus(&mut self) -> Result<()> {
        info!("Restarting broker and Bluetooth relay via shell");

        let mut shell = self.shell.open().await?;
        for (command, settle) in BUS_ENABLE_SEQUENCE.iter().copied() {
            shell.run_fire_and_forget(command).await?;
            sleep(settle).await;
        }

        Ok(())
    }
}
