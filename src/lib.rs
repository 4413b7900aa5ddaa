//! Lumi gateway bridge in Rust
//!
//! This crate maintains a live connection to a Lumi multi-protocol gateway,
//! discovers the devices attached to it and translates the gateway's
//! proprietary event stream into normalized state updates for an embedding
//! home-automation host.
//!
//! # Features
//!
//! - Reconciliation loop across the gateway's three surfaces: encrypted
//!   control channel, remote shell and MQTT message bus
//! - Three interchangeable discovery strategies (live paginated query,
//!   info-file scrape, embedded database dump)
//! - Normalized `(device, property -> value)` updates with unit and
//!   encoding fixups applied
//! - Bluetooth advertisement relay handling with lazy device records
//! - Outbound write path resolving canonical names back to wire names
//!
//! # Example
//!
//! ```rust,no_run
//! use lumi_gateway_rust::catalog::StaticCatalog;
//! use lumi_gateway_rust::mock::{MockBleDecoder, MockBlobReader, MockTransport};
//! use lumi_gateway_rust::{GatewayConfig, LumiGateway};
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GatewayConfig::new("192.168.1.50");
//!
//!     // the host supplies the control transport, catalog, database reader
//!     // and Bluetooth decoder; mocks stand in here
//!     let gateway = LumiGateway::new(
//!         config,
//!         Arc::new(MockTransport::new()),
//!         Arc::new(StaticCatalog::new()),
//!         Arc::new(MockBlobReader::empty()),
//!         Arc::new(MockBleDecoder::unsupported()),
//!     )?;
//!
//!     let handle = gateway.handle();
//!     handle.add_setup(
//!         "sensor",
//!         Arc::new(|device, attr| println!("new entity: {} {attr}", device.did)),
//!     );
//!     handle.add_update(
//!         "lumi.0",
//!         Arc::new(|update| println!("hub update: {:?}", update.properties)),
//!     );
//!
//!     let worker = gateway.spawn();
//!     worker.await?;
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod services;

pub mod mock;

// Re-export main types
pub use crate::{
    config::GatewayConfig,
    error::{GatewayError, Result},
    gateway::{verify_gateway, GatewayHandle, LumiGateway},
    services::device_registry::{DeviceDescriptor, DeviceRecord, NormalizedUpdate},
};
