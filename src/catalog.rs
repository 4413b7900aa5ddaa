//! Device catalog seam and global resource table
//!
//! The catalog maps a hub-side product model (e.g. `lumi.sensor_ht`) to the
//! ordered parameter descriptors of that product. The catalog content itself
//! is maintained outside this crate; consumers hand in any [`Catalog`]
//! implementation. [`StaticCatalog`] is a simple map-backed implementation
//! suitable for embedding hosts and tests.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Arc;

/// One parameter descriptor of a device model.
///
/// Wire name is the hub protocol's own identifier (often dotted-numeric,
/// `"0.1.85"`), the hub key is the retained-property key the hub caches the
/// value under (`"temperature"` on the hub side), and the canonical name is
/// the stable identifier exposed to update subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    /// Hub protocol identifier for the property
    pub wire: String,

    /// Retained-property key on the hub, if the hub caches this property
    pub hub_key: Option<String>,

    /// Stable, model-independent property name
    pub canonical: String,

    /// Entity domain the embedding host should create for this property
    pub domain: Option<String>,
}

impl ParamSpec {
    /// Convenience constructor used when building catalog entries
    pub fn new(
        wire: &str,
        hub_key: Option<&str>,
        canonical: &str,
        domain: Option<&str>,
    ) -> Self {
        Self {
            wire: wire.to_string(),
            hub_key: hub_key.map(str::to_string),
            canonical: canonical.to_string(),
            domain: domain.map(str::to_string),
        }
    }
}

/// Ordered parameter descriptors for one device model
pub type ParameterSpec = Arc<[ParamSpec]>;

/// External catalog of supported device models
pub trait Catalog: Send + Sync {
    /// Parameter descriptors for a model, or `None` for unrecognized models.
    /// Unrecognized models are skipped by discovery and setup, never treated
    /// as an error.
    fn parameter_spec(&self, model: &str) -> Option<ParameterSpec>;

    /// Entity domain for a Bluetooth-advertised property, or `None` when the
    /// property should not create an entity
    fn ble_domain(&self, canonical: &str) -> Option<String>;
}

/// Map-backed [`Catalog`] implementation
#[derive(Default)]
pub struct StaticCatalog {
    models: HashMap<String, ParameterSpec>,
    ble_domains: HashMap<String, String>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model with its parameter descriptors
    pub fn with_model(mut self, model: &str, params: Vec<ParamSpec>) -> Self {
        self.models.insert(model.to_string(), Arc::from(params));
        self
    }

    /// Register the entity domain for a Bluetooth-advertised property
    pub fn with_ble_domain(mut self, canonical: &str, domain: &str) -> Self {
        self.ble_domains
            .insert(canonical.to_string(), domain.to_string());
        self
    }
}

impl Catalog for StaticCatalog {
    fn parameter_spec(&self, model: &str) -> Option<ParameterSpec> {
        self.models.get(model).cloned()
    }

    fn ble_domain(&self, canonical: &str) -> Option<String> {
        self.ble_domains.get(canonical).cloned()
    }
}

/// Hub-global resource identifiers, valid for every device model.
///
/// Checked before the per-model parameter descriptors when resolving an
/// inbound wire name.
static GLOBAL_RESOURCES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("8.0.2001", "battery"),
        ("8.0.2006", "chip_temperature"),
        ("8.0.2008", "voltage"),
        ("8.0.2022", "fw_ver"),
        ("8.0.2036", "parent"),
        ("8.0.2084", "added_device"),
        ("8.0.2102", "pairing"),
    ])
});

/// Resolve a hub-global wire name to its canonical name
pub fn global_resource(wire: &str) -> Option<&'static str> {
    GLOBAL_RESOURCES.get(wire).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_resources_resolve() {
        assert_eq!(global_resource("8.0.2008"), Some("voltage"));
        assert_eq!(global_resource("0.1.85"), None);
    }

    #[test]
    fn static_catalog_lookup() {
        let catalog = StaticCatalog::new().with_model(
            "lumi.sensor_ht",
            vec![ParamSpec::new(
                "0.1.85",
                Some("temperature"),
                "temperature",
                Some("sensor"),
            )],
        );

        let spec = catalog.parameter_spec("lumi.sensor_ht").unwrap();
        assert_eq!(spec.len(), 1);
        assert_eq!(spec[0].canonical, "temperature");
        assert!(catalog.parameter_spec("lumi.unknown").is_none());
    }
}
