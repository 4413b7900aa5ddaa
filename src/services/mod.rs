//! Device state services: registry, event normalization, value fixups

pub mod device_registry;
pub mod pipeline;
pub mod value_parsers;
