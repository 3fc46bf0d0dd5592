//! Configuration types and loading
//!
//! See [`types`] for the configuration dictionary and its wire conversion,
//! and [`loader`] for file loading with resolver fallback.

mod loader;
mod types;

pub use loader::{load_config, load_config_str, system_dns_settings};
pub use types::{DnsSettings, Ipv4Settings, PoolRange, RouteEntry, TunnelConfiguration};
