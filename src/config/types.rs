//! Configuration types
//!
//! The server configuration file is a dictionary using the property-list
//! key vocabulary (`IPv4`, `Pool`, `StartAddress`, ...). The same structure
//! travels inside `openResult` and `fetchConfiguration` messages as a
//! nested [`Value`] mapping, with one asymmetry: clients never see the
//! `IPv4.Pool` subtree, and an IP flow's `openResult` carries the assigned
//! `IPv4.Address` injected.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::message::Value;

/// Tunnel network settings, as stored on disk and sent to clients
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TunnelConfiguration {
    /// IPv4 addressing: server address, netmask, client pool, routes
    #[serde(rename = "IPv4", default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<Ipv4Settings>,

    /// DNS resolver settings pushed to clients
    #[serde(rename = "DNS", default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<DnsSettings>,

    /// Opaque proxy settings forwarded to clients unchanged
    #[serde(rename = "Proxies", default, skip_serializing_if = "Option::is_none")]
    pub proxies: Option<serde_json::Value>,
}

/// IPv4 section of the configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ipv4Settings {
    /// Tunnel interface address (injected per-flow for IP flows)
    #[serde(rename = "Address", default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Ipv4Addr>,

    /// Tunnel interface netmask
    #[serde(rename = "Netmask", default, skip_serializing_if = "Option::is_none")]
    pub netmask: Option<Ipv4Addr>,

    /// Client address pool (server-side only, never sent to clients)
    #[serde(rename = "Pool", default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolRange>,

    /// Routes to install through the tunnel
    #[serde(rename = "Routes", default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteEntry>,
}

/// Inclusive IPv4 range the server leases client addresses from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolRange {
    /// First leasable address (inclusive)
    #[serde(rename = "StartAddress")]
    pub start_address: Ipv4Addr,

    /// Last leasable address (inclusive)
    #[serde(rename = "EndAddress")]
    pub end_address: Ipv4Addr,
}

/// One routed destination network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteEntry {
    /// Destination network address
    #[serde(rename = "Address")]
    pub address: Ipv4Addr,

    /// Destination netmask
    #[serde(rename = "Netmask")]
    pub netmask: Ipv4Addr,
}

/// DNS section of the configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DnsSettings {
    /// Resolver addresses
    #[serde(rename = "Servers", default)]
    pub servers: Vec<String>,

    /// Search domains
    #[serde(rename = "SearchDomains", default)]
    pub search_domains: Vec<String>,
}

impl TunnelConfiguration {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` when the pool range is
    /// reversed or spans more than one /16 network, or when a route entry
    /// carries a non-contiguous netmask.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(ipv4) = &self.ipv4 {
            if let Some(pool) = &ipv4.pool {
                let start = u32::from(pool.start_address);
                let end = u32::from(pool.end_address);
                if start > end {
                    return Err(ConfigError::validation(format!(
                        "pool start {} is after end {}",
                        pool.start_address, pool.end_address
                    )));
                }
                if start >> 16 != end >> 16 {
                    return Err(ConfigError::validation(format!(
                        "pool range {}-{} spans more than one /16 network",
                        pool.start_address, pool.end_address
                    )));
                }
            }
            for route in &ipv4.routes {
                ipnet::Ipv4Net::with_netmask(route.address, route.netmask).map_err(|_| {
                    ConfigError::validation(format!(
                        "invalid netmask {} for route {}",
                        route.netmask, route.address
                    ))
                })?;
            }
            if let (Some(address), Some(netmask)) = (ipv4.address, ipv4.netmask) {
                ipnet::Ipv4Net::with_netmask(address, netmask).map_err(|_| {
                    ConfigError::validation(format!("invalid tunnel netmask {netmask}"))
                })?;
            }
        }
        Ok(())
    }

    /// The configuration as delivered to a client
    ///
    /// Strips the `IPv4.Pool` subtree and, for an IP flow, injects the
    /// leased address.
    #[must_use]
    pub fn client_view(&self, assigned: Option<Ipv4Addr>) -> Self {
        let mut view = self.clone();
        if let Some(ipv4) = &mut view.ipv4 {
            ipv4.pool = None;
            if let Some(address) = assigned {
                ipv4.address = Some(address);
            }
        } else if let Some(address) = assigned {
            view.ipv4 = Some(Ipv4Settings {
                address: Some(address),
                ..Ipv4Settings::default()
            });
        }
        view
    }

    /// Encode the configuration as a wire value
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut root = BTreeMap::new();
        if let Some(ipv4) = &self.ipv4 {
            let mut section = BTreeMap::new();
            if let Some(address) = ipv4.address {
                section.insert("Address".to_owned(), Value::Str(address.to_string()));
            }
            if let Some(netmask) = ipv4.netmask {
                section.insert("Netmask".to_owned(), Value::Str(netmask.to_string()));
            }
            if let Some(pool) = &ipv4.pool {
                let mut range = BTreeMap::new();
                range.insert(
                    "StartAddress".to_owned(),
                    Value::Str(pool.start_address.to_string()),
                );
                range.insert(
                    "EndAddress".to_owned(),
                    Value::Str(pool.end_address.to_string()),
                );
                section.insert("Pool".to_owned(), Value::Map(range));
            }
            if !ipv4.routes.is_empty() {
                let routes = ipv4
                    .routes
                    .iter()
                    .map(|route| {
                        let mut entry = BTreeMap::new();
                        entry
                            .insert("Address".to_owned(), Value::Str(route.address.to_string()));
                        entry
                            .insert("Netmask".to_owned(), Value::Str(route.netmask.to_string()));
                        Value::Map(entry)
                    })
                    .collect();
                section.insert("Routes".to_owned(), Value::List(routes));
            }
            root.insert("IPv4".to_owned(), Value::Map(section));
        }
        if let Some(dns) = &self.dns {
            let mut section = BTreeMap::new();
            section.insert(
                "Servers".to_owned(),
                Value::List(dns.servers.iter().map(|s| Value::Str(s.clone())).collect()),
            );
            section.insert(
                "SearchDomains".to_owned(),
                Value::List(
                    dns.search_domains
                        .iter()
                        .map(|s| Value::Str(s.clone()))
                        .collect(),
                ),
            );
            root.insert("DNS".to_owned(), Value::Map(section));
        }
        if let Some(proxies) = &self.proxies {
            if let Some(value) = json_to_value(proxies) {
                root.insert("Proxies".to_owned(), value);
            }
        }
        Value::Map(root)
    }

    /// Decode a wire configuration mapping
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` when an address field does
    /// not parse.
    pub fn from_value(entries: &BTreeMap<String, Value>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(section) = entries.get("IPv4").and_then(Value::as_map) {
            let mut ipv4 = Ipv4Settings::default();
            if let Some(raw) = section.get("Address").and_then(Value::as_str) {
                ipv4.address = Some(parse_ipv4(raw)?);
            }
            if let Some(raw) = section.get("Netmask").and_then(Value::as_str) {
                ipv4.netmask = Some(parse_ipv4(raw)?);
            }
            if let Some(range) = section.get("Pool").and_then(Value::as_map) {
                let start = range
                    .get("StartAddress")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ConfigError::validation("pool is missing StartAddress"))?;
                let end = range
                    .get("EndAddress")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ConfigError::validation("pool is missing EndAddress"))?;
                ipv4.pool = Some(PoolRange {
                    start_address: parse_ipv4(start)?,
                    end_address: parse_ipv4(end)?,
                });
            }
            if let Some(routes) = section.get("Routes").and_then(Value::as_list) {
                for route in routes {
                    let Some(entry) = route.as_map() else { continue };
                    let (Some(address), Some(netmask)) = (
                        entry.get("Address").and_then(Value::as_str),
                        entry.get("Netmask").and_then(Value::as_str),
                    ) else {
                        continue;
                    };
                    ipv4.routes.push(RouteEntry {
                        address: parse_ipv4(address)?,
                        netmask: parse_ipv4(netmask)?,
                    });
                }
            }
            config.ipv4 = Some(ipv4);
        }

        if let Some(section) = entries.get("DNS").and_then(Value::as_map) {
            let mut dns = DnsSettings::default();
            if let Some(servers) = section.get("Servers").and_then(Value::as_list) {
                dns.servers = servers
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_owned))
                    .collect();
            }
            if let Some(domains) = section.get("SearchDomains").and_then(Value::as_list) {
                dns.search_domains = domains
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_owned))
                    .collect();
            }
            config.dns = Some(dns);
        }

        if let Some(proxies) = entries.get("Proxies") {
            config.proxies = Some(value_to_json(proxies));
        }

        Ok(config)
    }
}

fn parse_ipv4(raw: &str) -> Result<Ipv4Addr, ConfigError> {
    raw.parse()
        .map_err(|_| ConfigError::validation(format!("invalid IPv4 address: {raw}")))
}

/// Convert an opaque JSON subtree into a wire value
///
/// JSON null has no wire representation and is dropped; booleans become
/// 0/1; non-integral numbers are carried as strings.
fn json_to_value(json: &serde_json::Value) -> Option<Value> {
    match json {
        serde_json::Value::Null => None,
        serde_json::Value::Bool(b) => Some(Value::Int(i64::from(*b))),
        serde_json::Value::Number(n) => Some(
            n.as_i64()
                .map_or_else(|| Value::Str(n.to_string()), Value::Int),
        ),
        serde_json::Value::String(s) => Some(Value::Str(s.clone())),
        serde_json::Value::Array(items) => Some(Value::List(
            items.iter().filter_map(json_to_value).collect(),
        )),
        serde_json::Value::Object(entries) => Some(Value::Map(
            entries
                .iter()
                .filter_map(|(k, v)| json_to_value(v).map(|v| (k.clone(), v)))
                .collect(),
        )),
    }
}

/// Convert a wire value back into JSON for the opaque proxy subtree
fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Int(v) => serde_json::Value::from(*v),
        Value::Str(s) => serde_json::Value::from(s.clone()),
        Value::Bytes(b) => serde_json::Value::from(
            b.iter().map(|byte| i64::from(*byte)).collect::<Vec<_>>(),
        ),
        Value::List(items) => serde_json::Value::from(
            items.iter().map(value_to_json).collect::<Vec<_>>(),
        ),
        Value::IntList(items) => serde_json::Value::from(items.clone()),
        Value::Map(entries) => serde_json::Value::Object(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), value_to_json(v)))
                .collect(),
        ),
    }
}
