//! Configuration loading
//!
//! Loads the server configuration dictionary from a JSON file, validates
//! it, and fills in DNS settings from the host resolver configuration when
//! the file omits them.

use std::path::Path;

use tracing::{debug, info, warn};

use super::types::{DnsSettings, TunnelConfiguration};
use crate::error::ConfigError;

/// Load and validate a configuration file
///
/// If the file has no `DNS` section, one is populated from the host OS's
/// current resolver configuration.
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed, or validated.
pub fn load_config(path: impl AsRef<Path>) -> Result<TunnelConfiguration, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;
    let mut config = parse_config(&contents)
        .map_err(|e| ConfigError::ParseError(format!("{e} at {path:?}")))?;
    config.validate()?;

    if config.dns.is_none() {
        let dns = system_dns_settings();
        if dns.servers.is_empty() {
            warn!("No DNS section configured and no system resolvers found");
        } else {
            debug!("Populated DNS settings from the system resolver");
        }
        config.dns = Some(dns);
    }

    info!(
        "Configuration loaded: pool={}, routes={}, dns_servers={}",
        config
            .ipv4
            .as_ref()
            .and_then(|v| v.pool.as_ref())
            .map_or_else(|| "none".to_owned(), |p| {
                format!("{}-{}", p.start_address, p.end_address)
            }),
        config.ipv4.as_ref().map_or(0, |v| v.routes.len()),
        config.dns.as_ref().map_or(0, |d| d.servers.len()),
    );

    Ok(config)
}

/// Load and validate a configuration from a JSON string
///
/// Unlike [`load_config`], this does not consult the host resolver; it is
/// intended for tests and embedding.
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<TunnelConfiguration, ConfigError> {
    let config = parse_config(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

fn parse_config(json: &str) -> Result<TunnelConfiguration, serde_json::Error> {
    serde_json::from_str(json)
}

/// Read the host OS's current resolver configuration
#[must_use]
pub fn system_dns_settings() -> DnsSettings {
    #[cfg(unix)]
    {
        match std::fs::read_to_string("/etc/resolv.conf") {
            Ok(contents) => parse_resolv_conf(&contents),
            Err(e) => {
                debug!("Could not read /etc/resolv.conf: {}", e);
                DnsSettings::default()
            }
        }
    }
    #[cfg(not(unix))]
    {
        DnsSettings::default()
    }
}

/// Parse resolv.conf-style resolver configuration
fn parse_resolv_conf(contents: &str) -> DnsSettings {
    let mut settings = DnsSettings::default();
    for line in contents.lines() {
        let line = line.trim();
        if line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("nameserver") => {
                if let Some(server) = fields.next() {
                    settings.servers.push(server.to_owned());
                }
            }
            Some("search") => {
                settings
                    .search_domains
                    .extend(fields.map(str::to_owned));
            }
            Some("domain") => {
                if let Some(domain) = fields.next() {
                    if !settings.search_domains.iter().any(|d| d == domain) {
                        settings.search_domains.push(domain.to_owned());
                    }
                }
            }
            _ => {}
        }
    }
    settings
}
