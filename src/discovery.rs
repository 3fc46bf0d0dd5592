//! Server discovery
//!
//! The server advertises under `_tunnelserver._tcp` in the `local` domain;
//! resolving that advertisement is left to the platform's mDNS machinery.
//! Clients configured with a literal address use the colon-separated
//! `host:port` form parsed here.

use crate::error::ConfigError;

/// mDNS service type the server advertises under
pub const SERVICE_TYPE: &str = "_tunnelserver._tcp";

/// mDNS domain the server advertises in
pub const SERVICE_DOMAIN: &str = "local";

/// Parse a colon-separated `host:port` server address
///
/// # Errors
///
/// Returns `ConfigError::ValidationError` when the separator is missing,
/// the host is empty, or the port does not parse.
pub fn parse_server_address(address: &str) -> Result<(String, u16), ConfigError> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::validation(format!("missing port in address: {address}")))?;
    if host.is_empty() {
        return Err(ConfigError::validation(format!(
            "missing host in address: {address}"
        )));
    }
    let port = port
        .parse()
        .map_err(|_| ConfigError::validation(format!("invalid port in address: {address}")))?;
    Ok((host.to_owned(), port))
}
