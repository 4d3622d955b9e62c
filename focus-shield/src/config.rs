// Configuration file parser

//! Configuration file parsing and validation
//!
//! This module handles loading TOML configuration files and validating
//! their contents, including CIDR parsing for the tunnel address and routes.

use crate::platform::validate_interface_name;
use crate::types::Config;
use anyhow::{Context, Result};
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

/// Smallest MTU a tunnel interface may be configured with
const MIN_MTU: u16 = 576;

/// Largest MTU a tunnel interface may be configured with
const MAX_MTU: u16 = 9000;

/// Load configuration from TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;

    let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;

    validate_config(&config)?;
    Ok(config)
}

/// Validate configuration values
fn validate_config(config: &Config) -> Result<()> {
    if config.general.own_app_id.is_empty() {
        anyhow::bail!("own_app_id cannot be empty");
    }

    let url = &config.general.server_url;
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        anyhow::bail!("server_url must be an http(s) URL, got '{}'", url);
    }

    if config.tunnel.session_name.is_empty() {
        anyhow::bail!("tunnel.session_name cannot be empty");
    }

    validate_interface_name(&config.tunnel.interface)
        .context("tunnel.interface has an invalid name")?;

    let (_, prefix_len) = parse_address(&config.tunnel.address)
        .with_context(|| format!("Invalid tunnel address: {}", config.tunnel.address))?;
    if prefix_len == 0 {
        anyhow::bail!("tunnel.address prefix must be > 0");
    }

    if config.tunnel.routes.is_empty() {
        anyhow::bail!("tunnel.routes cannot be empty");
    }

    for route in &config.tunnel.routes {
        parse_cidr(route).with_context(|| format!("Invalid route CIDR: {}", route))?;
    }

    for dns in &config.tunnel.dns {
        dns.parse::<IpAddr>()
            .with_context(|| format!("Invalid DNS server: {}", dns))?;
    }

    if !(MIN_MTU..=MAX_MTU).contains(&config.tunnel.mtu) {
        anyhow::bail!(
            "tunnel.mtu must be between {} and {}, got {}",
            MIN_MTU,
            MAX_MTU,
            config.tunnel.mtu
        );
    }

    if config.guard.check_interval_secs == 0 {
        anyhow::bail!("guard.check_interval_secs must be > 0");
    }

    if config.guard.request_timeout_secs == 0 {
        anyhow::bail!("guard.request_timeout_secs must be > 0");
    }

    if config.metrics.window_secs == 0 {
        anyhow::bail!("metrics.window_secs must be > 0");
    }

    if config.metrics.poll_interval_secs == 0 {
        anyhow::bail!("metrics.poll_interval_secs must be > 0");
    }

    if config.trigger.poll_interval_secs == 0 {
        anyhow::bail!("trigger.poll_interval_secs must be > 0");
    }

    for (app, companions) in &config.dependencies {
        if app.is_empty() || companions.iter().any(|c| c.is_empty()) {
            anyhow::bail!("dependencies entries cannot contain empty package ids");
        }
    }

    Ok(())
}

/// Parse an interface address like `10.0.0.1/24` into (address, prefix length)
pub fn parse_address(cidr: &str) -> Result<(Ipv4Addr, u8)> {
    let (ip, prefix) = cidr
        .split_once('/')
        .context("Invalid CIDR format (expected X.X.X.X/N)")?;

    let ip: Ipv4Addr = ip.parse().context("Invalid IP address")?;
    let prefix_len: u8 = prefix.parse().context("Invalid prefix length")?;

    if prefix_len > 32 {
        anyhow::bail!("Prefix length must be <= 32");
    }

    Ok((ip, prefix_len))
}

/// Parse CIDR notation into (network, mask) tuple
/// Returns network address and netmask in network byte order (big endian)
pub fn parse_cidr(cidr: &str) -> Result<(u32, u32)> {
    let (ip, prefix_len) = parse_address(cidr)?;

    // Convert IP to u32 (network byte order = big endian)
    let ip_u32 = u32::from_be_bytes(ip.octets());

    let mask = if prefix_len == 0 {
        0u32
    } else {
        !0u32 << (32 - prefix_len)
    };

    Ok((ip_u32 & mask, mask))
}

/// Check whether an address falls inside a CIDR range
pub fn cidr_contains(cidr: &str, ip: Ipv4Addr) -> Result<bool> {
    let (network, mask) = parse_cidr(cidr)?;
    Ok(u32::from_be_bytes(ip.octets()) & mask == network)
}
