// Collaborator contracts for the tunnel, the packet engine and authorization

//! Tunnel, engine and authorization contracts
//!
//! The orchestrator drives three external collaborators through these traits:
//! the platform primitive that creates the tunnel interface, the opaque packet
//! engine that runs on top of it, and the permission prompt that gates both.
//! Linux implementations live in [`crate::platform`].

use crate::config::parse_address;
use crate::policy::AppFilter;
use crate::types::TunnelConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr};

/// Everything the tunnel primitive needs to create an interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelParams {
    /// Session label shown by the platform
    pub session_name: String,
    /// TUN device name
    pub interface: String,
    /// Local address
    pub address: Ipv4Addr,
    /// Prefix length of `address`
    pub prefix: u8,
    /// Routes sent through the tunnel
    pub routes: Vec<String>,
    /// Resolvers set on the tunnel
    pub dns: Vec<IpAddr>,
    /// Interface MTU
    pub mtu: u16,
    /// Which applications use the tunnel
    pub app_filter: AppFilter,
    /// Allow applications to bypass the tunnel
    pub local_bypass: bool,
}

impl TunnelParams {
    /// Build parameters from the `[tunnel]` config section
    pub fn from_config(
        config: &TunnelConfig,
        app_filter: AppFilter,
        local_bypass: bool,
    ) -> Result<Self> {
        let (address, prefix) = parse_address(&config.address)
            .with_context(|| format!("Invalid tunnel address: {}", config.address))?;

        let dns = config
            .dns
            .iter()
            .map(|s| {
                s.parse::<IpAddr>()
                    .with_context(|| format!("Invalid DNS server: {}", s))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            session_name: config.session_name.clone(),
            interface: config.interface.clone(),
            address,
            prefix,
            routes: config.routes.clone(),
            dns,
            mtu: config.mtu,
            app_filter,
            local_bypass,
        })
    }
}

/// Handle to an established tunnel interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelDescriptor {
    /// Unique per established interface
    pub id: u64,
    /// Interface name
    pub name: String,
}

/// Which engine entry point a session runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEntry {
    /// Forward traffic through the remote endpoint
    ActiveLoop,
    /// No remote endpoint: swallow and count traffic locally
    PassiveShield,
}

impl EngineEntry {
    /// Active loop when an access key is configured
    pub fn for_key(key: &str) -> Self {
        if key.trim().is_empty() {
            EngineEntry::PassiveShield
        } else {
            EngineEntry::ActiveLoop
        }
    }
}

/// Platform primitive that creates and destroys the tunnel interface
#[async_trait]
pub trait TunnelPrimitive: Send + Sync {
    /// `None` when the platform refused to create the interface
    async fn establish(&self, params: &TunnelParams) -> Option<TunnelDescriptor>;

    /// Release the interface; must tolerate an already-gone interface
    async fn close(&self, descriptor: &TunnelDescriptor);
}

/// Opaque traffic engine running on top of the tunnel
#[async_trait]
pub trait PacketEngine: Send + Sync {
    /// False when the engine binary or library is missing
    fn is_available(&self) -> bool;

    /// Access key for the active loop; empty for none
    fn set_key(&self, key: &str);

    /// Comma-separated list of domains let through in focus filtering
    fn set_allowed_domains(&self, csv: &str);

    /// Monotonic raw blocked counter maintained by the engine
    fn raw_blocked_count(&self) -> u64;

    /// Runs until the engine stops; cancelled by dropping the future
    async fn run_active_loop(&self, descriptor: &TunnelDescriptor) -> Result<()>;

    /// Runs until the engine stops; cancelled by dropping the future
    async fn run_passive_shield(&self, descriptor: &TunnelDescriptor) -> Result<()>;
}

/// Platform permission prompt for creating tunnels
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Whether the user or host grants tunnel creation
    async fn authorize(&self) -> bool;
}
