// Shared types between the policy core, the orchestrator and the daemon

//! Shared data structures
//!
//! This module defines the data model shared between components: application
//! identifiers, routing modes, session and subscription state, and the
//! configuration structures loaded from TOML.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

/// Platform package name of an installed application
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApplicationId(String);

impl ApplicationId {
    /// Wrap a package name
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw package name
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefix test used by the umbrella closure rule
    pub fn starts_with(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }
}

impl fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ApplicationId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ApplicationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Which applications the user named
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingShape {
    /// Every application; the named set is ignored
    Global,
    /// A single target application (may not be picked yet)
    Focus(Option<ApplicationId>),
    /// A whitelist of applications
    Casual(BTreeSet<ApplicationId>),
}

/// User-selected routing policy snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingMode {
    /// Which applications are named
    pub shape: RoutingShape,
    /// true: the named set is tunneled. false: the named set bypasses the tunnel.
    pub stealth: bool,
}

impl RoutingMode {
    /// Route everything but the own package
    pub fn global(stealth: bool) -> Self {
        Self {
            shape: RoutingShape::Global,
            stealth,
        }
    }

    /// Route around a single target
    pub fn focus(target: Option<ApplicationId>, stealth: bool) -> Self {
        Self {
            shape: RoutingShape::Focus(target),
            stealth,
        }
    }

    /// Route around a whitelist
    pub fn casual<I, A>(whitelist: I, stealth: bool) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<ApplicationId>,
    {
        Self {
            shape: RoutingShape::Casual(whitelist.into_iter().map(Into::into).collect()),
            stealth,
        }
    }

    /// Whether the named set is ignored
    pub fn is_global(&self) -> bool {
        matches!(self.shape, RoutingShape::Global)
    }

    /// The named application set before dependency expansion
    pub fn base_set(&self) -> BTreeSet<ApplicationId> {
        match &self.shape {
            RoutingShape::Global => BTreeSet::new(),
            RoutingShape::Focus(target) => target
                .iter()
                .filter(|t| !t.as_str().is_empty())
                .cloned()
                .collect(),
            RoutingShape::Casual(whitelist) => whitelist.clone(),
        }
    }

    /// Short label used in diagnostics
    pub fn label(&self) -> &'static str {
        match self.shape {
            RoutingShape::Global => "GLOBAL",
            RoutingShape::Focus(_) => "FOCUS",
            RoutingShape::Casual(_) => "CASUAL",
        }
    }
}

/// Dependency-closed set of applications for one session start
pub type EffectiveRoutingSet = BTreeSet<ApplicationId>;

/// Session state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session
    Idle,
    /// Waiting for the platform permission prompt
    AwaitingAuthorization,
    /// Tunnel interface being created
    Establishing,
    /// Tunnel up, engine running
    Active,
    /// Cleanup in progress
    Stopping,
}

impl SessionState {
    /// Lowercase name written to the status file
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::AwaitingAuthorization => "awaiting-authorization",
            SessionState::Establishing => "establishing",
            SessionState::Active => "active",
            SessionState::Stopping => "stopping",
        }
    }
}

/// Entitlement as last reported by the remote authority
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionState {
    /// Bearer token, empty when logged out
    pub token: String,
    /// Account name
    pub username: String,
    /// Premium flag as last reported
    pub is_premium: bool,
    /// End of the paid period; `None` means open-ended
    pub expiry: Option<DateTime<Utc>>,
}

impl SubscriptionState {
    /// Whether an account is logged in
    pub fn has_token(&self) -> bool {
        !self.token.is_empty()
    }

    /// Premium and not past its expiry; a premium account without expiry is entitled
    pub fn is_entitled_at(&self, now: DateTime<Utc>) -> bool {
        self.is_premium && self.expiry.map_or(true, |expiry| expiry >= now)
    }
}

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Identity, logging and file locations
    pub general: GeneralConfig,
    /// Tunnel interface parameters
    #[serde(default)]
    pub tunnel: TunnelConfig,
    /// Subscription guard timing
    #[serde(default)]
    pub guard: GuardConfig,
    /// Blocked counter timing
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Packet engine process
    #[serde(default)]
    pub engine: EngineConfig,
    /// Foreground trigger polling
    #[serde(default)]
    pub trigger: TriggerConfig,
    /// Extra companion entries merged over the built-in table
    #[serde(default)]
    pub dependencies: BTreeMap<String, Vec<String>>,
}

/// General configuration options
#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    /// Package id of this client; always kept out of the tunnel
    pub own_app_id: String,
    /// Default `env_logger` filter
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Remote authority base URL
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Preferences file
    #[serde(default = "default_prefs_path")]
    pub prefs_path: PathBuf,
    /// Master key for stored secrets
    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,
    /// Status file for external monitors
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

/// Tunnel interface parameters
#[derive(Debug, Deserialize, Clone)]
pub struct TunnelConfig {
    /// Session label shown by the platform
    #[serde(default = "default_session_name")]
    pub session_name: String,
    /// TUN device name
    #[serde(default = "default_interface")]
    pub interface: String,
    /// Local address in CIDR notation
    #[serde(default = "default_address")]
    pub address: String,
    /// Routes sent through the tunnel, CIDR notation
    #[serde(default = "default_routes")]
    pub routes: Vec<String>,
    /// Resolvers set on the tunnel
    #[serde(default = "default_dns")]
    pub dns: Vec<String>,
    /// Interface MTU
    #[serde(default = "default_mtu")]
    pub mtu: u16,
}

/// Subscription guard timing
#[derive(Debug, Deserialize, Clone)]
pub struct GuardConfig {
    /// Seconds between entitlement checks
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    /// Timeout for each remote call
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Counter window timing
#[derive(Debug, Deserialize, Clone)]
pub struct MetricsConfig {
    /// Seconds before the displayed counter starts over
    #[serde(default = "default_window")]
    pub window_secs: u64,
    /// Seconds between engine counter reads
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

/// External packet engine process
#[derive(Debug, Deserialize, Clone, Default)]
pub struct EngineConfig {
    /// Engine executable; unset means no engine
    #[serde(default)]
    pub command: Option<PathBuf>,
    /// Extra engine arguments
    #[serde(default)]
    pub args: Vec<String>,
    /// File the engine keeps its raw blocked counter in
    #[serde(default)]
    pub counter_file: Option<PathBuf>,
}

/// Foreground trigger polling
#[derive(Debug, Deserialize, Clone)]
pub struct TriggerConfig {
    /// How often the foreground application is sampled
    #[serde(default = "default_trigger_poll_interval")]
    pub poll_interval_secs: u64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_trigger_poll_interval(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            session_name: default_session_name(),
            interface: default_interface(),
            address: default_address(),
            routes: default_routes(),
            dns: default_dns(),
            mtu: default_mtu(),
        }
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

// Default values for configuration
fn default_log_level() -> String {
    "info".to_string()
}

fn default_server_url() -> String {
    "http://127.0.0.1:3000".to_string()
}

fn default_prefs_path() -> PathBuf {
    PathBuf::from("/var/lib/focus-shield/prefs.toml")
}

fn default_key_path() -> PathBuf {
    PathBuf::from("/var/lib/focus-shield/master.key")
}

fn default_state_file() -> PathBuf {
    PathBuf::from("/run/focus-shield/state")
}

fn default_session_name() -> String {
    "FocusShield".to_string()
}

fn default_interface() -> String {
    "shield0".to_string()
}

fn default_address() -> String {
    "10.0.0.1/24".to_string()
}

fn default_routes() -> Vec<String> {
    vec!["0.0.0.0/0".to_string()]
}

fn default_dns() -> Vec<String> {
    vec!["1.1.1.1".to_string()]
}

fn default_mtu() -> u16 {
    1280
}

fn default_check_interval() -> u64 {
    4 * 60 * 60 // 4 hours
}

fn default_request_timeout() -> u64 {
    5
}

fn default_window() -> u64 {
    24 * 60 * 60 // 24 hours
}

fn default_poll_interval() -> u64 {
    3
}

fn default_trigger_poll_interval() -> u64 {
    1
}
