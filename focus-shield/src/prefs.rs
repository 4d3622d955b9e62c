// Persistent user preferences

//! Preference storage
//!
//! [`PreferenceStore`] is the raw synchronous key/value contract. [`Preferences`]
//! is the typed view the CLI and the orchestrator use: routing policy, account
//! state, and encrypted secrets.

use crate::credentials::CredentialStore;
use crate::types::{ApplicationId, RoutingMode, SubscriptionState};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

const KEY_MODE: &str = "app_mode";
const KEY_FOCUS_TARGET: &str = "focus_target";
const KEY_CASUAL_WHITELIST: &str = "casual_whitelist";
const KEY_STEALTH: &str = "stealth_mode";
const KEY_GLOBAL: &str = "vpn_tunnel_global";
const KEY_LOCAL_BYPASS: &str = "local_bypass";
const KEY_ALLOWED_DOMAINS: &str = "allowed_domains";
const KEY_SELECTED_NODE: &str = "selected_node_id";
const KEY_SYNC_ENDPOINT: &str = "sync_endpoint";
const KEY_AUTH_TOKEN: &str = "auth_token";
const KEY_AUTH_USERNAME: &str = "auth_username";
const KEY_AUTH_PREMIUM: &str = "auth_is_premium";
const KEY_AUTH_EXPIRY: &str = "auth_expiry";
const KEY_ACCESS_KEY: &str = "access_key";
const KEY_AUTO_START: &str = "auto_start";
const KEY_AUTO_TRIGGER: &str = "auto_start_trigger";
const KEY_TRIGGER_APPS: &str = "auto_start_apps";

/// Synchronous key/value storage
pub trait PreferenceStore: Send + Sync {
    /// Stored value, if any
    fn get(&self, key: &str) -> Option<String>;
    /// `None` removes the key
    fn set(&self, key: &str, value: Option<&str>) -> Result<()>;
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryPreferences {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryPreferences {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceStore for MemoryPreferences {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.values).get(key).cloned()
    }

    fn set(&self, key: &str, value: Option<&str>) -> Result<()> {
        let mut values = lock(&self.values);
        match value {
            Some(value) => values.insert(key.to_string(), value.to_string()),
            None => values.remove(key),
        };
        Ok(())
    }
}

/// TOML-file store, rewritten on every set
#[derive(Debug)]
pub struct FilePreferences {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl FilePreferences {
    /// Open the file at `path`; a missing file starts empty
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read preferences from {:?}", path))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse preferences in {:?}", path))?
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    fn persist(&self, values: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("Failed to create preferences directory")?;
        }

        let serialized = toml::to_string(values).context("Failed to serialize preferences")?;
        let mut tmp = self.path.clone();
        tmp.set_extension("tmp");
        fs::write(&tmp, serialized).context("Failed to write preferences")?;
        fs::rename(&tmp, &self.path).context("Failed to replace preferences file")?;
        Ok(())
    }
}

impl PreferenceStore for FilePreferences {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.values).get(key).cloned()
    }

    fn set(&self, key: &str, value: Option<&str>) -> Result<()> {
        let mut values = lock(&self.values);
        match value {
            Some(value) => values.insert(key.to_string(), value.to_string()),
            None => values.remove(key),
        };
        self.persist(&values)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Which named set the non-global policy uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PolicyKind {
    #[default]
    /// Single focus target
    Focus,
    /// Casual whitelist
    Casual,
}

impl PolicyKind {
    /// Stored spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyKind::Focus => "FOCUS",
            PolicyKind::Casual => "CASUAL",
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "FOCUS" => Ok(PolicyKind::Focus),
            "CASUAL" => Ok(PolicyKind::Casual),
            other => anyhow::bail!("Unknown mode '{}', expected focus or casual", other),
        }
    }
}

/// Typed preferences over a store and a credential capability
#[derive(Clone)]
pub struct Preferences {
    store: Arc<dyn PreferenceStore>,
    credentials: Arc<dyn CredentialStore>,
}

impl Preferences {
    /// Typed view; secrets go through `credentials`
    pub fn new(store: Arc<dyn PreferenceStore>, credentials: Arc<dyn CredentialStore>) -> Self {
        Self { store, credentials }
    }

    fn get_bool(&self, key: &str) -> bool {
        self.store.get(key).is_some_and(|v| v == "true")
    }

    fn set_bool(&self, key: &str, value: bool) -> Result<()> {
        self.store.set(key, Some(if value { "true" } else { "false" }))
    }

    fn get_nonempty(&self, key: &str) -> Option<String> {
        self.store.get(key).filter(|v| !v.is_empty())
    }

    /// Snapshot of the stored policy
    pub fn routing_mode(&self) -> RoutingMode {
        let stealth = self.is_stealth();
        if self.is_global() {
            return RoutingMode::global(stealth);
        }

        match self.policy_kind() {
            PolicyKind::Focus => RoutingMode::focus(self.focus_target(), stealth),
            PolicyKind::Casual => RoutingMode::casual(self.casual_whitelist(), stealth),
        }
    }

    /// Which named set a non-global policy uses
    pub fn policy_kind(&self) -> PolicyKind {
        self.store
            .get(KEY_MODE)
            .and_then(|v| v.parse().ok())
            .unwrap_or_default()
    }

    /// Store the policy kind
    pub fn set_policy_kind(&self, kind: PolicyKind) -> Result<()> {
        self.store.set(KEY_MODE, Some(kind.as_str()))
    }

    /// Focus-mode target application
    pub fn focus_target(&self) -> Option<ApplicationId> {
        self.get_nonempty(KEY_FOCUS_TARGET).map(ApplicationId::from)
    }

    /// Store the focus target; `None` clears it
    pub fn set_focus_target(&self, target: Option<&ApplicationId>) -> Result<()> {
        self.store
            .set(KEY_FOCUS_TARGET, target.map(ApplicationId::as_str))
    }

    /// Casual-mode application set
    pub fn casual_whitelist(&self) -> BTreeSet<ApplicationId> {
        self.store
            .get(KEY_CASUAL_WHITELIST)
            .map(|csv| split_csv(&csv).map(ApplicationId::from).collect())
            .unwrap_or_default()
    }

    /// Replace the casual whitelist
    pub fn set_casual_whitelist(&self, apps: &BTreeSet<ApplicationId>) -> Result<()> {
        let csv = apps
            .iter()
            .map(ApplicationId::as_str)
            .collect::<Vec<_>>()
            .join(",");
        self.store.set(KEY_CASUAL_WHITELIST, Some(&csv))
    }

    /// Stealth (allow-list) routing
    pub fn is_stealth(&self) -> bool {
        self.get_bool(KEY_STEALTH)
    }

    /// Turn stealth routing on or off
    pub fn set_stealth(&self, stealth: bool) -> Result<()> {
        self.set_bool(KEY_STEALTH, stealth)
    }

    /// Route everything except the own package
    pub fn is_global(&self) -> bool {
        self.get_bool(KEY_GLOBAL)
    }

    /// Turn global routing on or off
    pub fn set_global(&self, global: bool) -> Result<()> {
        self.set_bool(KEY_GLOBAL, global)
    }

    /// Let applications bypass the tunnel for local-network traffic
    pub fn local_bypass(&self) -> bool {
        self.get_bool(KEY_LOCAL_BYPASS)
    }

    /// Turn local bypass on or off
    pub fn set_local_bypass(&self, bypass: bool) -> Result<()> {
        self.set_bool(KEY_LOCAL_BYPASS, bypass)
    }

    /// Comma-separated domains the engine lets through
    pub fn allowed_domains(&self) -> String {
        self.store.get(KEY_ALLOWED_DOMAINS).unwrap_or_default()
    }

    /// Store allowed domains, trimming blanks
    pub fn set_allowed_domains(&self, csv: &str) -> Result<()> {
        let normalized = split_csv(csv).collect::<Vec<_>>().join(",");
        self.store.set(KEY_ALLOWED_DOMAINS, Some(&normalized))
    }

    /// Selected server node; `None` means the server default
    pub fn selected_node(&self) -> Option<i64> {
        self.store
            .get(KEY_SELECTED_NODE)
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|id| *id >= 0)
    }

    /// Store the server node; `None` restores the server default
    pub fn set_selected_node(&self, node: Option<i64>) -> Result<()> {
        self.store
            .set(KEY_SELECTED_NODE, node.map(|id| id.to_string()).as_deref())
    }

    /// Backend URL override
    pub fn sync_endpoint(&self) -> Option<String> {
        self.get_nonempty(KEY_SYNC_ENDPOINT)
    }

    /// Store or clear the backend URL override
    pub fn set_sync_endpoint(&self, url: Option<&str>) -> Result<()> {
        self.store.set(KEY_SYNC_ENDPOINT, url)
    }

    /// Stored account state
    pub fn subscription(&self) -> SubscriptionState {
        SubscriptionState {
            token: self.store.get(KEY_AUTH_TOKEN).unwrap_or_default(),
            username: self.store.get(KEY_AUTH_USERNAME).unwrap_or_default(),
            is_premium: self.get_bool(KEY_AUTH_PREMIUM),
            expiry: self
                .get_nonempty(KEY_AUTH_EXPIRY)
                .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }

    /// Replace the stored account state
    pub fn save_subscription(&self, sub: &SubscriptionState) -> Result<()> {
        self.store.set(KEY_AUTH_TOKEN, Some(&sub.token))?;
        self.store.set(KEY_AUTH_USERNAME, Some(&sub.username))?;
        self.set_bool(KEY_AUTH_PREMIUM, sub.is_premium)?;
        self.store.set(
            KEY_AUTH_EXPIRY,
            sub.expiry.map(|e| e.to_rfc3339()).as_deref(),
        )
    }

    /// Mark the account entitled after a successful config fetch
    ///
    /// `expiry` replaces the stored one; `None` means open-ended access.
    pub fn record_entitlement(&self, expiry: Option<DateTime<Utc>>) -> Result<()> {
        let mut sub = self.subscription();
        sub.is_premium = true;
        sub.expiry = expiry;
        self.save_subscription(&sub)
    }

    /// Forget the account; the stored access key is left in place
    pub fn clear_auth(&self) -> Result<()> {
        for key in [KEY_AUTH_TOKEN, KEY_AUTH_USERNAME, KEY_AUTH_PREMIUM, KEY_AUTH_EXPIRY] {
            self.store.set(key, None)?;
        }
        Ok(())
    }

    /// Decrypted remote access key, empty when none is stored
    pub fn access_key(&self) -> String {
        self.store
            .get(KEY_ACCESS_KEY)
            .map(|v| self.credentials.decrypt(&v))
            .unwrap_or_default()
    }

    /// Encrypt and store the access key
    pub fn save_access_key(&self, key: &str) -> Result<()> {
        let encrypted = self.credentials.encrypt(key.trim());
        self.store.set(KEY_ACCESS_KEY, Some(&encrypted))
    }

    /// Engage the stored policy when the daemon starts at boot
    pub fn auto_start(&self) -> bool {
        self.get_bool(KEY_AUTO_START)
    }

    /// Turn boot autostart on or off
    pub fn set_auto_start(&self, enabled: bool) -> Result<()> {
        self.set_bool(KEY_AUTO_START, enabled)
    }

    /// Engage while a trigger application is in the foreground
    pub fn auto_trigger(&self) -> bool {
        self.get_bool(KEY_AUTO_TRIGGER)
    }

    /// Turn the foreground trigger on or off
    pub fn set_auto_trigger(&self, enabled: bool) -> Result<()> {
        self.set_bool(KEY_AUTO_TRIGGER, enabled)
    }

    /// Applications whose foreground use starts a session
    pub fn trigger_apps(&self) -> BTreeSet<ApplicationId> {
        self.store
            .get(KEY_TRIGGER_APPS)
            .map(|csv| split_csv(&csv).map(ApplicationId::from).collect())
            .unwrap_or_default()
    }

    /// Replace the trigger application set
    pub fn set_trigger_apps(&self, apps: &BTreeSet<ApplicationId>) -> Result<()> {
        let csv = apps
            .iter()
            .map(ApplicationId::as_str)
            .collect::<Vec<_>>()
            .join(",");
        self.store.set(KEY_TRIGGER_APPS, Some(&csv))
    }
}

fn split_csv(csv: &str) -> impl Iterator<Item = &str> {
    csv.split(',').map(str::trim).filter(|s| !s.is_empty())
}
