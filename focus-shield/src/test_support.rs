// Mock collaborators shared by unit tests

use crate::credentials::CredentialStore;
use crate::error::{RemoteError, RemoteResult};
use crate::prefs::{MemoryPreferences, Preferences};
use crate::remote::{AuthKind, AuthSession, AuthUser, ConfigFetch, RemoteAuthority, Region};
use crate::tunnel::{
    Authorizer, EngineEntry, PacketEngine, TunnelDescriptor, TunnelParams, TunnelPrimitive,
};
use crate::trigger::ForegroundSource;
use crate::types::ApplicationId;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Identity "encryption" so tests can inspect stored values
pub struct PlainCredentials;

impl CredentialStore for PlainCredentials {
    fn encrypt(&self, plain: &str) -> String {
        plain.to_string()
    }

    fn decrypt(&self, encoded: &str) -> String {
        encoded.to_string()
    }
}

pub fn memory_prefs() -> Preferences {
    Preferences::new(Arc::new(MemoryPreferences::new()), Arc::new(PlainCredentials))
}

/// Canned reply for `fetch_config`
#[derive(Debug, Clone)]
pub enum MockConfigReply {
    Key(String),
    KeyWithExpiry(String, DateTime<Utc>),
    Expired,
    Unauthorized,
    Status(u16),
}

struct CountGuard<'a>(&'a AtomicUsize);

impl Drop for CountGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Scriptable remote authority
pub struct MockAuthority {
    reply: Mutex<MockConfigReply>,
    delay: Mutex<Duration>,
    config_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    last_node: Mutex<Option<Option<i64>>>,
}

impl MockAuthority {
    pub fn new() -> Self {
        Self {
            reply: Mutex::new(MockConfigReply::Key(
                "ss://YWVzLTEyOC1nY206cHc@203.0.113.7:8388".to_string(),
            )),
            delay: Mutex::new(Duration::ZERO),
            config_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            last_node: Mutex::new(None),
        }
    }

    pub fn set_reply(&self, reply: MockConfigReply) {
        *self.reply.lock().unwrap() = reply;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn config_calls(&self) -> usize {
        self.config_calls.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn last_node(&self) -> Option<Option<i64>> {
        *self.last_node.lock().unwrap()
    }
}

#[async_trait]
impl RemoteAuthority for MockAuthority {
    async fn authenticate(
        &self,
        _kind: AuthKind,
        username: &str,
        password: &str,
    ) -> RemoteResult<AuthSession> {
        if password != "correct" {
            return Err(RemoteError::Rejected("INVALID_CREDENTIALS".to_string()));
        }
        Ok(AuthSession {
            token: "jwt".to_string(),
            user: AuthUser {
                username: username.to_string(),
                is_premium: true,
                expiry: None,
                assigned_key: None,
            },
        })
    }

    async fn fetch_config(&self, _token: &str, node_id: Option<i64>) -> RemoteResult<ConfigFetch> {
        self.config_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_node.lock().unwrap() = Some(node_id);

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = CountGuard(&self.in_flight);

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let reply = self.reply.lock().unwrap().clone();
        match reply {
            MockConfigReply::Key(config) => Ok(ConfigFetch::Key {
                config,
                expiry: None,
            }),
            MockConfigReply::KeyWithExpiry(config, expiry) => Ok(ConfigFetch::Key {
                config,
                expiry: Some(expiry),
            }),
            MockConfigReply::Expired => Ok(ConfigFetch::Expired),
            MockConfigReply::Unauthorized => Ok(ConfigFetch::Unauthorized),
            MockConfigReply::Status(code) => Err(RemoteError::Status(code)),
        }
    }

    async fn regions(&self, _token: &str) -> RemoteResult<Vec<Region>> {
        Ok(vec![Region {
            id: 1,
            region_name: "Singapore".to_string(),
        }])
    }

    async fn test_key(&self) -> RemoteResult<String> {
        Ok("ss://YWVzLTEyOC1nY206cHc@203.0.113.7:8388".to_string())
    }
}

/// Tunnel primitive that counts establish/close calls
pub struct MockTunnel {
    pub fail: AtomicBool,
    delay: Mutex<Duration>,
    next_id: AtomicU64,
    establish_calls: AtomicUsize,
    close_calls: AtomicUsize,
    last_params: Mutex<Option<TunnelParams>>,
}

impl MockTunnel {
    pub fn new() -> Self {
        Self {
            fail: AtomicBool::new(false),
            delay: Mutex::new(Duration::ZERO),
            next_id: AtomicU64::new(1),
            establish_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            last_params: Mutex::new(None),
        }
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn establish_calls(&self) -> usize {
        self.establish_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn last_params(&self) -> Option<TunnelParams> {
        self.last_params.lock().unwrap().clone()
    }
}

#[async_trait]
impl TunnelPrimitive for MockTunnel {
    async fn establish(&self, params: &TunnelParams) -> Option<TunnelDescriptor> {
        self.establish_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_params.lock().unwrap() = Some(params.clone());

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.fail.load(Ordering::SeqCst) {
            return None;
        }
        Some(TunnelDescriptor {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            name: params.interface.clone(),
        })
    }

    async fn close(&self, _descriptor: &TunnelDescriptor) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Packet engine whose run loops block until `terminate` is called
pub struct MockEngine {
    pub available: AtomicBool,
    raw_count: AtomicU64,
    key: Mutex<Option<String>>,
    domains: Mutex<Option<String>>,
    entries: Mutex<Vec<EngineEntry>>,
    running: AtomicUsize,
    terminate_tx: watch::Sender<bool>,
}

impl MockEngine {
    pub fn new() -> Self {
        let (terminate_tx, _) = watch::channel(false);
        Self {
            available: AtomicBool::new(true),
            raw_count: AtomicU64::new(0),
            key: Mutex::new(None),
            domains: Mutex::new(None),
            entries: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            terminate_tx,
        }
    }

    pub fn set_raw_count(&self, count: u64) {
        self.raw_count.store(count, Ordering::SeqCst);
    }

    /// Make every running (and future) loop return
    pub fn terminate(&self) {
        self.terminate_tx.send_replace(true);
    }

    pub fn key(&self) -> Option<String> {
        self.key.lock().unwrap().clone()
    }

    pub fn domains(&self) -> Option<String> {
        self.domains.lock().unwrap().clone()
    }

    pub fn entries(&self) -> Vec<EngineEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    async fn run(&self, entry: EngineEntry) -> Result<()> {
        self.entries.lock().unwrap().push(entry);
        self.running.fetch_add(1, Ordering::SeqCst);
        let _running = CountGuard(&self.running);

        let mut terminate = self.terminate_tx.subscribe();
        let _ = terminate.wait_for(|stop| *stop).await;
        Ok(())
    }
}

#[async_trait]
impl PacketEngine for MockEngine {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn set_key(&self, key: &str) {
        *self.key.lock().unwrap() = Some(key.to_string());
    }

    fn set_allowed_domains(&self, csv: &str) {
        *self.domains.lock().unwrap() = Some(csv.to_string());
    }

    fn raw_blocked_count(&self) -> u64 {
        self.raw_count.load(Ordering::SeqCst)
    }

    async fn run_active_loop(&self, _descriptor: &TunnelDescriptor) -> Result<()> {
        self.run(EngineEntry::ActiveLoop).await
    }

    async fn run_passive_shield(&self, _descriptor: &TunnelDescriptor) -> Result<()> {
        self.run(EngineEntry::PassiveShield).await
    }
}

/// Permission prompt with a fixed answer
pub struct MockAuthorizer {
    pub grant: AtomicBool,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
}

impl MockAuthorizer {
    pub fn new(grant: bool) -> Self {
        Self {
            grant: AtomicBool::new(grant),
            delay: Mutex::new(Duration::ZERO),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Authorizer for MockAuthorizer {
    async fn authorize(&self) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.grant.load(Ordering::SeqCst)
    }
}

/// Foreground application set by the test
#[derive(Default)]
pub struct MockForeground {
    app: Mutex<Option<ApplicationId>>,
    failing: AtomicBool,
    reads: AtomicUsize,
}

impl MockForeground {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, app: Option<&str>) {
        *self.app.lock().unwrap() = app.map(ApplicationId::from);
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ForegroundSource for MockForeground {
    async fn foreground_app(&self) -> Result<Option<ApplicationId>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("usage data unavailable");
        }
        Ok(self.app.lock().unwrap().clone())
    }
}
