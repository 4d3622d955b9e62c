// Remote authority client

//! HTTP+JSON client for the subscription backend
//!
//! Endpoints:
//! - `POST /api/auth/{login|register}` with `{username, password}`
//! - `GET /api/vpn/config[?nodeId=N]` (bearer) returning the access key
//! - `GET /api/vpn/regions` (bearer) returning `[{id, regionName}]`
//! - `GET /api/vpn/test-key` (no auth) returning a public sample key
//!
//! Response classification lives in the `decode_*` functions so it can be
//! tested without a server.

use crate::error::{RemoteError, RemoteResult};
use crate::types::SubscriptionState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

/// Timeout for calls a user is waiting on (the backend may be cold-starting)
pub const INTERACTIVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Which auth endpoint to call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthKind {
    /// Existing account
    Login,
    /// New account
    Register,
}

impl AuthKind {
    fn path(self) -> &'static str {
        match self {
            AuthKind::Login => "login",
            AuthKind::Register => "register",
        }
    }
}

/// User object returned by the auth endpoints
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct AuthUser {
    /// Account name
    #[serde(default = "guest_username")]
    pub username: String,
    /// Whether the account has paid access
    #[serde(rename = "isPremium", default)]
    pub is_premium: bool,
    /// End of the paid period
    #[serde(default, deserialize_with = "deserialize_expiry")]
    pub expiry: Option<DateTime<Utc>>,
    /// Key assigned by an operator, when there is one
    #[serde(rename = "assignedKey", default)]
    pub assigned_key: Option<String>,
}

fn guest_username() -> String {
    "Guest".to_string()
}

/// Successful login or registration
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct AuthSession {
    /// Bearer token for later calls
    #[serde(default)]
    pub token: String,
    /// Account the token belongs to
    pub user: AuthUser,
}

impl AuthSession {
    /// Account state to persist
    pub fn into_subscription(self) -> SubscriptionState {
        SubscriptionState {
            token: self.token,
            username: self.user.username,
            is_premium: self.user.is_premium,
            expiry: self.user.expiry,
        }
    }
}

/// Outcome of `GET /api/vpn/config`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigFetch {
    /// 200: a config, with the current expiry
    Key {
        /// Access key or other config string
        config: String,
        /// `None` when the server reports no expiry
        expiry: Option<DateTime<Utc>>,
    },
    /// 403: not premium or past expiry
    Expired,
    /// 401: token missing or rejected
    Unauthorized,
}

/// Server location the user can pick
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Region {
    /// Node id sent as `nodeId`
    pub id: i64,
    /// Display name
    #[serde(rename = "regionName")]
    pub region_name: String,
}

#[derive(Deserialize)]
struct ConfigBody {
    config: String,
    #[serde(default, deserialize_with = "deserialize_expiry")]
    expiry: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

#[derive(Serialize)]
struct Credentials<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawExpiry {
    Millis(i64),
    Text(String),
}

/// Expiry arrives either as an ISO-8601 string or as epoch milliseconds
fn deserialize_expiry<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<RawExpiry> = Option::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        // Zero is what the server sends for "no expiry recorded"
        Some(RawExpiry::Millis(0)) => Ok(None),
        Some(RawExpiry::Millis(ms)) => DateTime::from_timestamp_millis(ms)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("expiry out of range: {}", ms))),
        Some(RawExpiry::Text(text)) if text.is_empty() => Ok(None),
        Some(RawExpiry::Text(text)) => DateTime::parse_from_rfc3339(&text)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(serde::de::Error::custom),
    }
}

fn rejection(status: u16, body: &str) -> RemoteError {
    let message = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.error)
        .unwrap_or_else(|| format!("CODE_{}", status));
    RemoteError::Rejected(message)
}

/// Classify an auth response
pub fn decode_auth(status: u16, body: &str) -> RemoteResult<AuthSession> {
    if status != 200 {
        return Err(rejection(status, body));
    }
    Ok(serde_json::from_str(body)?)
}

/// Classify a config response
pub fn decode_config(status: u16, body: &str) -> RemoteResult<ConfigFetch> {
    match status {
        200 => {
            let parsed: ConfigBody = serde_json::from_str(body)?;
            Ok(ConfigFetch::Key {
                config: parsed.config,
                expiry: parsed.expiry,
            })
        }
        403 => Ok(ConfigFetch::Expired),
        401 => Ok(ConfigFetch::Unauthorized),
        other => Err(RemoteError::Status(other)),
    }
}

/// Classify a regions response
pub fn decode_regions(status: u16, body: &str) -> RemoteResult<Vec<Region>> {
    if status != 200 {
        return Err(RemoteError::Status(status));
    }
    Ok(serde_json::from_str(body)?)
}

/// Classify a test-key response
pub fn decode_test_key(status: u16, body: &str) -> RemoteResult<String> {
    if status != 200 {
        return Err(RemoteError::Status(status));
    }
    let parsed: ConfigBody = serde_json::from_str(body)?;
    Ok(parsed.config)
}

/// Request/response contract of the subscription backend
#[async_trait]
pub trait RemoteAuthority: Send + Sync {
    /// Log in or register
    async fn authenticate(
        &self,
        kind: AuthKind,
        username: &str,
        password: &str,
    ) -> RemoteResult<AuthSession>;

    /// Current key for the account, optionally on a chosen node
    async fn fetch_config(&self, token: &str, node_id: Option<i64>) -> RemoteResult<ConfigFetch>;

    /// Nodes the account may pick
    async fn regions(&self, token: &str) -> RemoteResult<Vec<Region>>;

    /// Public key for trying the service without an account
    async fn test_key(&self) -> RemoteResult<String>;
}

/// reqwest-backed [`RemoteAuthority`]
#[derive(Debug, Clone)]
pub struct RemoteClient {
    client: Client,
    base_url: String,
    check_timeout: Duration,
}

impl RemoteClient {
    /// `check_timeout` applies to config fetches; interactive calls use
    /// [`INTERACTIVE_TIMEOUT`]
    pub fn new(base_url: impl Into<String>, check_timeout: Duration) -> RemoteResult<Self> {
        let client = Client::builder()
            .connect_timeout(INTERACTIVE_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            check_timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get(
        &self,
        url: String,
        token: Option<&str>,
        timeout: Duration,
    ) -> RemoteResult<(u16, String)> {
        let mut request = self.client.get(&url).timeout(timeout);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        log::debug!("GET {} -> {}", url, status);
        Ok((status, body))
    }
}

#[async_trait]
impl RemoteAuthority for RemoteClient {
    async fn authenticate(
        &self,
        kind: AuthKind,
        username: &str,
        password: &str,
    ) -> RemoteResult<AuthSession> {
        let url = self.url(&format!("/api/auth/{}", kind.path()));
        let response = self
            .client
            .post(&url)
            .timeout(INTERACTIVE_TIMEOUT)
            .json(&Credentials { username, password })
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.text().await?;
        log::debug!("POST {} -> {}", url, status);
        decode_auth(status, &body)
    }

    async fn fetch_config(&self, token: &str, node_id: Option<i64>) -> RemoteResult<ConfigFetch> {
        let url = match node_id {
            Some(id) => self.url(&format!("/api/vpn/config?nodeId={}", id)),
            None => self.url("/api/vpn/config"),
        };
        let (status, body) = self.get(url, Some(token), self.check_timeout).await?;
        decode_config(status, &body)
    }

    async fn regions(&self, token: &str) -> RemoteResult<Vec<Region>> {
        let (status, body) = self
            .get(self.url("/api/vpn/regions"), Some(token), INTERACTIVE_TIMEOUT)
            .await?;
        decode_regions(status, &body)
    }

    async fn test_key(&self) -> RemoteResult<String> {
        let (status, body) = self
            .get(self.url("/api/vpn/test-key"), None, INTERACTIVE_TIMEOUT)
            .await?;
        decode_test_key(status, &body)
    }
}
