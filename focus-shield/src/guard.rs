// Periodic subscription revalidation

//! Subscription guard
//!
//! While a session is active the guard revalidates entitlement against the
//! remote authority: once immediately, then every `check_interval`. An
//! `Expired` or `Unauthorized` result fires the teardown callback and ends the
//! loop; `Unreachable` is logged and ignored. At most one check is in flight,
//! and [`SubscriptionGuard::stop`] cancels any check still running.

use crate::events::EventBus;
use crate::prefs::Preferences;
use crate::remote::{ConfigFetch, RemoteAuthority};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Result of one entitlement check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Server answered with a config, entitlement refreshed
    Valid,
    /// Server reported the subscription as expired (403)
    Expired,
    /// Server rejected the account token (401)
    Unauthorized,
    /// No answer, or no token to ask with
    Unreachable,
}

impl CheckOutcome {
    /// Whether this outcome must tear the session down
    pub fn revokes(&self) -> bool {
        matches!(self, CheckOutcome::Expired | CheckOutcome::Unauthorized)
    }
}

/// Invoked once when entitlement is lost
pub type ExpiredCallback = Box<dyn FnOnce(CheckOutcome) + Send + 'static>;

struct GuardInner {
    remote: Arc<dyn RemoteAuthority>,
    prefs: Preferences,
    bus: EventBus,
    in_flight: Mutex<()>,
}

impl GuardInner {
    async fn check(&self) -> CheckOutcome {
        let _in_flight = self.in_flight.lock().await;

        let sub = self.prefs.subscription();
        if !sub.has_token() {
            log::debug!("No account token stored, skipping entitlement check");
            return CheckOutcome::Unreachable;
        }

        match self
            .remote
            .fetch_config(&sub.token, self.prefs.selected_node())
            .await
        {
            Ok(ConfigFetch::Key { expiry, .. }) => {
                if let Err(e) = self.prefs.record_entitlement(expiry) {
                    log::warn!("Failed to persist refreshed subscription: {:#}", e);
                }
                CheckOutcome::Valid
            }
            Ok(ConfigFetch::Expired) => CheckOutcome::Expired,
            Ok(ConfigFetch::Unauthorized) => CheckOutcome::Unauthorized,
            Err(e) if e.is_transient() => {
                log::warn!("Entitlement check failed: {}", e);
                CheckOutcome::Unreachable
            }
            Err(e) => {
                log::error!("Entitlement check returned an unusable answer: {}", e);
                CheckOutcome::Unreachable
            }
        }
    }
}

/// Periodic entitlement checker
pub struct SubscriptionGuard {
    inner: Arc<GuardInner>,
    check_interval: Duration,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionGuard {
    /// Create a stopped guard that checks every `check_interval` once started
    pub fn new(
        remote: Arc<dyn RemoteAuthority>,
        prefs: Preferences,
        bus: EventBus,
        check_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(GuardInner {
                remote,
                prefs,
                bus,
                in_flight: Mutex::new(()),
            }),
            check_interval,
            task: None,
        }
    }

    /// Run a single check now
    pub async fn check_now(&self) -> CheckOutcome {
        self.inner.check().await
    }

    /// Whether the periodic loop is still alive
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Start periodic checks; a running loop is replaced
    pub fn start(&mut self, on_expired: ExpiredCallback) {
        if let Some(previous) = self.task.take() {
            previous.abort();
        }

        let inner = self.inner.clone();
        let period = self.check_interval;

        log::info!("Starting subscription guard (every {}s)", period.as_secs());

        self.task = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                // First tick completes immediately
                ticker.tick().await;

                let outcome = inner.check().await;
                log::debug!("Entitlement check: {:?}", outcome);

                if outcome.revokes() {
                    inner.bus.log("GUARD >> SUBSCRIPTION_REVOKED");
                    on_expired(outcome);
                    break;
                }
            }
        }));
    }

    /// Cancel the loop and wait until it is gone
    pub async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
            log::debug!("Subscription guard stopped");
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
