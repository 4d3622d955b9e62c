// Foreground application trigger

//! Foreground trigger
//!
//! A [`ForegroundSource`] reports which application the user is in front of.
//! [`TriggerMonitor`] samples it and emits a [`TriggerEvent`] whenever a
//! trigger application comes into view or leaves it. [`TriggerController`]
//! turns those events into engage/stop calls on the orchestrator, and only
//! ever stops a session it started itself.

use crate::events::EventBus;
use crate::orchestrator::OrchestratorHandle;
use crate::prefs::Preferences;
use crate::types::{ApplicationId, SessionState};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

/// Trigger transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerEvent {
    /// A trigger application came to the foreground
    TargetForeground(ApplicationId),
    /// No trigger application is in the foreground any more
    TargetLeft,
}

/// Where the foreground application comes from
#[async_trait]
pub trait ForegroundSource: Send + Sync {
    /// Application currently in front of the user, `None` when there is none
    async fn foreground_app(&self) -> Result<Option<ApplicationId>>;
}

/// Polls a [`ForegroundSource`] and reports trigger transitions
pub struct TriggerMonitor {
    source: Arc<dyn ForegroundSource>,
    trigger_apps: BTreeSet<ApplicationId>,
    own_app: ApplicationId,
    poll_interval: Duration,
}

impl TriggerMonitor {
    /// Monitor for `trigger_apps`; the client's own package never counts
    pub fn new(
        source: Arc<dyn ForegroundSource>,
        trigger_apps: BTreeSet<ApplicationId>,
        own_app: ApplicationId,
        poll_interval: Duration,
    ) -> Self {
        Self {
            source,
            trigger_apps,
            own_app,
            poll_interval,
        }
    }

    /// Sample the source until the receiver is gone
    pub async fn monitor(&self, tx: mpsc::Sender<TriggerEvent>) -> Result<()> {
        log::info!(
            "Starting foreground trigger for {} application(s)",
            self.trigger_apps.len()
        );

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut on_target = false;

        loop {
            ticker.tick().await;

            let app = match self.source.foreground_app().await {
                Ok(app) => app,
                Err(e) => {
                    log::warn!("Failed to read foreground application: {:#}", e);
                    continue;
                }
            };

            // Switching to the client itself changes nothing
            if app.as_ref() == Some(&self.own_app) {
                continue;
            }

            let event = match app {
                Some(app) if self.trigger_apps.contains(&app) => {
                    if on_target {
                        continue;
                    }
                    on_target = true;
                    log::info!("Trigger application in foreground: {}", app);
                    TriggerEvent::TargetForeground(app)
                }
                _ => {
                    if !on_target {
                        continue;
                    }
                    on_target = false;
                    log::info!("Trigger application left the foreground");
                    TriggerEvent::TargetLeft
                }
            };

            if tx.send(event).await.is_err() {
                log::debug!("Trigger receiver gone, stopping monitor");
                return Ok(());
            }
        }
    }
}

/// Drives the orchestrator from trigger events
pub struct TriggerController {
    handle: OrchestratorHandle,
    prefs: Preferences,
    bus: EventBus,
    auto_started: bool,
}

impl TriggerController {
    /// Controller that engages the stored policy through `handle`
    pub fn new(handle: OrchestratorHandle, prefs: Preferences, bus: EventBus) -> Self {
        Self {
            handle,
            prefs,
            bus,
            auto_started: false,
        }
    }

    /// Whether the current session was started by a trigger
    pub fn auto_started(&self) -> bool {
        self.auto_started
    }

    /// React to one trigger event
    pub fn handle_event(&mut self, event: TriggerEvent) {
        let state = self.handle.state();

        match event {
            TriggerEvent::TargetForeground(app) => {
                if state != SessionState::Idle {
                    return;
                }
                self.bus.log(format!("AUTO-START >> APP_DETECTED: {}", app));
                self.auto_started = true;

                let handle = self.handle.clone();
                let mode = self.prefs.routing_mode();
                tokio::spawn(async move {
                    if let Err(e) = handle.engage(mode).await {
                        log::warn!("Triggered session failed to start: {}", e);
                    }
                });
            }
            TriggerEvent::TargetLeft => {
                if self.auto_started && state != SessionState::Idle {
                    self.bus.log("AUTO-START >> TARGET_LEFT: ENTERING_SLEEP");
                    self.handle.stop();
                }
                self.auto_started = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::closure::DependencyGraph;
    use crate::orchestrator::{OrchestratorDeps, SessionOrchestrator};
    use crate::policy::PolicyResolver;
    use crate::test_support::{
        memory_prefs, MockAuthority, MockAuthorizer, MockEngine, MockForeground, MockTunnel,
    };
    use crate::types::Config;

    const OWN_APP: &str = "org.focusshield.client";
    const TARGET: &str = "com.instagram.android";

    fn monitor(source: Arc<MockForeground>) -> TriggerMonitor {
        TriggerMonitor::new(
            source,
            BTreeSet::from([ApplicationId::from(TARGET)]),
            ApplicationId::from(OWN_APP),
            Duration::from_secs(1),
        )
    }

    fn spawn_orchestrator(prefs: Preferences, bus: EventBus) -> (OrchestratorHandle, Arc<MockTunnel>) {
        let config: Config =
            toml::from_str(&format!("[general]\nown_app_id = \"{}\"\n", OWN_APP)).unwrap();
        let tunnel = Arc::new(MockTunnel::new());
        let handle = SessionOrchestrator::spawn(OrchestratorDeps {
            config: Arc::new(config),
            prefs,
            resolver: PolicyResolver::new(Arc::new(DependencyGraph::builtin())),
            bus,
            remote: Arc::new(MockAuthority::new()),
            tunnel: tunnel.clone(),
            engine: Arc::new(MockEngine::new()),
            authorizer: Arc::new(MockAuthorizer::new(true)),
        });
        (handle, tunnel)
    }

    async fn wait_for(handle: &OrchestratorHandle, state: SessionState) {
        let mut rx = handle.subscribe_state();
        rx.wait_for(|s| *s == state).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_reports_transitions_once() {
        let source = Arc::new(MockForeground::new());
        let (tx, mut rx) = mpsc::channel(8);
        let task = tokio::spawn({
            let m = monitor(source.clone());
            async move { m.monitor(tx).await }
        });

        source.set(Some("org.example.mail"));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(rx.try_recv().is_err());

        source.set(Some(TARGET));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(
            rx.try_recv().unwrap(),
            TriggerEvent::TargetForeground(ApplicationId::from(TARGET))
        );
        assert!(rx.try_recv().is_err());

        source.set(None);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(rx.try_recv().unwrap(), TriggerEvent::TargetLeft);
        assert!(rx.try_recv().is_err());

        drop(rx);
        source.set(Some(TARGET));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_ignores_own_app_and_errors() {
        let source = Arc::new(MockForeground::new());
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn({
            let m = monitor(source.clone());
            async move { m.monitor(tx).await }
        });

        source.set(Some(TARGET));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(matches!(rx.try_recv(), Ok(TriggerEvent::TargetForeground(_))));

        // Opening the client or a failed read does not end the trigger
        source.set(Some(OWN_APP));
        tokio::time::sleep(Duration::from_secs(2)).await;
        source.fail(true);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
        assert!(source.reads() > 3);

        source.fail(false);
        source.set(Some("org.example.mail"));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(rx.try_recv().unwrap(), TriggerEvent::TargetLeft);
    }

    #[tokio::test(start_paused = true)]
    async fn test_controller_engages_and_stops_its_own_session() {
        let prefs = memory_prefs();
        prefs.set_focus_target(Some(&ApplicationId::from(TARGET))).unwrap();
        let bus = EventBus::default();
        let (handle, tunnel) = spawn_orchestrator(prefs.clone(), bus.clone());
        let mut controller = TriggerController::new(handle.clone(), prefs, bus);

        controller.handle_event(TriggerEvent::TargetForeground(ApplicationId::from(TARGET)));
        wait_for(&handle, SessionState::Active).await;
        assert!(controller.auto_started());

        // Already running, nothing new
        controller.handle_event(TriggerEvent::TargetForeground(ApplicationId::from(TARGET)));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(tunnel.establish_calls(), 1);

        controller.handle_event(TriggerEvent::TargetLeft);
        wait_for(&handle, SessionState::Idle).await;
        assert_eq!(tunnel.close_calls(), 1);
        assert!(!controller.auto_started());
    }

    #[tokio::test(start_paused = true)]
    async fn test_controller_leaves_manual_session_alone() {
        let prefs = memory_prefs();
        let bus = EventBus::default();
        let (handle, tunnel) = spawn_orchestrator(prefs.clone(), bus.clone());
        let mut controller = TriggerController::new(handle.clone(), prefs.clone(), bus);

        handle.engage(prefs.routing_mode()).await.unwrap();
        controller.handle_event(TriggerEvent::TargetForeground(ApplicationId::from(TARGET)));
        controller.handle_event(TriggerEvent::TargetLeft);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(handle.state(), SessionState::Active);
        assert_eq!(tunnel.close_calls(), 0);
    }
}
