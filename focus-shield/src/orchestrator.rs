// Session orchestrator actor

//! Session orchestrator
//!
//! One task owns the [`SessionStateMachine`] and every per-session resource.
//! Callers talk to it through an [`OrchestratorHandle`]; slow steps
//! (authorization, key sync plus establish, teardown) run in spawned tasks that
//! report back over the same command channel, so transitions are applied one
//! at a time in arrival order.

use crate::access_key::{is_access_key, substitute_host_literal};
use crate::error::SessionError;
use crate::events::EventBus;
use crate::guard::{CheckOutcome, SubscriptionGuard};
use crate::policy::PolicyResolver;
use crate::prefs::Preferences;
use crate::remote::{ConfigFetch, RemoteAuthority};
use crate::session::{SessionAction, SessionCommand, SessionStateMachine};
use crate::tunnel::{
    Authorizer, EngineEntry, PacketEngine, TunnelDescriptor, TunnelParams, TunnelPrimitive,
};
use crate::types::{ApplicationId, Config, RoutingMode, SessionState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

type EngageReply = oneshot::Sender<Result<(), SessionError>>;

/// Services the orchestrator drives
pub struct OrchestratorDeps {
    /// Daemon configuration
    pub config: Arc<Config>,
    /// Stored policy, account and key
    pub prefs: Preferences,
    /// Companion-table resolver
    pub resolver: PolicyResolver,
    /// Diagnostics and state signals
    pub bus: EventBus,
    /// Remote authority for key sync and the guard
    pub remote: Arc<dyn RemoteAuthority>,
    /// Tunnel interface control
    pub tunnel: Arc<dyn TunnelPrimitive>,
    /// Packet engine
    pub engine: Arc<dyn PacketEngine>,
    /// Tunnel permission check
    pub authorizer: Arc<dyn Authorizer>,
}

/// Result of a successful establish step
struct Established {
    descriptor: TunnelDescriptor,
    key: String,
    // Key sync failure, reported once the session is up
    sync_error: Option<SessionError>,
}

enum Message {
    Engage {
        mode: RoutingMode,
        reply: EngageReply,
    },
    Stop,
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    Authorized(bool),
    EstablishDone(Result<Established, SessionError>),
    EntitlementLost(CheckOutcome),
    EngineTerminated,
    CleanupComplete,
}

/// Cloneable front end to the orchestrator task
#[derive(Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::UnboundedSender<Message>,
    state_rx: watch::Receiver<SessionState>,
    error_rx: watch::Receiver<Option<SessionError>>,
}

impl OrchestratorHandle {
    /// Start a session; resolves once it is Active or has failed
    pub async fn engage(&self, mode: RoutingMode) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Message::Engage { mode, reply })
            .map_err(|_| SessionError::ShutDown)?;
        rx.await.unwrap_or(Err(SessionError::ShutDown))
    }

    /// Request teardown; a no-op when already offline
    pub fn stop(&self) {
        let _ = self.tx.send(Message::Stop);
    }

    /// Stop any session and end the orchestrator task
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Message::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Watch lifecycle state changes
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Most recent failure since the last accepted engage
    ///
    /// Covers failed starts as well as problems after a session came up
    /// (missing engine, engine exit, revoked subscription, key sync errors).
    pub fn last_error(&self) -> Option<SessionError> {
        self.error_rx.borrow().clone()
    }
}

/// Owner of the session lifecycle
pub struct SessionOrchestrator {
    deps: OrchestratorDeps,
    own_app: ApplicationId,
    machine: SessionStateMachine,
    tx: mpsc::WeakUnboundedSender<Message>,
    state_tx: watch::Sender<SessionState>,
    error_tx: watch::Sender<Option<SessionError>>,

    mode: Option<RoutingMode>,
    pending_reply: Option<EngageReply>,

    // Per-session resources, taken exactly once by teardown
    descriptor: Option<TunnelDescriptor>,
    guard: Option<SubscriptionGuard>,
    engine_task: Option<JoinHandle<()>>,
    counter_task: Option<JoinHandle<()>>,

    shutdown_waiters: Vec<oneshot::Sender<()>>,
}

impl SessionOrchestrator {
    /// Spawn the orchestrator task and return its handle
    ///
    /// The task ends on `shutdown`, or once every handle has been dropped and
    /// no session task still holds a sender.
    pub fn spawn(deps: OrchestratorDeps) -> OrchestratorHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (error_tx, error_rx) = watch::channel(None);

        let orchestrator = Self {
            own_app: ApplicationId::new(deps.config.general.own_app_id.clone()),
            deps,
            machine: SessionStateMachine::new(),
            tx: tx.downgrade(),
            state_tx,
            error_tx,
            mode: None,
            pending_reply: None,
            descriptor: None,
            guard: None,
            engine_task: None,
            counter_task: None,
            shutdown_waiters: Vec::new(),
        };

        tokio::spawn(orchestrator.run(rx));

        OrchestratorHandle {
            tx,
            state_rx,
            error_rx,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Message>) {
        log::debug!("Session orchestrator started");

        while let Some(msg) = rx.recv().await {
            self.handle_message(msg);
            self.state_tx.send_replace(self.machine.state());

            if !self.shutdown_waiters.is_empty() && self.machine.state() == SessionState::Idle {
                for waiter in self.shutdown_waiters.drain(..) {
                    let _ = waiter.send(());
                }
                break;
            }
        }

        // Empty after a clean shutdown
        self.abort_resources();
        log::info!("Session orchestrator stopped");
    }

    fn handle_message(&mut self, msg: Message) {
        match msg {
            Message::Engage { mode, reply } => self.on_engage(mode, reply),
            Message::Stop => self.apply(SessionCommand::StopRequested),
            Message::Shutdown { reply } => {
                log::info!("Orchestrator shutdown requested");
                self.shutdown_waiters.push(reply);
                self.apply(SessionCommand::StopRequested);
            }
            Message::Authorized(true) => self.apply(SessionCommand::AuthorizationGranted),
            Message::Authorized(false) => self.apply(SessionCommand::AuthorizationDenied),
            Message::EstablishDone(Ok(established)) => {
                let Established {
                    descriptor,
                    key,
                    sync_error,
                } = established;
                self.descriptor = Some(descriptor);
                let action = self.machine.handle_command(SessionCommand::Established);
                match action {
                    SessionAction::StartSession => {
                        if let Some(e) = sync_error {
                            self.record_error(e);
                        }
                        self.start_session(&key);
                    }
                    other => self.perform(other),
                }
            }
            Message::EstablishDone(Err(e)) => {
                log::error!("Establish step failed: {}", e);
                let action = self.machine.handle_command(SessionCommand::EstablishFailed);
                if action == SessionAction::ReportEstablishFailed {
                    self.deps.bus.log("SYSTEM >> TUNNEL FAILED");
                    self.reply(Err(e));
                }
            }
            Message::EntitlementLost(outcome) => {
                if self.machine.state() == SessionState::Active {
                    let reason = match outcome {
                        CheckOutcome::Unauthorized => "account token rejected",
                        _ => "subscription expired",
                    };
                    self.record_error(SessionError::Entitlement(reason.to_string()));
                }
                self.apply(SessionCommand::EntitlementLost);
            }
            Message::EngineTerminated => {
                if self.machine.state() == SessionState::Active {
                    self.record_error(SessionError::UnexpectedEngineTermination);
                }
                self.apply(SessionCommand::EngineTerminated);
            }
            Message::CleanupComplete => self.apply(SessionCommand::CleanupComplete),
        }
    }

    fn on_engage(&mut self, mode: RoutingMode, reply: EngageReply) {
        if !self.shutdown_waiters.is_empty() {
            let _ = reply.send(Err(SessionError::ShutDown));
            return;
        }

        if self.machine.state() == SessionState::Idle
            && !self.deps.resolver.is_routable(&mode, &self.own_app)
        {
            self.deps.bus.log("SYSTEM >> PICK A TARGET APP FIRST");
            let err = SessionError::Configuration("pick a target application first".to_string());
            self.record_error(err.clone());
            let _ = reply.send(Err(err));
            return;
        }

        match self.machine.handle_command(SessionCommand::Engage) {
            SessionAction::RequestAuthorization => {
                log::info!("Engaging {} session", mode.label());
                self.error_tx.send_replace(None);
                self.mode = Some(mode);
                self.pending_reply = Some(reply);
                self.request_authorization();
            }
            _ => {
                let _ = reply.send(Err(SessionError::AlreadyRunning));
            }
        }
    }

    fn apply(&mut self, cmd: SessionCommand) {
        let action = self.machine.handle_command(cmd);
        self.perform(action);
    }

    fn perform(&mut self, action: SessionAction) {
        match action {
            SessionAction::RequestAuthorization => self.request_authorization(),
            SessionAction::Establish => self.establish(),
            SessionAction::Cleanup => {
                // A pending engage only exists when stop won the race with establish
                self.reply(Err(SessionError::Cancelled));
                self.cleanup();
            }
            SessionAction::ReportDenied => {
                self.deps.bus.log("SYSTEM >> PERMISSION DENIED");
                self.reply(Err(SessionError::PermissionDenied));
            }
            SessionAction::ReportEstablishFailed => {
                self.deps.bus.log("SYSTEM >> TUNNEL FAILED");
                self.reply(Err(SessionError::Establish));
            }
            SessionAction::Abandon => {
                self.deps.bus.log("SYSTEM >> START CANCELLED");
                self.reply(Err(SessionError::Cancelled));
            }
            SessionAction::StartSession | SessionAction::RejectBusy | SessionAction::None => {}
        }
    }

    fn reply(&mut self, result: Result<(), SessionError>) {
        if let Some(reply) = self.pending_reply.take() {
            if let Err(e) = &result {
                if *e != SessionError::Cancelled {
                    self.record_error(e.clone());
                }
            }
            let _ = reply.send(result);
        }
    }

    fn record_error(&self, err: SessionError) {
        log::warn!("Session error: {}", err);
        self.error_tx.send_replace(Some(err));
    }

    /// Strong sender for a spawned task; `None` once every handle is gone
    fn sender(&self) -> Option<mpsc::UnboundedSender<Message>> {
        self.tx.upgrade()
    }

    fn request_authorization(&self) {
        let Some(tx) = self.sender() else { return };
        let authorizer = self.deps.authorizer.clone();

        tokio::spawn(async move {
            let granted = authorizer.authorize().await;
            let _ = tx.send(Message::Authorized(granted));
        });
    }

    fn establish(&self) {
        let Some(tx) = self.sender() else { return };
        let Some(mode) = self.mode.clone() else {
            log::error!("Establish requested without a routing mode");
            let _ = tx.send(Message::EstablishDone(Err(SessionError::Configuration(
                "no routing mode".to_string(),
            ))));
            return;
        };

        let ctx = EstablishContext {
            config: self.deps.config.clone(),
            prefs: self.deps.prefs.clone(),
            resolver: self.deps.resolver.clone(),
            remote: self.deps.remote.clone(),
            tunnel: self.deps.tunnel.clone(),
            own_app: self.own_app.clone(),
        };

        tokio::spawn(async move {
            let result = ctx.run(&mode).await;
            let _ = tx.send(Message::EstablishDone(result));
        });
    }

    fn start_session(&mut self, key: &str) {
        let bus = &self.deps.bus;
        let stealth_lockdown = self
            .mode
            .as_ref()
            .is_some_and(|m| m.stealth && !m.is_global());
        let label = self.mode.as_ref().map(|m| m.label()).unwrap_or("unknown");

        bus.reset_counter();
        bus.set_active(true);
        bus.set_lockdown(stealth_lockdown);
        bus.log(format!("SYSTEM >> SHIELD ACTIVE ({})", label));

        if self.deps.prefs.subscription().has_token() {
            let mut guard = SubscriptionGuard::new(
                self.deps.remote.clone(),
                self.deps.prefs.clone(),
                bus.clone(),
                Duration::from_secs(self.deps.config.guard.check_interval_secs),
            );
            if let Some(tx) = self.sender() {
                guard.start(Box::new(move |outcome| {
                    let _ = tx.send(Message::EntitlementLost(outcome));
                }));
            }
            self.guard = Some(guard);
        } else {
            log::info!("No account token, subscription guard not started");
        }

        self.start_engine(key);
        self.reply(Ok(()));
    }

    fn start_engine(&mut self, key: &str) {
        let engine = self.deps.engine.clone();
        let bus = self.deps.bus.clone();

        if !engine.is_available() {
            bus.log("ENGINE >> ENGINE MISSING");
            self.record_error(SessionError::EngineUnavailable);
            return;
        }

        engine.set_allowed_domains(&self.deps.prefs.allowed_domains());
        engine.set_key(key);

        let Some(descriptor) = self.descriptor.clone() else { return };
        let entry = EngineEntry::for_key(key);
        log::info!("Starting packet engine ({:?})", entry);

        if let Some(tx) = self.sender() {
            let engine = engine.clone();
            let bus = bus.clone();
            self.engine_task = Some(tokio::spawn(async move {
                let result = match entry {
                    EngineEntry::ActiveLoop => engine.run_active_loop(&descriptor).await,
                    EngineEntry::PassiveShield => engine.run_passive_shield(&descriptor).await,
                };
                match result {
                    Ok(()) => log::warn!("Packet engine exited"),
                    Err(e) => log::error!("Packet engine failed: {:#}", e),
                }
                bus.log("ENGINE >> TERMINATED");
                let _ = tx.send(Message::EngineTerminated);
            }));
        }

        let period = Duration::from_secs(self.deps.config.metrics.poll_interval_secs.max(1));
        self.counter_task = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let displayed = bus.update_counter(engine.raw_blocked_count());
                log::trace!("Blocked counter: {}", displayed);
            }
        }));
    }

    fn cleanup(&mut self) {
        let resources = SessionResources {
            descriptor: self.descriptor.take(),
            guard: self.guard.take(),
            engine_task: self.engine_task.take(),
            counter_task: self.counter_task.take(),
        };
        let tunnel = self.deps.tunnel.clone();
        let bus = self.deps.bus.clone();
        self.mode = None;

        match self.sender() {
            Some(tx) => {
                tokio::spawn(async move {
                    resources.teardown(tunnel.as_ref(), &bus).await;
                    let _ = tx.send(Message::CleanupComplete);
                });
            }
            None => resources.abort(),
        }
    }

    fn abort_resources(&mut self) {
        SessionResources {
            descriptor: self.descriptor.take(),
            guard: self.guard.take(),
            engine_task: self.engine_task.take(),
            counter_task: self.counter_task.take(),
        }
        .abort();
    }
}

struct SessionResources {
    descriptor: Option<TunnelDescriptor>,
    guard: Option<SubscriptionGuard>,
    engine_task: Option<JoinHandle<()>>,
    counter_task: Option<JoinHandle<()>>,
}

impl SessionResources {
    async fn teardown(mut self, tunnel: &dyn TunnelPrimitive, bus: &EventBus) {
        if let Some(mut guard) = self.guard.take() {
            guard.stop().await;
        }

        for task in [self.counter_task.take(), self.engine_task.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
            let _ = task.await;
        }

        if let Some(descriptor) = self.descriptor.take() {
            log::info!("Closing tunnel {} ({})", descriptor.name, descriptor.id);
            tunnel.close(&descriptor).await;
        }

        bus.set_active(false);
        bus.set_lockdown(false);
        bus.log("SYSTEM >> SHIELD OFFLINE");
    }

    /// Best effort when no task can run the async teardown
    fn abort(self) {
        for task in [self.counter_task, self.engine_task].into_iter().flatten() {
            task.abort();
        }
        if let Some(descriptor) = self.descriptor {
            log::warn!("Orchestrator gone with tunnel {} still open", descriptor.name);
        }
        // Guard aborts its own task on drop
    }
}

/// Everything the establish task needs, detached from the orchestrator
struct EstablishContext {
    config: Arc<Config>,
    prefs: Preferences,
    resolver: PolicyResolver,
    remote: Arc<dyn RemoteAuthority>,
    tunnel: Arc<dyn TunnelPrimitive>,
    own_app: ApplicationId,
}

impl EstablishContext {
    async fn run(&self, mode: &RoutingMode) -> Result<Established, SessionError> {
        let sync_error = self.sync_key().await;

        let mut key = self.prefs.access_key();
        if !key.is_empty() {
            key = substitute_host_literal(&key).await;
        }

        let effective = self.resolver.resolve(mode);
        let filter = PolicyResolver::app_filter(mode, &effective, &self.own_app);
        log::debug!(
            "{} {} application(s) for {} mode",
            if filter.is_allow() { "Allowing" } else { "Disallowing" },
            filter.apps().len(),
            mode.label()
        );

        let params = TunnelParams::from_config(&self.config.tunnel, filter, self.prefs.local_bypass())
            .map_err(|e| SessionError::Configuration(format!("{:#}", e)))?;

        let descriptor = self
            .tunnel
            .establish(&params)
            .await
            .ok_or(SessionError::Establish)?;

        Ok(Established {
            descriptor,
            key,
            sync_error,
        })
    }

    /// Pull the latest access key; failures leave the stored key in place
    async fn sync_key(&self) -> Option<SessionError> {
        let sub = self.prefs.subscription();
        if !sub.has_token() {
            return None;
        }

        match self
            .remote
            .fetch_config(&sub.token, self.prefs.selected_node())
            .await
        {
            Ok(ConfigFetch::Key { config, expiry }) => {
                if let Err(e) = self.prefs.record_entitlement(expiry) {
                    log::warn!("Failed to persist refreshed subscription: {:#}", e);
                }
                if !is_access_key(&config) {
                    log::warn!("Server returned a non ss:// config");
                } else if let Err(e) = self.prefs.save_access_key(&config) {
                    log::warn!("Failed to store access key: {:#}", e);
                } else {
                    log::info!("Access key synced");
                }
                None
            }
            Ok(other) => {
                log::warn!("Key sync skipped: {:?}", other);
                None
            }
            Err(e) => {
                log::warn!("Key sync failed: {}", e);
                Some(SessionError::from(e))
            }
        }
    }
}
