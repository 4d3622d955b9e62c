// Session state machine

//! State machine for the tunnel session lifecycle
//!
//! Pure transition function: the orchestrator feeds every event through
//! [`SessionStateMachine::handle_command`] and performs the returned action.
//! A stop requested while authorization or establishment is still pending is
//! remembered and honoured once that step resolves.

use crate::types::SessionState;

/// Commands that trigger state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    /// User asked for a session (routability already checked)
    Engage,
    /// Platform permission granted
    AuthorizationGranted,
    /// Platform permission refused
    AuthorizationDenied,
    /// Tunnel interface created
    Established,
    /// Tunnel interface could not be created
    EstablishFailed,
    /// User asked to stop
    StopRequested,
    /// Subscription guard reported expiry or revoked token
    EntitlementLost,
    /// Engine entry point returned on its own
    EngineTerminated,
    /// Teardown finished
    CleanupComplete,
}

/// Actions to take in response to state changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    /// Ask the platform for permission
    RequestAuthorization,
    /// Build parameters and create the tunnel interface
    Establish,
    /// Tunnel is up: flag active, start guard and engine
    StartSession,
    /// Tear everything down
    Cleanup,
    /// Engage arrived while a session exists
    RejectBusy,
    /// Permission refused, back to idle
    ReportDenied,
    /// Tunnel creation failed, back to idle
    ReportEstablishFailed,
    /// Stop arrived during startup; nothing was created
    Abandon,
    /// No action needed
    None,
}

/// Session state machine
#[derive(Debug)]
pub struct SessionStateMachine {
    state: SessionState,
    stop_pending: bool,
}

impl SessionStateMachine {
    /// Machine in `Idle`
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            stop_pending: false,
        }
    }

    /// Handle a command and return the action to take
    pub fn handle_command(&mut self, cmd: SessionCommand) -> SessionAction {
        log::debug!(
            "Session: {:?} (stop pending: {}), Command: {:?}",
            self.state,
            self.stop_pending,
            cmd
        );

        match (self.state, cmd) {
            (SessionState::Idle, SessionCommand::Engage) => {
                log::info!("Engaging session, requesting authorization");
                self.state = SessionState::AwaitingAuthorization;
                self.stop_pending = false;
                SessionAction::RequestAuthorization
            }

            // Single session per process
            (_, SessionCommand::Engage) => {
                log::warn!("Engage rejected, session is {:?}", self.state);
                SessionAction::RejectBusy
            }

            (SessionState::AwaitingAuthorization, SessionCommand::AuthorizationGranted) => {
                if self.stop_pending {
                    log::info!("Authorization granted after stop request, abandoning");
                    self.state = SessionState::Idle;
                    self.stop_pending = false;
                    SessionAction::Abandon
                } else {
                    log::info!("Authorization granted, establishing tunnel");
                    self.state = SessionState::Establishing;
                    SessionAction::Establish
                }
            }

            (SessionState::AwaitingAuthorization, SessionCommand::AuthorizationDenied) => {
                log::warn!("Authorization denied");
                self.state = SessionState::Idle;
                self.stop_pending = false;
                SessionAction::ReportDenied
            }

            // Startup steps cannot be interrupted; remember the stop
            (SessionState::AwaitingAuthorization, SessionCommand::StopRequested)
            | (SessionState::Establishing, SessionCommand::StopRequested) => {
                log::info!("Stop requested during {:?}, deferring", self.state);
                self.stop_pending = true;
                SessionAction::None
            }

            (SessionState::Establishing, SessionCommand::Established) => {
                if self.stop_pending {
                    log::info!("Tunnel established after stop request, tearing down");
                    self.state = SessionState::Stopping;
                    self.stop_pending = false;
                    SessionAction::Cleanup
                } else {
                    log::info!("Tunnel established, session active");
                    self.state = SessionState::Active;
                    SessionAction::StartSession
                }
            }

            (SessionState::Establishing, SessionCommand::EstablishFailed) => {
                log::warn!("Tunnel establishment failed");
                self.state = SessionState::Idle;
                self.stop_pending = false;
                SessionAction::ReportEstablishFailed
            }

            (SessionState::Active, SessionCommand::StopRequested)
            | (SessionState::Active, SessionCommand::EntitlementLost)
            | (SessionState::Active, SessionCommand::EngineTerminated) => {
                log::info!("Tearing down active session ({:?})", cmd);
                self.state = SessionState::Stopping;
                SessionAction::Cleanup
            }

            (SessionState::Stopping, SessionCommand::CleanupComplete) => {
                log::info!("Cleanup complete, session idle");
                self.state = SessionState::Idle;
                SessionAction::None
            }

            (SessionState::Idle, SessionCommand::StopRequested) => {
                log::info!("Stop requested but already offline");
                SessionAction::None
            }

            // Teardown already under way
            (SessionState::Stopping, SessionCommand::StopRequested)
            | (SessionState::Stopping, SessionCommand::EntitlementLost)
            | (SessionState::Stopping, SessionCommand::EngineTerminated) => {
                log::debug!("{:?} during teardown, ignoring", cmd);
                SessionAction::None
            }

            // Ignore other combinations
            _ => {
                log::debug!(
                    "No action for state {:?} with command {:?}",
                    self.state,
                    cmd
                );
                SessionAction::None
            }
        }
    }

    /// Get current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether a stop is waiting for a startup step to resolve
    pub fn stop_pending(&self) -> bool {
        self.stop_pending
    }
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
