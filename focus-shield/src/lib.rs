// Focus Shield Library
// Shared modules for the daemon and tests

#![warn(missing_docs)]

//! Focus Shield Library
//!
//! Core of a per-application tunnel client: it decides which applications are
//! routed through a local tunnel, drives the tunnel session lifecycle, and
//! revalidates the user's subscription while a session is up.
//!
//! # Main Components
//!
//! - [`config`]: Configuration file parsing and validation
//! - [`closure`]: Companion-package dependency closure
//! - [`policy`]: Routing mode resolution into allow/disallow filters
//! - [`metrics`]: Rolling blocked-request counter window
//! - [`events`]: Diagnostic log stream and state signals
//! - [`session`]: State machine for the session lifecycle
//! - [`orchestrator`]: Actor that drives sessions through the state machine
//! - [`guard`]: Periodic subscription revalidation
//! - [`remote`]: HTTP client for the remote authority
//! - [`access_key`]: `ss://` access key parsing and host substitution
//! - [`prefs`] / [`credentials`]: Persistent preferences and encrypted secrets
//! - [`tunnel`] / [`platform`]: Collaborator contracts and their Linux implementations
//! - [`trigger`]: Foreground-application auto-start trigger
//! - [`state_file`]: Status file for external monitoring
//! - [`types`]: Shared data structures

pub mod access_key;
pub mod closure;
pub mod config;
pub mod credentials;
pub mod error;
pub mod events;
pub mod guard;
pub mod metrics;
pub mod orchestrator;
pub mod platform;
pub mod policy;
pub mod prefs;
pub mod remote;
pub mod session;
pub mod state_file;
pub mod trigger;
pub mod tunnel;
pub mod types;

#[cfg(test)]
mod test_support;
