// State file writer for external monitoring
//!
//! Writes the current session state to a file for consumption by the
//! `status` subcommand and status-bar widgets.

use crate::types::SessionState;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::SystemTime;

/// What the daemon publishes about itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    /// Session lifecycle state
    pub state: SessionState,
    /// Routing mode label, empty when idle
    pub mode: String,
    /// Displayed blocked counter
    pub blocked: u64,
    /// Whether lockdown is engaged
    pub lockdown: bool,
    /// Most recent session failure
    pub error: Option<String>,
}

/// Write current state to the state file
pub fn write_state(path: &Path, snapshot: &StatusSnapshot) -> Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            fs::create_dir_all(dir).context("Failed to create state directory")?;
        }
    }

    let timestamp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let mut content = format!(
        "STATE={}\nACTIVE={}\nMODE={}\nBLOCKED={}\nLOCKDOWN={}\nTIMESTAMP={}\n",
        snapshot.state.as_str(),
        snapshot.state == SessionState::Active,
        snapshot.mode,
        snapshot.blocked,
        snapshot.lockdown,
        timestamp
    );
    if let Some(error) = &snapshot.error {
        // One line per key
        content.push_str(&format!("ERROR={}\n", error.replace('\n', " ")));
    }

    fs::write(path, content).context("Failed to write state file")?;

    Ok(())
}

/// Read the state file back as `KEY -> value`
pub fn read_state(path: &Path) -> Result<BTreeMap<String, String>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read state file {:?}", path))?;

    Ok(content
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect())
}

/// Remove state file on shutdown
pub fn cleanup(path: &Path) {
    let _ = fs::remove_file(path);
}
