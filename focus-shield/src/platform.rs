// Linux implementations of the tunnel, engine and authorization contracts

//! Linux platform layer
//!
//! [`LinuxTunnel`] drives `ip` to create a TUN device, address it, bring it up
//! and install routes. [`ProcessEngine`] runs the packet engine as a child
//! process bound to that device. [`CapabilityAuthorizer`] stands in for the
//! permission prompt by checking `CAP_NET_ADMIN`. [`ProcessScanSource`] feeds
//! the foreground trigger from the process table.

use crate::config::cidr_contains;
use crate::trigger::ForegroundSource;
use crate::tunnel::{
    Authorizer, EngineEntry, PacketEngine, TunnelDescriptor, TunnelParams, TunnelPrimitive,
};
use crate::types::{ApplicationId, EngineConfig};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::process::Command;

/// `CAP_NET_ADMIN` bit in the capability sets
const CAP_NET_ADMIN: u32 = 12;

/// Validates that a name is safe to use in shell commands.
/// Only allows alphanumeric characters, hyphens, and underscores to prevent command injection.
fn validate_name(name: &str, field_name: &str) -> Result<()> {
    if name.is_empty() {
        anyhow::bail!("{} cannot be empty", field_name);
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        anyhow::bail!(
            "{} contains invalid characters: '{}'. Only alphanumeric, hyphens, and underscores are allowed",
            field_name,
            name
        );
    }

    Ok(())
}

/// Validates that the interface name is safe for use in `ip` invocations.
///
/// # Errors
///
/// Returns an error if the interface name is empty, longer than the kernel's
/// 15-byte limit, or contains invalid characters.
pub fn validate_interface_name(name: &str) -> Result<()> {
    validate_name(name, "Interface name")?;
    if name.len() > 15 {
        anyhow::bail!("Interface name '{}' is longer than 15 characters", name);
    }
    Ok(())
}

/// Run `ip` with the given arguments, failing with its stderr
async fn run_ip(args: &[&str]) -> Result<()> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .await
        .with_context(|| format!("Failed to execute 'ip {}'", args.join(" ")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("'ip {}' failed: {}", args.join(" "), stderr.trim());
    }
    Ok(())
}

/// Replace a default route with two /1 halves so the existing default survives
fn expand_routes(routes: &[String]) -> Vec<String> {
    routes
        .iter()
        .flat_map(|route| match route.as_str() {
            "0.0.0.0/0" | "default" => vec!["0.0.0.0/1".to_string(), "128.0.0.0/1".to_string()],
            other => vec![other.to_string()],
        })
        .collect()
}

/// Local IPv4 addresses on other interfaces that fall inside the tunnel subnet
fn conflicting_addresses(params: &TunnelParams) -> Result<Vec<(String, Ipv4Addr)>> {
    let subnet = format!("{}/{}", params.address, params.prefix);
    let interfaces = if_addrs::get_if_addrs().context("Failed to get interface addresses")?;

    let mut conflicts = Vec::new();
    for iface in interfaces {
        if iface.name == params.interface || iface.is_loopback() {
            continue;
        }
        if let if_addrs::IfAddr::V4(v4) = iface.addr {
            if cidr_contains(&subnet, v4.ip)? {
                conflicts.push((iface.name, v4.ip));
            }
        }
    }
    Ok(conflicts)
}

/// TUN device managed through iproute2
pub struct LinuxTunnel {
    next_id: AtomicU64,
}

impl LinuxTunnel {
    /// Tunnel controller numbering descriptors from 1
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }

    async fn bring_up(&self, params: &TunnelParams) -> Result<()> {
        let dev = params.interface.as_str();
        let address = format!("{}/{}", params.address, params.prefix);
        let mtu = params.mtu.to_string();

        run_ip(&["addr", "add", &address, "dev", dev]).await?;
        run_ip(&["link", "set", "dev", dev, "mtu", &mtu, "up"]).await?;

        for route in expand_routes(&params.routes) {
            run_ip(&["route", "replace", &route, "dev", dev]).await?;
            log::info!("Route active: {} dev {}", route, dev);
        }

        if !params.dns.is_empty() {
            let servers: Vec<String> = params.dns.iter().map(|ip| ip.to_string()).collect();
            let result = Command::new("resolvectl")
                .arg("dns")
                .arg(dev)
                .args(&servers)
                .status()
                .await;
            match result {
                Ok(status) if status.success() => {
                    log::info!("DNS for {}: {}", dev, servers.join(", "))
                }
                _ => log::warn!("Could not set DNS on {}, leaving system resolver", dev),
            }
        }

        Ok(())
    }
}

impl Default for LinuxTunnel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TunnelPrimitive for LinuxTunnel {
    async fn establish(&self, params: &TunnelParams) -> Option<TunnelDescriptor> {
        if let Err(e) = validate_interface_name(&params.interface) {
            log::error!("Refusing to create tunnel: {:#}", e);
            return None;
        }

        match conflicting_addresses(params) {
            Ok(conflicts) => {
                for (iface, ip) in conflicts {
                    log::warn!(
                        "Local address {} on {} overlaps tunnel subnet {}/{}",
                        ip,
                        iface,
                        params.address,
                        params.prefix
                    );
                }
            }
            Err(e) => log::debug!("Skipping address conflict check: {:#}", e),
        }

        log::info!(
            "Creating tunnel {} ({}) mtu {}",
            params.interface,
            params.session_name,
            params.mtu
        );
        log::debug!(
            "Application filter: {} {:?}, local bypass {}",
            if params.app_filter.is_allow() { "allow" } else { "disallow" },
            params.app_filter.apps(),
            params.local_bypass
        );

        if let Err(e) = run_ip(&["tuntap", "add", "dev", &params.interface, "mode", "tun"]).await {
            log::error!("Failed to create TUN device: {:#}", e);
            return None;
        }

        if let Err(e) = self.bring_up(params).await {
            log::error!("Failed to configure {}: {:#}", params.interface, e);
            let _ = run_ip(&["link", "del", "dev", &params.interface]).await;
            return None;
        }

        Some(TunnelDescriptor {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            name: params.interface.clone(),
        })
    }

    async fn close(&self, descriptor: &TunnelDescriptor) {
        // Routes and addresses go away with the device
        match run_ip(&["link", "del", "dev", &descriptor.name]).await {
            Ok(()) => log::info!("Removed tunnel device {}", descriptor.name),
            Err(e) => log::debug!("Tunnel device already gone: {:#}", e),
        }
    }
}

/// Packet engine run as a child process
///
/// The child receives the device name, entry point, key and allowed domains
/// through `FOCUS_SHIELD_*` environment variables, and is killed when the
/// session task drops its future.
pub struct ProcessEngine {
    command: Option<PathBuf>,
    args: Vec<String>,
    counter_file: Option<PathBuf>,
    key: Mutex<String>,
    domains: Mutex<String>,
}

impl ProcessEngine {
    /// Engine described by the `[engine]` section
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            counter_file: config.counter_file.clone(),
            key: Mutex::new(String::new()),
            domains: Mutex::new(String::new()),
        }
    }

    fn snapshot(value: &Mutex<String>) -> String {
        value.lock().map(|v| v.clone()).unwrap_or_default()
    }

    async fn run(&self, descriptor: &TunnelDescriptor, entry: EngineEntry) -> Result<()> {
        let command = self
            .command
            .as_ref()
            .context("No packet engine command configured")?;

        let mode = match entry {
            EngineEntry::ActiveLoop => "active",
            EngineEntry::PassiveShield => "passive",
        };

        let mut child = Command::new(command)
            .args(&self.args)
            .env("FOCUS_SHIELD_INTERFACE", &descriptor.name)
            .env("FOCUS_SHIELD_MODE", mode)
            .env("FOCUS_SHIELD_KEY", Self::snapshot(&self.key))
            .env("FOCUS_SHIELD_ALLOWED_DOMAINS", Self::snapshot(&self.domains))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start packet engine {:?}", command))?;

        log::info!(
            "Packet engine started ({}, pid {})",
            mode,
            child.id().unwrap_or_default()
        );

        let status = child.wait().await.context("Failed to wait for packet engine")?;
        if !status.success() {
            anyhow::bail!("Packet engine exited with {}", status);
        }
        Ok(())
    }
}

#[async_trait]
impl PacketEngine for ProcessEngine {
    fn is_available(&self) -> bool {
        match &self.command {
            // Bare names are resolved through PATH at spawn time
            Some(path) if path.is_absolute() => path.exists(),
            Some(_) => true,
            None => false,
        }
    }

    fn set_key(&self, key: &str) {
        if let Ok(mut current) = self.key.lock() {
            *current = key.to_string();
        }
    }

    fn set_allowed_domains(&self, csv: &str) {
        if let Ok(mut current) = self.domains.lock() {
            *current = csv.to_string();
        }
    }

    fn raw_blocked_count(&self) -> u64 {
        let Some(path) = &self.counter_file else {
            return 0;
        };
        match std::fs::read_to_string(path) {
            Ok(contents) => contents.trim().parse().unwrap_or(0),
            Err(e) => {
                log::trace!("Counter file {:?} unreadable: {}", path, e);
                0
            }
        }
    }

    async fn run_active_loop(&self, descriptor: &TunnelDescriptor) -> Result<()> {
        self.run(descriptor, EngineEntry::ActiveLoop).await
    }

    async fn run_passive_shield(&self, descriptor: &TunnelDescriptor) -> Result<()> {
        self.run(descriptor, EngineEntry::PassiveShield).await
    }
}

/// Extract the effective capability mask from `/proc/<pid>/status`
fn parse_cap_eff(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("CapEff:"))
        .and_then(|hex| u64::from_str_radix(hex.trim(), 16).ok())
}

/// Grants tunnel creation when the process holds `CAP_NET_ADMIN`
pub struct CapabilityAuthorizer;

#[async_trait]
impl Authorizer for CapabilityAuthorizer {
    async fn authorize(&self) -> bool {
        let status = match std::fs::read_to_string("/proc/self/status") {
            Ok(status) => status,
            Err(e) => {
                log::error!("Failed to read process capabilities: {}", e);
                return false;
            }
        };

        let granted = parse_cap_eff(&status).is_some_and(|caps| caps & (1 << CAP_NET_ADMIN) != 0);
        if !granted {
            log::error!("CAP_NET_ADMIN is required to create the tunnel");
        }
        granted
    }
}

/// Treats a running trigger application as the one in front
///
/// A bare Linux host has no foreground notion without a display server, so a
/// process whose name, or the basename of any argument, equals an application
/// id counts as that application being in use.
pub struct ProcessScanSource {
    proc_root: PathBuf,
    candidates: BTreeSet<ApplicationId>,
}

impl ProcessScanSource {
    /// Scan `/proc` for `candidates`
    pub fn new(candidates: BTreeSet<ApplicationId>) -> Self {
        Self::with_root("/proc", candidates)
    }

    /// Scan a different process table root
    pub fn with_root(proc_root: impl Into<PathBuf>, candidates: BTreeSet<ApplicationId>) -> Self {
        Self {
            proc_root: proc_root.into(),
            candidates,
        }
    }
}

/// Names a process answers to: `comm` plus argument basenames
fn process_names(dir: &Path) -> Vec<String> {
    let mut names = Vec::new();
    if let Ok(comm) = std::fs::read_to_string(dir.join("comm")) {
        names.push(comm.trim_end().to_string());
    }
    if let Ok(cmdline) = std::fs::read(dir.join("cmdline")) {
        names.extend(
            cmdline
                .split(|b| *b == 0)
                .filter(|arg| !arg.is_empty())
                .map(|arg| {
                    let arg = String::from_utf8_lossy(arg);
                    arg.rsplit('/').next().unwrap_or_default().to_string()
                }),
        );
    }
    names
}

/// `comm` is cut at 15 bytes, so a full-length comm may be a prefix
fn matches_app(name: &str, app: &ApplicationId) -> bool {
    name == app.as_str() || (name.len() == 15 && app.starts_with(name))
}

fn scan_processes(
    root: &Path,
    candidates: &BTreeSet<ApplicationId>,
) -> Result<Option<ApplicationId>> {
    let entries =
        std::fs::read_dir(root).with_context(|| format!("Failed to list {:?}", root))?;

    for entry in entries.flatten() {
        let is_pid = entry
            .file_name()
            .to_str()
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()));
        if !is_pid {
            continue;
        }

        // Processes may exit mid-scan; unreadable entries are skipped
        for name in process_names(&entry.path()) {
            if let Some(app) = candidates.iter().find(|app| matches_app(&name, app)) {
                return Ok(Some(app.clone()));
            }
        }
    }

    Ok(None)
}

#[async_trait]
impl ForegroundSource for ProcessScanSource {
    async fn foreground_app(&self) -> Result<Option<ApplicationId>> {
        if self.candidates.is_empty() {
            return Ok(None);
        }
        let root = self.proc_root.clone();
        let candidates = self.candidates.clone();
        tokio::task::spawn_blocking(move || scan_processes(&root, &candidates))
            .await
            .context("Process scan task failed")?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn descriptor() -> TunnelDescriptor {
        TunnelDescriptor {
            id: 1,
            name: "fshield0".to_string(),
        }
    }

    fn shell_engine(script: &str) -> ProcessEngine {
        ProcessEngine::from_config(&EngineConfig {
            command: Some(PathBuf::from("/bin/sh")),
            args: vec!["-c".to_string(), script.to_string()],
            counter_file: None,
        })
    }

    #[test]
    fn test_validate_name_valid() {
        assert!(validate_name("fshield0", "test").is_ok());
        assert!(validate_name("tun-focus", "test").is_ok());
        assert!(validate_name("tun_focus", "test").is_ok());
    }

    #[test]
    fn test_validate_name_invalid() {
        assert!(validate_name("", "test").is_err());
        assert!(validate_name("tun;rm -rf /", "test").is_err());
        assert!(validate_name("tun$(whoami)", "test").is_err());
        assert!(validate_name("tun0 up", "test").is_err());
        assert!(validate_name("../tun0", "test").is_err());
    }

    #[test]
    fn test_validate_interface_name_length() {
        assert!(validate_interface_name("abcdefghijklmno").is_ok());
        assert!(validate_interface_name("abcdefghijklmnop").is_err());
    }

    #[test]
    fn test_expand_routes_splits_default() {
        let routes = vec!["0.0.0.0/0".to_string(), "10.8.0.0/16".to_string()];
        assert_eq!(
            expand_routes(&routes),
            vec![
                "0.0.0.0/1".to_string(),
                "128.0.0.0/1".to_string(),
                "10.8.0.0/16".to_string()
            ]
        );
    }

    #[test]
    fn test_parse_cap_eff() {
        let status = "Name:\tfocus-shield\nCapInh:\t0000000000000000\nCapEff:\t0000000000001000\n";
        let caps = parse_cap_eff(status).unwrap();
        assert_ne!(caps & (1 << CAP_NET_ADMIN), 0);

        let status = "CapEff:\t0000000000000000\n";
        assert_eq!(parse_cap_eff(status), Some(0));

        assert_eq!(parse_cap_eff("Name:\tx\n"), None);
    }

    #[test]
    fn test_engine_availability() {
        let engine = ProcessEngine::from_config(&EngineConfig::default());
        assert!(!engine.is_available());

        let engine = ProcessEngine::from_config(&EngineConfig {
            command: Some(PathBuf::from("/nonexistent/engine")),
            ..EngineConfig::default()
        });
        assert!(!engine.is_available());

        assert!(shell_engine("exit 0").is_available());
    }

    #[test]
    fn test_raw_blocked_count_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "1234").unwrap();

        let engine = ProcessEngine::from_config(&EngineConfig {
            counter_file: Some(file.path().to_path_buf()),
            ..EngineConfig::default()
        });
        assert_eq!(engine.raw_blocked_count(), 1234);

        std::fs::write(file.path(), "garbage").unwrap();
        assert_eq!(engine.raw_blocked_count(), 0);

        let engine = ProcessEngine::from_config(&EngineConfig::default());
        assert_eq!(engine.raw_blocked_count(), 0);
    }

    #[tokio::test]
    async fn test_engine_receives_environment() {
        let engine = shell_engine(
            "test \"$FOCUS_SHIELD_MODE\" = passive && test \"$FOCUS_SHIELD_INTERFACE\" = fshield0 \
             && test \"$FOCUS_SHIELD_ALLOWED_DOMAINS\" = docs.rs",
        );
        engine.set_allowed_domains("docs.rs");

        engine.run_passive_shield(&descriptor()).await.unwrap();
        assert!(engine.run_active_loop(&descriptor()).await.is_err());
    }

    #[tokio::test]
    async fn test_engine_key_passed_through() {
        let engine = shell_engine("test \"$FOCUS_SHIELD_KEY\" = 'ss://abc@1.2.3.4:8388'");
        assert!(engine.run_active_loop(&descriptor()).await.is_err());

        engine.set_key("ss://abc@1.2.3.4:8388");
        engine.run_active_loop(&descriptor()).await.unwrap();
    }

    #[tokio::test]
    async fn test_engine_failure_status() {
        let err = shell_engine("exit 3")
            .run_active_loop(&descriptor())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exited"));
    }

    fn fake_process(root: &Path, pid: &str, comm: &str, cmdline: &[&str]) {
        let dir = root.join(pid);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("comm"), format!("{}\n", comm)).unwrap();
        let mut raw = Vec::new();
        for arg in cmdline {
            raw.extend_from_slice(arg.as_bytes());
            raw.push(0);
        }
        std::fs::write(dir.join("cmdline"), raw).unwrap();
    }

    fn apps(ids: &[&str]) -> BTreeSet<ApplicationId> {
        ids.iter().map(|id| ApplicationId::from(*id)).collect()
    }

    #[tokio::test]
    async fn test_process_scan_finds_running_app() {
        let dir = tempfile::tempdir().unwrap();
        fake_process(dir.path(), "101", "bash", &["/bin/bash"]);
        fake_process(dir.path(), "202", "bwrap", &["flatpak", "run", "org.example.Chat"]);
        std::fs::create_dir_all(dir.path().join("self")).unwrap();

        let source = ProcessScanSource::with_root(dir.path(), apps(&["org.example.Chat"]));
        assert_eq!(
            source.foreground_app().await.unwrap(),
            Some(ApplicationId::from("org.example.Chat"))
        );

        let source = ProcessScanSource::with_root(dir.path(), apps(&["firefox"]));
        assert_eq!(source.foreground_app().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_process_scan_matches_truncated_comm() {
        let dir = tempfile::tempdir().unwrap();
        fake_process(dir.path(), "303", "com.instagram.a", &[]);

        let source =
            ProcessScanSource::with_root(dir.path(), apps(&["com.instagram.android"]));
        assert_eq!(
            source.foreground_app().await.unwrap(),
            Some(ApplicationId::from("com.instagram.android"))
        );
    }

    #[tokio::test]
    async fn test_process_scan_missing_root_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = ProcessScanSource::with_root(dir.path().join("nope"), apps(&["firefox"]));
        assert!(source.foreground_app().await.is_err());
    }

    // Creating real TUN devices needs CAP_NET_ADMIN; covered by manual testing
}
