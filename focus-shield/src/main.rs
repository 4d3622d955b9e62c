// Focus Shield per-application tunnel daemon

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use focus_shield::{
    access_key::is_access_key,
    closure::DependencyGraph,
    config::load_config,
    credentials::AesGcmCredentials,
    error::SessionError,
    events::EventBus,
    orchestrator::{OrchestratorDeps, SessionOrchestrator},
    platform::{CapabilityAuthorizer, LinuxTunnel, ProcessEngine, ProcessScanSource},
    policy::PolicyResolver,
    prefs::{FilePreferences, PolicyKind, Preferences},
    remote::{AuthKind, RemoteAuthority, RemoteClient},
    state_file::{self, StatusSnapshot},
    trigger::{TriggerController, TriggerEvent, TriggerMonitor},
    types::{ApplicationId, Config, RoutingMode, SessionState},
};
use std::collections::BTreeSet;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;

// Channel buffer size for trigger events
const TRIGGER_EVENT_CHANNEL_SIZE: usize = 16;

#[derive(Parser)]
#[command(name = "focus-shield")]
#[command(about = "Per-application focus tunnel daemon", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/focus-shield/config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a session with the stored policy and run until signalled
    Run {
        /// Started at boot: only engage when autostart is on
        #[arg(long)]
        boot: bool,
    },
    /// Show daemon state and stored policy
    Status,
    /// Set the routing mode: focus, casual or global
    Mode {
        kind: String,
        /// Focus target application
        #[arg(long)]
        target: Option<String>,
        /// Casual whitelist, comma separated
        #[arg(long, value_delimiter = ',')]
        apps: Vec<String>,
    },
    /// Turn stealth (allow-list) routing on or off
    Stealth {
        #[arg(value_parser = parse_switch)]
        enabled: bool,
    },
    /// Let applications bypass the tunnel
    Bypass {
        #[arg(value_parser = parse_switch)]
        enabled: bool,
    },
    /// Set the comma-separated domains the engine lets through
    Domains { csv: String },
    /// Log in to the remote authority (password read from stdin)
    Login { username: String },
    /// Create an account (password read from stdin)
    Register { username: String },
    /// Forget the stored account
    Logout,
    /// List server regions
    Regions,
    /// Pick a server region; omit the id for the server default
    SelectRegion { id: Option<i64> },
    /// Fetch and store the public test key
    TestKey,
    /// Engage the stored policy when started with `run --boot`
    Autostart {
        #[arg(value_parser = parse_switch)]
        enabled: bool,
    },
    /// Engage while a trigger application is in use, stop when it goes away
    Trigger {
        #[arg(value_parser = parse_switch)]
        enabled: bool,
        /// Trigger applications, comma separated
        #[arg(long, value_delimiter = ',')]
        apps: Vec<String>,
    },
    /// Override the server URL; omit it to use the configured one
    Endpoint { url: Option<String> },
}

fn parse_switch(value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "on" | "true" | "1" | "yes" => Ok(true),
        "off" | "false" | "0" | "no" => Ok(false),
        other => Err(format!("expected on or off, got '{}'", other)),
    }
}

fn main() -> Result<()> {
    // 2 threads is enough: orchestrator plus engine/guard/process waits
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("focus-shield")
        .thread_stack_size(2 * 1024 * 1024) // 2MB stack (vs 8MB default)
        .enable_time()
        .enable_io()
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&config.general.log_level),
    )
    .init();

    let prefs = open_preferences(&config)?;
    let server_url = prefs
        .sync_endpoint()
        .unwrap_or_else(|| config.general.server_url.clone());
    let remote = Arc::new(
        RemoteClient::new(
            server_url,
            Duration::from_secs(config.guard.request_timeout_secs),
        )
        .context("Failed to create HTTP client")?,
    );

    match args.command {
        Command::Run { boot } => run_daemon(config, prefs, remote, boot).await,
        Command::Status => show_status(&config, &prefs),
        Command::Mode { kind, target, apps } => set_mode(&prefs, &kind, target, apps),
        Command::Stealth { enabled } => {
            prefs.set_stealth(enabled)?;
            println!("Stealth {}", if enabled { "on" } else { "off" });
            Ok(())
        }
        Command::Bypass { enabled } => {
            prefs.set_local_bypass(enabled)?;
            println!("Local bypass {}", if enabled { "on" } else { "off" });
            Ok(())
        }
        Command::Domains { csv } => {
            prefs.set_allowed_domains(&csv)?;
            println!("Allowed domains: {}", prefs.allowed_domains());
            Ok(())
        }
        Command::Login { username } => {
            authenticate(remote.as_ref(), &prefs, AuthKind::Login, &username).await
        }
        Command::Register { username } => {
            authenticate(remote.as_ref(), &prefs, AuthKind::Register, &username).await
        }
        Command::Logout => {
            prefs.clear_auth()?;
            println!("Logged out");
            Ok(())
        }
        Command::Regions => list_regions(remote.as_ref(), &prefs).await,
        Command::SelectRegion { id } => {
            prefs.set_selected_node(id)?;
            match id {
                Some(id) => println!("Selected region {}", id),
                None => println!("Using the server default region"),
            }
            Ok(())
        }
        Command::TestKey => {
            let key = remote.test_key().await.context("Failed to fetch test key")?;
            anyhow::ensure!(is_access_key(&key), "Server returned an invalid test key");
            prefs.save_access_key(&key)?;
            println!("Test key stored");
            Ok(())
        }
        Command::Autostart { enabled } => {
            prefs.set_auto_start(enabled)?;
            println!("Autostart {}", if enabled { "on" } else { "off" });
            Ok(())
        }
        Command::Trigger { enabled, apps } => {
            if !apps.is_empty() {
                prefs.set_trigger_apps(&parse_apps(apps))?;
            }
            prefs.set_auto_trigger(enabled)?;
            let apps: Vec<String> = prefs.trigger_apps().iter().map(|a| a.to_string()).collect();
            println!(
                "Trigger {} ({})",
                if enabled { "on" } else { "off" },
                if apps.is_empty() { "no apps".to_string() } else { apps.join(", ") }
            );
            Ok(())
        }
        Command::Endpoint { url } => {
            let url = url.map(|u| u.trim().trim_end_matches('/').to_string());
            if let Some(url) = url.as_deref() {
                anyhow::ensure!(
                    url.starts_with("http://") || url.starts_with("https://"),
                    "Endpoint must be an http:// or https:// URL"
                );
            }
            prefs.set_sync_endpoint(url.as_deref())?;
            println!(
                "Server: {}",
                prefs
                    .sync_endpoint()
                    .unwrap_or_else(|| config.general.server_url.clone())
            );
            Ok(())
        }
    }
}

fn parse_apps(apps: Vec<String>) -> BTreeSet<ApplicationId> {
    apps.into_iter()
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
        .map(ApplicationId::from)
        .collect()
}

fn open_preferences(config: &Config) -> Result<Preferences> {
    let store = FilePreferences::open(&config.general.prefs_path)
        .with_context(|| format!("Failed to open preferences {:?}", config.general.prefs_path))?;
    let credentials = AesGcmCredentials::new(&config.general.key_path);
    Ok(Preferences::new(Arc::new(store), Arc::new(credentials)))
}

fn publish_state(
    config: &Config,
    state: SessionState,
    mode: &RoutingMode,
    bus: &EventBus,
    error: Option<SessionError>,
) {
    let snapshot = StatusSnapshot {
        state,
        mode: if state == SessionState::Idle {
            String::new()
        } else {
            mode.label().to_ascii_lowercase()
        },
        blocked: bus.counter(),
        lockdown: bus.is_lockdown(),
        error: error.map(|e| e.to_string()),
    };
    if let Err(e) = state_file::write_state(&config.general.state_file, &snapshot) {
        log::warn!("Failed to write state file: {}", e);
    }
}

async fn run_daemon(
    config: Config,
    prefs: Preferences,
    remote: Arc<RemoteClient>,
    boot: bool,
) -> Result<()> {
    log::info!("Starting focus-shield daemon");

    let trigger_apps = prefs.trigger_apps();
    let trigger_enabled = prefs.auto_trigger() && !trigger_apps.is_empty();
    let engage_now = !boot || prefs.auto_start();

    if !engage_now && !trigger_enabled {
        log::info!("Autostart and trigger are off, nothing to do at boot");
        return Ok(());
    }

    let config = Arc::new(config);
    let bus = EventBus::new(Duration::from_secs(config.metrics.window_secs));
    let graph = DependencyGraph::builtin().merged_with(&config.dependencies);
    log::info!("Companion table: {} entries", graph.len());

    let mode = prefs.routing_mode();
    log::info!(
        "Routing mode: {} (stealth {}), tunnel {}",
        mode.label(),
        mode.stealth,
        config.tunnel.interface
    );

    let handle = SessionOrchestrator::spawn(OrchestratorDeps {
        config: config.clone(),
        prefs: prefs.clone(),
        resolver: PolicyResolver::new(Arc::new(graph)),
        bus: bus.clone(),
        remote,
        tunnel: Arc::new(LinuxTunnel::new()),
        engine: Arc::new(ProcessEngine::from_config(&config.engine)),
        authorizer: Arc::new(CapabilityAuthorizer),
    });

    // Set up signal handlers for graceful shutdown
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to set up SIGTERM handler")?;
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .context("Failed to set up SIGINT handler")?;

    let mut state_rx = handle.subscribe_state();
    let mut counter_rx = bus.subscribe_counter();

    publish_state(&config, handle.state(), &mode, &bus, handle.last_error());

    // Startup engage result; the sender is dropped once it has reported
    let (engage_tx, mut engage_rx) = mpsc::channel::<Result<(), SessionError>>(1);
    if engage_now {
        let handle = handle.clone();
        let mode = mode.clone();
        tokio::spawn(async move {
            let _ = engage_tx.send(handle.engage(mode).await).await;
        });
    } else {
        drop(engage_tx);
    }

    // Trigger events; with the trigger off the channel closes immediately
    let (trigger_tx, mut trigger_rx) = mpsc::channel::<TriggerEvent>(TRIGGER_EVENT_CHANNEL_SIZE);
    let mut controller = TriggerController::new(handle.clone(), prefs.clone(), bus.clone());
    let monitor_handle = if trigger_enabled {
        let monitor = TriggerMonitor::new(
            Arc::new(ProcessScanSource::new(trigger_apps.clone())),
            trigger_apps,
            ApplicationId::new(config.general.own_app_id.clone()),
            Duration::from_secs(config.trigger.poll_interval_secs),
        );
        bus.log("AUTO >> INSTANT_MONITOR_ACTIVE");
        Some(tokio::spawn(async move {
            if let Err(e) = monitor.monitor(trigger_tx).await {
                log::error!("Trigger monitor error: {}", e);
            }
        }))
    } else {
        drop(trigger_tx);
        None
    };

    let mut was_active = false;
    let mut failure = None;

    log::info!("Daemon started successfully");

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                log::info!("Received SIGTERM");
                break;
            }
            _ = sigint.recv() => {
                log::info!("Received SIGINT");
                break;
            }

            Some(result) = engage_rx.recv() => {
                match result {
                    Ok(()) => log::info!("Session active"),
                    Err(e) if trigger_enabled => {
                        log::error!("Failed to start session: {}", e);
                    }
                    Err(e) => {
                        log::error!("Failed to start session: {}", e);
                        failure = Some(anyhow::Error::new(e));
                        break;
                    }
                }
            }

            Some(event) = trigger_rx.recv() => {
                log::debug!("Trigger event: {:?}", event);
                controller.handle_event(event);
            }

            changed = state_rx.changed() => {
                if changed.is_err() {
                    log::error!("Session orchestrator stopped unexpectedly");
                    break;
                }
                let state = *state_rx.borrow_and_update();
                log::debug!("Session state: {}", state.as_str());
                publish_state(&config, state, &prefs.routing_mode(), &bus, handle.last_error());

                if state == SessionState::Active {
                    was_active = true;
                } else if state == SessionState::Idle && was_active {
                    was_active = false;
                    if let Some(e) = handle.last_error() {
                        log::warn!("Session ended: {}", e);
                    } else {
                        log::info!("Session ended");
                    }
                    // Only the trigger keeps the daemon around between sessions
                    if !trigger_enabled {
                        break;
                    }
                }
            }

            changed = counter_rx.changed() => {
                if changed.is_ok() {
                    publish_state(
                        &config,
                        handle.state(),
                        &prefs.routing_mode(),
                        &bus,
                        handle.last_error(),
                    );
                }
            }
        }
    }

    log::info!("Shutting down gracefully...");
    if let Some(monitor) = monitor_handle {
        monitor.abort();
        bus.log("AUTO >> MONITOR_OFFLINE");
    }
    handle.shutdown().await;
    state_file::cleanup(&config.general.state_file);
    log::info!("Shutdown complete");

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn show_status(config: &Config, prefs: &Preferences) -> Result<()> {
    match state_file::read_state(&config.general.state_file) {
        Ok(values) => {
            let get = |key: &str| values.get(key).map(String::as_str).unwrap_or("");
            println!("State:     {}", get("STATE"));
            if !get("MODE").is_empty() {
                println!("Mode:      {}", get("MODE"));
            }
            println!("Blocked:   {}", get("BLOCKED"));
            println!("Lockdown:  {}", get("LOCKDOWN"));
            if !get("ERROR").is_empty() {
                println!("Error:     {}", get("ERROR"));
            }
        }
        Err(_) => println!("State:     not running"),
    }

    let mode = prefs.routing_mode();
    println!();
    println!("Policy:    {}", mode.label().to_ascii_lowercase());
    if let Some(target) = prefs.focus_target() {
        println!("Target:    {}", target);
    }
    let whitelist = prefs.casual_whitelist();
    if !whitelist.is_empty() {
        let apps: Vec<&str> = whitelist.iter().map(ApplicationId::as_str).collect();
        println!("Whitelist: {}", apps.join(", "));
    }
    println!("Stealth:   {}", prefs.is_stealth());
    println!("Bypass:    {}", prefs.local_bypass());
    if let Some(node) = prefs.selected_node() {
        println!("Region:    {}", node);
    }

    let sub = prefs.subscription();
    if sub.has_token() {
        let expiry = sub
            .expiry
            .map(|e| e.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "never".to_string());
        let standing = if sub.is_entitled_at(chrono::Utc::now()) {
            "premium"
        } else if sub.is_premium {
            "lapsed"
        } else {
            "free"
        };
        println!("Account:   {} ({}, expires {})", sub.username, standing, expiry);
    } else {
        println!("Account:   not logged in");
    }
    println!(
        "Key:       {}",
        if prefs.access_key().is_empty() { "none" } else { "stored" }
    );
    println!("Autostart: {}", prefs.auto_start());
    let triggers: Vec<String> = prefs.trigger_apps().iter().map(|a| a.to_string()).collect();
    println!(
        "Trigger:   {}{}",
        prefs.auto_trigger(),
        if triggers.is_empty() { String::new() } else { format!(" ({})", triggers.join(", ")) }
    );
    if let Some(endpoint) = prefs.sync_endpoint() {
        println!("Server:    {}", endpoint);
    }

    Ok(())
}

fn set_mode(
    prefs: &Preferences,
    kind: &str,
    target: Option<String>,
    apps: Vec<String>,
) -> Result<()> {
    if kind.eq_ignore_ascii_case("global") {
        prefs.set_global(true)?;
        println!("Mode: global");
        return Ok(());
    }

    let kind: PolicyKind = kind.parse()?;
    prefs.set_global(false)?;
    prefs.set_policy_kind(kind)?;

    if let Some(target) = target {
        prefs.set_focus_target(Some(&ApplicationId::from(target)))?;
    }
    if !apps.is_empty() {
        prefs.set_casual_whitelist(&parse_apps(apps))?;
    }

    println!("Mode: {}", kind);
    Ok(())
}

fn read_password() -> Result<String> {
    print!("Password: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read password")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

async fn authenticate(
    remote: &dyn RemoteAuthority,
    prefs: &Preferences,
    kind: AuthKind,
    username: &str,
) -> Result<()> {
    let password = read_password()?;
    let session = remote
        .authenticate(kind, username, &password)
        .await
        .context("Authentication failed")?;

    if let Some(key) = session.user.assigned_key.as_deref() {
        if is_access_key(key) {
            prefs.save_access_key(key)?;
            log::info!("Stored assigned access key");
        }
    }

    let sub = session.into_subscription();
    prefs.save_subscription(&sub)?;
    println!(
        "Logged in as {}{}",
        sub.username,
        if sub.is_premium { " (premium)" } else { "" }
    );
    Ok(())
}

async fn list_regions(remote: &dyn RemoteAuthority, prefs: &Preferences) -> Result<()> {
    let sub = prefs.subscription();
    anyhow::ensure!(sub.has_token(), "Not logged in");

    let regions = remote
        .regions(&sub.token)
        .await
        .context("Failed to fetch regions")?;
    let selected = prefs.selected_node();

    for region in regions {
        let marker = if Some(region.id) == selected { "*" } else { " " };
        println!("{} {:>4}  {}", marker, region.id, region.region_name);
    }
    Ok(())
}
