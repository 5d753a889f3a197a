//! Typesync CLI - Command-line interface for Typesync
//!
//! Inspects file-backed browser profiles and runs two-tab entitlement
//! simulations against the in-memory remote

use anyhow::{anyhow, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use typesync_client::store::FileBackend;
use typesync_client::{
    AuthContext, AuthContextDeps, AuthState, BrowserProfile, EnvironmentSignals, InMemoryBackend,
    SessionManager, TransportSelection, UpgradeOutcome,
};
use typesync_core::{
    init_logging, log_operation_error, log_operation_start, log_operation_success,
    performance::measure_async, with_timeout, SharedClock, SubscriptionTier, SystemClock, TypesyncConfig,
};

#[derive(Parser)]
#[command(name = "typesync")]
#[command(about = "Session lifecycle and cross-tab entitlement sync for Typesync")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage configuration
    Config {
        /// Initialize default configuration
        #[arg(long)]
        init: bool,

        /// Show current configuration
        #[arg(long)]
        show: bool,

        /// Validate current configuration
        #[arg(long)]
        validate: bool,
    },

    /// Inspect the stored session
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Sign up and upgrade in one tab, watch a second tab converge
    Simulate {
        /// Tier tab A upgrades to
        #[arg(long, default_value = "premium")]
        tier: SubscriptionTier,

        /// Leave only the poll between the tabs
        #[arg(long)]
        disable_channels: bool,

        /// Persist the simulated profile in this directory
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// Print the session owner, expiry and time remaining
    Status {
        /// Profile directory (defaults to storage.data_dir)
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_ref())?;

    let logging_config = if cli.verbose {
        config.logging.clone().verbose()
    } else {
        config.logging.clone()
    };
    init_logging(&logging_config).map_err(|e| anyhow!("Failed to initialize logging: {}", e))?;

    info!("Starting Typesync CLI v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Config {
            init,
            show,
            validate,
        } => handle_config(init, show, validate, cli.config.as_ref())?,
        Commands::Session {
            action: SessionAction::Status { data_dir },
        } => handle_session_status(data_dir, &config).await?,
        Commands::Simulate {
            tier,
            disable_channels,
            data_dir,
        } => handle_simulate(tier, disable_channels, data_dir, &config).await?,
    }

    Ok(())
}

fn load_config(config_path: Option<&PathBuf>) -> anyhow::Result<TypesyncConfig> {
    if let Some(path) = config_path {
        return TypesyncConfig::from_file(path)
            .with_context(|| format!("Loading configuration from {}", path.display()));
    }

    let default_paths = [
        dirs::config_dir().map(|d| d.join("typesync").join("config.toml")),
        dirs::home_dir().map(|d| d.join(".typesync").join("config.toml")),
        Some(PathBuf::from("typesync.toml")),
    ];
    for path in default_paths.into_iter().flatten() {
        if path.exists() {
            return TypesyncConfig::from_file(&path)
                .with_context(|| format!("Loading configuration from {}", path.display()));
        }
    }

    Ok(TypesyncConfig::default())
}

/// Default configuration file path
fn get_config_path() -> anyhow::Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|d| d.join(".config")))
        .ok_or_else(|| anyhow!("Cannot determine a configuration directory"))?;
    Ok(config_dir.join("typesync").join("config.toml"))
}

fn handle_config(
    init: bool,
    show: bool,
    validate: bool,
    config_path: Option<&PathBuf>,
) -> anyhow::Result<()> {
    if init {
        let path = match config_path {
            Some(path) => path.clone(),
            None => get_config_path()?,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        TypesyncConfig::default().save_to_file(&path)?;
        println!("Configuration initialized at: {}", path.display());
    }

    if show {
        let config = load_config(config_path)?;
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }

    if validate {
        let config = load_config(config_path)?;
        match config.validate() {
            Ok(()) => println!("Configuration is valid"),
            Err(e) => {
                println!("Configuration validation failed: {}", e);
                return Err(e.into());
            }
        }
    }

    Ok(())
}

/// Expand a leading `~` against the home directory
fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ if path == "~" => dirs::home_dir().unwrap_or_else(|| PathBuf::from(path)),
        _ => PathBuf::from(path),
    }
}

fn open_file_profile(dir: &Path) -> anyhow::Result<BrowserProfile> {
    let backend = FileBackend::open(dir)
        .with_context(|| format!("Opening profile in {}", dir.display()))?;
    Ok(BrowserProfile::with_backend(Arc::new(backend)))
}

async fn handle_session_status(
    data_dir: Option<PathBuf>,
    config: &TypesyncConfig,
) -> anyhow::Result<()> {
    let dir = data_dir.unwrap_or_else(|| expand_home(&config.storage.data_dir));
    let profile = open_file_profile(&dir)?;
    let tab = profile.open_tab(EnvironmentSignals::default());

    let clock: SharedClock = Arc::new(SystemClock);
    let sessions = SessionManager::new(
        &tab,
        InMemoryBackend::new(Arc::clone(&clock)),
        clock,
        &config.session,
    );

    println!("Profile: {}", dir.display());
    match sessions.current_session() {
        None => println!("Identity: guest (no stored session)"),
        Some(record) => {
            println!("User: {} <{}>", record.user_id, record.email);
            println!("Session: {}", record.session_id);
            println!("Expires: {}", record.expires_at.to_rfc3339());
            match sessions.time_remaining() {
                Some(remaining) => println!(
                    "Remaining: {}d {}h {}m",
                    remaining.num_days(),
                    remaining.num_hours() % 24,
                    remaining.num_minutes() % 60
                ),
                None => println!("Remaining: expired"),
            }
            let this_device = if record.device_fingerprint == *tab.fingerprint() {
                "this device"
            } else {
                "another device"
            };
            println!("Device: {} ({})", record.device_fingerprint, this_device);
        }
    }
    println!("Trusted devices: {}", sessions.trusted_devices().len());

    Ok(())
}

/// Wait until `check` holds for the context's state, up to `limit`
async fn wait_for(context: &AuthContext, check: impl Fn(&AuthState) -> bool, limit: Duration) -> bool {
    let mut states = context.subscribe();
    let watched = with_timeout(
        async {
            loop {
                let done = check(&*states.borrow_and_update());
                if done {
                    return true;
                }
                if states.changed().await.is_err() {
                    return false;
                }
            }
        },
        limit.as_millis() as u64,
        "wait_for_state",
    )
    .await;
    watched.unwrap_or(false)
}

async fn handle_simulate(
    tier: SubscriptionTier,
    disable_channels: bool,
    data_dir: Option<PathBuf>,
    config: &TypesyncConfig,
) -> anyhow::Result<()> {
    log_operation_start!("simulate", %tier, disable_channels);

    let profile = match &data_dir {
        Some(dir) => open_file_profile(dir)?,
        None => BrowserProfile::in_memory(),
    };
    let clock: SharedClock = Arc::new(SystemClock);
    let remote = InMemoryBackend::new(Arc::clone(&clock));
    let transports = if disable_channels {
        TransportSelection::poll_only()
    } else {
        TransportSelection::all()
    };

    let open = |label: &str| {
        info!(tab = label, "Opening tab");
        AuthContext::start(
            AuthContextDeps::in_memory(
                profile.open_tab(EnvironmentSignals::default()),
                Arc::clone(&remote),
                Arc::clone(&clock),
                config.clone(),
            )
            .with_transports(transports),
        )
    };
    let tab_a = open("A").await?;
    let tab_b = open("B").await?;

    let started = Instant::now();
    let stamp = |event: &str| println!("[{:>7.2}s] {}", started.elapsed().as_secs_f64(), event);

    let email = format!("typist-{}@example.com", Utc::now().timestamp_millis());
    let account = tab_a
        .sign_up(&email, "simulate-123", Some("Simulated Typist"))
        .await
        .map_err(|e| {
            log_operation_error!("simulate", e, step = "sign_up");
            e
        })?;
    stamp(&format!("tab A signed up as {} ({})", account.uid, account.subscription.tier));

    let uid = account.uid.clone();
    if wait_for(&tab_b, |state| state.identity.uid() == uid, Duration::from_secs(5)).await {
        stamp("tab B adopted the session");
    } else {
        warn!("Tab B did not pick up the session");
        stamp("tab B still signed out");
    }

    match tab_a.upgrade_entitlement(tier).await? {
        UpgradeOutcome::Upgraded(record) => stamp(&format!("tab A upgraded to {}", record.tier)),
        other => stamp(&format!("tab A upgrade outcome: {:?}", other)),
    }

    let limit = config.entitlement.poll_interval() + Duration::from_secs(5);
    let converged = measure_async(
        "await_convergence",
        wait_for(&tab_b, |state| state.identity.tier() >= tier, limit),
    )
    .await;

    if converged {
        stamp(&format!("tab B converged on {}", tab_b.entitlement().tier));
        log_operation_success!("simulate", elapsed_ms = started.elapsed().as_millis() as u64);
    } else {
        stamp(&format!(
            "tab B did not converge within {}s (still {})",
            limit.as_secs(),
            tab_b.entitlement().tier
        ));
    }

    tab_a.shutdown();
    tab_b.shutdown();

    if !converged {
        return Err(anyhow!("Tab B did not converge on {}", tier));
    }
    Ok(())
}
