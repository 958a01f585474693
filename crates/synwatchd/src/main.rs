//! synwatchd - passive SYN watcher
//!
//! Reads `tcpdump` output (or a saved capture), classifies every handshake,
//! scores sources and installs temporary `iptables` drop rules.

mod admin;
mod capture;
mod report;

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use synwatch::{
    DryRunFirewall, FirewallControl, IpInfoEnricher, IptablesFirewall, JsonStateStore, Monitor,
    Notifier, StateStore, WatchConfig,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::admin::ListChange;
use crate::capture::{Capture, CaptureSource};
use crate::report::{DailyReporter, Journal};

#[derive(Parser)]
#[command(name = "synwatchd")]
#[command(about = "Passive TCP connection-attempt watcher")]
#[command(version)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true, env = "SYNWATCH_LOG_JSON")]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch traffic and block abusive sources
    Run(RunArgs),

    /// Manage the persisted whitelist
    Whitelist {
        #[command(flatten)]
        state: StateArgs,

        #[command(subcommand)]
        action: WhitelistAction,
    },

    /// Show blacklist, active blocks and top reputations
    Status {
        #[command(flatten)]
        state: StateArgs,

        /// Number of reputation entries to show
        #[arg(long, default_value_t = 10)]
        top: usize,
    },

    /// Generate a sample config file
    InitConfig {
        /// Output path (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum WhitelistAction {
    /// Never score or block an address
    Add { ip: IpAddr },
    /// Make an address eligible for scoring again
    Remove { ip: IpAddr },
    /// List whitelisted addresses
    List,
}

#[derive(Args)]
struct StateArgs {
    /// Path to config file
    #[arg(short, long, env = "SYNWATCH_CONFIG", default_value = "/etc/synwatch/config.json")]
    config: PathBuf,

    /// State directory (overrides the config file)
    #[arg(long, env = "SYNWATCH_STATE_DIR")]
    state_dir: Option<PathBuf>,
}

impl StateArgs {
    fn load(&self) -> Result<WatchConfig> {
        let mut config = load_config(&self.config)?;
        if let Some(dir) = &self.state_dir {
            config.state_dir.clone_from(dir);
        }
        Ok(config)
    }
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    state: StateArgs,

    /// Capture interface
    #[arg(short, long, env = "SYNWATCH_INTERFACE", default_value = "any")]
    interface: String,

    /// Replay a saved capture instead of running tcpdump (`-` for stdin)
    #[arg(long)]
    input: Option<PathBuf>,

    /// Capture program
    #[arg(long, default_value = "tcpdump")]
    tcpdump: String,

    /// Log firewall commands instead of running them
    #[arg(long)]
    dry_run: bool,

    /// Skip enrichment lookups
    #[arg(long)]
    no_enrich: bool,

    /// Seconds between daily report rewrites
    #[arg(long, default_value_t = 60)]
    report_interval: u64,

    /// Entries per ranking in reports
    #[arg(long, default_value_t = 10)]
    top: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json)?;

    match cli.command {
        Commands::Run(args) => run(args).await?,
        Commands::Whitelist { state, action } => manage_whitelist(&state, action)?,
        Commands::Status { state, top } => show_status(&state, top)?,
        Commands::InitConfig { output } => init_config(output.as_deref())?,
    }

    Ok(())
}

fn init_tracing(json: bool) -> Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive("synwatchd=info".parse()?)
        .add_directive("synwatch=info".parse()?);

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
    Ok(())
}

fn load_config(path: &Path) -> Result<WatchConfig> {
    if path.exists() {
        let config = WatchConfig::from_file(path)?;
        info!(path = %path.display(), "loaded config");
        Ok(config)
    } else {
        info!(path = %path.display(), "config file not found, using defaults");
        Ok(WatchConfig::default())
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let mut config = args.state.load()?;
    if args.no_enrich {
        config.enrichment.enabled = false;
    }

    if args.dry_run {
        info!("dry run: firewall commands are logged, not executed");
        let firewall = Arc::new(DryRunFirewall::new());
        let result = watch(config, Arc::clone(&firewall), &args).await;
        info!(commands = firewall.calls().len(), "dry run finished");
        result
    } else {
        let firewall = Arc::new(IptablesFirewall::from_config(&config.firewall));
        watch(config, firewall, &args).await
    }
}

async fn watch<F: FirewallControl>(config: WatchConfig, firewall: Arc<F>, args: &RunArgs) -> Result<()> {
    let source = CaptureSource::from_args(args.input.clone(), &args.tcpdump, &args.interface);
    let mut capture = Capture::open(&source).await?;

    let state_dir = config.state_dir.clone();
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("failed to create state dir {}", state_dir.display()))?;
    let linger = config.tracker.handshake_timeout() + Duration::from_secs(1);

    let enricher = Arc::new(IpInfoEnricher::from_config(&config.enrichment)?);
    let store: Arc<dyn StateStore> = Arc::new(JsonStateStore::open(&state_dir));
    let (notifier, notices) = Notifier::channel();
    let sink = tokio::spawn(report::run_sink(notices, Journal::new(&state_dir)));

    let monitor = Monitor::new(config, firewall, enricher, store, notifier)?;
    monitor.start().await;
    info!(state_dir = %state_dir.display(), "synwatchd started");

    let mut reporter = DailyReporter::new(&state_dir, args.top, Utc::now().date_naive());
    let mut report_tick = tokio::time::interval(Duration::from_secs(args.report_interval.max(1)));
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut failure = None;
    loop {
        tokio::select! {
            () = &mut shutdown => break,

            line = capture.next_line() => match line {
                Ok(Some(line)) => {
                    monitor.handle_line(&line, Utc::now());
                }
                Ok(None) if source.is_replay() => {
                    info!(
                        wait_secs = linger.as_secs(),
                        "capture exhausted, waiting for pending handshakes"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(linger) => {}
                        () = &mut shutdown => {}
                    }
                    break;
                }
                Ok(None) => {
                    error!("capture process exited");
                    failure = Some(anyhow::anyhow!("capture process exited unexpectedly"));
                    break;
                }
                Err(e) => {
                    error!(error = %e, "capture read failed");
                    failure = Some(e.into());
                    break;
                }
            },

            _ = report_tick.tick() => {
                if let Err(e) = reporter.tick(&monitor, Utc::now()) {
                    warn!(error = %e, "failed to write daily report");
                }
            }
        }
    }

    capture.stop().await;
    if let Err(e) = reporter.tick(&monitor, Utc::now()) {
        warn!(error = %e, "failed to write final report");
    }
    monitor.shutdown().await;

    let snapshot = monitor.snapshot(0);
    info!(
        events = monitor.events_processed(),
        accepted = snapshot.connections.accepted,
        blocked = snapshot.connections.blocked,
        active_blocks = snapshot.active_blocks.len(),
        "synwatchd stopped"
    );
    drop(monitor);

    match tokio::time::timeout(Duration::from_secs(5), sink).await {
        Ok(Ok(written)) => debug!(written, "notice sink drained"),
        Ok(Err(e)) => warn!(error = %e, "notice sink task failed"),
        Err(_) => warn!("notice sink did not drain in time"),
    }

    failure.map_or(Ok(()), Err)
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received SIGINT, shutting down"),
        () = terminate => info!("received SIGTERM, shutting down"),
    }
}

fn manage_whitelist(state: &StateArgs, action: WhitelistAction) -> Result<()> {
    let config = state.load()?;
    let store = JsonStateStore::open(&config.state_dir);

    match action {
        WhitelistAction::Add { ip } => match admin::whitelist_add(&store, ip)? {
            ListChange::Changed => println!("{ip} whitelisted"),
            ListChange::Unchanged => println!("{ip} already whitelisted"),
        },
        WhitelistAction::Remove { ip } => {
            match admin::whitelist_remove(&store, ip)? {
                ListChange::Changed => println!("{ip} removed from whitelist"),
                ListChange::Unchanged => println!("{ip} was not whitelisted"),
            }
            if config.is_whitelisted(&ip) {
                warn!(ip = %ip, "address is also whitelisted in the config file and returns on next start");
            }
        }
        WhitelistAction::List => {
            for ip in admin::whitelist(&store) {
                println!("{ip}");
            }
        }
    }
    Ok(())
}

fn show_status(state: &StateArgs, top: usize) -> Result<()> {
    let config = state.load()?;
    let store = JsonStateStore::open(&config.state_dir);
    let report = admin::status(&store, &config, top, Utc::now());
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn init_config(output: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(&WatchConfig::default())?;
    match output {
        Some(path) => {
            std::fs::write(path, format!("{json}\n"))
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("Config written to {}", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}
