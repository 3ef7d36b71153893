//! edgetun service daemon
//!
//! Creates the tunnel interface described by the configuration file, serves
//! its control socket and keeps host policy current until it is asked to
//! stop.

use anyhow::Context;
use clap::Parser;
use edgetun_service::adapter::TunAdapterProvider;
use edgetun_service::config_source::TomlConfigSource;
use edgetun_service::control_server::ControlServerSettings;
use edgetun_service::engine::DiscardEngine;
use edgetun_service::firewall::{FirewallInstaller, NftFirewall, NoopFirewall};
use edgetun_service::privilege::UnixPrivilegeDropper;
use edgetun_service::service::control::spawn_signal_adapter;
use edgetun_service::service::LogStatusReporter;
use edgetun_service::watcher::{PollingSource, WatcherSettings};
use edgetun_service::{Collaborators, ServiceSettings, TunnelService};
use edgetun_uapi::AuthConfig;
use ipnet::IpNet;
use shared_utils::config::Config;
use shared_utils::logging::{init_logging, LogOptions};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Command-line arguments for the service daemon
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to the configuration file
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Log level, overrides the configuration file
    #[clap(short, long)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[clap(long)]
    json_logs: bool,

    /// Directory for the control socket, overrides the configuration file
    #[clap(long)]
    runtime_dir: Option<PathBuf>,

    /// Also write daily rolling log files to this directory
    #[clap(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;
    if let Some(runtime_dir) = args.runtime_dir {
        config.service.runtime_dir = runtime_dir;
    }

    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    if let Some(log_dir) = args.log_dir {
        config.log_dir = Some(log_dir);
    }
    let guard = init_logging(LogOptions {
        json_format: args.json_logs,
        ..LogOptions::from_config(&config)
    });

    info!("edgetun service starting up");
    debug!("Configuration loaded from {}", config_path.display());

    let addresses = config
        .tunnel
        .addresses
        .iter()
        .map(|a| a.parse::<IpNet>().with_context(|| format!("Invalid tunnel address {a:?}")))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut adapters = TunAdapterProvider::new().with_addresses(addresses);
    if let Some(mtu) = config.tunnel.mtu {
        adapters = adapters.with_mtu(mtu);
    }

    let firewall: Arc<dyn FirewallInstaller> = if config.firewall.enabled {
        Arc::new(NftFirewall::new())
    } else {
        Arc::new(NoopFirewall)
    };

    let mut auth = AuthConfig::new();
    for uid in &config.service.allowed_uids {
        auth = auth.allow_uid(*uid);
    }
    for gid in &config.service.allowed_gids {
        auth = auth.allow_gid(*gid);
    }

    let settings = ServiceSettings {
        grace_period: config.service.grace_period(),
        control: ControlServerSettings {
            runtime_dir: config.service.runtime_dir.clone(),
            auth,
        },
        watcher: WatcherSettings::from(&config.watcher),
        remove_firewall_on_stop: config.firewall.remove_on_stop,
    };

    let collaborators = Collaborators {
        config_source: Arc::new(TomlConfigSource::new(config.tunnel.clone())),
        adapters: Arc::new(adapters),
        engine: Arc::new(DiscardEngine::new()),
        firewall,
        privileges: Arc::new(UnixPrivilegeDropper::new(
            config.service.run_as_user.clone(),
            config.service.run_as_group.clone(),
        )),
        notifications: Arc::new(PollingSource::new(
            config.watcher.poll_interval(),
            config.watcher.ignore_patterns.clone(),
        )),
        status: Arc::new(LogStatusReporter),
    };

    let (controls_tx, controls_rx) = mpsc::channel(8);
    let signals_cancel = CancellationToken::new();
    let signals = spawn_signal_adapter(controls_tx, signals_cancel.clone())
        .context("Failed to install signal handlers")?;

    let outcome = TunnelService::new(settings, collaborators)
        .run(controls_rx)
        .await;

    signals_cancel.cancel();
    if let Err(e) = signals.await {
        warn!("Signal adapter ended abnormally: {}", e);
    }

    let code = outcome.exit_code();
    info!(code, "edgetun service shut down");

    // process::exit skips destructors; flush file logs first
    drop(guard);
    std::process::exit(code);
}
