//! EEG streaming relay: buffers per-client brain-wave samples and turns
//! them into generated music via an external ML service.
//!
//! Usage:
//!   brainwave-relay -c /etc/brainwave-relay/relay.conf
//!   brainwave-relay -c /etc/brainwave-relay/relay.conf --stderr   # log to stderr

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::{error, info};

use brainwave_relay::engine::Engine;
use brainwave_relay::generator::HttpGenerator;
use brainwave_relay::governor::{GovernorLimits, ProcMemory, ResourceGovernor};
use brainwave_relay::reaper::IdleReaper;
use brainwave_relay::session::SessionRegistry;
use brainwave_relay::{config, transport, util};

const RESTART_DELAY: Duration = Duration::from_secs(5);

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "brainwave-relay", about = "EEG-to-music streaming relay")]
struct Cli {
    /// Path to the configuration file.  A missing file at the default
    /// location means built-in defaults.
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Log to stderr instead of syslog (useful for debugging).
    #[arg(long)]
    stderr: bool,
}

const DEFAULT_CONFIG: &str = "/etc/brainwave-relay/relay.conf";

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let cfg = if cli.config == PathBuf::from(DEFAULT_CONFIG) && !cli.config.exists() {
        config::RelayConfig::default()
    } else {
        match config::load_config(&cli.config) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("brainwave-relay: config error: {e}");
                process::exit(1);
            }
        }
    };
    if let Err(e) = config::validate_config(&cfg) {
        eprintln!("brainwave-relay: config validation: {e}");
        process::exit(1);
    }

    let use_syslog = cfg.log_syslog && !cli.stderr;
    if let Err(e) = setup_logging(use_syslog) {
        eprintln!("brainwave-relay: {e:#}");
        process::exit(1);
    }

    if let Some(pid_file) = &cfg.pid_file {
        if let Err(e) = util::write_pid_file(pid_file) {
            error!("cannot write PID file {}: {e}", pid_file.display());
        }
    }

    let engine = match build_engine(&cfg) {
        Ok(e) => e,
        Err(e) => {
            error!("startup failed: {e:#}");
            process::exit(1);
        }
    };

    info!(
        "brainwave-relay starting (listen={} path={} generator={})",
        cfg.listen_addr, cfg.ws_path, cfg.generator_url
    );

    let reaper = IdleReaper::new(
        engine.registry().clone(),
        Arc::clone(engine.governor()),
        Duration::from_secs(cfg.reap_interval),
        Duration::from_secs(cfg.idle_timeout),
    )
    .spawn();

    tokio::select! {
        _ = serve_forever(&cfg, Arc::clone(&engine)) => {}
        r = tokio::signal::ctrl_c() => {
            if let Err(e) = r {
                error!("cannot listen for shutdown signal: {e}");
            }
            info!("shutdown requested");
        }
    }

    reaper.abort();
    for id in engine.registry().list_active() {
        engine.on_disconnect(id.as_str());
    }
    if let Some(pid_file) = &cfg.pid_file {
        util::remove_pid_file(pid_file);
    }
}

fn build_engine(cfg: &config::RelayConfig) -> anyhow::Result<Arc<Engine<HttpGenerator>>> {
    let generator = HttpGenerator::new(&cfg.generator_url)
        .with_context(|| format!("generator_url {}", cfg.generator_url))?;
    info!("generation endpoint: {}", generator.predict_url());

    let registry = SessionRegistry::new();
    let governor = Arc::new(ResourceGovernor::new(
        registry.clone(),
        GovernorLimits::from(cfg),
        Box::new(ProcMemory),
    ));
    Ok(Arc::new(Engine::new(registry, Arc::new(generator), governor)))
}

/// Serve the WebSocket listener; restart after a delay if it fails.
async fn serve_forever(cfg: &config::RelayConfig, engine: Arc<Engine<HttpGenerator>>) {
    loop {
        if let Err(e) = transport::websocket::serve(cfg.listen_addr, cfg.ws_path.clone(), Arc::clone(&engine)).await {
            error!("listener exited: {e:#}; restarting in {}s", RESTART_DELAY.as_secs());
        }
        tokio::time::sleep(RESTART_DELAY).await;
    }
}

// ── Logging setup ─────────────────────────────────────────────────────────────

fn setup_logging(use_syslog: bool) -> anyhow::Result<()> {
    if use_syslog {
        let formatter = syslog::Formatter3164 {
            facility: syslog::Facility::LOG_DAEMON,
            hostname: None,
            process:  "brainwave-relay".into(),
            pid:      process::id(),
        };
        let logger = syslog::unix(formatter)
            .map_err(|e| anyhow::anyhow!("syslog connect failed: {e}"))?;
        log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)))
            .map(|()| log::set_max_level(log::LevelFilter::Info))
            .context("set_logger")?;
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }
    Ok(())
}
