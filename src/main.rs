use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;
use vigil::analysis::HeuristicAnalysisClient;
use vigil::config::{ActionPolicy, Config, LogFormat};
use vigil::config_broadcast::ConfigBroadcaster;
use vigil::notify::{AlertPublisher, LogPublisher};
use vigil::orchestrator::{Pipeline, PipelineClients};
use vigil::remediation::LoggingEffector;
use vigil::scorer::HeuristicMlClient;
use vigil::server::{self, AppState};
use vigil::store::MemoryStore;

#[derive(Parser, Debug)]
#[command(name = "vigil", version)]
#[command(about = "Autonomous security event pipeline: normalize, score, triage, act")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/vigil/config.toml")]
    config: PathBuf,

    /// Force notify-only mode (no remediation actions)
    #[arg(long)]
    notify_only: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Output logs as JSON
    #[arg(long)]
    json: bool,

    /// Ops/health endpoint address
    #[arg(long, default_value = "127.0.0.1:9090")]
    addr: SocketAddr,

    /// Disable the ops endpoint
    #[arg(long)]
    no_server: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if args.json {
        subscriber.json().init();
    } else {
        subscriber.with_target(false).init();
    }

    let mut config = Config::load_or_default(&args.config);
    if args.notify_only {
        config.triage.action_policy = ActionPolicy::NotifyOnly;
    }
    config.validate().context("refusing to start")?;

    info!("config: {}", args.config.display());
    info!(policy = ?config.triage.action_policy, warn = config.triage.warn_threshold, remediate = config.triage.remediate_threshold, "triage thresholds");
    if config.general.log_format == LogFormat::Text && args.json {
        warn!("--json overrides configured text log format");
    }

    let store = Arc::new(MemoryStore::new(config.store.ttl_seconds));
    let publisher: Arc<dyn AlertPublisher> = publisher_for(&config);
    let event_deadline = Duration::from_millis(config.limits.event_deadline_ms);

    let (broadcaster, config_rx) = ConfigBroadcaster::new(config);
    let (ready_tx, ready_rx) = watch::channel(false);

    let pipeline = Pipeline::start(
        config_rx,
        PipelineClients {
            ml: Arc::new(HeuristicMlClient),
            analysis: Arc::new(HeuristicAnalysisClient),
            effector: Arc::new(LoggingEffector),
            publisher,
            store: Arc::clone(&store) as Arc<dyn vigil::store::AlertStore>,
        },
    );

    if !args.no_server {
        let state = AppState {
            ingress: pipeline.ingress(),
            ready: ready_rx.clone(),
        };
        let addr = args.addr;
        tokio::spawn(async move {
            server::start_server(addr, state).await;
        });
    }

    // SIGHUP reloads the config file and broadcasts it to the gates.
    let broadcaster = Arc::new(Mutex::new(broadcaster));
    let config_path = args.config.clone();
    let reload_broadcaster = Arc::clone(&broadcaster);
    tokio::spawn(async move {
        loop {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                Ok(mut sig) => {
                    sig.recv().await;
                    info!("received SIGHUP, reloading config");
                    match Config::load(&config_path) {
                        Ok(new_config) => match new_config.validate() {
                            Ok(()) => {
                                let result = match reload_broadcaster.lock() {
                                    Ok(mut b) => b.update(new_config),
                                    Err(_) => continue,
                                };
                                match result {
                                    Ok(()) => info!("config reloaded"),
                                    Err(err) => warn!("config broadcast failed: {}", err),
                                }
                            }
                            Err(err) => warn!("ignoring invalid config: {}", err),
                        },
                        Err(err) => warn!("failed to reload config: {}", err),
                    }
                }
                Err(err) => {
                    error!("failed to set up SIGHUP handler: {}", err);
                    break;
                }
            }
        }
    });

    let _ = ready_tx.send(true);
    info!("vigil running, press Ctrl+C to stop");
    if !args.no_server {
        info!("metrics at http://{}/metrics, status at http://{}/status", args.addr, args.addr);
    }

    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    let _ = ready_tx.send(false);

    let drained = pipeline.shutdown(event_deadline).await;
    if !drained {
        warn!("shutdown grace expired before all events reached a terminal state");
    }
    store.sweep_expired();

    info!("vigil stopped");
    Ok(())
}

#[cfg(feature = "webhooks")]
fn publisher_for(config: &Config) -> Arc<dyn AlertPublisher> {
    match &config.notify.webhook_url {
        Some(url) => Arc::new(vigil::notify::WebhookPublisher::new(url.clone())),
        None => Arc::new(LogPublisher),
    }
}

#[cfg(not(feature = "webhooks"))]
fn publisher_for(config: &Config) -> Arc<dyn AlertPublisher> {
    if config.notify.webhook_url.is_some() {
        warn!("webhook_url configured but the webhooks feature is not enabled");
    }
    Arc::new(LogPublisher)
}
