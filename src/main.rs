use anyhow::Context;
use oddswatch::api::{self, ApiState};
use oddswatch::config::Config;
use oddswatch::notify::Notifier;
use oddswatch::scheduler::{command_channel, Orchestrator, SchedulerSettings};
use oddswatch::store::ConfigStore;
use oddswatch::worker::ProcessWorker;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

const CONFIG_FILE: &str = "oddswatch.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Load config
    let config = Config::load_or_env(Path::new(CONFIG_FILE))
        .with_context(|| format!("failed to load {CONFIG_FILE}"))?;
    config.validate()?;

    // Initialize logging
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    }

    info!("oddswatch v{} starting", env!("CARGO_PKG_VERSION"));
    if !Path::new(CONFIG_FILE).exists() {
        info!("no {} found, using env-only config", CONFIG_FILE);
    }

    // --- Worker ---
    let worker = ProcessWorker::from_config(&config.monitor);
    let resolved = worker
        .preflight()
        .with_context(|| format!("worker executable {:?} is not usable", worker.program()))?;
    info!(
        program = %resolved.display(),
        args = ?config.monitor.worker_args,
        "worker executable found"
    );

    tokio::fs::create_dir_all(&config.monitor.output_dir)
        .await
        .with_context(|| {
            format!(
                "failed to create output directory {}",
                config.monitor.output_dir.display()
            )
        })?;

    // --- Targets ---
    let store = ConfigStore::new(&config.monitor.targets_file);
    let targets = store
        .load()
        .with_context(|| format!("refusing to start with {}", store.path().display()))?;

    let notifier = Notifier::from_config(&config.notify);
    let settings = SchedulerSettings::from(&config.monitor);
    let orchestrator = Orchestrator::new(
        targets,
        store,
        Arc::new(worker),
        Arc::new(notifier),
        settings,
    )?;

    let (handle, commands) = command_channel(64);

    // --- Admin API ---
    if config.api.enabled {
        let state = ApiState {
            handle: handle.clone(),
        };
        let bind = config.api.bind.clone();
        tokio::spawn(async move {
            if let Err(e) = api::serve(state, &bind).await {
                error!(error = %e, "admin api server failed");
            }
        });
    } else {
        warn!("admin api disabled");
    }

    // --- Orchestrator ---
    orchestrator
        .run(commands, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await;

    drop(handle);
    info!("oddswatch stopped");
    Ok(())
}
