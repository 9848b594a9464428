//! ecup - upgrade planner and EC manager dispatcher for embedded clusters.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use ecup::api::{self, AppState};
use ecup::builder::PlanBuilder;
use ecup::cluster::{ClusterInspector, KubeClusterInspector, LicenseReleaseResolver};
use ecup::config::Config;
use ecup::dispatch::Dispatcher;
use ecup::engine::Engine;
use ecup::health::HealthState;
use ecup::logging;
use ecup::metrics::Metrics;
use ecup::notify::SlackNotifier;
use ecup::registry::Registry;
use ecup::store::{FileStore, MemoryStore, Store};
use ecup::upgrader::CommandAppUpgrader;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const COMMIT: &str = env!("BUILD_COMMIT");
pub const BUILD_DATE: &str = env!("BUILD_DATE");

#[tokio::main]
async fn main() {
    let config = Config::from_args();

    if let Err(e) = logging::init(&config.log_format, &config.log_level) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    info!(
        version = VERSION,
        commit = COMMIT,
        build_date = BUILD_DATE,
        "Starting ecup"
    );

    if let Err(e) = config.validate() {
        error!(error = %e, "Configuration validation failed");
        std::process::exit(1);
    }

    if let Err(e) = run(config).await {
        let reason = format!("{e:#}");
        error!(error = %reason, "ecup failed");
        std::process::exit(1);
    }
    info!("Shutdown complete");
}

async fn open_store(config: &Config) -> Result<Arc<dyn Store>> {
    Ok(match &config.data_dir {
        Some(dir) => {
            info!(data_dir = %dir.display(), "Using file store");
            Arc::new(FileStore::open(dir).await?)
        }
        None => {
            warn!("DATA_DIR not set, plan state will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    })
}

async fn run(config: Config) -> Result<()> {
    let store = open_store(&config).await?;

    // Initialize Prometheus metrics
    let mut prom_registry = prometheus_client::registry::Registry::default();
    let metrics = Arc::new(Metrics::new(&mut prom_registry));
    let prom_registry = Arc::new(prom_registry);

    let registry =
        Arc::new(Registry::new(config.probe_config()).with_metrics(Arc::clone(&metrics)));
    let dispatcher =
        Arc::new(Dispatcher::new(Arc::clone(&registry)).with_metrics(Arc::clone(&metrics)));

    let cluster: Option<Arc<dyn ClusterInspector>> = if config.embedded_cluster {
        let client = kube::Client::try_default()
            .await
            .context("Failed to build Kubernetes client")?;
        info!("Connected to Kubernetes API server");
        Some(Arc::new(KubeClusterInspector::new(client)))
    } else {
        info!("Embedded cluster support disabled, planning app steps only");
        None
    };

    let builder = Arc::new(PlanBuilder::new(
        Arc::clone(&store),
        Arc::new(LicenseReleaseResolver::new(config.airgap_bundle_dir.clone())),
        cluster,
        Arc::clone(&registry),
    ));

    let mut engine = Engine::new(
        Arc::clone(&store),
        dispatcher,
        Arc::new(CommandAppUpgrader::new(config.upgrade_helper.clone())),
        config.engine_config(),
    )
    .with_metrics(metrics);
    if let Some(url) = config.slack_webhook() {
        info!("Slack notifications enabled");
        engine = engine.with_notifier(Arc::new(SlackNotifier::new(url.to_string())));
    }
    let engine = Arc::new(engine);

    if engine.resume().await?.is_none() {
        info!("No interrupted plan to resume");
    }

    let health = HealthState::new();
    let app = api::router(
        AppState {
            store,
            builder,
            engine,
            registry,
        },
        health.clone(),
        prom_registry,
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal");
                signal.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
    });

    health.set_ready(true);
    api::serve(config.server_port, app, shutdown).await
}
