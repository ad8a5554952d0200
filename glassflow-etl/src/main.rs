use std::future::ready;

use axum::{routing::get, Router};
use common_metrics::{serve, setup_metrics_routes};
use envconfig::Envconfig;
use health::LivenessRegistry;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use glassflow_etl::bus::MessageBus;
use glassflow_etl::config::Config;
use glassflow_etl::PipelineManager;

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy()
            .add_directive("rdkafka=warn".parse().unwrap())
            .add_directive("async_nats=warn".parse().unwrap()),
    );
    tracing_subscriber::registry().with(log_layer).init();
}

pub async fn index() -> &'static str {
    "glassflow etl"
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    setup_tracing();
    info!("Starting pipeline runtime...");

    let config = Config::init_from_env()?;
    info!(
        nats_url = config.nats_url,
        bind_port = config.bind_port,
        single_active_pipeline = config.single_active_pipeline,
        "Configuration loaded"
    );

    let liveness = LivenessRegistry::new("liveness");

    // Probe and metrics server
    let bind = format!("{}:{}", config.bind_host, config.bind_port);
    let liveness_for_router = liveness.clone();
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route(
            "/_liveness",
            get(move || ready(liveness_for_router.get_status())),
        );
    let router = setup_metrics_routes(router);

    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start probe server");
    });

    let bus = MessageBus::connect(&config.nats_url).await?;
    let manager = PipelineManager::new(config, bus, liveness).await?;

    // Persisted pipelines come back before the control surface attaches.
    manager.recover().await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    manager.shutdown().await;

    info!("Pipeline runtime shut down");
    Ok(())
}
