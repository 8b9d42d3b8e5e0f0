//! Tidecast Server - Main Entry Point
//!
//! Loads configuration, restores the promoted model, starts the inference
//! dispatcher and background consumers, and serves the HTTP API.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tidecast_common::config::{ArtifactConfig, KafkaConfig, ObservabilityConfig, StoreBackend};
use tidecast_common::{ServeConfig, Telemetry};
use tidecast_proto::{ClaimCheck, ErrorEvent, InferenceEvent, PromotionPointer};
use tidecast_server::{bus, create_router, AppState, PointerWatcher};
use tidecast_worker::{
    ArtifactStore, ClaimConsumer, FsArtifactStore, InferenceService, ModelRegistry, PredictionLog,
    RetryPolicy, ServiceSettings,
};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("TIDECAST_CONFIG").ok().map(PathBuf::from);
    let config = ServeConfig::load(config_path.as_deref())?;
    init_tracing(&config.observability);

    info!(
        config = ?config_path,
        bind = %config.listen_address(),
        workers = config.worker.max_concurrency,
        queue_capacity = config.queue.capacity,
        "Starting Tidecast server"
    );

    let store = build_store(&config.artifacts).await?;
    let telemetry = Telemetry::new(config.observability.latency_buckets.clone())?;
    let retry = RetryPolicy::from(&config.registry);

    let registry = Arc::new(ModelRegistry::new(
        store.clone(),
        config.registry.expected_config_fingerprint.clone(),
        retry,
        telemetry.clone(),
    ));
    if config.registry.autoload_promoted {
        match registry.autoload().await {
            Ok(true) => info!("Promoted model restored"),
            Ok(false) => warn!("Starting without a model; waiting for a promotion"),
            Err(e) => error!(error = %e, "Failed to restore promoted model"),
        }
    }

    let service = InferenceService::new(ServiceSettings::from(&config), registry.clone(), telemetry);
    service.start();

    let (promotions, promotion_rx) = mpsc::channel(config.promotion.channel_capacity);
    tokio::spawn(registry.clone().run_listener(promotion_rx));

    if let Some(secs) = config.promotion.poll_interval_secs {
        let watcher = PointerWatcher::new(store.clone(), promotions.clone(), Duration::from_secs(secs));
        tokio::spawn(watcher.run());
    }

    // Held until shutdown so the consumer stays up without a publisher
    let claims = if config.claims.enabled {
        let capacity = config.claims.channel_capacity;
        let (tx, rx) = mpsc::channel(capacity);
        let (events, events_rx) = mpsc::channel(capacity);
        let (dead_letters, dead_letters_rx) = mpsc::channel(capacity);

        let mut consumer = ClaimConsumer::new(service.clone(), store.clone(), retry)
            .with_events(events)
            .with_dead_letters(dead_letters);
        let log = &config.claims.prediction_log;
        if log.enabled {
            consumer = consumer.with_prediction_log(PredictionLog::new(&log.bucket, &log.identifier));
        }

        spawn_event_sinks(&config.kafka, events_rx, dead_letters_rx)?;
        tokio::spawn(consumer.run(rx));
        Some(tx)
    } else {
        None
    };
    spawn_broker_consumers(&config.kafka, &promotions, claims.as_ref())?;
    let published_claims = claims.clone().filter(|_| config.claims.enable_publish_api);

    let state = AppState::new(service.clone(), promotions, published_claims, &config);
    let app = create_router(state);

    let addr = config.listen_address();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    service.shutdown();
    drop(claims);
    info!("Tidecast server shutdown complete");
    Ok(())
}

async fn build_store(config: &ArtifactConfig) -> anyhow::Result<Arc<dyn ArtifactStore>> {
    match config.backend {
        StoreBackend::Filesystem => {
            info!(root = %config.root.display(), "Using filesystem artifact store");
            Ok(Arc::new(FsArtifactStore::new(&config.root)))
        }
        #[cfg(feature = "s3")]
        StoreBackend::S3 => Ok(Arc::new(
            tidecast_worker::S3ArtifactStore::connect(&config.s3).await,
        )),
        #[cfg(not(feature = "s3"))]
        StoreBackend::S3 => anyhow::bail!("artifacts.backend = s3 requires the `s3` feature"),
    }
}

/// Route claim-consumer output to Kafka topics, or to the log without a broker
#[cfg(feature = "kafka")]
fn spawn_event_sinks(
    config: &KafkaConfig,
    events: mpsc::Receiver<InferenceEvent>,
    dead_letters: mpsc::Receiver<ErrorEvent>,
) -> anyhow::Result<()> {
    use tidecast_server::kafka::KafkaPublisher;

    let publisher = if config.enabled {
        Some(KafkaPublisher::new(config)?)
    } else {
        None
    };
    match (&publisher, &config.output_topic) {
        (Some(publisher), Some(topic)) => {
            tokio::spawn(publisher.clone().forward(events, topic.clone()));
        }
        _ => {
            tokio::spawn(bus::log_events(events, "output"));
        }
    }
    match (&publisher, &config.dlq_topic) {
        (Some(publisher), Some(topic)) => {
            tokio::spawn(publisher.clone().forward(dead_letters, topic.clone()));
        }
        _ => {
            tokio::spawn(bus::log_dead_letters(dead_letters));
        }
    }
    Ok(())
}

#[cfg(not(feature = "kafka"))]
fn spawn_event_sinks(
    _config: &KafkaConfig,
    events: mpsc::Receiver<InferenceEvent>,
    dead_letters: mpsc::Receiver<ErrorEvent>,
) -> anyhow::Result<()> {
    tokio::spawn(bus::log_events(events, "output"));
    tokio::spawn(bus::log_dead_letters(dead_letters));
    Ok(())
}

/// Feed promotion pointers and claim checks from Kafka topics into the channels
#[cfg(feature = "kafka")]
fn spawn_broker_consumers(
    config: &KafkaConfig,
    promotions: &mpsc::Sender<PromotionPointer>,
    claims: Option<&mpsc::Sender<ClaimCheck>>,
) -> anyhow::Result<()> {
    use tidecast_server::kafka;

    if !config.enabled {
        return Ok(());
    }
    if let Some(topic) = &config.promotion_topic {
        let consumer = kafka::subscribe(config, topic)?;
        tokio::spawn(kafka::consume(consumer, topic.clone(), promotions.clone()));
    }
    match (&config.claims_topic, claims) {
        (Some(topic), Some(claims)) => {
            let consumer = kafka::subscribe(config, topic)?;
            tokio::spawn(kafka::consume(consumer, topic.clone(), claims.clone()));
        }
        (Some(topic), None) => warn!(topic = %topic, "Claims are disabled; not consuming claim topic"),
        _ => {}
    }
    Ok(())
}

#[cfg(not(feature = "kafka"))]
fn spawn_broker_consumers(
    config: &KafkaConfig,
    _promotions: &mpsc::Sender<PromotionPointer>,
    _claims: Option<&mpsc::Sender<ClaimCheck>>,
) -> anyhow::Result<()> {
    if config.enabled {
        anyhow::bail!("kafka.enabled requires the `kafka` feature");
    }
    Ok(())
}

fn init_tracing(observability: &ObservabilityConfig) {
    let level = &observability.log_level;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "tidecast_server={level},tidecast_worker={level},tidecast_common={level},tower_http={level}"
        )
        .into()
    });

    let registry = tracing_subscriber::registry().with(filter);
    if observability.structured_logging {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Resolve on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
