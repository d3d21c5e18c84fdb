use anyhow::{Context, Result};
use db_pool::create_pool;
use property_sync_service::config::{Config, SERVICE_NAME};
use property_sync_service::server::{self, AppState};
use property_sync_service::services::cdc::broker::create_consumer;
use property_sync_service::services::cdc::{
    CdcConsumer, KafkaDeadLetterSink, PipelineContext, PipelineHealth, PostgresStore, TargetStore,
};
use property_sync_service::SyncError;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,property_sync_service=info,rdkafka=warn".into());
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = terminate.recv() => {},
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler, waiting for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Starting {}", SERVICE_NAME);

    let config = Config::from_env().context("Failed to load configuration")?;
    info!(
        topic = %config.cdc.topic,
        consumer_group = %config.kafka.consumer_group,
        starting_offset = %config.cdc.starting_offset,
        delete_policy = %config.cdc.delete_policy,
        http_port = config.http_port,
        "Configuration loaded"
    );

    let mut db_config = config.database.clone();
    db_config.ensure_capacity_for_workers(config.cdc.expected_partitions);
    db_config.log_config();
    let pool = create_pool(db_config)
        .await
        .context("Failed to create database pool")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    info!("Database migrations completed");

    let schema = config.target_schema()?;
    let store: Arc<dyn TargetStore> = Arc::new(PostgresStore::new(pool.clone(), &schema, SERVICE_NAME));
    store
        .ensure_schema()
        .await
        .context("Target table does not match the column mapping")?;

    let health = Arc::new(PipelineHealth::new());
    let mut ctx = PipelineContext::new(
        config.worker_config()?,
        Arc::clone(&store),
        schema,
        config.delete_policy()?,
    )
    .with_health(Arc::clone(&health));

    if let Some(dlq_config) = config.dlq_config() {
        info!(dlq_topic = %dlq_config.topic, "Dead letters mirrored to Kafka");
        let sink = KafkaDeadLetterSink::new(dlq_config).context("Failed to create DLQ producer")?;
        ctx = ctx.with_dead_letter_sink(Arc::new(sink));
    }

    if let Err(e) = ctx.checkpoints.log_positions().await {
        warn!(error = %e, "Failed to read stored checkpoints");
    }
    let ctx = Arc::new(ctx);

    let http_server = server::start(
        config.http_port,
        AppState {
            health,
            checkpoints: ctx.checkpoints.clone(),
        },
        config.cdc.admin_enabled,
    )
    .context("Failed to bind HTTP server")?;
    let http_handle = http_server.handle();
    let http_task = tokio::spawn(http_server);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, draining partition workers");
        let _ = shutdown_tx.send(true);
    });

    let consumer = create_consumer(&config.kafka)
        .map_err(SyncError::from)
        .context("Failed to create Kafka consumer")?;
    let result = CdcConsumer::new(consumer, Arc::clone(&ctx))?
        .run(shutdown_rx)
        .await;

    http_handle.stop(true).await;
    let _ = http_task.await;
    pool.close().await;

    result.context("CDC consumer failed")?;
    info!("{} stopped", SERVICE_NAME);
    Ok(())
}
