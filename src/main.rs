use anyhow::{Context, Result};
use chat_consistency::infrastructure::alerting::{
    AlertPort, FanoutAlertPort, LoggingAlertPort, WebhookAlertPort,
};
use chat_consistency::infrastructure::cdc_health::{
    CdcHealthMonitor, KafkaConnectClient, PostgresReplicationSlotProbe,
};
use chat_consistency::infrastructure::config::AppConfig;
use chat_consistency::infrastructure::distributed_lock::{DistributedLockManager, LockConfig};
use chat_consistency::infrastructure::kafka_abstraction::KafkaEventPublisher;
use chat_consistency::infrastructure::logging::{init_logging, LoggingConfig};
use chat_consistency::infrastructure::outbox::PostgresOutboxRepository;
use chat_consistency::infrastructure::outbox_processor::OutboxEventProcessor;
use chat_consistency::infrastructure::reconciliation::{
    OrphanedRecordReconciler, PostgresChatRoomDirectory, PostgresMessageDocumentStore,
};
use chat_consistency::infrastructure::redis_abstraction::RealRedisClient;
use chat_consistency::infrastructure::scheduler::{JobScheduler, ScheduledJob};
use chat_consistency::web::{create_router, AdminState};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let _log_guards = init_logging(LoggingConfig::from_env())?;

    let config = AppConfig::from_env();
    info!(
        instance_id = %config.instance_id,
        admin_port = config.admin_port,
        "Starting chat consistency service"
    );

    let pool = connect_pool(&config.database_url, config.database_pool_size).await?;
    let document_pool = if config.document_database_url.is_some() {
        connect_pool(config.document_database_url(), config.database_pool_size).await?
    } else {
        pool.clone()
    };

    let outbox = Arc::new(PostgresOutboxRepository::new(pool.clone()));
    outbox.ensure_schema().await?;

    let redis = RealRedisClient::connect(&config.redis_url)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", config.redis_url))?;
    let locks = Arc::new(DistributedLockManager::new(redis, LockConfig::default()));

    let publisher = Arc::new(
        KafkaEventPublisher::new(config.kafka.clone()).context("Failed to create Kafka producer")?,
    );
    let alerts = build_alert_port(&config)?;

    let processor = Arc::new(OutboxEventProcessor::new(
        outbox.clone(),
        publisher,
        alerts.clone(),
        config.outbox.clone(),
    ));
    let cdc = Arc::new(CdcHealthMonitor::new(
        Arc::new(KafkaConnectClient::new(
            config.kafka_connect_url.clone(),
            Duration::from_secs(10),
        )?),
        Arc::new(PostgresReplicationSlotProbe::new(pool.clone())),
        alerts.clone(),
        config.cdc.clone(),
    ));
    let reconciler = Arc::new(OrphanedRecordReconciler::new(
        Arc::new(PostgresMessageDocumentStore::new(document_pool)),
        Arc::new(PostgresChatRoomDirectory::new(pool.clone())),
        alerts,
        config.reconciliation.clone(),
    ));

    let shutdown = CancellationToken::new();
    let scheduler = Arc::new(JobScheduler::new(
        locks.clone(),
        config.instance_id.clone(),
        shutdown.clone(),
    ));

    let jobs = vec![
        ScheduledJob::new(
            "outbox-processing",
            config.intervals.outbox_poll,
            config.leases.outbox_processing,
            {
                let processor = processor.clone();
                move |lease| {
                    let processor = processor.clone();
                    async move {
                        processor
                            .process_outbox_events_with_lease(&lease)
                            .await
                            .map(|_| ())
                    }
                }
            },
        ),
        ScheduledJob::new(
            "outbox-cleanup",
            config.intervals.outbox_cleanup,
            config.leases.outbox_cleanup,
            {
                let processor = processor.clone();
                move |_| {
                    let processor = processor.clone();
                    async move { processor.cleanup_old_events().await.map(|_| ()) }
                }
            },
        ),
        ScheduledJob::new(
            "outbox-failed-monitor",
            config.intervals.failed_monitor,
            config.leases.failed_monitor,
            {
                let processor = processor.clone();
                move |_| {
                    let processor = processor.clone();
                    async move { processor.monitor_failed_events().await.map(|_| ()) }
                }
            },
        ),
        ScheduledJob::new(
            "cdc-health-check",
            config.intervals.cdc_check,
            config.leases.cdc_check,
            {
                let cdc = cdc.clone();
                move |_| {
                    let cdc = cdc.clone();
                    async move {
                        cdc.run_health_check().await;
                        Ok(())
                    }
                }
            },
        ),
        ScheduledJob::new(
            "orphaned-message-reconciliation",
            config.intervals.reconciliation,
            config.leases.reconciliation,
            {
                let reconciler = reconciler.clone();
                move |lease| {
                    let reconciler = reconciler.clone();
                    async move {
                        reconciler
                            .cleanup_orphaned_messages_with_lease(&lease)
                            .await
                            .map(|_| ())
                    }
                }
            },
        ),
    ];
    let handles: Vec<_> = jobs.into_iter().map(|job| scheduler.spawn(job)).collect();

    let router = create_router(AdminState {
        outbox,
        cdc,
        locks,
        instance_id: config.instance_id.clone(),
    });
    let addr = format!("0.0.0.0:{}", config.admin_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind admin listener on {}", addr))?;
    info!("Admin server listening on {}", addr);

    let server_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
        info!("Shutdown signal received");
        server_shutdown.cancel();
    });

    let server_token = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { server_token.cancelled().await })
        .await
        .context("Admin server failed")?;

    shutdown.cancel();
    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "Scheduled job task ended abnormally");
        }
    }
    info!("Chat consistency service stopped");
    Ok(())
}

async fn connect_pool(url: &str, max_connections: u32) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(url)
        .await
        .context("Failed to connect to Postgres")
}

fn build_alert_port(config: &AppConfig) -> Result<Arc<dyn AlertPort>> {
    let logging: Arc<dyn AlertPort> = Arc::new(LoggingAlertPort);
    match &config.alert_webhook_url {
        Some(url) => {
            let webhook: Arc<dyn AlertPort> = Arc::new(WebhookAlertPort::new(url.clone())?);
            Ok(Arc::new(FanoutAlertPort::new(vec![logging, webhook])))
        }
        None => Ok(logging),
    }
}
