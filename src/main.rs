//! bank_ledger - account ledger reliability core
//!
//! Runs the outbox dispatcher, the inbound consumer and the interest accrual
//! scheduler next to a small operational HTTP surface.

use std::net::SocketAddr;
use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bank_ledger::api;
use bank_ledger::broker::{MessagePublisher, MessageSource};
use bank_ledger::db;
use bank_ledger::inbox::{HandlerRegistry, InboundConsumer};
use bank_ledger::jobs::{AccrualOrchestrator, AccrualWorker, JobScheduler, JobSchedulerConfig, TokioJobQueue};
use bank_ledger::outbox::{OutboxDispatcher, OutboxPublisher, AUDIT_BINDINGS};
use bank_ledger::store::{PgStorage, Storage};
use bank_ledger::Config;

/// Initialize tracing/logging
fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "bank_ledger=debug,tower_http=debug".into());

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Connect the transport and declare the consumer queue
#[cfg(feature = "amqp")]
async fn connect_broker(
    config: &Config,
    bindings: &[&str],
) -> anyhow::Result<(Arc<dyn MessagePublisher>, Arc<dyn MessageSource>)> {
    use bank_ledger::broker::amqp::AmqpBroker;

    let consumer = config.consumer();
    let broker_config = config.broker();
    let broker = AmqpBroker::connect(&broker_config).await?;
    broker.declare_queue(&consumer.queue, bindings).await?;
    if let Some(audit) = &broker_config.audit_queue {
        broker.declare_queue(audit, &AUDIT_BINDINGS).await?;
        tracing::info!(queue = %audit, "Audit queue declared");
    }
    let source = broker.source(&consumer.queue, consumer.prefetch).await?;

    Ok((Arc::new(broker), Arc::new(source)))
}

/// Without the `amqp` feature events stay in process
#[cfg(not(feature = "amqp"))]
async fn connect_broker(
    config: &Config,
    bindings: &[&str],
) -> anyhow::Result<(Arc<dyn MessagePublisher>, Arc<dyn MessageSource>)> {
    use bank_ledger::broker::memory::InMemoryBroker;

    tracing::warn!("Built without the amqp feature, using the in-memory broker");

    let consumer = config.consumer();
    let broker = InMemoryBroker::new();
    broker.declare_queue(&consumer.queue, bindings);
    if let Some(audit) = &config.broker().audit_queue {
        broker.declare_queue(audit, &AUDIT_BINDINGS);
    }
    let source = broker.source(&consumer.queue);

    Ok((Arc::new(broker), Arc::new(source)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::from_env()?;
    init_tracing(config.log_json);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    tracing::info!(environment = %config.environment, "Starting bank_ledger");
    tracing::info!("Connecting to database...");

    // Create database pool
    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await?;

    db::verify_connection(&pool).await?;

    // Verify database schema
    if !db::check_schema(&pool).await? {
        tracing::error!("Database schema is not complete. Please run migrations.");
        return Err(anyhow::anyhow!("Database schema incomplete"));
    }
    tracing::info!("Database connected successfully");

    let storage: Arc<dyn Storage> = Arc::new(PgStorage::new(pool.clone()));
    let handlers = HandlerRegistry::with_defaults();
    let (publisher, source) = connect_broker(&config, &handlers.routing_keys()).await?;

    let cancel = CancellationToken::new();

    // Background workers
    let dispatcher = OutboxDispatcher::new(
        storage.clone(),
        OutboxPublisher::new(publisher),
        config.dispatcher(),
    )
    .start(cancel.clone());

    let consumer = InboundConsumer::new(storage.clone(), source, handlers, &config.consumer())
        .start(cancel.clone());

    let queue = Arc::new(TokioJobQueue::new(
        Arc::new(AccrualWorker::new(storage.clone())),
        cancel.clone(),
    ));
    let accrual = config.accrual();
    let scheduler_config = JobSchedulerConfig {
        accrual_interval: accrual.interval,
    };
    let orchestrator = Arc::new(AccrualOrchestrator::new(storage.clone(), queue.clone(), accrual));
    let scheduler = JobScheduler::with_config(orchestrator, scheduler_config).start(cancel.clone());

    // Build router and start server
    let app = api::build_router(storage);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Cleanup
    tracing::info!("Server shutting down...");
    cancel.cancel();
    for (name, handle) in [("dispatcher", dispatcher), ("consumer", consumer), ("scheduler", scheduler)] {
        if let Err(e) = handle.await {
            tracing::error!(task = name, error = %e, "Background task panicked");
        }
    }
    queue.drain().await;

    pool.close().await;
    tracing::info!("Database connections closed. Goodbye!");

    Ok(())
}

/// Shutdown signal handler for graceful shutdown
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}
