//! Herald binary entrypoint: HTTP API plus delivery workers.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use herald_common::amqp::connect_with_retry;
use herald_common::config::AppConfig;
use herald_common::db::{create_pool, run_migrations};
use herald_common::redis_pool::create_redis_pool;
use herald_common::types::Channel;
use herald_engine::cache::RedisStatusCache;
use herald_engine::service::NotificationService;
use herald_engine::store::PgStatusStore;
use herald_notifier::amqp::{AmqpPublisher, AmqpSource, declare_topology, open_channel};
use herald_notifier::dispatch::{DispatchPolicy, Dispatcher};
use herald_notifier::email::EmailSender;
use herald_notifier::sender::SenderRegistry;
use herald_notifier::telegram::TelegramSender;
use herald_notifier::worker::{Notifier, PoolSpec};

use herald_api::routes::create_router;
use herald_api::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing (JSON)
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("herald=info,herald_api=info,herald_engine=info,herald_notifier=info,tower_http=info")
        }))
        .init();

    tracing::info!("Starting Herald...");

    let config = AppConfig::from_env()?;

    // Postgres
    let pool = create_pool(&config.database_url, config.db_max_connections).await?;
    run_migrations(&pool).await?;
    tracing::info!("Database pool created and migrations applied");

    // Redis
    let redis = create_redis_pool(&config.redis_url).await?;
    tracing::info!("Redis connection established");

    // RabbitMQ
    let connection = connect_with_retry(
        &config.broker.url,
        config.broker.connect_retries,
        config.broker.connect_pause(),
    )
    .await?;
    let publish_channel = open_channel(&connection)
        .await
        .context("failed to open publish channel")?;
    let consume_channel = open_channel(&connection)
        .await
        .context("failed to open consume channel")?;
    declare_topology(&publish_channel, &config.broker)
        .await
        .context("failed to declare broker topology")?;

    // Senders
    let mut registry = SenderRegistry::builder();
    if let Some(smtp) = &config.smtp {
        registry = registry.register(Channel::Email, Arc::new(EmailSender::new(smtp)?));
    } else {
        tracing::warn!("SMTP_HOST not set, email notifications will be dropped");
    }
    let telegram = config.telegram.as_ref().map(TelegramSender::new);
    if let Some(sender) = &telegram {
        registry = registry.register(Channel::Telegram, Arc::new(sender.clone()));
    } else {
        tracing::warn!("TELEGRAM_BOT_TOKEN not set, telegram notifications will be dropped");
    }
    let registry = registry.build();
    tracing::info!(channels = ?registry.channels(), "Senders registered");

    // Coordinator
    let publisher = Arc::new(AmqpPublisher::new(publish_channel, config.broker.clone()));
    let service = NotificationService::new(
        Arc::new(PgStatusStore::new(pool.clone())),
        Arc::new(RedisStatusCache::new(redis, config.status_cache_ttl())),
        publisher.clone(),
    );

    // Delivery workers
    let dispatcher = Arc::new(Dispatcher::new(
        registry,
        Arc::new(service.clone()),
        publisher,
        DispatchPolicy::from(&config.delivery),
    ));

    let mut pools = Vec::new();
    for channel in Channel::ALL {
        let queues = [
            (config.broker.queue(channel), config.delivery.primary_workers),
            (config.broker.retry_queue(channel), config.delivery.retry_workers),
        ];
        for (queue, workers) in queues {
            let prefetch = u16::try_from(workers).unwrap_or(u16::MAX);
            let source = AmqpSource::consume(&consume_channel, queue, prefetch)
                .await
                .with_context(|| format!("failed to consume from {}", queue))?;
            pools.push(PoolSpec {
                channel,
                queue: queue.to_string(),
                workers,
                source: Arc::new(source),
            });
        }
    }

    let cancel = CancellationToken::new();
    let notifier = Notifier::new(dispatcher, pools).start(cancel.clone());

    let telegram_listener = telegram.map(|sender| tokio::spawn(sender.listen_updates(cancel.clone())));

    // HTTP
    let app = create_router(AppState::new(service), config.http_body_limit)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(config.http_addr.as_str()).await?;
    tracing::info!("API server listening on {}", config.http_addr);

    let http_stop = CancellationToken::new();
    let server = tokio::spawn({
        let http_stop = http_stop.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { http_stop.cancelled().await })
                .await
        }
    });

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, stopping workers");

    cancel.cancel();
    if let Err(e) = notifier.await {
        tracing::error!(error = %e, "Notifier task failed");
    }
    if let Some(listener) = telegram_listener {
        if let Err(e) = listener.await {
            tracing::error!(error = %e, "Telegram listener task failed");
        }
    }

    http_stop.cancel();
    match tokio::time::timeout(config.shutdown_timeout(), server).await {
        Ok(Ok(Ok(()))) => tracing::info!("HTTP server stopped"),
        Ok(Ok(Err(e))) => tracing::error!(error = %e, "HTTP server error"),
        Ok(Err(e)) => tracing::error!(error = %e, "HTTP server task failed"),
        Err(_) => tracing::warn!("HTTP server did not stop within the shutdown timeout"),
    }

    if let Err(e) = connection.close(200, "shutdown").await {
        tracing::warn!(error = %e, "Failed to close broker connection");
    }
    pool.close().await;

    tracing::info!("Herald stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
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
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
