//! Media Lab job processing server
//!
//! Runs the generation worker pool, the statistics aggregator and the
//! stale-reservation sweeper on top of PostgreSQL and Redis.
//!
//! Usage: `medialab [all|worker|aggregate|migrate]` (default `all`)

use actix_web::{middleware, web, App, HttpResponse, HttpServer};
use anyhow::{bail, Context};
use medialab_core::{pricing::PriceTable, traits::JobQueue, AppConfig, AppError};
use medialab_db::{create_pool, run_migrations, PgLedgerStore};
use medialab_queue::RedisJobQueue;
use medialab_services::{
    BillingService, HttpGenerationProvider, RedisOutcomePublisher, StatisticsAggregator,
    WorkerPool, WorkerSettings,
};
use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    /// Health server, workers, aggregator and sweeper
    All,
    Worker,
    /// One aggregation pass, then exit
    Aggregate,
    Migrate,
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Role::All),
            "worker" => Ok(Role::Worker),
            "aggregate" => Ok(Role::Aggregate),
            "migrate" => Ok(Role::Migrate),
            other => bail!(
                "unknown role '{}', expected one of: all, worker, aggregate, migrate",
                other
            ),
        }
    }
}

/// Health check endpoint
async fn health_check(queue: web::Data<Arc<dyn JobQueue>>) -> Result<HttpResponse, AppError> {
    let depth = queue.depth().await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "medialab",
        "version": env!("CARGO_PKG_VERSION"),
        "queue": depth,
    })))
}

fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::scope("/api/v1").route("/health", web::get().to(health_check)));
}

/// Initialize tracing/logging
fn init_tracing() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "medialab={},medialab_services={},medialab_db={},medialab_queue={},actix_web=info,sqlx=warn",
            log_level, log_level, log_level, log_level
        ))
    });

    let registry = tracing_subscriber::registry().with(env_filter);
    if env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false) {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .init();
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    init_tracing();

    let role = match env::args().nth(1) {
        Some(arg) => Role::from_str(&arg)?,
        None => Role::All,
    };

    info!(
        "Starting Media Lab v{} ({:?})",
        env!("CARGO_PKG_VERSION"),
        role
    );

    let config = AppConfig::load().context("Failed to load configuration")?;

    info!("Connecting to database...");
    let pool = create_pool(&config.database)
        .await
        .context("Failed to create database pool")?;

    if role == Role::Migrate {
        run_migrations(&pool).await?;
        info!("Migrations applied");
        return Ok(());
    }

    let store = Arc::new(PgLedgerStore::new(pool));
    let aggregator = StatisticsAggregator::new(
        store.clone(),
        Duration::from_secs(config.statistics.interval_secs),
    );

    if role == Role::Aggregate {
        let report = aggregator.run_once().await?;
        info!(
            "Aggregated {} users, {} operations",
            report.users, report.operations
        );
        return Ok(());
    }

    let prices = PriceTable::from_config(&config.pricing)?;
    let billing = Arc::new(BillingService::new(
        store.clone(),
        prices,
        config.billing.clone(),
    ));

    let queue: Arc<dyn JobQueue> = Arc::new(
        RedisJobQueue::new(
            &config.redis.url,
            &config.redis.key_prefix,
            &config.queue.name,
        )
        .await
        .context("Failed to connect job queue")?,
    );

    let provider = Arc::new(HttpGenerationProvider::new(
        &config.worker.provider_base_url,
        &config.worker.provider_api_key,
        config.worker.job_timeout(),
    )?);

    let notifier = Arc::new(
        RedisOutcomePublisher::new(
            &config.redis.url,
            &config.worker.outcome_channel,
            &config.worker.media_dir,
        )
        .await
        .context("Failed to connect outcome publisher")?,
    );

    let shutdown = CancellationToken::new();
    let workers = WorkerPool::new(
        config.worker.count,
        billing.clone(),
        queue.clone(),
        provider,
        notifier,
        WorkerSettings::from_config(&config.queue, &config.worker),
    );

    let mut tasks = vec![tokio::spawn(workers.run(shutdown.clone()))];

    if role == Role::All {
        let token = shutdown.clone();
        tasks.push(tokio::spawn(async move { aggregator.run(token).await }));

        let token = shutdown.clone();
        let sweeper = billing.clone();
        let sweep_interval = Duration::from_secs(config.billing.sweep_interval_secs);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = sweeper.sweep_stale_reservations().await {
                            error!("Stale reservation sweep failed: {}", e);
                        }
                    }
                }
            }
        }));

        let bind_addr = config.server_addr();
        info!("Starting health server on {}", bind_addr);

        let health_queue = queue.clone();
        // stops on SIGINT / SIGTERM
        HttpServer::new(move || {
            App::new()
                .app_data(web::Data::new(health_queue.clone()))
                .wrap(middleware::Logger::new("%a \"%r\" %s %b %Dms"))
                .configure(configure_routes)
        })
        .workers(1)
        .bind(&bind_addr)?
        .run()
        .await?;
    } else {
        tokio::signal::ctrl_c().await?;
    }

    info!("Shutting down, waiting for in-flight jobs");
    shutdown.cancel();
    for result in futures::future::join_all(tasks).await {
        if let Err(e) = result {
            error!("Background task failed: {}", e);
        }
    }

    info!("Media Lab stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test;
    use medialab_queue::MemoryJobQueue;

    #[::core::prelude::v1::test]
    fn test_role_parsing() {
        assert_eq!(Role::from_str("worker").unwrap(), Role::Worker);
        assert_eq!(Role::from_str("migrate").unwrap(), Role::Migrate);
        assert!(Role::from_str("serve").is_err());
    }

    #[actix_web::test]
    async fn test_health_endpoint() {
        let queue: Arc<dyn JobQueue> = Arc::new(MemoryJobQueue::new());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(queue))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/health").to_request();
        let resp: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(resp["status"], "healthy");
        assert_eq!(resp["queue"]["ready"], 0);
    }
}
