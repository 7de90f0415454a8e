use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use order_worker::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use order_worker::config::{self, AppConfig};
use order_worker::credentials::secrets_manager::SecretsManagerCredentialSource;
use order_worker::credentials::{fetch_with_retry, CredentialSource};
use order_worker::db::{DbPoolConfig, RetryConfig, SeaOrmDbPool};
use order_worker::health::{self, HealthState};
use order_worker::observability::ObservabilityHub;
use order_worker::queue::sqs::SqsQueueClient;
use order_worker::queue::QueueClient;
use order_worker::worker::pool::WorkerPoolConfig;
use order_worker::worker::WorkerPool;
use tracing::{error, info};

const EX_CONFIG: u8 = 78;
const EX_CREDENTIALS: u8 = 1;
const EX_SOFTWARE: u8 = 70;

/// At-least-once order ingestion worker.
#[derive(Parser, Debug)]
#[command(name = "order-worker")]
struct Cli {
    /// Load and validate configuration, then exit without connecting to
    /// anything. Used by deploy tooling to fail fast on a bad config layer.
    #[arg(long)]
    config_check: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let app_config = match config::load_config() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(EX_CONFIG);
        }
    };

    let observability = ObservabilityHub::init(&app_config.observability);

    if cli.config_check {
        info!("configuration is valid");
        observability.shutdown();
        return ExitCode::SUCCESS;
    }

    match run(app_config, &observability).await {
        Ok(()) => {
            observability.shutdown();
            ExitCode::SUCCESS
        }
        Err(code) => {
            observability.shutdown();
            ExitCode::from(code)
        }
    }
}

async fn run(app_config: AppConfig, observability: &ObservabilityHub) -> Result<(), u8> {
    info!("order-worker starting");

    let sdk_config = aws_config::load_from_env().await;

    let credential_source: Arc<dyn CredentialSource> = Arc::new(SecretsManagerCredentialSource::new(
        aws_sdk_secretsmanager::Client::new(&sdk_config),
    ));
    let credential = fetch_with_retry(
        credential_source.as_ref(),
        &app_config.secrets.secret_name,
        app_config.secrets.initial_backoff_ms,
        app_config.secrets.max_backoff_ms,
        app_config.secrets.max_attempts,
    )
    .await
    .map_err(|err| {
        error!(error = %err, "exhausted credential fetch retries, exiting");
        EX_CREDENTIALS
    })?;

    let db_breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: app_config.breaker.failure_threshold,
        cooldown: Duration::from_secs(app_config.breaker.cooldown_secs),
    }));

    let db_pool_config = DbPoolConfig {
        min_connections: app_config.db.min,
        max_connections: app_config.db.max,
        idle_timeout: Duration::from_secs(app_config.db.idle_timeout_secs),
        acquire_timeout: Duration::from_secs(app_config.db.acquire_timeout_secs),
    };

    let db = Arc::new(
        SeaOrmDbPool::connect(&credential, db_pool_config, db_breaker, RetryConfig::default())
            .await
            .map_err(|err| {
                error!(error = %err, "failed to establish database pool, exiting");
                EX_SOFTWARE
            })?,
    );

    let sqs_client = aws_sdk_sqs::Client::new(&sdk_config);
    let queue: Arc<dyn QueueClient> = Arc::new(SqsQueueClient::new(
        sqs_client,
        app_config.queue.queue_url.clone(),
        app_config.queue.dlq_url.clone(),
        app_config.queue.visibility_timeout_seconds,
    ));

    let worker_pool_config = WorkerPoolConfig {
        concurrency: app_config.worker.concurrency,
        shutdown_grace_period: Duration::from_secs(app_config.worker.shutdown_grace_period_secs),
        max_order_total: app_config.worker.max_order_total,
        max_messages_per_batch: app_config.queue.max_messages_per_batch,
        poll_interval: Duration::from_millis(app_config.queue.poll_interval_ms),
        wait_seconds: 20,
        visibility_timeout_seconds: app_config.queue.visibility_timeout_seconds,
        visibility_extend_threshold_ratio: app_config.queue.visibility_extend_threshold_ratio,
        max_receives: app_config.queue.max_receives,
        max_consecutive_transport_failures: app_config.queue.max_consecutive_transport_failures,
    };

    let worker_pool = WorkerPool::start(
        queue.clone(),
        db.clone(),
        observability.metrics.clone(),
        worker_pool_config,
    );

    spawn_credential_refresh_listener(
        credential_source,
        app_config.secrets.secret_name.clone(),
        db.clone(),
    );

    let health_state = Arc::new(HealthState::new(db.clone(), observability.metrics.registry.clone()));
    let health_router = health::router(health_state);

    let listener = tokio::net::TcpListener::bind(&app_config.http.bind_addr)
        .await
        .map_err(|err| {
            error!(error = %err, addr = %app_config.http.bind_addr, "failed to bind health listener");
            EX_SOFTWARE
        })?;
    info!(addr = %app_config.http.bind_addr, "health/metrics listener bound");

    let shutdown_grace_period = worker_pool_config.shutdown_grace_period;
    let mut fatal = worker_pool.fatal.clone();
    let mut exit_code: Result<(), u8> = Ok(());

    tokio::select! {
        result = axum::serve(listener, health_router) => {
            if let Err(err) = result {
                error!(error = %err, "health server exited unexpectedly");
            }
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received, draining worker pool");
        }
        result = fatal.changed() => {
            if result.is_ok() {
                let reason = fatal.borrow().clone().unwrap_or_default();
                error!(reason, "fatal condition reported by worker pool, shutting down");
                exit_code = Err(EX_SOFTWARE);
            }
        }
    }

    worker_pool.stop(shutdown_grace_period).await;
    info!("order-worker stopped cleanly");
    exit_code
}

/// Listens for SIGHUP as a runtime credential-refresh trigger (spec §8
/// Testable Property #6): fetches a fresh credential and atomically rebuilds
/// the DB pool's connection. A failed refresh is logged, not fatal — the
/// pool keeps serving on its current connection.
fn spawn_credential_refresh_listener(
    credential_source: Arc<dyn CredentialSource>,
    secret_name: String,
    db: Arc<SeaOrmDbPool>,
) {
    #[cfg(unix)]
    tokio::spawn(async move {
        let mut signal = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
            Ok(signal) => signal,
            Err(err) => {
                error!(error = %err, "failed to install SIGHUP handler, credential rotation disabled");
                return;
            }
        };

        loop {
            signal.recv().await;
            info!("SIGHUP received, refreshing database credential");
            match credential_source.fetch(&secret_name).await {
                Ok(new_cred) => match db.rebuild(&new_cred).await {
                    Ok(()) => info!("database pool rebuilt after credential refresh"),
                    Err(err) => error!(error = %err, "failed to rebuild database pool with refreshed credential"),
                },
                Err(err) => error!(error = %err, "failed to fetch refreshed credential"),
            }
        }
    });

    #[cfg(not(unix))]
    {
        let _ = (credential_source, secret_name, db);
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
