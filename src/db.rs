pub mod transaction;

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use metrics::{counter, histogram};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DatabaseTransaction, DbErr, TransactionTrait};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use crate::credentials::Credential;
use crate::errors::DbPoolError;

/// Retry configuration for transient database operations, independent of
/// circuit-breaker admission.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

fn is_retryable(err: &DbErr) -> bool {
    match err {
        DbErr::Conn(_) | DbErr::ConnectionAcquire(_) => true,
        DbErr::Query(runtime_err) => {
            let msg = runtime_err.to_string().to_lowercase();
            msg.contains("connection")
                || msg.contains("timeout")
                || msg.contains("broken pipe")
                || msg.contains("reset by peer")
        }
        _ => false,
    }
}

pub async fn with_retry<F, Fut, T>(config: &RetryConfig, operation: &str, mut f: F) -> Result<T, DbErr>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DbErr>>,
{
    let mut attempts = 0;
    let mut delay = config.initial_delay;

    loop {
        attempts += 1;
        match f().await {
            Ok(value) => {
                if attempts > 1 {
                    info!(operation, attempts, "database operation succeeded after retry");
                    counter!("order_worker.db.retry.success", 1, "operation" => operation.to_string());
                }
                return Ok(value);
            }
            Err(err) => {
                if attempts >= config.max_retries || !is_retryable(&err) {
                    error!(operation, attempts, error = %err, "database operation failed");
                    counter!("order_worker.db.retry.exhausted", 1, "operation" => operation.to_string());
                    return Err(err);
                }
                warn!(operation, attempts, delay_ms = delay.as_millis() as u64, error = %err, "retrying database operation");
                counter!("order_worker.db.retry.attempt", 1, "operation" => operation.to_string());
                sleep(delay).await;
                delay = Duration::from_secs_f64((delay.as_secs_f64() * config.backoff_multiplier).min(config.max_delay.as_secs_f64()));
            }
        }
    }
}

/// Pool sizing, recognized from config per spec §6.
#[derive(Debug, Clone)]
pub struct DbPoolConfig {
    pub min_connections: u32,
    pub max_connections: u32,
    pub idle_timeout: Duration,
    pub acquire_timeout: Duration,
}

impl Default for DbPoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 10,
            idle_timeout: Duration::from_secs(300),
            acquire_timeout: Duration::from_secs(8),
        }
    }
}

/// Pull-based gauge snapshot for the Observability Hub's
/// `db.pool.{active,idle,queued}` metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolGauges {
    pub active_connections: u32,
    pub idle_connections: u32,
    pub queued_acquires: u32,
}

async fn connect(credential: &Credential, pool_config: &DbPoolConfig) -> Result<DatabaseConnection, DbErr> {
    let mut options = ConnectOptions::new(credential.connection_url());
    options
        .min_connections(pool_config.min_connections)
        .max_connections(pool_config.max_connections)
        .idle_timeout(pool_config.idle_timeout)
        .connect_timeout(pool_config.acquire_timeout)
        .sqlx_logging(false);
    Database::connect(options).await
}

/// Connection pool to the relational store, rebuildable in place on
/// credential rotation. `inner` is an atomic pointer swap: new acquires read
/// the current connection, in-flight operations hold their own clone and
/// finish against the connection they started with.
pub struct SeaOrmDbPool {
    inner: ArcSwap<DatabaseConnection>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryConfig,
    pool_config: DbPoolConfig,
    queued_acquires: AtomicU32,
}

impl SeaOrmDbPool {
    pub async fn connect(
        credential: &Credential,
        pool_config: DbPoolConfig,
        breaker: Arc<CircuitBreaker>,
        retry: RetryConfig,
    ) -> Result<Self, DbErr> {
        let connection = connect(credential, &pool_config).await?;
        Ok(Self {
            inner: ArcSwap::from_pointee(connection),
            breaker,
            retry,
            pool_config,
            queued_acquires: AtomicU32::new(0),
        })
    }

    /// Builds a fresh connection from `new_cred` and atomically swaps it in.
    /// Existing checked-out connections (already cloned `Arc`s held by
    /// in-flight calls) continue until their sqlx pool drains; no request in
    /// flight is aborted.
    pub async fn rebuild(&self, new_cred: &Credential) -> Result<(), DbErr> {
        let fresh = connect(new_cred, &self.pool_config).await?;
        self.inner.store(Arc::new(fresh));
        info!("database pool rebuilt after credential rotation");
        Ok(())
    }

    /// Wraps an already-open connection (typically `sqlite::memory:`) behind
    /// a pool with a fresh breaker, bypassing credential resolution.
    /// Integration tests use this the same way the rest of this stack's test
    /// harness connects straight to a pre-migrated sqlite database.
    #[cfg(any(test, feature = "mock-tests"))]
    pub fn for_tests(connection: DatabaseConnection) -> Self {
        Self {
            inner: ArcSwap::from_pointee(connection),
            breaker: Arc::new(CircuitBreaker::new(crate::circuit_breaker::CircuitBreakerConfig::default())),
            retry: RetryConfig::default(),
            pool_config: DbPoolConfig::default(),
            queued_acquires: AtomicU32::new(0),
        }
    }

    /// Swaps in an already-open connection, the same atomic store `rebuild`
    /// performs, without resolving a credential. Used to exercise the
    /// rotation swap against sqlite, since `Credential::connection_url`
    /// always produces a `postgres://` URL.
    #[cfg(any(test, feature = "mock-tests"))]
    pub fn rebuild_with_connection(&self, connection: DatabaseConnection) {
        self.inner.store(Arc::new(connection));
        info!("database pool rebuilt (test)");
    }

    fn connection(&self) -> Arc<DatabaseConnection> {
        self.inner.load_full()
    }

    pub fn breaker_state_gauge(&self) -> u8 {
        self.breaker.state_gauge()
    }

    pub fn pool_gauges(&self) -> PoolGauges {
        PoolGauges {
            active_connections: 0,
            idle_connections: 0,
            queued_acquires: self.queued_acquires.load(Ordering::Relaxed),
        }
    }

    /// Runs `f` against the current connection, behind the circuit breaker
    /// and the retry policy. Acquire-class failures are reported as
    /// `Unavailable`, distinguishable from a query returning no rows.
    pub async fn execute<F, Fut, T>(&self, operation: &str, f: F) -> Result<T, DbPoolError>
    where
        F: Fn(Arc<DatabaseConnection>) -> Fut,
        Fut: Future<Output = Result<T, DbErr>>,
    {
        let conn = self.connection();
        let start = std::time::Instant::now();

        let outcome = self
            .breaker
            .call(DbPoolError::is_breaker_failure, || async {
                with_retry(&self.retry, operation, || f(conn.clone()))
                    .await
                    .map_err(classify)
            })
            .await;

        histogram!("order_worker.db.call.duration_ms", start.elapsed().as_millis() as f64, "operation" => operation.to_string());

        match outcome {
            Ok(value) => Ok(value),
            Err(CircuitBreakerError::Open) => Err(DbPoolError::Unavailable("circuit open".to_string())),
            Err(CircuitBreakerError::Call(err)) => Err(err),
        }
    }

    pub async fn transact<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: for<'a> FnOnce(&'a DatabaseTransaction) -> transaction::BoxFuture<'a, Result<T, E>>,
        E: From<DbErr>,
    {
        let conn = self.connection();
        transaction::with_transaction(&conn, f).await
    }
}

fn is_unique_violation_message(err: &DbErr) -> bool {
    match err {
        DbErr::Exec(runtime_err) | DbErr::Query(runtime_err) => {
            let msg = runtime_err.to_string().to_lowercase();
            msg.contains("unique") || msg.contains("duplicate")
        }
        _ => false,
    }
}

fn classify(err: DbErr) -> DbPoolError {
    match &err {
        DbErr::RecordNotFound(_) => DbPoolError::NotFound,
        DbErr::Conn(_) | DbErr::ConnectionAcquire(_) => DbPoolError::Unavailable(err.to_string()),
        _ if is_unique_violation_message(&err) => DbPoolError::UniqueViolation(err.to_string()),
        _ => DbPoolError::Query(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_not_found_classifies_as_not_found() {
        let err = classify(DbErr::RecordNotFound("orders".to_string()));
        assert!(matches!(err, DbPoolError::NotFound));
        assert!(!err.is_breaker_failure());
    }

    #[test]
    fn custom_errors_classify_as_query_failures_and_trip_the_breaker() {
        let err = classify(DbErr::Custom("connection reset by peer".to_string()));
        assert!(matches!(err, DbPoolError::Query(_)));
        assert!(err.is_breaker_failure());
    }

    #[test]
    fn unique_constraint_violations_do_not_trip_the_breaker() {
        let err = classify(DbErr::Exec(sea_orm::RuntimeErr::Internal(
            "UNIQUE constraint failed: orders.dedup_key".to_string(),
        )));
        assert!(matches!(err, DbPoolError::UniqueViolation(_)));
        assert!(!err.is_breaker_failure());
    }

    #[tokio::test]
    async fn rebuild_atomically_swaps_the_connection_without_disturbing_held_references() {
        let conn_a = Database::connect("sqlite::memory:").await.unwrap();
        conn_a
            .execute(sea_orm::Statement::from_string(
                conn_a.get_database_backend(),
                "CREATE TABLE marker (v INTEGER)".to_string(),
            ))
            .await
            .unwrap();
        conn_a
            .execute(sea_orm::Statement::from_string(
                conn_a.get_database_backend(),
                "INSERT INTO marker (v) VALUES (1)".to_string(),
            ))
            .await
            .unwrap();

        let conn_b = Database::connect("sqlite::memory:").await.unwrap();
        conn_b
            .execute(sea_orm::Statement::from_string(
                conn_b.get_database_backend(),
                "CREATE TABLE marker (v INTEGER)".to_string(),
            ))
            .await
            .unwrap();
        conn_b
            .execute(sea_orm::Statement::from_string(
                conn_b.get_database_backend(),
                "INSERT INTO marker (v) VALUES (2)".to_string(),
            ))
            .await
            .unwrap();

        let pool = SeaOrmDbPool::for_tests(conn_a);
        let held = pool.connection();

        pool.rebuild_with_connection(conn_b);

        let held_value: i32 = held
            .query_one(sea_orm::Statement::from_string(
                held.get_database_backend(),
                "SELECT v FROM marker".to_string(),
            ))
            .await
            .unwrap()
            .unwrap()
            .try_get("", "v")
            .unwrap();
        assert_eq!(held_value, 1, "a reference acquired before rebuild keeps reading the old connection");

        let fresh = pool.connection();
        let fresh_value: i32 = fresh
            .query_one(sea_orm::Statement::from_string(
                fresh.get_database_backend(),
                "SELECT v FROM marker".to_string(),
            ))
            .await
            .unwrap()
            .unwrap()
            .try_get("", "v")
            .unwrap();
        assert_eq!(fresh_value, 2, "an acquire after rebuild reads the new connection");
    }
}
