//! Bounded-parallelism Worker Pool. The poller and the workers communicate
//! through a bounded `mpsc` channel; when it is full the poller's send
//! blocks, which is the backpressure mechanism — the broker is not asked for
//! more messages than the workers can presently absorb.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::db::SeaOrmDbPool;
use crate::errors::FailureKind;
use crate::metrics::OrderWorkerMetrics;
use crate::queue::{DeliveredMessage, QueueClient};

use super::pipeline::{self, OrderOutcome};

#[derive(Debug, Clone, Copy)]
pub struct WorkerPoolConfig {
    pub concurrency: usize,
    pub shutdown_grace_period: Duration,
    pub max_order_total: Decimal,
    pub max_messages_per_batch: u32,
    pub poll_interval: Duration,
    pub wait_seconds: u32,
    pub visibility_timeout_seconds: u32,
    pub visibility_extend_threshold_ratio: f64,
    pub max_receives: u32,
    /// Consecutive queue-transport failures the poller tolerates before
    /// escalating to `FailureKind::Fatal` (spec §7: loss of the queue
    /// endpoint beyond a threshold is unrecoverable, not merely transient).
    pub max_consecutive_transport_failures: u32,
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    poller_handle: JoinHandle<()>,
    sender: mpsc::Sender<DeliveredMessage>,
    /// Carries the reason string the first time any task observes a
    /// `FailureKind::Fatal` condition. `main.rs` selects on this alongside
    /// OS signals to trigger the same graceful-drain-then-exit sequence.
    pub fatal: watch::Receiver<Option<String>>,
}

impl WorkerPool {
    /// Spawns the poller and `concurrency` worker tasks. The channel
    /// capacity (`concurrency * 2`) bounds how far the poller can run ahead
    /// of the workers.
    pub fn start(
        queue: Arc<dyn QueueClient>,
        db: Arc<SeaOrmDbPool>,
        metrics: Arc<OrderWorkerMetrics>,
        config: WorkerPoolConfig,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.concurrency * 2);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let (fatal_tx, fatal_rx) = watch::channel(None);

        let mut handles = Vec::with_capacity(config.concurrency);
        for worker_id in 0..config.concurrency {
            let receiver = receiver.clone();
            let queue = queue.clone();
            let db = db.clone();
            let metrics = metrics.clone();
            let config = config.clone();
            let fatal_tx = fatal_tx.clone();
            handles.push(tokio::spawn(async move {
                worker_loop(worker_id, receiver, queue, db, metrics, config, fatal_tx).await;
            }));
        }

        let poller_handle = tokio::spawn(poller_loop(
            queue.clone(),
            metrics.clone(),
            sender.clone(),
            config.clone(),
            fatal_tx,
        ));

        Self {
            handles,
            poller_handle,
            sender,
            fatal: fatal_rx,
        }
    }

    /// Closes the channel (the poller stops being able to hand off new
    /// work), waits up to `timeout` for in-flight workers to finish, then
    /// aborts stragglers. An aborted worker never reaches its `Delete` call,
    /// so its message simply re-delivers once the lease expires.
    pub async fn stop(self, timeout: Duration) {
        self.poller_handle.abort();
        drop(self.sender);

        let drain = async {
            for handle in &self.handles {
                while !handle.is_finished() {
                    tokio::time::sleep(Duration::from_millis(25)).await;
                }
            }
        };

        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!("shutdown grace period elapsed with tasks still in flight, aborting");
        }

        for handle in self.handles {
            if !handle.is_finished() {
                handle.abort();
            }
        }
    }
}

async fn poller_loop(
    queue: Arc<dyn QueueClient>,
    metrics: Arc<OrderWorkerMetrics>,
    sender: mpsc::Sender<DeliveredMessage>,
    config: WorkerPoolConfig,
    fatal_tx: watch::Sender<Option<String>>,
) {
    let mut transport_backoff = config.poll_interval;
    let mut consecutive_failures: u32 = 0;
    loop {
        match queue
            .receive(config.max_messages_per_batch, config.wait_seconds)
            .await
        {
            Ok(batch) => {
                transport_backoff = config.poll_interval;
                consecutive_failures = 0;
                if batch.is_empty() {
                    tokio::time::sleep(config.poll_interval).await;
                    continue;
                }
                metrics.messages_received.inc_by(batch.len() as u64);
                for message in batch {
                    // Blocks here when the channel is full: backpressure.
                    if sender.send(message).await.is_err() {
                        return;
                    }
                }
            }
            Err(err) => {
                consecutive_failures += 1;
                if consecutive_failures >= config.max_consecutive_transport_failures {
                    let reason = format!(
                        "queue endpoint unreachable for {consecutive_failures} consecutive attempts: {err}"
                    );
                    tracing::error!(error = %err, consecutive_failures, "queue transport failure threshold exceeded, escalating to fatal");
                    fatal_tx.send(Some(reason)).ok();
                    return;
                }
                warn!(error = %err, backoff_ms = transport_backoff.as_millis() as u64, consecutive_failures, "queue receive failed, backing off");
                tokio::time::sleep(transport_backoff).await;
                transport_backoff = (transport_backoff * 2).min(Duration::from_secs(60));
            }
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<DeliveredMessage>>>,
    queue: Arc<dyn QueueClient>,
    db: Arc<SeaOrmDbPool>,
    metrics: Arc<OrderWorkerMetrics>,
    config: WorkerPoolConfig,
    fatal_tx: watch::Sender<Option<String>>,
) {
    loop {
        let message = {
            let mut guard = receiver.lock().await;
            guard.recv().await
        };
        let Some(message) = message else {
            return;
        };

        metrics.worker_inflight.set(1.0);
        handle_message(worker_id, &message, &queue, &db, &metrics, &config, &fatal_tx).await;
        metrics.worker_inflight.set(0.0);
    }
}

async fn handle_message(
    worker_id: usize,
    message: &DeliveredMessage,
    queue: &Arc<dyn QueueClient>,
    db: &Arc<SeaOrmDbPool>,
    metrics: &Arc<OrderWorkerMetrics>,
    config: &WorkerPoolConfig,
    fatal_tx: &watch::Sender<Option<String>>,
) {
    if message.receive_count > config.max_receives {
        dead_letter(queue, metrics, message, "max_receives_exceeded").await;
        return;
    }

    let extend_handle = spawn_visibility_extender(queue.clone(), message.clone(), *config);

    let start = std::time::Instant::now();
    let result = pipeline::process_message(db, message, config.max_order_total).await;
    metrics
        .task_duration
        .observe(start.elapsed().as_millis() as f64);
    extend_handle.abort();

    match result {
        Ok(outcome) => {
            metrics.messages_processed.inc();
            if let OrderOutcome::Inserted { order_id, .. } = &outcome {
                info!(worker_id, order_id, "order inserted");
            }
            if let Err(err) = queue.delete(&message.receipt_handle).await {
                warn!(worker_id, error = %err, "failed to delete acked message, it will be redelivered");
            }
        }
        Err(err) => match err.kind {
            FailureKind::Permanent => {
                metrics.messages_failed_permanent.inc();
                let reason = err.dead_letter_reason.clone().unwrap_or_else(|| "permanent_error".to_string());
                dead_letter(queue, metrics, message, &reason).await;
            }
            FailureKind::Transient => {
                metrics.messages_failed_transient.inc();
                warn!(worker_id, error = %err.source, "transient failure, leaving message for redelivery");
            }
            FailureKind::Fatal => {
                metrics.messages_failed_transient.inc();
                tracing::error!(worker_id, error = %err.source, "fatal error processing message, triggering shutdown");
                fatal_tx.send(Some(err.source.to_string())).ok();
            }
        },
    }
}

async fn dead_letter(
    queue: &Arc<dyn QueueClient>,
    metrics: &Arc<OrderWorkerMetrics>,
    message: &DeliveredMessage,
    reason: &str,
) {
    match queue.send_to_dead_letter(message, reason).await {
        Ok(()) => metrics.messages_dead_lettered.inc(),
        Err(err) => {
            warn!(error = %err, reason, "dead-letter send failed, message left for redelivery");
        }
    }
}

/// One visibility-extension task per in-flight message, aborted as soon as
/// the owning worker task finishes. Bounded because worker concurrency is
/// bounded.
fn spawn_visibility_extender(
    queue: Arc<dyn QueueClient>,
    message: DeliveredMessage,
    config: WorkerPoolConfig,
) -> JoinHandle<()> {
    let extend_after = Duration::from_secs_f64(
        config.visibility_timeout_seconds as f64 * config.visibility_extend_threshold_ratio,
    );
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(extend_after.max(Duration::from_millis(1)));
        interval.tick().await; // first tick fires immediately; skip it
        loop {
            interval.tick().await;
            if let Err(err) = queue
                .extend_visibility(&message.receipt_handle, config.visibility_timeout_seconds)
                .await
            {
                warn!(error = %err, "failed to extend message visibility");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::fake::FakeQueueClient;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_config() -> WorkerPoolConfig {
        WorkerPoolConfig {
            concurrency: 2,
            shutdown_grace_period: Duration::from_millis(500),
            max_order_total: dec!(1000000),
            max_messages_per_batch: 10,
            poll_interval: Duration::from_millis(20),
            wait_seconds: 0,
            visibility_timeout_seconds: 10,
            visibility_extend_threshold_ratio: 0.5,
            max_receives: 3,
            max_consecutive_transport_failures: 10,
        }
    }

    /// A queue client that only counts `extend_visibility` calls, so the
    /// extender test observes the call directly rather than inferring it
    /// from queue side effects.
    struct ExtendCountingQueue {
        extend_calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl QueueClient for ExtendCountingQueue {
        async fn receive(&self, _: u32, _: u32) -> Result<Vec<DeliveredMessage>, crate::errors::QueueError> {
            Ok(vec![])
        }
        async fn delete(&self, _: &str) -> Result<(), crate::errors::QueueError> {
            Ok(())
        }
        async fn extend_visibility(&self, _: &str, _: u32) -> Result<(), crate::errors::QueueError> {
            self.extend_calls.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        async fn send_to_dead_letter(&self, _: &DeliveredMessage, _: &str) -> Result<(), crate::errors::QueueError> {
            Ok(())
        }
    }

    /// Exercises spec §4.D visibility management: a task that outlives
    /// `visibility_extend_threshold_ratio * visibility_timeout_seconds` must
    /// trigger at least one `ExtendVisibility` call before its lease would
    /// otherwise expire.
    #[tokio::test]
    async fn visibility_extender_fires_before_the_lease_would_expire() {
        let queue: Arc<ExtendCountingQueue> = Arc::new(ExtendCountingQueue {
            extend_calls: AtomicUsize::new(0),
        });
        let message = DeliveredMessage {
            body: "{}".to_string(),
            receipt_handle: "r1".to_string(),
            receive_count: 1,
            dedup_id: None,
            traceparent: None,
        };

        let config = WorkerPoolConfig {
            visibility_timeout_seconds: 1,
            visibility_extend_threshold_ratio: 0.1,
            ..test_config()
        };

        let handle = spawn_visibility_extender(queue.clone() as Arc<dyn QueueClient>, message, config);

        // extend_after = 1s * 0.1 = 100ms; give it room to fire at least once
        // comfortably before the 1s lease would otherwise expire.
        tokio::time::sleep(Duration::from_millis(250)).await;
        handle.abort();

        assert!(queue.extend_calls.load(Ordering::Relaxed) >= 1);
    }

    /// End-to-end happy path (spec §8 S1): a worker pool draining a fake
    /// queue against a seeded sqlite database inserts exactly one order and
    /// deletes the source message.
    #[tokio::test]
    async fn processes_a_valid_message_end_to_end_and_deletes_it() {
        use migrations::{Migrator, MigratorTrait};
        use sea_orm::{ActiveModelTrait, Database, Set};

        let connection = Database::connect("sqlite::memory:").await.expect("connect");
        Migrator::up(&connection, None).await.expect("migrate");

        crate::entities::user::ActiveModel {
            username: Set("alice".to_string()),
            created_at: Set(chrono::Utc::now()),
            ..Default::default()
        }
        .insert(&connection)
        .await
        .expect("seed user");

        crate::entities::product::ActiveModel {
            name: Set("Widget".to_string()),
            sku: Set("SKU-1".to_string()),
            unit_price: Set(dec!(49.95)),
            created_at: Set(chrono::Utc::now()),
            ..Default::default()
        }
        .insert(&connection)
        .await
        .expect("seed product");

        let db = Arc::new(SeaOrmDbPool::for_tests(connection));
        let queue = Arc::new(FakeQueueClient::new(Duration::from_secs(30)));
        queue
            .enqueue(r#"{"user_id":1,"product_id":1,"quantity":2}"#, Some("dedup-e2e".to_string()))
            .await;

        let metrics = Arc::new(OrderWorkerMetrics::new());
        let pool = WorkerPool::start(
            queue.clone() as Arc<dyn QueueClient>,
            db.clone(),
            metrics.clone(),
            test_config(),
        );

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while tokio::time::Instant::now() < deadline {
            if queue.pending_len().await == 0 && metrics.messages_processed.get() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(metrics.messages_processed.get(), 1);
        assert_eq!(queue.dead_letters().await.len(), 0);

        pool.stop(Duration::from_millis(500)).await;
    }

    /// Graceful shutdown (spec §8 S7): `stop` returns within its grace period
    /// once in-flight workers drain, without deleting messages that never
    /// finished.
    #[tokio::test]
    async fn stop_returns_within_the_grace_period_with_no_messages_in_flight() {
        let queue: Arc<dyn QueueClient> = Arc::new(FakeQueueClient::new(Duration::from_secs(30)));
        let connection = sea_orm::Database::connect("sqlite::memory:").await.expect("connect");
        let db = Arc::new(SeaOrmDbPool::for_tests(connection));
        let metrics = Arc::new(OrderWorkerMetrics::new());

        let pool = WorkerPool::start(queue, db, metrics, test_config());

        let started = tokio::time::Instant::now();
        pool.stop(Duration::from_millis(300)).await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    /// A queue whose `receive` always errors, simulating a lost endpoint.
    struct AlwaysFailingQueue;

    #[async_trait::async_trait]
    impl QueueClient for AlwaysFailingQueue {
        async fn receive(&self, _: u32, _: u32) -> Result<Vec<DeliveredMessage>, crate::errors::QueueError> {
            Err(crate::errors::QueueError::Transport("endpoint unreachable".to_string()))
        }
        async fn delete(&self, _: &str) -> Result<(), crate::errors::QueueError> {
            Ok(())
        }
        async fn extend_visibility(&self, _: &str, _: u32) -> Result<(), crate::errors::QueueError> {
            Ok(())
        }
        async fn send_to_dead_letter(&self, _: &DeliveredMessage, _: &str) -> Result<(), crate::errors::QueueError> {
            Ok(())
        }
    }

    /// Spec §7: loss of the queue endpoint beyond a configured threshold of
    /// consecutive failures escalates to `Fatal`, surfaced on `pool.fatal`.
    #[tokio::test]
    async fn poller_escalates_to_fatal_after_consecutive_transport_failures() {
        let queue: Arc<dyn QueueClient> = Arc::new(AlwaysFailingQueue);
        let connection = sea_orm::Database::connect("sqlite::memory:").await.expect("connect");
        let db = Arc::new(SeaOrmDbPool::for_tests(connection));
        let metrics = Arc::new(OrderWorkerMetrics::new());

        let config = WorkerPoolConfig {
            poll_interval: Duration::from_millis(1),
            max_consecutive_transport_failures: 3,
            ..test_config()
        };
        let pool = WorkerPool::start(queue, db, metrics, config);

        let mut fatal = pool.fatal.clone();
        tokio::time::timeout(Duration::from_secs(2), fatal.changed())
            .await
            .expect("fatal signal should fire")
            .expect("watch sender still alive");
        assert!(fatal.borrow().is_some());

        pool.stop(Duration::from_millis(200)).await;
    }
}
