//! Queue Client: long-polls the broker, renews visibility, deletes on
//! success, routes to the dead-letter queue on terminal failure.

pub mod fake;
pub mod sqs;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::QueueError;

/// Wire form of an order submission, as received from the broker.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OrderMessage {
    pub user_id: u64,
    pub product_id: u64,
    pub quantity: u32,
    pub correlation_id: Option<String>,
    pub submitted_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// A message as handed to the Worker Pool, carrying broker metadata the
/// worker needs to ack/nack/extend it.
#[derive(Clone, Debug)]
pub struct DeliveredMessage {
    pub body: String,
    pub receipt_handle: String,
    pub receive_count: u32,
    /// `MessageDeduplicationId`, if the broker attached one; used as the
    /// idempotency key on insert.
    pub dedup_id: Option<String>,
    /// W3C `traceparent`, if present, for span continuation.
    pub traceparent: Option<String>,
}

#[async_trait]
pub trait QueueClient: Send + Sync {
    async fn receive(
        &self,
        max_batch: u32,
        wait_seconds: u32,
    ) -> Result<Vec<DeliveredMessage>, QueueError>;

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError>;

    async fn extend_visibility(
        &self,
        receipt_handle: &str,
        extra_seconds: u32,
    ) -> Result<(), QueueError>;

    /// Forward `body` to the dead-letter queue tagged with `reason`, then
    /// delete it from the source queue. Implementations must not delete from
    /// the source queue unless the DLQ send is confirmed.
    async fn send_to_dead_letter(
        &self,
        message: &DeliveredMessage,
        reason: &str,
    ) -> Result<(), QueueError>;
}
