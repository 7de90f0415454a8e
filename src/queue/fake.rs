//! In-memory queue client for tests: a single mutex-guarded `VecDeque`,
//! extended with receive-count tracking and an injectable visibility
//! timeout so tests can exercise redelivery and DLQ scenarios without a live
//! broker.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::errors::QueueError;

use super::{DeliveredMessage, QueueClient};

#[derive(Clone)]
struct InFlight {
    message: DeliveredMessage,
    visible_at: Instant,
}

struct State {
    pending: VecDeque<DeliveredMessage>,
    in_flight: Vec<InFlight>,
    dead_letters: Vec<(DeliveredMessage, String)>,
}

pub struct FakeQueueClient {
    state: Arc<Mutex<State>>,
    visibility_timeout: Duration,
}

impl FakeQueueClient {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                pending: VecDeque::new(),
                in_flight: Vec::new(),
                dead_letters: Vec::new(),
            })),
            visibility_timeout,
        }
    }

    pub async fn enqueue(&self, body: impl Into<String>, dedup_id: Option<String>) {
        let mut state = self.state.lock().await;
        let handle = format!("receipt-{}", state.pending.len() + state.in_flight.len() + 1);
        state.pending.push_back(DeliveredMessage {
            body: body.into(),
            receipt_handle: handle,
            receive_count: 0,
            dedup_id,
            traceparent: None,
        });
    }

    pub async fn dead_letters(&self) -> Vec<(DeliveredMessage, String)> {
        self.state.lock().await.dead_letters.clone()
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Moves any in-flight message whose visibility has elapsed back to
    /// `pending`, incrementing its receive count — simulates broker
    /// redelivery after an expired lease.
    async fn requeue_expired(state: &mut State) {
        let now = Instant::now();
        let mut still_in_flight = Vec::with_capacity(state.in_flight.len());
        for mut entry in state.in_flight.drain(..) {
            if entry.visible_at <= now {
                entry.message.receive_count += 1;
                state.pending.push_back(entry.message);
            } else {
                still_in_flight.push(entry);
            }
        }
        state.in_flight = still_in_flight;
    }
}

#[async_trait]
impl QueueClient for FakeQueueClient {
    async fn receive(
        &self,
        max_batch: u32,
        _wait_seconds: u32,
    ) -> Result<Vec<DeliveredMessage>, QueueError> {
        let mut state = self.state.lock().await;
        Self::requeue_expired(&mut state).await;

        let mut out = Vec::new();
        for _ in 0..max_batch {
            let Some(mut message) = state.pending.pop_front() else {
                break;
            };
            message.receive_count += 1;
            state.in_flight.push(InFlight {
                message: message.clone(),
                visible_at: Instant::now() + self.visibility_timeout,
            });
            out.push(message);
        }
        Ok(out)
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.in_flight.retain(|m| m.message.receipt_handle != receipt_handle);
        Ok(())
    }

    async fn extend_visibility(
        &self,
        receipt_handle: &str,
        extra_seconds: u32,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if let Some(entry) = state
            .in_flight
            .iter_mut()
            .find(|m| m.message.receipt_handle == receipt_handle)
        {
            entry.visible_at = Instant::now() + Duration::from_secs(extra_seconds as u64);
            Ok(())
        } else {
            Err(QueueError::Transport(format!(
                "no in-flight message with receipt handle {receipt_handle}"
            )))
        }
    }

    async fn send_to_dead_letter(
        &self,
        message: &DeliveredMessage,
        reason: &str,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.in_flight.retain(|m| m.message.receipt_handle != message.receipt_handle);
        state.dead_letters.push((message.clone(), reason.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn redelivers_after_visibility_expires() {
        let q = FakeQueueClient::new(Duration::from_millis(10));
        q.enqueue("{}", None).await;

        let batch = q.receive(10, 0).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].receive_count, 1);

        tokio::time::sleep(Duration::from_millis(20)).await;

        let batch2 = q.receive(10, 0).await.unwrap();
        assert_eq!(batch2.len(), 1);
        assert_eq!(batch2[0].receive_count, 2);
    }

    #[tokio::test]
    async fn dead_letter_removes_from_in_flight() {
        let q = FakeQueueClient::new(Duration::from_secs(30));
        q.enqueue("{}", None).await;
        let batch = q.receive(10, 0).await.unwrap();
        q.send_to_dead_letter(&batch[0], "parse_error").await.unwrap();

        let letters = q.dead_letters().await;
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].1, "parse_error");

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(q.pending_len().await, 0);
    }
}
