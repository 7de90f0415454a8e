use async_trait::async_trait;
use aws_sdk_sqs::types::{MessageAttributeValue, MessageSystemAttributeName, QueueAttributeName};
use aws_sdk_sqs::Client;

use crate::errors::QueueError;

use super::{DeliveredMessage, QueueClient};

pub struct SqsQueueClient {
    client: Client,
    queue_url: String,
    dlq_url: String,
    visibility_timeout_seconds: u32,
}

impl SqsQueueClient {
    pub fn new(client: Client, queue_url: String, dlq_url: String, visibility_timeout_seconds: u32) -> Self {
        Self {
            client,
            queue_url,
            dlq_url,
            visibility_timeout_seconds,
        }
    }
}

#[async_trait]
impl QueueClient for SqsQueueClient {
    async fn receive(
        &self,
        max_batch: u32,
        wait_seconds: u32,
    ) -> Result<Vec<DeliveredMessage>, QueueError> {
        let max_batch = max_batch.clamp(1, 10);

        let response = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_batch as i32)
            .wait_time_seconds(wait_seconds as i32)
            .visibility_timeout(self.visibility_timeout_seconds as i32)
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .message_attribute_names("traceparent")
            .message_attribute_names("MessageDeduplicationId")
            .send()
            .await
            .map_err(|err| QueueError::Transport(err.to_string()))?;

        let messages = response
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(|msg| {
                let body = msg.body?;
                let receipt_handle = msg.receipt_handle?;
                let receive_count = msg
                    .attributes
                    .as_ref()
                    .and_then(|attrs| attrs.get(&MessageSystemAttributeName::ApproximateReceiveCount))
                    .and_then(|v| v.parse::<u32>().ok())
                    .unwrap_or(1);
                let dedup_id = msg
                    .message_attributes
                    .as_ref()
                    .and_then(|attrs| attrs.get("MessageDeduplicationId"))
                    .and_then(|v| v.string_value.clone());
                let traceparent = msg
                    .message_attributes
                    .as_ref()
                    .and_then(|attrs| attrs.get("traceparent"))
                    .and_then(|v| v.string_value.clone());

                Some(DeliveredMessage {
                    body,
                    receipt_handle,
                    receive_count,
                    dedup_id,
                    traceparent,
                })
            })
            .collect();

        Ok(messages)
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|err| QueueError::Transport(err.to_string()))?;
        Ok(())
    }

    async fn extend_visibility(
        &self,
        receipt_handle: &str,
        extra_seconds: u32,
    ) -> Result<(), QueueError> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(extra_seconds as i32)
            .send()
            .await
            .map_err(|err| QueueError::Transport(err.to_string()))?;
        Ok(())
    }

    async fn send_to_dead_letter(
        &self,
        message: &DeliveredMessage,
        reason: &str,
    ) -> Result<(), QueueError> {
        self.client
            .send_message()
            .queue_url(&self.dlq_url)
            .message_body(&message.body)
            .message_attributes(
                "deadLetterReason",
                MessageAttributeValue::builder()
                    .data_type("String")
                    .string_value(reason)
                    .build()
                    .map_err(|err| QueueError::DeadLetterSendFailed(err.to_string()))?,
            )
            .send()
            .await
            .map_err(|err| QueueError::DeadLetterSendFailed(err.to_string()))?;

        // Only delete from the source queue once the DLQ send above is confirmed.
        self.delete(&message.receipt_handle).await
    }
}

/// Reads the queue's configured visibility timeout, used at startup to seed
/// the worker's default if not overridden by config.
#[allow(dead_code)]
pub async fn queue_visibility_timeout(client: &Client, queue_url: &str) -> Result<u32, QueueError> {
    let attrs = client
        .get_queue_attributes()
        .queue_url(queue_url)
        .attribute_names(QueueAttributeName::VisibilityTimeout)
        .send()
        .await
        .map_err(|err| QueueError::Transport(err.to_string()))?;

    Ok(attrs
        .attributes
        .and_then(|a| a.get(&QueueAttributeName::VisibilityTimeout).cloned())
        .and_then(|v| v.parse().ok())
        .unwrap_or(30))
}
