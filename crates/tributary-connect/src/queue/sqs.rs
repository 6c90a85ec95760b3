//! Amazon SQS backend

use super::{QueueBackend, QueueMessage};
use crate::error::{ConnectorError, ConnectorResult};
use async_trait::async_trait;
use aws_config::meta::region::RegionProviderChain;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::types::MessageSystemAttributeName;
use aws_sdk_sqs::Client;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// SQS allows at most 10 messages per receive
const MAX_RECEIVE_BATCH: usize = 10;
/// SQS long polling is capped at 20 seconds
const MAX_WAIT_SECONDS: u64 = 20;

fn sqs_error<E>(operation: &str, err: E) -> ConnectorError
where
    E: std::error::Error,
{
    ConnectorError::Queue(format!("{}: {}", operation, DisplayErrorContext(err)))
}

/// SQS-backed queue. Queue names resolve to URLs once and are cached.
#[derive(Debug)]
pub struct SqsQueue {
    client: Client,
    urls: Mutex<HashMap<String, String>>,
}

impl SqsQueue {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            urls: Mutex::new(HashMap::new()),
        }
    }

    /// Client configured from the environment, with optional region and
    /// endpoint overrides (e.g. LocalStack)
    pub async fn from_env(region: Option<String>, endpoint: Option<String>) -> Self {
        let region = RegionProviderChain::first_try(region.map(Region::new)).or_default_provider();
        let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(region);
        if let Some(endpoint) = endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let config = loader.load().await;
        Self::new(Client::new(&config))
    }

    async fn queue_url(&self, queue: &str) -> ConnectorResult<String> {
        if queue.starts_with("https://") || queue.starts_with("http://") {
            return Ok(queue.to_string());
        }
        if let Some(url) = self.urls.lock().get(queue) {
            return Ok(url.clone());
        }

        let output = self
            .client
            .get_queue_url()
            .queue_name(queue)
            .send()
            .await
            .map_err(|e| sqs_error("get_queue_url", e))?;
        let url = output
            .queue_url()
            .ok_or_else(|| ConnectorError::Queue(format!("no URL for queue '{}'", queue)))?
            .to_string();

        debug!(queue, url = %url, "Resolved SQS queue URL");
        self.urls.lock().insert(queue.to_string(), url.clone());
        Ok(url)
    }
}

#[async_trait]
impl QueueBackend for SqsQueue {
    async fn receive(
        &self,
        queue: &str,
        max: usize,
        wait: Duration,
        visibility: Option<u32>,
    ) -> ConnectorResult<Vec<QueueMessage>> {
        let url = self.queue_url(queue).await?;
        let output = self
            .client
            .receive_message()
            .queue_url(url)
            .max_number_of_messages(max.clamp(1, MAX_RECEIVE_BATCH) as i32)
            .wait_time_seconds(wait.as_secs().min(MAX_WAIT_SECONDS) as i32)
            .set_visibility_timeout(visibility.map(|seconds| seconds as i32))
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .send()
            .await
            .map_err(|e| sqs_error("receive_message", e))?;

        let messages = output
            .messages()
            .iter()
            .filter_map(|message| {
                let receipt_handle = message.receipt_handle()?.to_string();
                let receive_count = message
                    .attributes()
                    .and_then(|attrs| attrs.get(&MessageSystemAttributeName::ApproximateReceiveCount))
                    .and_then(|count| count.parse().ok())
                    .unwrap_or(1);
                Some(QueueMessage {
                    id: message.message_id().unwrap_or_default().to_string(),
                    receipt_handle,
                    body: message.body().unwrap_or_default().to_string(),
                    receive_count,
                })
            })
            .collect();
        Ok(messages)
    }

    async fn delete(&self, queue: &str, receipt_handle: &str) -> ConnectorResult<()> {
        let url = self.queue_url(queue).await?;
        self.client
            .delete_message()
            .queue_url(url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| sqs_error("delete_message", e))?;
        Ok(())
    }

    async fn extend_visibility(&self, queue: &str, receipt_handle: &str, seconds: u32) -> ConnectorResult<()> {
        let url = self.queue_url(queue).await?;
        self.client
            .change_message_visibility()
            .queue_url(url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(seconds as i32)
            .send()
            .await
            .map_err(|e| sqs_error("change_message_visibility", e))?;
        Ok(())
    }
}
