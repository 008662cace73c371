//! SQS client wrapper for the analysis job queue

use aws_sdk_sqs::Client;
use serde::Deserialize;
use tracing::debug;

use analysis_pipeline::{PipelineError, WorkerConfig};

/// A message received from SQS
#[derive(Debug, Clone)]
pub struct SqsMessage {
    /// Message body (bare game ID or a JSON job)
    pub body: String,
    /// Receipt handle for deletion/visibility extension
    pub receipt_handle: String,
}

/// One analysis request from the queue
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AnalysisJob {
    pub game_id: i64,
    #[serde(default = "default_deep")]
    pub deep: bool,
    #[serde(default)]
    pub reanalyse: bool,
    #[serde(default)]
    pub clear_tasks: bool,
}

fn default_deep() -> bool {
    true
}

impl AnalysisJob {
    /// A bare game ID means a full analysis with the deep pass.
    pub fn parse(body: &str) -> Result<Self, PipelineError> {
        let body = body.trim();
        if let Ok(game_id) = body.parse::<i64>() {
            return Ok(Self {
                game_id,
                deep: true,
                reanalyse: false,
                clear_tasks: false,
            });
        }
        Ok(serde_json::from_str(body)?)
    }
}

/// SQS client for receiving and managing analysis jobs
#[derive(Clone)]
pub struct SqsClient {
    client: Client,
    queue_url: String,
    visibility_timeout: i32,
}

impl SqsClient {
    /// Create a new SQS client
    pub async fn new(config: &WorkerConfig) -> Result<Self, PipelineError> {
        let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;

        // For LocalStack/local dev, use custom endpoint
        let client = if let Some(endpoint) = &config.sqs_endpoint_url {
            let sqs_config = aws_sdk_sqs::config::Builder::from(&aws_config)
                .endpoint_url(endpoint)
                .build();
            Client::from_conf(sqs_config)
        } else {
            Client::new(&aws_config)
        };

        Ok(Self {
            client,
            queue_url: config.sqs_queue_url.clone(),
            visibility_timeout: config.visibility_timeout_secs as i32,
        })
    }

    /// Receive messages from the queue with long polling
    pub async fn receive_messages(&self) -> Result<Vec<SqsMessage>, PipelineError> {
        self.receive(20).await
    }

    /// Receive whatever is immediately available
    pub async fn receive_messages_nowait(&self) -> Result<Vec<SqsMessage>, PipelineError> {
        self.receive(0).await
    }

    async fn receive(&self, wait_time_seconds: i32) -> Result<Vec<SqsMessage>, PipelineError> {
        let response = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(10)
            .wait_time_seconds(wait_time_seconds)
            .visibility_timeout(self.visibility_timeout)
            .send()
            .await
            .map_err(|e| PipelineError::Sqs(format!("Failed to receive messages: {e}")))?;

        let messages = response
            .messages()
            .iter()
            .filter_map(|msg| {
                let body = msg.body()?;
                let receipt = msg.receipt_handle()?;
                Some(SqsMessage {
                    body: body.to_string(),
                    receipt_handle: receipt.to_string(),
                })
            })
            .collect();

        debug!(count = response.messages().len(), "Received messages");
        Ok(messages)
    }

    /// Delete a message from the queue (after successful processing)
    pub async fn delete_message(&self, receipt_handle: &str) -> Result<(), PipelineError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| PipelineError::Sqs(format!("Failed to delete message: {e}")))?;

        debug!("Deleted message");
        Ok(())
    }
}
