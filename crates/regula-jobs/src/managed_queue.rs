//! Publisher for an external durable queue.
//!
//! When configured, embedding work is published as one message per dictionary
//! item. The external service owns retries and backoff and delivers each
//! message to `callback_url` with the 1-based attempt number in
//! [`ATTEMPT_HEADER`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

use regula_core::defaults;
use regula_core::{EmbeddingTask, Error, Result};

/// Header carrying the delivery attempt number on callbacks.
pub const ATTEMPT_HEADER: &str = "x-delivery-attempt";

/// Destination for per-item embedding tasks.
#[async_trait]
pub trait ManagedQueue: Send + Sync {
    async fn publish(&self, task: &EmbeddingTask) -> Result<()>;

    /// Deliveries the queue makes before giving up on a message.
    fn max_attempts(&self) -> u32;
}

#[derive(Debug, Clone)]
pub struct ManagedQueueConfig {
    /// Publish endpoint.
    pub url: String,
    pub token: Option<String>,
    /// Where the queue delivers messages.
    pub callback_url: String,
    pub retries: u32,
    pub backoff: Duration,
}

impl ManagedQueueConfig {
    pub fn new(url: impl Into<String>, callback_url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            callback_url: callback_url.into(),
            retries: defaults::MANAGED_QUEUE_RETRIES,
            backoff: Duration::from_secs(defaults::MANAGED_QUEUE_BACKOFF_SECS),
        }
    }

    /// Read `MANAGED_QUEUE_*` variables. URL and callback are required.
    pub fn from_env() -> Result<Self> {
        let url = std::env::var("MANAGED_QUEUE_URL")
            .map_err(|_| Error::Config("MANAGED_QUEUE_URL is not set".to_string()))?;
        let callback_url = std::env::var("MANAGED_QUEUE_CALLBACK_URL")
            .map_err(|_| Error::Config("MANAGED_QUEUE_CALLBACK_URL is not set".to_string()))?;

        let mut config = Self::new(url, callback_url);
        config.token = std::env::var("MANAGED_QUEUE_TOKEN").ok();
        if let Some(retries) = std::env::var("MANAGED_QUEUE_RETRIES")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
        {
            config.retries = retries.max(1);
        }
        if let Some(secs) = std::env::var("MANAGED_QUEUE_BACKOFF_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            config.backoff = Duration::from_secs(secs);
        }
        Ok(config)
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries.max(1);
        self
    }
}

#[derive(Serialize)]
struct PublishRequest<'a> {
    destination: &'a str,
    body: &'a EmbeddingTask,
    retries: u32,
    backoff_seconds: u64,
}

/// Managed queue reached over HTTP.
pub struct HttpManagedQueue {
    client: Client,
    config: ManagedQueueConfig,
}

impl HttpManagedQueue {
    pub fn new(config: ManagedQueueConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Job(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ManagedQueueConfig {
        &self.config
    }
}

#[async_trait]
impl ManagedQueue for HttpManagedQueue {
    async fn publish(&self, task: &EmbeddingTask) -> Result<()> {
        let body = PublishRequest {
            destination: &self.config.callback_url,
            body: task,
            retries: self.config.retries,
            backoff_seconds: self.config.backoff.as_secs(),
        };

        let mut req = self.client.post(&self.config.url).json(&body);
        if let Some(ref token) = self.config.token {
            req = req.header("Authorization", format!("Bearer {}", token));
        }

        let response = req
            .send()
            .await
            .map_err(|e| Error::Job(format!("Managed queue publish failed: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Job(format!(
                "Managed queue returned {}: {}",
                status, text
            )));
        }

        debug!(
            subsystem = "jobs",
            component = "managed_queue",
            job_id = %task.job_id,
            dictionary_id = %task.dictionary_id,
            "Published embedding task"
        );
        Ok(())
    }

    fn max_attempts(&self) -> u32 {
        self.config.retries
    }
}
