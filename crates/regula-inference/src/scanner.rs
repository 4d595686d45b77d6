//! HTTP client for the remote compliance scanner.
//!
//! The scanner performs OCR and regulatory analysis for one check per call:
//! `POST {base_url}/scan` with a [`ScanRequest`] body, answered by a
//! [`ScanOutcome`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info};

use regula_core::{Error, Result, ScanBackend, ScanOutcome, ScanRequest};

/// Default request timeout in seconds. Kept below the queue's per-attempt
/// timeout so the scanner's own error surfaces first.
pub const DEFAULT_SCANNER_TIMEOUT_SECS: u64 = 240;

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_seconds: u64,
}

impl ScannerConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            timeout_seconds: DEFAULT_SCANNER_TIMEOUT_SECS,
        }
    }

    /// Read `SCANNER_URL` (required), `SCANNER_API_KEY` and
    /// `SCANNER_TIMEOUT_SECS`.
    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var("SCANNER_URL")
            .map_err(|_| Error::Config("SCANNER_URL is not set".to_string()))?;
        Ok(Self {
            base_url,
            api_key: std::env::var("SCANNER_API_KEY").ok(),
            timeout_seconds: std::env::var("SCANNER_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_SCANNER_TIMEOUT_SECS),
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

/// Remote compliance scanner reached over HTTP.
pub struct HttpScanBackend {
    client: Client,
    config: ScannerConfig,
}

impl HttpScanBackend {
    pub fn new(config: ScannerConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| Error::Scan(format!("Failed to create HTTP client: {}", e)))?;

        info!(
            subsystem = "inference",
            component = "scanner",
            url = %config.base_url,
            "Initializing compliance scanner backend"
        );

        Ok(Self { client, config })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(ScannerConfig::from_env()?)
    }
}

#[async_trait]
impl ScanBackend for HttpScanBackend {
    async fn scan(&self, request: &ScanRequest) -> Result<ScanOutcome> {
        let url = format!("{}/scan", self.config.base_url.trim_end_matches('/'));
        let mut req = self.client.post(&url).json(request);
        if let Some(ref api_key) = self.config.api_key {
            req = req.header("Authorization", format!("Bearer {}", api_key));
        }

        debug!(
            subsystem = "inference",
            component = "scanner",
            check_id = %request.check_id,
            input_type = %request.input_type,
            "Submitting scan"
        );

        let response = req
            .send()
            .await
            .map_err(|e| Error::Scan(format!("Request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Scan(format!("Scanner returned {}: {}", status, body)));
        }

        response
            .json::<ScanOutcome>()
            .await
            .map_err(|e| Error::Scan(format!("Failed to parse response: {}", e)))
    }
}
