use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, info};

use super::error::AccrualError;

/// Accrual service view of one order.
///
/// `status` is kept as the raw label; unknown labels are handled by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AccrualOrder {
    pub order: String,
    pub status: String,
    #[serde(default)]
    pub accrual: Option<Decimal>,
}

/// Accrual service boundary
#[async_trait]
pub trait AccrualClient: Send + Sync {
    /// Fetch the accrual state of `order_id`.
    ///
    /// `Ok(None)` means the accrual service does not know the order yet.
    async fn get_order_info(&self, order_id: &str) -> Result<Option<AccrualOrder>, AccrualError>;
}

/// reqwest-backed [`AccrualClient`]
pub struct HttpAccrualClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAccrualClient {
    /// Create a client for the accrual service at `base_url`.
    ///
    /// Every request is bounded by `request_timeout`.
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, AccrualError> {
        info!(
            base_url,
            timeout_ms = request_timeout.as_millis() as u64,
            "Initializing accrual client"
        );

        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| AccrualError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn order_url(&self, order_id: &str) -> String {
        format!("{}/api/orders/{}", self.base_url, order_id)
    }
}

#[async_trait]
impl AccrualClient for HttpAccrualClient {
    async fn get_order_info(&self, order_id: &str) -> Result<Option<AccrualOrder>, AccrualError> {
        let response = self.client.get(self.order_url(order_id)).send().await?;
        let status = response.status();
        debug!(order_id, status = status.as_u16(), "Accrual service replied");

        match status {
            StatusCode::OK => {
                let body = response.bytes().await?;
                serde_json::from_slice(&body)
                    .map(Some)
                    .map_err(|e| AccrualError::Decode(e.to_string()))
            }
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::TOO_MANY_REQUESTS => Err(AccrualError::RateLimited {
                retry_after: retry_after(response.headers()),
            }),
            other => Err(AccrualError::UnexpectedStatus(other.as_u16())),
        }
    }
}

/// `Retry-After` in delta-seconds form; HTTP-date values are ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?;
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}
