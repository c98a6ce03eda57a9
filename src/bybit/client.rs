//! Live Bybit v5 API client
//!
//! Production HTTP client with:
//! - HMAC-SHA256 request signing
//! - Automatic retry with exponential backoff and jitter for transient and
//!   rate-limit failures
//! - Per-account token-bucket request limiting
//!
//! `AlreadyGone`, `DuplicateLinkId`, and `Fatal` results are never retried
//! here; the rebalancer and phase engine own those responses.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::Client;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::auth::{Credentials, HEADER_API_KEY, HEADER_RECV_WINDOW, HEADER_SIGN, HEADER_TIMESTAMP};
use super::types::*;
use super::ExchangeApi;
use crate::common::RequestLimiter;
use crate::error::ExchangeError;
use crate::types::{Account, InstrumentInfo, Symbol};

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Total attempts for retryable failures
    pub max_attempts: u32,
    /// Hard per-request timeout
    pub timeout: Duration,
    /// Request permits per second for this account
    pub requests_per_second: usize,
    /// Signature validity window sent with every request
    pub recv_window_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            timeout: Duration::from_secs(60),
            requests_per_second: 20,
            recv_window_ms: 5000,
        }
    }
}

/// Bybit exchange API client bound to one account's credentials.
#[derive(Clone)]
pub struct BybitClient {
    account: Account,
    credentials: Credentials,
    base_url: String,
    http_client: Client,
    limiter: Arc<RequestLimiter>,
    max_attempts: u32,
    recv_window_ms: u64,
}

impl BybitClient {
    pub fn new(
        account: Account,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
        base_url: impl Into<String>,
        config: ClientConfig,
    ) -> Self {
        let http_client = Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            account,
            credentials: Credentials::new(api_key, api_secret),
            base_url: base_url.into(),
            http_client,
            limiter: Arc::new(RequestLimiter::new(config.requests_per_second)),
            max_attempts: config.max_attempts.max(1),
            recv_window_ms: config.recv_window_ms,
        }
    }

    /// The request limiter, shared so execution mode can raise its rate.
    pub fn limiter(&self) -> Arc<RequestLimiter> {
        Arc::clone(&self.limiter)
    }

    /// Execute a request with rate limiting and retry on retryable kinds.
    async fn execute_with_retry<F, Fut, T>(&self, operation: F) -> Result<T, ExchangeError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        let mut last_error = None;

        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                let backoff = backoff_with_jitter(attempt - 1);
                debug!(account = %self.account, attempt, "retrying after {}ms", backoff.as_millis());
                sleep(backoff).await;
            }

            self.limiter.acquire().await;

            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() => {
                    warn!(
                        account = %self.account,
                        "request failed (attempt {}/{}): {}",
                        attempt,
                        self.max_attempts,
                        e
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error
            .unwrap_or_else(|| ExchangeError::Transient("request failed after retries".into())))
    }

    /// Signed GET; the signature covers the raw query string.
    async fn signed_get<T>(&self, path: &str, query: &str) -> Result<T, ExchangeError>
    where
        T: serde::de::DeserializeOwned,
    {
        let url = format!("{}{}?{}", self.base_url, path, query);
        let timestamp = Utc::now().timestamp_millis();
        let signature = self.credentials.sign(timestamp, self.recv_window_ms, query);

        let response = self
            .http_client
            .get(&url)
            .header(HEADER_API_KEY, self.credentials.api_key())
            .header(HEADER_TIMESTAMP, timestamp)
            .header(HEADER_SIGN, signature)
            .header(HEADER_RECV_WINDOW, self.recv_window_ms)
            .send()
            .await?;

        decode_envelope(response).await
    }

    /// Signed POST; the signature covers the JSON body.
    async fn signed_post<B, T>(&self, path: &str, body: &B) -> Result<T, ExchangeError>
    where
        B: serde::Serialize,
        T: serde::de::DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let json_body = serde_json::to_string(body)
            .map_err(|e| ExchangeError::Fatal {
                code: 0,
                message: format!("request serialization failed: {}", e),
            })?;
        let timestamp = Utc::now().timestamp_millis();
        let signature = self
            .credentials
            .sign(timestamp, self.recv_window_ms, &json_body);

        let response = self
            .http_client
            .post(&url)
            .header("Content-Type", "application/json")
            .header(HEADER_API_KEY, self.credentials.api_key())
            .header(HEADER_TIMESTAMP, timestamp)
            .header(HEADER_SIGN, signature)
            .header(HEADER_RECV_WINDOW, self.recv_window_ms)
            .body(json_body)
            .send()
            .await?;

        decode_envelope(response).await
    }
}

async fn decode_envelope<T>(response: reqwest::Response) -> Result<T, ExchangeError>
where
    T: serde::de::DeserializeOwned,
{
    let status = response.status();
    let text = response.text().await?;

    if status.as_u16() == 429 {
        return Err(ExchangeError::RateLimited(format!("http 429: {}", text)));
    }
    if status.is_server_error() {
        return Err(ExchangeError::Transient(format!("http {}: {}", status, text)));
    }
    if !status.is_success() {
        return Err(ExchangeError::Fatal {
            code: status.as_u16() as i64,
            message: text,
        });
    }

    let envelope: ApiEnvelope<T> = serde_json::from_str(&text)
        .map_err(|e| ExchangeError::Transient(format!("unparseable response: {}", e)))?;
    envelope.into_result()
}

/// Exponential backoff starting at 500ms with up to 250ms of jitter.
fn backoff_with_jitter(retry: u32) -> Duration {
    let base = 500u64.saturating_mul(2u64.saturating_pow(retry.saturating_sub(1)));
    let jitter = rand::thread_rng().gen_range(0..250);
    Duration::from_millis(base + jitter)
}

#[async_trait]
impl ExchangeApi for BybitClient {
    fn account(&self) -> Account {
        self.account
    }

    async fn get_all_positions(&self) -> Result<Vec<Position>, ExchangeError> {
        let raw: ListResult<WirePosition> = self
            .execute_with_retry(|| {
                let query = format!(
                    "category={}&settleCoin={}",
                    CATEGORY_LINEAR, SETTLE_COIN
                );
                async move { self.signed_get("/v5/position/list", &query).await }
            })
            .await?;

        let mut positions = Vec::with_capacity(raw.list.len());
        for wire in raw.list {
            if let Some(position) = wire.into_position()? {
                positions.push(position);
            }
        }
        Ok(positions)
    }

    async fn get_all_open_orders(&self) -> Result<Vec<Order>, ExchangeError> {
        let raw: ListResult<WireOrder> = self
            .execute_with_retry(|| {
                let query = format!(
                    "category={}&settleCoin={}",
                    CATEGORY_LINEAR, SETTLE_COIN
                );
                async move { self.signed_get("/v5/order/realtime", &query).await }
            })
            .await?;

        raw.list.into_iter().map(WireOrder::into_order).collect()
    }

    async fn get_order_history(
        &self,
        symbol: &Symbol,
        since: DateTime<Utc>,
    ) -> Result<Vec<Order>, ExchangeError> {
        let raw: ListResult<WireOrder> = self
            .execute_with_retry(|| {
                let query = format!(
                    "category={}&symbol={}&startTime={}",
                    CATEGORY_LINEAR,
                    symbol,
                    since.timestamp_millis()
                );
                async move { self.signed_get("/v5/order/history", &query).await }
            })
            .await?;

        raw.list.into_iter().map(WireOrder::into_order).collect()
    }

    async fn place_order(&self, params: &OrderParams) -> Result<PlacedOrder, ExchangeError> {
        let body = WirePlaceOrderRequest::from(params);
        self.execute_with_retry(|| {
            let body = &body;
            async move { self.signed_post("/v5/order/create", body).await }
        })
        .await
    }

    async fn amend_order(&self, params: &AmendParams) -> Result<PlacedOrder, ExchangeError> {
        let body = WireAmendOrderRequest::from(params);
        self.execute_with_retry(|| {
            let body = &body;
            async move { self.signed_post("/v5/order/amend", body).await }
        })
        .await
    }

    async fn cancel_order(
        &self,
        symbol: &Symbol,
        reference: &OrderRef,
    ) -> Result<(), ExchangeError> {
        let body = WireCancelOrderRequest::new(symbol, reference);
        let _: PlacedOrder = self
            .execute_with_retry(|| {
                let body = &body;
                async move { self.signed_post("/v5/order/cancel", body).await }
            })
            .await?;
        Ok(())
    }

    async fn get_instrument_info(
        &self,
        symbol: &Symbol,
    ) -> Result<InstrumentInfo, ExchangeError> {
        // Public endpoint; no signature required.
        let raw: ListResult<WireInstrument> = self
            .execute_with_retry(|| {
                let url = format!(
                    "{}/v5/market/instruments-info?category={}&symbol={}",
                    self.base_url, CATEGORY_LINEAR, symbol
                );
                let client = self.http_client.clone();
                async move {
                    let response = client.get(&url).send().await?;
                    decode_envelope(response).await
                }
            })
            .await?;

        raw.list
            .into_iter()
            .next()
            .ok_or_else(|| ExchangeError::Fatal {
                code: 0,
                message: format!("instrument info missing for {}", symbol),
            })?
            .into_info()
    }
}
