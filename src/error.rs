//! Error taxonomy for exchange and persistence failures
//!
//! Exchange errors are classified at the response boundary so retry policy
//! can be decided by kind rather than by string matching at call sites.

use thiserror::Error;

/// Classified exchange API failure.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    /// Timeouts, 5xx, connection resets. Retried with backoff and jitter.
    #[error("transient exchange error: {0}")]
    Transient(String),

    /// Exchange asked us to slow down. Retried with backoff.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The order (or position) no longer exists on the exchange. Success for
    /// cancels, needs-replace for amends; never escalated.
    #[error("order already gone: {0}")]
    AlreadyGone(String),

    /// The client order link ID collided. Regenerate and retry once.
    #[error("duplicate order link id: {0}")]
    DuplicateLinkId(String),

    /// Malformed request. Not retried; surfaced to the caller.
    #[error("fatal request error (retCode {code}): {message}")]
    Fatal { code: i64, message: String },
}

impl ExchangeError {
    /// Whether the retry loop should attempt this call again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::Transient(_) | ExchangeError::RateLimited(_)
        )
    }

    /// Classify a Bybit v5 `retCode` into an error kind.
    ///
    /// Codes observed in production:
    /// - `10006`, `10018` - request rate limits
    /// - `10016` - internal server error
    /// - `110001` - order does not exist or is already finished
    /// - `110072` - orderLinkId duplicated
    pub fn from_ret_code(code: i64, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            10006 | 10018 => ExchangeError::RateLimited(message),
            10016 => ExchangeError::Transient(message),
            110001 | 110004 => ExchangeError::AlreadyGone(message),
            110072 => ExchangeError::DuplicateLinkId(message),
            _ => ExchangeError::Fatal { code, message },
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            return ExchangeError::Transient(err.to_string());
        }
        if let Some(status) = err.status() {
            if status.as_u16() == 429 {
                return ExchangeError::RateLimited(err.to_string());
            }
            if status.is_server_error() {
                return ExchangeError::Transient(err.to_string());
            }
        }
        ExchangeError::Transient(err.to_string())
    }
}

/// Snapshot store failure. One retry, then the engine continues in-memory
/// with a degraded flag raised.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("snapshot schema version {found} is newer than supported {supported}")]
    SchemaTooNew { found: u32, supported: u32 },
}
