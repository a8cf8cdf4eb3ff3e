//! Model endpoint error types with retry classification.
//!
//! Transient faults (rate limits, 5xx, network) are retried with backoff;
//! permanent faults (4xx, parse failures) are surfaced immediately.

use std::time::Duration;

/// Error from model endpoint calls.
#[derive(Debug)]
pub struct LlmError {
    pub kind: LlmErrorKind,
    /// HTTP status code, if applicable.
    pub status_code: Option<u16>,
    pub message: String,
    /// Suggested retry delay (from a Retry-After header when present).
    pub retry_after: Option<Duration>,
}

impl LlmError {
    pub fn rate_limited(message: String, retry_after: Option<Duration>) -> Self {
        Self {
            kind: LlmErrorKind::RateLimited,
            status_code: Some(429),
            message,
            retry_after,
        }
    }

    pub fn server_error(status_code: u16, message: String) -> Self {
        Self {
            kind: LlmErrorKind::ServerError,
            status_code: Some(status_code),
            message,
            retry_after: None,
        }
    }

    pub fn client_error(status_code: u16, message: String) -> Self {
        Self {
            kind: LlmErrorKind::ClientError,
            status_code: Some(status_code),
            message,
            retry_after: None,
        }
    }

    pub fn network_error(message: String) -> Self {
        Self {
            kind: LlmErrorKind::NetworkError,
            status_code: None,
            message,
            retry_after: None,
        }
    }

    pub fn parse_error(message: String) -> Self {
        Self {
            kind: LlmErrorKind::ParseError,
            status_code: None,
            message,
            retry_after: None,
        }
    }

    /// Whether this error is worth retrying with the same model.
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }

    /// Delay before the next attempt: Retry-After when the server sent one,
    /// otherwise exponential backoff capped at 60 seconds.
    pub fn suggested_delay(&self, attempt: u32) -> Duration {
        if let Some(retry_after) = self.retry_after {
            return retry_after;
        }

        let base_secs = match self.kind {
            LlmErrorKind::RateLimited => 5,
            LlmErrorKind::ServerError => 2,
            _ => 1,
        };
        let delay = base_secs * 2u64.saturating_pow(attempt);
        Duration::from_secs(delay.min(60))
    }
}

impl std::fmt::Display for LlmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{} (HTTP {}): {}", self.kind, code, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for LlmError {}

/// Classification of model endpoint errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    /// 429 - transient, retry with backoff.
    RateLimited,
    /// 5xx - transient, retry.
    ServerError,
    /// 4xx (bad request, auth) - permanent, do not retry.
    ClientError,
    /// Connection failed or timed out - transient, retry.
    NetworkError,
    /// Response body did not parse - permanent.
    ParseError,
}

impl LlmErrorKind {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmErrorKind::RateLimited | LlmErrorKind::ServerError | LlmErrorKind::NetworkError
        )
    }
}

impl std::fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmErrorKind::RateLimited => write!(f, "Rate limited"),
            LlmErrorKind::ServerError => write!(f, "Server error"),
            LlmErrorKind::ClientError => write!(f, "Client error"),
            LlmErrorKind::NetworkError => write!(f, "Network error"),
            LlmErrorKind::ParseError => write!(f, "Parse error"),
        }
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts.
    pub max_retries: u32,
    /// Maximum total time to spend retrying.
    pub max_retry_duration: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_retry_duration: Duration::from_secs(120),
        }
    }
}

impl RetryConfig {
    /// Whether the given error should be retried under this config.
    pub fn should_retry(&self, error: &LlmError) -> bool {
        error.is_transient()
    }
}

/// Map an HTTP status code onto an error kind.
pub fn classify_http_status(status: u16) -> LlmErrorKind {
    match status {
        429 => LlmErrorKind::RateLimited,
        500 | 502 | 503 | 504 => LlmErrorKind::ServerError,
        400..=499 => LlmErrorKind::ClientError,
        _ => LlmErrorKind::ServerError,
    }
}
