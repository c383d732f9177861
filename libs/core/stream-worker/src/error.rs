//! Stream error types and error categorization
//!
//! The category of a processing error decides what the worker does with the
//! entry that produced it:
//! - **Transient**: redrive (re-add with an incremented receive count) after
//!   an exponential backoff from 1s, capped at 30s
//! - **RateLimited**: redrive after a longer backoff from 5s, capped at 2m
//! - **Permanent**: dead-letter immediately

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Transient,
    Permanent,
    RateLimited,
}

impl ErrorCategory {
    /// Whether an entry failing with this category may be delivered again
    pub fn should_redrive(&self) -> bool {
        !matches!(self, ErrorCategory::Permanent)
    }

    pub fn base_delay_ms(&self) -> u64 {
        match self {
            ErrorCategory::Transient => 1000,
            ErrorCategory::RateLimited => 5000,
            ErrorCategory::Permanent => 0,
        }
    }

    pub fn max_delay_ms(&self) -> u64 {
        match self {
            ErrorCategory::Transient => 30_000,
            ErrorCategory::RateLimited => 120_000,
            ErrorCategory::Permanent => 0,
        }
    }

    /// Delay before redrive number `retry_count` (0-based): `base * 2^n`, capped
    pub fn backoff_delay_ms(&self, retry_count: u32) -> u64 {
        let factor = 2u64.saturating_pow(retry_count.min(20));
        self.base_delay_ms()
            .saturating_mul(factor)
            .min(self.max_delay_ms())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::RateLimited => "rate_limited",
        }
    }
}

/// Stream processing errors
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Entry fields could not be turned into a job
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Processing error: {message}")]
    Processing {
        message: String,
        category: ErrorCategory,
    },

    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    /// Redriven like a transient failure, and the rest of the batch is left
    /// unacknowledged for redelivery.
    #[error("Fatal error: {0}")]
    Fatal(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl StreamError {
    pub fn transient(message: impl Into<String>) -> Self {
        StreamError::Processing {
            message: message.into(),
            category: ErrorCategory::Transient,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        StreamError::Processing {
            message: message.into(),
            category: ErrorCategory::Permanent,
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        StreamError::RateLimited(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        StreamError::Fatal(message.into())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            StreamError::Redis(_) => ErrorCategory::Transient,
            StreamError::Decode(_) => ErrorCategory::Permanent,
            StreamError::Serialization(_) => ErrorCategory::Permanent,
            StreamError::Processing { category, .. } => *category,
            StreamError::RateLimited(_) => ErrorCategory::RateLimited,
            StreamError::Fatal(_) => ErrorCategory::Transient,
            StreamError::Config(_) => ErrorCategory::Permanent,
        }
    }

    /// Stop processing the current batch after this error
    pub fn aborts_batch(&self) -> bool {
        matches!(self, StreamError::Fatal(_))
    }

    /// XREADGROUP/XPENDING against a group that does not exist
    pub fn is_nogroup(&self) -> bool {
        matches!(self, StreamError::Redis(e) if e.to_string().contains("NOGROUP"))
    }

    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            StreamError::Redis(e) if e.is_connection_dropped() || e.is_io_error() || e.is_timeout()
        )
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        StreamError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delays() {
        assert_eq!(ErrorCategory::Transient.backoff_delay_ms(0), 1000);
        assert_eq!(ErrorCategory::Transient.backoff_delay_ms(1), 2000);
        assert_eq!(ErrorCategory::Transient.backoff_delay_ms(10), 30_000);

        assert_eq!(ErrorCategory::RateLimited.backoff_delay_ms(0), 5000);
        assert_eq!(ErrorCategory::RateLimited.backoff_delay_ms(2), 20_000);
        assert_eq!(ErrorCategory::RateLimited.backoff_delay_ms(u32::MAX), 120_000);

        assert_eq!(ErrorCategory::Permanent.backoff_delay_ms(3), 0);
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(StreamError::transient("x").category(), ErrorCategory::Transient);
        assert_eq!(StreamError::permanent("x").category(), ErrorCategory::Permanent);
        assert_eq!(StreamError::rate_limited("x").category(), ErrorCategory::RateLimited);
        assert_eq!(StreamError::Decode("x".into()).category(), ErrorCategory::Permanent);
    }

    #[test]
    fn test_fatal_is_redriven_and_aborts() {
        let fatal = StreamError::fatal("refresh failed");
        assert!(fatal.category().should_redrive());
        assert!(fatal.aborts_batch());

        assert!(!StreamError::transient("x").aborts_batch());
        assert!(!StreamError::permanent("x").aborts_batch());
    }

    #[test]
    fn test_should_redrive() {
        assert!(ErrorCategory::Transient.should_redrive());
        assert!(ErrorCategory::RateLimited.should_redrive());
        assert!(!ErrorCategory::Permanent.should_redrive());
    }

    #[test]
    fn test_nogroup_detection() {
        let err = StreamError::Redis(redis::RedisError::from((
            redis::ErrorKind::Server(redis::ServerErrorKind::ResponseError),
            "NOGROUP",
            "No such key or consumer group".to_string(),
        )));
        assert!(err.is_nogroup());
        assert!(!StreamError::transient("NOGROUP").is_nogroup());
    }
}
