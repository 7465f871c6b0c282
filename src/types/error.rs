//! Error types for discovery-guard
//!
//! One crate-wide enum with `From` conversions for the collaborator errors
//! it wraps.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::provider::ProviderError;
use crate::quota::WindowKind;
use crate::store::StoreError;

/// Coarse error classes used by fallback conditions and telemetry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimit,
    ProviderUnavailable,
    CircuitOpen,
    Validation,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::ProviderUnavailable => "provider_unavailable",
            Self::CircuitOpen => "circuit_open",
            Self::Validation => "validation",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

/// Main error type for discovery-guard operations
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("Rate limit exceeded on {} window, retry after {retry_after_seconds}s", window.as_str())]
    RateLimitExceeded {
        window: WindowKind,
        retry_after_seconds: u64,
    },

    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(ProviderError),

    #[error("Circuit open for {operation} until {retry_at}")]
    CircuitOpen {
        operation: String,
        retry_at: DateTime<Utc>,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("All fallback strategies failed for {operation}: {source}")]
    FallbackExhausted {
        operation: String,
        source: Box<GuardError>,
    },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Request queue full ({capacity} pending)")]
    QueueFull { capacity: usize },

    #[error("Feature '{flag}' disabled: {reason}")]
    FeatureDisabled { flag: String, reason: String },

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl GuardError {
    /// Classify the error for fallback conditions and telemetry
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RateLimitExceeded { .. } | Self::QueueFull { .. } => ErrorKind::RateLimit,
            Self::ProviderUnavailable(ProviderError::Quota { .. }) => ErrorKind::RateLimit,
            Self::ProviderUnavailable(_) => ErrorKind::ProviderUnavailable,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::Validation(_) | Self::FeatureDisabled { .. } => ErrorKind::Validation,
            Self::FallbackExhausted { source, .. } => source.kind(),
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Store(_) | Self::Config(_) => ErrorKind::Internal,
        }
    }

    /// Whether another attempt inside the resilience controller may succeed.
    ///
    /// Only provider-side transient failures qualify: timeouts, network errors,
    /// 5xx responses and explicit rate-limit signals from the provider.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ProviderUnavailable(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Whether the scheduler may re-queue the request after a backoff delay
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ProviderUnavailable(e) => e.is_transient(),
            Self::CircuitOpen { .. } => true,
            Self::FallbackExhausted { source, .. } => source.is_retryable(),
            Self::Store(_) => true,
            Self::RateLimitExceeded { .. }
            | Self::Validation(_)
            | Self::Cancelled
            | Self::QueueFull { .. }
            | Self::FeatureDisabled { .. }
            | Self::Config(_) => false,
        }
    }

    /// Seconds the caller should wait before retrying, when known
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            Self::RateLimitExceeded {
                retry_after_seconds,
                ..
            } => Some(*retry_after_seconds),
            Self::ProviderUnavailable(ProviderError::Quota {
                retry_after_seconds,
            }) => *retry_after_seconds,
            Self::FallbackExhausted { source, .. } => source.retry_after_seconds(),
            _ => None,
        }
    }
}

impl From<ProviderError> for GuardError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Validation(msg) => Self::Validation(msg),
            other => Self::ProviderUnavailable(other),
        }
    }
}

impl From<StoreError> for GuardError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl From<serde_json::Error> for GuardError {
    fn from(err: serde_json::Error) -> Self {
        Self::Store(StoreError::Serialization(err.to_string()))
    }
}

/// Result type alias for discovery-guard operations
pub type Result<T> = std::result::Result<T, GuardError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_provider_validation_maps_to_validation() {
        let err: GuardError = ProviderError::Validation("empty query".into()).into();
        assert!(matches!(err, GuardError::Validation(_)));
        assert!(!err.is_transient());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_transient_classes() {
        let timeout: GuardError = ProviderError::Timeout(Duration::from_secs(10)).into();
        let server: GuardError = ProviderError::Server {
            status: 503,
            message: "unavailable".into(),
        }
        .into();
        let quota: GuardError = ProviderError::Quota {
            retry_after_seconds: Some(30),
        }
        .into();

        assert!(timeout.is_transient());
        assert!(server.is_transient());
        assert!(quota.is_transient());
        assert_eq!(quota.kind(), ErrorKind::RateLimit);
        assert_eq!(quota.retry_after_seconds(), Some(30));
    }

    #[test]
    fn test_local_rate_limit_is_not_retried() {
        let err = GuardError::RateLimitExceeded {
            window: WindowKind::Minute,
            retry_after_seconds: 12,
        };
        assert!(!err.is_transient());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("minute"));
    }

    #[test]
    fn test_fallback_exhausted_surfaces_original() {
        let err = GuardError::FallbackExhausted {
            operation: "company-search".into(),
            source: Box::new(ProviderError::Network("connection reset".into()).into()),
        };
        assert_eq!(err.kind(), ErrorKind::ProviderUnavailable);
        assert!(err.is_retryable());
        assert!(err.to_string().contains("connection reset"));
    }
}
