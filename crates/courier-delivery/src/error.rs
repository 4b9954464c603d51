//! Delivery failures and how the engine reacts to them.
//!
//! Covers transport failures, target responses, protection mechanisms
//! (circuit breaker and bulkhead) and failures of the queue and payload
//! adapters. Every variant knows whether the delivery it interrupted should
//! be retried.

use std::{fmt, time::Duration};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DeliveryError>;

#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Connection refused, reset or otherwise lost before a response.
    #[error("network connection failed: {message}")]
    NetworkError { message: String },

    #[error("request timeout after {timeout_seconds}s")]
    Timeout { timeout_seconds: u64 },

    /// Target answered 4xx other than 429. `body` is a truncated excerpt.
    #[error("client error: HTTP {status_code}")]
    ClientError { status_code: u16, body: String },

    /// Target answered 5xx or an unexpected status.
    #[error("server error: HTTP {status_code}")]
    ServerError { status_code: u16, body: String },

    /// Target answered 429, optionally with retry guidance.
    #[error("rate limited: HTTP 429")]
    RateLimited { retry_after_seconds: Option<u64> },

    /// The target's circuit is open; the delivery is deferred.
    #[error("circuit breaker open for target {target_id}")]
    CircuitOpen { target_id: String },

    /// The target already has the maximum number of in-flight calls.
    #[error("target {target_id} is saturated")]
    TargetSaturated { target_id: String },

    /// An offloaded payload could not be fetched.
    #[error("payload unavailable: {message}")]
    Payload { message: String },

    #[error("dispatch queue error: {message}")]
    Queue { message: String },

    /// A delivery would not fit in one queue message. Resubmitting the same
    /// event cannot succeed.
    #[error("delivery of {size} bytes exceeds the {limit} byte queue message limit")]
    MessageTooLarge { size: usize, limit: usize },

    /// Registration store or dead-letter sink failure.
    #[error("database error: {message}")]
    DatabaseError { message: String },

    /// Invalid engine configuration or target URL.
    #[error("invalid configuration: {message}")]
    ConfigurationError { message: String },

    #[error("shutdown timed out after {timeout:?}")]
    ShutdownTimeout { timeout: Duration },

    #[error("delivery worker panicked: {error}")]
    WorkerPanic { error: String },
}

impl DeliveryError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    pub fn client_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ClientError { status_code, body: body.into() }
    }

    pub fn server_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ServerError { status_code, body: body.into() }
    }

    pub fn rate_limited(retry_after_seconds: Option<u64>) -> Self {
        Self::RateLimited { retry_after_seconds }
    }

    pub fn circuit_open(target_id: impl fmt::Display) -> Self {
        Self::CircuitOpen { target_id: target_id.to_string() }
    }

    pub fn target_saturated(target_id: impl fmt::Display) -> Self {
        Self::TargetSaturated { target_id: target_id.to_string() }
    }

    pub fn payload(message: impl Into<String>) -> Self {
        Self::Payload { message: message.into() }
    }

    pub fn queue(message: impl Into<String>) -> Self {
        Self::Queue { message: message.into() }
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::DatabaseError { message: message.into() }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Whether the delivery should be attempted again.
    ///
    /// Client errors are permanent except for 408 Request Timeout. Rate
    /// limits, server errors, transport failures and adapter failures are
    /// retryable. Circuit and bulkhead rejections are deferrals, not
    /// failures, and report `false`.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ClientError { status_code, .. } => *status_code == 408,

            Self::NetworkError { .. }
            | Self::Timeout { .. }
            | Self::ServerError { .. }
            | Self::RateLimited { .. }
            | Self::Payload { .. }
            | Self::Queue { .. }
            | Self::DatabaseError { .. } => true,

            Self::CircuitOpen { .. }
            | Self::TargetSaturated { .. }
            | Self::MessageTooLarge { .. }
            | Self::ConfigurationError { .. }
            | Self::ShutdownTimeout { .. }
            | Self::WorkerPanic { .. } => false,
        }
    }

    /// Minimum delay the target asked for before the next attempt.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_seconds } => *retry_after_seconds,
            _ => None,
        }
    }

    /// HTTP status returned by the target, when it responded.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::ClientError { status_code, .. } | Self::ServerError { status_code, .. } => {
                Some(*status_code)
            },
            Self::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    /// Whether this error means the target itself misbehaved.
    ///
    /// Only these failures count towards opening the target's circuit.
    pub fn is_target_failure(&self) -> bool {
        matches!(
            self,
            Self::NetworkError { .. } | Self::Timeout { .. } | Self::ServerError { .. }
        )
    }
}

/// Coarse error grouping used as a log field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Transport failures and timeouts.
    Network,
    Client,
    Server,
    RateLimit,
    /// Circuit breaker or bulkhead.
    Protection,
    /// Queue, payload store or database adapters.
    Infrastructure,
    Configuration,
    /// Worker lifecycle.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::NetworkError { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::ClientError { .. } => Self::Client,
            DeliveryError::ServerError { .. } => Self::Server,
            DeliveryError::RateLimited { .. } => Self::RateLimit,
            DeliveryError::CircuitOpen { .. } | DeliveryError::TargetSaturated { .. } => {
                Self::Protection
            },
            DeliveryError::Payload { .. }
            | DeliveryError::Queue { .. }
            | DeliveryError::DatabaseError { .. } => Self::Infrastructure,
            DeliveryError::ConfigurationError { .. } | DeliveryError::MessageTooLarge { .. } => {
                Self::Configuration
            },
            DeliveryError::ShutdownTimeout { .. } | DeliveryError::WorkerPanic { .. } => {
                Self::Internal
            },
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Network => "network",
            Self::Client => "client",
            Self::Server => "server",
            Self::RateLimit => "rate_limit",
            Self::Protection => "protection",
            Self::Infrastructure => "infrastructure",
            Self::Configuration => "configuration",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}
