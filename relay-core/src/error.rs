use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use indexmap::IndexMap;
use serde::{Serialize, Serializer};
use serde_json::json;
use thiserror::Error;

#[derive(Clone, Debug, Error, Serialize)]
#[cfg_attr(test, derive(PartialEq))]
#[error(transparent)]
// The struct member is private so that everyone goes through `new`, which logs
// the error at construction time.
pub struct Error(Arc<ErrorDetails>);

impl Error {
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Arc::new(details))
    }

    pub fn status_code(&self) -> StatusCode {
        self.0.status_code()
    }

    /// Returns the most recent 'underlying' status code for this error.
    /// For an exhausted failover loop this is the status code of the last
    /// candidate that failed.
    pub fn underlying_status_code(&self) -> Option<StatusCode> {
        self.0.underlying_status_code()
    }

    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }

    pub fn log(&self) {
        self.0.log();
    }

    pub fn is_retryable(&self) -> bool {
        self.0.is_retryable()
    }

    /// True iff this error is the orchestrator-internal "candidate is over
    /// its concurrency ceiling" signal. Never surfaced to clients.
    pub fn is_admission_denied(&self) -> bool {
        matches!(*self.0, ErrorDetails::AdmissionDenied { .. })
    }
}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

// Expect for derive Serialize
#[expect(clippy::trivially_copy_pass_by_ref)]
fn serialize_status<S>(code: &Option<StatusCode>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match code {
        Some(c) => serializer.serialize_u16(c.as_u16()),
        None => serializer.serialize_none(),
    }
}

/// Which entity's concurrency ceiling rejected an admission attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SaturatedEntity {
    Endpoint,
    Key,
}

impl std::fmt::Display for SaturatedEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SaturatedEntity::Endpoint => write!(f, "endpoint"),
            SaturatedEntity::Key => write!(f, "key"),
        }
    }
}

#[derive(Debug, Error, Serialize)]
#[cfg_attr(test, derive(PartialEq))]
pub enum ErrorDetails {
    AdmissionDenied {
        entity: SaturatedEntity,
        id: String,
        current: u64,
        limit: u64,
    },
    AppState {
        message: String,
    },
    Config {
        message: String,
    },
    EndpointNotFound {
        endpoint_id: String,
    },
    InferenceClient {
        #[serde(serialize_with = "serialize_status")]
        status_code: Option<StatusCode>,
        message: String,
        provider_name: String,
        raw_response: Option<String>,
    },
    InferenceTimeout {
        provider_name: String,
        #[serde(skip)]
        timeout: Duration,
        streaming: bool,
    },
    InternalError {
        message: String,
    },
    InvalidRequest {
        message: String,
    },
    JsonRequest {
        message: String,
    },
    KeyNotFound {
        key_id: String,
    },
    NoEligibleProvider {
        model: String,
    },
    ProvidersExhausted {
        // `IndexMap` preserves candidate order for `underlying_status_code`
        provider_errors: IndexMap<String, Error>,
    },
    RateLimitExceeded {
        action: String,
        retry_after_seconds: u64,
    },
    Serialization {
        message: String,
    },
    StreamError {
        provider_name: String,
        message: String,
    },
    UnknownRateLimitAction {
        action: String,
    },
    UsageSink {
        message: String,
    },
}

impl ErrorDetails {
    /// Defines the log level for this error variant
    fn level(&self) -> tracing::Level {
        match self {
            ErrorDetails::AdmissionDenied { .. } => tracing::Level::DEBUG,
            ErrorDetails::AppState { .. } => tracing::Level::ERROR,
            ErrorDetails::Config { .. } => tracing::Level::ERROR,
            ErrorDetails::EndpointNotFound { .. } => tracing::Level::WARN,
            ErrorDetails::InferenceClient { .. } => tracing::Level::ERROR,
            ErrorDetails::InferenceTimeout { .. } => tracing::Level::WARN,
            ErrorDetails::InternalError { .. } => tracing::Level::ERROR,
            ErrorDetails::InvalidRequest { .. } => tracing::Level::WARN,
            ErrorDetails::JsonRequest { .. } => tracing::Level::WARN,
            ErrorDetails::KeyNotFound { .. } => tracing::Level::WARN,
            ErrorDetails::NoEligibleProvider { .. } => tracing::Level::WARN,
            ErrorDetails::ProvidersExhausted { .. } => tracing::Level::ERROR,
            ErrorDetails::RateLimitExceeded { .. } => tracing::Level::WARN,
            ErrorDetails::Serialization { .. } => tracing::Level::ERROR,
            ErrorDetails::StreamError { .. } => tracing::Level::ERROR,
            ErrorDetails::UnknownRateLimitAction { .. } => tracing::Level::WARN,
            ErrorDetails::UsageSink { .. } => tracing::Level::WARN,
        }
    }

    /// Defines the HTTP status code for responses involving this error
    fn status_code(&self) -> StatusCode {
        match self {
            ErrorDetails::AdmissionDenied { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ErrorDetails::AppState { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::EndpointNotFound { .. } => StatusCode::NOT_FOUND,
            ErrorDetails::InferenceClient { status_code, .. } => {
                status_code.unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ErrorDetails::InferenceTimeout { .. } => StatusCode::REQUEST_TIMEOUT,
            ErrorDetails::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::JsonRequest { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::KeyNotFound { .. } => StatusCode::NOT_FOUND,
            ErrorDetails::NoEligibleProvider { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ErrorDetails::ProvidersExhausted { .. } => StatusCode::BAD_GATEWAY,
            ErrorDetails::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            ErrorDetails::Serialization { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::StreamError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::UnknownRateLimitAction { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::UsageSink { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn underlying_status_code(&self) -> Option<StatusCode> {
        match self {
            ErrorDetails::InferenceClient { status_code, .. } => *status_code,
            ErrorDetails::ProvidersExhausted { provider_errors } => provider_errors
                .values()
                .last()
                .and_then(Error::underlying_status_code),
            _ => None,
        }
    }

    /// Whether the failover loop may advance to the next candidate after
    /// this error. Transport failures (no status code), timeouts, stream
    /// faults, 408/429, and 5xx are retryable; everything else is terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            ErrorDetails::InferenceClient { status_code, .. } => match status_code {
                Some(code) => {
                    code.is_server_error()
                        || *code == StatusCode::REQUEST_TIMEOUT
                        || *code == StatusCode::TOO_MANY_REQUESTS
                }
                // No status code means we never got a response: connect
                // failure, reset, or malformed transport-level reply.
                None => true,
            },
            ErrorDetails::InferenceTimeout { .. } => true,
            ErrorDetails::StreamError { .. } => true,
            ErrorDetails::ProvidersExhausted { provider_errors } => provider_errors
                .values()
                .any(|error| error.is_retryable()),
            _ => false,
        }
    }

    /// Log the error using the `tracing` library
    pub fn log(&self) {
        match self.level() {
            tracing::Level::ERROR => tracing::error!("{self}"),
            tracing::Level::WARN => tracing::warn!("{self}"),
            tracing::Level::INFO => tracing::info!("{self}"),
            tracing::Level::DEBUG => tracing::debug!("{self}"),
            tracing::Level::TRACE => tracing::trace!("{self}"),
        }
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorDetails::AdmissionDenied {
                entity,
                id,
                current,
                limit,
            } => {
                write!(
                    f,
                    "Concurrency ceiling reached for {entity} `{id}`: {current}/{limit} in flight"
                )
            }
            ErrorDetails::AppState { message } => {
                write!(f, "Error initializing application state: {message}")
            }
            ErrorDetails::Config { message } => write!(f, "Configuration error: {message}"),
            ErrorDetails::EndpointNotFound { endpoint_id } => {
                write!(f, "Endpoint not found: {endpoint_id}")
            }
            ErrorDetails::InferenceClient {
                message,
                status_code,
                provider_name,
                raw_response,
            } => {
                write!(
                    f,
                    "Error from provider `{provider_name}`{}: {message}{}",
                    status_code
                        .map(|s| format!(" ({s})"))
                        .unwrap_or_default(),
                    raw_response
                        .as_ref()
                        .map(|r| format!("\nRaw response: {r}"))
                        .unwrap_or_default(),
                )
            }
            ErrorDetails::InferenceTimeout {
                provider_name,
                timeout,
                streaming,
            } => {
                if *streaming {
                    write!(
                        f,
                        "Provider `{provider_name}` timed out before the first stream event ({timeout:?})"
                    )
                } else {
                    write!(f, "Provider `{provider_name}` timed out ({timeout:?})")
                }
            }
            ErrorDetails::InternalError { message } => write!(f, "Internal error: {message}"),
            ErrorDetails::InvalidRequest { message } => write!(f, "Invalid request: {message}"),
            ErrorDetails::JsonRequest { message } => {
                write!(f, "Error parsing request body as JSON: {message}")
            }
            ErrorDetails::KeyNotFound { key_id } => write!(f, "Key not found: {key_id}"),
            ErrorDetails::NoEligibleProvider { model } => {
                write!(f, "No eligible provider for model `{model}`")
            }
            ErrorDetails::ProvidersExhausted { provider_errors } => {
                write!(
                    f,
                    "All candidate providers failed:\n{}",
                    provider_errors
                        .iter()
                        .map(|(name, error)| format!("{name}: {error}"))
                        .collect::<Vec<_>>()
                        .join("\n")
                )
            }
            ErrorDetails::RateLimitExceeded {
                action,
                retry_after_seconds,
            } => {
                write!(
                    f,
                    "Rate limit exceeded for action `{action}`; retry after {retry_after_seconds}s"
                )
            }
            ErrorDetails::Serialization { message } => write!(f, "{message}"),
            ErrorDetails::StreamError {
                provider_name,
                message,
            } => {
                write!(
                    f,
                    "Error in streaming response from `{provider_name}`: {message}"
                )
            }
            ErrorDetails::UnknownRateLimitAction { action } => {
                write!(f, "Unknown rate limit action: {action}")
            }
            ErrorDetails::UsageSink { message } => {
                write!(f, "Failed to persist usage record: {message}")
            }
        }
    }
}

impl IntoResponse for Error {
    /// Convert the error into an Axum response. Retry-after information for
    /// rate-limited clients rides in the body.
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": self.to_string(),
        });
        if let ErrorDetails::RateLimitExceeded {
            retry_after_seconds,
            ..
        } = self.get_details()
        {
            body["retry_after_seconds"] = json!(retry_after_seconds);
        }
        (self.status_code(), Json(body)).into_response()
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorDetails::Serialization {
            message: err.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_are_retryable() {
        let err = ErrorDetails::InferenceClient {
            status_code: None,
            message: "connection reset".to_string(),
            provider_name: "acme".to_string(),
            raw_response: None,
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_server_errors_are_retryable_client_errors_are_not() {
        let make = |code: StatusCode| ErrorDetails::InferenceClient {
            status_code: Some(code),
            message: "boom".to_string(),
            provider_name: "acme".to_string(),
            raw_response: None,
        };
        assert!(make(StatusCode::INTERNAL_SERVER_ERROR).is_retryable());
        assert!(make(StatusCode::BAD_GATEWAY).is_retryable());
        assert!(make(StatusCode::TOO_MANY_REQUESTS).is_retryable());
        assert!(make(StatusCode::REQUEST_TIMEOUT).is_retryable());
        assert!(!make(StatusCode::BAD_REQUEST).is_retryable());
        assert!(!make(StatusCode::UNAUTHORIZED).is_retryable());
        assert!(!make(StatusCode::NOT_FOUND).is_retryable());
    }

    #[test]
    fn test_exhausted_status_code_tracks_last_candidate() {
        let first = Error::new(ErrorDetails::InferenceClient {
            status_code: Some(StatusCode::INTERNAL_SERVER_ERROR),
            message: "first".to_string(),
            provider_name: "a".to_string(),
            raw_response: None,
        });
        let last = Error::new(ErrorDetails::InferenceClient {
            status_code: Some(StatusCode::SERVICE_UNAVAILABLE),
            message: "last".to_string(),
            provider_name: "b".to_string(),
            raw_response: None,
        });
        let exhausted = Error::new(ErrorDetails::ProvidersExhausted {
            provider_errors: IndexMap::from([("a".to_string(), first), ("b".to_string(), last)]),
        });
        assert_eq!(
            exhausted.underlying_status_code(),
            Some(StatusCode::SERVICE_UNAVAILABLE)
        );
        assert_eq!(exhausted.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_admission_denied_is_not_retryable_and_not_client_visible() {
        let err = Error::new(ErrorDetails::AdmissionDenied {
            entity: SaturatedEntity::Key,
            id: "key-1".to_string(),
            current: 4,
            limit: 4,
        });
        assert!(err.is_admission_denied());
        assert!(!err.is_retryable());
    }
}
