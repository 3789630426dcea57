use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Value};
use tokio::sync::OnceCell;

/// Controls whether internal error details are included in HTTP error bodies.
///
/// When false, infrastructural errors are reported to clients with a generic message;
/// the full message is still logged.
static DEBUG: OnceCell<bool> = OnceCell::const_new();

pub fn set_debug(debug: bool) -> Result<(), Error> {
    DEBUG.set(debug).map_err(|_| {
        Error::new(ErrorDetails::Config {
            message: "Failed to set debug mode".to_string(),
        })
    })
}

fn debug_enabled() -> bool {
    *DEBUG.get().unwrap_or(&false)
}

#[derive(Debug, PartialEq)]
// As long as the struct member is private, we force people to use the `new` method and log the error.
// We box `ErrorDetails` per the `clippy::result_large_err` lint
pub struct Error(Box<ErrorDetails>);

impl Error {
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Box::new(details))
    }

    pub fn new_without_logging(details: ErrorDetails) -> Self {
        Error(Box::new(details))
    }

    pub fn status_code(&self) -> StatusCode {
        self.0.status_code()
    }

    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }

    pub fn log(&self) {
        self.0.log();
    }

    /// Whether this error came from a store being unreachable, slow or misbehaving,
    /// as opposed to a problem with the request itself.
    pub fn is_backend_failure(&self) -> bool {
        self.0.is_backend_failure()
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

#[derive(Debug, PartialEq)]
pub enum ErrorDetails {
    AppState {
        message: String,
    },
    BackendTimeout {
        backend: String,
        timeout_ms: u64,
    },
    BackendUnavailable {
        backend: String,
        message: String,
    },
    Config {
        message: String,
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
    PostgresConnection {
        message: String,
    },
    PostgresMigration {
        id: String,
        message: String,
    },
    PostgresQuery {
        message: String,
    },
    RedisConnection {
        message: String,
    },
    RedisQuery {
        message: String,
    },
    Serialization {
        message: String,
    },
    UnknownFeature {
        name: String,
    },
    UnknownTier {
        name: String,
    },
}

impl ErrorDetails {
    /// Defines the error level for logging this error
    fn level(&self) -> tracing::Level {
        match self {
            ErrorDetails::AppState { .. } => tracing::Level::ERROR,
            ErrorDetails::BackendTimeout { .. } => tracing::Level::WARN,
            ErrorDetails::BackendUnavailable { .. } => tracing::Level::WARN,
            ErrorDetails::Config { .. } => tracing::Level::ERROR,
            ErrorDetails::InternalError { .. } => tracing::Level::ERROR,
            ErrorDetails::InvalidRequest { .. } => tracing::Level::WARN,
            ErrorDetails::JsonRequest { .. } => tracing::Level::WARN,
            ErrorDetails::PostgresConnection { .. } => tracing::Level::ERROR,
            ErrorDetails::PostgresMigration { .. } => tracing::Level::ERROR,
            ErrorDetails::PostgresQuery { .. } => tracing::Level::WARN,
            ErrorDetails::RedisConnection { .. } => tracing::Level::WARN,
            ErrorDetails::RedisQuery { .. } => tracing::Level::WARN,
            ErrorDetails::Serialization { .. } => tracing::Level::ERROR,
            ErrorDetails::UnknownFeature { .. } => tracing::Level::WARN,
            ErrorDetails::UnknownTier { .. } => tracing::Level::WARN,
        }
    }

    /// Defines the HTTP status code for responses involving this error
    fn status_code(&self) -> StatusCode {
        match self {
            ErrorDetails::AppState { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::BackendTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ErrorDetails::BackendUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ErrorDetails::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::JsonRequest { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::PostgresConnection { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ErrorDetails::PostgresMigration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::PostgresQuery { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::RedisConnection { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ErrorDetails::RedisQuery { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::Serialization { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::UnknownFeature { .. } => StatusCode::NOT_FOUND,
            ErrorDetails::UnknownTier { .. } => StatusCode::BAD_REQUEST,
        }
    }

    fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            ErrorDetails::BackendTimeout { .. }
                | ErrorDetails::BackendUnavailable { .. }
                | ErrorDetails::PostgresConnection { .. }
                | ErrorDetails::PostgresQuery { .. }
                | ErrorDetails::RedisConnection { .. }
                | ErrorDetails::RedisQuery { .. }
        )
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
            ErrorDetails::AppState { message } => {
                write!(f, "Error initializing AppState: {message}")
            }
            ErrorDetails::BackendTimeout {
                backend,
                timeout_ms,
            } => {
                write!(f, "Counter backend `{backend}` timed out after {timeout_ms}ms")
            }
            ErrorDetails::BackendUnavailable { backend, message } => {
                write!(f, "Counter backend `{backend}` is unavailable: {message}")
            }
            ErrorDetails::Config { message } => write!(f, "{message}"),
            ErrorDetails::InternalError { message } => write!(f, "{message}"),
            ErrorDetails::InvalidRequest { message } => write!(f, "{message}"),
            ErrorDetails::JsonRequest { message } => write!(f, "{message}"),
            ErrorDetails::PostgresConnection { message } => {
                write!(f, "Error connecting to Postgres: {message}")
            }
            ErrorDetails::PostgresMigration { id, message } => {
                write!(f, "Error running Postgres migration {id}: {message}")
            }
            ErrorDetails::PostgresQuery { message } => {
                write!(f, "Failed to run Postgres query: {message}")
            }
            ErrorDetails::RedisConnection { message } => {
                write!(f, "Error connecting to Redis: {message}")
            }
            ErrorDetails::RedisQuery { message } => {
                write!(f, "Failed to run Redis command: {message}")
            }
            ErrorDetails::Serialization { message } => write!(f, "{message}"),
            ErrorDetails::UnknownFeature { name } => write!(f, "Unknown feature: {name}"),
            ErrorDetails::UnknownTier { name } => {
                write!(f, "Unknown subscription tier: {name}")
            }
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Get the JSON response body that would be sent to clients
    pub fn to_response_json(&self) -> (StatusCode, Value) {
        let status = self.status_code();
        let message = if status.is_server_error() && !debug_enabled() {
            match self.get_details() {
                ErrorDetails::BackendTimeout { .. } | ErrorDetails::BackendUnavailable { .. } => {
                    "Quota backend is temporarily unavailable".to_string()
                }
                _ => "Internal server error".to_string(),
            }
        } else {
            self.to_string()
        };
        (status, json!({ "error": message }))
    }
}

impl IntoResponse for Error {
    /// Convert the error into an Axum response (it was already logged on construction)
    fn into_response(self) -> Response {
        let (status_code, body) = self.to_response_json();
        (status_code, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_unavailable_error() {
        let error = Error::new(ErrorDetails::BackendUnavailable {
            backend: "redis".to_string(),
            message: "connection refused".to_string(),
        });

        assert_eq!(
            error.to_string(),
            "Counter backend `redis` is unavailable: connection refused"
        );
        assert_eq!(error.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error.get_details().level(), tracing::Level::WARN);
        assert!(error.is_backend_failure());
    }

    #[test]
    fn test_request_errors_are_not_backend_failures() {
        let error = Error::new_without_logging(ErrorDetails::UnknownFeature {
            name: "poetry".to_string(),
        });
        assert!(!error.is_backend_failure());
        assert_eq!(error.status_code(), StatusCode::NOT_FOUND);

        let error = Error::new_without_logging(ErrorDetails::InvalidRequest {
            message: "user_id must not be empty".to_string(),
        });
        assert!(!error.is_backend_failure());
    }

    #[test]
    fn test_server_errors_hide_details_in_response() {
        let error = Error::new_without_logging(ErrorDetails::PostgresQuery {
            message: "relation \"ai_usage_tracking\" does not exist".to_string(),
        });
        let (status, body) = error.to_response_json();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Internal server error");
    }

    #[test]
    fn test_error_into_response() {
        let error = Error::new(ErrorDetails::UnknownTier {
            name: "platinum".to_string(),
        });

        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
