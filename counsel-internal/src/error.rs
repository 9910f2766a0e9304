use std::fmt::{Debug, Display};
use std::time::Duration;

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::OnceCell;

/// Controls whether to include raw upstream details in error output
///
/// When true:
/// - Upstream error bodies are included in the `details` field of error responses
/// - Internal error messages are included in the `details` field of error responses
///
/// WARNING: Setting this to true will expose potentially sensitive upstream data
/// in error responses. Use with caution.
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

/// Chooses between a `Debug` or `Display` representation based on the gateway-level `DEBUG` flag.
pub struct DisplayOrDebugGateway<T: Debug + Display> {
    val: T,
}

impl<T: Debug + Display> DisplayOrDebugGateway<T> {
    pub fn new(val: T) -> Self {
        Self { val }
    }
}

impl<T: Debug + Display> Display for DisplayOrDebugGateway<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if debug_enabled() {
            write!(f, "{:?}", self.val)
        } else {
            write!(f, "{}", self.val)
        }
    }
}

/// Stable machine-readable error codes. Client UIs branch on these alone.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::AsRefStr,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unauthorized,
    QuotaExceeded,
    RateLimited,
    InvalidInput,
    ContentBlocked,
    MissingApiKey,
    ApiError,
    InternalError,
    NotFound,
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

    pub fn code(&self) -> ErrorCode {
        self.0.code()
    }

    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }

    pub fn log(&self) {
        self.0.log();
    }

    /// Whether the upstream call that produced this error is worth repeating.
    pub fn is_retryable(&self) -> bool {
        self.0.is_retryable()
    }

    pub fn public_message(&self) -> String {
        self.0.public_message()
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
    Unauthorized,
    QuotaExceeded {
        used: u32,
        limit: u32,
    },
    RateLimited {
        retry_after: Duration,
        limit: u32,
    },
    InvalidInput {
        reason: String,
    },
    JsonRequest {
        message: String,
    },
    RouteNotFound {
        path: String,
        method: String,
    },
    ContentBlocked {
        reason: String,
    },
    MissingApiKey {
        provider_name: String,
    },
    InferenceClient {
        message: String,
        status_code: Option<StatusCode>,
        provider_type: String,
        raw_response: Option<String>,
    },
    InferenceServer {
        message: String,
        status_code: Option<StatusCode>,
        provider_type: String,
        raw_response: Option<String>,
    },
    InferenceTimeout {
        provider_type: String,
    },
    EmptyResponse {
        provider_type: String,
    },
    /// A successful upstream reply that could not be parsed
    InvalidProviderResponse {
        message: String,
        provider_type: String,
        raw_response: Option<String>,
    },
    Cache {
        message: String,
    },
    CounterStore {
        message: String,
    },
    Config {
        message: String,
    },
    Serialization {
        message: String,
    },
    InternalError {
        message: String,
    },
}

impl ErrorDetails {
    /// Defines the error level for logging this error
    fn level(&self) -> tracing::Level {
        match self {
            ErrorDetails::Unauthorized => tracing::Level::INFO,
            ErrorDetails::QuotaExceeded { .. } => tracing::Level::INFO,
            ErrorDetails::RateLimited { .. } => tracing::Level::INFO,
            ErrorDetails::InvalidInput { .. } => tracing::Level::INFO,
            ErrorDetails::JsonRequest { .. } => tracing::Level::INFO,
            ErrorDetails::RouteNotFound { .. } => tracing::Level::WARN,
            ErrorDetails::ContentBlocked { .. } => tracing::Level::WARN,
            ErrorDetails::MissingApiKey { .. } => tracing::Level::ERROR,
            ErrorDetails::InferenceClient { .. } => tracing::Level::WARN,
            ErrorDetails::InferenceServer { .. } => tracing::Level::ERROR,
            ErrorDetails::InferenceTimeout { .. } => tracing::Level::WARN,
            ErrorDetails::EmptyResponse { .. } => tracing::Level::WARN,
            ErrorDetails::InvalidProviderResponse { .. } => tracing::Level::ERROR,
            ErrorDetails::Cache { .. } => tracing::Level::ERROR,
            ErrorDetails::CounterStore { .. } => tracing::Level::ERROR,
            ErrorDetails::Config { .. } => tracing::Level::ERROR,
            ErrorDetails::Serialization { .. } => tracing::Level::ERROR,
            ErrorDetails::InternalError { .. } => tracing::Level::ERROR,
        }
    }

    /// Defines the HTTP status code for responses involving this error
    fn status_code(&self) -> StatusCode {
        match self {
            ErrorDetails::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorDetails::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            ErrorDetails::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ErrorDetails::InvalidInput { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::JsonRequest { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            ErrorDetails::ContentBlocked { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::MissingApiKey { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InferenceClient { status_code, .. } => {
                status_code.unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ErrorDetails::InferenceServer { status_code, .. } => {
                status_code.unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ErrorDetails::InferenceTimeout { .. } => StatusCode::BAD_GATEWAY,
            ErrorDetails::EmptyResponse { .. } => StatusCode::BAD_GATEWAY,
            ErrorDetails::InvalidProviderResponse { .. } => StatusCode::BAD_GATEWAY,
            ErrorDetails::Cache { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::CounterStore { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::Serialization { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> ErrorCode {
        match self {
            ErrorDetails::Unauthorized => ErrorCode::Unauthorized,
            ErrorDetails::QuotaExceeded { .. } => ErrorCode::QuotaExceeded,
            ErrorDetails::RateLimited { .. } => ErrorCode::RateLimited,
            ErrorDetails::InvalidInput { .. } | ErrorDetails::JsonRequest { .. } => {
                ErrorCode::InvalidInput
            }
            ErrorDetails::ContentBlocked { .. } => ErrorCode::ContentBlocked,
            ErrorDetails::RouteNotFound { .. } => ErrorCode::NotFound,
            ErrorDetails::MissingApiKey { .. } => ErrorCode::MissingApiKey,
            ErrorDetails::InferenceClient { .. }
            | ErrorDetails::InferenceServer { .. }
            | ErrorDetails::InferenceTimeout { .. }
            | ErrorDetails::EmptyResponse { .. }
            | ErrorDetails::InvalidProviderResponse { .. } => ErrorCode::ApiError,
            ErrorDetails::Cache { .. }
            | ErrorDetails::CounterStore { .. }
            | ErrorDetails::Config { .. }
            | ErrorDetails::Serialization { .. }
            | ErrorDetails::InternalError { .. } => ErrorCode::InternalError,
        }
    }

    fn is_retryable(&self) -> bool {
        match self {
            ErrorDetails::InferenceServer { .. } | ErrorDetails::InferenceTimeout { .. } => true,
            // Upstream rate limiting is transient; every other 4xx is definitive
            ErrorDetails::InferenceClient { status_code, .. } => {
                *status_code == Some(StatusCode::TOO_MANY_REQUESTS)
            }
            _ => false,
        }
    }

    /// Message that is safe to show to the end user.
    fn public_message(&self) -> String {
        match self {
            ErrorDetails::Unauthorized => "Authentication required".to_string(),
            ErrorDetails::QuotaExceeded { .. } => {
                "Daily question limit reached for your plan".to_string()
            }
            ErrorDetails::RateLimited { .. } => {
                "Too many requests, please slow down".to_string()
            }
            ErrorDetails::InvalidInput { reason } => reason.clone(),
            ErrorDetails::JsonRequest { .. } => "Invalid request body".to_string(),
            ErrorDetails::RouteNotFound { .. } => "Route not found".to_string(),
            ErrorDetails::ContentBlocked { reason } => reason.clone(),
            ErrorDetails::MissingApiKey { .. } => "AI service is not configured".to_string(),
            ErrorDetails::InferenceClient { .. }
            | ErrorDetails::InferenceServer { .. }
            | ErrorDetails::InferenceTimeout { .. }
            | ErrorDetails::EmptyResponse { .. }
            | ErrorDetails::InvalidProviderResponse { .. } => {
                "The AI service could not answer this question right now".to_string()
            }
            _ => "An internal error occurred".to_string(),
        }
    }

    /// Optional extra context for the response body.
    fn public_details(&self) -> Option<String> {
        match self {
            ErrorDetails::QuotaExceeded { limit, .. } => Some(format!(
                "Your plan allows {limit} questions per day"
            )),
            ErrorDetails::RateLimited { retry_after, .. } => Some(format!(
                "Retry after {} seconds",
                retry_after_seconds(*retry_after)
            )),
            ErrorDetails::JsonRequest { message } => Some(message.clone()),
            ErrorDetails::InferenceClient { .. }
            | ErrorDetails::InferenceServer { .. }
            | ErrorDetails::InferenceTimeout { .. }
            | ErrorDetails::EmptyResponse { .. }
            | ErrorDetails::InvalidProviderResponse { .. }
            | ErrorDetails::Cache { .. }
            | ErrorDetails::CounterStore { .. }
            | ErrorDetails::Config { .. }
            | ErrorDetails::Serialization { .. }
            | ErrorDetails::InternalError { .. }
                if debug_enabled() =>
            {
                Some(self.to_string())
            }
            _ => None,
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
            ErrorDetails::Unauthorized => write!(f, "Request is not authenticated"),
            ErrorDetails::QuotaExceeded { used, limit } => {
                write!(f, "Daily quota exceeded ({used}/{limit})")
            }
            ErrorDetails::RateLimited { retry_after, limit } => write!(
                f,
                "Rate limit of {limit} requests exceeded, retry after {}ms",
                retry_after.as_millis()
            ),
            ErrorDetails::InvalidInput { reason } => write!(f, "Invalid input: {reason}"),
            ErrorDetails::JsonRequest { message } => write!(f, "{message}"),
            ErrorDetails::RouteNotFound { path, method } => {
                write!(f, "Route not found: {method} {path}")
            }
            ErrorDetails::ContentBlocked { reason } => write!(f, "Content blocked: {reason}"),
            ErrorDetails::MissingApiKey { provider_name } => {
                write!(f, "API key missing for provider: {provider_name}")
            }
            ErrorDetails::InferenceClient {
                message,
                status_code,
                provider_type,
                raw_response,
            } => {
                write!(
                    f,
                    "Error from {provider_type} client ({}): {message}",
                    status_code.map_or_else(|| "no status".to_string(), |s| s.to_string())
                )?;
                if let Some(raw_response) = raw_response {
                    write!(f, "\nRaw response: {raw_response}")?;
                }
                Ok(())
            }
            ErrorDetails::InferenceServer {
                message,
                status_code,
                provider_type,
                raw_response,
            } => {
                write!(
                    f,
                    "Error from {provider_type} server ({}): {message}",
                    status_code.map_or_else(|| "no status".to_string(), |s| s.to_string())
                )?;
                if let Some(raw_response) = raw_response {
                    write!(f, "\nRaw response: {raw_response}")?;
                }
                Ok(())
            }
            ErrorDetails::InferenceTimeout { provider_type } => {
                write!(f, "Request to {provider_type} timed out")
            }
            ErrorDetails::EmptyResponse { provider_type } => {
                write!(f, "{provider_type} returned an empty response")
            }
            ErrorDetails::InvalidProviderResponse {
                message,
                provider_type,
                raw_response,
            } => {
                write!(f, "Unreadable response from {provider_type}: {message}")?;
                if let Some(raw_response) = raw_response {
                    write!(f, "\nRaw response: {raw_response}")?;
                }
                Ok(())
            }
            ErrorDetails::Cache { message } => write!(f, "Response cache error: {message}"),
            ErrorDetails::CounterStore { message } => write!(f, "Counter store error: {message}"),
            ErrorDetails::Config { message } => write!(f, "{message}"),
            ErrorDetails::Serialization { message } => write!(f, "{message}"),
            ErrorDetails::InternalError { message } => write!(f, "Internal error: {message}"),
        }
    }
}

/// `Retry-After` is whole seconds, rounded up, and never zero.
pub fn retry_after_seconds(retry_after: Duration) -> u64 {
    let millis = retry_after.as_millis() as u64;
    millis.div_ceil(1000).max(1)
}

impl Error {
    pub fn to_response_json(&self) -> (StatusCode, Value) {
        let mut body = json!({
            "error": self.0.public_message(),
            "code": self.code(),
        });
        if let Some(details) = self.0.public_details() {
            body["details"] = Value::String(details);
        }
        (self.status_code(), body)
    }
}

impl IntoResponse for Error {
    /// Convert the error into an Axum response
    fn into_response(self) -> Response {
        let (status_code, body) = self.to_response_json();
        let mut response = (status_code, Json(body)).into_response();
        if let ErrorDetails::RateLimited { retry_after, .. } = self.get_details() {
            if let Ok(value) = HeaderValue::from_str(&retry_after_seconds(*retry_after).to_string())
            {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}
