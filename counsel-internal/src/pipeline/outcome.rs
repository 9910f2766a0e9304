use std::time::Duration;

use axum::response::{IntoResponse, Response};

use crate::error::{Error, ErrorCode, ErrorDetails};
use crate::rate_limit::RateLimitHeaders;

/// A stage refused the request. Reasons are safe to show the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Unauthorized,
    QuotaExceeded { used: u32, limit: u32 },
    RateLimited { retry_after: Duration, limit: u32 },
    InvalidInput { reason: String },
    ContentBlocked { reason: String },
}

impl Rejection {
    pub fn code(&self) -> ErrorCode {
        match self {
            Rejection::Unauthorized => ErrorCode::Unauthorized,
            Rejection::QuotaExceeded { .. } => ErrorCode::QuotaExceeded,
            Rejection::RateLimited { .. } => ErrorCode::RateLimited,
            Rejection::InvalidInput { .. } => ErrorCode::InvalidInput,
            Rejection::ContentBlocked { .. } => ErrorCode::ContentBlocked,
        }
    }
}

impl From<Rejection> for Error {
    fn from(rejection: Rejection) -> Self {
        Error::new(match rejection {
            Rejection::Unauthorized => ErrorDetails::Unauthorized,
            Rejection::QuotaExceeded { used, limit } => ErrorDetails::QuotaExceeded { used, limit },
            Rejection::RateLimited { retry_after, limit } => {
                ErrorDetails::RateLimited { retry_after, limit }
            }
            Rejection::InvalidInput { reason } => ErrorDetails::InvalidInput { reason },
            Rejection::ContentBlocked { reason } => ErrorDetails::ContentBlocked { reason },
        })
    }
}

/// Why a stage stopped the pipeline.
#[derive(Debug)]
pub enum Halt {
    Rejected(Rejection),
    Failed(Error),
}

impl Halt {
    pub fn code(&self) -> ErrorCode {
        match self {
            Halt::Rejected(rejection) => rejection.code(),
            Halt::Failed(error) => error.code(),
        }
    }

    pub fn into_error(self) -> Error {
        match self {
            Halt::Rejected(rejection) => rejection.into(),
            Halt::Failed(error) => error,
        }
    }
}

impl From<Rejection> for Halt {
    fn from(rejection: Rejection) -> Self {
        Halt::Rejected(rejection)
    }
}

impl From<Error> for Halt {
    fn from(error: Error) -> Self {
        Halt::Failed(error)
    }
}

/// A successful pipeline result plus the rate-limit state to report.
#[derive(Debug)]
pub struct Answered<T> {
    pub body: T,
    pub rate_limit: Option<RateLimitHeaders>,
}

/// A terminal pipeline error plus the rate-limit state to report.
#[derive(Debug)]
pub struct Failure {
    pub error: Error,
    pub rate_limit: Option<RateLimitHeaders>,
}

impl Failure {
    pub fn new(error: Error, rate_limit: Option<RateLimitHeaders>) -> Self {
        Self { error, rate_limit }
    }

    pub fn code(&self) -> ErrorCode {
        self.error.code()
    }
}

impl IntoResponse for Failure {
    fn into_response(self) -> Response {
        let mut response = self.error.into_response();
        if let Some(rate_limit) = self.rate_limit {
            for (name, value) in rate_limit.to_header_map().iter() {
                response.headers_mut().insert(name.clone(), value.clone());
            }
        }
        response
    }
}
