use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

pub const UNSUPPORTED_PLATFORM_MESSAGE: &str =
    "Unsupported platform. Please use YouTube Shorts or Instagram Reels URLs.";

/// Failures produced while resolving, selecting or relaying a video.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),
    #[error("video unavailable: {0}")]
    VideoUnavailable(String),
    #[error("no playable format with both audio and video")]
    NoPlayableFormat,
    #[error("relay failure: {0}")]
    RelayFailure(String),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) | Self::UnsupportedPlatform(_) => StatusCode::BAD_REQUEST,
            Self::VideoUnavailable(_) | Self::NoPlayableFormat => StatusCode::NOT_FOUND,
            Self::RelayFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::UnsupportedPlatform(_) => "UNSUPPORTED_PLATFORM",
            Self::VideoUnavailable(_) => "VIDEO_UNAVAILABLE",
            Self::NoPlayableFormat => "NO_PLAYABLE_FORMAT",
            Self::RelayFailure(_) => "RELAY_FAILURE",
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
    #[serde(rename = "retryAfter", skip_serializing_if = "Option::is_none")]
    retry_after: Option<String>,
}

/// Error returned to HTTP callers as `{"error": ...}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub code: Option<&'static str>,
    pub retry_after: Option<(u64, String)>,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            code: Some("INVALID_INPUT"),
            retry_after: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
            code: None,
            retry_after: None,
        }
    }

    pub fn too_many_requests(retry_after_seconds: u64, window_label: String) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            message: "Too many download requests. Please try again later.".to_string(),
            code: Some("RATE_LIMITED"),
            retry_after: Some((retry_after_seconds, window_label)),
        }
    }

    /// Maps a relay failure onto the public message for its status class.
    /// `failure_message` is used for the generic 500 case so the caller
    /// decides how an unexpected failure is worded for its endpoint.
    pub fn from_relay(error: RelayError, failure_message: &str) -> Self {
        let message = match &error {
            RelayError::InvalidInput(message) => message.clone(),
            RelayError::UnsupportedPlatform(message) => message.clone(),
            RelayError::VideoUnavailable(_) => "Video not found or is private".to_string(),
            RelayError::NoPlayableFormat => "No downloadable video found".to_string(),
            RelayError::RelayFailure(_) => failure_message.to_string(),
        };

        Self {
            status: error.status(),
            message,
            code: Some(error.code()),
            retry_after: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (retry_after_seconds, retry_after_label) = match self.retry_after {
            Some((seconds, label)) => (Some(seconds), Some(label)),
            None => (None, None),
        };

        let body = Json(ErrorBody {
            error: self.message,
            code: self.code,
            retry_after: retry_after_label,
        });

        let mut response = (self.status, body).into_response();
        if let Some(seconds) = retry_after_seconds
            && let Ok(value) = HeaderValue::from_str(&seconds.to_string())
        {
            response.headers_mut().insert(RETRY_AFTER, value);
        }

        response
    }
}
