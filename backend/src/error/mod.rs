use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::Value;
use utoipa::ToSchema;

use crate::utils::jwt::TokenError;

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub details: Option<Value>,
}

/// Failures of token verification, refresh rotation and login.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Token is malformed")]
    Malformed,
    #[error("Token has expired")]
    Expired,
    #[error("Token is invalid")]
    Invalid,
    #[error("Wrong token type")]
    InvalidTokenType,
    #[error("Refresh token lacks session linkage")]
    InvalidRefreshClaims,
    #[error("Access and refresh tokens belong to different subjects")]
    RefreshBindingMismatch,
    #[error("Session has ended")]
    UnknownRefresh,
    #[error("Session has ended")]
    RefreshReplayDetected,
    #[error("Session has ended")]
    RefreshTampered,
    #[error("Refresh token presented from an unrecognised device")]
    RefreshDeviceMismatch,
    #[error("Refresh token presented from an unrecognised network address")]
    RefreshIpMismatch,
    #[error("Refresh token is required")]
    MissingRefreshToken,
    #[error("Invalid email or password")]
    InvalidCredentials,
    #[error("Session store unavailable: {0}")]
    Store(anyhow::Error),
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::Malformed => "MALFORMED",
            AuthError::Expired => "EXPIRED",
            AuthError::Invalid => "INVALID",
            AuthError::InvalidTokenType => "INVALID_TOKEN_TYPE",
            AuthError::InvalidRefreshClaims => "INVALID_REFRESH_CLAIMS",
            AuthError::RefreshBindingMismatch => "REFRESH_BINDING_MISMATCH",
            AuthError::UnknownRefresh => "UNKNOWN_REFRESH",
            AuthError::RefreshReplayDetected => "REFRESH_REPLAY_DETECTED",
            AuthError::RefreshTampered => "REFRESH_TAMPERED",
            AuthError::RefreshDeviceMismatch => "REFRESH_DEVICE_MISMATCH",
            AuthError::RefreshIpMismatch => "REFRESH_IP_MISMATCH",
            AuthError::MissingRefreshToken => "MISSING_REFRESH_TOKEN",
            AuthError::InvalidCredentials => "INVALID_CREDENTIALS",
            AuthError::Store(_) => "INTERNAL_SERVER_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::InvalidTokenType | AuthError::RefreshBindingMismatch => {
                StatusCode::BAD_REQUEST
            }
            AuthError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::UNAUTHORIZED,
        }
    }

    /// The presented refresh credential can never succeed again; the client should drop it.
    pub fn ends_session(&self) -> bool {
        matches!(
            self,
            AuthError::Malformed
                | AuthError::Expired
                | AuthError::Invalid
                | AuthError::InvalidRefreshClaims
                | AuthError::UnknownRefresh
                | AuthError::RefreshReplayDetected
                | AuthError::RefreshTampered
        )
    }
}

impl From<TokenError> for AuthError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Malformed => AuthError::Malformed,
            TokenError::Expired => AuthError::Expired,
            TokenError::Invalid => AuthError::Invalid,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        AppError::Auth(self).into_response()
    }
}

#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    Unauthorized(String),
    Forbidden(String),
    BadRequest(String),
    InternalServerError(anyhow::Error),
    Validation(Vec<String>),
    Auth(AuthError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message, code, details) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, "NOT_FOUND".to_string(), None),
            AppError::Unauthorized(msg) => (
                StatusCode::UNAUTHORIZED,
                msg,
                "UNAUTHORIZED".to_string(),
                None,
            ),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg, "FORBIDDEN".to_string(), None),
            AppError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                msg,
                "BAD_REQUEST".to_string(),
                None,
            ),
            AppError::InternalServerError(err) | AppError::Auth(AuthError::Store(err)) => {
                tracing::error!("Internal server error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    "INTERNAL_SERVER_ERROR".to_string(),
                    None,
                )
            }
            AppError::Validation(errors) => (
                StatusCode::BAD_REQUEST,
                "Validation failed".to_string(),
                "VALIDATION_ERROR".to_string(),
                Some(serde_json::json!({ "errors": errors })),
            ),
            AppError::Auth(err) => (err.status(), err.to_string(), err.code().to_string(), None),
        };

        let body = Json(ErrorResponse {
            error: error_message,
            code,
            details,
        });

        (status, body).into_response()
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        AppError::Auth(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::InternalServerError(err)
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => AppError::NotFound("Resource not found".to_string()),
            _ => AppError::InternalServerError(err.into()),
        }
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let messages: Vec<String> = errors
            .field_errors()
            .into_iter()
            .flat_map(|(field, errs)| {
                errs.iter().map(move |e| {
                    let code = e.code.as_ref();
                    format!("{}: {}", field, code)
                })
            })
            .collect();
        AppError::Validation(messages)
    }
}
