use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

use crate::server::ServerError;

/// Structured error type for all HTTP handlers.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message. Implements [`IntoResponse`] so handlers can
/// return `Result<T, ApiError>` directly.
#[derive(Debug)]
pub enum ApiError {
    /// 401 - Basic credentials required; carries the realm for the challenge.
    AuthRequired { realm: String },
    /// 401 - Basic credentials provided but rejected.
    AuthInvalid { realm: String },
    /// 401 - Page requires a logged-in session.
    LoginRequired,
    /// 404 - No page registered for the path.
    NotFound,
    /// 400 - Malformed or invalid request.
    InvalidRequest(String),
    /// 503 - WebSocket client limit reached.
    TooManyClients,
    /// 500 - Command could not be run.
    CommandFailed(String),
    /// 500 - Catch-all internal error.
    InternalError(String),
}

impl ApiError {
    /// Returns the HTTP status code for this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::AuthRequired { .. } => StatusCode::UNAUTHORIZED,
            ApiError::AuthInvalid { .. } => StatusCode::UNAUTHORIZED,
            ApiError::LoginRequired => StatusCode::UNAUTHORIZED,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::TooManyClients => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::CommandFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a machine-readable error code string.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::AuthRequired { .. } => "auth_required",
            ApiError::AuthInvalid { .. } => "auth_invalid",
            ApiError::LoginRequired => "login_required",
            ApiError::NotFound => "not_found",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::TooManyClients => "too_many_clients",
            ApiError::CommandFailed(_) => "command_failed",
            ApiError::InternalError(_) => "internal_error",
        }
    }

    /// Returns a human-readable error message.
    pub fn message(&self) -> String {
        match self {
            ApiError::AuthRequired { .. } => "Authentication required.".to_string(),
            ApiError::AuthInvalid { .. } => "Invalid username or password.".to_string(),
            ApiError::LoginRequired => "Login required. Sign in at /login.".to_string(),
            ApiError::NotFound => "Not found.".to_string(),
            ApiError::InvalidRequest(detail) => format!("Invalid request: {}.", detail),
            ApiError::TooManyClients => {
                "Too many live clients. Try again shortly.".to_string()
            }
            ApiError::CommandFailed(detail) => format!("Command failed: {}.", detail),
            ApiError::InternalError(detail) => format!("Internal error: {}.", detail),
        }
    }
}

impl From<ServerError> for ApiError {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::TooManyClients(_) | ServerError::Metrics(_) => ApiError::TooManyClients,
            other => ApiError::InternalError(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        let mut response = (self.status_code(), Json(body)).into_response();
        if let ApiError::AuthRequired { realm } | ApiError::AuthInvalid { realm } = &self {
            let challenge = format!("Basic realm=\"{}\"", realm.replace('"', ""));
            if let Ok(value) = HeaderValue::from_str(&challenge) {
                response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
            }
        }
        response
    }
}
