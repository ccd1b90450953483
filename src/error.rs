//! Error types for the persistence layer, the auth domain and the HTTP boundary.
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use tracing::error;

/// Failures raised by the stores and the persistence gateway.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error("unique constraint violated: {constraint}")]
    ConstraintViolation { constraint: String },

    #[error("record not found")]
    NotFound,

    #[error("password hashing failed: {0}")]
    PasswordHash(String),

    #[error("blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("timestamp arithmetic overflowed: {0}")]
    TimeOverflow(&'static str),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return StoreError::ConstraintViolation {
                    constraint: db_err.constraint().unwrap_or("unique").to_string(),
                };
            }
        }
        StoreError::Database(err)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Domain errors produced by the auth service.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("invalid username or password")]
    InvalidCredentials,

    #[error("account is locked due to too many failed login attempts")]
    UserLocked,

    #[error("email already exists")]
    EmailAlreadyExists,

    #[error("username already exists")]
    UsernameAlreadyExists,

    #[error("user not found")]
    UserNotFound,

    #[error("invalid or expired token")]
    InvalidToken,

    #[error("{operation} failed: {source}")]
    Infrastructure {
        operation: &'static str,
        #[source]
        source: StoreError,
    },
}

impl AuthError {
    /// Wraps a store failure with the name of the operation that hit it.
    pub fn infrastructure(operation: &'static str) -> impl FnOnce(StoreError) -> AuthError {
        move |source| AuthError::Infrastructure { operation, source }
    }
}

pub type AuthResult<T> = Result<T, AuthError>;

/// Error returned by HTTP handlers.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Auth(err) => match err {
                AuthError::InvalidCredentials | AuthError::InvalidToken | AuthError::UserNotFound => {
                    StatusCode::UNAUTHORIZED
                }
                AuthError::UserLocked => StatusCode::LOCKED,
                AuthError::EmailAlreadyExists | AuthError::UsernameAlreadyExists => {
                    StatusCode::CONFLICT
                }
                AuthError::Infrastructure { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Auth(err) => match err {
                AuthError::InvalidCredentials => "invalid_credentials",
                AuthError::UserLocked => "user_locked",
                AuthError::EmailAlreadyExists => "email_exists",
                AuthError::UsernameAlreadyExists => "username_exists",
                AuthError::UserNotFound => "user_not_found",
                AuthError::InvalidToken => "invalid_token",
                AuthError::Infrastructure { .. } => "internal",
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            ApiError::Auth(AuthError::Infrastructure { .. }) => {
                error!(error = %self, "request failed");
                "An internal server error occurred".to_string()
            }
            other => other.to_string(),
        };
        let body = serde_json::json!({
            "error": {
                "code": self.error_code(),
                "message": message,
            }
        });
        (status, Json(body)).into_response()
    }
}
