use axum::body::Bytes;
use axum::extract::rejection::{BytesRejection, JsonRejection, PathRejection, QueryRejection};
use axum::extract::{FromRequest, FromRequestParts};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("pool error: {0}")]
    Pool(#[from] deadpool_sqlite::InteractError),

    #[error("connection checkout error: {0}")]
    Checkout(#[from] deadpool_sqlite::PoolError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Machine-readable reason code sent alongside the message.
    pub fn reason(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation",
            AppError::Auth(_) => "unauthorized",
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::Database(_) | AppError::Pool(_) | AppError::Checkout(_) => "storage",
            AppError::Internal(_) => "internal",
        }
    }

    /// Storage failures are worth retrying by the client; nothing else is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::Database(_) | AppError::Pool(_) | AppError::Checkout(_)
        )
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Auth(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Conflict(msg) => {
                tracing::warn!(error = %msg, "unresolved write conflict");
                (StatusCode::CONFLICT, msg.clone())
            }
            AppError::Database(e) => {
                tracing::error!(error = %e, "database error");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "storage unavailable, retry later".to_string(),
                )
            }
            AppError::Pool(e) => {
                tracing::error!(error = %e, "pool error");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "storage unavailable, retry later".to_string(),
                )
            }
            AppError::Checkout(e) => {
                tracing::error!(error = %e, "connection checkout error");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "storage unavailable, retry later".to_string(),
                )
            }
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };

        let body = json!({
            "error": message,
            "reason": self.reason(),
            "retryable": self.is_retryable(),
        });
        (status, axum::Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// JSON extractor that logs deserialization errors before returning them as
/// validation failures. Drop-in replacement for `axum::Json<T>`.
pub struct LoggedJson<T>(pub T);

impl<S, T> FromRequest<S> for LoggedJson<T>
where
    axum::Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(
        req: axum::extract::Request,
        state: &S,
    ) -> Result<Self, Self::Rejection> {
        let path = req.uri().path().to_string();
        match axum::Json::<T>::from_request(req, state).await {
            Ok(axum::Json(value)) => Ok(LoggedJson(value)),
            Err(rejection) => {
                tracing::warn!(
                    path = %path,
                    status = 400,
                    error = %rejection,
                    "JSON parse error (client sent malformed payload)"
                );
                Err(AppError::Validation(rejection.body_text()))
            }
        }
    }
}

/// Path extractor whose rejections become validation errors with a JSON body.
pub struct LoggedPath<T>(pub T);

impl<S, T> FromRequestParts<S> for LoggedPath<T>
where
    axum::extract::Path<T>: FromRequestParts<S, Rejection = PathRejection>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match axum::extract::Path::<T>::from_request_parts(parts, state).await {
            Ok(axum::extract::Path(value)) => Ok(LoggedPath(value)),
            Err(rejection) => {
                tracing::warn!(
                    path = %parts.uri.path(),
                    status = 400,
                    error = %rejection,
                    "path parameter rejected"
                );
                Err(AppError::Validation(rejection.body_text()))
            }
        }
    }
}

/// Query-string extractor whose rejections become validation errors.
pub struct LoggedQuery<T>(pub T);

impl<S, T> FromRequestParts<S> for LoggedQuery<T>
where
    axum::extract::Query<T>: FromRequestParts<S, Rejection = QueryRejection>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match axum::extract::Query::<T>::from_request_parts(parts, state).await {
            Ok(axum::extract::Query(value)) => Ok(LoggedQuery(value)),
            Err(rejection) => {
                tracing::warn!(
                    path = %parts.uri.path(),
                    status = 400,
                    error = %rejection,
                    "query string rejected"
                );
                Err(AppError::Validation(rejection.body_text()))
            }
        }
    }
}

/// Raw body extractor; buffering failures (including the body limit) become
/// validation errors.
pub struct LoggedBytes(pub Bytes);

impl<S> FromRequest<S> for LoggedBytes
where
    Bytes: FromRequest<S, Rejection = BytesRejection>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(
        req: axum::extract::Request,
        state: &S,
    ) -> Result<Self, Self::Rejection> {
        let path = req.uri().path().to_string();
        match Bytes::from_request(req, state).await {
            Ok(bytes) => Ok(LoggedBytes(bytes)),
            Err(rejection) => {
                tracing::warn!(
                    path = %path,
                    status = 400,
                    error = %rejection,
                    "request body rejected"
                );
                Err(AppError::Validation(rejection.body_text()))
            }
        }
    }
}
