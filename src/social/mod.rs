pub mod composer;
pub mod context;
pub mod feed;
pub mod handlers;
pub mod lifecycle;
pub mod models;
pub mod notifier;
pub mod predicate;
pub mod ranking;
pub mod store;
pub mod views;
pub mod visibility;

use axum::response::IntoResponse;
use axum::Json;

pub use handlers::configure_social_routes;

use self::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum SocialError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for SocialError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;
        let (status, message) = match &self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            Self::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            Self::Database(msg) | Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<StoreError> for SocialError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(msg) => SocialError::NotFound(msg),
            StoreError::Conflict(msg) => SocialError::Conflict(msg),
            StoreError::Backend(msg) => SocialError::Database(msg),
        }
    }
}
