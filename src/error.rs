use axum::http::StatusCode;
use axum::Json;

use crate::embed::ProviderError;

#[derive(Debug, thiserror::Error)]
pub enum MnemoError {
    #[error("query must not be empty")]
    EmptyQuery,

    #[error("content must not be empty")]
    EmptyContent,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found")]
    NotFound,

    #[error("unauthorized")]
    Unauthorized,

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("all embedding providers exhausted")]
    AllProvidersExhausted,

    #[error("input too large to embed ({chars} chars, limit {max})")]
    OversizedInput { chars: usize, max: usize },

    #[error("dimension mismatch for model {model}: expected {expected}, got {got}")]
    DimensionMismatch {
        model: String,
        expected: usize,
        got: usize,
    },

    #[error("malformed source record: {0}")]
    MalformedSource(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MnemoError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Database(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Provider(_) | Self::AllProvidersExhausted => StatusCode::BAD_GATEWAY,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl axum::response::IntoResponse for MnemoError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
