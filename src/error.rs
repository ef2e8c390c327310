use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Not found")]
    NotFound,

    /// Another responder got to the request first.
    #[error("This request has already been handled by someone else")]
    RequestUnavailable,

    #[error("Request cannot move from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Score is final; set reopen to change it")]
    ScoreLocked,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden")]
    Forbidden,

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Misconfigured: {0}")]
    Config(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] diesel::ConnectionError),

    #[error("Pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Push delivery failed: {0}")]
    Push(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::NotFound => StatusCode::NOT_FOUND,
            Error::RequestUnavailable
            | Error::InvalidTransition { .. }
            | Error::ScoreLocked => StatusCode::CONFLICT,
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::Forbidden => StatusCode::FORBIDDEN,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Database(diesel::result::Error::NotFound) => StatusCode::NOT_FOUND,
            Error::Push(_) => StatusCode::BAD_GATEWAY,
            Error::Config(_)
            | Error::Corrupt(_)
            | Error::Database(_)
            | Error::Connection(_)
            | Error::Pool(_)
            | Error::Task(_)
            | Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Alert title shown to the user. Only the claim race gets its own.
    pub fn title(&self) -> &'static str {
        match self {
            Error::RequestUnavailable => "Request Unavailable",
            _ => "Error",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        (
            status,
            Json(json!({ "error": self.title(), "message": self.to_string() })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_race_has_its_own_title() {
        assert_eq!(Error::RequestUnavailable.title(), "Request Unavailable");
        assert_eq!(Error::RequestUnavailable.status(), StatusCode::CONFLICT);
        assert_eq!(Error::Forbidden.title(), "Error");
        assert_eq!(Error::ScoreLocked.title(), "Error");
    }

    #[test]
    fn test_diesel_not_found_maps_to_404() {
        let err: Error = diesel::result::Error::NotFound.into();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            Error::Validation("x".to_string()).status(),
            StatusCode::BAD_REQUEST
        );
    }
}
