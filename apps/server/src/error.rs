use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::models::ErrorBody;

/// Errors surfaced by the HTTP API.
///
/// Each variant maps to a stable machine-readable code (`error`) and an HTTP
/// status; the display string is the human-readable `message`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("This time slot is no longer available")]
    SlotNotAvailable,
    #[error("Reservation not found. Check the reservation number and email address.")]
    ReservationNotFound,
    #[error("{0}")]
    NotFound(String),
    #[error("This reservation has already been cancelled")]
    AlreadyCancelled,
    #[error("Past reservations cannot be cancelled")]
    PastReservation,
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("Session token has expired")]
    TokenExpired,
    #[error("{0}")]
    Server(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::SlotNotAvailable => "SLOT_NOT_AVAILABLE",
            Self::ReservationNotFound => "RESERVATION_NOT_FOUND",
            Self::NotFound(_) => "NOT_FOUND",
            Self::AlreadyCancelled => "ALREADY_CANCELLED",
            Self::PastReservation => "PAST_RESERVATION",
            Self::Conflict(_) => "CONFLICT",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::Server(_) => "SERVER_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::AlreadyCancelled | Self::PastReservation => {
                StatusCode::BAD_REQUEST
            }
            Self::SlotNotAvailable | Self::Conflict(_) => StatusCode::CONFLICT,
            Self::ReservationNotFound | Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized(_) | Self::TokenExpired => StatusCode::UNAUTHORIZED,
            Self::Server(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        tracing::error!("database error: {}", e);
        Self::Server("A server error occurred".into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            success: false,
            error: self.code(),
            message: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

/// True when a sqlx error is a UNIQUE/PRIMARY KEY constraint violation.
pub fn is_unique_violation(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}
