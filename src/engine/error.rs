use chrono::NaiveDate;
use thiserror::Error;
use ulid::Ulid;

use crate::model::{BookingId, BookingStatus, ProviderId, TimeWindow, WindowError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: Ulid },
    #[error("provider {provider_id} is not available on {date}")]
    Unavailable {
        provider_id: ProviderId,
        date: NaiveDate,
    },
    #[error("provider is only available during {available}; requested {requested}")]
    OutsideAvailability {
        requested: TimeWindow,
        available: TimeWindow,
    },
    #[error("time slot already booked: conflicts with booking {0}")]
    SlotTaken(BookingId),
    #[error("forbidden: {0}")]
    Forbidden(&'static str),
    #[error(
        "booking {0} is confirmed and can no longer be cancelled by the customer; \
         contact the provider"
    )]
    CannotCancelConfirmed(BookingId),
    #[error("booking {id} changed concurrently: expected {expected}, found {actual}")]
    Conflict {
        id: BookingId,
        expected: BookingStatus,
        actual: BookingStatus,
    },
    #[error("invalid time window: {0}")]
    InvalidWindow(#[from] WindowError),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    /// Stable machine-readable label, used for metrics and HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotFound { .. } => "NOT_FOUND",
            EngineError::Unavailable { .. } => "UNAVAILABLE",
            EngineError::OutsideAvailability { .. } => "OUTSIDE_AVAILABILITY",
            EngineError::SlotTaken(_) => "SLOT_TAKEN",
            EngineError::Forbidden(_) => "FORBIDDEN",
            EngineError::CannotCancelConfirmed(_) => "CANNOT_CANCEL_CONFIRMED",
            EngineError::Conflict { .. } => "CONFLICT",
            EngineError::InvalidWindow(_) => "INVALID_WINDOW",
            EngineError::LimitExceeded(_) => "LIMIT_EXCEEDED",
            EngineError::WalError(_) => "WAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    #[test]
    fn outside_availability_names_bounds() {
        let err = EngineError::OutsideAvailability {
            requested: TimeWindow::new(
                NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            )
            .unwrap(),
            available: crate::model::default_window(),
        };
        let msg = err.to_string();
        assert!(msg.contains("10:00"), "{msg}");
        assert!(msg.contains("17:00"), "{msg}");
        assert!(msg.contains("08:00-09:00"), "{msg}");
    }

    #[test]
    fn codes_distinguish_cancel_refusal_from_forbidden() {
        let id = Ulid::new();
        assert_eq!(EngineError::Forbidden("x").code(), "FORBIDDEN");
        assert_eq!(
            EngineError::CannotCancelConfirmed(id).code(),
            "CANNOT_CANCEL_CONFIRMED"
        );
    }
}
