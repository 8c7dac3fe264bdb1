use std::time::Instant;

use tracing::{debug, info};

use crate::catalog::Provider;
use crate::model::*;
use crate::observability;

use super::{Engine, EngineError};

/// Edges of the booking state machine, regardless of who asks.
pub fn is_edge(from: BookingStatus, to: BookingStatus) -> bool {
    use BookingStatus::*;
    if from.is_terminal() {
        return false;
    }
    matches!(
        (from, to),
        (Pending, Confirmed | Rejected | Cancelled) | (Confirmed, Completed | Cancelled)
    )
}

/// Targets a role may move a booking to from `from`. `Confirmed -> Cancelled`
/// is an edge but nobody is granted it.
pub fn permitted_targets(role: Role, from: BookingStatus) -> &'static [BookingStatus] {
    use BookingStatus::*;
    match (role, from) {
        (Role::Provider, Pending) => &[Confirmed, Rejected],
        (Role::Provider, Confirmed) => &[Completed],
        (Role::Customer, Pending) => &[Cancelled],
        _ => &[],
    }
}

pub(crate) fn check_transition(
    id: BookingId,
    role: Role,
    from: BookingStatus,
    to: BookingStatus,
) -> Result<(), EngineError> {
    if role == Role::Customer
        && from == BookingStatus::Confirmed
        && to == BookingStatus::Cancelled
    {
        return Err(EngineError::CannotCancelConfirmed(id));
    }
    if !is_edge(from, to) {
        return Err(EngineError::Forbidden("not a valid status change"));
    }
    if !permitted_targets(role, from).contains(&to) {
        return Err(EngineError::Forbidden("role may not make this status change"));
    }
    Ok(())
}

/// The actor must be the party the claimed role names.
pub(crate) fn check_party(
    booking: &Booking,
    provider: &Provider,
    actor: UserId,
    role: Role,
) -> Result<(), EngineError> {
    let is_party = match role {
        Role::Provider => provider.user_id == actor,
        Role::Customer => booking.customer_id == actor,
    };
    if is_party {
        Ok(())
    } else {
        Err(EngineError::Forbidden("not a party to this booking"))
    }
}

pub(crate) fn new_booking_notice(
    booking: &Booking,
    provider_user: UserId,
    service_name: &str,
) -> NotificationEvent {
    NotificationEvent {
        target_user_id: provider_user,
        kind: NotificationKind::NewBookingRequest,
        title: "New Booking Request".into(),
        message: format!(
            "You have a new booking request for {service_name} on {}.",
            booking.date.format("%Y-%m-%d")
        ),
        related_booking_id: booking.id,
    }
}

/// Provider actions go to the customer; customer actions go to the provider.
pub(crate) fn status_notice(
    booking: &Booking,
    provider: &Provider,
    acted_as: Role,
) -> NotificationEvent {
    let status = booking.status;
    let (target_user_id, title, message) = match acted_as {
        Role::Provider => (
            booking.customer_id,
            format!("Booking {status}"),
            format!(
                "Your booking for {} has been {status}.",
                booking.date.format("%Y-%m-%d")
            ),
        ),
        Role::Customer => (
            provider.user_id,
            format!("Booking {status}"),
            format!("Booking #{} has been {status} by the customer.", booking.id),
        ),
    };
    NotificationEvent {
        target_user_id,
        kind: NotificationKind::StatusChanged(status),
        title,
        message,
        related_booking_id: booking.id,
    }
}

impl Engine {
    /// Apply `target` to the booking as it currently stands.
    pub async fn transition(
        &self,
        booking_id: BookingId,
        actor: UserId,
        role: Role,
        target: BookingStatus,
    ) -> Result<Booking, EngineError> {
        let current = self
            .get_booking(booking_id)
            .await
            .ok_or(EngineError::NotFound { kind: "booking", id: booking_id })?;
        self.transition_from(booking_id, actor, role, current.status, target)
            .await
    }

    /// Apply `target` if the booking is still in `expected`; otherwise
    /// `Conflict` with what it actually is.
    pub async fn transition_from(
        &self,
        booking_id: BookingId,
        actor: UserId,
        role: Role,
        expected: BookingStatus,
        target: BookingStatus,
    ) -> Result<Booking, EngineError> {
        let started = Instant::now();
        let result = self
            .transition_inner(booking_id, actor, role, expected, target)
            .await;
        observability::record_engine_op("transition", started, &result);
        if let Err(e) = &result {
            debug!(booking = %booking_id, ?role, %target, "status change refused: {e}");
        }
        result
    }

    async fn transition_inner(
        &self,
        booking_id: BookingId,
        actor: UserId,
        role: Role,
        expected: BookingStatus,
        target: BookingStatus,
    ) -> Result<Booking, EngineError> {
        let snapshot = self
            .get_booking(booking_id)
            .await
            .ok_or(EngineError::NotFound { kind: "booking", id: booking_id })?;
        let provider = self.provider_of_booking(&snapshot).await?;
        check_party(&snapshot, &provider, actor, role)?;

        let (_gate, mut day) = self.lock_booking_day(&booking_id).await?;
        let actual = day
            .get(&booking_id)
            .map(|b| b.status)
            .ok_or(EngineError::NotFound { kind: "booking", id: booking_id })?;
        // A stale view is reported as such before the edge table is consulted.
        if actual != expected {
            return Err(EngineError::Conflict {
                id: booking_id,
                expected,
                actual,
            });
        }
        check_transition(booking_id, role, actual, target)?;

        let event = Event::BookingStatusChanged {
            id: booking_id,
            provider_id: snapshot.provider_id,
            date: snapshot.date,
            status: target,
        };
        self.persist_and_apply(&mut day, &event).await?;

        let updated = day
            .get(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound { kind: "booking", id: booking_id })?;
        self.gateway.enqueue(status_notice(&updated, &provider, role));
        info!(
            booking = %booking_id,
            from = %actual,
            to = %target,
            ?role,
            "booking status changed"
        );
        Ok(updated)
    }
}
