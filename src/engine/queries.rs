use std::cmp::Reverse;

use chrono::NaiveDate;

use crate::model::*;

use super::availability::{merge_overlapping, subtract_windows};
use super::{Engine, EngineError};

impl Engine {
    pub async fn get_booking(&self, id: BookingId) -> Option<Booking> {
        let key = self.booking_index.get(&id).map(|e| *e.value())?;
        let day = self.existing_day(&key)?;
        let guard = day.read().await;
        guard.get(&id).cloned()
    }

    /// The booking, if `actor` is its customer or acts for its provider.
    pub async fn booking_for(&self, id: BookingId, actor: UserId) -> Result<Booking, EngineError> {
        let booking = self
            .get_booking(id)
            .await
            .ok_or(EngineError::NotFound { kind: "booking", id })?;
        if booking.customer_id == actor {
            return Ok(booking);
        }
        let provider = self.provider_of_booking(&booking).await?;
        if provider.user_id == actor {
            Ok(booking)
        } else {
            Err(EngineError::Forbidden("not a party to this booking"))
        }
    }

    /// Newest date first, then latest start first.
    pub async fn bookings_for_customer(&self, customer_id: UserId) -> Vec<Booking> {
        let ids = self
            .by_customer
            .get(&customer_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        self.collect_bookings(ids).await
    }

    /// Newest date first, then latest start first.
    pub async fn bookings_for_provider(&self, provider_id: ProviderId) -> Vec<Booking> {
        let ids = self
            .by_provider
            .get(&provider_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        self.collect_bookings(ids).await
    }

    async fn collect_bookings(&self, ids: Vec<BookingId>) -> Vec<Booking> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(b) = self.get_booking(id).await {
                out.push(b);
            }
        }
        out.sort_by_key(|b| (Reverse(b.date), Reverse(b.window.start())));
        out
    }

    /// Resolved hours, taken windows and what is left of the day.
    pub async fn day_view(&self, provider_id: ProviderId, date: NaiveDate) -> DayView {
        let availability = self.resolve_availability(provider_id, date);

        let booked: Vec<TimeWindow> = match self.existing_day(&(provider_id, date)) {
            Some(day) => {
                let guard = day.read().await;
                guard.active().map(|b| b.window).collect()
            }
            None => Vec::new(),
        };

        let free = if availability.is_day_off {
            Vec::new()
        } else {
            subtract_windows(&[availability.window], &merge_overlapping(&booked))
        };

        DayView {
            provider_id,
            date,
            availability,
            booked,
            free,
        }
    }
}
