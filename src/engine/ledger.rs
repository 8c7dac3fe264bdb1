use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::MAX_BOOKINGS_PER_DAY;
use crate::model::*;
use crate::observability;

use super::conflict::{check_no_conflict, validate_request};
use super::lifecycle::new_booking_notice;
use super::{Engine, EngineError};

impl Engine {
    /// Commit a new `Pending` booking, or explain why the slot cannot be had.
    ///
    /// Availability, conflict check, WAL append and apply all happen under
    /// the (provider, date) write lock, so two creates for the same day see
    /// each other's result. The provider is notified only after the commit.
    pub async fn create_booking(&self, req: BookingRequest) -> Result<Booking, EngineError> {
        let started = Instant::now();
        let (provider_id, date, window) = (req.provider_id, req.date, req.window);
        let result = self.create_booking_inner(req).await;
        observability::record_engine_op("create_booking", started, &result);
        match &result {
            Ok(b) => info!(
                booking = %b.id,
                provider = %provider_id,
                %date,
                %window,
                "booking created"
            ),
            Err(e) => debug!(provider = %provider_id, %date, %window, "booking refused: {e}"),
        }
        result
    }

    async fn create_booking_inner(&self, req: BookingRequest) -> Result<Booking, EngineError> {
        validate_request(&req)?;

        let provider = self
            .catalog
            .provider(req.provider_id)
            .await
            .ok_or(EngineError::NotFound {
                kind: "provider",
                id: req.provider_id,
            })?;
        let item = self
            .catalog
            .service_item(req.service_item_id)
            .await
            .filter(|item| item.is_active)
            .ok_or(EngineError::NotFound {
                kind: "service item",
                id: req.service_item_id,
            })?;

        let _gate = self.commit_gate.read().await;
        let schedule = self.day_for_write((req.provider_id, req.date));
        let mut day = schedule.write().await;

        let available = self.resolve_availability(req.provider_id, req.date);
        if available.is_day_off {
            return Err(EngineError::Unavailable {
                provider_id: req.provider_id,
                date: req.date,
            });
        }
        if !available.window.contains(&req.window) {
            return Err(EngineError::OutsideAvailability {
                requested: req.window,
                available: available.window,
            });
        }

        check_no_conflict(&day, req.window)?;
        // Cancelled and rejected bookings stay in the schedule but hold no time.
        if day.active().count() >= MAX_BOOKINGS_PER_DAY {
            return Err(EngineError::LimitExceeded(
                "too many active bookings for this provider on this date",
            ));
        }

        let booking = Booking {
            id: Ulid::new(),
            customer_id: req.customer_id,
            provider_id: req.provider_id,
            service_item_id: req.service_item_id,
            date: req.date,
            window: req.window,
            status: BookingStatus::Pending,
            total_price: item.base_price,
            notes: req.notes,
            customer_address: req.customer_address,
            customer_phone: req.customer_phone,
            created_at: Utc::now(),
        };
        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        self.persist_and_apply(&mut day, &event).await?;

        self.gateway
            .enqueue(new_booking_notice(&booking, provider.user_id, &item.name));
        Ok(booking)
    }
}
