use chrono::NaiveDate;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

pub(crate) fn validate_request(req: &BookingRequest) -> Result<(), EngineError> {
    let too_long =
        |field: &Option<String>, max: usize| field.as_ref().is_some_and(|s| s.len() > max);
    if too_long(&req.notes, MAX_NOTES_LEN) {
        return Err(EngineError::LimitExceeded("notes too long"));
    }
    if too_long(&req.customer_address, MAX_ADDRESS_LEN) {
        return Err(EngineError::LimitExceeded("address too long"));
    }
    if too_long(&req.customer_phone, MAX_PHONE_LEN) {
        return Err(EngineError::LimitExceeded("phone number too long"));
    }
    Ok(())
}

/// First active booking overlapping `candidate` wins the slot.
pub(crate) fn check_no_conflict(
    day: &DaySchedule,
    candidate: TimeWindow,
) -> Result<(), EngineError> {
    match day.overlapping(candidate).find(|b| b.status.is_active()) {
        Some(existing) => Err(EngineError::SlotTaken(existing.id)),
        None => Ok(()),
    }
}

impl Engine {
    /// Point-in-time answer; only `create_booking` checks under the day lock.
    pub async fn has_conflict(
        &self,
        provider_id: ProviderId,
        date: NaiveDate,
        candidate: TimeWindow,
    ) -> bool {
        let Some(day) = self.existing_day(&(provider_id, date)) else {
            return false;
        };
        let guard = day.read().await;
        check_no_conflict(&guard, candidate).is_err()
    }
}
