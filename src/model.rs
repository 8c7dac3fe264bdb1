use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

pub type BookingId = Ulid;
pub type ProviderId = Ulid;
pub type ServiceItemId = Ulid;
pub type UserId = Ulid;

/// Opening hour applied when a provider has no rule for the weekday.
pub const DEFAULT_OPEN_HOUR: i64 = 10;
/// Closing hour applied when a provider has no rule for the weekday.
pub const DEFAULT_CLOSE_HOUR: i64 = 17;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("window start {start} must be before end {end}")]
pub struct WindowError {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

/// Half-open time-of-day interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawWindow")]
pub struct TimeWindow {
    start: NaiveTime,
    end: NaiveTime,
}

#[derive(Deserialize)]
struct RawWindow {
    start: NaiveTime,
    end: NaiveTime,
}

impl TryFrom<RawWindow> for TimeWindow {
    type Error = WindowError;

    fn try_from(raw: RawWindow) -> Result<Self, Self::Error> {
        TimeWindow::new(raw.start, raw.end)
    }
}

impl TimeWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Result<Self, WindowError> {
        if start < end {
            Ok(Self { start, end })
        } else {
            Err(WindowError { start, end })
        }
    }

    pub fn start(&self) -> NaiveTime {
        self.start
    }

    pub fn end(&self) -> NaiveTime {
        self.end
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains(&self, other: &TimeWindow) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Hull of two windows that overlap or touch; `None` if there is a gap.
    pub fn merge(&self, other: &TimeWindow) -> Option<TimeWindow> {
        if self.start <= other.end && other.start <= self.end {
            Some(TimeWindow {
                start: self.start.min(other.start),
                end: self.end.max(other.end),
            })
        } else {
            None
        }
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

/// The 10:00-17:00 window used for weekdays without a configured rule.
pub fn default_window() -> TimeWindow {
    TimeWindow {
        start: NaiveTime::MIN + Duration::hours(DEFAULT_OPEN_HOUR),
        end: NaiveTime::MIN + Duration::hours(DEFAULT_CLOSE_HOUR),
    }
}

/// Amount in minor currency units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Money(pub u64);

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
    Rejected,
}

impl BookingStatus {
    /// No transition leaves a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BookingStatus::Completed | BookingStatus::Cancelled | BookingStatus::Rejected
        )
    }

    /// Active bookings occupy their window for conflict purposes.
    pub fn is_active(self) -> bool {
        !matches!(self, BookingStatus::Cancelled | BookingStatus::Rejected)
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BookingStatus::Pending => "Pending",
            BookingStatus::Confirmed => "Confirmed",
            BookingStatus::Completed => "Completed",
            BookingStatus::Cancelled => "Cancelled",
            BookingStatus::Rejected => "Rejected",
        };
        f.write_str(s)
    }
}

/// The party on whose behalf an actor is acting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Provider,
    Customer,
}

/// Weekly recurring open window for one provider and weekday.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityRule {
    pub provider_id: ProviderId,
    pub day_of_week: Weekday,
    pub window: TimeWindow,
    pub is_day_off: bool,
}

impl AvailabilityRule {
    pub fn open(provider_id: ProviderId, day_of_week: Weekday, window: TimeWindow) -> Self {
        Self {
            provider_id,
            day_of_week,
            window,
            is_day_off: false,
        }
    }

    pub fn day_off(provider_id: ProviderId, day_of_week: Weekday) -> Self {
        Self {
            provider_id,
            day_of_week,
            window: default_window(),
            is_day_off: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub customer_id: UserId,
    pub provider_id: ProviderId,
    pub service_item_id: ServiceItemId,
    pub date: NaiveDate,
    pub window: TimeWindow,
    pub status: BookingStatus,
    pub total_price: Money,
    pub notes: Option<String>,
    pub customer_address: Option<String>,
    pub customer_phone: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Everything a customer supplies when asking for a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub customer_id: UserId,
    pub provider_id: ProviderId,
    pub service_item_id: ServiceItemId,
    pub date: NaiveDate,
    pub window: TimeWindow,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub customer_address: Option<String>,
    #[serde(default)]
    pub customer_phone: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "status", rename_all = "snake_case")]
pub enum NotificationKind {
    NewBookingRequest,
    StatusChanged(BookingStatus),
}

/// Derived message for one user about one booking. Handed to the gateway,
/// never stored by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub target_user_id: UserId,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub related_booking_id: BookingId,
}

/// Key of the per-provider, per-date serialization unit.
pub type DayKey = (ProviderId, NaiveDate);

/// All bookings of one provider on one date.
#[derive(Debug, Clone)]
pub struct DaySchedule {
    pub provider_id: ProviderId,
    pub date: NaiveDate,
    /// Sorted by `window.start`.
    pub bookings: Vec<Booking>,
}

impl DaySchedule {
    pub fn new(provider_id: ProviderId, date: NaiveDate) -> Self {
        Self {
            provider_id,
            date,
            bookings: Vec::new(),
        }
    }

    pub fn key(&self) -> DayKey {
        (self.provider_id, self.date)
    }

    /// Insert booking maintaining sort order by window start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.window.start <= booking.window.start);
        self.bookings.insert(pos, booking);
    }

    pub fn get(&self, id: &BookingId) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    pub fn get_mut(&mut self, id: &BookingId) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == *id)
    }

    /// Bookings (any status) whose window overlaps `query`.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: TimeWindow) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.window.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.window.end > query.start)
    }

    pub fn active(&self) -> impl Iterator<Item = &Booking> {
        self.bookings.iter().filter(|b| b.status.is_active())
    }
}

/// WAL record format. Flat, one variant per state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RuleUpserted {
        rule: AvailabilityRule,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingStatusChanged {
        id: BookingId,
        provider_id: ProviderId,
        date: NaiveDate,
        status: BookingStatus,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleSource {
    Configured,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedAvailability {
    pub window: TimeWindow,
    pub is_day_off: bool,
    pub source: RuleSource,
}

/// One provider's day: the resolved hours, what is taken, and what is left.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayView {
    pub provider_id: ProviderId,
    pub date: NaiveDate,
    pub availability: ResolvedAvailability,
    pub booked: Vec<TimeWindow>,
    pub free: Vec<TimeWindow>,
}
