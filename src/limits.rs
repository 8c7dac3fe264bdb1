//! Hard caps on request fields and per-key state.

pub const MAX_NOTES_LEN: usize = 2_000;
pub const MAX_ADDRESS_LEN: usize = 500;
pub const MAX_PHONE_LEN: usize = 32;

/// Bookings of any status kept for one provider on one date.
pub const MAX_BOOKINGS_PER_DAY: usize = 512;

/// Rejected in-process before the WAL writer ever sees them.
pub const MAX_RECORD_BYTES: usize = 64 * 1024;
