//! Hard limits that keep a single spa's state bounded.

pub const MAX_SERVICES: usize = 500;
pub const MAX_CLIENTS: usize = 100_000;
pub const MAX_WEEKLY_ROWS: usize = 64;
pub const MAX_BLOCKED_DATES: usize = 10_000;
pub const MAX_APPOINTMENTS_PER_DAY: usize = 512;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_PHONE_LEN: usize = 64;
pub const MAX_NOTES_LEN: usize = 4096;
pub const MAX_REASON_LEN: usize = 1024;

/// Largest WAL record accepted on replay. Anything bigger is a corrupt length word.
pub const MAX_EVENT_BYTES: usize = 64 * 1024;

/// A service can't run longer than a full day.
pub const MAX_SERVICE_DURATION_MIN: u32 = 24 * 60;
pub const MAX_PRICE_CENTS: u32 = 100_000_000;
