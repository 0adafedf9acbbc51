//! Hard limits. Anything a client can grow is bounded here.

/// Widest window `ensure_generated` will materialize in one call.
pub const MAX_GENERATION_WINDOW_DAYS: i64 = 366;

/// Upper bound on the configured booking window.
pub const MAX_BOOKING_WINDOW_DAYS: u32 = 365;

/// Contact name, car id, owner id, timezone, idempotency key.
pub const MAX_FIELD_LEN: usize = 256;

pub const MAX_EMAIL_LEN: usize = 254;

pub const MAX_PHONE_LEN: usize = 32;

pub const MAX_NOTES_LEN: usize = 4096;

/// Serialized record body accepted by a record store.
pub const MAX_RECORD_BYTES: usize = 64 * 1024;

/// One line of the JSON wire protocol.
pub const MAX_REQUEST_LINE_BYTES: usize = 64 * 1024;

/// Slots a single policy day may produce (24h at 1-minute steps).
pub const MAX_SLOTS_PER_DAY: usize = 1440;
