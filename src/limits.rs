//! Hard limits that keep a single request from monopolising the engine.

/// Longest stay a single booking may cover.
pub const MAX_NIGHTS_PER_STAY: u32 = 365;

/// Widest window accepted by calendar reads and host blocks.
pub const MAX_CALENDAR_WINDOW_DAYS: i64 = 731;

/// Active bookings tracked per property.
pub const MAX_ACTIVE_STAYS_PER_PROPERTY: usize = 10_000;

pub const MAX_BLOCK_REASON_LEN: usize = 256;

pub const MAX_PROMOTIONS: usize = 100_000;

/// Events per compacted log record.
pub const COMPACT_CHUNK_EVENTS: usize = 512;

/// Times a booking lease is re-acquired when the booking moves underneath it.
pub const MAX_LEASE_CHASES: usize = 4;
