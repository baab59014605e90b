use crate::model::Ms;

const DAY_MS: Ms = 86_400_000;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// Longest single reservation.
pub const MAX_SPAN_DURATION_MS: Ms = 365 * DAY_MS;
/// Widest window accepted by availability queries.
pub const MAX_QUERY_WINDOW_MS: Ms = 2 * 365 * DAY_MS;

pub const MAX_RESERVATIONS_PER_RESOURCE: usize = 100_000;
pub const MAX_SUBSCRIPTIONS_PER_MAILING: usize = 1_000_000;

pub const MAX_CONTACT_LEN: usize = 320;
pub const MAX_SUBJECT_LEN: usize = 255;
pub const MAX_BODY_LEN: usize = 64 * 1024;
pub const MAX_SKIP_REASON_LEN: usize = 1024;

/// Resources checked by one `filter_available` call.
pub const MAX_FILTER_RESOURCES: usize = 1_000;
