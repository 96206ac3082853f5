//! Hard caps that bound memory and scan cost per tenant. Exceeding one is a
//! client error, never a panic.

pub const MAX_COACHES_PER_TENANT: usize = 10_000;
pub const MAX_SLOTS_PER_COACH: usize = 200;
pub const MAX_SESSIONS_PER_COACH: usize = 50_000;

pub const MAX_NOTE_LEN: usize = 1_000;
pub const MAX_TITLE_LEN: usize = 200;

pub const MIN_SESSION_MINUTES: u32 = 15;
pub const MAX_SESSION_MINUTES: u32 = 180;

/// Widest date range one availability query may span.
pub const MAX_AVAILABILITY_WINDOW_DAYS: i64 = 92;

pub const MAX_TENANTS: usize = 1_000;
pub const MAX_TENANT_NAME_LEN: usize = 256;
