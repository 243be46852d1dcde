pub const MAX_BUILDINGS: usize = 10_000;
pub const MAX_BUILDING_ID_LEN: usize = 64;
pub const MAX_DEPARTMENT_NAME_LEN: usize = 256;
pub const MAX_TAG_LEN: usize = 128;

/// Path segments under `/api/buildings/` that name routes, not buildings.
pub const RESERVED_BUILDING_IDS: &[&str] = &["count"];

/// Largest batch a single manual count may carry.
pub const MAX_MAGNITUDE: i64 = 10_000;

pub const DEFAULT_EVENT_LIMIT: usize = 100;
pub const MAX_EVENT_LIMIT: usize = 1_000;

/// Older events fold into the building's baseline count.
pub const MAX_EVENTS_RETAINED_PER_BUILDING: usize = 10_000;

pub const MAX_CONFLICT_RETRIES: u32 = 5;
