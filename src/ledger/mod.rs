mod error;

pub use error::LedgerError;

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::store::LedgerStore;

/// Result of a committed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub building: Building,
    pub event: EntryExitEvent,
}

/// Owns the occupancy update protocol.
///
/// Applies for one building run one at a time behind a per-building async
/// mutex: read, compute the clamped count, commit conditionally on the count
/// just read. Different buildings never share a lock. The store's conditional
/// commit still guards against writers outside this ledger; a lost race is
/// re-read and retried up to `max_retries` times.
pub struct OccupancyLedger {
    store: Arc<dyn LedgerStore>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    /// Last event id handed out; new ids are strictly greater.
    last_id: std::sync::Mutex<Ulid>,
    max_retries: u32,
}

impl OccupancyLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            locks: DashMap::new(),
            last_id: std::sync::Mutex::new(Ulid::nil()),
            max_retries: MAX_CONFLICT_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Move `magnitude` people through `building_id` in `direction` (`IN`/`OUT`).
    pub async fn apply_event(
        &self,
        building_id: &str,
        direction: &str,
        magnitude: i64,
        tag_id: Option<String>,
    ) -> Result<Applied, LedgerError> {
        let start = Instant::now();
        let result = self.apply_serialized(building_id, direction, magnitude, tag_id).await;
        metrics::histogram!(observability::APPLY_DURATION_SECONDS)
            .record(start.elapsed().as_secs_f64());

        match &result {
            Ok(applied) => {
                metrics::counter!(
                    observability::EVENTS_APPLIED_TOTAL,
                    "direction" => applied.event.direction.as_str()
                )
                .increment(1);
                debug!(
                    building_id,
                    direction = %applied.event.direction,
                    count = applied.event.count,
                    occupancy = applied.building.occupancy_count,
                    "event {} committed",
                    applied.event.id
                );
            }
            Err(e) => {
                metrics::counter!(
                    observability::EVENTS_REJECTED_TOTAL,
                    "kind" => observability::error_label(e)
                )
                .increment(1);
                match e {
                    LedgerError::Unavailable(_) | LedgerError::Conflict(_) => {
                        warn!(building_id, "apply_event failed: {e}")
                    }
                    _ => debug!(building_id, "apply_event rejected: {e}"),
                }
            }
        }
        result
    }

    /// A single QR scan: magnitude 1 with the scanned tag.
    pub async fn scan(
        &self,
        building_id: &str,
        direction: &str,
        tag_id: String,
    ) -> Result<Applied, LedgerError> {
        self.apply_event(building_id, direction, 1, Some(tag_id)).await
    }

    pub async fn get_building(&self, id: &str) -> Result<Building, LedgerError> {
        Ok(self.store.read_building(id).await?)
    }

    /// All buildings, ordered by id.
    pub async fn list_buildings(&self) -> Result<Vec<Building>, LedgerError> {
        Ok(self.store.list_buildings().await?)
    }

    /// Most recent events first. `None` means `DEFAULT_EVENT_LIMIT`; larger
    /// requests are capped at `MAX_EVENT_LIMIT`.
    pub async fn list_events(&self, limit: Option<usize>) -> Result<Vec<EntryExitEvent>, LedgerError> {
        let limit = match limit {
            None => DEFAULT_EVENT_LIMIT,
            Some(0) => return Err(LedgerError::InvalidArgument("limit must be positive".into())),
            Some(n) => n.min(MAX_EVENT_LIMIT),
        };
        Ok(self.store.list_events(limit).await?)
    }

    /// Register a building at zero occupancy; an existing one is returned as is.
    pub async fn register_building(
        &self,
        id: &str,
        department_name: &str,
    ) -> Result<Building, LedgerError> {
        let (building, created) = self.store.register_building(id, department_name).await?;
        if created {
            debug!("registered building {id} ({department_name})");
        }
        Ok(building)
    }

    async fn apply_serialized(
        &self,
        building_id: &str,
        direction: &str,
        magnitude: i64,
        tag_id: Option<String>,
    ) -> Result<Applied, LedgerError> {
        let (direction, magnitude) = validate(building_id, direction, magnitude, tag_id.as_deref())?;

        // Buildings are never deleted, so checking before taking a lock keeps
        // unknown ids out of the lock table.
        self.store.read_building(building_id).await?;

        let lock = self.locks.entry(building_id.to_string()).or_default().clone();
        let _serial = lock.lock().await;

        let mut retries = 0;
        loop {
            match self.try_commit(building_id, direction, magnitude, &tag_id).await {
                Err(LedgerError::Conflict(msg)) if retries < self.max_retries => {
                    retries += 1;
                    metrics::counter!(observability::CONFLICT_RETRIES_TOTAL).increment(1);
                    debug!(building_id, retries, "retrying after conflict: {msg}");
                    tokio::task::yield_now().await;
                }
                other => return other,
            }
        }
    }

    async fn try_commit(
        &self,
        building_id: &str,
        direction: Direction,
        magnitude: u64,
        tag_id: &Option<String>,
    ) -> Result<Applied, LedgerError> {
        let current = self.store.read_building(building_id).await?;
        let floor = self.store.last_event_id(building_id).await?;
        let occupancy_after = direction
            .apply(current.occupancy_count, magnitude)
            .ok_or_else(|| LedgerError::InvalidArgument("occupancy count would overflow".into()))?;

        let id = self.next_event_id(floor)?;
        let event = EntryExitEvent {
            id,
            building_id: building_id.to_string(),
            tag_id: tag_id.clone(),
            direction,
            count: magnitude,
            timestamp: id.timestamp_ms() as Ms,
            occupancy_after,
        };
        let building = self.store.commit(current.occupancy_count, &event).await?;
        Ok(Applied { building, event })
    }

    /// A fresh time-ordered id, strictly after both the last id this ledger
    /// issued and `floor` (the building's newest logged event). The floor
    /// matters after a restart or when another ledger shares the store.
    fn next_event_id(&self, floor: Option<Ulid>) -> Result<Ulid, LedgerError> {
        let mut last = self.last_id.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let floor = floor.map_or(*last, |f| f.max(*last));
        let fresh = Ulid::new();
        let id = if fresh > floor {
            fresh
        } else {
            floor
                .increment()
                .ok_or_else(|| LedgerError::Conflict("event id space exhausted".into()))?
        };
        *last = id;
        Ok(id)
    }
}

fn validate(
    building_id: &str,
    direction: &str,
    magnitude: i64,
    tag_id: Option<&str>,
) -> Result<(Direction, u64), LedgerError> {
    if building_id.is_empty() {
        return Err(LedgerError::InvalidArgument("building_id is required".into()));
    }
    if building_id.len() > MAX_BUILDING_ID_LEN {
        return Err(LedgerError::InvalidArgument("building_id too long".into()));
    }
    let direction: Direction = direction
        .parse()
        .map_err(|e: UnknownDirection| LedgerError::InvalidArgument(e.to_string()))?;
    if magnitude <= 0 {
        return Err(LedgerError::InvalidArgument(format!(
            "count must be a positive integer, got {magnitude}"
        )));
    }
    if magnitude > MAX_MAGNITUDE {
        return Err(LedgerError::InvalidArgument(format!(
            "count must be at most {MAX_MAGNITUDE}, got {magnitude}"
        )));
    }
    if let Some(tag) = tag_id {
        if tag.is_empty() {
            return Err(LedgerError::InvalidArgument("tag_id must not be empty".into()));
        }
        if tag.len() > MAX_TAG_LEN {
            return Err(LedgerError::InvalidArgument("tag_id too long".into()));
        }
    }
    Ok((direction, magnitude as u64))
}
