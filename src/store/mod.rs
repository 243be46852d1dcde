//! Persistence seam for the ledger.
//!
//! The ledger never mutates building state directly; it computes the next
//! count and hands the store one event to commit. A store must make the count
//! write and the log append a single atomic step.

mod wal_store;

pub use wal_store::WalStore;

use async_trait::async_trait;
use ulid::Ulid;

use crate::model::{Building, EntryExitEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    NotFound(String),
    /// The conditional commit saw a different count or a newer event.
    Conflict(String),
    Unavailable(String),
    LimitExceeded(&'static str),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "building not found: {id}"),
            StoreError::Conflict(msg) => write!(f, "write conflict: {msg}"),
            StoreError::Unavailable(msg) => write!(f, "store unavailable: {msg}"),
            StoreError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn read_building(&self, id: &str) -> Result<Building, StoreError>;

    /// Id of the newest event logged for the building, if any.
    async fn last_event_id(&self, id: &str) -> Result<Option<Ulid>, StoreError>;

    /// Set the building's count to `event.occupancy_after` and append `event`,
    /// as one unit, only if the count is still `expected_previous` and
    /// `event.id` sorts after every event already logged for the building.
    async fn commit(
        &self,
        expected_previous: u64,
        event: &EntryExitEvent,
    ) -> Result<Building, StoreError>;

    /// Register a building at count zero. Returns the stored record and
    /// whether it was created; an existing building is left untouched.
    async fn register_building(
        &self,
        id: &str,
        department_name: &str,
    ) -> Result<(Building, bool), StoreError>;

    /// Sorted by id.
    async fn list_buildings(&self) -> Result<Vec<Building>, StoreError>;

    /// Newest first, at most `limit`.
    async fn list_events(&self, limit: usize) -> Result<Vec<EntryExitEvent>, StoreError>;
}
