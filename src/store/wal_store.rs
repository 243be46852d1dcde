use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, error, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::wal::Wal;

use super::{LedgerStore, StoreError};

pub type SharedBuildingState = Arc<RwLock<BuildingState>>;

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        record: Record,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        records: Vec<Record>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
    #[cfg(test)]
    InjectFault {
        fault: crate::wal::Fault,
        response: oneshot::Sender<()>,
    },
}

/// Owns the WAL. Appends that queue up while a flush is pending ride along
/// in the next batch, which is fsynced once.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let mut batch = match cmd {
            WalCommand::Append { record, response } => vec![(record, response)],
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { record, response }) => batch.push((record, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        for (_, tx) in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Record, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    wal.append_batch(batch.iter().map(|(record, _)| record))
        .inspect_err(|e| error!("WAL batch of {} records failed: {e}", batch.len()))
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { records, response } => {
            let result = Wal::write_compact_file(wal.path(), &records)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { record, response } => {
            let _ = response.send(wal.append_batch([&record]));
        }
        #[cfg(test)]
        WalCommand::InjectFault { fault, response } => {
            wal.inject_fault(fault);
            let _ = response.send(());
        }
    }
}

async fn wal_append(wal_tx: &mpsc::Sender<WalCommand>, record: Record) -> Result<(), StoreError> {
    let (tx, rx) = oneshot::channel();
    wal_tx
        .send(WalCommand::Append { record, response: tx })
        .await
        .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
    rx.await
        .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))?
        .map_err(|e| StoreError::Unavailable(format!("WAL append failed: {e}")))
}

/// Building state held in memory and made durable through a write-ahead log.
///
/// Each building sits behind its own `RwLock`. A commit holds the write lock
/// across the WAL append and the in-memory apply, so readers see either the
/// old count and log or the new count and log, never a mix.
pub struct WalStore {
    buildings: DashMap<String, SharedBuildingState>,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Serializes registration against compaction.
    catalog: Mutex<()>,
    retain: usize,
}

impl WalStore {
    /// Replay the WAL at `wal_path` and start the writer task.
    /// Must be called from inside a tokio runtime.
    pub fn open(wal_path: PathBuf) -> io::Result<Self> {
        Self::with_retention(wal_path, MAX_EVENTS_RETAINED_PER_BUILDING)
    }

    pub fn with_retention(wal_path: PathBuf, retain: usize) -> io::Result<Self> {
        let (wal, records) = Wal::open_and_replay(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            buildings: DashMap::new(),
            wal_tx,
            catalog: Mutex::new(()),
            retain: retain.max(1),
        };
        for record in &records {
            store.replay_record(record);
        }
        info!(
            "replayed {} WAL records into {} buildings from {}",
            records.len(),
            store.buildings.len(),
            wal_path.display()
        );
        metrics::gauge!(observability::BUILDINGS_REGISTERED).set(store.buildings.len() as f64);
        Ok(store)
    }

    // We are the sole owner of every lock during replay, so try_write never fails.
    fn replay_record(&self, record: &Record) {
        match record {
            Record::BuildingRegistered {
                id,
                department_name,
                occupancy_count,
            } => {
                self.buildings.entry(id.clone()).or_insert_with(|| {
                    Arc::new(RwLock::new(BuildingState::new(
                        id.clone(),
                        department_name.clone(),
                        *occupancy_count,
                    )))
                });
            }
            Record::EntryLogged { event } => {
                let Some(rs) = self.get(&event.building_id) else {
                    debug!("replay: event {} for unknown building {}", event.id, event.building_id);
                    return;
                };
                if let Ok(mut guard) = rs.try_write() {
                    guard.push_event(event.clone(), self.retain);
                }
            }
        }
    }

    fn get(&self, id: &str) -> Option<SharedBuildingState> {
        self.buildings.get(id).map(|e| e.value().clone())
    }

    /// Rewrite the WAL as one registration (at the baseline count) plus the
    /// retained events for each building.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _catalog = self.catalog.lock().await;

        let mut ids: Vec<String> = self.buildings.iter().map(|e| e.key().clone()).collect();
        ids.sort();

        // Read guards stay held until the swap finishes: a commit that already
        // queued its append is either in this snapshot or blocked behind us.
        let mut guards = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(rs) = self.get(id) {
                guards.push(rs.read_owned().await);
            }
        }

        let mut records = Vec::new();
        for guard in &guards {
            records.push(Record::BuildingRegistered {
                id: guard.id.clone(),
                department_name: guard.department_name.clone(),
                occupancy_count: guard.baseline_count,
            });
            records.extend(
                guard
                    .events
                    .iter()
                    .map(|event| Record::EntryLogged { event: event.clone() }),
            );
        }
        let record_count = records.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { records, response: tx })
            .await
            .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Unavailable(format!("WAL compaction failed: {e}")))?;

        drop(guards);
        metrics::counter!(observability::WAL_COMPACTIONS_TOTAL).increment(1);
        info!("compacted WAL to {record_count} records");
        Ok(())
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Make the next WAL batch fail.
    #[cfg(test)]
    pub async fn inject_wal_fault(&self, fault: crate::wal::Fault) {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::InjectFault { fault, response: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Baseline count and retained events for one building, oldest first.
    pub async fn history(&self, id: &str) -> Option<(u64, Vec<EntryExitEvent>)> {
        let rs = self.get(id)?;
        let guard = rs.read().await;
        Some((guard.baseline_count, guard.events.iter().cloned().collect()))
    }
}

#[async_trait]
impl LedgerStore for WalStore {
    async fn read_building(&self, id: &str) -> Result<Building, StoreError> {
        let rs = self.get(id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let guard = rs.read().await;
        Ok(guard.snapshot())
    }

    async fn last_event_id(&self, id: &str) -> Result<Option<Ulid>, StoreError> {
        let rs = self.get(id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let guard = rs.read().await;
        Ok(guard.last_event_id())
    }

    async fn commit(
        &self,
        expected_previous: u64,
        event: &EntryExitEvent,
    ) -> Result<Building, StoreError> {
        let rs = self
            .get(&event.building_id)
            .ok_or_else(|| StoreError::NotFound(event.building_id.clone()))?;
        let wal_tx = self.wal_tx.clone();
        let retain = self.retain;
        let event = event.clone();

        // Detached: if the caller's future is dropped mid-commit, the WAL
        // append and the in-memory apply still happen together.
        let task = tokio::spawn(async move {
            let mut guard = rs.write_owned().await;
            if guard.occupancy_count != expected_previous {
                return Err(StoreError::Conflict(format!(
                    "building {} is at {}, expected {}",
                    guard.id, guard.occupancy_count, expected_previous
                )));
            }
            if let Some(last) = guard.last_event_id()
                && event.id <= last
            {
                return Err(StoreError::Conflict(format!(
                    "event {} is not newer than {} on building {}",
                    event.id, last, guard.id
                )));
            }
            wal_append(&wal_tx, Record::EntryLogged { event: event.clone() }).await?;
            guard.push_event(event, retain);
            Ok(guard.snapshot())
        });
        task.await
            .map_err(|e| StoreError::Unavailable(format!("commit task failed: {e}")))?
    }

    async fn register_building(
        &self,
        id: &str,
        department_name: &str,
    ) -> Result<(Building, bool), StoreError> {
        if id.is_empty() || id.len() > MAX_BUILDING_ID_LEN {
            return Err(StoreError::LimitExceeded("building id length"));
        }
        if RESERVED_BUILDING_IDS.contains(&id) {
            return Err(StoreError::LimitExceeded("building id is reserved by the API"));
        }
        if department_name.len() > MAX_DEPARTMENT_NAME_LEN {
            return Err(StoreError::LimitExceeded("department name too long"));
        }

        let _catalog = self.catalog.lock().await;
        if let Some(rs) = self.get(id) {
            return Ok((rs.read().await.snapshot(), false));
        }
        if self.buildings.len() >= MAX_BUILDINGS {
            return Err(StoreError::LimitExceeded("too many buildings"));
        }

        let record = Record::BuildingRegistered {
            id: id.to_string(),
            department_name: department_name.to_string(),
            occupancy_count: 0,
        };
        wal_append(&self.wal_tx, record).await?;

        let state = BuildingState::new(id.to_string(), department_name.to_string(), 0);
        let snapshot = state.snapshot();
        self.buildings.insert(id.to_string(), Arc::new(RwLock::new(state)));
        metrics::gauge!(observability::BUILDINGS_REGISTERED).set(self.buildings.len() as f64);
        Ok((snapshot, true))
    }

    async fn list_buildings(&self) -> Result<Vec<Building>, StoreError> {
        let all: Vec<SharedBuildingState> = self.buildings.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(all.len());
        for rs in all {
            out.push(rs.read().await.snapshot());
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn list_events(&self, limit: usize) -> Result<Vec<EntryExitEvent>, StoreError> {
        let all: Vec<SharedBuildingState> = self.buildings.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for rs in all {
            let guard = rs.read().await;
            out.extend(guard.recent(limit).cloned());
        }
        // ULIDs lead with the timestamp, so id order is time order.
        out.sort_by(|a, b| b.id.cmp(&a.id));
        out.truncate(limit);
        Ok(out)
    }
}
