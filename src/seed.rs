//! Buildings are created out-of-band: a JSON file of
//! `[{"building_id": "...", "dept_name": "..."}]` registered at startup.

use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::ledger::{LedgerError, OccupancyLedger};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SeedBuilding {
    pub building_id: String,
    pub dept_name: String,
}

#[derive(Debug)]
pub enum SeedError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    Ledger(LedgerError),
}

impl std::fmt::Display for SeedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SeedError::Io(e) => write!(f, "reading seed file: {e}"),
            SeedError::Parse(e) => write!(f, "parsing seed file: {e}"),
            SeedError::Ledger(e) => write!(f, "registering seed building: {e}"),
        }
    }
}

impl std::error::Error for SeedError {}

pub fn parse(json: &str) -> Result<Vec<SeedBuilding>, SeedError> {
    serde_json::from_str(json).map_err(SeedError::Parse)
}

/// Register every building in `path`. Existing buildings keep their counts.
/// Returns how many entries the file held.
pub async fn load(ledger: &OccupancyLedger, path: &Path) -> Result<usize, SeedError> {
    let json = tokio::fs::read_to_string(path).await.map_err(SeedError::Io)?;
    let buildings = parse(&json)?;
    for b in &buildings {
        ledger
            .register_building(&b.building_id, &b.dept_name)
            .await
            .map_err(SeedError::Ledger)?;
    }
    info!("seeded {} buildings from {}", buildings.len(), path.display());
    Ok(buildings.len())
}
