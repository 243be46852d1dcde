use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds.
pub type Ms = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "IN")]
    In,
    #[serde(rename = "OUT")]
    Out,
}

impl Direction {
    /// Next count after moving `magnitude` people in this direction.
    /// `OUT` clamps at zero; `None` only when `IN` would overflow.
    pub fn apply(self, current: u64, magnitude: u64) -> Option<u64> {
        match self {
            Direction::In => current.checked_add(magnitude),
            Direction::Out => Some(current.saturating_sub(magnitude)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::In => "IN",
            Direction::Out => "OUT",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownDirection(pub String);

impl fmt::Display for UnknownDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "direction must be IN or OUT, got {:?}", self.0)
    }
}

impl std::error::Error for UnknownDirection {}

impl FromStr for Direction {
    type Err = UnknownDirection;

    /// Exact match only: `in` or ` IN` are rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IN" => Ok(Direction::In),
            "OUT" => Ok(Direction::Out),
            other => Err(UnknownDirection(other.to_string())),
        }
    }
}

/// Snapshot of a building as seen by callers.
///
/// Field names on the wire match what the browser front end reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Building {
    #[serde(rename = "building_id")]
    pub id: String,
    #[serde(rename = "dept_name")]
    pub department_name: String,
    #[serde(rename = "total_count")]
    pub occupancy_count: u64,
}

/// One immutable entry/exit log row. Also the payload of `Record::EntryLogged`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryExitEvent {
    #[serde(rename = "log_id")]
    pub id: Ulid,
    pub building_id: String,
    pub tag_id: Option<String>,
    pub direction: Direction,
    pub count: u64,
    #[serde(rename = "entry_time")]
    pub timestamp: Ms,
    /// Building count right after this event committed.
    #[serde(rename = "total_after")]
    pub occupancy_after: u64,
}

impl EntryExitEvent {
    /// Signed change this event asked for, before clamping.
    pub fn signed_delta(&self) -> i128 {
        match self.direction {
            Direction::In => self.count as i128,
            Direction::Out => -(self.count as i128),
        }
    }
}

/// Replay `events` from `baseline` with the clamp-at-zero rule, step by step.
pub fn replay_count<'a>(baseline: u64, events: impl IntoIterator<Item = &'a EntryExitEvent>) -> u64 {
    events.into_iter().fold(baseline, |count, e| {
        e.direction.apply(count, e.count).unwrap_or(u64::MAX)
    })
}

#[derive(Debug, Clone)]
pub struct BuildingState {
    pub id: String,
    pub department_name: String,
    pub occupancy_count: u64,
    /// Count before the oldest retained event.
    pub baseline_count: u64,
    /// Retained log, oldest first (commit order).
    pub events: VecDeque<EntryExitEvent>,
}

impl BuildingState {
    pub fn new(id: String, department_name: String, occupancy_count: u64) -> Self {
        Self {
            id,
            department_name,
            occupancy_count,
            baseline_count: occupancy_count,
            events: VecDeque::new(),
        }
    }

    pub fn snapshot(&self) -> Building {
        Building {
            id: self.id.clone(),
            department_name: self.department_name.clone(),
            occupancy_count: self.occupancy_count,
        }
    }

    pub fn last_event_id(&self) -> Option<Ulid> {
        self.events.back().map(|e| e.id)
    }

    /// Append a committed event, keeping at most `retain` of them.
    pub fn push_event(&mut self, event: EntryExitEvent, retain: usize) {
        self.occupancy_count = event.occupancy_after;
        self.events.push_back(event);
        while self.events.len() > retain {
            if let Some(old) = self.events.pop_front() {
                self.baseline_count = old.occupancy_after;
            }
        }
    }

    /// Most recent events first.
    pub fn recent(&self, limit: usize) -> impl Iterator<Item = &EntryExitEvent> {
        self.events.iter().rev().take(limit)
    }
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    BuildingRegistered {
        id: String,
        department_name: String,
        occupancy_count: u64,
    },
    EntryLogged {
        event: EntryExitEvent,
    },
}
