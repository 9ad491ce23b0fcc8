use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::shared::detection::{TrackId, VehicleType};

/// Position of a track in the stop-compliance state graph.
///
/// Only ever advances `Moving → Entered → Stationary`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackStatus {
    Moving,
    Entered,
    Stationary,
}

impl fmt::Display for TrackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackStatus::Moving => write!(f, "moving"),
            TrackStatus::Entered => write!(f, "entered"),
            TrackStatus::Stationary => write!(f, "stationary"),
        }
    }
}

/// Persisted view of one track.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackRecord {
    pub track_id: TrackId,
    pub vehicle_type: VehicleType,
    pub status: TrackStatus,
    pub compliance: bool,
    pub entry_time_secs: Option<f64>,
    pub reaction_time_secs: Option<f64>,
    pub exited_before_stop: bool,
    pub first_seen_secs: f64,
    pub date: NaiveDate,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleCount {
    pub vehicle_type: VehicleType,
    pub date: NaiveDate,
    pub count: u64,
}

/// Emitted the first time a track's anchor falls inside the stop polygon.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryEvent {
    pub track_id: TrackId,
    pub vehicle_type: VehicleType,
    pub date: NaiveDate,
}

/// Everything the ledger knows at one point in time.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub tracks: Vec<TrackRecord>,
    pub vehicle_counts: Vec<VehicleCount>,
}

impl LedgerSnapshot {
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty() && self.vehicle_counts.is_empty()
    }

    pub fn count_for(&self, vehicle_type: VehicleType) -> u64 {
        self.vehicle_counts
            .iter()
            .filter(|c| c.vehicle_type == vehicle_type)
            .map(|c| c.count)
            .sum()
    }
}
