use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;

use crate::compliance::domain::records::{
    EntryEvent, LedgerSnapshot, TrackRecord, VehicleCount,
};
use crate::shared::detection::{TrackId, VehicleType};

/// Counted vehicles and per-type, per-day totals for one video.
///
/// Counts only change in `record_entry`, and a track id is counted at most
/// once no matter how often it re-enters.
#[derive(Debug, Default)]
pub struct VehicleLedger {
    records: BTreeMap<TrackId, TrackRecord>,
    counted_ids: BTreeSet<TrackId>,
    counts: BTreeMap<(VehicleType, NaiveDate), u64>,
    dirty_tracks: BTreeSet<TrackId>,
    dirty_counts: BTreeSet<(VehicleType, NaiveDate)>,
}

impl VehicleLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts the track if it has not been counted before. Returns whether it was.
    pub fn record_entry(&mut self, event: &EntryEvent) -> bool {
        if !self.counted_ids.insert(event.track_id) {
            return false;
        }
        let key = (event.vehicle_type, event.date);
        *self.counts.entry(key).or_insert(0) += 1;
        self.dirty_counts.insert(key);
        log::debug!(
            "Counted {} {} on {}",
            event.vehicle_type,
            event.track_id,
            event.date
        );
        true
    }

    pub fn upsert_track(&mut self, record: TrackRecord) {
        if self.records.get(&record.track_id) == Some(&record) {
            return;
        }
        self.dirty_tracks.insert(record.track_id);
        self.records.insert(record.track_id, record);
    }

    pub fn has_changes(&self) -> bool {
        !self.dirty_tracks.is_empty() || !self.dirty_counts.is_empty()
    }

    /// Returns what changed since the previous call and resets the change set.
    pub fn take_changes(&mut self) -> LedgerSnapshot {
        let tracks = std::mem::take(&mut self.dirty_tracks)
            .into_iter()
            .filter_map(|id| self.records.get(&id).cloned())
            .collect();
        let vehicle_counts = std::mem::take(&mut self.dirty_counts)
            .into_iter()
            .filter_map(|key| self.count_row(key))
            .collect();
        LedgerSnapshot {
            tracks,
            vehicle_counts,
        }
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            tracks: self.records.values().cloned().collect(),
            vehicle_counts: self
                .counts
                .keys()
                .filter_map(|key| self.count_row(*key))
                .collect(),
        }
    }

    pub fn is_counted(&self, track_id: TrackId) -> bool {
        self.counted_ids.contains(&track_id)
    }

    pub fn per_type_totals(&self) -> BTreeMap<VehicleType, u64> {
        let mut totals = BTreeMap::new();
        for ((vehicle_type, _), count) in &self.counts {
            *totals.entry(*vehicle_type).or_insert(0) += count;
        }
        totals
    }

    fn count_row(&self, key: (VehicleType, NaiveDate)) -> Option<VehicleCount> {
        self.counts.get(&key).map(|&count| VehicleCount {
            vehicle_type: key.0,
            date: key.1,
            count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compliance::domain::records::TrackStatus;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    fn entry(id: u32, vehicle_type: VehicleType, date: NaiveDate) -> EntryEvent {
        EntryEvent {
            track_id: TrackId(id),
            vehicle_type,
            date,
        }
    }

    fn record(id: u32, status: TrackStatus) -> TrackRecord {
        TrackRecord {
            track_id: TrackId(id),
            vehicle_type: VehicleType::Car,
            status,
            compliance: status == TrackStatus::Stationary,
            entry_time_secs: None,
            reaction_time_secs: None,
            exited_before_stop: false,
            first_seen_secs: 0.0,
            date: day(1),
        }
    }

    #[test]
    fn test_track_counted_at_most_once() {
        let mut ledger = VehicleLedger::new();
        assert!(ledger.record_entry(&entry(1, VehicleType::Car, day(1))));
        assert!(!ledger.record_entry(&entry(1, VehicleType::Car, day(1))));
        assert!(!ledger.record_entry(&entry(1, VehicleType::Car, day(2))));
        assert_eq!(ledger.snapshot().count_for(VehicleType::Car), 1);
        assert!(ledger.is_counted(TrackId(1)));
    }

    #[test]
    fn test_counts_keyed_by_type_and_date() {
        let mut ledger = VehicleLedger::new();
        ledger.record_entry(&entry(1, VehicleType::Car, day(1)));
        ledger.record_entry(&entry(2, VehicleType::Car, day(1)));
        ledger.record_entry(&entry(3, VehicleType::Car, day(2)));
        ledger.record_entry(&entry(4, VehicleType::Truck, day(1)));

        let counts = ledger.snapshot().vehicle_counts;
        assert_eq!(
            counts,
            vec![
                VehicleCount { vehicle_type: VehicleType::Car, date: day(1), count: 2 },
                VehicleCount { vehicle_type: VehicleType::Car, date: day(2), count: 1 },
                VehicleCount { vehicle_type: VehicleType::Truck, date: day(1), count: 1 },
            ]
        );
        let totals = ledger.per_type_totals();
        assert_eq!(totals[&VehicleType::Car], 3);
        assert_eq!(totals[&VehicleType::Truck], 1);
    }

    #[test]
    fn test_take_changes_is_incremental() {
        let mut ledger = VehicleLedger::new();
        ledger.record_entry(&entry(1, VehicleType::Car, day(1)));
        ledger.upsert_track(record(1, TrackStatus::Entered));
        assert!(ledger.has_changes());

        let first = ledger.take_changes();
        assert_eq!(first.tracks.len(), 1);
        assert_eq!(first.vehicle_counts.len(), 1);
        assert!(!ledger.has_changes());
        assert!(ledger.take_changes().is_empty());

        ledger.upsert_track(record(2, TrackStatus::Moving));
        let second = ledger.take_changes();
        assert_eq!(second.tracks.len(), 1);
        assert_eq!(second.tracks[0].track_id, TrackId(2));
        assert!(second.vehicle_counts.is_empty());
        assert_eq!(ledger.snapshot().tracks.len(), 2);
    }

    #[test]
    fn test_unchanged_record_is_not_dirty() {
        let mut ledger = VehicleLedger::new();
        ledger.upsert_track(record(1, TrackStatus::Entered));
        ledger.take_changes();
        ledger.upsert_track(record(1, TrackStatus::Entered));
        assert!(!ledger.has_changes());
        ledger.upsert_track(record(1, TrackStatus::Stationary));
        assert!(ledger.has_changes());
    }

    #[test]
    fn test_upsert_never_touches_counts() {
        let mut ledger = VehicleLedger::new();
        ledger.upsert_track(record(1, TrackStatus::Stationary));
        assert!(ledger.snapshot().vehicle_counts.is_empty());
    }
}
