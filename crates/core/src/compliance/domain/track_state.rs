use std::collections::VecDeque;
use std::time::Duration;

use chrono::NaiveDate;

use crate::compliance::domain::records::{TrackRecord, TrackStatus};
use crate::shared::detection::{TrackId, VehicleType};
use crate::shared::geometry::Point;

/// Mutable per-track state owned by the compliance engine.
#[derive(Clone, Debug)]
pub struct TrackState {
    vehicle_type: VehicleType,
    history: VecDeque<Point>,
    capacity: usize,
    status: TrackStatus,
    entry_time: Option<Duration>,
    reaction_time: Option<Duration>,
    exited_before_stop: bool,
    first_seen: Duration,
    date: NaiveDate,
}

impl TrackState {
    pub fn new(
        vehicle_type: VehicleType,
        capacity: usize,
        first_seen: Duration,
        date: NaiveDate,
    ) -> Self {
        let capacity = capacity.max(2);
        Self {
            vehicle_type,
            history: VecDeque::with_capacity(capacity),
            capacity,
            status: TrackStatus::Moving,
            entry_time: None,
            reaction_time: None,
            exited_before_stop: false,
            first_seen,
            date,
        }
    }

    pub fn vehicle_type(&self) -> VehicleType {
        self.vehicle_type
    }

    pub fn status(&self) -> TrackStatus {
        self.status
    }

    pub fn entry_time(&self) -> Option<Duration> {
        self.entry_time
    }

    pub fn reaction_time(&self) -> Option<Duration> {
        self.reaction_time
    }

    pub fn exited_before_stop(&self) -> bool {
        self.exited_before_stop
    }

    pub fn is_compliant(&self) -> bool {
        self.status == TrackStatus::Stationary
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn push_position(&mut self, position: Point) {
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(position);
    }

    /// Marks the first entry into the stop zone. Returns false on re-entry.
    pub fn enter(&mut self, now: Duration) -> bool {
        if self.entry_time.is_some() {
            return false;
        }
        self.entry_time = Some(now);
        self.status = TrackStatus::Entered;
        true
    }

    /// Promotes to `Stationary` if the buffer is full and the weighted
    /// velocity is strictly below `threshold`.
    pub fn evaluate_stop(&mut self, now: Duration, threshold: f64) {
        if self.status == TrackStatus::Stationary || self.reaction_time.is_some() {
            return;
        }
        let Some(entry) = self.entry_time else { return };
        match self.weighted_velocity() {
            Some(v) if v < threshold => {
                self.reaction_time = Some(now.saturating_sub(entry));
                self.status = TrackStatus::Stationary;
            }
            _ => {}
        }
    }

    pub fn leave_zone(&mut self) {
        self.history.clear();
        if self.status == TrackStatus::Entered {
            self.reaction_time = None;
            self.exited_before_stop = true;
        }
    }

    /// Mean frame-to-frame displacement, weighting newer steps linearly more.
    ///
    /// `None` until the buffer holds `capacity` samples.
    pub fn weighted_velocity(&self) -> Option<f64> {
        if self.history.len() < self.capacity {
            return None;
        }
        let (weighted, total) = self
            .history
            .iter()
            .zip(self.history.iter().skip(1))
            .enumerate()
            .fold((0.0, 0.0), |(acc, total), (i, (a, b))| {
                let w = (i + 1) as f64;
                (acc + w * a.distance(b), total + w)
            });
        Some(weighted / total)
    }

    pub fn to_record(&self, track_id: TrackId) -> TrackRecord {
        TrackRecord {
            track_id,
            vehicle_type: self.vehicle_type,
            status: self.status,
            compliance: self.is_compliant(),
            entry_time_secs: self.entry_time.map(|t| t.as_secs_f64()),
            reaction_time_secs: self.reaction_time.map(|t| t.as_secs_f64()),
            exited_before_stop: self.exited_before_stop,
            first_seen_secs: self.first_seen.as_secs_f64(),
            date: self.date,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn state(capacity: usize) -> TrackState {
        TrackState::new(
            VehicleType::Car,
            capacity,
            Duration::ZERO,
            NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
        )
    }

    #[test]
    fn test_velocity_needs_full_buffer() {
        let mut s = state(3);
        s.push_position(Point::new(0.0, 0.0));
        s.push_position(Point::new(1.0, 0.0));
        assert_eq!(s.weighted_velocity(), None);
        s.push_position(Point::new(2.0, 0.0));
        assert!(s.weighted_velocity().is_some());
    }

    #[test]
    fn test_velocity_weights_newer_steps() {
        let mut s = state(3);
        // Steps of 1 then 4: (1*1 + 2*4) / 3
        s.push_position(Point::new(0.0, 0.0));
        s.push_position(Point::new(1.0, 0.0));
        s.push_position(Point::new(5.0, 0.0));
        assert_relative_eq!(s.weighted_velocity().unwrap(), 3.0);
    }

    #[test]
    fn test_oldest_position_evicted() {
        let mut s = state(2);
        s.push_position(Point::new(0.0, 0.0));
        s.push_position(Point::new(100.0, 0.0));
        s.push_position(Point::new(100.0, 0.0));
        assert_eq!(s.history_len(), 2);
        assert_relative_eq!(s.weighted_velocity().unwrap(), 0.0);
    }

    #[test]
    fn test_enter_only_once() {
        let mut s = state(2);
        assert!(s.enter(Duration::from_secs(1)));
        assert!(!s.enter(Duration::from_secs(5)));
        assert_eq!(s.entry_time(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_leave_while_entered_flags_non_compliance() {
        let mut s = state(2);
        s.enter(Duration::ZERO);
        s.push_position(Point::new(0.0, 0.0));
        s.leave_zone();
        assert_eq!(s.history_len(), 0);
        assert!(s.exited_before_stop());
        assert_eq!(s.reaction_time(), None);
        assert_eq!(s.status(), TrackStatus::Entered);
    }

    #[test]
    fn test_leave_while_moving_is_not_flagged() {
        let mut s = state(2);
        s.leave_zone();
        assert!(!s.exited_before_stop());
    }

    #[test]
    fn test_stationary_survives_leaving() {
        let mut s = state(2);
        s.enter(Duration::ZERO);
        s.push_position(Point::new(0.0, 0.0));
        s.push_position(Point::new(0.0, 0.0));
        s.evaluate_stop(Duration::from_millis(500), 1.0);
        s.leave_zone();
        assert_eq!(s.status(), TrackStatus::Stationary);
        assert!(!s.exited_before_stop());
        assert_eq!(s.reaction_time(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_record_mirrors_state() {
        let mut s = state(2);
        s.enter(Duration::from_millis(1500));
        let r = s.to_record(TrackId(4));
        assert_eq!(r.track_id, TrackId(4));
        assert_eq!(r.status, TrackStatus::Entered);
        assert!(!r.compliance);
        assert_eq!(r.entry_time_secs, Some(1.5));
        assert_eq!(r.reaction_time_secs, None);
    }
}
