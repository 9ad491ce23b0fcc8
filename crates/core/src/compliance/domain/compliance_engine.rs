use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};

use crate::compliance::domain::records::{EntryEvent, TrackRecord};
use crate::compliance::domain::track_state::TrackState;
use crate::detection::domain::identity_stabilizer::StabilizedDetection;
use crate::shared::constants::{DEFAULT_POSITION_BUFFER_SIZE, DEFAULT_VELOCITY_THRESHOLD};
use crate::shared::detection::TrackId;
use crate::shared::geometry::{point_in_polygon, Polygon};

#[derive(Clone, Debug)]
pub struct ComplianceSettings {
    pub stop_polygon: Polygon,
    pub velocity_threshold: f64,
    pub position_buffer_size: usize,
}

impl ComplianceSettings {
    pub fn new(stop_polygon: Polygon) -> Self {
        Self {
            stop_polygon,
            velocity_threshold: DEFAULT_VELOCITY_THRESHOLD,
            position_buffer_size: DEFAULT_POSITION_BUFFER_SIZE,
        }
    }
}

/// Outcome of one frame.
#[derive(Debug, Default)]
pub struct FrameEvaluation {
    pub entered: Vec<EntryEvent>,
    /// Current record of every track seen in the frame.
    pub updated: Vec<TrackRecord>,
}

/// Per-track stop-zone state machine.
///
/// The polygon test uses the raw image-space anchor; velocity uses the
/// rectified position carried by each stabilized detection.
pub struct ComplianceEngine {
    settings: ComplianceSettings,
    recorded_at: DateTime<Utc>,
    tracks: HashMap<TrackId, TrackState>,
}

impl ComplianceEngine {
    pub fn new(settings: ComplianceSettings, recorded_at: DateTime<Utc>) -> Self {
        Self {
            settings,
            recorded_at,
            tracks: HashMap::new(),
        }
    }

    pub fn evaluate(&mut self, now: Duration, detections: &[StabilizedDetection]) -> FrameEvaluation {
        let mut evaluation = FrameEvaluation::default();
        let date = self.date_at(now);

        for det in detections {
            let Some(vehicle_type) = det.detection.vehicle_type() else {
                continue;
            };
            let capacity = self.settings.position_buffer_size;
            let track = self
                .tracks
                .entry(det.track_id)
                .or_insert_with(|| TrackState::new(vehicle_type, capacity, now, date));

            track.push_position(det.position);

            if point_in_polygon(&det.detection.anchor(), &self.settings.stop_polygon) {
                if track.enter(now) {
                    log::debug!("Track {} entered the stop zone", det.track_id);
                    evaluation.entered.push(EntryEvent {
                        track_id: det.track_id,
                        vehicle_type: track.vehicle_type(),
                        date,
                    });
                }
                track.evaluate_stop(now, self.settings.velocity_threshold);
            } else {
                track.leave_zone();
            }

            evaluation.updated.push(track.to_record(det.track_id));
        }
        evaluation
    }

    /// Forgets tracks whose stable id expired. Their last record stays in the ledger.
    pub fn drop_tracks(&mut self, expired: &[TrackId]) {
        for id in expired {
            self.tracks.remove(id);
        }
    }

    pub fn track(&self, track_id: TrackId) -> Option<&TrackState> {
        self.tracks.get(&track_id)
    }

    pub fn active_tracks(&self) -> usize {
        self.tracks.len()
    }

    fn date_at(&self, now: Duration) -> NaiveDate {
        chrono::Duration::from_std(now)
            .ok()
            .and_then(|offset| self.recorded_at.checked_add_signed(offset))
            .unwrap_or(self.recorded_at)
            .date_naive()
    }
}
