use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::compliance::domain::compliance_engine::{ComplianceEngine, ComplianceSettings};
use crate::compliance::domain::vehicle_ledger::VehicleLedger;
use crate::detection::domain::detection_merger::DetectionMerger;
use crate::detection::domain::identity_stabilizer::{IdentityStabilizer, Observation};
use crate::pipeline::pipeline_logger::PipelineLogger;
use crate::shared::detection::Detection;
use crate::shared::engine_config::{ConfigError, EngineConfig};
use crate::shared::frame::Frame;
use crate::shared::geometry::{point_in_polygon, Polygon};
use crate::shared::perspective::PerspectiveTransform;

/// All per-video state for one run, advanced one frame at a time.
///
/// Each call to `process` fully applies a frame before returning, so the
/// ledger never holds a half-updated track.
pub struct FrameProcessor {
    detection_polygon: Polygon,
    transform: PerspectiveTransform,
    merger: DetectionMerger,
    stabilizer: IdentityStabilizer,
    engine: ComplianceEngine,
    ledger: VehicleLedger,
}

impl FrameProcessor {
    pub fn new(config: &EngineConfig, recorded_at: DateTime<Utc>) -> Result<Self, ConfigError> {
        config.validate()?;
        let transform = PerspectiveTransform::from_config(config.perspective.as_ref())?;
        let settings = ComplianceSettings {
            stop_polygon: config.stop_polygon.clone(),
            velocity_threshold: config.velocity_threshold,
            position_buffer_size: config.position_buffer_size,
        };
        Ok(Self {
            detection_polygon: config.detection_polygon.clone(),
            transform,
            merger: DetectionMerger::new(config.overlap_merge_threshold),
            stabilizer: IdentityStabilizer::new(
                config.identity_match_distance,
                config.identity_history_length,
                config.identity_max_age,
            ),
            engine: ComplianceEngine::new(settings, recorded_at),
            ledger: VehicleLedger::new(),
        })
    }

    pub fn process(&mut self, frame: Frame, logger: &mut dyn PipelineLogger) {
        let now = frame.timestamp();
        let index = frame.index();

        let start = Instant::now();
        let vehicles: Vec<Detection> = frame
            .into_detections()
            .into_iter()
            .filter(|d| d.vehicle_type().is_some() && self.in_detection_area(d))
            .collect();
        let merged = self.merger.merge(&vehicles);
        logger.timing("merge", elapsed_ms(start));

        let start = Instant::now();
        let observations: Vec<Observation> = merged
            .into_iter()
            .filter_map(|detection| match self.transform.apply(&detection.anchor()) {
                Ok(position) => Some(Observation {
                    detection,
                    position,
                }),
                Err(e) => {
                    log::warn!("Frame {index}: dropping detection: {e}");
                    None
                }
            })
            .collect();
        let stabilized = self.stabilizer.update(observations);
        logger.timing("stabilize", elapsed_ms(start));

        let start = Instant::now();
        self.engine.drop_tracks(&stabilized.expired);
        let evaluation = self.engine.evaluate(now, &stabilized.assigned);
        for event in &evaluation.entered {
            self.ledger.record_entry(event);
        }
        for record in evaluation.updated {
            self.ledger.upsert_track(record);
        }
        logger.timing("evaluate", elapsed_ms(start));

        logger.metric("detections", vehicles.len() as f64);
        logger.metric("tracks", self.engine.active_tracks() as f64);
    }

    pub fn ledger(&self) -> &VehicleLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut VehicleLedger {
        &mut self.ledger
    }

    fn in_detection_area(&self, detection: &Detection) -> bool {
        self.detection_polygon.is_empty()
            || point_in_polygon(&detection.anchor(), &self.detection_polygon)
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compliance::domain::records::TrackStatus;
    use crate::pipeline::pipeline_logger::NullPipelineLogger;
    use crate::shared::detection::{TrackId, VehicleType};
    use chrono::TimeZone;
    use std::time::Duration;

    fn config() -> EngineConfig {
        EngineConfig {
            stop_polygon: Polygon::from(vec![[0.0, 0.0], [10.0, 0.0], [10.0, 10.0], [0.0, 10.0]]),
            position_buffer_size: 5,
            velocity_threshold: 0.1,
            ..EngineConfig::default()
        }
    }

    fn processor(config: &EngineConfig) -> FrameProcessor {
        let recorded_at = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        FrameProcessor::new(config, recorded_at).unwrap()
    }

    /// Detection whose anchor sits at `(x, y)`.
    fn det(tracker_id: u32, class_id: u32, x: f64, y: f64) -> Detection {
        Detection {
            bbox: [x - 2.0, y - 4.0, x + 2.0, y],
            class_id,
            confidence: 0.9,
            tracker_id,
        }
    }

    fn frame(index: usize, detections: Vec<Detection>) -> Frame {
        Frame::at_rate(index, 30.0, detections)
    }

    #[test]
    fn test_stopped_car_is_compliant_and_counted() {
        let mut p = processor(&config());
        for i in 0..5 {
            p.process(frame(i, vec![det(1, 2, 5.0, 5.0)]), &mut NullPipelineLogger);
        }
        let snapshot = p.ledger().snapshot();
        assert_eq!(snapshot.tracks.len(), 1);
        let track = &snapshot.tracks[0];
        assert_eq!(track.status, TrackStatus::Stationary);
        assert!(track.compliance);
        assert!(track.reaction_time_secs.unwrap() < 0.2);
        assert_eq!(snapshot.count_for(VehicleType::Car), 1);
    }

    #[test]
    fn test_duplicate_boxes_counted_once() {
        let mut p = processor(&config());
        let mut twin = det(2, 2, 5.2, 5.0);
        twin.confidence = 0.5;
        p.process(frame(0, vec![det(1, 2, 5.0, 5.0), twin]), &mut NullPipelineLogger);
        assert_eq!(p.ledger().snapshot().count_for(VehicleType::Car), 1);
    }

    #[test]
    fn test_non_vehicles_ignored() {
        let mut p = processor(&config());
        p.process(frame(0, vec![det(1, 0, 5.0, 5.0)]), &mut NullPipelineLogger);
        assert!(p.ledger().snapshot().is_empty());
    }

    #[test]
    fn test_detection_polygon_filters_outside_objects() {
        let config = EngineConfig {
            detection_polygon: Polygon::from(vec![[0.0, 0.0], [20.0, 0.0], [20.0, 20.0], [0.0, 20.0]]),
            ..config()
        };
        let mut p = processor(&config);
        p.process(
            frame(0, vec![det(1, 2, 5.0, 5.0), det(2, 2, 100.0, 100.0)]),
            &mut NullPipelineLogger,
        );
        let tracks = p.ledger().snapshot().tracks;
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].track_id, TrackId(1));
    }

    #[test]
    fn test_id_switch_keeps_one_track() {
        let mut p = processor(&config());
        for i in 0..3 {
            p.process(frame(i, vec![det(1, 2, 5.0, 5.0)]), &mut NullPipelineLogger);
        }
        for i in 3..5 {
            p.process(frame(i, vec![det(9, 2, 5.0, 5.0)]), &mut NullPipelineLogger);
        }
        let snapshot = p.ledger().snapshot();
        assert_eq!(snapshot.tracks.len(), 1);
        assert_eq!(snapshot.tracks[0].status, TrackStatus::Stationary);
        assert_eq!(snapshot.count_for(VehicleType::Car), 1);
    }

    #[test]
    fn test_expired_track_keeps_final_record() {
        let config = EngineConfig {
            identity_max_age: 2,
            ..config()
        };
        let mut p = processor(&config);
        for i in 0..5 {
            p.process(frame(i, vec![det(1, 2, 5.0, 5.0)]), &mut NullPipelineLogger);
        }
        for i in 5..9 {
            p.process(frame(i, vec![]), &mut NullPipelineLogger);
        }
        let before = p.ledger().snapshot().tracks[0].clone();
        assert_eq!(before.status, TrackStatus::Stationary);
        assert!(before.compliance);

        // Same raw id later is a new stable track; the old record is untouched.
        p.process(
            Frame::new(9, Duration::from_secs(1), vec![det(1, 2, 5.0, 5.0)]),
            &mut NullPipelineLogger,
        );
        let snapshot = p.ledger().snapshot();
        assert_eq!(snapshot.tracks.len(), 2);
        assert_eq!(snapshot.tracks[0], before);
        assert_eq!(snapshot.tracks[1].track_id, TrackId(2));
        assert_eq!(snapshot.tracks[1].status, TrackStatus::Entered);
        assert_eq!(snapshot.count_for(VehicleType::Car), 2);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let recorded_at = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        assert!(FrameProcessor::new(&EngineConfig::default(), recorded_at).is_err());
    }
}
