use thiserror::Error;

use crate::compliance::domain::records::{TrackRecord, VehicleCount};

#[derive(Error, Debug)]
pub enum SinkError {
    /// The backend could not take the write right now.
    #[error("sink unavailable: {0}")]
    Unavailable(String),
    /// The backend will never accept writes again.
    #[error("sink permanently unavailable: {0}")]
    PermanentlyUnavailable(String),
    #[error("sink I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sink serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SinkError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, SinkError::PermanentlyUnavailable(_))
    }
}

/// Destination for per-video track records and vehicle counts.
///
/// Both writes are idempotent upserts: tracks keyed by track id, counts by
/// `(vehicle_type, date)`. Writing the same batch twice is harmless.
pub trait PersistenceSink: Send + Sync {
    fn upsert_tracks(&self, video_id: &str, tracks: &[TrackRecord]) -> Result<(), SinkError>;

    fn upsert_counts(&self, video_id: &str, counts: &[VehicleCount]) -> Result<(), SinkError>;
}

/// Discards everything. For dry runs and tests.
pub struct NullSink;

impl PersistenceSink for NullSink {
    fn upsert_tracks(&self, _video_id: &str, _tracks: &[TrackRecord]) -> Result<(), SinkError> {
        Ok(())
    }

    fn upsert_counts(&self, _video_id: &str, _counts: &[VehicleCount]) -> Result<(), SinkError> {
        Ok(())
    }
}
