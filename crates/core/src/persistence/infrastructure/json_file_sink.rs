use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::compliance::domain::records::{TrackRecord, VehicleCount};
use crate::persistence::domain::persistence_sink::{PersistenceSink, SinkError};
use crate::shared::sync::lock;

const TRACKS_FILE: &str = "tracks.json";
const COUNTS_FILE: &str = "counts.json";

/// Stores each video's results as `<root>/<video_id>/{tracks,counts}.json`.
///
/// Upserts read the existing file, replace rows by key and rewrite it.
pub struct JsonFileSink {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn video_dir(&self, video_id: &str) -> PathBuf {
        self.root.join(video_id)
    }

    pub fn load_tracks(&self, video_id: &str) -> Result<Vec<TrackRecord>, SinkError> {
        read_rows(&self.video_dir(video_id).join(TRACKS_FILE))
    }

    pub fn load_counts(&self, video_id: &str) -> Result<Vec<VehicleCount>, SinkError> {
        read_rows(&self.video_dir(video_id).join(COUNTS_FILE))
    }

    fn upsert<T, K>(
        &self,
        video_id: &str,
        file_name: &str,
        rows: &[T],
        key: impl Fn(&T) -> K,
    ) -> Result<(), SinkError>
    where
        T: Serialize + DeserializeOwned + Clone,
        K: Ord,
    {
        let _guard = lock(&self.write_lock);
        let dir = self.video_dir(video_id);
        fs::create_dir_all(&dir)?;
        let path = dir.join(file_name);

        let mut merged: BTreeMap<K, T> = read_rows::<T>(&path)?
            .into_iter()
            .map(|row| (key(&row), row))
            .collect();
        for row in rows {
            merged.insert(key(row), row.clone());
        }

        let rows: Vec<&T> = merged.values().collect();
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&rows)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

fn read_rows<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, SinkError> {
    match fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

impl PersistenceSink for JsonFileSink {
    fn upsert_tracks(&self, video_id: &str, tracks: &[TrackRecord]) -> Result<(), SinkError> {
        if tracks.is_empty() {
            return Ok(());
        }
        self.upsert(video_id, TRACKS_FILE, tracks, |r| r.track_id)
    }

    fn upsert_counts(&self, video_id: &str, counts: &[VehicleCount]) -> Result<(), SinkError> {
        if counts.is_empty() {
            return Ok(());
        }
        self.upsert(video_id, COUNTS_FILE, counts, |c| (c.vehicle_type, c.date))
    }
}
