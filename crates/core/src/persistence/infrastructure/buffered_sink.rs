use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::NaiveDate;

use crate::compliance::domain::records::{LedgerSnapshot, TrackRecord, VehicleCount};
use crate::persistence::domain::persistence_sink::{PersistenceSink, SinkError};
use crate::shared::detection::{TrackId, VehicleType};
use crate::shared::sync::lock;

#[derive(Debug, Default)]
struct Pending {
    tracks: BTreeMap<TrackId, TrackRecord>,
    counts: BTreeMap<(VehicleType, NaiveDate), VehicleCount>,
    /// A fallback file currently holds these rows.
    spilled: bool,
}

impl Pending {
    fn is_empty(&self) -> bool {
        self.tracks.is_empty() && self.counts.is_empty()
    }

    fn to_snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            tracks: self.tracks.values().cloned().collect(),
            vehicle_counts: self.counts.values().cloned().collect(),
        }
    }

    fn from_snapshot(snapshot: LedgerSnapshot) -> Self {
        Self {
            spilled: true,
            tracks: snapshot
                .tracks
                .into_iter()
                .map(|r| (r.track_id, r))
                .collect(),
            counts: snapshot
                .vehicle_counts
                .into_iter()
                .map(|c| ((c.vehicle_type, c.date), c))
                .collect(),
        }
    }
}

/// Retry-and-buffer decorator around another sink.
///
/// A failed write is retried once. If it still fails the rows stay in a
/// per-video buffer (and, with a fallback directory, in
/// `<dir>/<video_id>.pending.json`) and are sent ahead of the next write.
/// Buffered rows survive restarts when a fallback directory is set.
/// Permanent failures are returned to the caller after buffering.
pub struct BufferedSink {
    inner: Box<dyn PersistenceSink>,
    fallback_dir: Option<PathBuf>,
    state: Mutex<State>,
}

/// Backlogs per video. Only videos with rows or a fallback file have an
/// entry; `scanned` remembers which fallback files were already read.
#[derive(Default)]
struct State {
    pending: HashMap<String, Pending>,
    scanned: HashSet<String>,
}

impl BufferedSink {
    pub fn new(inner: Box<dyn PersistenceSink>, fallback_dir: Option<PathBuf>) -> Self {
        Self {
            inner,
            fallback_dir,
            state: Mutex::new(State::default()),
        }
    }

    /// Rows still waiting to reach the inner sink for `video_id`.
    pub fn pending_len(&self, video_id: &str) -> usize {
        let mut state = lock(&self.state);
        let len = {
            let pending = self.pending_for(&mut state, video_id);
            pending.tracks.len() + pending.counts.len()
        };
        state.prune(video_id);
        len
    }

    /// Number of videos with an in-memory backlog entry.
    pub fn backlog_videos(&self) -> usize {
        lock(&self.state).pending.len()
    }

    fn fallback_path(&self, video_id: &str) -> Option<PathBuf> {
        self.fallback_dir
            .as_ref()
            .map(|dir| dir.join(format!("{video_id}.pending.json")))
    }

    fn pending_for<'a>(&self, state: &'a mut State, video_id: &str) -> &'a mut Pending {
        let first_visit = state.scanned.insert(video_id.to_string());
        state
            .pending
            .entry(video_id.to_string())
            .or_insert_with(|| {
                if first_visit {
                    self.load_fallback(video_id)
                } else {
                    Pending::default()
                }
            })
    }

    fn load_fallback(&self, video_id: &str) -> Pending {
        let Some(path) = self.fallback_path(video_id) else {
            return Pending::default();
        };
        let Ok(bytes) = fs::read(&path) else {
            return Pending::default();
        };
        match serde_json::from_slice::<LedgerSnapshot>(&bytes) {
            Ok(snapshot) => {
                log::info!(
                    "Recovered {} buffered tracks and {} counts for {video_id}",
                    snapshot.tracks.len(),
                    snapshot.vehicle_counts.len()
                );
                Pending::from_snapshot(snapshot)
            }
            Err(e) => {
                log::warn!("Ignoring unreadable fallback buffer {}: {e}", path.display());
                Pending::default()
            }
        }
    }

    /// Mirrors the backlog to the fallback file. Nothing touches the disk
    /// while the backlog is empty and was never spilled.
    fn sync_fallback(&self, video_id: &str, pending: &mut Pending) {
        let Some(path) = self.fallback_path(video_id) else {
            return;
        };
        let result = if !pending.is_empty() {
            write_snapshot(&path, &pending.to_snapshot()).map(|()| pending.spilled = true)
        } else if pending.spilled {
            match fs::remove_file(&path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(SinkError::Io(e)),
                _ => {
                    pending.spilled = false;
                    Ok(())
                }
            }
        } else {
            Ok(())
        };
        if let Err(e) = result {
            log::warn!("Failed to update fallback buffer {}: {e}", path.display());
        }
    }

    fn write_with_retry(
        &self,
        video_id: &str,
        what: &str,
        write: impl Fn() -> Result<(), SinkError>,
    ) -> Result<(), SinkError> {
        match write() {
            Ok(()) => Ok(()),
            Err(e) if e.is_permanent() => Err(e),
            Err(e) => {
                log::warn!("Writing {what} for {video_id} failed, retrying: {e}");
                write()
            }
        }
    }

    fn finish(
        &self,
        video_id: &str,
        what: &str,
        pending: &mut Pending,
        result: Result<(), SinkError>,
    ) -> Result<(), SinkError> {
        self.sync_fallback(video_id, pending);
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_permanent() => Err(e),
            Err(e) => {
                log::warn!("Buffered {what} for {video_id} after retry failed: {e}");
                Ok(())
            }
        }
    }
}

impl State {
    fn prune(&mut self, video_id: &str) {
        if self
            .pending
            .get(video_id)
            .is_some_and(|p| p.is_empty() && !p.spilled)
        {
            self.pending.remove(video_id);
        }
    }
}

fn write_snapshot(path: &Path, snapshot: &LedgerSnapshot) -> Result<(), SinkError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_vec(snapshot)?)?;
    Ok(())
}

impl PersistenceSink for BufferedSink {
    fn upsert_tracks(&self, video_id: &str, tracks: &[TrackRecord]) -> Result<(), SinkError> {
        let mut state = lock(&self.state);
        let pending = self.pending_for(&mut state, video_id);
        for record in tracks {
            pending.tracks.insert(record.track_id, record.clone());
        }
        let result = if pending.tracks.is_empty() {
            Ok(())
        } else {
            let batch: Vec<TrackRecord> = pending.tracks.values().cloned().collect();
            let result = self
                .write_with_retry(video_id, "tracks", || self.inner.upsert_tracks(video_id, &batch));
            if result.is_ok() {
                pending.tracks.clear();
            }
            self.finish(video_id, "tracks", pending, result)
        };
        state.prune(video_id);
        result
    }

    fn upsert_counts(&self, video_id: &str, counts: &[VehicleCount]) -> Result<(), SinkError> {
        let mut state = lock(&self.state);
        let pending = self.pending_for(&mut state, video_id);
        for count in counts {
            pending
                .counts
                .insert((count.vehicle_type, count.date), count.clone());
        }
        let result = if pending.counts.is_empty() {
            Ok(())
        } else {
            let batch: Vec<VehicleCount> = pending.counts.values().cloned().collect();
            let result = self
                .write_with_retry(video_id, "counts", || self.inner.upsert_counts(video_id, &batch));
            if result.is_ok() {
                pending.counts.clear();
            }
            self.finish(video_id, "counts", pending, result)
        };
        state.prune(video_id);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compliance::domain::records::TrackStatus;
    use std::collections::VecDeque;
    use std::sync::Arc;

    #[derive(Clone, Copy)]
    enum Outcome {
        Ok,
        Fail,
        Permanent,
    }

    /// Replays scripted outcomes, then succeeds; records accepted batches.
    struct ScriptedSink {
        outcomes: Mutex<VecDeque<Outcome>>,
        accepted: Arc<Mutex<Vec<Vec<TrackRecord>>>>,
    }

    impl ScriptedSink {
        fn new(outcomes: &[Outcome]) -> (Self, Arc<Mutex<Vec<Vec<TrackRecord>>>>) {
            let accepted = Arc::new(Mutex::new(Vec::new()));
            let sink = Self {
                outcomes: Mutex::new(outcomes.iter().copied().collect()),
                accepted: accepted.clone(),
            };
            (sink, accepted)
        }

        fn next(&self) -> Result<(), SinkError> {
            match self.outcomes.lock().unwrap().pop_front().unwrap_or(Outcome::Ok) {
                Outcome::Ok => Ok(()),
                Outcome::Fail => Err(SinkError::Unavailable("offline".into())),
                Outcome::Permanent => Err(SinkError::PermanentlyUnavailable("gone".into())),
            }
        }
    }

    impl PersistenceSink for ScriptedSink {
        fn upsert_tracks(&self, _video_id: &str, tracks: &[TrackRecord]) -> Result<(), SinkError> {
            self.next()?;
            self.accepted.lock().unwrap().push(tracks.to_vec());
            Ok(())
        }

        fn upsert_counts(&self, _video_id: &str, _counts: &[VehicleCount]) -> Result<(), SinkError> {
            self.next()
        }
    }

    fn record(id: u32) -> TrackRecord {
        TrackRecord {
            track_id: TrackId(id),
            vehicle_type: VehicleType::Car,
            status: TrackStatus::Entered,
            compliance: false,
            entry_time_secs: Some(0.0),
            reaction_time_secs: None,
            exited_before_stop: false,
            first_seen_secs: 0.0,
            date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
        }
    }

    fn ids(batch: &[TrackRecord]) -> Vec<u32> {
        batch.iter().map(|r| r.track_id.0).collect()
    }

    #[test]
    fn test_single_failure_is_retried() {
        let (inner, accepted) = ScriptedSink::new(&[Outcome::Fail]);
        let sink = BufferedSink::new(Box::new(inner), None);
        sink.upsert_tracks("v", &[record(1)]).unwrap();
        assert_eq!(accepted.lock().unwrap().len(), 1);
        assert_eq!(sink.pending_len("v"), 0);
    }

    #[test]
    fn test_buffered_rows_flushed_before_next_write() {
        let (inner, accepted) = ScriptedSink::new(&[Outcome::Fail, Outcome::Fail]);
        let sink = BufferedSink::new(Box::new(inner), None);

        sink.upsert_tracks("v", &[record(1)]).unwrap();
        assert_eq!(sink.pending_len("v"), 1);
        assert!(accepted.lock().unwrap().is_empty());

        sink.upsert_tracks("v", &[record(2)]).unwrap();
        let accepted = accepted.lock().unwrap();
        assert_eq!(accepted.len(), 1);
        assert_eq!(ids(&accepted[0]), vec![1, 2]);
        assert_eq!(sink.pending_len("v"), 0);
    }

    #[test]
    fn test_permanent_failure_is_returned() {
        let (inner, _) = ScriptedSink::new(&[Outcome::Permanent]);
        let sink = BufferedSink::new(Box::new(inner), None);
        let err = sink.upsert_tracks("v", &[record(1)]).unwrap_err();
        assert!(err.is_permanent());
        assert_eq!(sink.pending_len("v"), 1);
    }

    #[test]
    fn test_fallback_file_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let (inner, _) = ScriptedSink::new(&[Outcome::Fail, Outcome::Fail]);
        let sink = BufferedSink::new(Box::new(inner), Some(dir.path().to_path_buf()));
        sink.upsert_tracks("v", &[record(7)]).unwrap();
        let path = dir.path().join("v.pending.json");
        assert!(path.exists());
        drop(sink);

        let (inner, accepted) = ScriptedSink::new(&[]);
        let sink = BufferedSink::new(Box::new(inner), Some(dir.path().to_path_buf()));
        assert_eq!(sink.pending_len("v"), 1);
        sink.upsert_tracks("v", &[record(8)]).unwrap();

        assert_eq!(ids(&accepted.lock().unwrap()[0]), vec![7, 8]);
        assert!(!path.exists());
    }

    #[test]
    fn test_clean_writes_leave_no_backlog_or_file() {
        let dir = tempfile::tempdir().unwrap();
        let (inner, accepted) = ScriptedSink::new(&[]);
        let sink = BufferedSink::new(Box::new(inner), Some(dir.path().to_path_buf()));
        for video in ["a", "b", "c"] {
            sink.upsert_tracks(video, &[record(1)]).unwrap();
            sink.upsert_counts(video, &[]).unwrap();
        }
        assert_eq!(accepted.lock().unwrap().len(), 3);
        assert_eq!(sink.backlog_videos(), 0);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_drained_backlog_is_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let (inner, _) = ScriptedSink::new(&[Outcome::Fail, Outcome::Fail]);
        let sink = BufferedSink::new(Box::new(inner), Some(dir.path().to_path_buf()));
        sink.upsert_tracks("v", &[record(1)]).unwrap();
        assert_eq!(sink.backlog_videos(), 1);

        sink.upsert_tracks("v", &[]).unwrap();
        assert_eq!(sink.backlog_videos(), 0);
        assert!(!dir.path().join("v.pending.json").exists());
    }

    #[test]
    fn test_empty_batch_without_backlog_is_noop() {
        let (inner, accepted) = ScriptedSink::new(&[Outcome::Permanent]);
        let sink = BufferedSink::new(Box::new(inner), None);
        sink.upsert_tracks("v", &[]).unwrap();
        assert!(accepted.lock().unwrap().is_empty());
    }
}
