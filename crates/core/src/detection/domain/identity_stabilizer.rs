//! Bridges short upstream tracker-id discontinuities.
//!
//! When the external tracker loses an object for a few frames it usually
//! comes back under a fresh id. A never-seen raw id is therefore matched to
//! a nearby stable track that has not been claimed in the current frame;
//! only if none is close enough does it start a new stable track.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::shared::constants::{
    DEFAULT_IDENTITY_HISTORY_LENGTH, DEFAULT_IDENTITY_MATCH_DISTANCE, DEFAULT_IDENTITY_MAX_AGE,
};
use crate::shared::detection::{Detection, TrackId};
use crate::shared::geometry::Point;

/// A detection with its rectified position, before identity resolution.
#[derive(Clone, Debug, PartialEq)]
pub struct Observation {
    pub detection: Detection,
    pub position: Point,
}

/// A detection resolved to its stable track.
#[derive(Clone, Debug, PartialEq)]
pub struct StabilizedDetection {
    pub track_id: TrackId,
    pub detection: Detection,
    pub position: Point,
}

#[derive(Debug, Default)]
pub struct StabilizerOutput {
    pub assigned: Vec<StabilizedDetection>,
    /// Stable ids unseen for longer than the max age, removed this frame.
    pub expired: Vec<TrackId>,
}

#[derive(Clone, Debug)]
struct StableTrack {
    history: VecDeque<Point>,
    last_seen: usize,
}

pub struct IdentityStabilizer {
    raw_to_stable: HashMap<u32, TrackId>,
    tracks: HashMap<TrackId, StableTrack>,
    /// Every stable id ever handed out, live or expired. Ids are never reused.
    issued: HashSet<TrackId>,
    match_distance: f64,
    history_length: usize,
    max_age: usize,
    frame: usize,
    next_free: u32,
}

impl IdentityStabilizer {
    pub fn new(match_distance: f64, history_length: usize, max_age: usize) -> Self {
        Self {
            raw_to_stable: HashMap::new(),
            tracks: HashMap::new(),
            issued: HashSet::new(),
            match_distance,
            history_length: history_length.max(1),
            max_age,
            frame: 0,
            next_free: 0,
        }
    }

    /// Resolves one frame's observations. Must be called once per frame,
    /// including frames without detections, so unseen tracks age out.
    pub fn update(&mut self, observations: Vec<Observation>) -> StabilizerOutput {
        self.frame += 1;

        let mut claimed: HashSet<TrackId> = HashSet::new();
        let mut resolved: Vec<Option<TrackId>> = vec![None; observations.len()];

        self.claim_known(&observations, &mut resolved, &mut claimed);
        self.resolve_unknown(&observations, &mut resolved, &mut claimed);

        let mut assigned = Vec::with_capacity(observations.len());
        for (obs, id) in observations.into_iter().zip(resolved) {
            let Some(track_id) = id else { continue };
            self.record_position(track_id, obs.position);
            assigned.push(StabilizedDetection {
                track_id,
                detection: obs.detection,
                position: obs.position,
            });
        }

        StabilizerOutput {
            assigned,
            expired: self.expire_stale(),
        }
    }

    /// Recent rectified positions of a stable track, oldest first.
    pub fn history(&self, track_id: TrackId) -> Option<impl Iterator<Item = &Point> + '_> {
        self.tracks.get(&track_id).map(|t| t.history.iter())
    }

    pub fn stable_id_of(&self, raw_id: u32) -> Option<TrackId> {
        self.raw_to_stable.get(&raw_id).copied()
    }

    pub fn live_tracks(&self) -> usize {
        self.tracks.len()
    }

    /// Raw ids with an existing mapping keep their stable id, first come
    /// first served. A second claimant falls through to matching.
    fn claim_known(
        &self,
        observations: &[Observation],
        resolved: &mut [Option<TrackId>],
        claimed: &mut HashSet<TrackId>,
    ) {
        for (i, obs) in observations.iter().enumerate() {
            if let Some(&stable) = self.raw_to_stable.get(&obs.detection.tracker_id) {
                if self.tracks.contains_key(&stable) && claimed.insert(stable) {
                    resolved[i] = Some(stable);
                }
            }
        }
    }

    fn resolve_unknown(
        &mut self,
        observations: &[Observation],
        resolved: &mut [Option<TrackId>],
        claimed: &mut HashSet<TrackId>,
    ) {
        for (i, obs) in observations.iter().enumerate() {
            if resolved[i].is_some() {
                continue;
            }
            let raw_id = obs.detection.tracker_id;
            let stable = match self.nearest_unclaimed(&obs.position, claimed) {
                Some(stable) => {
                    log::debug!("Bridged raw tracker id {raw_id} onto track {stable}");
                    stable
                }
                None => self.mint(raw_id),
            };
            self.raw_to_stable.insert(raw_id, stable);
            claimed.insert(stable);
            resolved[i] = Some(stable);
        }
    }

    fn nearest_unclaimed(&self, position: &Point, claimed: &HashSet<TrackId>) -> Option<TrackId> {
        self.tracks
            .iter()
            .filter(|(id, _)| !claimed.contains(id))
            .filter_map(|(id, track)| {
                let latest = track.history.back()?;
                let d = latest.distance(position);
                (d <= self.match_distance).then_some((d, *id))
            })
            .min_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)))
            .map(|(_, id)| id)
    }

    /// Prefers the raw id itself. An id already issued, even to a track that
    /// has since expired, is skipped for one above every issued id.
    fn mint(&mut self, raw_id: u32) -> TrackId {
        let mut id = TrackId(raw_id);
        if self.issued.contains(&id) {
            id = TrackId(self.next_free.max(raw_id.saturating_add(1)));
            while self.issued.contains(&id) && id.0 < u32::MAX {
                id = TrackId(id.0 + 1);
            }
        }
        self.issued.insert(id);
        self.next_free = self.next_free.max(id.0.saturating_add(1));
        self.tracks.insert(
            id,
            StableTrack {
                history: VecDeque::with_capacity(self.history_length),
                last_seen: self.frame,
            },
        );
        id
    }

    fn record_position(&mut self, track_id: TrackId, position: Point) {
        if let Some(track) = self.tracks.get_mut(&track_id) {
            if track.history.len() == self.history_length {
                track.history.pop_front();
            }
            track.history.push_back(position);
            track.last_seen = self.frame;
        }
    }

    fn expire_stale(&mut self) -> Vec<TrackId> {
        let frame = self.frame;
        let max_age = self.max_age;
        let mut expired: Vec<TrackId> = self
            .tracks
            .iter()
            .filter(|(_, t)| frame - t.last_seen > max_age)
            .map(|(id, _)| *id)
            .collect();
        expired.sort();

        for id in &expired {
            self.tracks.remove(id);
        }
        if !expired.is_empty() {
            self.raw_to_stable
                .retain(|_, stable| !expired.contains(stable));
        }
        expired
    }
}

impl Default for IdentityStabilizer {
    fn default() -> Self {
        Self::new(
            DEFAULT_IDENTITY_MATCH_DISTANCE,
            DEFAULT_IDENTITY_HISTORY_LENGTH,
            DEFAULT_IDENTITY_MAX_AGE,
        )
    }
}
