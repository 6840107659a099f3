//! Greedy IoU track association.
//!
//! Binds per-frame detections to persistent identifiers: each update
//! matches detections against live tracks by best IoU above the
//! association threshold, refreshes matched tracks, opens new ones for
//! the rest, and retires tracks unseen for `max_age` consecutive updates.
//! Identifiers are stable while an object persists and may be handed out
//! again after its track is retired; callers must not assume global
//! uniqueness over a long run.

use crate::{iou, RawDetection};

const DEFAULT_MAX_AGE: u32 = 30;

struct Track {
    id: i64,
    bbox: [f32; 4],
    misses: u32,
}

pub struct Tracker {
    tracks: Vec<Track>,
    next_id: i64,
    iou_threshold: f32,
    max_age: u32,
}

impl Tracker {
    pub fn new(iou_threshold: f32) -> Self {
        Self {
            tracks: Vec::new(),
            next_id: 1,
            iou_threshold,
            max_age: DEFAULT_MAX_AGE,
        }
    }

    pub fn with_max_age(mut self, max_age: u32) -> Self {
        self.max_age = max_age;
        self
    }

    /// Associate one frame's detections; returns an id per detection in
    /// input order.
    pub fn update(&mut self, detections: &[RawDetection]) -> Vec<i64> {
        let mut claimed = vec![false; self.tracks.len()];
        let mut ids = Vec::with_capacity(detections.len());
        let mut fresh: Vec<Track> = Vec::new();

        for det in detections {
            let mut best: Option<(usize, f32)> = None;
            for (idx, track) in self.tracks.iter().enumerate() {
                if claimed[idx] {
                    continue;
                }
                let overlap = iou(&det.bbox, &track.bbox);
                if overlap < self.iou_threshold {
                    continue;
                }
                if best.map_or(true, |(_, score)| overlap > score) {
                    best = Some((idx, overlap));
                }
            }

            match best {
                Some((idx, _)) => {
                    claimed[idx] = true;
                    self.tracks[idx].bbox = det.bbox;
                    self.tracks[idx].misses = 0;
                    ids.push(self.tracks[idx].id);
                }
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    fresh.push(Track {
                        id,
                        bbox: det.bbox,
                        misses: 0,
                    });
                    ids.push(id);
                }
            }
        }

        // Age out tracks nothing claimed this frame.
        for (idx, track) in self.tracks.iter_mut().enumerate() {
            if !claimed[idx] {
                track.misses += 1;
            }
        }
        let max_age = self.max_age;
        self.tracks.retain(|track| track.misses <= max_age);
        self.tracks.extend(fresh);

        ids
    }

    /// Number of tracks currently considered live.
    pub fn live_tracks(&self) -> usize {
        self.tracks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(bbox: [f32; 4]) -> RawDetection {
        RawDetection {
            bbox,
            score: 0.9,
            class_id: 0,
        }
    }

    #[test]
    fn id_is_stable_across_overlapping_frames() {
        let mut tracker = Tracker::new(0.3);
        let first = tracker.update(&[det([10.0, 10.0, 50.0, 50.0])]);
        let second = tracker.update(&[det([12.0, 11.0, 52.0, 51.0])]);
        assert_eq!(first, vec![1]);
        assert_eq!(second, vec![1]);
    }

    #[test]
    fn disjoint_detection_opens_a_new_track() {
        let mut tracker = Tracker::new(0.3);
        tracker.update(&[det([10.0, 10.0, 50.0, 50.0])]);
        let ids = tracker.update(&[
            det([10.0, 10.0, 50.0, 50.0]),
            det([200.0, 200.0, 240.0, 240.0]),
        ]);
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(tracker.live_tracks(), 2);
    }

    #[test]
    fn track_survives_brief_absence_then_retires() {
        let mut tracker = Tracker::new(0.3).with_max_age(2);
        tracker.update(&[det([10.0, 10.0, 50.0, 50.0])]);

        // Two empty frames: still within max_age, the track may reclaim.
        tracker.update(&[]);
        tracker.update(&[]);
        let ids = tracker.update(&[det([11.0, 10.0, 51.0, 50.0])]);
        assert_eq!(ids, vec![1]);

        // Three empty frames exceed max_age; the object comes back as new.
        tracker.update(&[]);
        tracker.update(&[]);
        tracker.update(&[]);
        let ids = tracker.update(&[det([11.0, 10.0, 51.0, 50.0])]);
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn two_detections_cannot_claim_one_track() {
        let mut tracker = Tracker::new(0.3);
        tracker.update(&[det([10.0, 10.0, 50.0, 50.0])]);
        let ids = tracker.update(&[
            det([10.0, 10.0, 50.0, 50.0]),
            det([11.0, 11.0, 51.0, 51.0]),
        ]);
        assert_eq!(ids[0], 1);
        assert_ne!(ids[1], 1);
    }
}
