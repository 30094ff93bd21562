//! Local-map refinement: assemble the keyframes and landmarks relevant
//! to the current frame, project the unmatched landmarks in, and
//! optimize the pose against all of them.

use std::collections::{BTreeMap, BTreeSet};

use crate::map::types::{KeyFrameId, MapPointId};
use crate::map::Map;
use crate::settings::Sensor;
use crate::tracking::frame::{Frame, Projection};
use crate::tracking::matching::{search_by_projection_local, LandmarkView};

use super::tracker::Tracker;

/// Upper bound on the local keyframe set.
const MAX_LOCAL_KEYFRAMES: usize = 80;
/// Frustum viewing-cosine limit for local-point candidates.
const VIEW_COS_LIMIT: f64 = 0.5;

impl Tracker {
    /// Refine the initial pose estimate against the local map. Returns
    /// false when too few inliers survive (stricter right after a
    /// relocalization).
    pub(super) fn track_local_map(&mut self, frame: &mut Frame, map: &mut Map) -> bool {
        self.update_local_keyframes(frame, map);
        self.update_local_points(map);
        map.set_reference_map_points(self.local_points.clone());
        self.search_local_points(frame, map);

        {
            let view = LandmarkView::with_temporals(map, &self.temporal_points);
            self.optimizer.pose_optimization(frame, &view);
        }

        // Count inliers and update the landmark statistics.
        self.matches_inliers = 0;
        let mut found = Vec::new();
        {
            let view = LandmarkView::with_temporals(map, &self.temporal_points);
            for i in 0..frame.map_points.len() {
                let Some(mp_id) = frame.map_points[i] else {
                    continue;
                };
                if !frame.outlier[i] {
                    found.push(mp_id);
                    if self.localization_only {
                        self.matches_inliers += 1;
                    } else if view.get(mp_id).map(|mp| mp.n_obs() > 0).unwrap_or(false) {
                        self.matches_inliers += 1;
                    }
                } else if self.sensor == Sensor::Stereo {
                    frame.map_points[i] = None;
                }
            }
        }
        for mp_id in found {
            if let Some(mp) = map.map_point_mut(mp_id) {
                mp.increase_found(1);
            } else if let Some(mp) = self.temporal_points.get_mut(&mp_id) {
                mp.increase_found(1);
            }
        }

        // More restrictive shortly after a relocalization.
        if frame.id.0 < self.last_reloc_frame_id + self.max_frames && self.matches_inliers < 50 {
            return false;
        }
        self.matches_inliers >= 30
    }

    /// Rebuild the local keyframe set: every keyframe observing one of
    /// the current matches votes with its share; the heaviest voter
    /// becomes the new reference keyframe. Each seed then contributes up
    /// to one untagged covisibility neighbor, one child, and its parent.
    fn update_local_keyframes(&mut self, frame: &mut Frame, map: &Map) {
        let mut counter: BTreeMap<KeyFrameId, usize> = BTreeMap::new();
        {
            let view = LandmarkView::with_temporals(map, &self.temporal_points);
            for i in 0..frame.map_points.len() {
                let Some(mp_id) = frame.map_points[i] else {
                    continue;
                };
                match view.get(mp_id) {
                    Some(mp) if !mp.is_bad() => {
                        for &kf_id in mp.observations().keys() {
                            *counter.entry(kf_id).or_insert(0) += 1;
                        }
                    }
                    _ => frame.map_points[i] = None,
                }
            }
        }
        if counter.is_empty() {
            return;
        }

        let mut best: (usize, Option<KeyFrameId>) = (0, None);
        let mut local: Vec<KeyFrameId> = Vec::with_capacity(3 * counter.len());
        let mut tagged: BTreeSet<KeyFrameId> = BTreeSet::new();
        for (&kf_id, &count) in &counter {
            let Some(kf) = map.keyframe(kf_id) else {
                continue;
            };
            if kf.is_bad() {
                continue;
            }
            if count > best.0 {
                best = (count, Some(kf_id));
            }
            local.push(kf_id);
            tagged.insert(kf_id);
        }

        let seeds = local.clone();
        for seed in seeds {
            if local.len() > MAX_LOCAL_KEYFRAMES {
                break;
            }
            let Some(kf) = map.keyframe(seed) else {
                continue;
            };
            let alive = |id: &KeyFrameId| map.keyframe(*id).map(|k| !k.is_bad()).unwrap_or(false);

            for neighbor in kf.best_covisibles(10) {
                if alive(&neighbor) && tagged.insert(neighbor) {
                    local.push(neighbor);
                    break;
                }
            }
            for &child in kf.children() {
                if alive(&child) && tagged.insert(child) {
                    local.push(child);
                    break;
                }
            }
            if let Some(parent) = kf.parent() {
                if alive(&parent) && tagged.insert(parent) {
                    local.push(parent);
                }
            }
        }

        if let Some(best_kf) = best.1 {
            self.ref_keyframe = Some(best_kf);
            frame.ref_keyframe = Some(best_kf);
        }
        self.local_keyframes = local;
    }

    /// Local landmarks = union of the local keyframes' map points.
    fn update_local_points(&mut self, map: &Map) {
        let mut seen: BTreeSet<MapPointId> = BTreeSet::new();
        let mut points = Vec::new();
        for &kf_id in &self.local_keyframes {
            let Some(kf) = map.keyframe(kf_id) else {
                continue;
            };
            for &mp_id in kf.map_points().iter().flatten() {
                if seen.insert(mp_id)
                    && map.map_point(mp_id).map(|mp| !mp.is_bad()).unwrap_or(false)
                {
                    points.push(mp_id);
                }
            }
        }
        self.local_points = points;
    }

    /// Project the not-yet-matched local landmarks into the frame and
    /// search for additional associations.
    fn search_local_points(&mut self, frame: &mut Frame, map: &mut Map) {
        let mut seen: BTreeSet<MapPointId> = BTreeSet::new();
        let mut visible: Vec<MapPointId> = Vec::new();

        // Landmarks already matched are not searched again, but they
        // count as visible this frame.
        {
            let view = LandmarkView::with_temporals(map, &self.temporal_points);
            for i in 0..frame.map_points.len() {
                let Some(mp_id) = frame.map_points[i] else {
                    continue;
                };
                match view.get(mp_id) {
                    Some(mp) if !mp.is_bad() => {
                        visible.push(mp_id);
                        seen.insert(mp_id);
                    }
                    _ => frame.map_points[i] = None,
                }
            }
        }

        let mut predictions: Vec<(MapPointId, Projection)> = Vec::new();
        for &mp_id in &self.local_points {
            if seen.contains(&mp_id) {
                continue;
            }
            let Some(mp) = map.map_point(mp_id) else {
                continue;
            };
            if mp.is_bad() {
                continue;
            }
            if let Some(projection) = frame.is_in_frustum(mp, VIEW_COS_LIMIT) {
                visible.push(mp_id);
                predictions.push((mp_id, projection));
            }
        }

        for mp_id in visible {
            if let Some(mp) = map.map_point_mut(mp_id) {
                mp.increase_visible(1);
            } else if let Some(mp) = self.temporal_points.get_mut(&mp_id) {
                mp.increase_visible(1);
            }
        }

        if !predictions.is_empty() {
            // Coarser search right after relocalization; RGB-D depth is
            // noisy enough to warrant a wider window too.
            let th = if frame.id.0 < self.last_reloc_frame_id + 2 {
                5.0
            } else if self.sensor == Sensor::Rgbd {
                3.0
            } else {
                1.0
            };
            let view = LandmarkView::with_temporals(map, &self.temporal_points);
            search_by_projection_local(frame, &predictions, th, 0.8, &view);
        }
    }
}
