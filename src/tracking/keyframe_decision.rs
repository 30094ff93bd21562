//! Keyframe promotion: the insertion policy and the creation path.

use tracing::debug;

use crate::map::Map;
use crate::tracking::frame::Frame;
use crate::tracking::matching::LandmarkView;

use super::tracker::Tracker;

/// Close-point bookkeeping thresholds: insert when fewer than this many
/// close points are tracked while at least `MIN_UNTRACKED_CLOSE` close
/// points could still be created.
const MIN_TRACKED_CLOSE: usize = 100;
const MIN_UNTRACKED_CLOSE: usize = 70;
/// Upper bound of close landmarks created per new keyframe.
const MAX_CLOSE_POINTS: usize = 100;

impl Tracker {
    /// Decide whether the current frame should become a keyframe.
    pub(super) fn need_new_keyframe(&self, frame: &Frame, map: &Map) -> bool {
        if self.localization_only {
            return false;
        }
        // A loop closure is touching the map.
        if self.local_mapping.is_stopped() || self.local_mapping.stop_requested() {
            return false;
        }

        let n_kfs = map.keyframes_in_map();

        // Right after a relocalization on a mature map, wait.
        if frame.id.0 < self.last_reloc_frame_id + self.max_frames && n_kfs > self.max_frames as usize
        {
            return false;
        }

        // Well-observed landmarks in the reference keyframe.
        let min_obs = if n_kfs <= 2 { 2 } else { 3 };
        let n_ref = self
            .ref_keyframe
            .map(|kf| map.tracked_map_points(kf, min_obs))
            .unwrap_or(0);

        let mapper_idle = self.local_mapping.accept_keyframes();

        // Close points currently tracked vs. close points that could be
        // created from this frame's depth.
        let (mut tracked_close, mut untracked_close) = (0usize, 0usize);
        if self.sensor.has_depth() {
            for i in 0..frame.n_features() {
                let z = frame.depths[i] as f64;
                if z > 0.0 && z < self.th_depth {
                    if frame.map_points[i].is_some() && !frame.outlier[i] {
                        tracked_close += 1;
                    } else {
                        untracked_close += 1;
                    }
                }
            }
        }
        let need_close =
            tracked_close < MIN_TRACKED_CLOSE && untracked_close > MIN_UNTRACKED_CLOSE;

        let mut th_ref_ratio = 0.75;
        if n_kfs < 2 {
            th_ref_ratio = 0.4;
        }
        if self.sensor.is_monocular() {
            th_ref_ratio = 0.9;
        }

        let inliers = self.matches_inliers as f64;
        // 1a: the maximum insertion interval elapsed.
        let c1a = frame.id.0 >= self.last_keyframe_frame_id + self.max_frames;
        // 1b: past the minimum interval and the mapper is idle.
        let c1b = frame.id.0 >= self.last_keyframe_frame_id + self.min_frames && mapper_idle;
        // 1c: tracking is getting weak (depth sensors only).
        let c1c = self.sensor.has_depth() && (inliers < n_ref as f64 * 0.25 || need_close);
        // 2: clearly fewer matches than the reference keyframe, but
        // still enough to be worth promoting.
        let c2 = (inliers < n_ref as f64 * th_ref_ratio || need_close) && inliers > 15.0;

        if !((c1a || c1b || c1c) && c2) {
            return false;
        }
        if mapper_idle {
            return true;
        }
        self.local_mapping.interrupt_ba();
        if self.sensor.is_monocular() {
            false
        } else {
            self.local_mapping.keyframes_in_queue() < 3
        }
    }

    /// Promote the current frame. Depth sensors additionally create
    /// permanent landmarks for the closest unmatched features so the
    /// next frames have something to track.
    pub(super) fn create_new_keyframe(&mut self, frame: &mut Frame, map: &mut Map) {
        if !self.local_mapping.set_not_stop(true) {
            return;
        }

        frame.compute_bow(self.vocabulary.as_ref());
        let kf_id = map.insert_keyframe_with_observations(frame);
        self.ref_keyframe = Some(kf_id);
        frame.ref_keyframe = Some(kf_id);

        if self.sensor.has_depth() {
            let mut depth_idx: Vec<(f32, usize)> = frame
                .depths
                .iter()
                .enumerate()
                .filter(|(_, &z)| z > 0.0)
                .map(|(i, &z)| (z, i))
                .collect();
            depth_idx.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

            let mut n_points = 0usize;
            for (z, i) in depth_idx {
                let needs_point = match frame.map_points[i] {
                    None => true,
                    Some(mp_id) => {
                        let orphan = {
                            let view = LandmarkView::new(map);
                            view.get(mp_id).map(|mp| mp.n_obs() < 1).unwrap_or(true)
                        };
                        if orphan {
                            frame.map_points[i] = None;
                        }
                        orphan
                    }
                };
                if needs_point {
                    if let Some(pos) = frame.unproject_stereo(i) {
                        let mp_id = map.create_map_point(pos, kf_id);
                        map.add_observation(kf_id, mp_id, i);
                        map.compute_distinctive_descriptor(mp_id);
                        map.update_map_point_normal_and_depth(mp_id);
                        frame.map_points[i] = Some(mp_id);
                    }
                }
                n_points += 1;
                if z as f64 > self.th_depth && n_points > MAX_CLOSE_POINTS {
                    break;
                }
            }
            debug!(kf = %kf_id, close_points = n_points, "stereo keyframe augmentation");
        }

        self.local_mapping.insert_keyframe(kf_id);
        self.local_mapping.set_not_stop(false);
        self.record_new_keyframe(frame, kf_id);
    }
}
