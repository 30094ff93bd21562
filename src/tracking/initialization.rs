//! Map initialization: single-frame for stereo/RGB-D, two-view for
//! monocular.

use tracing::{info, warn};

use crate::map::Map;
use crate::tracking::frame::Frame;
use crate::tracking::matching::search_for_initialization;
use crate::tracking::state::TrackingState;

use super::tracker::Tracker;

/// Minimum keypoints for the stereo/RGB-D single-frame bootstrap.
const MIN_STEREO_INIT_FEATURES: usize = 500;
/// Minimum keypoints to arm / keep the monocular initializer.
const MIN_MONO_INIT_FEATURES: usize = 100;
/// Minimum two-view matches to attempt geometric initialization.
const MIN_MONO_INIT_MATCHES: usize = 100;
/// Two-view solver parameters: measurement sigma and RANSAC budget.
const MONO_INIT_SIGMA: f64 = 1.0;
const MONO_INIT_ITERATIONS: usize = 200;
/// Iterations of the full bundle adjustment after monocular init.
const MONO_INIT_BA_ITERATIONS: usize = 20;

/// State carried between the two monocular initialization phases.
pub(super) struct MonocularInitState {
    pub reference_frame: Frame,
    /// Last matched position per reference keypoint, advanced by each
    /// match attempt to keep the search window centered.
    pub prev_matched: Vec<(f32, f32)>,
}

impl Tracker {
    /// Bootstrap the map from one frame with depth. Every keypoint with
    /// a positive depth becomes a landmark. Returns true when the map
    /// was created.
    pub(super) fn stereo_initialization(&mut self, frame: &mut Frame, map: &mut Map) -> bool {
        if frame.n_features() < MIN_STEREO_INIT_FEATURES {
            return false;
        }

        frame.pose = Some(crate::geometry::SE3::identity());
        // The keyframe must carry BoW so later frames can BoW-match it.
        frame.compute_bow(self.vocabulary.as_ref());

        let kf_id = map.insert_keyframe(frame);
        map.add_origin(kf_id);

        for i in 0..frame.n_features() {
            if frame.depths[i] <= 0.0 {
                continue;
            }
            let pos = frame
                .unproject_stereo(i)
                .expect("positive depth unprojects");
            let mp_id = map.create_map_point(pos, kf_id);
            map.add_observation(kf_id, mp_id, i);
            map.compute_distinctive_descriptor(mp_id);
            map.update_map_point_normal_and_depth(mp_id);
            frame.map_points[i] = Some(mp_id);
        }
        info!(points = map.map_points_in_map(), "map created from stereo frame");

        self.local_mapping.insert_keyframe(kf_id);
        self.record_new_keyframe(frame, kf_id);

        self.local_keyframes = vec![kf_id];
        self.local_points = map.all_map_points();
        map.set_reference_map_points(self.local_points.clone());
        self.ref_keyframe = Some(kf_id);
        frame.ref_keyframe = Some(kf_id);

        self.state = TrackingState::Ok;
        true
    }

    /// Two-phase monocular bootstrap. Phase A snapshots a reference
    /// frame; phase B matches the current frame against it and hands the
    /// pair to the two-view solver. Returns true once the initial map
    /// exists.
    pub(super) fn monocular_initialization(&mut self, frame: &mut Frame, map: &mut Map) -> bool {
        let Some(init) = self.mono_init.as_mut() else {
            // Phase A: arm the initializer when the frame is rich enough.
            if frame.n_features() >= MIN_MONO_INIT_FEATURES {
                let prev_matched = frame.keypoints_un.iter().map(|kp| (kp.x, kp.y)).collect();
                self.mono_init = Some(MonocularInitState {
                    reference_frame: frame.clone(),
                    prev_matched,
                });
                self.last_frame = Some(frame.clone());
            }
            return false;
        };

        // Phase B.
        if frame.n_features() <= MIN_MONO_INIT_FEATURES {
            self.mono_init = None;
            return false;
        }

        let (n_matches, mut matches) =
            search_for_initialization(&init.reference_frame, frame, &mut init.prev_matched, 100.0);
        if n_matches < MIN_MONO_INIT_MATCHES {
            self.mono_init = None;
            return false;
        }

        let Some(geometry) = self.initializer.initialize(
            &init.reference_frame,
            frame,
            &matches,
            MONO_INIT_SIGMA,
            MONO_INIT_ITERATIONS,
        ) else {
            return false;
        };

        // Keep only matches the solver actually triangulated.
        for (i, m) in matches.iter_mut().enumerate() {
            if *m >= 0 && !geometry.triangulated[i] {
                *m = -1;
            }
        }

        init.reference_frame.pose = Some(crate::geometry::SE3::identity());
        frame.pose = Some(geometry.pose);

        self.create_initial_map_monocular(frame, map, &matches, &geometry.points)
    }

    /// Build the initial two-keyframe map, bundle-adjust it, and rescale
    /// so the reference frame's median scene depth is 1.
    fn create_initial_map_monocular(
        &mut self,
        frame: &mut Frame,
        map: &mut Map,
        matches: &[i32],
        points: &[nalgebra::Vector3<f64>],
    ) -> bool {
        let mut init = self.mono_init.take().expect("phase B requires the initializer");

        init.reference_frame.compute_bow(self.vocabulary.as_ref());
        frame.compute_bow(self.vocabulary.as_ref());

        let kf_ini = map.insert_keyframe(&init.reference_frame);
        let kf_cur = map.insert_keyframe(frame);

        for (i, &m) in matches.iter().enumerate() {
            if m < 0 {
                continue;
            }
            let cur_idx = m as usize;
            let mp_id = map.create_map_point(points[i], kf_cur);
            map.add_observation(kf_ini, mp_id, i);
            map.add_observation(kf_cur, mp_id, cur_idx);
            map.compute_distinctive_descriptor(mp_id);
            map.update_map_point_normal_and_depth(mp_id);
            frame.map_points[cur_idx] = Some(mp_id);
            frame.outlier[cur_idx] = false;
        }

        map.update_connections(kf_ini);
        map.update_connections(kf_cur);
        info!(points = map.map_points_in_map(), "monocular map created");

        self.optimizer
            .global_bundle_adjustment(map, MONO_INIT_BA_ITERATIONS);

        // Normalize scale: median scene depth of the reference keyframe
        // becomes 1.
        let median_depth = map.scene_median_depth(kf_ini, 2).unwrap_or(-1.0);
        if median_depth <= 0.0 || map.tracked_map_points(kf_cur, 1) < 100 {
            warn!(median_depth, "wrong monocular initialization, requesting reset");
            self.reset_flag
                .store(true, std::sync::atomic::Ordering::SeqCst);
            return false;
        }
        let inv_median = 1.0 / median_depth;

        let mut cur_pose = map
            .keyframe(kf_cur)
            .expect("just inserted")
            .pose();
        cur_pose.translation *= inv_median;
        map.keyframe_mut(kf_cur)
            .expect("just inserted")
            .set_pose(cur_pose);

        let scaled: Vec<_> = map
            .keyframe(kf_ini)
            .expect("just inserted")
            .map_points()
            .iter()
            .flatten()
            .copied()
            .collect();
        for mp_id in scaled {
            if let Some(mp) = map.map_point_mut(mp_id) {
                let pos = mp.position() * inv_median;
                mp.set_position(pos);
            }
        }

        self.local_mapping.insert_keyframe(kf_ini);
        self.local_mapping.insert_keyframe(kf_cur);

        frame.pose = Some(cur_pose);
        self.record_new_keyframe(frame, kf_cur);
        map.add_origin(kf_ini);

        self.local_keyframes = vec![kf_cur, kf_ini];
        self.local_points = map.all_map_points();
        map.set_reference_map_points(self.local_points.clone());
        self.ref_keyframe = Some(kf_cur);
        frame.ref_keyframe = Some(kf_cur);

        self.state = TrackingState::Ok;
        true
    }
}
