//! The per-frame tracking state machine.
//!
//! One call to [`Tracker::track_frame`] runs a full iteration: map
//! initialization when needed, initial pose estimation (motion model,
//! reference keyframe, or relocalization), local-map refinement, the
//! keyframe decision, and the trajectory log append. The caller holds
//! the map-update lock for the whole call; background threads see the
//! map only between frames.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::adapters::{
    Collaborators, KeyFrameDatabase, LocalMapping, Optimizer, PnpSolverFactory,
    TwoViewInitializer, Vocabulary,
};
use crate::geometry::SE3;
use crate::map::map_point::MapPoint;
use crate::map::types::{KeyFrameId, MapPointId};
use crate::map::Map;
use crate::settings::{Sensor, Settings};

use super::frame::Frame;
use super::initialization::MonocularInitState;
use super::matching::{search_by_bow, search_by_projection_last_frame, LandmarkView};
use super::result::{FailureReason, TrackOutcome, TrajectoryEntry};
use super::state::TrackingState;

pub struct Tracker {
    pub(super) sensor: Sensor,
    pub(super) state: TrackingState,

    pub(super) localization_only: bool,
    /// Localization-only sub-mode: the last frame matched mostly
    /// temporary visual-odometry points instead of the map.
    pub(super) vo_mode: bool,

    pub(super) max_frames: u64,
    pub(super) min_frames: u64,
    /// Close-point depth cutoff in meters.
    pub(super) th_depth: f64,

    /// Constant-velocity motion model: current.Tcw ≈ velocity * last.Tcw.
    pub(super) velocity: Option<SE3>,

    pub(super) last_frame: Option<Frame>,
    pub(super) mono_init: Option<MonocularInitState>,

    pub(super) ref_keyframe: Option<KeyFrameId>,
    pub(super) last_keyframe: Option<KeyFrameId>,
    /// Frame id at the last keyframe insertion.
    pub(super) last_keyframe_frame_id: u64,
    /// Frame id of the last successful relocalization.
    pub(super) last_reloc_frame_id: u64,

    pub(super) local_keyframes: Vec<KeyFrameId>,
    pub(super) local_points: Vec<MapPointId>,
    /// Inliers counted by the last local-map refinement; drives the
    /// keyframe-insertion policy.
    pub(super) matches_inliers: usize,

    /// Per-frame temporary VO landmarks (stereo/RGB-D localization-only).
    /// Owned here, never inserted into the map, never observed by a
    /// keyframe; ids are drawn from the map's generator so frame slots
    /// stay unambiguous.
    pub(super) temporal_points: BTreeMap<MapPointId, MapPoint>,

    pub(super) trajectory: Vec<TrajectoryEntry>,

    /// Shared full-system reset request flag.
    pub(super) reset_flag: Arc<AtomicBool>,

    pub(super) vocabulary: Arc<dyn Vocabulary>,
    pub(super) keyframe_db: Arc<dyn KeyFrameDatabase>,
    pub(super) optimizer: Arc<dyn Optimizer>,
    pub(super) initializer: Arc<dyn TwoViewInitializer>,
    pub(super) pnp_factory: Arc<dyn PnpSolverFactory>,
    pub(super) local_mapping: Arc<dyn LocalMapping>,
}

impl Tracker {
    pub fn new(
        settings: &Settings,
        collaborators: Collaborators,
        reset_flag: Arc<AtomicBool>,
    ) -> Self {
        Self {
            sensor: settings.sensor,
            state: TrackingState::NoImagesYet,
            localization_only: settings.localization_only,
            vo_mode: false,
            max_frames: settings.max_frames(),
            min_frames: settings.min_frames(),
            th_depth: settings.th_depth(),
            velocity: None,
            last_frame: None,
            mono_init: None,
            ref_keyframe: None,
            last_keyframe: None,
            last_keyframe_frame_id: 0,
            last_reloc_frame_id: 0,
            local_keyframes: Vec::new(),
            local_points: Vec::new(),
            matches_inliers: 0,
            temporal_points: BTreeMap::new(),
            trajectory: Vec::new(),
            reset_flag,
            vocabulary: collaborators.vocabulary,
            keyframe_db: collaborators.keyframe_db,
            optimizer: collaborators.optimizer,
            initializer: collaborators.initializer,
            pnp_factory: collaborators.pnp_factory,
            local_mapping: collaborators.local_mapping,
        }
    }

    pub fn state(&self) -> TrackingState {
        self.state
    }

    pub fn reference_keyframe(&self) -> Option<KeyFrameId> {
        self.ref_keyframe
    }

    pub fn last_keyframe(&self) -> Option<KeyFrameId> {
        self.last_keyframe
    }

    pub fn last_frame(&self) -> Option<&Frame> {
        self.last_frame.as_ref()
    }

    pub fn trajectory(&self) -> &[TrajectoryEntry] {
        &self.trajectory
    }

    pub fn local_keyframes(&self) -> &[KeyFrameId] {
        &self.local_keyframes
    }

    pub fn local_map_points(&self) -> &[MapPointId] {
        &self.local_points
    }

    pub fn is_vo_mode(&self) -> bool {
        self.vo_mode
    }

    /// Frame id of the last successful relocalization (0 when none).
    pub fn last_reloc_frame_id(&self) -> u64 {
        self.last_reloc_frame_id
    }

    /// Toggle localization-only mode (no keyframe insertion).
    pub fn set_localization_only(&mut self, value: bool) {
        self.localization_only = value;
    }

    /// Return to the pristine post-reset state. The map itself is
    /// cleared by the system reset path.
    pub fn reset(&mut self) {
        self.state = TrackingState::NoImagesYet;
        self.vo_mode = false;
        self.velocity = None;
        self.last_frame = None;
        self.mono_init = None;
        self.ref_keyframe = None;
        self.last_keyframe = None;
        self.last_keyframe_frame_id = 0;
        self.last_reloc_frame_id = 0;
        self.local_keyframes.clear();
        self.local_points.clear();
        self.matches_inliers = 0;
        self.temporal_points.clear();
        self.trajectory.clear();
    }

    /// Run one tracking iteration. Returns the estimated Tcw, or None
    /// when no pose could be produced this frame.
    ///
    /// The caller must hold the map-update lock for the duration of the
    /// call (the exclusive `&mut Map` encodes that here).
    pub fn track_frame(&mut self, mut frame: Frame, map: &mut Map) -> Option<SE3> {
        if self.state == TrackingState::NoImagesYet {
            self.state = TrackingState::NotInitialized;
        }

        if self.state == TrackingState::NotInitialized {
            let initialized = match self.sensor {
                Sensor::Monocular => self.monocular_initialization(&mut frame, map),
                Sensor::Stereo | Sensor::Rgbd => self.stereo_initialization(&mut frame, map),
            };
            if !initialized {
                return None;
            }
        } else if !self.track_existing(&mut frame, map) {
            // Early loss on a young map: reset requested, nothing logged.
            return None;
        }

        self.log_trajectory(&frame, map);
        let pose = frame.pose;
        self.last_frame = Some(frame);
        pose
    }

    /// The tracking path once a map exists. Returns false when an early
    /// reset was requested.
    fn track_existing(&mut self, frame: &mut Frame, map: &mut Map) -> bool {
        let initial = if !self.localization_only {
            if self.state == TrackingState::Ok {
                // Loop closing may have fused landmarks the last frame
                // still points at.
                self.check_replaced_in_last_frame(map);

                if self.velocity.is_none() || frame.id.0 < self.last_reloc_frame_id + 2 {
                    self.track_reference_keyframe(frame, map)
                } else {
                    let outcome = self.track_with_motion_model(frame, map);
                    if outcome.is_ok() {
                        outcome
                    } else {
                        self.track_reference_keyframe(frame, map)
                    }
                }
            } else {
                self.relocalize(frame, map)
            }
        } else {
            self.track_localization_only(frame, map)
        };

        frame.ref_keyframe = self.ref_keyframe;

        let ok = if self.localization_only && self.vo_mode {
            // Too few map matches to assemble a meaningful local map;
            // keep going on odometry until relocalization recovers.
            initial.is_ok()
        } else {
            initial.is_ok() && self.track_local_map(frame, map)
        };

        debug!(state = ?self.state, outcome = ?initial, inliers = self.matches_inliers, "frame tracked");
        self.state = if ok {
            TrackingState::Ok
        } else {
            TrackingState::Lost
        };

        if ok {
            // Update the constant-velocity model.
            self.velocity = match (self.last_frame.as_ref().and_then(|f| f.pose), frame.pose) {
                (Some(last_pose), Some(pose)) => Some(pose * last_pose.inverse()),
                _ => None,
            };

            // Drop matches to landmarks without observations; the
            // temporary VO points always qualify.
            {
                let view = LandmarkView::with_temporals(map, &self.temporal_points);
                for i in 0..frame.map_points.len() {
                    if let Some(mp_id) = frame.map_points[i] {
                        let orphan = view.get(mp_id).map(|mp| mp.n_obs() < 1).unwrap_or(true);
                        if orphan {
                            frame.map_points[i] = None;
                            frame.outlier[i] = false;
                        }
                    }
                }
            }
            self.temporal_points.clear();

            if self.need_new_keyframe(frame, map) {
                self.create_new_keyframe(frame, map);
            }

            // Outliers may still help bundle adjustment decide, but the
            // next frame must not seed its pose from them.
            frame.discard_outliers();
        }

        if self.state == TrackingState::Lost && map.keyframes_in_map() <= 5 {
            warn!("tracking lost soon after initialization, requesting system reset");
            self.reset_flag.store(true, Ordering::SeqCst);
            return false;
        }

        if frame.ref_keyframe.is_none() {
            frame.ref_keyframe = self.ref_keyframe;
        }
        true
    }

    /// Localization-only strategy selection (4b): relocalize when lost;
    /// otherwise odometry, racing relocalization when in VO mode.
    fn track_localization_only(&mut self, frame: &mut Frame, map: &mut Map) -> TrackOutcome {
        if self.state == TrackingState::Lost {
            return self.relocalize(frame, map);
        }

        if !self.vo_mode {
            if self.velocity.is_some() {
                self.track_with_motion_model(frame, map)
            } else {
                self.track_reference_keyframe(frame, map)
            }
        } else {
            // Run the motion model and relocalization side by side and
            // prefer the relocalization result when it succeeds.
            let mut motion_outcome = TrackOutcome::Failed(FailureReason::NoPrior);
            let mut motion_snapshot = None;
            if self.velocity.is_some() {
                motion_outcome = self.track_with_motion_model(frame, map);
                motion_snapshot = Some((frame.pose, frame.map_points.clone(), frame.outlier.clone()));
            }
            let reloc_outcome = self.relocalize(frame, map);

            if reloc_outcome.is_ok() {
                self.vo_mode = false;
                reloc_outcome
            } else if motion_outcome.is_ok() {
                if let Some((pose, map_points, outlier)) = motion_snapshot {
                    frame.pose = pose;
                    frame.map_points = map_points;
                    frame.outlier = outlier;
                }
                if self.vo_mode {
                    let inliers: Vec<MapPointId> = frame
                        .map_points
                        .iter()
                        .enumerate()
                        .filter(|(i, s)| s.is_some() && !frame.outlier[*i])
                        .filter_map(|(_, s)| *s)
                        .collect();
                    for id in inliers {
                        if let Some(mp) = map.map_point_mut(id) {
                            mp.increase_found(1);
                        } else if let Some(mp) = self.temporal_points.get_mut(&id) {
                            mp.increase_found(1);
                        }
                    }
                }
                motion_outcome
            } else {
                reloc_outcome
            }
        }
    }

    /// BoW-match the current frame against the reference keyframe and
    /// refine from the last frame's pose.
    pub(super) fn track_reference_keyframe(
        &mut self,
        frame: &mut Frame,
        map: &mut Map,
    ) -> TrackOutcome {
        frame.compute_bow(self.vocabulary.as_ref());

        let Some(ref_kf_id) = self.ref_keyframe else {
            return TrackOutcome::Failed(FailureReason::NoPrior);
        };
        let Some(last_pose) = self.last_frame.as_ref().and_then(|f| f.pose) else {
            return TrackOutcome::Failed(FailureReason::NoPrior);
        };

        let (n_matches, matches) = {
            let Some(kf) = map.keyframe(ref_kf_id) else {
                return TrackOutcome::Failed(FailureReason::NoPrior);
            };
            let view = LandmarkView::new(map);
            search_by_bow(kf, frame, &view, 0.7)
        };
        if n_matches < 15 {
            debug!(n_matches, "reference-keyframe tracking: too few BoW matches");
            return TrackOutcome::Failed(FailureReason::TooFewMatches {
                matches: n_matches,
                required: 15,
            });
        }

        frame.map_points = matches;
        frame.pose = Some(last_pose);

        {
            let view = LandmarkView::with_temporals(map, &self.temporal_points);
            self.optimizer.pose_optimization(frame, &view);
        }

        let inliers = self.discard_outliers_and_count(frame, map);
        if inliers >= 10 {
            TrackOutcome::Ok {
                inliers_with_obs: inliers,
            }
        } else {
            TrackOutcome::Failed(FailureReason::TooFewInliers {
                inliers,
                required: 10,
            })
        }
    }

    /// Predict the pose with the constant-velocity model and match the
    /// last frame's landmarks by projection.
    pub(super) fn track_with_motion_model(
        &mut self,
        frame: &mut Frame,
        map: &mut Map,
    ) -> TrackOutcome {
        self.update_last_frame(map);

        let Some(velocity) = self.velocity else {
            return TrackOutcome::Failed(FailureReason::NoPrior);
        };
        let Some(last_pose) = self.last_frame.as_ref().and_then(|f| f.pose) else {
            return TrackOutcome::Failed(FailureReason::NoPrior);
        };
        frame.pose = Some(velocity * last_pose);
        frame.clear_map_points();

        let th = if self.sensor.is_monocular() { 7.0 } else { 15.0 };
        let monocular = self.sensor.is_monocular();
        let mut n_matches = {
            let last = self.last_frame.as_ref().expect("checked above");
            let view = LandmarkView::with_temporals(map, &self.temporal_points);
            search_by_projection_last_frame(frame, last, th, monocular, &view)
        };

        // Motion model clearly violated: retry with a doubled window.
        if n_matches < 20 {
            frame.clear_map_points();
            let last = self.last_frame.as_ref().expect("checked above");
            let view = LandmarkView::with_temporals(map, &self.temporal_points);
            n_matches = search_by_projection_last_frame(frame, last, 2.0 * th, monocular, &view);
        }
        if n_matches < 20 {
            debug!(n_matches, "motion-model tracking: too few projection matches");
            return TrackOutcome::Failed(FailureReason::TooFewMatches {
                matches: n_matches,
                required: 20,
            });
        }

        {
            let view = LandmarkView::with_temporals(map, &self.temporal_points);
            self.optimizer.pose_optimization(frame, &view);
        }

        let dropped = frame.discard_outliers();
        let total_matches = n_matches.saturating_sub(dropped);
        let inliers = self.count_matches_with_observations(frame, map);

        if self.localization_only {
            self.vo_mode = inliers < 10;
            return if total_matches > 20 {
                TrackOutcome::Ok {
                    inliers_with_obs: inliers,
                }
            } else {
                TrackOutcome::Failed(FailureReason::TooFewMatches {
                    matches: total_matches,
                    required: 21,
                })
            };
        }

        if inliers >= 10 {
            TrackOutcome::Ok {
                inliers_with_obs: inliers,
            }
        } else {
            TrackOutcome::Failed(FailureReason::TooFewInliers {
                inliers,
                required: 10,
            })
        }
    }

    /// Re-anchor the last frame's pose to its reference keyframe (which
    /// loop closing may have moved), and in localization-only
    /// stereo/RGB-D create temporary landmarks for the closest features.
    pub(super) fn update_last_frame(&mut self, map: &mut Map) {
        let Some(tlr) = self.trajectory.last().map(|e| e.tcr) else {
            return;
        };
        let last_keyframe_frame_id = self.last_keyframe_frame_id;
        let monocular = self.sensor.is_monocular();
        let localization_only = self.localization_only;
        let th_depth = self.th_depth;

        let Some(last) = self.last_frame.as_mut() else {
            return;
        };
        let Some(ref_kf_id) = last.ref_keyframe else {
            return;
        };
        if let Some(kf) = map.keyframe(ref_kf_id) {
            last.pose = Some(tlr * kf.pose());
        }

        if last_keyframe_frame_id == last.id.0 || monocular || !localization_only {
            return;
        }

        // Sort features by measured depth and make sure the closest ones
        // carry landmarks; all close points, or the 100 closest if there
        // are fewer.
        let mut depth_idx: Vec<(f32, usize)> = last
            .depths
            .iter()
            .enumerate()
            .filter(|(_, &z)| z > 0.0)
            .map(|(i, &z)| (z, i))
            .collect();
        if depth_idx.is_empty() {
            return;
        }
        depth_idx.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let mut n_points = 0usize;
        for (z, i) in depth_idx {
            let needs_point = match last.map_points[i] {
                None => true,
                Some(id) => map
                    .map_point(id)
                    .or_else(|| self.temporal_points.get(&id))
                    .map(|mp| mp.n_obs() < 1)
                    .unwrap_or(true),
            };
            if needs_point {
                if let Some(pos) = last.unproject_stereo(i) {
                    let id = map.alloc_map_point_id();
                    self.temporal_points
                        .insert(id, MapPoint::new(id, pos, ref_kf_id));
                    last.map_points[i] = Some(id);
                    n_points += 1;
                }
            } else {
                n_points += 1;
            }
            if z as f64 > th_depth && n_points > 100 {
                break;
            }
        }
    }

    /// Follow the fusion forward-pointers in the last frame's matches.
    fn check_replaced_in_last_frame(&mut self, map: &Map) {
        let Some(last) = self.last_frame.as_mut() else {
            return;
        };
        for slot in last.map_points.iter_mut() {
            if let Some(id) = *slot {
                if let Some(replacement) = map.map_point(id).and_then(|mp| mp.replaced_by()) {
                    *slot = Some(replacement);
                }
            }
        }
    }

    /// Drop outlier associations and count the retained matches whose
    /// landmark has at least one observation.
    pub(super) fn discard_outliers_and_count(&self, frame: &mut Frame, map: &Map) -> usize {
        frame.discard_outliers();
        self.count_matches_with_observations(frame, map)
    }

    pub(super) fn count_matches_with_observations(&self, frame: &Frame, map: &Map) -> usize {
        let view = LandmarkView::with_temporals(map, &self.temporal_points);
        frame
            .map_points
            .iter()
            .flatten()
            .filter(|id| view.get(**id).map(|mp| mp.n_obs() > 0).unwrap_or(false))
            .count()
    }

    /// Append to the trajectory log; when this frame produced no pose
    /// the previous entry is repeated with the current lost flag.
    fn log_trajectory(&mut self, frame: &Frame, map: &Map) {
        let lost = self.state == TrackingState::Lost;
        if let (Some(pose), Some(ref_kf_id)) = (frame.pose, frame.ref_keyframe) {
            if let Some(kf) = map.keyframe(ref_kf_id) {
                self.trajectory.push(TrajectoryEntry {
                    tcr: pose * kf.pose_inverse(),
                    reference: ref_kf_id,
                    timestamp: frame.timestamp,
                    lost,
                });
                return;
            }
        }
        if let Some(last) = self.trajectory.last().copied() {
            self.trajectory.push(TrajectoryEntry { lost, ..last });
        }
    }

    /// Stamp used by initialization and keyframe creation.
    pub(super) fn record_new_keyframe(&mut self, frame: &Frame, kf_id: KeyFrameId) {
        self.last_keyframe = Some(kf_id);
        self.last_keyframe_frame_id = frame.id.0;
        info!(%kf_id, frame = %frame.id, "new keyframe");
    }
}
