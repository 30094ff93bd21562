//! Global relocalization: recover the pose from the keyframe database
//! after tracking is lost.

use std::collections::BTreeSet;

use tracing::{debug, info};

use crate::adapters::{PnpSolver, RansacParameters};
use crate::map::types::MapPointId;
use crate::map::Map;
use crate::tracking::frame::Frame;
use crate::tracking::matching::{
    search_by_bow, search_by_projection_keyframe, LandmarkView,
};
use crate::tracking::result::{FailureReason, TrackOutcome};

use super::tracker::Tracker;

/// Minimum BoW matches for a candidate to enter RANSAC.
const MIN_CANDIDATE_MATCHES: usize = 15;
/// Inliers required to accept a relocalization.
const MIN_ACCEPT_INLIERS: usize = 50;
/// RANSAC iterations granted to each surviving candidate per round.
const RANSAC_ITERATIONS_PER_ROUND: usize = 5;

struct Candidate {
    kf_id: crate::map::types::KeyFrameId,
    matches: Vec<Option<MapPointId>>,
    solver: Box<dyn PnpSolver>,
    discarded: bool,
}

impl Tracker {
    /// Query the keyframe database for places that look like the current
    /// frame and try to recover the pose from each via EPnP+RANSAC,
    /// guided re-projection, and motion-only BA.
    pub(super) fn relocalize(&mut self, frame: &mut Frame, map: &mut Map) -> TrackOutcome {
        frame.compute_bow(self.vocabulary.as_ref());

        let candidate_ids = self
            .keyframe_db
            .detect_relocalization_candidates(map, frame);
        if candidate_ids.is_empty() {
            return TrackOutcome::Failed(FailureReason::NoCandidates);
        }
        debug!(candidates = candidate_ids.len(), "relocalization candidates");

        // BoW-match each candidate; survivors get a RANSAC solver seeded
        // with their 2D-3D correspondences.
        let mut candidates: Vec<Candidate> = Vec::new();
        let mut alive = 0usize;
        for kf_id in candidate_ids {
            let Some(kf) = map.keyframe(kf_id) else {
                continue;
            };
            if kf.is_bad() {
                continue;
            }
            let view = LandmarkView::new(map);
            let (n_matches, matches) = search_by_bow(kf, frame, &view, 0.75);
            if n_matches < MIN_CANDIDATE_MATCHES {
                continue;
            }
            let mut solver = self.pnp_factory.create(frame, &matches, &view);
            solver.set_ransac_parameters(RansacParameters {
                probability: 0.99,
                min_inliers: 10,
                max_iterations: 300,
                min_set: 4,
                inlier_ratio: 0.5,
                sigma2: 5.991,
            });
            candidates.push(Candidate {
                kf_id,
                matches,
                solver,
                discarded: false,
            });
            alive += 1;
        }

        // Alternate short RANSAC bursts over the surviving candidates
        // until one pose gathers enough inliers.
        while alive > 0 {
            for ci in 0..candidates.len() {
                if candidates[ci].discarded {
                    continue;
                }

                let result = candidates[ci].solver.iterate(RANSAC_ITERATIONS_PER_ROUND);
                if result.no_more {
                    candidates[ci].discarded = true;
                    alive -= 1;
                }
                // A pose computed in the exhausting round still gets its
                // chance at optimization.
                let Some(pose) = result.pose else {
                    continue;
                };

                frame.pose = Some(pose);
                let mut found: BTreeSet<MapPointId> = BTreeSet::new();
                for j in 0..frame.map_points.len() {
                    if j < result.inliers.len() && result.inliers[j] {
                        frame.map_points[j] = candidates[ci].matches[j];
                        if let Some(id) = frame.map_points[j] {
                            found.insert(id);
                        }
                    } else {
                        frame.map_points[j] = None;
                    }
                }

                let mut n_good = {
                    let view = LandmarkView::new(map);
                    self.optimizer.pose_optimization(frame, &view)
                };
                if n_good < 10 {
                    continue;
                }
                for j in 0..frame.map_points.len() {
                    if frame.outlier[j] {
                        frame.map_points[j] = None;
                    }
                }

                // Not confident yet: pull in more of the candidate's
                // landmarks by projection and optimize again.
                if n_good < MIN_ACCEPT_INLIERS {
                    let additional = {
                        let kf = map.keyframe(candidates[ci].kf_id).expect("candidate alive");
                        let view = LandmarkView::new(map);
                        search_by_projection_keyframe(frame, kf, &found, 10.0, 100, &view)
                    };
                    if additional + n_good >= MIN_ACCEPT_INLIERS {
                        n_good = {
                            let view = LandmarkView::new(map);
                            self.optimizer.pose_optimization(frame, &view)
                        };
                        // Close but not there: one narrow re-match.
                        if n_good > 30 && n_good < MIN_ACCEPT_INLIERS {
                            found.clear();
                            for slot in frame.map_points.iter().flatten() {
                                found.insert(*slot);
                            }
                            let additional = {
                                let kf =
                                    map.keyframe(candidates[ci].kf_id).expect("candidate alive");
                                let view = LandmarkView::new(map);
                                search_by_projection_keyframe(frame, kf, &found, 3.0, 64, &view)
                            };
                            if n_good + additional >= MIN_ACCEPT_INLIERS {
                                n_good = {
                                    let view = LandmarkView::new(map);
                                    self.optimizer.pose_optimization(frame, &view)
                                };
                                for j in 0..frame.map_points.len() {
                                    if frame.outlier[j] {
                                        frame.map_points[j] = None;
                                    }
                                }
                            }
                        }
                    }
                }

                if n_good >= MIN_ACCEPT_INLIERS {
                    self.last_reloc_frame_id = frame.id.0;
                    info!(kf = %candidates[ci].kf_id, inliers = n_good, "relocalized");
                    return TrackOutcome::Ok {
                        inliers_with_obs: n_good,
                    };
                }
            }
        }

        debug!("relocalization failed");
        TrackOutcome::Failed(FailureReason::NoCandidates)
    }
}
