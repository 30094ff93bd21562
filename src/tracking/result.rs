//! Outcomes of the pose-estimation strategies and the trajectory log.

use crate::geometry::SE3;
use crate::map::types::KeyFrameId;
use crate::map::Map;

/// Why a pose-estimation strategy failed. These are values, not errors:
/// the tracker branches on them to pick the next strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// Not enough feature matches to attempt optimization.
    TooFewMatches { matches: usize, required: usize },
    /// Optimization kept too few inliers.
    TooFewInliers { inliers: usize, required: usize },
    /// The keyframe database produced no relocalization candidate that
    /// survived RANSAC.
    NoCandidates,
    /// Preconditions missing (no reference keyframe, no prior pose).
    NoPrior,
}

/// Result of one pose-estimation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackOutcome {
    /// Pose estimated; carries the retained matches to map points with
    /// at least one observation.
    Ok { inliers_with_obs: usize },
    Failed(FailureReason),
}

impl TrackOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, TrackOutcome::Ok { .. })
    }
}

/// One line of the per-frame trajectory log.
///
/// Poses are stored relative to the reference keyframe (`tcr` composed
/// with the keyframe's pose at readout time), so trajectories stay
/// consistent when loop closure rewrites keyframe poses.
#[derive(Debug, Clone, Copy)]
pub struct TrajectoryEntry {
    /// Transform from the reference keyframe's camera to this frame's
    /// camera: Tcr = Tcw · reference.Twc.
    pub tcr: SE3,
    pub reference: KeyFrameId,
    pub timestamp: f64,
    pub lost: bool,
}

/// Reconstruct absolute camera poses (Tcw) from the trajectory log by
/// composing each entry with its reference keyframe's current pose.
/// Culled reference keyframes are walked through via the parent chain
/// and the transform captured when they were erased. Lost entries are
/// skipped.
pub fn recover_trajectory(entries: &[TrajectoryEntry], map: &Map) -> Vec<(f64, SE3)> {
    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        if entry.lost {
            continue;
        }
        let mut trw = SE3::identity();
        let mut kf_id = entry.reference;
        let pose = loop {
            let Some(kf) = map.keyframe(kf_id) else {
                break None;
            };
            if !kf.is_bad() {
                break Some(kf.pose());
            }
            let (Some(tcp), Some(parent)) = (kf.tcp(), kf.parent()) else {
                break None;
            };
            trw = trw * tcp;
            kf_id = parent;
        };
        if let Some(ref_pose) = pose {
            out.push((entry.timestamp, entry.tcr * trw * ref_pose));
        }
    }
    out
}
