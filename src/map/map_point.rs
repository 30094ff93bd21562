//! MapPoint: a 3-D landmark observed by keyframes.
//!
//! Map points track which keyframes observe them, carry a representative
//! descriptor for matching, viewing-geometry bounds for frustum checks,
//! and found/visible statistics used by the culling heuristics of the
//! background mapper.

use std::collections::BTreeMap;

use nalgebra::Vector3;

use crate::features::{Descriptor, ScalePyramid};

use super::types::{KeyFrameId, MapPointId};

/// Margin factors applied to the scale-invariance distance bounds when
/// checking whether a point can be observed from a given distance.
const MIN_DISTANCE_MARGIN: f64 = 0.8;
const MAX_DISTANCE_MARGIN: f64 = 1.2;

#[derive(Debug, Clone)]
pub struct MapPoint {
    pub id: MapPointId,

    position: Vector3<f64>,

    /// Representative descriptor: the one with the smallest median
    /// Hamming distance to all other observations.
    descriptor: Descriptor,

    /// Observing keyframe -> keypoint index in that keyframe.
    observations: BTreeMap<KeyFrameId, usize>,

    /// Observation counter; stereo keypoints count twice.
    n_obs: u32,

    /// Mean viewing direction (unit vector, world frame).
    normal: Vector3<f64>,

    /// Scale-invariance distance bounds derived from the reference
    /// keyframe's pyramid level.
    min_distance: f64,
    max_distance: f64,

    /// Times the point was predicted to project into a frame.
    visible: u32,
    /// Times the point was actually matched in a frame.
    found: u32,

    /// Keyframe that created this point.
    ref_keyframe: KeyFrameId,

    bad: bool,

    /// Set when this point was fused into another; always paired with
    /// `bad`.
    replaced_by: Option<MapPointId>,
}

impl MapPoint {
    pub fn new(id: MapPointId, position: Vector3<f64>, ref_keyframe: KeyFrameId) -> Self {
        Self {
            id,
            position,
            descriptor: [0u8; 32],
            observations: BTreeMap::new(),
            n_obs: 0,
            normal: Vector3::zeros(),
            min_distance: 0.0,
            max_distance: f64::INFINITY,
            visible: 1,
            found: 1,
            ref_keyframe,
            bad: false,
            replaced_by: None,
        }
    }

    pub fn position(&self) -> Vector3<f64> {
        self.position
    }

    pub fn set_position(&mut self, position: Vector3<f64>) {
        self.position = position;
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn set_descriptor(&mut self, descriptor: Descriptor) {
        self.descriptor = descriptor;
    }

    pub fn normal(&self) -> Vector3<f64> {
        self.normal
    }

    pub fn ref_keyframe(&self) -> KeyFrameId {
        self.ref_keyframe
    }

    pub fn is_bad(&self) -> bool {
        self.bad
    }

    pub fn replaced_by(&self) -> Option<MapPointId> {
        self.replaced_by
    }

    pub fn observations(&self) -> &BTreeMap<KeyFrameId, usize> {
        &self.observations
    }

    /// Stereo-weighted observation count used by tracking thresholds.
    pub fn n_obs(&self) -> u32 {
        self.n_obs
    }

    pub fn is_observed_by(&self, kf: KeyFrameId) -> bool {
        self.observations.contains_key(&kf)
    }

    /// Record an observation. `stereo` marks a keypoint with a valid
    /// right-image coordinate, which counts double toward `n_obs`.
    pub fn add_observation(&mut self, kf: KeyFrameId, idx: usize, stereo: bool) {
        if self.observations.contains_key(&kf) {
            return;
        }
        self.observations.insert(kf, idx);
        self.n_obs += if stereo { 2 } else { 1 };
    }

    /// Remove an observation. Promotes the first remaining observer to
    /// reference keyframe when the reference is dropped. Returns true
    /// when the point fell below the survivable observation count and
    /// should be marked bad.
    pub fn erase_observation(&mut self, kf: KeyFrameId, stereo: bool) -> bool {
        if self.observations.remove(&kf).is_none() {
            return false;
        }
        self.n_obs = self.n_obs.saturating_sub(if stereo { 2 } else { 1 });
        if self.ref_keyframe == kf {
            if let Some((&first, _)) = self.observations.iter().next() {
                self.ref_keyframe = first;
            }
        }
        self.n_obs <= 2
    }

    /// Tombstone this point: no observations, flagged bad.
    pub(super) fn mark_bad(&mut self) {
        self.observations.clear();
        self.n_obs = 0;
        self.bad = true;
    }

    pub(super) fn mark_replaced(&mut self, by: MapPointId) {
        self.mark_bad();
        self.replaced_by = Some(by);
    }

    pub fn increase_visible(&mut self, n: u32) {
        self.visible += n;
    }

    pub fn increase_found(&mut self, n: u32) {
        self.found += n;
    }

    pub fn visible(&self) -> u32 {
        self.visible
    }

    pub fn found(&self) -> u32 {
        self.found
    }

    pub fn found_ratio(&self) -> f64 {
        if self.visible == 0 {
            return 1.0;
        }
        self.found as f64 / self.visible as f64
    }

    /// Distance below which the point cannot be reliably observed.
    pub fn min_distance_invariance(&self) -> f64 {
        MIN_DISTANCE_MARGIN * self.min_distance
    }

    /// Distance above which the point cannot be reliably observed.
    pub fn max_distance_invariance(&self) -> f64 {
        MAX_DISTANCE_MARGIN * self.max_distance
    }

    /// Predicted detection level for a viewing distance.
    pub fn predict_scale(&self, dist: f64, pyramid: &ScalePyramid) -> i32 {
        pyramid.predict_level(self.max_distance, dist)
    }

    /// Install the viewing geometry computed from the current observer
    /// set: mean direction and the distance bounds anchored at the
    /// reference keyframe's detection level.
    pub(crate) fn set_viewing_geometry(
        &mut self,
        normal: Vector3<f64>,
        min_distance: f64,
        max_distance: f64,
    ) {
        self.normal = normal;
        self.min_distance = min_distance;
        self.max_distance = max_distance;
    }
}
