//! Contracts for the external collaborators of the tracking core.
//!
//! Feature extraction, the BoW vocabulary, place recognition, the
//! two-view and PnP solvers, the nonlinear optimizer, and the background
//! mapping/loop-closing threads are opaque services; the tracker drives
//! them exclusively through these traits. Implementations decide their
//! own interior synchronization — every method takes `&self` so handles
//! can be shared across threads.

use image::GrayImage;
use nalgebra::Vector3;

use crate::features::{BowVector, Descriptor, FeatureVector, KeyPoint};
use crate::geometry::SE3;
use crate::map::types::{KeyFrameId, MapPointId};
use crate::map::Map;
use crate::tracking::frame::Frame;
use crate::tracking::matching::LandmarkView;

use std::sync::Arc;

/// ORB feature extraction over a scale pyramid.
pub trait OrbExtractor: Send + Sync {
    fn extract(&self, image: &GrayImage) -> (Vec<KeyPoint>, Vec<Descriptor>);
}

/// BoW vocabulary: quantizes a descriptor set into the word histogram
/// and the node-grouped feature vector used for guided matching.
pub trait Vocabulary: Send + Sync {
    fn transform(&self, descriptors: &[Descriptor]) -> (BowVector, FeatureVector);
}

/// Inverted-index database of keyframes for place recognition.
pub trait KeyFrameDatabase: Send + Sync {
    fn add(&self, map: &Map, kf: KeyFrameId);
    fn erase(&self, kf: KeyFrameId);
    fn clear(&self);
    /// Keyframes whose BoW overlap with the frame passes the database's
    /// essential-graph filter, best candidates first.
    fn detect_relocalization_candidates(&self, map: &Map, frame: &Frame) -> Vec<KeyFrameId>;
    fn detect_loop_candidates(&self, map: &Map, kf: KeyFrameId, min_score: f32) -> Vec<KeyFrameId>;
}

/// Result of two-view geometric initialization.
#[derive(Debug, Clone)]
pub struct TwoViewGeometry {
    /// Pose of the second view relative to the first (Tcw with the first
    /// view as world origin).
    pub pose: SE3,
    /// Triangulated 3-D point per reference keypoint; meaningful only
    /// where `triangulated` is set.
    pub points: Vec<Vector3<f64>>,
    /// Per reference-keypoint triangulation success, parallel to the
    /// match array handed in.
    pub triangulated: Vec<bool>,
}

/// Monocular two-view initialization solver (homography/fundamental
/// hypothesis selection and triangulation).
pub trait TwoViewInitializer: Send + Sync {
    fn initialize(
        &self,
        reference: &Frame,
        current: &Frame,
        matches: &[i32],
        sigma: f64,
        max_iterations: usize,
    ) -> Option<TwoViewGeometry>;
}

/// RANSAC configuration of a PnP solver.
#[derive(Debug, Clone, Copy)]
pub struct RansacParameters {
    pub probability: f64,
    pub min_inliers: usize,
    pub max_iterations: usize,
    pub min_set: usize,
    pub inlier_ratio: f64,
    /// Squared inlier threshold in sigma units.
    pub sigma2: f64,
}

/// One batch of RANSAC iterations.
#[derive(Debug, Clone)]
pub struct PnpResult {
    /// Estimated pose, when this batch produced one.
    pub pose: Option<SE3>,
    /// True when the solver exhausted its iteration budget.
    pub no_more: bool,
    /// Keypoint-parallel inlier mask for `pose`.
    pub inliers: Vec<bool>,
    pub n_inliers: usize,
}

/// EPnP+RANSAC solver seeded with one frame's 2D-3D correspondences.
pub trait PnpSolver {
    fn set_ransac_parameters(&mut self, params: RansacParameters);
    fn iterate(&mut self, iterations: usize) -> PnpResult;
}

/// Builds one PnP solver per relocalization candidate.
pub trait PnpSolverFactory: Send + Sync {
    fn create(
        &self,
        frame: &Frame,
        matches: &[Option<MapPointId>],
        landmarks: &LandmarkView,
    ) -> Box<dyn PnpSolver>;
}

/// Nonlinear optimization backend.
pub trait Optimizer: Send + Sync {
    /// Motion-only bundle adjustment: refines the frame pose against its
    /// matched landmarks, updates the outlier flags, and returns the
    /// number of inliers.
    fn pose_optimization(&self, frame: &mut Frame, landmarks: &LandmarkView) -> usize;
    /// Full-map bundle adjustment (used by monocular initialization).
    fn global_bundle_adjustment(&self, map: &mut Map, iterations: usize);
}

/// Handle to the local-mapping background thread.
pub trait LocalMapping: Send + Sync {
    fn insert_keyframe(&self, kf: KeyFrameId);
    fn is_stopped(&self) -> bool;
    fn stop_requested(&self) -> bool;
    /// True when the mapper is idle and accepting keyframes.
    fn accept_keyframes(&self) -> bool;
    fn keyframes_in_queue(&self) -> usize;
    /// Lock the mapper against stopping while a keyframe is inserted;
    /// returns false when the mapper is already stopped.
    fn set_not_stop(&self, value: bool) -> bool;
    fn interrupt_ba(&self);
    fn request_reset(&self);
}

/// Handle to the loop-closing background thread.
pub trait LoopClosing: Send + Sync {
    fn insert_keyframe(&self, kf: KeyFrameId);
    fn request_reset(&self);
}

/// The collaborator set the tracker and system are wired with.
#[derive(Clone)]
pub struct Collaborators {
    pub vocabulary: Arc<dyn Vocabulary>,
    pub keyframe_db: Arc<dyn KeyFrameDatabase>,
    pub optimizer: Arc<dyn Optimizer>,
    pub initializer: Arc<dyn TwoViewInitializer>,
    pub pnp_factory: Arc<dyn PnpSolverFactory>,
    pub local_mapping: Arc<dyn LocalMapping>,
    pub loop_closing: Arc<dyn LoopClosing>,
}
