//! Mock collaborators and fixtures for the tracking scenario tests.
//!
//! The mocks are deliberately deterministic: descriptors come from a
//! Reed-Muller-style codebook with pairwise Hamming distance >= 128, so
//! matches happen exactly where a fixture reuses an index and nowhere
//! else.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use nalgebra::Vector3;

use vslam_core::adapters::{
    Collaborators, KeyFrameDatabase, LocalMapping, LoopClosing, Optimizer, OrbExtractor,
    PnpResult, PnpSolver, PnpSolverFactory, RansacParameters, TwoViewGeometry,
    TwoViewInitializer, Vocabulary,
};
use vslam_core::camera::CameraModel;
use vslam_core::features::{BowVector, Descriptor, FeatureVector, KeyPoint, ScalePyramid};
use vslam_core::geometry::SE3;
use vslam_core::map::types::{FrameId, KeyFrameId, MapPointId};
use vslam_core::map::Map;
use vslam_core::settings::Settings;
use vslam_core::tracking::frame::Frame;
use vslam_core::tracking::LandmarkView;

// ─── Descriptor codebook ────────────────────────────────────────────────

/// Descriptor `i` of a 512-word codebook with pairwise distance >= 128:
/// first-order Reed-Muller style, the Hadamard word of the low byte or
/// its complement.
pub fn codebook_descriptor(i: usize) -> Descriptor {
    assert!(i < 512, "codebook holds 512 descriptors");
    let base = (i % 256) as u32;
    let complement = i >= 256;
    let mut d = [0u8; 32];
    for bit in 0..256u32 {
        let mut v = (base & bit).count_ones() & 1;
        if complement {
            v ^= 1;
        }
        if v == 1 {
            d[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }
    d
}

/// A descriptor outside the codebook: all bits set. Its vocabulary node
/// never collides with a codebook node.
pub fn alien_descriptor() -> Descriptor {
    [0xff; 32]
}

// ─── Fixture settings and frames ────────────────────────────────────────

pub fn stereo_settings() -> Settings {
    Settings::from_yaml_str(
        r#"
sensor: stereo
Camera:
  fx: 500.0
  fy: 500.0
  cx: 320.0
  cy: 240.0
  bf: 40.0
  fps: 30.0
ThDepth: 35.0
"#,
    )
    .unwrap()
}

pub fn monocular_settings() -> Settings {
    Settings::from_yaml_str(
        r#"
sensor: monocular
Camera:
  fx: 500.0
  fy: 500.0
  cx: 320.0
  cy: 240.0
  fps: 30.0
"#,
    )
    .unwrap()
}

pub fn camera(settings: &Settings) -> CameraModel {
    CameraModel::new(settings, 640, 480)
}

pub fn pyramid() -> ScalePyramid {
    ScalePyramid::new(8, 1.2)
}

/// A frame from explicit keypoints and descriptors, no depth.
pub fn frame_from_parts(
    settings: &Settings,
    id: u64,
    keypoints: Vec<KeyPoint>,
    descriptors: Vec<Descriptor>,
) -> Frame {
    Frame::new_monocular(
        FrameId(id),
        id as f64 / 30.0,
        keypoints,
        descriptors,
        camera(settings),
        pyramid(),
    )
}

/// Install a depth measurement (and the consistent virtual right-image
/// coordinate) on one keypoint.
pub fn set_depth(frame: &mut Frame, idx: usize, depth: f32) {
    frame.depths[idx] = depth;
    frame.right_xs[idx] = frame.keypoints_un[idx].x - (frame.camera.bf / depth as f64) as f32;
}

/// Keypoints on a grid in the top-left image region, one per codebook
/// index.
pub fn grid_keypoints(n: usize) -> Vec<KeyPoint> {
    (0..n)
        .map(|i| {
            let col = i % 25;
            let row = i / 25;
            KeyPoint::new(10.0 + 12.0 * col as f32, 10.0 + 11.0 * row as f32, 0, 0.0)
        })
        .collect()
}

/// The standard tracking fixture frame: keypoints 0..n of the grid with
/// their codebook descriptors.
pub fn tracking_frame(settings: &Settings, id: u64, n: usize) -> Frame {
    let keypoints = grid_keypoints(n);
    let descriptors = (0..n).map(codebook_descriptor).collect();
    frame_from_parts(settings, id, keypoints, descriptors)
}

/// A frame that matches nothing: keypoints in an empty image region,
/// descriptors outside the codebook.
pub fn garbage_frame(settings: &Settings, id: u64, n: usize) -> Frame {
    let keypoints: Vec<KeyPoint> = (0..n)
        .map(|i| {
            KeyPoint::new(
                400.0 + 10.0 * (i % 20) as f32,
                380.0 + 12.0 * (i / 20) as f32,
                0,
                0.0,
            )
        })
        .collect();
    let descriptors = vec![alien_descriptor(); n];
    frame_from_parts(settings, id, keypoints, descriptors)
}

// ─── Mock extractor ─────────────────────────────────────────────────────

/// Pops one scripted extraction per call.
pub struct MockExtractor {
    pub outputs: Mutex<VecDeque<(Vec<KeyPoint>, Vec<Descriptor>)>>,
}

impl MockExtractor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            outputs: Mutex::new(VecDeque::new()),
        })
    }

    pub fn push(&self, keypoints: Vec<KeyPoint>, descriptors: Vec<Descriptor>) {
        self.outputs.lock().unwrap().push_back((keypoints, descriptors));
    }
}

impl OrbExtractor for MockExtractor {
    fn extract(&self, _image: &image::GrayImage) -> (Vec<KeyPoint>, Vec<Descriptor>) {
        self.outputs
            .lock()
            .unwrap()
            .pop_front()
            .expect("extractor script exhausted")
    }
}

// ─── Mock vocabulary ────────────────────────────────────────────────────

/// Quantizes each descriptor to the node formed by its first four
/// bytes: identical descriptors share a node, codebook descriptors
/// never collide with alien ones.
pub struct MockVocabulary;

impl Vocabulary for MockVocabulary {
    fn transform(&self, descriptors: &[Descriptor]) -> (BowVector, FeatureVector) {
        let mut bow = BowVector::new();
        let mut features = FeatureVector::new();
        for (idx, d) in descriptors.iter().enumerate() {
            let node = u32::from_le_bytes([d[0], d[1], d[2], d[3]]);
            *bow.entry(node).or_insert(0.0) += 1.0;
            features.entry(node).or_default().push(idx);
        }
        (bow, features)
    }
}

// ─── Mock keyframe database ─────────────────────────────────────────────

#[derive(Default)]
pub struct MockDatabase {
    pub added: Mutex<Vec<KeyFrameId>>,
    pub candidates: Mutex<Vec<KeyFrameId>>,
    pub cleared: AtomicUsize,
}

impl MockDatabase {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_candidates(&self, candidates: Vec<KeyFrameId>) {
        *self.candidates.lock().unwrap() = candidates;
    }
}

impl KeyFrameDatabase for MockDatabase {
    fn add(&self, _map: &Map, kf: KeyFrameId) {
        self.added.lock().unwrap().push(kf);
    }

    fn erase(&self, kf: KeyFrameId) {
        self.added.lock().unwrap().retain(|&k| k != kf);
    }

    fn clear(&self) {
        self.added.lock().unwrap().clear();
        self.cleared.fetch_add(1, Ordering::SeqCst);
    }

    fn detect_relocalization_candidates(&self, _map: &Map, _frame: &Frame) -> Vec<KeyFrameId> {
        self.candidates.lock().unwrap().clone()
    }

    fn detect_loop_candidates(
        &self,
        _map: &Map,
        _kf: KeyFrameId,
        _min_score: f32,
    ) -> Vec<KeyFrameId> {
        Vec::new()
    }
}

// ─── Mock optimizer ─────────────────────────────────────────────────────

/// Counts the frame's associations as inliers; a queued behavior can
/// mark the first `n` matched slots as outliers instead.
#[derive(Default)]
pub struct MockOptimizer {
    pub outlier_script: Mutex<VecDeque<usize>>,
    pub pose_calls: AtomicUsize,
    pub gba_calls: AtomicUsize,
}

impl MockOptimizer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_outliers(&self, n: usize) {
        self.outlier_script.lock().unwrap().push_back(n);
    }
}

impl Optimizer for MockOptimizer {
    fn pose_optimization(&self, frame: &mut Frame, _landmarks: &LandmarkView) -> usize {
        self.pose_calls.fetch_add(1, Ordering::SeqCst);
        let outliers = self
            .outlier_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(0);
        let mut marked = 0;
        let mut inliers = 0;
        for i in 0..frame.map_points.len() {
            if frame.map_points[i].is_none() {
                continue;
            }
            if marked < outliers {
                frame.outlier[i] = true;
                marked += 1;
            } else {
                frame.outlier[i] = false;
                inliers += 1;
            }
        }
        inliers
    }

    fn global_bundle_adjustment(&self, _map: &mut Map, _iterations: usize) {
        self.gba_calls.fetch_add(1, Ordering::SeqCst);
    }
}

// ─── Mock two-view initializer ──────────────────────────────────────────

#[derive(Default)]
pub struct MockInitializer {
    pub geometry: Mutex<Option<TwoViewGeometry>>,
}

impl MockInitializer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_geometry(&self, geometry: TwoViewGeometry) {
        *self.geometry.lock().unwrap() = Some(geometry);
    }
}

impl TwoViewInitializer for MockInitializer {
    fn initialize(
        &self,
        _reference: &Frame,
        _current: &Frame,
        _matches: &[i32],
        _sigma: f64,
        _max_iterations: usize,
    ) -> Option<TwoViewGeometry> {
        self.geometry.lock().unwrap().clone()
    }
}

// ─── Mock PnP solver ────────────────────────────────────────────────────

#[derive(Clone)]
pub enum PnpStep {
    /// Produce nothing this round.
    Nothing,
    /// Report RANSAC exhaustion without a pose.
    NoMore,
    /// Produce this pose with every seeded correspondence as inlier.
    Pose(SE3),
}

pub struct MockPnpSolver {
    script: VecDeque<PnpStep>,
    inlier_mask: Vec<bool>,
}

impl PnpSolver for MockPnpSolver {
    fn set_ransac_parameters(&mut self, _params: RansacParameters) {}

    fn iterate(&mut self, _iterations: usize) -> PnpResult {
        let step = self.script.pop_front().unwrap_or(PnpStep::NoMore);
        match step {
            PnpStep::Nothing => PnpResult {
                pose: None,
                no_more: false,
                inliers: Vec::new(),
                n_inliers: 0,
            },
            PnpStep::NoMore => PnpResult {
                pose: None,
                no_more: true,
                inliers: Vec::new(),
                n_inliers: 0,
            },
            PnpStep::Pose(pose) => {
                let n = self.inlier_mask.iter().filter(|&&b| b).count();
                PnpResult {
                    pose: Some(pose),
                    no_more: false,
                    inliers: self.inlier_mask.clone(),
                    n_inliers: n,
                }
            }
        }
    }
}

/// Hands out one scripted solver per `create` call, in order.
#[derive(Default)]
pub struct MockPnpFactory {
    pub scripts: Mutex<VecDeque<Vec<PnpStep>>>,
}

impl MockPnpFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_solver(&self, script: Vec<PnpStep>) {
        self.scripts.lock().unwrap().push_back(script);
    }
}

impl PnpSolverFactory for MockPnpFactory {
    fn create(
        &self,
        _frame: &Frame,
        matches: &[Option<MapPointId>],
        _landmarks: &LandmarkView,
    ) -> Box<dyn PnpSolver> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .expect("pnp solver script exhausted");
        Box::new(MockPnpSolver {
            script: script.into(),
            inlier_mask: matches.iter().map(|m| m.is_some()).collect(),
        })
    }
}

// ─── Mock background threads ────────────────────────────────────────────

pub struct MockLocalMapping {
    pub inserted: Mutex<Vec<KeyFrameId>>,
    pub accept: std::sync::atomic::AtomicBool,
    pub stopped: std::sync::atomic::AtomicBool,
    pub queue_len: AtomicUsize,
    pub reset_order: Mutex<Option<usize>>,
    sequence: Arc<AtomicUsize>,
}

impl MockLocalMapping {
    pub fn new(sequence: Arc<AtomicUsize>) -> Arc<Self> {
        Arc::new(Self {
            inserted: Mutex::new(Vec::new()),
            accept: std::sync::atomic::AtomicBool::new(true),
            stopped: std::sync::atomic::AtomicBool::new(false),
            queue_len: AtomicUsize::new(0),
            reset_order: Mutex::new(None),
            sequence,
        })
    }
}

impl LocalMapping for MockLocalMapping {
    fn insert_keyframe(&self, kf: KeyFrameId) {
        self.inserted.lock().unwrap().push(kf);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn stop_requested(&self) -> bool {
        false
    }

    fn accept_keyframes(&self) -> bool {
        self.accept.load(Ordering::SeqCst)
    }

    fn keyframes_in_queue(&self) -> usize {
        self.queue_len.load(Ordering::SeqCst)
    }

    fn set_not_stop(&self, _value: bool) -> bool {
        !self.is_stopped()
    }

    fn interrupt_ba(&self) {}

    fn request_reset(&self) {
        let order = self.sequence.fetch_add(1, Ordering::SeqCst);
        *self.reset_order.lock().unwrap() = Some(order);
    }
}

pub struct MockLoopClosing {
    pub inserted: Mutex<Vec<KeyFrameId>>,
    pub reset_order: Mutex<Option<usize>>,
    sequence: Arc<AtomicUsize>,
}

impl MockLoopClosing {
    pub fn new(sequence: Arc<AtomicUsize>) -> Arc<Self> {
        Arc::new(Self {
            inserted: Mutex::new(Vec::new()),
            reset_order: Mutex::new(None),
            sequence,
        })
    }
}

impl LoopClosing for MockLoopClosing {
    fn insert_keyframe(&self, kf: KeyFrameId) {
        self.inserted.lock().unwrap().push(kf);
    }

    fn request_reset(&self) {
        let order = self.sequence.fetch_add(1, Ordering::SeqCst);
        *self.reset_order.lock().unwrap() = Some(order);
    }
}

// ─── Harness ────────────────────────────────────────────────────────────

/// All mock handles plus the assembled collaborator set.
pub struct Mocks {
    pub extractor: Arc<MockExtractor>,
    pub database: Arc<MockDatabase>,
    pub optimizer: Arc<MockOptimizer>,
    pub initializer: Arc<MockInitializer>,
    pub pnp: Arc<MockPnpFactory>,
    pub local_mapping: Arc<MockLocalMapping>,
    pub loop_closing: Arc<MockLoopClosing>,
    pub collaborators: Collaborators,
}

pub fn mocks() -> Mocks {
    let sequence = Arc::new(AtomicUsize::new(0));
    let extractor = MockExtractor::new();
    let database = MockDatabase::new();
    let optimizer = MockOptimizer::new();
    let initializer = MockInitializer::new();
    let pnp = MockPnpFactory::new();
    let local_mapping = MockLocalMapping::new(sequence.clone());
    let loop_closing = MockLoopClosing::new(sequence);
    let collaborators = Collaborators {
        vocabulary: Arc::new(MockVocabulary),
        keyframe_db: database.clone(),
        optimizer: optimizer.clone(),
        initializer: initializer.clone(),
        pnp_factory: pnp.clone(),
        local_mapping: local_mapping.clone(),
        loop_closing: loop_closing.clone(),
    };
    Mocks {
        extractor,
        database,
        optimizer,
        initializer,
        pnp,
        local_mapping,
        loop_closing,
        collaborators,
    }
}

/// Two-view geometry fixture: the first `n_triangulated` reference
/// keypoints triangulate to points at the given depths.
pub fn two_view_geometry(
    n_reference: usize,
    n_triangulated: usize,
    depth_of: impl Fn(usize) -> f64,
) -> TwoViewGeometry {
    TwoViewGeometry {
        pose: SE3::from_parts(
            nalgebra::Matrix3::identity(),
            Vector3::new(0.1, 0.0, 0.0),
        ),
        points: (0..n_reference)
            .map(|i| Vector3::new(0.0, 0.0, depth_of(i)))
            .collect(),
        triangulated: (0..n_reference).map(|i| i < n_triangulated).collect(),
    }
}
