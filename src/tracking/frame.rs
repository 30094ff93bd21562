//! Frame: the transient per-image record the tracker works on.
//!
//! A frame lives exactly one tracker iteration plus one more as the
//! retained "last frame". Construction undistorts the keypoints, fills
//! the bucket grid, and recovers stereo correspondences or depth when the
//! sensor provides them. BoW is computed lazily because most frames never
//! need it.

use image::{ImageBuffer, Luma};
use nalgebra::Vector3;

use crate::camera::CameraModel;
use crate::features::{
    descriptor_distance, BowVector, Descriptor, FeatureGrid, FeatureVector, KeyPoint, ScalePyramid,
};
use crate::geometry::SE3;
use crate::map::map_point::MapPoint;
use crate::map::types::{FrameId, KeyFrameId, MapPointId};

/// Depth map in meters, one value per pixel.
pub type DepthImage = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Hamming cutoff for accepting a stereo left-right match.
const STEREO_MATCH_THRESHOLD: u32 = 100;
/// Minimum accepted stereo disparity in pixels.
const MIN_DISPARITY: f64 = 0.01;

/// Frustum prediction for a map point, filled by
/// [`Frame::is_in_frustum`] and consumed by the projection matchers.
#[derive(Debug, Clone, Copy)]
pub struct Projection {
    pub u: f64,
    pub v: f64,
    /// Predicted right-image x coordinate (stereo only; meaningless for
    /// monocular frames).
    pub right_x: f64,
    pub predicted_level: i32,
    pub view_cos: f64,
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub id: FrameId,
    pub timestamp: f64,

    pub camera: CameraModel,
    pub pyramid: ScalePyramid,

    /// Raw keypoints as reported by the extractor.
    pub keypoints: Vec<KeyPoint>,
    /// Undistorted keypoints, parallel to `keypoints`.
    pub keypoints_un: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,
    /// Right-image x coordinate per keypoint; negative when absent.
    pub right_xs: Vec<f32>,
    /// Depth per keypoint in meters; negative when absent.
    pub depths: Vec<f32>,

    pub bow: Option<BowVector>,
    pub feature_vec: Option<FeatureVector>,

    /// Current pose estimate Tcw; None until a strategy succeeds.
    pub pose: Option<SE3>,

    /// Keypoint-parallel map point associations.
    pub map_points: Vec<Option<MapPointId>>,
    /// Keypoint-parallel outlier flags set by motion-only BA.
    pub outlier: Vec<bool>,

    pub ref_keyframe: Option<KeyFrameId>,

    pub(crate) grid: FeatureGrid,
}

impl Frame {
    fn build(
        id: FrameId,
        timestamp: f64,
        keypoints: Vec<KeyPoint>,
        descriptors: Vec<Descriptor>,
        right_xs: Vec<f32>,
        depths: Vec<f32>,
        camera: CameraModel,
        pyramid: ScalePyramid,
    ) -> Self {
        let keypoints_un: Vec<KeyPoint> = keypoints
            .iter()
            .map(|kp| camera.undistort_keypoint(kp))
            .collect();
        let grid = FeatureGrid::build(&keypoints_un, camera.bounds);
        let n = keypoints.len();
        Self {
            id,
            timestamp,
            camera,
            pyramid,
            keypoints,
            keypoints_un,
            descriptors,
            right_xs,
            depths,
            bow: None,
            feature_vec: None,
            pose: None,
            map_points: vec![None; n],
            outlier: vec![false; n],
            ref_keyframe: None,
            grid,
        }
    }

    /// Frame from a single image: no stereo or depth measurements.
    pub fn new_monocular(
        id: FrameId,
        timestamp: f64,
        keypoints: Vec<KeyPoint>,
        descriptors: Vec<Descriptor>,
        camera: CameraModel,
        pyramid: ScalePyramid,
    ) -> Self {
        let n = keypoints.len();
        Self::build(
            id,
            timestamp,
            keypoints,
            descriptors,
            vec![-1.0; n],
            vec![-1.0; n],
            camera,
            pyramid,
        )
    }

    /// Frame from a rectified stereo pair: left keypoints are matched
    /// against right keypoints along epipolar rows to recover disparity.
    #[allow(clippy::too_many_arguments)]
    pub fn new_stereo(
        id: FrameId,
        timestamp: f64,
        keypoints: Vec<KeyPoint>,
        descriptors: Vec<Descriptor>,
        right_keypoints: &[KeyPoint],
        right_descriptors: &[Descriptor],
        camera: CameraModel,
        pyramid: ScalePyramid,
    ) -> Self {
        let (right_xs, depths) = compute_stereo_matches(
            &keypoints,
            &descriptors,
            right_keypoints,
            right_descriptors,
            &camera,
            &pyramid,
        );
        Self::build(
            id, timestamp, keypoints, descriptors, right_xs, depths, camera, pyramid,
        )
    }

    /// Frame from a registered RGB-D pair: depth is read at each raw
    /// keypoint and a virtual right coordinate is synthesized from it.
    pub fn new_rgbd(
        id: FrameId,
        timestamp: f64,
        keypoints: Vec<KeyPoint>,
        descriptors: Vec<Descriptor>,
        depth_map: &DepthImage,
        camera: CameraModel,
        pyramid: ScalePyramid,
    ) -> Self {
        let mut frame = Self::build(
            id,
            timestamp,
            keypoints,
            descriptors,
            Vec::new(),
            Vec::new(),
            camera,
            pyramid,
        );
        let n = frame.keypoints.len();
        frame.right_xs = vec![-1.0; n];
        frame.depths = vec![-1.0; n];
        for i in 0..n {
            let kp = &frame.keypoints[i];
            let (u, v) = (kp.x.round() as i64, kp.y.round() as i64);
            if u < 0 || v < 0 || u >= depth_map.width() as i64 || v >= depth_map.height() as i64 {
                continue;
            }
            let d = depth_map.get_pixel(u as u32, v as u32).0[0];
            if d > 0.0 {
                frame.depths[i] = d;
                frame.right_xs[i] = frame.keypoints_un[i].x - (frame.camera.bf / d as f64) as f32;
            }
        }
        frame
    }

    pub fn n_features(&self) -> usize {
        self.keypoints.len()
    }

    /// Populate the BoW and feature vectors if not already done.
    pub fn compute_bow(&mut self, vocabulary: &dyn crate::adapters::Vocabulary) {
        if self.bow.is_none() {
            let (bow, feature_vec) = vocabulary.transform(&self.descriptors);
            self.bow = Some(bow);
            self.feature_vec = Some(feature_vec);
        }
    }

    /// Indices of undistorted keypoints within the square of side 2r
    /// centered at (x, y), restricted to [min_level, max_level] when
    /// max_level >= 0.
    pub fn features_in_area(
        &self,
        x: f64,
        y: f64,
        r: f64,
        min_level: i32,
        max_level: i32,
    ) -> Vec<usize> {
        self.grid
            .features_in_area(&self.keypoints_un, x, y, r, min_level, max_level)
    }

    /// Predict whether a map point projects inside the image, lies within
    /// its valid depth range, and is seen from a compatible viewing
    /// angle. On success the returned projection carries the prediction
    /// fields the projection matchers consume.
    pub fn is_in_frustum(&self, mp: &MapPoint, cos_limit: f64) -> Option<Projection> {
        let pose = self.pose?;
        let pos = mp.position();
        let p_cam = pose.transform(&pos);
        if p_cam.z <= 0.0 {
            return None;
        }
        let (u, v) = self.camera.project(&p_cam)?;
        if !self.camera.in_bounds(u, v) {
            return None;
        }

        let po = pos - pose.center();
        let dist = po.norm();
        if dist < mp.min_distance_invariance() || dist > mp.max_distance_invariance() {
            return None;
        }

        let view_cos = po.dot(&mp.normal()) / dist;
        if view_cos < cos_limit {
            return None;
        }

        let predicted_level = mp.predict_scale(dist, &self.pyramid);
        Some(Projection {
            u,
            v,
            right_x: u - self.camera.bf / p_cam.z,
            predicted_level,
            view_cos,
        })
    }

    /// 3-D world point for keypoint `i` when it has depth.
    pub fn unproject_stereo(&self, i: usize) -> Option<Vector3<f64>> {
        let z = self.depths[i] as f64;
        if z <= 0.0 {
            return None;
        }
        let pose = self.pose?;
        let kp = &self.keypoints_un[i];
        let p_cam = self.camera.unproject(kp.x as f64, kp.y as f64, z);
        Some(pose.inverse().transform(&p_cam))
    }

    /// Clear all map-point associations.
    pub fn clear_map_points(&mut self) {
        self.map_points.iter_mut().for_each(|s| *s = None);
    }

    /// Drop outlier associations, resetting their flags. Returns how many
    /// were dropped.
    pub fn discard_outliers(&mut self) -> usize {
        let mut dropped = 0;
        for i in 0..self.map_points.len() {
            if self.map_points[i].is_some() && self.outlier[i] {
                self.map_points[i] = None;
                self.outlier[i] = false;
                dropped += 1;
            }
        }
        dropped
    }
}

/// Match left keypoints to right keypoints along epipolar rows and
/// recover per-keypoint disparity. Rectified input: a match must lie in
/// the same image row up to the scale uncertainty of its pyramid level,
/// and to the left of the left-image coordinate.
fn compute_stereo_matches(
    keypoints: &[KeyPoint],
    descriptors: &[Descriptor],
    right_keypoints: &[KeyPoint],
    right_descriptors: &[Descriptor],
    camera: &CameraModel,
    pyramid: &ScalePyramid,
) -> (Vec<f32>, Vec<f32>) {
    let n = keypoints.len();
    let mut right_xs = vec![-1.0f32; n];
    let mut depths = vec![-1.0f32; n];
    if right_keypoints.is_empty() {
        return (right_xs, depths);
    }

    // Bucket right keypoints by the rows they could match in.
    let n_rows = camera.bounds.3.ceil().max(1.0) as usize;
    let mut row_indices: Vec<Vec<usize>> = vec![Vec::new(); n_rows + 1];
    for (ir, kp) in right_keypoints.iter().enumerate() {
        let level = (kp.octave.max(0) as usize).min(pyramid.n_levels - 1);
        let r = 2.0 * pyramid.scale_factors[level];
        let min_r = (kp.y as f64 - r).floor().max(0.0) as usize;
        let max_r = ((kp.y as f64 + r).ceil() as usize).min(n_rows);
        for row in min_r..=max_r {
            row_indices[row].push(ir);
        }
    }

    // Disparity range: from just above zero out to one focal length
    // (depth >= baseline).
    let max_disparity = camera.bf / camera.baseline.max(1e-9);

    for il in 0..n {
        let kp_l = &keypoints[il];
        let row = kp_l.y.round().max(0.0) as usize;
        if row >= row_indices.len() {
            continue;
        }
        let min_u = kp_l.x as f64 - max_disparity;

        let mut best = (STEREO_MATCH_THRESHOLD + 1, -1.0f64);
        for &ir in &row_indices[row] {
            let kp_r = &right_keypoints[ir];
            if kp_r.octave < kp_l.octave - 1 || kp_r.octave > kp_l.octave + 1 {
                continue;
            }
            let ur = kp_r.x as f64;
            if ur > kp_l.x as f64 || ur < min_u {
                continue;
            }
            let dist = descriptor_distance(&descriptors[il], &right_descriptors[ir]);
            if dist < best.0 {
                best = (dist, ur);
            }
        }
        if best.0 <= STEREO_MATCH_THRESHOLD {
            let disparity = kp_l.x as f64 - best.1;
            if disparity >= MIN_DISPARITY && disparity < max_disparity {
                right_xs[il] = best.1 as f32;
                depths[il] = (camera.bf / disparity) as f32;
            }
        }
    }
    (right_xs, depths)
}
