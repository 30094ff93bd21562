//! Pinhole camera model with radial-tangential distortion.
//!
//! Keypoints come in distorted pixel coordinates from the extractor; the
//! tracker works in undistorted coordinates throughout, so the model
//! inverts the distortion by fixed-point iteration and precomputes the
//! undistorted image bounds the feature grid is built over.

use nalgebra::Vector3;

use crate::features::KeyPoint;
use crate::settings::Settings;

/// Iterations of the fixed-point distortion inversion; converges in a
/// handful of steps for the lens models we accept.
const UNDISTORT_ITERATIONS: usize = 10;

#[derive(Debug, Clone)]
pub struct CameraModel {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub inv_fx: f64,
    pub inv_fy: f64,
    /// Stereo baseline times fx (pixel units).
    pub bf: f64,
    /// Stereo baseline in meters, bf / fx.
    pub baseline: f64,
    /// (k1, k2, p1, p2, k3)
    pub distortion: [f64; 5],
    /// Undistorted image bounds: (min_x, min_y, max_x, max_y).
    pub bounds: (f64, f64, f64, f64),
}

impl CameraModel {
    pub fn new(settings: &Settings, image_width: u32, image_height: u32) -> Self {
        let c = &settings.camera;
        let distortion = [c.k1, c.k2, c.p1, c.p2, c.k3];
        let mut model = Self {
            fx: c.fx,
            fy: c.fy,
            cx: c.cx,
            cy: c.cy,
            inv_fx: 1.0 / c.fx,
            inv_fy: 1.0 / c.fy,
            bf: c.bf,
            baseline: if c.fx > 0.0 { c.bf / c.fx } else { 0.0 },
            distortion,
            bounds: (0.0, 0.0, image_width as f64, image_height as f64),
        };
        model.bounds = model.compute_bounds(image_width, image_height);
        model
    }

    fn has_distortion(&self) -> bool {
        self.distortion.iter().any(|d| d.abs() > 0.0)
    }

    /// Undistorted image bounds from the four undistorted corners.
    fn compute_bounds(&self, width: u32, height: u32) -> (f64, f64, f64, f64) {
        if !self.has_distortion() {
            return (0.0, 0.0, width as f64, height as f64);
        }
        let corners = [
            (0.0, 0.0),
            (width as f64, 0.0),
            (0.0, height as f64),
            (width as f64, height as f64),
        ];
        let undistorted: Vec<(f64, f64)> = corners
            .iter()
            .map(|&(x, y)| self.undistort_pixel(x, y))
            .collect();
        let min_x = undistorted[0].0.min(undistorted[2].0);
        let max_x = undistorted[1].0.max(undistorted[3].0);
        let min_y = undistorted[0].1.min(undistorted[1].1);
        let max_y = undistorted[2].1.max(undistorted[3].1);
        (min_x, min_y, max_x, max_y)
    }

    /// Apply the distortion model to normalized camera coordinates.
    fn distort_normalized(&self, x: f64, y: f64) -> (f64, f64) {
        let [k1, k2, p1, p2, k3] = self.distortion;
        let r2 = x * x + y * y;
        let radial = 1.0 + k1 * r2 + k2 * r2 * r2 + k3 * r2 * r2 * r2;
        let xd = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
        let yd = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
        (xd, yd)
    }

    /// Invert the distortion for one pixel by fixed-point iteration.
    pub fn undistort_pixel(&self, u: f64, v: f64) -> (f64, f64) {
        if !self.has_distortion() {
            return (u, v);
        }
        let xd = (u - self.cx) * self.inv_fx;
        let yd = (v - self.cy) * self.inv_fy;
        let (mut x, mut y) = (xd, yd);
        for _ in 0..UNDISTORT_ITERATIONS {
            let (dx, dy) = self.distort_normalized(x, y);
            x += xd - dx;
            y += yd - dy;
        }
        (self.fx * x + self.cx, self.fy * y + self.cy)
    }

    /// Undistort a keypoint, preserving octave and angle.
    pub fn undistort_keypoint(&self, kp: &KeyPoint) -> KeyPoint {
        let (x, y) = self.undistort_pixel(kp.x as f64, kp.y as f64);
        KeyPoint::new(x as f32, y as f32, kp.octave, kp.angle)
    }

    /// Project a point in camera coordinates to undistorted pixels.
    /// Returns None behind the camera.
    pub fn project(&self, p_cam: &Vector3<f64>) -> Option<(f64, f64)> {
        if p_cam.z <= 0.0 {
            return None;
        }
        let inv_z = 1.0 / p_cam.z;
        Some((
            self.fx * p_cam.x * inv_z + self.cx,
            self.fy * p_cam.y * inv_z + self.cy,
        ))
    }

    /// Back-project an undistorted pixel at depth `z` into camera
    /// coordinates.
    pub fn unproject(&self, u: f64, v: f64, z: f64) -> Vector3<f64> {
        Vector3::new((u - self.cx) * self.inv_fx * z, (v - self.cy) * self.inv_fy * z, z)
    }

    pub fn in_bounds(&self, u: f64, v: f64) -> bool {
        let (min_x, min_y, max_x, max_y) = self.bounds;
        u >= min_x && u < max_x && v >= min_y && v < max_y
    }
}
