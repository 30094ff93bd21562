//! Feature-space primitives shared by frames, keyframes, and matching:
//! keypoints, 256-bit ORB descriptors, the scale pyramid, BoW vectors,
//! and the image-space bucket grid used for radius queries.

use std::collections::BTreeMap;

/// A detected keypoint in image coordinates.
///
/// `octave` is the scale-pyramid level the point was detected at; `angle`
/// is the ORB orientation in degrees, negative when unknown.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyPoint {
    pub x: f32,
    pub y: f32,
    pub octave: i32,
    pub angle: f32,
}

impl KeyPoint {
    pub fn new(x: f32, y: f32, octave: i32, angle: f32) -> Self {
        Self {
            x,
            y,
            octave,
            angle,
        }
    }
}

/// 256-bit binary ORB descriptor.
pub type Descriptor = [u8; 32];

/// Hamming distance between two ORB descriptors.
#[inline]
pub fn descriptor_distance(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x ^ y).count_ones())
        .sum()
}

/// Bag-of-Words vector: word id -> weight. Ordered so database scoring
/// and matching iterate deterministically.
pub type BowVector = BTreeMap<u32, f64>;

/// Feature vector: vocabulary-node id -> descriptor indices assigned to
/// that node. Two images are matched by walking the shared node ids.
pub type FeatureVector = BTreeMap<u32, Vec<usize>>;

/// Geometric scale pyramid shared between the extractor and the tracker.
#[derive(Debug, Clone)]
pub struct ScalePyramid {
    pub n_levels: usize,
    pub scale_factor: f64,
    pub log_scale_factor: f64,
    /// scale_factors[l] = scale_factor^l
    pub scale_factors: Vec<f64>,
    /// level_sigma2[l] = scale_factors[l]^2; weights distance thresholds.
    pub level_sigma2: Vec<f64>,
    pub inv_level_sigma2: Vec<f64>,
}

impl ScalePyramid {
    pub fn new(n_levels: usize, scale_factor: f64) -> Self {
        let scale_factors: Vec<f64> = (0..n_levels)
            .map(|l| scale_factor.powi(l as i32))
            .collect();
        let level_sigma2: Vec<f64> = scale_factors.iter().map(|s| s * s).collect();
        let inv_level_sigma2: Vec<f64> = level_sigma2.iter().map(|s| 1.0 / s).collect();
        Self {
            n_levels,
            scale_factor,
            log_scale_factor: scale_factor.ln(),
            scale_factors,
            level_sigma2,
            inv_level_sigma2,
        }
    }

    /// Predict the pyramid level a landmark at `dist` would be detected
    /// at, given the maximum distance at which it is scale-invariant.
    pub fn predict_level(&self, max_distance: f64, dist: f64) -> i32 {
        if dist <= 0.0 {
            return 0;
        }
        let ratio = max_distance / dist;
        let level = (ratio.ln() / self.log_scale_factor).ceil() as i32;
        level.clamp(0, self.n_levels as i32 - 1)
    }
}

/// Number of grid columns over the undistorted image area.
pub const GRID_COLS: usize = 64;
/// Number of grid rows over the undistorted image area.
pub const GRID_ROWS: usize = 48;

/// 2-D bucket index over undistorted keypoint coordinates, giving O(1)
/// seeding of radius queries.
#[derive(Debug, Clone)]
pub struct FeatureGrid {
    cells: Vec<Vec<usize>>,
    min_x: f64,
    min_y: f64,
    max_x: f64,
    max_y: f64,
    inv_cell_w: f64,
    inv_cell_h: f64,
}

impl FeatureGrid {
    /// Bucket `keypoints` (undistorted) into a grid over the given image
    /// bounds. Keypoints that undistorted outside the bounds are left out.
    pub fn build(keypoints: &[KeyPoint], bounds: (f64, f64, f64, f64)) -> Self {
        let (min_x, min_y, max_x, max_y) = bounds;
        let inv_cell_w = GRID_COLS as f64 / (max_x - min_x);
        let inv_cell_h = GRID_ROWS as f64 / (max_y - min_y);
        let mut grid = Self {
            cells: vec![Vec::new(); GRID_COLS * GRID_ROWS],
            min_x,
            min_y,
            max_x,
            max_y,
            inv_cell_w,
            inv_cell_h,
        };
        for (idx, kp) in keypoints.iter().enumerate() {
            if let Some(cell) = grid.cell_of(kp.x as f64, kp.y as f64) {
                grid.cells[cell].push(idx);
            }
        }
        grid
    }

    fn cell_of(&self, x: f64, y: f64) -> Option<usize> {
        let cx = ((x - self.min_x) * self.inv_cell_w).floor();
        let cy = ((y - self.min_y) * self.inv_cell_h).floor();
        if cx < 0.0 || cy < 0.0 || cx >= GRID_COLS as f64 || cy >= GRID_ROWS as f64 {
            return None;
        }
        Some(cy as usize * GRID_COLS + cx as usize)
    }

    /// Indices of keypoints inside the square of side 2r centered on
    /// (x, y), optionally restricted to a pyramid-level range.
    ///
    /// `keypoints` must be the same slice the grid was built from.
    pub fn features_in_area(
        &self,
        keypoints: &[KeyPoint],
        x: f64,
        y: f64,
        r: f64,
        min_level: i32,
        max_level: i32,
    ) -> Vec<usize> {
        let mut out = Vec::new();
        if r <= 0.0 {
            return out;
        }

        let min_cx = (((x - r - self.min_x) * self.inv_cell_w).floor().max(0.0)) as usize;
        let max_cx =
            (((x + r - self.min_x) * self.inv_cell_w).ceil()).min(GRID_COLS as f64 - 1.0);
        let min_cy = (((y - r - self.min_y) * self.inv_cell_h).floor().max(0.0)) as usize;
        let max_cy =
            (((y + r - self.min_y) * self.inv_cell_h).ceil()).min(GRID_ROWS as f64 - 1.0);
        if max_cx < 0.0 || max_cy < 0.0 || x + r < self.min_x || y + r < self.min_y {
            return out;
        }
        if x - r > self.max_x || y - r > self.max_y {
            return out;
        }
        let (max_cx, max_cy) = (max_cx as usize, max_cy as usize);

        let check_levels = min_level > 0 || max_level >= 0;
        for cy in min_cy..=max_cy {
            for cx in min_cx..=max_cx {
                for &idx in &self.cells[cy * GRID_COLS + cx] {
                    let kp = &keypoints[idx];
                    if check_levels {
                        if kp.octave < min_level {
                            continue;
                        }
                        if max_level >= 0 && kp.octave > max_level {
                            continue;
                        }
                    }
                    let dx = kp.x as f64 - x;
                    let dy = kp.y as f64 - y;
                    if dx.abs() < r && dy.abs() < r {
                        out.push(idx);
                    }
                }
            }
        }
        out
    }
}
