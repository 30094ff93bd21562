//! ORB matching against frames, keyframes, and projected landmarks.
//!
//! Four search entry points feed the tracker: window search between the
//! two initialization frames, BoW-guided matching against a keyframe,
//! projection of the last frame's landmarks under the motion model, and
//! projection of local-map or relocalization-candidate landmarks.
//! All of them share the Hamming thresholds, the best/second-best ratio
//! test, and the rotation-consistency histogram.

use std::collections::BTreeMap;

use crate::features::descriptor_distance;
use crate::map::map_point::MapPoint;
use crate::map::types::MapPointId;
use crate::map::{KeyFrame, Map};

use super::frame::{Frame, Projection};

/// Loose Hamming acceptance threshold.
pub const TH_HIGH: u32 = 100;
/// Strict Hamming acceptance threshold.
pub const TH_LOW: u32 = 50;
/// Bins of the rotation-consistency histogram.
const HISTO_LENGTH: usize = 30;

/// Read-only lens over landmarks: the map arena first, then the
/// tracker's per-frame temporary points. Lets the matchers and the
/// optimizer resolve ids without knowing which store owns them.
pub struct LandmarkView<'a> {
    map: &'a Map,
    temporals: Option<&'a BTreeMap<MapPointId, MapPoint>>,
}

impl<'a> LandmarkView<'a> {
    pub fn new(map: &'a Map) -> Self {
        Self {
            map,
            temporals: None,
        }
    }

    pub fn with_temporals(map: &'a Map, temporals: &'a BTreeMap<MapPointId, MapPoint>) -> Self {
        Self {
            map,
            temporals: Some(temporals),
        }
    }

    pub fn get(&self, id: MapPointId) -> Option<&MapPoint> {
        self.map
            .map_point(id)
            .or_else(|| self.temporals.and_then(|t| t.get(&id)))
    }
}

/// Rotation-consistency check: matches vote with the angle difference of
/// their keypoints; only the three most popular bins survive.
struct RotationHistogram {
    bins: Vec<Vec<usize>>,
}

impl RotationHistogram {
    fn new() -> Self {
        Self {
            bins: vec![Vec::new(); HISTO_LENGTH],
        }
    }

    fn push(&mut self, angle_a: f32, angle_b: f32, idx: usize) {
        let mut rot = angle_a - angle_b;
        if rot < 0.0 {
            rot += 360.0;
        }
        let bin = ((rot as f64 * HISTO_LENGTH as f64 / 360.0).round() as usize) % HISTO_LENGTH;
        self.bins[bin].push(idx);
    }

    /// Indices outside the three heaviest bins.
    fn outliers(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..HISTO_LENGTH).collect();
        order.sort_by_key(|&i| std::cmp::Reverse(self.bins[i].len()));
        let (i1, i2, i3) = (order[0], order[1], order[2]);
        // Far less popular bins than the best are dropped entirely.
        let keep2 = self.bins[i2].len() as f64 >= 0.1 * self.bins[i1].len() as f64;
        let keep3 = self.bins[i3].len() as f64 >= 0.1 * self.bins[i1].len() as f64;

        let mut out = Vec::new();
        for (i, bin) in self.bins.iter().enumerate() {
            if i == i1 || (i == i2 && keep2) || (i == i3 && keep3) {
                continue;
            }
            out.extend_from_slice(bin);
        }
        out
    }
}

/// Window search between the two monocular-initialization frames.
///
/// Matches level-0 keypoints of `f1` to level-0 keypoints of `f2` inside
/// a window around the previously matched position. Returns the match
/// count and, per `f1` keypoint, the matched `f2` index (or -1).
pub fn search_for_initialization(
    f1: &Frame,
    f2: &Frame,
    prev_matched: &mut [(f32, f32)],
    window_size: f64,
) -> (usize, Vec<i32>) {
    const NN_RATIO: f64 = 0.9;
    let mut matches12 = vec![-1i32; f1.keypoints_un.len()];
    let mut matched_dist = vec![u32::MAX; f2.keypoints_un.len()];
    let mut matches21 = vec![-1i32; f2.keypoints_un.len()];
    let mut histogram = RotationHistogram::new();
    let mut n_matches = 0usize;

    for i1 in 0..f1.keypoints_un.len() {
        if f1.keypoints_un[i1].octave > 0 {
            continue;
        }
        let (px, py) = prev_matched[i1];
        let candidates = f2.features_in_area(px as f64, py as f64, window_size, 0, 0);
        if candidates.is_empty() {
            continue;
        }

        let d1 = &f1.descriptors[i1];
        let mut best = (u32::MAX, usize::MAX);
        let mut second = u32::MAX;
        for i2 in candidates {
            let dist = descriptor_distance(d1, &f2.descriptors[i2]);
            if matched_dist[i2] <= dist {
                continue;
            }
            if dist < best.0 {
                second = best.0;
                best = (dist, i2);
            } else if dist < second {
                second = dist;
            }
        }

        if best.0 <= TH_LOW && (best.0 as f64) < (second as f64) * NN_RATIO {
            let i2 = best.1;
            // Steal the candidate from a previous, worse match.
            if matches21[i2] >= 0 {
                matches12[matches21[i2] as usize] = -1;
                n_matches -= 1;
            }
            matches12[i1] = i2 as i32;
            matches21[i2] = i1 as i32;
            matched_dist[i2] = best.0;
            n_matches += 1;
            histogram.push(f1.keypoints_un[i1].angle, f2.keypoints_un[i2].angle, i1);
        }
    }

    for i1 in histogram.outliers() {
        if matches12[i1] >= 0 {
            matches21[matches12[i1] as usize] = -1;
            matches12[i1] = -1;
            n_matches -= 1;
        }
    }

    for (i1, &i2) in matches12.iter().enumerate() {
        if i2 >= 0 {
            let kp = &f2.keypoints_un[i2 as usize];
            prev_matched[i1] = (kp.x, kp.y);
        }
    }

    (n_matches, matches12)
}

/// BoW-guided matching of a keyframe's landmarks into a frame.
///
/// Walks the vocabulary nodes both feature vectors share and compares
/// only descriptors assigned to the same node. Returns the match count
/// and, per frame keypoint, the matched landmark.
pub fn search_by_bow(
    kf: &KeyFrame,
    frame: &Frame,
    landmarks: &LandmarkView,
    nn_ratio: f64,
) -> (usize, Vec<Option<MapPointId>>) {
    let mut matches = vec![None; frame.keypoints_un.len()];
    let (Some(kf_fv), Some(frame_fv)) = (&kf.feature_vec, &frame.feature_vec) else {
        return (0, matches);
    };

    let mut histogram = RotationHistogram::new();
    let mut n_matches = 0usize;

    for (node, kf_indices) in kf_fv {
        let Some(frame_indices) = frame_fv.get(node) else {
            continue;
        };
        for &idx_kf in kf_indices {
            let Some(mp_id) = kf.map_point_at(idx_kf) else {
                continue;
            };
            if landmarks.get(mp_id).map(|mp| mp.is_bad()).unwrap_or(true) {
                continue;
            }
            let d_kf = &kf.descriptors[idx_kf];

            let mut best = (u32::MAX, usize::MAX);
            let mut second = u32::MAX;
            for &idx_f in frame_indices {
                if matches[idx_f].is_some() {
                    continue;
                }
                let dist = descriptor_distance(d_kf, &frame.descriptors[idx_f]);
                if dist < best.0 {
                    second = best.0;
                    best = (dist, idx_f);
                } else if dist < second {
                    second = dist;
                }
            }

            if best.0 <= TH_LOW && (best.0 as f64) < nn_ratio * second as f64 {
                matches[best.1] = Some(mp_id);
                n_matches += 1;
                histogram.push(
                    kf.keypoints_un[idx_kf].angle,
                    frame.keypoints_un[best.1].angle,
                    best.1,
                );
            }
        }
    }

    for idx in histogram.outliers() {
        if matches[idx].take().is_some() {
            n_matches -= 1;
        }
    }

    (n_matches, matches)
}

/// Project the last frame's landmarks into the current frame under the
/// motion-model pose and match within a per-level window. Fills the
/// current frame's association array; returns the match count.
pub fn search_by_projection_last_frame(
    current: &mut Frame,
    last: &Frame,
    th: f64,
    monocular: bool,
    landmarks: &LandmarkView,
) -> usize {
    let Some(tcw) = current.pose else {
        return 0;
    };
    let Some(tlw) = last.pose else {
        return 0;
    };
    let twc = tcw.center();
    let tlc = tlw.transform(&twc);
    // Whether the camera moved mostly forward or backward along its
    // optical axis; selects which pyramid levels to search.
    let forward = !monocular && tlc.z > current.camera.baseline;
    let backward = !monocular && -tlc.z > current.camera.baseline;

    let mut histogram = RotationHistogram::new();
    let mut n_matches = 0usize;

    for i in 0..last.map_points.len() {
        let Some(mp_id) = last.map_points[i] else {
            continue;
        };
        if last.outlier[i] {
            continue;
        }
        let Some(mp) = landmarks.get(mp_id) else {
            continue;
        };
        if mp.is_bad() {
            continue;
        }

        let p_cam = tcw.transform(&mp.position());
        let Some((u, v)) = current.camera.project(&p_cam) else {
            continue;
        };
        if !current.camera.in_bounds(u, v) {
            continue;
        }

        let last_octave = last.keypoints[i].octave.max(0);
        let radius = th * current.pyramid.scale_factors[last_octave as usize];
        let candidates = if forward {
            current.features_in_area(u, v, radius, last_octave, -1)
        } else if backward {
            current.features_in_area(u, v, radius, 0, last_octave)
        } else {
            current.features_in_area(u, v, radius, last_octave - 1, last_octave + 1)
        };
        if candidates.is_empty() {
            continue;
        }

        let projected_right = u - current.camera.bf / p_cam.z;
        let descriptor = mp.descriptor();
        let mut best = (u32::MAX, usize::MAX);
        for i2 in candidates {
            // Never steal a slot already backed by a real observation.
            if let Some(existing) = current.map_points[i2] {
                if landmarks
                    .get(existing)
                    .map(|m| m.n_obs() > 0)
                    .unwrap_or(false)
                {
                    continue;
                }
            }
            // Stereo measurement must agree with the predicted disparity.
            if current.right_xs[i2] > 0.0 {
                let er = (projected_right - current.right_xs[i2] as f64).abs();
                if er > radius {
                    continue;
                }
            }
            let dist = descriptor_distance(descriptor, &current.descriptors[i2]);
            if dist < best.0 {
                best = (dist, i2);
            }
        }

        if best.0 <= TH_HIGH {
            current.map_points[best.1] = Some(mp_id);
            n_matches += 1;
            histogram.push(
                last.keypoints_un[i].angle,
                current.keypoints_un[best.1].angle,
                best.1,
            );
        }
    }

    for idx in histogram.outliers() {
        if current.map_points[idx].take().is_some() {
            n_matches -= 1;
        }
    }

    n_matches
}

/// Search radius selector: tight when the point is viewed head-on.
fn radius_by_viewing_cos(view_cos: f64) -> f64 {
    if view_cos > 0.998 {
        2.5
    } else {
        4.0
    }
}

/// Match local-map landmarks into the frame from their frustum
/// predictions. Returns how many new associations were installed.
pub fn search_by_projection_local(
    frame: &mut Frame,
    predictions: &[(MapPointId, Projection)],
    th: f64,
    nn_ratio: f64,
    landmarks: &LandmarkView,
) -> usize {
    let mut n_matches = 0usize;

    for (mp_id, proj) in predictions {
        let Some(mp) = landmarks.get(*mp_id) else {
            continue;
        };
        if mp.is_bad() {
            continue;
        }

        let mut r = radius_by_viewing_cos(proj.view_cos);
        if (th - 1.0).abs() > f64::EPSILON {
            r *= th;
        }
        let level = proj.predicted_level.max(0);
        let radius = r * frame.pyramid.scale_factors[level as usize];
        let candidates = frame.features_in_area(proj.u, proj.v, radius, level - 1, level);
        if candidates.is_empty() {
            continue;
        }

        let descriptor = mp.descriptor();
        let mut best = (u32::MAX, usize::MAX);
        let mut best_level = -1;
        let mut second = u32::MAX;
        let mut second_level = -1;
        for i in candidates {
            if let Some(existing) = frame.map_points[i] {
                if landmarks
                    .get(existing)
                    .map(|m| m.n_obs() > 0)
                    .unwrap_or(false)
                {
                    continue;
                }
            }
            if frame.right_xs[i] > 0.0 {
                let er = (proj.right_x - frame.right_xs[i] as f64).abs();
                if er > radius {
                    continue;
                }
            }
            let dist = descriptor_distance(descriptor, &frame.descriptors[i]);
            if dist < best.0 {
                second = best.0;
                second_level = best_level;
                best = (dist, i);
                best_level = frame.keypoints_un[i].octave;
            } else if dist < second {
                second = dist;
                second_level = frame.keypoints_un[i].octave;
            }
        }

        if best.0 <= TH_HIGH {
            // The ratio test only applies when both candidates sit on the
            // same pyramid level.
            if best_level == second_level && best.0 as f64 > nn_ratio * second as f64 {
                continue;
            }
            frame.map_points[best.1] = Some(*mp_id);
            n_matches += 1;
        }
    }

    n_matches
}

/// Project a relocalization candidate's landmarks into the frame,
/// skipping those already found, and match within `th`-scaled windows
/// under the given Hamming cutoff. Returns new associations.
pub fn search_by_projection_keyframe(
    frame: &mut Frame,
    kf: &KeyFrame,
    already_found: &std::collections::BTreeSet<MapPointId>,
    th: f64,
    hamming_threshold: u32,
    landmarks: &LandmarkView,
) -> usize {
    let Some(tcw) = frame.pose else {
        return 0;
    };
    let ow = tcw.center();

    let mut histogram = RotationHistogram::new();
    let mut n_matches = 0usize;

    for (idx_kf, slot) in kf.map_points().iter().enumerate() {
        let Some(mp_id) = slot else {
            continue;
        };
        if already_found.contains(mp_id) {
            continue;
        }
        let Some(mp) = landmarks.get(*mp_id) else {
            continue;
        };
        if mp.is_bad() {
            continue;
        }

        let pos = mp.position();
        let p_cam = tcw.transform(&pos);
        let Some((u, v)) = frame.camera.project(&p_cam) else {
            continue;
        };
        if !frame.camera.in_bounds(u, v) {
            continue;
        }

        let dist3d = (pos - ow).norm();
        if dist3d < mp.min_distance_invariance() || dist3d > mp.max_distance_invariance() {
            continue;
        }

        let level = mp.predict_scale(dist3d, &frame.pyramid);
        let radius = th * frame.pyramid.scale_factors[level as usize];
        let candidates = frame.features_in_area(u, v, radius, level - 1, level + 1);
        if candidates.is_empty() {
            continue;
        }

        let descriptor = mp.descriptor();
        let mut best = (u32::MAX, usize::MAX);
        for i in candidates {
            if frame.map_points[i].is_some() {
                continue;
            }
            let dist = descriptor_distance(descriptor, &frame.descriptors[i]);
            if dist < best.0 {
                best = (dist, i);
            }
        }

        if best.0 <= hamming_threshold {
            frame.map_points[best.1] = Some(*mp_id);
            n_matches += 1;
            histogram.push(
                kf.keypoints_un[idx_kf].angle,
                frame.keypoints_un[best.1].angle,
                best.1,
            );
        }
    }

    for idx in histogram.outliers() {
        if frame.map_points[idx].take().is_some() {
            n_matches -= 1;
        }
    }

    n_matches
}
