//! The map arena and the graph maintenance that spans entities.
//!
//! Operations that touch a single entity live on [`KeyFrame`] and
//! [`MapPoint`]; everything that needs both arenas at once (observation
//! bookkeeping, covisibility recomputation, keyframe culling with
//! spanning-tree re-parenting, landmark fusion) lives here, keyed by id.
//!
//! The map owns the single `map_update` lock at the system level (see
//! [`crate::system`]); holders perform structural mutation only while
//! holding it.

use std::collections::BTreeMap;

use nalgebra::Vector3;
use tracing::debug;

use crate::features::descriptor_distance;
use crate::tracking::frame::Frame;

use super::keyframe::KeyFrame;
use super::map_point::MapPoint;
use super::types::{KeyFrameId, MapPointId};

/// Covisibility edges below this weight are dropped by the from-scratch
/// recompute (the single heaviest edge survives regardless).
const COVISIBILITY_THRESHOLD: u32 = 15;

#[derive(Debug, Default)]
pub struct Map {
    keyframes: BTreeMap<KeyFrameId, KeyFrame>,
    map_points: BTreeMap<MapPointId, MapPoint>,

    /// Informational subset highlighted for rendering.
    reference_map_points: Vec<MapPointId>,

    /// First keyframe of each independent initialization.
    keyframe_origins: Vec<KeyFrameId>,

    next_kf_id: u64,
    next_mp_id: u64,

    /// Bumped on major map changes (loop closures, global BA).
    big_change_idx: u32,
}

impl Map {
    pub fn new() -> Self {
        Self::default()
    }

    // ─── Arena access ───────────────────────────────────────────────────

    pub fn keyframe(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.keyframes.get(&id)
    }

    pub fn keyframe_mut(&mut self, id: KeyFrameId) -> Option<&mut KeyFrame> {
        self.keyframes.get_mut(&id)
    }

    pub fn map_point(&self, id: MapPointId) -> Option<&MapPoint> {
        self.map_points.get(&id)
    }

    pub fn map_point_mut(&mut self, id: MapPointId) -> Option<&mut MapPoint> {
        self.map_points.get_mut(&id)
    }

    /// Non-bad keyframes in id order.
    pub fn all_keyframes(&self) -> Vec<KeyFrameId> {
        self.keyframes
            .values()
            .filter(|kf| !kf.is_bad())
            .map(|kf| kf.id)
            .collect()
    }

    /// Non-bad map points in id order.
    pub fn all_map_points(&self) -> Vec<MapPointId> {
        self.map_points
            .values()
            .filter(|mp| !mp.is_bad())
            .map(|mp| mp.id)
            .collect()
    }

    pub fn keyframes_in_map(&self) -> usize {
        self.keyframes.values().filter(|kf| !kf.is_bad()).count()
    }

    pub fn map_points_in_map(&self) -> usize {
        self.map_points.values().filter(|mp| !mp.is_bad()).count()
    }

    // ─── Creation / removal ─────────────────────────────────────────────

    /// Promote a frame into a new keyframe and take ownership of it.
    pub fn insert_keyframe(&mut self, frame: &Frame) -> KeyFrameId {
        let id = KeyFrameId(self.next_kf_id);
        self.next_kf_id += 1;
        let kf = KeyFrame::from_frame(id, frame);
        self.keyframes.insert(id, kf);
        debug!(%id, frame = %frame.id, "keyframe inserted");
        id
    }

    /// Promote a frame whose map-point slots are already meaningful:
    /// every surviving association is registered as an observation and
    /// the covisibility edges are recomputed. Stale slots are cleared.
    pub fn insert_keyframe_with_observations(&mut self, frame: &Frame) -> KeyFrameId {
        let id = self.insert_keyframe(frame);
        let slots: Vec<(usize, MapPointId)> = frame
            .map_points
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.map(|mp| (i, mp)))
            .collect();
        for (idx, mp_id) in slots {
            let valid = self
                .map_points
                .get(&mp_id)
                .map(|mp| !mp.is_bad())
                .unwrap_or(false);
            if valid {
                self.add_observation(id, mp_id, idx);
                self.compute_distinctive_descriptor(mp_id);
                self.update_map_point_normal_and_depth(mp_id);
            } else if let Some(kf) = self.keyframes.get_mut(&id) {
                kf.erase_map_point_at(idx);
            }
        }
        self.update_connections(id);
        id
    }

    /// Create a landmark owned by this map.
    pub fn create_map_point(
        &mut self,
        position: Vector3<f64>,
        ref_keyframe: KeyFrameId,
    ) -> MapPointId {
        let id = MapPointId(self.next_mp_id);
        self.next_mp_id += 1;
        self.map_points
            .insert(id, MapPoint::new(id, position, ref_keyframe));
        id
    }

    /// Allocate a map-point id without creating an entity. Used for the
    /// per-frame temporary points the tracker owns itself; they must
    /// never collide with arena ids.
    pub fn alloc_map_point_id(&mut self) -> MapPointId {
        let id = MapPointId(self.next_mp_id);
        self.next_mp_id += 1;
        id
    }

    /// Remove a map point from the arena entirely.
    pub fn remove_map_point(&mut self, id: MapPointId) {
        self.map_points.remove(&id);
    }

    /// Remove a keyframe from the arena entirely. Callers normally want
    /// [`set_keyframe_bad`](Self::set_keyframe_bad), which keeps the
    /// tombstone that trajectory recovery walks through.
    pub fn remove_keyframe(&mut self, id: KeyFrameId) {
        self.keyframes.remove(&id);
    }

    // ─── Reference points / origins / change counter ────────────────────

    pub fn set_reference_map_points(&mut self, points: Vec<MapPointId>) {
        self.reference_map_points = points;
    }

    pub fn reference_map_points(&self) -> &[MapPointId] {
        &self.reference_map_points
    }

    pub fn add_origin(&mut self, kf: KeyFrameId) {
        self.keyframe_origins.push(kf);
    }

    pub fn origins(&self) -> &[KeyFrameId] {
        &self.keyframe_origins
    }

    pub fn inform_big_change(&mut self) {
        self.big_change_idx += 1;
    }

    pub fn big_change_index(&self) -> u32 {
        self.big_change_idx
    }

    /// Drop everything and reset the id generators.
    pub fn clear(&mut self) {
        self.keyframes.clear();
        self.map_points.clear();
        self.reference_map_points.clear();
        self.keyframe_origins.clear();
        self.next_kf_id = 0;
        self.next_mp_id = 0;
    }

    // ─── Observation bookkeeping ────────────────────────────────────────

    /// Link keyframe slot `idx` and the map point both ways.
    pub fn add_observation(&mut self, kf_id: KeyFrameId, mp_id: MapPointId, idx: usize) {
        let Some(kf) = self.keyframes.get_mut(&kf_id) else {
            return;
        };
        let stereo = kf.is_stereo(idx);
        kf.add_map_point(mp_id, idx);
        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.add_observation(kf_id, idx, stereo);
        }
    }

    /// Undo the link from both sides. Marks the point bad when it drops
    /// below the survivable observation count.
    pub fn erase_observation(&mut self, kf_id: KeyFrameId, mp_id: MapPointId) {
        let mut below_min = false;
        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            if let Some(&idx) = mp.observations().get(&kf_id) {
                let stereo = self
                    .keyframes
                    .get(&kf_id)
                    .map(|kf| kf.is_stereo(idx))
                    .unwrap_or(false);
                below_min = mp.erase_observation(kf_id, stereo);
                if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                    kf.erase_map_point_at(idx);
                }
            }
        }
        if below_min {
            self.set_map_point_bad(mp_id);
        }
    }

    /// Tombstone a landmark: clear every keyframe slot pointing at it and
    /// empty its observation set.
    pub fn set_map_point_bad(&mut self, mp_id: MapPointId) {
        let Some(mp) = self.map_points.get_mut(&mp_id) else {
            return;
        };
        let observations: Vec<(KeyFrameId, usize)> =
            mp.observations().iter().map(|(&k, &i)| (k, i)).collect();
        mp.mark_bad();
        for (kf_id, idx) in observations {
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                kf.erase_map_point_at(idx);
            }
        }
    }

    /// Fuse `old` into `new`: move observations over, merge the found /
    /// visible statistics, tombstone `old` with a forward pointer.
    pub fn replace_map_point(&mut self, old: MapPointId, new: MapPointId) {
        if old == new {
            return;
        }
        let Some(old_mp) = self.map_points.get(&old) else {
            return;
        };
        if !self.map_points.contains_key(&new) {
            return;
        }
        let observations: Vec<(KeyFrameId, usize)> =
            old_mp.observations().iter().map(|(&k, &i)| (k, i)).collect();
        let visible = old_mp.visible();
        let found = old_mp.found();

        if let Some(old_mp) = self.map_points.get_mut(&old) {
            old_mp.mark_replaced(new);
        }

        for (kf_id, idx) in observations {
            let already_observed = self
                .map_points
                .get(&new)
                .map(|mp| mp.is_observed_by(kf_id))
                .unwrap_or(true);
            let Some(kf) = self.keyframes.get_mut(&kf_id) else {
                continue;
            };
            if already_observed {
                kf.erase_map_point_at(idx);
            } else {
                let stereo = kf.is_stereo(idx);
                kf.replace_map_point_at(idx, new);
                if let Some(mp) = self.map_points.get_mut(&new) {
                    mp.add_observation(kf_id, idx, stereo);
                }
            }
        }

        if let Some(mp) = self.map_points.get_mut(&new) {
            mp.increase_visible(visible);
            mp.increase_found(found);
        }
        self.compute_distinctive_descriptor(new);
    }

    // ─── Landmark refresh ───────────────────────────────────────────────

    /// Choose the descriptor minimizing the median Hamming distance to
    /// all other observers' descriptors.
    pub fn compute_distinctive_descriptor(&mut self, mp_id: MapPointId) {
        let Some(mp) = self.map_points.get(&mp_id) else {
            return;
        };
        if mp.is_bad() {
            return;
        }
        let mut descriptors = Vec::new();
        for (&kf_id, &idx) in mp.observations() {
            if let Some(kf) = self.keyframes.get(&kf_id) {
                if !kf.is_bad() {
                    descriptors.push(kf.descriptors[idx]);
                }
            }
        }
        if descriptors.is_empty() {
            return;
        }

        let n = descriptors.len();
        let mut best = (u32::MAX, 0usize);
        for i in 0..n {
            let mut dists: Vec<u32> = (0..n)
                .map(|j| descriptor_distance(&descriptors[i], &descriptors[j]))
                .collect();
            dists.sort_unstable();
            let median = dists[(n - 1) / 2];
            if median < best.0 {
                best = (median, i);
            }
        }
        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.set_descriptor(descriptors[best.1]);
        }
    }

    /// Recompute the mean viewing direction and the scale-invariance
    /// distance bounds from the reference keyframe's pyramid level.
    pub fn update_map_point_normal_and_depth(&mut self, mp_id: MapPointId) {
        let Some(mp) = self.map_points.get(&mp_id) else {
            return;
        };
        if mp.is_bad() || mp.observations().is_empty() {
            return;
        }
        let position = mp.position();
        let ref_kf_id = mp.ref_keyframe();
        let Some(&ref_idx) = mp.observations().get(&ref_kf_id) else {
            return;
        };

        let mut normal = Vector3::zeros();
        let mut n = 0u32;
        for &kf_id in mp.observations().keys() {
            if let Some(kf) = self.keyframes.get(&kf_id) {
                let dir = position - kf.camera_center();
                let norm = dir.norm();
                if norm > 1e-12 {
                    normal += dir / norm;
                    n += 1;
                }
            }
        }
        if n == 0 {
            return;
        }

        let Some(ref_kf) = self.keyframes.get(&ref_kf_id) else {
            return;
        };
        let dist = (position - ref_kf.camera_center()).norm();
        let level = ref_kf.keypoints_un[ref_idx].octave.max(0) as usize;
        let level_scale = ref_kf.pyramid.scale_factors[level.min(ref_kf.pyramid.n_levels - 1)];
        let max_distance = dist * level_scale;
        let min_distance =
            max_distance / ref_kf.pyramid.scale_factors[ref_kf.pyramid.n_levels - 1];

        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.set_viewing_geometry(normal / n as f64, min_distance, max_distance);
        }
    }

    // ─── Covisibility maintenance ───────────────────────────────────────

    /// Recompute this keyframe's covisibility edges from its map points.
    ///
    /// Edges with weight >= 15 are kept; when none reach the threshold
    /// the single heaviest edge survives. On the first call for a fresh
    /// keyframe the heaviest neighbor is adopted as spanning-tree parent.
    pub fn update_connections(&mut self, kf_id: KeyFrameId) {
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return;
        };

        let mut counter: BTreeMap<KeyFrameId, u32> = BTreeMap::new();
        for mp_id in kf.map_points().iter().flatten() {
            let Some(mp) = self.map_points.get(mp_id) else {
                continue;
            };
            if mp.is_bad() {
                continue;
            }
            for &other in mp.observations().keys() {
                if other == kf_id {
                    continue;
                }
                if self.keyframes.get(&other).is_some_and(|o| !o.is_bad()) {
                    *counter.entry(other).or_insert(0) += 1;
                }
            }
        }
        if counter.is_empty() {
            return;
        }

        // BTreeMap iterates in id order, so strict `>` keeps the lowest
        // id among equals.
        let (&max_kf, &max_w) = counter
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .expect("counter is non-empty");

        let mut kept: BTreeMap<KeyFrameId, u32> = counter
            .iter()
            .filter(|(_, &w)| w >= COVISIBILITY_THRESHOLD)
            .map(|(&k, &w)| (k, w))
            .collect();
        if kept.is_empty() {
            kept.insert(max_kf, max_w);
        }

        for (&other, &w) in &kept {
            if let Some(other_kf) = self.keyframes.get_mut(&other) {
                other_kf.add_connection(kf_id, w);
            }
        }

        let kf = self.keyframes.get_mut(&kf_id).expect("checked above");
        kf.set_connections(kept);

        // Adopt the heaviest neighbor as parent exactly once; the first
        // keyframe stays the tree root.
        if kf.id.0 != 0 && kf.parent().is_none() && kf.take_first_connection() {
            let parent = kf.best_covisibles(1)[0];
            kf.set_parent(Some(parent));
            if let Some(parent_kf) = self.keyframes.get_mut(&parent) {
                parent_kf.add_child(kf_id);
            }
        }
    }

    // ─── Erase protocol ─────────────────────────────────────────────────

    /// Pin a keyframe against erasure (loop closing working on it).
    pub fn set_keyframe_not_erase(&mut self, kf_id: KeyFrameId) {
        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.set_not_erase_flag(true);
        }
    }

    /// Drop the pin. Keyframes holding loop edges stay pinned forever; a
    /// culling request recorded while pinned is honored now. Returns true
    /// when the keyframe was actually erased.
    pub fn set_keyframe_erase(&mut self, kf_id: KeyFrameId) -> bool {
        let Some(kf) = self.keyframes.get_mut(&kf_id) else {
            return false;
        };
        if !kf.loop_edges().is_empty() {
            return false;
        }
        kf.set_not_erase_flag(false);
        if kf.is_pending_erase() {
            return self.set_keyframe_bad(kf_id);
        }
        false
    }

    /// Unlink a keyframe from the graph and tombstone it.
    ///
    /// The first keyframe is immune. A pinned keyframe only records the
    /// request. Otherwise: connections are removed from every neighbor,
    /// observations are cleared from every associated landmark, the
    /// children are re-parented along the heaviest covisibility edges
    /// into the candidate set (parent first, then every re-parented
    /// child), and orphans fall back to this keyframe's parent. The
    /// caller is responsible for erasing the keyframe from the keyframe
    /// database. Returns true when the keyframe became bad.
    pub fn set_keyframe_bad(&mut self, kf_id: KeyFrameId) -> bool {
        if kf_id.0 == 0 {
            return false;
        }
        let Some(kf) = self.keyframes.get_mut(&kf_id) else {
            return false;
        };
        if kf.is_not_erase() {
            kf.set_pending_erase();
            return false;
        }

        let connected = kf.connected_keyframes();
        let slots: Vec<MapPointId> = kf.map_points().iter().flatten().copied().collect();
        let parent = kf.parent();
        let mut children = kf.children().clone();

        for other in connected {
            if let Some(other_kf) = self.keyframes.get_mut(&other) {
                other_kf.erase_connection(kf_id);
            }
        }
        for mp_id in slots {
            let below_min = {
                let Some(mp) = self.map_points.get_mut(&mp_id) else {
                    continue;
                };
                let stereo = mp
                    .observations()
                    .get(&kf_id)
                    .map(|&idx| {
                        self.keyframes
                            .get(&kf_id)
                            .map(|kf| kf.is_stereo(idx))
                            .unwrap_or(false)
                    })
                    .unwrap_or(false);
                mp.erase_observation(kf_id, stereo)
            };
            if below_min {
                self.set_map_point_bad(mp_id);
            }
        }

        // Re-parent children: repeatedly pick the (child, candidate) pair
        // with the highest covisibility weight, where candidates start as
        // {parent} and grow with every re-parented child.
        let mut candidates: Vec<KeyFrameId> = parent.into_iter().collect();
        while !children.is_empty() {
            let mut best: Option<(u32, KeyFrameId, KeyFrameId)> = None;
            for &child in &children {
                let Some(child_kf) = self.keyframes.get(&child) else {
                    continue;
                };
                if child_kf.is_bad() {
                    continue;
                }
                for &cand in &candidates {
                    let w = child_kf.weight(cand);
                    if w > 0 && best.map(|(bw, _, _)| w > bw).unwrap_or(true) {
                        best = Some((w, child, cand));
                    }
                }
            }
            let Some((_, child, new_parent)) = best else {
                break;
            };
            self.change_parent(child, new_parent);
            candidates.push(child);
            children.remove(&child);
        }
        // Orphans adopt this keyframe's parent.
        if let Some(parent) = parent {
            for child in children {
                self.change_parent(child, parent);
            }
            if let Some(parent_kf) = self.keyframes.get_mut(&parent) {
                parent_kf.erase_child(kf_id);
            }
        }

        let parent_pose_inv = parent
            .and_then(|p| self.keyframes.get(&p))
            .map(|p| p.pose_inverse());
        let kf = self.keyframes.get_mut(&kf_id).expect("still present");
        if let Some(twp) = parent_pose_inv {
            kf.set_tcp(kf.pose() * twp);
        }
        kf.clear_connections();
        kf.mark_bad();
        debug!(%kf_id, "keyframe marked bad");
        true
    }

    /// Move `child` under `new_parent` in the spanning tree.
    pub fn change_parent(&mut self, child: KeyFrameId, new_parent: KeyFrameId) {
        let old_parent = match self.keyframes.get_mut(&child) {
            Some(kf) => {
                let old = kf.parent();
                kf.set_parent(Some(new_parent));
                old
            }
            None => return,
        };
        if let Some(old) = old_parent {
            if let Some(old_kf) = self.keyframes.get_mut(&old) {
                old_kf.erase_child(child);
            }
        }
        if let Some(parent_kf) = self.keyframes.get_mut(&new_parent) {
            parent_kf.add_child(child);
        }
    }

    // ─── Derived queries ────────────────────────────────────────────────

    /// Number of associated, non-bad map points of a keyframe whose
    /// observation count reaches `min_obs`.
    pub fn tracked_map_points(&self, kf_id: KeyFrameId, min_obs: u32) -> usize {
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return 0;
        };
        kf.map_points()
            .iter()
            .flatten()
            .filter(|mp_id| {
                self.map_points
                    .get(mp_id)
                    .map(|mp| !mp.is_bad() && (min_obs == 0 || mp.n_obs() >= min_obs))
                    .unwrap_or(false)
            })
            .count()
    }

    /// Median depth of a keyframe's landmarks in its own camera frame;
    /// `q` = 2 selects the median.
    pub fn scene_median_depth(&self, kf_id: KeyFrameId, q: usize) -> Option<f64> {
        let kf = self.keyframes.get(&kf_id)?;
        let tcw = kf.pose();
        let rz = tcw.rotation_matrix().row(2).transpose();
        let tz = tcw.translation.z;
        let mut depths: Vec<f64> = kf
            .map_points()
            .iter()
            .flatten()
            .filter_map(|mp_id| self.map_points.get(mp_id))
            .filter(|mp| !mp.is_bad())
            .map(|mp| rz.dot(&mp.position()) + tz)
            .collect();
        if depths.is_empty() {
            return None;
        }
        depths.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        Some(depths[(depths.len() - 1) / q])
    }
}
