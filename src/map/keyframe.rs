//! KeyFrame: a frame promoted into the map.
//!
//! Keyframes are the nodes of the covisibility graph and the spanning
//! tree. Feature data is copied from the source frame and never changes;
//! the pose, the map-point associations, and the graph links mutate as
//! the background threads refine the map.
//!
//! Erase protocol: a keyframe being used by loop closing is pinned with
//! `not_erase`; a culling request against a pinned keyframe is recorded
//! in `to_be_erased` and honored when the pin drops. The actual
//! unlinking lives in [`Map::set_keyframe_bad`](super::Map::set_keyframe_bad)
//! because it touches neighbors and landmarks.

use std::collections::{BTreeMap, BTreeSet};

use nalgebra::Vector3;

use crate::camera::CameraModel;
use crate::features::{BowVector, Descriptor, FeatureGrid, FeatureVector, KeyPoint, ScalePyramid};
use crate::geometry::SE3;
use crate::tracking::frame::Frame;

use super::types::{FrameId, KeyFrameId, MapPointId};

#[derive(Debug, Clone)]
pub struct KeyFrame {
    pub id: KeyFrameId,
    /// Id of the frame this keyframe was promoted from.
    pub frame_id: FrameId,
    pub timestamp: f64,

    pub camera: CameraModel,
    pub pyramid: ScalePyramid,

    // Immutable feature data, copied from the source frame.
    pub keypoints: Vec<KeyPoint>,
    pub keypoints_un: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,
    /// Right-image x coordinate per keypoint; negative when absent.
    pub right_xs: Vec<f32>,
    /// Depth per keypoint; negative when absent.
    pub depths: Vec<f32>,
    pub bow: Option<BowVector>,
    pub feature_vec: Option<FeatureVector>,
    grid: FeatureGrid,

    // Pose and derived quantities, updated together.
    pose: SE3,
    pose_inv: SE3,
    camera_center: Vector3<f64>,
    /// Stereo baseline midpoint in world coordinates.
    stereo_center: Vector3<f64>,

    /// Keypoint index -> associated map point.
    map_points: Vec<Option<MapPointId>>,

    // Covisibility graph.
    connections: BTreeMap<KeyFrameId, u32>,
    /// Connections sorted by (weight desc, id asc).
    ordered_connections: Vec<(KeyFrameId, u32)>,
    first_connection: bool,

    // Spanning tree.
    parent: Option<KeyFrameId>,
    children: BTreeSet<KeyFrameId>,

    loop_edges: BTreeSet<KeyFrameId>,

    not_erase: bool,
    to_be_erased: bool,
    bad: bool,

    /// Transform to the parent, captured when this keyframe is marked
    /// bad; lets trajectory recovery walk through culled keyframes.
    tcp: Option<SE3>,
}

impl KeyFrame {
    /// Promote a frame. The frame must carry a pose.
    pub(super) fn from_frame(id: KeyFrameId, frame: &Frame) -> Self {
        let pose = frame
            .pose
            .expect("cannot promote a frame without a pose estimate");
        let mut kf = Self {
            id,
            frame_id: frame.id,
            timestamp: frame.timestamp,
            camera: frame.camera.clone(),
            pyramid: frame.pyramid.clone(),
            keypoints: frame.keypoints.clone(),
            keypoints_un: frame.keypoints_un.clone(),
            descriptors: frame.descriptors.clone(),
            right_xs: frame.right_xs.clone(),
            depths: frame.depths.clone(),
            bow: frame.bow.clone(),
            feature_vec: frame.feature_vec.clone(),
            grid: frame.grid.clone(),
            pose: SE3::identity(),
            pose_inv: SE3::identity(),
            camera_center: Vector3::zeros(),
            stereo_center: Vector3::zeros(),
            map_points: frame.map_points.clone(),
            connections: BTreeMap::new(),
            ordered_connections: Vec::new(),
            first_connection: true,
            parent: None,
            children: BTreeSet::new(),
            loop_edges: BTreeSet::new(),
            not_erase: false,
            to_be_erased: false,
            bad: false,
            tcp: None,
        };
        kf.set_pose(pose);
        kf
    }

    pub fn n_features(&self) -> usize {
        self.keypoints_un.len()
    }

    // ─── Pose ────────────────────────────────────────────────────────────

    /// Store Tcw and derive Twc, the camera center, and the stereo
    /// baseline midpoint.
    pub fn set_pose(&mut self, tcw: SE3) {
        self.pose = tcw;
        self.pose_inv = tcw.inverse();
        self.camera_center = tcw.center();
        let half_baseline = self.camera.baseline / 2.0;
        self.stereo_center = self
            .pose_inv
            .transform(&Vector3::new(half_baseline, 0.0, 0.0));
    }

    pub fn pose(&self) -> SE3 {
        self.pose
    }

    pub fn pose_inverse(&self) -> SE3 {
        self.pose_inv
    }

    pub fn camera_center(&self) -> Vector3<f64> {
        self.camera_center
    }

    pub fn stereo_center(&self) -> Vector3<f64> {
        self.stereo_center
    }

    /// Transform to parent at the moment this keyframe was marked bad.
    pub fn tcp(&self) -> Option<SE3> {
        self.tcp
    }

    pub(super) fn set_tcp(&mut self, tcp: SE3) {
        self.tcp = Some(tcp);
    }

    // ─── Covisibility graph ─────────────────────────────────────────────

    /// Upsert one edge and restore the ordered view.
    pub fn add_connection(&mut self, kf: KeyFrameId, weight: u32) {
        if kf == self.id {
            return;
        }
        self.connections.insert(kf, weight);
        self.rebuild_ordered_connections();
    }

    pub fn erase_connection(&mut self, kf: KeyFrameId) {
        if self.connections.remove(&kf).is_some() {
            self.rebuild_ordered_connections();
        }
    }

    /// Replace the whole edge set (used by the from-scratch recompute).
    pub(super) fn set_connections(&mut self, connections: BTreeMap<KeyFrameId, u32>) {
        self.connections = connections;
        self.connections.remove(&self.id);
        self.rebuild_ordered_connections();
    }

    pub(super) fn clear_connections(&mut self) {
        self.connections.clear();
        self.ordered_connections.clear();
    }

    fn rebuild_ordered_connections(&mut self) {
        self.ordered_connections = self
            .connections
            .iter()
            .map(|(&id, &w)| (id, w))
            .collect();
        // Weight descending, id ascending as the deterministic tie-break.
        self.ordered_connections
            .sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    }

    pub fn connected_keyframes(&self) -> BTreeSet<KeyFrameId> {
        self.connections.keys().copied().collect()
    }

    pub fn weight(&self, kf: KeyFrameId) -> u32 {
        self.connections.get(&kf).copied().unwrap_or(0)
    }

    /// Neighbors with covisibility weight >= `min_weight`, best first.
    pub fn covisibles_by_weight(&self, min_weight: u32) -> Vec<KeyFrameId> {
        self.ordered_connections
            .iter()
            .take_while(|(_, w)| *w >= min_weight)
            .map(|(id, _)| *id)
            .collect()
    }

    /// The `n` most covisible neighbors.
    pub fn best_covisibles(&self, n: usize) -> Vec<KeyFrameId> {
        self.ordered_connections
            .iter()
            .take(n)
            .map(|(id, _)| *id)
            .collect()
    }

    pub(super) fn take_first_connection(&mut self) -> bool {
        std::mem::replace(&mut self.first_connection, false)
    }

    // ─── Spanning tree ──────────────────────────────────────────────────

    pub fn parent(&self) -> Option<KeyFrameId> {
        self.parent
    }

    pub(super) fn set_parent(&mut self, parent: Option<KeyFrameId>) {
        self.parent = parent;
    }

    pub fn children(&self) -> &BTreeSet<KeyFrameId> {
        &self.children
    }

    pub fn has_child(&self, kf: KeyFrameId) -> bool {
        self.children.contains(&kf)
    }

    pub(super) fn add_child(&mut self, kf: KeyFrameId) {
        self.children.insert(kf);
    }

    pub(super) fn erase_child(&mut self, kf: KeyFrameId) {
        self.children.remove(&kf);
    }

    // ─── Loop edges ─────────────────────────────────────────────────────

    /// Record a loop edge; loop-edged keyframes can never be erased.
    pub fn add_loop_edge(&mut self, kf: KeyFrameId) {
        self.not_erase = true;
        self.loop_edges.insert(kf);
    }

    pub fn loop_edges(&self) -> &BTreeSet<KeyFrameId> {
        &self.loop_edges
    }

    // ─── Erase protocol flags ───────────────────────────────────────────

    pub fn is_bad(&self) -> bool {
        self.bad
    }

    pub(super) fn mark_bad(&mut self) {
        self.bad = true;
    }

    pub fn is_not_erase(&self) -> bool {
        self.not_erase
    }

    pub(super) fn set_not_erase_flag(&mut self, v: bool) {
        self.not_erase = v;
    }

    pub fn is_pending_erase(&self) -> bool {
        self.to_be_erased
    }

    pub(super) fn set_pending_erase(&mut self) {
        self.to_be_erased = true;
    }

    // ─── Map-point associations ─────────────────────────────────────────

    pub fn add_map_point(&mut self, mp: MapPointId, idx: usize) {
        self.map_points[idx] = Some(mp);
    }

    pub fn erase_map_point_at(&mut self, idx: usize) {
        self.map_points[idx] = None;
    }

    pub fn erase_map_point(&mut self, mp: MapPointId) {
        for slot in self.map_points.iter_mut() {
            if *slot == Some(mp) {
                *slot = None;
            }
        }
    }

    pub fn replace_map_point_at(&mut self, idx: usize, mp: MapPointId) {
        self.map_points[idx] = Some(mp);
    }

    /// Full keypoint-parallel association array.
    pub fn map_points(&self) -> &[Option<MapPointId>] {
        &self.map_points
    }

    pub fn map_point_at(&self, idx: usize) -> Option<MapPointId> {
        self.map_points.get(idx).copied().flatten()
    }

    pub fn map_point_set(&self) -> BTreeSet<MapPointId> {
        self.map_points.iter().flatten().copied().collect()
    }

    /// True when the keypoint at `idx` has a stereo measurement.
    pub fn is_stereo(&self, idx: usize) -> bool {
        self.right_xs[idx] >= 0.0
    }

    // ─── Queries ────────────────────────────────────────────────────────

    /// Indices of undistorted keypoints within the square of side 2r
    /// centered at (x, y).
    pub fn features_in_area(&self, x: f64, y: f64, r: f64) -> Vec<usize> {
        self.grid
            .features_in_area(&self.keypoints_un, x, y, r, 0, -1)
    }

    /// 3-D world point for keypoint `i`; None without a depth measurement.
    pub fn unproject_stereo(&self, i: usize) -> Option<Vector3<f64>> {
        let z = self.depths[i] as f64;
        if z <= 0.0 {
            return None;
        }
        let kp = &self.keypoints_un[i];
        let p_cam = self.camera.unproject(kp.x as f64, kp.y as f64, z);
        Some(self.pose_inv.transform(&p_cam))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::frame::tests::make_test_frame;
    use approx::assert_relative_eq;
    use nalgebra::Rotation3;

    fn keyframe(id: u64) -> KeyFrame {
        let mut frame = make_test_frame(0, &[(100.0, 100.0), (200.0, 120.0), (320.0, 240.0)]);
        frame.pose = Some(SE3::identity());
        KeyFrame::from_frame(KeyFrameId(id), &frame)
    }

    #[test]
    fn pose_derivations() {
        let mut kf = keyframe(1);
        let tcw = SE3::new(
            Rotation3::from_euler_angles(0.0, 0.3, 0.0),
            Vector3::new(0.1, 0.0, 1.0),
        );
        kf.set_pose(tcw);
        assert_relative_eq!(
            kf.pose_inverse().transform(&Vector3::zeros()),
            kf.camera_center(),
            epsilon = 1e-12
        );
        // The stereo center sits half a baseline along the camera x axis.
        let expected = kf
            .pose_inverse()
            .transform(&Vector3::new(kf.camera.baseline / 2.0, 0.0, 0.0));
        assert_relative_eq!(kf.stereo_center(), expected, epsilon = 1e-12);
    }

    #[test]
    fn ordered_connections_sorted_by_weight_then_id() {
        let mut kf = keyframe(0);
        kf.add_connection(KeyFrameId(5), 30);
        kf.add_connection(KeyFrameId(2), 50);
        kf.add_connection(KeyFrameId(9), 30);
        kf.add_connection(KeyFrameId(7), 10);

        assert_eq!(
            kf.best_covisibles(4),
            vec![KeyFrameId(2), KeyFrameId(5), KeyFrameId(9), KeyFrameId(7)]
        );
        assert_eq!(
            kf.covisibles_by_weight(30),
            vec![KeyFrameId(2), KeyFrameId(5), KeyFrameId(9)]
        );
        assert_eq!(kf.weight(KeyFrameId(9)), 30);
        assert_eq!(kf.weight(KeyFrameId(42)), 0);
    }

    #[test]
    fn self_connections_rejected() {
        let mut kf = keyframe(3);
        kf.add_connection(KeyFrameId(3), 99);
        assert_eq!(kf.weight(KeyFrameId(3)), 0);
    }

    #[test]
    fn loop_edge_pins_keyframe() {
        let mut kf = keyframe(4);
        assert!(!kf.is_not_erase());
        kf.add_loop_edge(KeyFrameId(1));
        assert!(kf.is_not_erase());
        assert!(kf.loop_edges().contains(&KeyFrameId(1)));
    }

    #[test]
    fn unproject_stereo_requires_depth() {
        let mut kf = keyframe(0);
        assert!(kf.unproject_stereo(0).is_none());
        kf.depths[0] = 2.0;
        let p = kf.unproject_stereo(0).unwrap();
        // Identity pose: the point sits 2m along the ray through the pixel.
        assert_relative_eq!(p.z, 2.0, epsilon = 1e-12);
    }
}
