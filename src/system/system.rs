//! The SLAM system entry point.
//!
//! Owns the shared map, the tracker, and the collaborator handles, and
//! exposes one `track_*` call per sensor modality. Each call converts
//! the input, runs feature extraction, builds the frame, and drives one
//! tracker iteration under the map-update lock. Reset requests (from the
//! caller or from the tracker itself) are honored at the top of the next
//! call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::RwLock;
use tracing::info;

use crate::adapters::{Collaborators, OrbExtractor};
use crate::camera::CameraModel;
use crate::features::ScalePyramid;
use crate::geometry::SE3;
use crate::map::types::FrameId;
use crate::map::Map;
use crate::settings::{Sensor, Settings};
use crate::tracking::frame::Frame;
use crate::tracking::{Tracker, TrackingState};

use super::input::{to_depth_image, to_grayscale, DepthInput, ImageInput};
use super::SharedMap;

pub struct SlamSystem {
    settings: Settings,
    sensor: Sensor,

    map: SharedMap,
    tracker: Tracker,
    collaborators: Collaborators,

    extractor: Arc<dyn OrbExtractor>,
    /// Richer extractor used while the monocular map does not exist yet
    /// (2x the configured feature budget).
    init_extractor: Arc<dyn OrbExtractor>,

    /// Camera model; built from the first frame's dimensions.
    camera: Option<CameraModel>,
    pyramid: ScalePyramid,

    next_frame_id: u64,
    reset_flag: Arc<AtomicBool>,
}

impl SlamSystem {
    /// Wire up a system. `init_extractor` is the monocular
    /// initialization extractor; pass None to reuse `extractor`.
    pub fn new(
        settings: Settings,
        extractor: Arc<dyn OrbExtractor>,
        init_extractor: Option<Arc<dyn OrbExtractor>>,
        collaborators: Collaborators,
    ) -> Result<Self> {
        if settings.sensor.has_depth() && settings.camera.bf <= 0.0 {
            bail!("depth sensor configured without a stereo baseline");
        }
        let pyramid = ScalePyramid::new(
            settings.orb.n_levels as usize,
            settings.orb.scale_factor,
        );
        let reset_flag = Arc::new(AtomicBool::new(false));
        let tracker = Tracker::new(&settings, collaborators.clone(), reset_flag.clone());
        Ok(Self {
            sensor: settings.sensor,
            settings,
            map: Arc::new(RwLock::new(Map::new())),
            tracker,
            collaborators,
            init_extractor: init_extractor.unwrap_or_else(|| extractor.clone()),
            extractor,
            camera: None,
            pyramid,
            next_frame_id: 0,
            reset_flag,
        })
    }

    pub fn map(&self) -> SharedMap {
        self.map.clone()
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub fn set_localization_only(&mut self, value: bool) {
        self.tracker.set_localization_only(value);
    }

    /// Request a full system reset; performed at the next track call.
    pub fn request_reset(&self) {
        self.reset_flag.store(true, Ordering::SeqCst);
    }

    /// Track one monocular frame. Returns the estimated Tcw, or None
    /// when tracking produced no pose this frame.
    pub fn track_monocular(&mut self, image: &ImageInput, timestamp: f64) -> Option<SE3> {
        assert_eq!(self.sensor, Sensor::Monocular, "system not configured for monocular input");
        self.handle_reset_request();
        let gray = to_grayscale(image, self.settings.color_order());
        let camera = self.camera_for(gray.width(), gray.height());

        // Initialization sees twice the features.
        let initializing = matches!(
            self.tracker.state(),
            TrackingState::NoImagesYet | TrackingState::NotInitialized
        );
        let (keypoints, descriptors) = if initializing {
            self.init_extractor.extract(&gray)
        } else {
            self.extractor.extract(&gray)
        };

        let frame = Frame::new_monocular(
            self.alloc_frame_id(),
            timestamp,
            keypoints,
            descriptors,
            camera,
            self.pyramid.clone(),
        );
        self.run_tracker(frame)
    }

    /// Track one rectified stereo pair.
    pub fn track_stereo(
        &mut self,
        left: &ImageInput,
        right: &ImageInput,
        timestamp: f64,
    ) -> Option<SE3> {
        assert_eq!(self.sensor, Sensor::Stereo, "system not configured for stereo input");
        self.handle_reset_request();
        let order = self.settings.color_order();
        let gray_left = to_grayscale(left, order);
        let gray_right = to_grayscale(right, order);
        let camera = self.camera_for(gray_left.width(), gray_left.height());

        let (keypoints, descriptors) = self.extractor.extract(&gray_left);
        let (right_keypoints, right_descriptors) = self.extractor.extract(&gray_right);

        let frame = Frame::new_stereo(
            self.alloc_frame_id(),
            timestamp,
            keypoints,
            descriptors,
            &right_keypoints,
            &right_descriptors,
            camera,
            self.pyramid.clone(),
        );
        self.run_tracker(frame)
    }

    /// Track one RGB-D frame.
    pub fn track_rgbd(
        &mut self,
        image: &ImageInput,
        depth: &DepthInput,
        timestamp: f64,
    ) -> Option<SE3> {
        assert_eq!(self.sensor, Sensor::Rgbd, "system not configured for RGB-D input");
        self.handle_reset_request();
        let gray = to_grayscale(image, self.settings.color_order());
        let camera = self.camera_for(gray.width(), gray.height());
        let depth_map = to_depth_image(depth, self.settings.depth_scale());

        let (keypoints, descriptors) = self.extractor.extract(&gray);
        let frame = Frame::new_rgbd(
            self.alloc_frame_id(),
            timestamp,
            keypoints,
            descriptors,
            &depth_map,
            camera,
            self.pyramid.clone(),
        );
        self.run_tracker(frame)
    }

    fn run_tracker(&mut self, frame: Frame) -> Option<SE3> {
        let map = self.map.clone();
        let mut guard = map.write();
        self.tracker.track_frame(frame, &mut guard)
    }

    fn alloc_frame_id(&mut self) -> FrameId {
        let id = FrameId(self.next_frame_id);
        self.next_frame_id += 1;
        id
    }

    fn camera_for(&mut self, width: u32, height: u32) -> CameraModel {
        self.camera
            .get_or_insert_with(|| CameraModel::new(&self.settings, width, height))
            .clone()
    }

    /// Orderly teardown when a reset was requested: loop closer first,
    /// local mapper second, then the map (resetting the id generators),
    /// the keyframe database, and finally the tracker.
    fn handle_reset_request(&mut self) {
        if !self.reset_flag.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("system reset");
        self.collaborators.loop_closing.request_reset();
        self.collaborators.local_mapping.request_reset();
        self.collaborators.keyframe_db.clear();
        self.map.write().clear();
        self.tracker.reset();
        self.next_frame_id = 0;
    }
}
