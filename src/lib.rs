//! Tracking core of a feature-based visual SLAM system.
//!
//! Given a calibrated monocular, stereo, or RGB-D camera and a stream of
//! timestamped frames, this crate estimates the 6-DoF pose of the camera
//! for every frame while building and maintaining a sparse 3-D map of
//! landmarks:
//! - map initialization (stereo/RGB-D single-frame, monocular two-view)
//! - per-frame pose estimation (motion model, reference keyframe, or
//!   global relocalization)
//! - refinement against the local map and keyframe selection
//! - covisibility graph, spanning tree, and observation bookkeeping kept
//!   consistent under concurrent access by background threads
//!
//! Feature extraction, the BoW vocabulary and database, the two-view and
//! PnP solvers, the nonlinear optimizer, and the local-mapping and
//! loop-closing threads are external collaborators reached through the
//! traits in [`adapters`].

pub mod adapters;
pub mod camera;
pub mod features;
pub mod geometry;
pub mod map;
pub mod settings;
pub mod system;
pub mod tracking;

pub use settings::{Sensor, Settings};
pub use system::SlamSystem;
pub use tracking::{Tracker, TrackingState};
