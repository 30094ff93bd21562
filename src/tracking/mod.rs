//! The tracking front end: per-frame pose estimation and keyframe
//! selection.
//!
//! [`Tracker::track_frame`] drives one iteration of the state machine:
//! initialization when no map exists, then an initial pose estimate via
//! the motion model, the reference keyframe, or global relocalization,
//! refinement against the local map, and finally the new-keyframe
//! decision. The per-strategy entry points live in their own files.

pub mod frame;
pub mod initialization;
pub mod keyframe_decision;
pub mod local_map;
pub mod matching;
pub mod relocalization;
pub mod result;
pub mod state;
pub mod tracker;

pub use frame::{Frame, Projection};
pub use matching::LandmarkView;
pub use result::{FailureReason, TrackOutcome, TrajectoryEntry};
pub use state::TrackingState;
pub use tracker::Tracker;
