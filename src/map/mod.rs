//! The world map: keyframes, map points, and the graph structure over
//! them (covisibility edges, spanning tree, observations).
//!
//! Ownership follows an arena design: the [`Map`] owns every [`KeyFrame`]
//! and [`MapPoint`] keyed by stable integer ids, and all cross-references
//! are ids. A `bad` flag acts as a tombstone so stale handles are
//! detected at dereference instead of dangling.

pub mod keyframe;
#[allow(clippy::module_inception)]
pub mod map;
pub mod map_point;
pub mod types;

pub use keyframe::KeyFrame;
pub use map::Map;
pub use map_point::MapPoint;
pub use types::{FrameId, KeyFrameId, MapPointId};
