//! System wiring: the shared map handle, image input conversion, the
//! channel-backed background-thread handles, and the [`SlamSystem`]
//! entry point the caller feeds images into.

pub mod input;
pub mod queue;
#[allow(clippy::module_inception)]
pub mod system;

use std::sync::Arc;

use parking_lot::RwLock;

use crate::map::Map;

/// The map behind its global-update lock. The tracker holds the write
/// guard for a whole frame; background threads take it around structural
/// mutation.
pub type SharedMap = Arc<RwLock<Map>>;

pub use input::{DepthInput, ImageInput};
pub use queue::{LocalMappingQueue, LoopClosingQueue};
pub use system::SlamSystem;
