//! Tracking state machine states.

/// State of the tracker, advanced once per frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackingState {
    /// No image has been processed yet (also the post-reset state).
    #[default]
    NoImagesYet,
    /// Images received but no map exists yet.
    NotInitialized,
    /// Tracking normally.
    Ok,
    /// Tracking failed; subsequent frames attempt relocalization.
    Lost,
}
