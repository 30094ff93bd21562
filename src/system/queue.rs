//! Channel-backed handles implementing the background-thread contracts.
//!
//! The mapping and loop-closing algorithms run outside this crate; these
//! handles give the tracker the queue and stop/pause protocol it needs,
//! and give the background thread a receiver plus acknowledgement
//! setters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::adapters::{LocalMapping, LoopClosing};
use crate::map::types::KeyFrameId;

/// Keyframe queue plus the stop/pause flags of the local mapper.
pub struct LocalMappingQueue {
    sender: Sender<KeyFrameId>,
    receiver: Receiver<KeyFrameId>,
    stopped: AtomicBool,
    stop_requested: AtomicBool,
    not_stop: AtomicBool,
    accept_keyframes: AtomicBool,
    abort_ba: AtomicBool,
    reset_requested: AtomicBool,
}

impl LocalMappingQueue {
    pub fn new() -> Arc<Self> {
        let (sender, receiver) = unbounded();
        Arc::new(Self {
            sender,
            receiver,
            stopped: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            not_stop: AtomicBool::new(false),
            accept_keyframes: AtomicBool::new(true),
            abort_ba: AtomicBool::new(false),
            reset_requested: AtomicBool::new(false),
        })
    }

    /// Receiver end for the mapping thread.
    pub fn receiver(&self) -> Receiver<KeyFrameId> {
        self.receiver.clone()
    }

    // Acknowledgement side, driven by the mapping thread.

    pub fn set_stopped(&self, value: bool) {
        self.stopped.store(value, Ordering::SeqCst);
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn clear_stop_request(&self) {
        self.stop_requested.store(false, Ordering::SeqCst);
    }

    pub fn set_accept_keyframes(&self, value: bool) {
        self.accept_keyframes.store(value, Ordering::SeqCst);
    }

    pub fn abort_ba_requested(&self) -> bool {
        self.abort_ba.load(Ordering::SeqCst)
    }

    pub fn clear_abort_ba(&self) {
        self.abort_ba.store(false, Ordering::SeqCst);
    }

    pub fn reset_requested(&self) -> bool {
        self.reset_requested.load(Ordering::SeqCst)
    }

    pub fn acknowledge_reset(&self) {
        self.reset_requested.store(false, Ordering::SeqCst);
    }
}

impl LocalMapping for LocalMappingQueue {
    fn insert_keyframe(&self, kf: KeyFrameId) {
        // A new keyframe outranks the bundle adjustment in progress.
        self.abort_ba.store(true, Ordering::SeqCst);
        let _ = self.sender.send(kf);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    fn accept_keyframes(&self) -> bool {
        self.accept_keyframes.load(Ordering::SeqCst)
    }

    fn keyframes_in_queue(&self) -> usize {
        self.sender.len()
    }

    fn set_not_stop(&self, value: bool) -> bool {
        if value && self.is_stopped() {
            return false;
        }
        self.not_stop.store(value, Ordering::SeqCst);
        true
    }

    fn interrupt_ba(&self) {
        self.abort_ba.store(true, Ordering::SeqCst);
    }

    fn request_reset(&self) {
        self.reset_requested.store(true, Ordering::SeqCst);
    }
}

/// Keyframe queue of the loop closer.
pub struct LoopClosingQueue {
    sender: Sender<KeyFrameId>,
    receiver: Receiver<KeyFrameId>,
    reset_requested: AtomicBool,
}

impl LoopClosingQueue {
    pub fn new() -> Arc<Self> {
        let (sender, receiver) = unbounded();
        Arc::new(Self {
            sender,
            receiver,
            reset_requested: AtomicBool::new(false),
        })
    }

    pub fn receiver(&self) -> Receiver<KeyFrameId> {
        self.receiver.clone()
    }

    pub fn reset_requested(&self) -> bool {
        self.reset_requested.load(Ordering::SeqCst)
    }

    pub fn acknowledge_reset(&self) {
        self.reset_requested.store(false, Ordering::SeqCst);
    }
}

impl LoopClosing for LoopClosingQueue {
    fn insert_keyframe(&self, kf: KeyFrameId) {
        let _ = self.sender.send(kf);
    }

    fn request_reset(&self) {
        self.reset_requested.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_tracks_pending_keyframes() {
        let queue = LocalMappingQueue::new();
        assert_eq!(queue.keyframes_in_queue(), 0);
        queue.insert_keyframe(KeyFrameId(0));
        queue.insert_keyframe(KeyFrameId(1));
        assert_eq!(queue.keyframes_in_queue(), 2);
        // Inserting a keyframe interrupts a running BA.
        assert!(queue.abort_ba_requested());

        let rx = queue.receiver();
        assert_eq!(rx.recv().unwrap(), KeyFrameId(0));
        assert_eq!(queue.keyframes_in_queue(), 1);
    }

    #[test]
    fn set_not_stop_refused_while_stopped() {
        let queue = LocalMappingQueue::new();
        assert!(queue.set_not_stop(true));
        queue.set_stopped(true);
        assert!(!queue.set_not_stop(true));
        // Releasing is always allowed.
        assert!(queue.set_not_stop(false));
    }

    #[test]
    fn reset_roundtrip() {
        let queue = LocalMappingQueue::new();
        LocalMapping::request_reset(&*queue);
        assert!(queue.reset_requested());
        queue.acknowledge_reset();
        assert!(!queue.reset_requested());
    }
}
