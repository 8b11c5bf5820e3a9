use std::collections::VecDeque;
use std::sync::Mutex;

use relay_wire::Frame;

/// A channel's outbound FIFO. Pushing returns whether the queue transitioned from empty to
/// non-empty, which is the signal callers use to schedule exactly one drain task rather than
/// one task per enqueued frame (spec.md §9, "single-flight drain").
pub struct BroadcastQueue {
    frames: Mutex<VecDeque<Frame>>,
}

impl BroadcastQueue {
    pub fn new() -> BroadcastQueue {
        BroadcastQueue { frames: Mutex::new(VecDeque::new()) }
    }

    pub fn push(&self, frame: Frame) -> bool {
        let mut frames = self.frames.lock().unwrap();
        let was_empty = frames.is_empty();
        frames.push_back(frame);
        was_empty
    }

    /// Pops every frame currently queued, preserving FIFO order. Called by the drain task;
    /// draining everything in one pass keeps per-channel ordering without needing the task
    /// to re-check the queue under a second lock acquisition per frame.
    pub fn drain(&self) -> Vec<Frame> {
        let mut frames = self.frames.lock().unwrap();
        frames.drain(..).collect()
    }
}

impl Default for BroadcastQueue {
    fn default() -> BroadcastQueue {
        BroadcastQueue::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_wire::FrameType;

    #[test]
    fn push_reports_empty_to_nonempty_transition_only_once() {
        let q = BroadcastQueue::new();
        assert!(q.push(Frame::new(1, FrameType::ChMessage, Vec::new())));
        assert!(!q.push(Frame::new(2, FrameType::ChMessage, Vec::new())));
    }

    #[test]
    fn drain_preserves_fifo_order_and_empties_queue() {
        let q = BroadcastQueue::new();
        q.push(Frame::new(1, FrameType::ChMessage, Vec::new()));
        q.push(Frame::new(2, FrameType::ChMessage, Vec::new()));
        let drained = q.drain();
        assert_eq!(drained.iter().map(|f| f.id).collect::<Vec<_>>(), vec![1, 2]);
        assert!(q.drain().is_empty());
    }
}
