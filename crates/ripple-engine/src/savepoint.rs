use tracing::debug;

use ripple_core::ChangeEvent;

use crate::registry::SharedObserver;

/// A change event buffered while savepoints are open, together with the
/// observer list captured for the statement that produced it. The captured
/// list, not the flush-time registry state, decides delivery.
pub struct BufferedEvent {
    pub event: ChangeEvent,
    pub observers: Vec<SharedObserver>,
}

struct Frame {
    /// Lowercased; SQL savepoint names are case-insensitive.
    name: String,
    /// Length of the event buffer when this frame opened.
    buffer_start: usize,
}

/// Tracks nested savepoint frames and buffers change events recorded while
/// any frame is open, so that `ROLLBACK TO` can discard exactly the events
/// recorded after the target savepoint began.
///
/// Invariant: the buffer holds events only while at least one frame is
/// open; whenever the stack empties the buffer is flushed or cleared in the
/// same operation.
#[derive(Default)]
pub struct SavepointStack {
    frames: Vec<Frame>,
    buffer: Vec<BufferedEvent>,
}

impl SavepointStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn buffer_is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn begin(&mut self, name: &str) {
        debug!(savepoint = name, depth = self.frames.len() + 1, "savepoint opened");
        self.frames.push(Frame {
            name: name.to_lowercase(),
            buffer_start: self.buffer.len(),
        });
    }

    /// `ROLLBACK TO name`: pop frames above the nearest matching frame,
    /// truncate the buffer to that frame's start, keep the frame itself.
    ///
    /// Unmatched inner frames are dropped silently; SQL allows rolling back
    /// to any ancestor. A name with no matching frame is a coordinator bug
    /// (the statement would have failed in the engine).
    pub fn rollback_to(&mut self, name: &str) {
        let name = name.to_lowercase();
        while let Some(top) = self.frames.last() {
            let discarded = self.buffer.len() - top.buffer_start;
            if top.name == name {
                debug!(savepoint = %name, discarded, "savepoint rolled back");
                let start = top.buffer_start;
                self.buffer.truncate(start);
                return;
            }
            self.frames.pop();
        }
        panic!("rollback to unknown savepoint {name:?}: savepoint stack out of sync");
    }

    /// `RELEASE name`: pop frames through the matching frame inclusive.
    /// When this empties the stack, the buffered events are returned for
    /// in-order delivery and the buffer is cleared.
    pub fn release(&mut self, name: &str) -> Option<Vec<BufferedEvent>> {
        let name = name.to_lowercase();
        while let Some(frame) = self.frames.pop() {
            if frame.name == name {
                if self.frames.is_empty() {
                    debug!(savepoint = %name, flushed = self.buffer.len(), "outermost savepoint released");
                    return Some(std::mem::take(&mut self.buffer));
                }
                return None;
            }
        }
        panic!("release of unknown savepoint {name:?}: savepoint stack out of sync");
    }

    /// Buffer one event with the active observer list of the producing
    /// statement. Must only be called while a frame is open.
    pub fn record(&mut self, event: ChangeEvent, observers: Vec<SharedObserver>) {
        assert!(
            !self.frames.is_empty(),
            "change event buffered with no open savepoint"
        );
        self.buffer.push(BufferedEvent { event, observers });
    }

    /// Commit flush: any events still buffered (savepoints implicitly
    /// released by COMMIT) in original order.
    pub fn drain(&mut self) -> Vec<BufferedEvent> {
        self.frames.clear();
        std::mem::take(&mut self.buffer)
    }

    /// Rollback: discard everything.
    pub fn clear(&mut self) {
        self.frames.clear();
        self.buffer.clear();
    }
}
