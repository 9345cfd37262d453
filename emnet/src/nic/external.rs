//! A stub nic that captures transmitted frames in memory.
//!
//! The device side is handed to the stack while the test keeps the [`Capture`] to look at what
//! was sent. Frames are received by passing buffers to the `RxHandle` of the attached interface.
//!
//! [`Capture`]: struct.Capture.html
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::buf::{Pbuf, PbufQueue};
use crate::layer::{Error, Result};

use super::{Driver, Personality};

/// The device half, attached to the stack.
pub struct External {
    personality: Personality,
    sent: Arc<spin::Mutex<PbufQueue>>,
    /// Stop accepting frames after this many have been queued.
    limit: Option<usize>,
}

/// The observer half, reading transmitted frames.
#[derive(Clone)]
pub struct Capture {
    sent: Arc<spin::Mutex<PbufQueue>>,
}

impl External {
    /// A new device without any offloads.
    pub fn new() -> (External, Capture) {
        External::with_personality(Personality::baseline())
    }

    /// A new device describing itself with `personality`.
    pub fn with_personality(personality: Personality) -> (External, Capture) {
        let sent = Arc::new(spin::Mutex::new(PbufQueue::new()));
        let capture = Capture { sent: sent.clone() };
        (External { personality, sent, limit: None }, capture)
    }

    /// Reject transmissions while `limit` frames are waiting in the capture.
    pub fn set_limit(&mut self, limit: Option<usize>) {
        self.limit = limit;
    }
}

impl Driver for External {
    fn personality(&self) -> Personality {
        self.personality.clone()
    }

    fn transmit(&mut self, frame: Pbuf) -> Result<()> {
        let mut sent = self.sent.lock();
        if let Some(limit) = self.limit {
            if sent.len() >= limit {
                return Err(Error::Exhausted);
            }
        }
        sent.push(frame);
        Ok(())
    }
}

impl Capture {
    /// Take the oldest transmitted frame.
    pub fn splice(&self) -> Option<Pbuf> {
        self.sent.lock().splice()
    }

    /// Take the oldest transmitted frame as bytes.
    pub fn next_frame(&self) -> Option<Vec<u8>> {
        self.splice().map(|frame| frame.to_vec())
    }

    /// Take all transmitted frames as bytes.
    pub fn frames(&self) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame() {
            frames.push(frame);
        }
        frames
    }

    /// The number of frames waiting.
    pub fn len(&self) -> usize {
        self.sent.lock().len()
    }

    /// Whether no frame is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every captured frame.
    pub fn clear(&self) {
        self.sent.lock().free_all()
    }
}
