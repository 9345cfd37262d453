//! Encapsulates a network interface card.
//!
//! A driver owns the hardware rings. It hands received frames to the stack through an
//! [`RxHandle`], which may be used from interrupt level: it only touches the buffer pool and
//! lock-free queues. Frames to send arrive through [`Driver::transmit`], called from the network
//! context.
//!
//! Also permits software emulation of a card, see [`external`].
//!
//! [`RxHandle`]: struct.RxHandle.html
//! [`Driver::transmit`]: trait.Driver.html#tymethod.transmit
//! [`external`]: external/index.html
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_queue::ArrayQueue;

use crate::buf::{Pbuf, PbufQueue};
use crate::layer::{NetifId, Result};
use crate::stack::signal::{Signal, Signals};

pub mod external;
mod personality;

pub use self::personality::{
    Capabilities,
    Personality,
    Protocol};

/// A layer 2 device.
pub trait Driver: Send {
    /// A description of the device.
    ///
    /// Read once when the device is attached.
    fn personality(&self) -> Personality {
        Personality::baseline()
    }

    /// Queue a complete Ethernet frame for transmission.
    ///
    /// The driver owns the buffer afterwards and drops it once the hardware is done, returning it
    /// to the pool. Failing to queue the frame drops it as well.
    fn transmit(&mut self, frame: Pbuf) -> Result<()>;
}

/// The receive side of an attached interface.
///
/// Cheap to clone and safe to use from interrupt level.
#[derive(Clone)]
pub struct RxHandle {
    queue: Arc<RxQueue>,
}

pub(crate) struct RxQueue {
    netif: NetifId,
    frames: ArrayQueue<Pbuf>,
    /// Fragments of a frame that spans several receive descriptors.
    staging: spin::Mutex<PbufQueue>,
    scheduled: AtomicBool,
    dropped: AtomicUsize,
    signals: Arc<Signals>,
}

impl RxHandle {
    pub(crate) fn new(queue: Arc<RxQueue>) -> Self {
        RxHandle { queue }
    }

    /// Hand a received buffer to the stack.
    ///
    /// The buffer may be a fragment of a frame, with the end-of-packet mark cleared. Fragments are
    /// held back until the final one arrives. Complete frames that do not fit into the receive
    /// queue are dropped.
    pub fn receive(&self, frame: Pbuf) {
        let queue = &*self.queue;
        {
            let mut staging = queue.staging.lock();
            staging.push(frame);
            while let Some(frame) = staging.splice() {
                if queue.frames.push(frame).is_err() {
                    queue.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        if !queue.frames.is_empty() && !queue.scheduled.swap(true, Ordering::AcqRel) {
            queue.signals.raise(Signal::Rx(queue.netif));
        }
    }

    /// The number of frames dropped because the receive queue was full.
    pub fn dropped(&self) -> usize {
        self.queue.dropped.load(Ordering::Relaxed)
    }
}

impl RxQueue {
    pub(crate) fn new(netif: NetifId, depth: usize, signals: Arc<Signals>) -> Self {
        RxQueue {
            netif,
            frames: ArrayQueue::new(depth.max(1)),
            staging: spin::Mutex::new(PbufQueue::new()),
            scheduled: AtomicBool::new(false),
            dropped: AtomicUsize::new(0),
            signals,
        }
    }

    /// Take the next frame, clearing the scheduled mark once the queue is empty.
    pub(crate) fn pop(&self) -> Option<Pbuf> {
        self.scheduled.store(false, Ordering::Release);
        let frame = self.frames.pop()?;
        self.scheduled.store(true, Ordering::Release);
        Some(frame)
    }

    /// End a bounded drain, signalling again if frames are left over.
    pub(crate) fn reschedule(&self) {
        self.scheduled.store(false, Ordering::Release);
        if !self.frames.is_empty() && !self.scheduled.swap(true, Ordering::AcqRel) {
            self.signals.raise(Signal::Rx(self.netif));
        }
    }

    pub(crate) fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn free_all(&self) {
        while self.frames.pop().is_some() {}
        self.staging.lock().free_all();
    }
}
