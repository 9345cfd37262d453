use core::sync::atomic::{AtomicBool, Ordering};
use core::task::Waker;

use crossbeam_queue::ArrayQueue;

use crate::layer::NetifId;
use crate::managed::Key;
use crate::wait::WaitQueue;

/// Work deferred to the network context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Signal {
    /// Frames are waiting in the receive queue of an interface.
    Rx(NetifId),
    /// An application handle requested work on a connection.
    Tcp(Key),
}

/// The bounded queue between interrupt level producers, applications and the network context.
///
/// Raising never blocks and never fails. When the queue is full the signal is replaced by a flag
/// that makes the next poll sweep every possible source of work.
pub(crate) struct Signals {
    queue: ArrayQueue<Signal>,
    overflow: AtomicBool,
    wakeup: WaitQueue,
}

impl Signals {
    pub(crate) fn new(depth: usize) -> Self {
        Signals {
            queue: ArrayQueue::new(depth.max(1)),
            overflow: AtomicBool::new(false),
            wakeup: WaitQueue::new(),
        }
    }

    pub(crate) fn raise(&self, signal: Signal) {
        if self.queue.push(signal).is_err() {
            self.overflow.store(true, Ordering::Release);
        }
        self.wakeup.wake_all();
    }

    pub(crate) fn pop(&self) -> Option<Signal> {
        self.queue.pop()
    }

    /// Whether signals were lost since the last call.
    pub(crate) fn take_overflow(&self) -> bool {
        self.overflow.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn is_pending(&self) -> bool {
        !self.queue.is_empty() || self.overflow.load(Ordering::Acquire)
    }

    /// Wake `waker` on the next raised signal.
    pub(crate) fn register(&self, waker: &Waker) {
        self.wakeup.register(waker)
    }
}
