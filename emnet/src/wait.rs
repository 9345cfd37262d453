//! Wait queues connecting the network context to blocked callers.
//!
//! The network context never blocks. Whenever it makes progress that someone might be waiting on,
//! such as returning a buffer to an empty pool or receiving data for a connection, it wakes the
//! matching [`WaitQueue`]. Waiters are plain `core::task::Waker`s, so an async runtime can wait on
//! the same queues as a thread that parks itself through [`block_on`].
//!
//! [`WaitQueue`]: struct.WaitQueue.html
//! [`block_on`]: fn.block_on.html
use alloc::collections::VecDeque;
use core::task::Waker;

/// A FIFO of wakers.
#[derive(Debug, Default)]
pub struct WaitQueue {
    wakers: spin::Mutex<VecDeque<Waker>>,
}

impl WaitQueue {
    /// An empty queue.
    pub fn new() -> Self {
        WaitQueue::default()
    }

    /// Register interest, unless an equivalent waker is already queued.
    pub fn register(&self, waker: &Waker) {
        let mut wakers = self.wakers.lock();
        if !wakers.iter().any(|queued| queued.will_wake(waker)) {
            wakers.push_back(waker.clone());
        }
    }

    /// Wake the longest waiting task.
    pub fn wake_one(&self) {
        let waker = self.wakers.lock().pop_front();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Wake every waiting task.
    pub fn wake_all(&self) {
        let wakers = core::mem::take(&mut *self.wakers.lock());
        for waker in wakers {
            waker.wake();
        }
    }

    /// The number of registered waiters.
    pub fn len(&self) -> usize {
        self.wakers.lock().len()
    }

    /// Whether nobody waits.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Run a future to completion by parking the current thread between polls.
#[cfg(feature = "std")]
pub fn block_on<F: core::future::Future>(fut: F) -> F::Output {
    use alloc::sync::Arc;
    use core::task::{Context, Poll};

    struct Unpark(std::thread::Thread);

    impl std::task::Wake for Unpark {
        fn wake(self: Arc<Self>) {
            self.0.unpark()
        }

        fn wake_by_ref(self: &Arc<Self>) {
            self.0.unpark()
        }
    }

    let waker = Waker::from(Arc::new(Unpark(std::thread::current())));
    let mut cx = Context::from_waker(&waker);
    let mut fut = alloc::boxed::Box::pin(fut);
    loop {
        match fut.as_mut().poll(&mut cx) {
            Poll::Ready(output) => return output,
            Poll::Pending => std::thread::park(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicUsize, Ordering};

    struct Count(AtomicUsize);

    impl std::task::Wake for Count {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn wake_in_order_without_duplicates() {
        let count = Arc::new(Count(AtomicUsize::new(0)));
        let waker = Waker::from(count.clone());
        let queue = WaitQueue::new();
        queue.register(&waker);
        queue.register(&waker);
        assert_eq!(queue.len(), 1);
        queue.wake_one();
        assert_eq!(count.0.load(Ordering::SeqCst), 1);
        assert!(queue.is_empty());
        queue.wake_all();
        assert_eq!(count.0.load(Ordering::SeqCst), 1);
    }
}
