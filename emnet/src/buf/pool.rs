use alloc::sync::Arc;
use alloc::vec::Vec;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};

use crate::wait::WaitQueue;

/// Callback fired when a pool recovers from being empty.
pub type RecoveryHook = Arc<dyn Fn() + Send + Sync>;

/// Number of free items a pool keeps back from callers that can not wait.
pub const LOW_WATERMARK: usize = 2;

/// A fixed set of interchangeable items.
///
/// The free list is the only state and it is only touched inside a critical section, so an
/// interrupt level producer may release items while the network context acquires them. The number
/// of items never changes after construction, items only move between the free list and their
/// current owner.
pub struct Pool<T> {
    free: spin::Mutex<Vec<T>>,
    capacity: usize,
    waiters: WaitQueue,
    hook: spin::Mutex<Option<RecoveryHook>>,
}

impl<T> Pool<T> {
    /// Create a pool that owns all of `items`.
    pub fn new(items: Vec<T>) -> Self {
        Pool {
            capacity: items.len(),
            free: spin::Mutex::new(items),
            waiters: WaitQueue::new(),
            hook: spin::Mutex::new(None),
        }
    }

    /// The number of items owned by the pool.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The number of items currently free.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// Install the callback run whenever availability goes from zero to one.
    pub fn set_recovery_hook(&self, hook: RecoveryHook) {
        *self.hook.lock() = Some(hook);
    }

    /// Take an item without waiting.
    ///
    /// Fails while fewer than [`LOW_WATERMARK`] items are free. The reserve is left for callers
    /// that are able to wait, such as an application thread writing into a connection.
    ///
    /// [`LOW_WATERMARK`]: constant.LOW_WATERMARK.html
    pub fn try_acquire(&self) -> Option<T> {
        let mut free = self.free.lock();
        if free.len() < LOW_WATERMARK {
            return None;
        }
        free.pop()
    }

    /// Take any free item, including the reserve.
    fn take(&self) -> Option<T> {
        self.free.lock().pop()
    }

    /// Wait until an item is free and take it.
    pub fn acquire(&self) -> Acquire<'_, T> {
        Acquire { pool: self }
    }

    /// Take an item, parking the current thread while the pool is empty.
    #[cfg(feature = "std")]
    pub fn acquire_blocking(&self) -> T {
        crate::wait::block_on(self.acquire())
    }

    /// Return an item to the free list.
    pub fn release(&self, item: T) {
        let recovered = {
            let mut free = self.free.lock();
            free.push(item);
            free.len() == 1
        };

        if recovered {
            self.waiters.wake_one();
            let hook = self.hook.lock().clone();
            if let Some(hook) = hook {
                hook();
            }
        }
    }
}

/// Future returned by [`Pool::acquire`].
///
/// [`Pool::acquire`]: struct.Pool.html#method.acquire
pub struct Acquire<'a, T> {
    pool: &'a Pool<T>,
}

impl<T> Future for Acquire<'_, T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<T> {
        if let Some(item) = self.pool.take() {
            return Poll::Ready(item);
        }
        self.pool.waiters.register(cx.waker());
        // An item may have been released between the check and the registration.
        match self.pool.take() {
            Some(item) => Poll::Ready(item),
            None => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn low_watermark() {
        let pool = Pool::new(vec![1u8, 2, 3]);
        assert!(pool.try_acquire().is_some());
        assert!(pool.try_acquire().is_some());
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.try_acquire(), None);
        assert_eq!(pool.capacity(), 3);
    }

    #[test]
    fn recovery_hook_on_empty() {
        let fired = Arc::new(AtomicUsize::new(0));
        let pool = Pool::new(vec![0u32; 2]);
        let counter = fired.clone();
        pool.set_recovery_hook(Arc::new(move || { counter.fetch_add(1, Ordering::SeqCst); }));

        let a = pool.try_acquire().unwrap();
        let b = pool.take().unwrap();
        assert_eq!(pool.available(), 0);

        pool.release(a);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        // Only the transition from empty counts.
        pool.release(b);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[cfg(feature = "std")]
    fn blocking_acquire_takes_reserve() {
        let pool = Pool::new(vec![7u8]);
        assert_eq!(pool.try_acquire(), None);
        assert_eq!(pool.acquire_blocking(), 7);
    }

    #[test]
    #[cfg(feature = "std")]
    fn blocking_acquire_waits_for_release() {
        let pool = Arc::new(Pool::new(vec![5u8]));
        let item = pool.take().unwrap();
        let releaser = pool.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            releaser.release(item);
        });
        assert_eq!(pool.acquire_blocking(), 5);
        handle.join().unwrap();
    }
}
