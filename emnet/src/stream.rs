//! The byte-stream interface between services and connections.
//!
//! Services read and write through the [`Stream`] trait and never see the protocol underneath.
//! Reads and writes block the calling thread, never the network context. Code that must not block
//! asks [`Stream::poll`] first and awaits the returned [`Waitable`].
//!
//! [`Stream`]: trait.Stream.html
//! [`Stream::poll`]: trait.Stream.html#tymethod.poll
//! [`Waitable`]: struct.Waitable.html
use alloc::sync::Arc;
use core::fmt;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};

use bitflags::bitflags;

/// Errors reported by stream operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, thiserror::Error)]
pub enum Error {
    /// The stream has ended, or was never connected.
    #[error("not connected")]
    NotConnected,

    /// The peer reset the connection.
    #[error("connection reset")]
    Reset,

    /// The peer stopped answering.
    #[error("connection timed out")]
    TimedOut,

    /// The peer refused the connection.
    #[error("connection refused")]
    Refused,

    /// The operation would block and blocking is not available.
    #[error("operation would block")]
    WouldBlock,
}

bitflags! {
    /// Options of a write.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct WriteFlags: u8 {
        /// Accept what fits right now and return, possibly zero bytes.
        const NO_WAIT = 0x01;
        /// Keep waiting until every byte was accepted.
        const ALL = 0x02;
    }
}

/// The direction of a pending operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Waiting for data to read.
    Read,
    /// Waiting for space to write.
    Write,
}

/// A bidirectional byte stream.
pub trait Stream {
    /// Read into `buf`, waiting until at least `minimum` bytes are available.
    ///
    /// Returns fewer than `minimum` bytes only at the end of the data. Once all data was read
    /// from a stream that has ended, every further read fails.
    fn read(&mut self, buf: &mut [u8], minimum: usize) -> Result<usize, Error>;

    /// Write from `buf` and return the number of bytes accepted.
    ///
    /// An empty `buf` pushes out data already written without waiting for a delayed
    /// acknowledgement.
    fn write(&mut self, buf: &[u8], flags: WriteFlags) -> Result<usize, Error>;

    /// A waitable for the direction, or `None` if the operation would not block.
    fn poll(&self, direction: Direction) -> Option<Waitable>;

    /// Close the stream, without waiting for the peer.
    fn close(&mut self);
}

/// The source of readiness behind a [`Waitable`].
///
/// [`Waitable`]: struct.Waitable.html
pub(crate) trait Readiness: Send + Sync {
    /// Whether an operation in `direction` needing `minimum` bytes would proceed.
    fn is_ready(&self, direction: Direction, minimum: usize) -> bool;

    /// Wake `waker` on the next change for `direction`.
    fn register(&self, direction: Direction, waker: &Waker);
}

/// A pending stream operation.
///
/// Resolves once the operation would no longer block. This does not mean that it succeeds, the
/// stream may have ended in the meantime.
pub struct Waitable {
    source: Arc<dyn Readiness>,
    direction: Direction,
    minimum: usize,
}

impl Waitable {
    pub(crate) fn new(source: Arc<dyn Readiness>, direction: Direction, minimum: usize) -> Self {
        Waitable { source, direction, minimum }
    }

    /// The direction waited for.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Park the current thread until the operation would no longer block.
    #[cfg(feature = "std")]
    pub fn wait(self) {
        crate::wait::block_on(self)
    }
}

impl Future for Waitable {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<()> {
        let this = &*self;
        if this.source.is_ready(this.direction, this.minimum) {
            return Poll::Ready(());
        }
        this.source.register(this.direction, cx.waker());
        // The network context may have made progress before the waker was registered.
        if this.source.is_ready(this.direction, this.minimum) {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

impl fmt::Debug for Waitable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Waitable")
            .field("direction", &self.direction)
            .field("minimum", &self.minimum)
            .finish()
    }
}
