//! Packet buffers.
//!
//! Every packet, received or sent, lives in a chain of fixed size segments drawn from a
//! [`BufferPool`]. The head of a chain is a [`Pbuf`], which owns the entire chain and returns it
//! to the pool when dropped. Layers move through the headers of a received packet by dropping
//! bytes from the front, and build outgoing packets by prepending into headroom that was reserved
//! at allocation time.
//!
//! ## Invariants
//!
//! * The `pktlen` of a node is its own `buflen` plus the `pktlen` of the next node. The head
//!   therefore reports the length of the whole packet.
//! * The head node carries the start-of-packet flag, the last node the end-of-packet flag, unless
//!   a driver is still assembling a fragmented frame.
//! * Allocations that can not wait fail while the pool is at its low watermark, see
//!   [`LOW_WATERMARK`].
//!
//! [`BufferPool`]: struct.BufferPool.html
//! [`Pbuf`]: struct.Pbuf.html
//! [`LOW_WATERMARK`]: constant.LOW_WATERMARK.html
mod pbuf;
mod pool;
mod queue;

#[cfg(test)]
mod tests;

pub use self::pbuf::{BufferPool, Flags, Pbuf};
pub use self::pool::{Acquire, Pool, RecoveryHook, LOW_WATERMARK};
pub use self::queue::PbufQueue;
