//! A zero-copy IPv4 network engine for single address space embedded runtimes.
//!
//! ## Table of contents
//!
//! 1. [Design](#design)
//! 2. [Packet buffers](buf/index.html)
//! 3. [The wire module](wire/index.html)
//! 4. [The layers](layer/index.html)
//!    1. [Interfaces and next-hops](layer/netif/index.html)
//!    1. [Ethernet](layer/eth/index.html) and [ARP](layer/arp/index.html)
//!    1. [IPv4](layer/ip/index.html), [ICMP](layer/icmp/index.html) and [IGMP](layer/igmp/index.html)
//!    1. [Udp](layer/udp/index.html)
//!    1. [Tcp](layer/tcp/index.html)
//! 5. [Byte streams](stream/index.html)
//! 6. [Network interfaces](nic/index.html)
//! 7. [The event loop](stack/index.html)
//!
//! ## Design
//!
//! All packet data lives in segments handed out by a fixed-size [`BufferPool`]. A received frame
//! is never copied on its way up the stack: each layer validates its header in place, drops it
//! from the head of the chain and hands the remaining chain to the next layer. Output is the
//! mirror image, every layer prepends its header into headroom reserved when the buffer was
//! allocated.
//!
//! There is exactly one context doing protocol work, the [`Stack`]. Drivers run in interrupt
//! context and may only touch the buffer pool and the bounded receive queues of their interface,
//! everything else is deferred to [`Stack::poll`]. The only place where a thread ever blocks is an
//! application reading from or writing to a [`TcpStream`].
//!
//! The stack owns all of its state. There are no globals, so tests construct as many independent
//! instances as they like.
//!
//! [`BufferPool`]: buf/struct.BufferPool.html
//! [`Stack`]: stack/struct.Stack.html
//! [`Stack::poll`]: stack/struct.Stack.html#method.poll
//! [`TcpStream`]: layer/tcp/struct.TcpStream.html
#![warn(missing_docs)]
#![warn(unreachable_pub)]

// tests should be able to use `std`
#![cfg_attr(all(
    not(feature = "std"),
    not(test)),
no_std)]

extern crate alloc;

#[macro_use] mod macros;
pub mod buf;
pub mod layer;
pub mod managed;
pub mod nic;
pub mod stack;
pub mod stream;
pub mod time;
pub mod wait;
pub mod wire;

pub use self::stack::{Config, Stack};
