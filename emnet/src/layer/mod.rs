//! The process logic of protocol layers.
//!
//! ## Layering
//!
//! Each protocol layer is split into two parts; the packet structure contained in `wire` and the
//! processing part in this module. All layers operate on a shared context, the `Io` half of the
//! stack, which owns the buffer pool, the interfaces with their next-hop tables, the timers and
//! the signal queue. Protocol endpoints with their own state, the UDP registry, the IGMP
//! memberships and the TCP engine, sit next to it.
//!
//! ## Receiving
//!
//! A frame walks up the layers by value. Every layer validates its header, drops it from the front
//! of the buffer and hands the rest to the layer above. A packet that fails validation is freed on
//! the spot and counted in the statistics of its interface. Layers that answer a packet in place,
//! ARP and ICMP echo, rewrite the received buffer and send it back down.
//!
//! ## Sending
//!
//! Outgoing packets are built back to front: the payload is written first, with enough headroom
//! reserved for all headers, and each layer prepends its header on the way down. IPv4 chooses the
//! interface through the next-hop table, which holds back one packet while the link address is
//! still being resolved.
pub mod arp;
pub mod eth;
pub mod icmp;
pub mod igmp;
pub mod ip;
pub mod netif;
pub mod tcp;
pub mod udp;

#[cfg(test)]
mod tests;

pub use self::netif::{NetifConfig, NetifFlags, NetifId, NetifStats, NexthopInfo, NexthopState};

/// The result type of layer operations.
pub type Result<T> = core::result::Result<T, Error>;

/// The error type of layer operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, thiserror::Error)]
pub enum Error {
    /// The operation was not permitted.
    ///
    /// Returned when the device, endpoint or packet does not allow or implement an operation.
    #[error("illegal operation")]
    Illegal,

    /// Not enough space for the requested packet.
    ///
    /// Also returned when the headroom of a buffer is too small for a header. In contrast to
    /// `Illegal` this would signal that a smaller size may be possible.
    #[error("bad packet size")]
    BadSize,

    /// Unable to find a route towards the destination address.
    #[error("no route to host")]
    Unreachable,

    /// The action could not be completed because there were not enough resources.
    ///
    /// The main difference towards `Illegal` is that it would have been legal with more
    /// resources, such as free buffers or free table entries.
    #[error("resources exhausted")]
    Exhausted,
}

/// Can convert from a wire error.
///
/// This indicates some layer tried to operate on a packet but failed.
impl From<crate::wire::Error> for Error {
    fn from(err: crate::wire::Error) -> Self {
        match err {
            crate::wire::Error::Truncated => Error::BadSize,
            _ => Error::Illegal,
        }
    }
}
