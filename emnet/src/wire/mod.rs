//! Byte-slice views of the protocol headers.
//!
//! Every header gets a dynamically sized wrapper around `[u8]` (`ethernet`, `ipv4`, `tcp`, ...)
//! with width and endianness explicit accessors for its fields. The wrappers never copy and never
//! alias a struct onto the buffer, a field read is always a `NetworkEndian` read out of a
//! sub-slice. Construct them with `new_checked` on untrusted input, which validates that no
//! accessor can panic, and with `new_unchecked_mut` when writing a header into space that the
//! caller already sized correctly.
//!
//! Checksum arithmetic shared by IPv4, ICMP, IGMP, UDP and TCP lives in [`checksum`].
//!
//! [`checksum`]: checksum/index.html
mod field {
    pub(crate) type Field = ::core::ops::Range<usize>;
    pub(crate) type Rest  = ::core::ops::RangeFrom<usize>;
}

pub mod arp;
pub mod checksum;
pub mod ethernet;
pub mod icmpv4;
pub mod igmp;
pub mod ipv4;
pub mod tcp;
pub mod udp;

pub use self::ethernet::{
    Address as EthernetAddress,
    EtherType as EthernetProtocol};

pub use self::ipv4::{
    Address as Ipv4Address,
    Cidr as Ipv4Cidr,
    Protocol as IpProtocol};

pub use self::tcp::{
    Flags as TcpFlags,
    SeqNumber as TcpSeqNumber};

/// The error type for parsing packets off the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The buffer is shorter than the header claims or than the minimum header length.
    #[error("truncated packet")]
    Truncated,

    /// The checksum did not verify.
    #[error("checksum error")]
    WrongChecksum,

    /// A field value, such as a hardware type, that we do not handle.
    #[error("unrecognized packet")]
    Unrecognized,

    /// The packet contradicts itself, e.g. a header length smaller than the fixed header.
    #[error("malformed packet")]
    Malformed,

    /// The packet uses a feature that this stack does not implement, such as IP options or
    /// fragmentation.
    #[error("unsupported option")]
    Unsupported,
}

/// The result type for parsing packets.
pub type Result<T> = core::result::Result<T, Error>;

/// Describes how to handle checksums.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Checksum {
    /// Checksum must be computed or checked manually.
    Manual,

    /// The checksum field is filled or checked by the NIC.
    Ignored,
}

impl Checksum {
    /// Choose the handling from whether the interface offloads this checksum.
    pub fn offloaded(offload: bool) -> Self {
        if offload {
            Checksum::Ignored
        } else {
            Checksum::Manual
        }
    }

    /// Whether the software has to compute or verify the checksum.
    pub fn manual(self) -> bool {
        self == Checksum::Manual
    }
}
