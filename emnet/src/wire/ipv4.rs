//! The IPv4 header, addresses and prefixes.
use core::fmt;
use byteorder::{ByteOrder, NetworkEndian};

use super::{checksum, Checksum, Error, Result};

enum_with_unknown! {
    /// IP datagram encapsulated protocol.
    pub enum Protocol(u8) {
        Icmp = 0x01,
        Igmp = 0x02,
        Tcp  = 0x06,
        Udp  = 0x11,
    }
}

/// A four-octet IPv4 address.
#[derive(Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default)]
pub struct Address(pub [u8; 4]);

impl Address {
    /// An unspecified address.
    pub const UNSPECIFIED: Address = Address([0x00; 4]);

    /// The broadcast address.
    pub const BROADCAST: Address = Address([0xff; 4]);

    /// The all-systems multicast group, destination of general IGMP queries.
    pub const ALL_SYSTEMS: Address = Address([224, 0, 0, 1]);

    /// The all-routers multicast group, destination of IGMP leave messages.
    pub const ALL_ROUTERS: Address = Address([224, 0, 0, 2]);

    /// Construct an IPv4 address from parts.
    pub const fn new(a0: u8, a1: u8, a2: u8, a3: u8) -> Address {
        Address([a0, a1, a2, a3])
    }

    /// Construct an IPv4 address from a sequence of octets, in big-endian.
    ///
    /// # Panics
    /// The function panics if `data` is not four octets long.
    pub fn from_bytes(data: &[u8]) -> Address {
        let mut bytes = [0; 4];
        bytes.copy_from_slice(data);
        Address(bytes)
    }

    /// Return an IPv4 address as a sequence of octets, in big-endian.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The address as a host order integer.
    pub fn to_bits(self) -> u32 {
        NetworkEndian::read_u32(&self.0)
    }

    /// Construct an address from a host order integer.
    pub fn from_bits(bits: u32) -> Address {
        let mut bytes = [0; 4];
        NetworkEndian::write_u32(&mut bytes, bits);
        Address(bytes)
    }

    /// Query whether the address is the limited broadcast address.
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Query whether the address is in the multicast range 224.0.0.0/4.
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0xf0 == 224
    }

    /// Query whether the address is the unspecified address.
    pub fn is_unspecified(&self) -> bool {
        self.0 == [0x00; 4]
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let bytes = self.0;
        write!(f, "{}.{}.{}.{}", bytes[0], bytes[1], bytes[2], bytes[3])
    }
}

/// An address together with the length of the prefix of its directly connected network.
#[derive(Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default)]
pub struct Cidr {
    address: Address,
    prefix_len: u8,
}

impl Cidr {
    /// Create an IPv4 CIDR block from the given address and prefix length.
    ///
    /// # Panics
    /// This function panics if the prefix length is larger than 32.
    pub fn new(address: Address, prefix_len: u8) -> Cidr {
        assert!(prefix_len <= 32);
        Cidr { address, prefix_len }
    }

    /// Return the address of this IPv4 CIDR block.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Return the prefix length of this IPv4 CIDR block.
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// The netmask as a host order integer.
    pub fn netmask_bits(&self) -> u32 {
        match self.prefix_len {
            0 => 0,
            len => u32::max_value() << (32 - len),
        }
    }

    /// Query whether the subnetwork described by this CIDR block contains the given address.
    pub fn contains(&self, addr: Address) -> bool {
        let mask = self.netmask_bits();
        addr.to_bits() & mask == self.address.to_bits() & mask
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

byte_wrapper! {
    /// A byte sequence representing an IPv4 packet.
    #[derive(Debug, PartialEq, Eq)]
    pub struct ipv4([u8]);
}

mod field {
    use crate::wire::field::Field;

    pub(crate) const VER_IHL:  usize = 0;
    pub(crate) const DSCP_ECN: usize = 1;
    pub(crate) const LENGTH:   Field = 2..4;
    pub(crate) const IDENT:    Field = 4..6;
    pub(crate) const FLG_OFF:  Field = 6..8;
    pub(crate) const TTL:      usize = 8;
    pub(crate) const PROTOCOL: usize = 9;
    pub(crate) const CHECKSUM: Field = 10..12;
    pub(crate) const SRC_ADDR: Field = 12..16;
    pub(crate) const DST_ADDR: Field = 16..20;

    /// Don't fragment.
    pub(crate) const FLG_DF: u16 = 0x4000;
    /// More fragments and the fragment offset.
    pub(crate) const FRAGMENT: u16 = 0x3fff;
}

/// The length of the only header layout we handle, without options.
pub const HEADER_LEN: usize = field::DST_ADDR.end;

/// The version and header length byte of a header without options.
pub const VER_IHL: u8 = 0x45;

impl ipv4 {
    /// Imbue a raw octet buffer with IPv4 packet structure.
    pub fn new_unchecked(data: &[u8]) -> &Self {
        Self::__from_macro_new_unchecked(data)
    }

    /// Imbue a mutable octet buffer with IPv4 packet structure.
    pub fn new_unchecked_mut(data: &mut [u8]) -> &mut Self {
        Self::__from_macro_new_unchecked_mut(data)
    }

    /// Check the length and imbue the buffer with IPv4 packet structure.
    pub fn new_checked(data: &[u8]) -> Result<&Self> {
        Self::new_unchecked(data).check_len()?;
        Ok(Self::new_unchecked(data))
    }

    /// Ensure that no accessor method will panic if called.
    pub fn check_len(&self) -> Result<()> {
        if self.0.len() < HEADER_LEN {
            Err(Error::Truncated)
        } else {
            Ok(())
        }
    }

    /// Return the version and header length byte.
    pub fn ver_ihl(&self) -> u8 {
        self.0[field::VER_IHL]
    }

    /// Return the total length field.
    pub fn total_len(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::LENGTH])
    }

    /// Return the fragment identification field.
    pub fn ident(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::IDENT])
    }

    /// Query whether more fragments follow or the fragment offset is non-zero.
    pub fn is_fragment(&self) -> bool {
        NetworkEndian::read_u16(&self.0[field::FLG_OFF]) & field::FRAGMENT != 0
    }

    /// Return the "don't fragment" flag.
    pub fn dont_frag(&self) -> bool {
        NetworkEndian::read_u16(&self.0[field::FLG_OFF]) & field::FLG_DF != 0
    }

    /// Return the time to live field.
    pub fn hop_limit(&self) -> u8 {
        self.0[field::TTL]
    }

    /// Return the protocol field.
    pub fn protocol(&self) -> Protocol {
        Protocol::from(self.0[field::PROTOCOL])
    }

    /// Return the header checksum field.
    pub fn checksum(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::CHECKSUM])
    }

    /// Return the source address field.
    pub fn src_addr(&self) -> Address {
        Address::from_bytes(&self.0[field::SRC_ADDR])
    }

    /// Return the destination address field.
    pub fn dst_addr(&self) -> Address {
        Address::from_bytes(&self.0[field::DST_ADDR])
    }

    /// Validate the header checksum.
    pub fn verify_checksum(&self) -> bool {
        checksum::data(&self.0[..HEADER_LEN]) == !0
    }

    /// Compute the header checksum as it would be written into the header.
    ///
    /// The checksum field itself is treated as zero.
    pub fn compute_checksum(&self) -> u16 {
        let header = &self.0[..HEADER_LEN];
        !checksum::combine(&[
            checksum::data(&header[..field::CHECKSUM.start]),
            checksum::data(&header[field::CHECKSUM.end..]),
        ])
    }

    /// Set the version and header length byte.
    pub fn set_ver_ihl(&mut self, value: u8) {
        self.0[field::VER_IHL] = value;
    }

    /// Set the differentiated services and congestion notification byte.
    pub fn set_dscp_ecn(&mut self, value: u8) {
        self.0[field::DSCP_ECN] = value;
    }

    /// Set the total length field.
    pub fn set_total_len(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::LENGTH], value)
    }

    /// Set the fragment identification field.
    pub fn set_ident(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::IDENT], value)
    }

    /// Set the flags and offset to an unfragmented datagram with the given "don't fragment" bit.
    pub fn set_unfragmented(&mut self, dont_frag: bool) {
        let raw = if dont_frag { field::FLG_DF } else { 0 };
        NetworkEndian::write_u16(&mut self.0[field::FLG_OFF], raw)
    }

    /// Set the time to live field.
    pub fn set_hop_limit(&mut self, value: u8) {
        self.0[field::TTL] = value
    }

    /// Set the protocol field.
    pub fn set_protocol(&mut self, value: Protocol) {
        self.0[field::PROTOCOL] = value.into()
    }

    /// Set the header checksum field.
    pub fn set_checksum(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::CHECKSUM], value)
    }

    /// Set the source address field.
    pub fn set_src_addr(&mut self, value: Address) {
        self.0[field::SRC_ADDR].copy_from_slice(value.as_bytes())
    }

    /// Set the destination address field.
    pub fn set_dst_addr(&mut self, value: Address) {
        self.0[field::DST_ADDR].copy_from_slice(value.as_bytes())
    }

    /// Compute and fill in the header checksum.
    pub fn fill_checksum(&mut self) {
        let checksum = self.compute_checksum();
        self.set_checksum(checksum)
    }
}

/// High-level representation of an outgoing IPv4 header.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Repr {
    /// The source address.
    pub src_addr: Address,
    /// The destination address.
    pub dst_addr: Address,
    /// The encapsulated protocol.
    pub protocol: Protocol,
    /// The length of the encapsulated payload.
    pub payload_len: usize,
    /// The time to live.
    pub hop_limit: u8,
    /// The fragment identification.
    pub ident: u16,
    /// Whether to set the "don't fragment" bit.
    pub dont_frag: bool,
}

impl Repr {
    /// Parse the addressing information of a validated header.
    pub fn parse(packet: &ipv4) -> Result<Repr> {
        packet.check_len()?;
        if packet.ver_ihl() != VER_IHL {
            return Err(Error::Unsupported);
        }
        let total = packet.total_len() as usize;
        if total < HEADER_LEN {
            return Err(Error::Malformed);
        }
        Ok(Repr {
            src_addr: packet.src_addr(),
            dst_addr: packet.dst_addr(),
            protocol: packet.protocol(),
            payload_len: total - HEADER_LEN,
            hop_limit: packet.hop_limit(),
            ident: packet.ident(),
            dont_frag: packet.dont_frag(),
        })
    }

    /// The length of the emitted header.
    pub fn header_len(&self) -> usize {
        HEADER_LEN
    }

    /// Emit a complete header into the first `HEADER_LEN` bytes of `packet`.
    pub fn emit(&self, packet: &mut ipv4, checksum: Checksum) {
        packet.set_ver_ihl(VER_IHL);
        packet.set_dscp_ecn(0);
        packet.set_total_len((HEADER_LEN + self.payload_len) as u16);
        packet.set_ident(self.ident);
        packet.set_unfragmented(self.dont_frag);
        packet.set_hop_limit(self.hop_limit);
        packet.set_protocol(self.protocol);
        packet.set_src_addr(self.src_addr);
        packet.set_dst_addr(self.dst_addr);
        packet.set_checksum(0);
        if checksum.manual() {
            packet.fill_checksum();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // An ICMP echo request from 10.0.0.2 to 10.0.0.1, header only.
    static HEADER_BYTES: [u8; 20] =
        [0x45, 0x00, 0x00, 0x54,
         0x1c, 0x46, 0x40, 0x00,
         0x40, 0x01, 0x0a, 0x61,
         0x0a, 0x00, 0x00, 0x02,
         0x0a, 0x00, 0x00, 0x01];

    #[test]
    fn checksum_round_trip() {
        let packet = ipv4::new_checked(&HEADER_BYTES[..]).unwrap();
        assert!(packet.verify_checksum());
        assert_eq!(packet.compute_checksum(), packet.checksum());

        let mut bytes = HEADER_BYTES;
        let packet = ipv4::new_unchecked_mut(&mut bytes[..]);
        packet.set_checksum(0);
        assert!(!packet.verify_checksum());
        packet.fill_checksum();
        assert_eq!(packet.checksum(), 0x0a61);
        assert!(packet.verify_checksum());
    }

    #[test]
    fn deconstruct() {
        let packet = ipv4::new_checked(&HEADER_BYTES[..]).unwrap();
        let repr = Repr::parse(packet).unwrap();
        assert_eq!(repr.src_addr, Address::new(10, 0, 0, 2));
        assert_eq!(repr.dst_addr, Address::new(10, 0, 0, 1));
        assert_eq!(repr.protocol, Protocol::Icmp);
        assert_eq!(repr.payload_len, 0x54 - 20);
        assert!(repr.dont_frag);
        assert!(!packet.is_fragment());
    }

    #[test]
    fn emit_matches_parse() {
        let repr = Repr {
            src_addr: Address::new(192, 168, 1, 10),
            dst_addr: Address::BROADCAST,
            protocol: Protocol::Udp,
            payload_len: 8,
            hop_limit: 64,
            ident: 0x1234,
            dont_frag: false,
        };
        let mut bytes = [0u8; 28];
        repr.emit(ipv4::new_unchecked_mut(&mut bytes[..]), Checksum::Manual);
        let packet = ipv4::new_checked(&bytes[..]).unwrap();
        assert!(packet.verify_checksum());
        assert_eq!(Repr::parse(packet), Ok(repr));
    }

    #[test]
    fn cidr() {
        let cidr = Cidr::new(Address::new(192, 168, 1, 10), 24);
        assert!(cidr.contains(Address::new(192, 168, 1, 1)));
        assert!(!cidr.contains(Address::new(192, 168, 2, 1)));
        assert!(Cidr::new(Address::UNSPECIFIED, 0).contains(Address::new(8, 8, 8, 8)));
        assert!(Address::new(239, 1, 2, 3).is_multicast());
        assert!(!Address::new(192, 168, 1, 255).is_multicast());
    }
}
