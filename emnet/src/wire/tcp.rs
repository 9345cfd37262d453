//! The TCP header and modular sequence numbers.
use core::{cmp, fmt, ops};
use byteorder::{ByteOrder, NetworkEndian};

use super::{Error, Result};

/// A TCP sequence number.
///
/// A sequence number is a monotonically advancing integer modulo 2<sup>32</sup>. Two sequence
/// numbers are only ever compared through their signed distance, so ordering stays correct across
/// the wraparound as long as both are within 2<sup>31</sup> of each other.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Hash)]
pub struct SeqNumber(pub i32);

impl SeqNumber {
    /// The sequence number as it appears on the wire.
    pub fn as_u32(self) -> u32 {
        self.0 as u32
    }

    /// Construct from the unsigned wire value.
    pub fn from_u32(value: u32) -> Self {
        SeqNumber(value as i32)
    }

    /// The larger of two sequence numbers in modular order.
    pub fn max(self, other: SeqNumber) -> SeqNumber {
        if self - other >= 0 { self } else { other }
    }

    /// The smaller of two sequence numbers in modular order.
    pub fn min(self, other: SeqNumber) -> SeqNumber {
        if self - other <= 0 { self } else { other }
    }
}

impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0 as u32)
    }
}

impl ops::Add<usize> for SeqNumber {
    type Output = SeqNumber;

    fn add(self, rhs: usize) -> SeqNumber {
        SeqNumber(self.0.wrapping_add(rhs as u32 as i32))
    }
}

impl ops::Sub<usize> for SeqNumber {
    type Output = SeqNumber;

    fn sub(self, rhs: usize) -> SeqNumber {
        SeqNumber(self.0.wrapping_sub(rhs as u32 as i32))
    }
}

impl ops::AddAssign<usize> for SeqNumber {
    fn add_assign(&mut self, rhs: usize) {
        *self = *self + rhs;
    }
}

/// The signed distance `self - rhs` in sequence space.
impl ops::Sub for SeqNumber {
    type Output = i32;

    fn sub(self, rhs: SeqNumber) -> i32 {
        self.0.wrapping_sub(rhs.0)
    }
}

impl cmp::PartialOrd for SeqNumber {
    fn partial_cmp(&self, other: &SeqNumber) -> Option<cmp::Ordering> {
        self.0.wrapping_sub(other.0).partial_cmp(&0)
    }
}

/// A set of tcp flags.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Flags(pub u16);

impl Flags {
    /// No more data from the sender.
    pub const FIN: Flags = Flags(field::FLG_FIN);
    /// Synchronize sequence numbers.
    pub const SYN: Flags = Flags(field::FLG_SYN);
    /// Reset the connection.
    pub const RST: Flags = Flags(field::FLG_RST);
    /// Push function.
    pub const PSH: Flags = Flags(field::FLG_PSH);
    /// The acknowledgment field is significant.
    pub const ACK: Flags = Flags(field::FLG_ACK);

    /// No flags at all.
    pub fn empty() -> Self {
        Flags(0)
    }

    /// Whether all flags of `other` are set.
    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether the FIN flag is set.
    pub fn fin(self) -> bool {
        self.contains(Flags::FIN)
    }

    /// Whether the SYN flag is set.
    pub fn syn(self) -> bool {
        self.contains(Flags::SYN)
    }

    /// Whether the RST flag is set.
    pub fn rst(self) -> bool {
        self.contains(Flags::RST)
    }

    /// Whether the ACK flag is set.
    pub fn ack(self) -> bool {
        self.contains(Flags::ACK)
    }

    /// The number of sequence numbers that SYN and FIN occupy.
    pub fn sequence_len(self) -> usize {
        self.syn() as usize + self.fin() as usize
    }
}

impl ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        const NAMES: [(Flags, &str); 5] = [
            (Flags::SYN, "SYN"),
            (Flags::ACK, "ACK"),
            (Flags::FIN, "FIN"),
            (Flags::RST, "RST"),
            (Flags::PSH, "PSH"),
        ];
        let mut first = true;
        for &(flag, name) in NAMES.iter() {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("-")?;
        }
        Ok(())
    }
}

byte_wrapper! {
    /// A byte sequence representing a TCP segment.
    #[derive(Debug, PartialEq, Eq)]
    pub struct tcp([u8]);
}

mod field {
    use crate::wire::field::Field;

    pub(crate) const SRC_PORT: Field = 0..2;
    pub(crate) const DST_PORT: Field = 2..4;
    pub(crate) const SEQ_NUM:  Field = 4..8;
    pub(crate) const ACK_NUM:  Field = 8..12;
    pub(crate) const FLAGS:    Field = 12..14;
    pub(crate) const WIN_SIZE: Field = 14..16;
    pub(crate) const CHECKSUM: Field = 16..18;
    pub(crate) const URGENT:   Field = 18..20;

    pub(crate) const FLG_FIN: u16 = 0x001;
    pub(crate) const FLG_SYN: u16 = 0x002;
    pub(crate) const FLG_RST: u16 = 0x004;
    pub(crate) const FLG_PSH: u16 = 0x008;
    pub(crate) const FLG_ACK: u16 = 0x010;

    pub(crate) const OPT_END: u8 = 0x00;
    pub(crate) const OPT_NOP: u8 = 0x01;
    pub(crate) const OPT_MSS: u8 = 0x02;
}

/// The length of the header without options.
pub const HEADER_LEN: usize = field::URGENT.end;

/// The length of the MSS option.
pub const MSS_OPTION_LEN: usize = 4;

impl tcp {
    /// Imbue a raw octet buffer with TCP structure.
    pub fn new_unchecked(data: &[u8]) -> &Self {
        Self::__from_macro_new_unchecked(data)
    }

    /// Imbue a mutable octet buffer with TCP structure.
    pub fn new_unchecked_mut(data: &mut [u8]) -> &mut Self {
        Self::__from_macro_new_unchecked_mut(data)
    }

    /// Check the length and imbue the buffer with TCP structure.
    pub fn new_checked(data: &[u8]) -> Result<&Self> {
        Self::new_unchecked(data).check_len()?;
        Ok(Self::new_unchecked(data))
    }

    /// Ensure that no header accessor method will panic if called.
    ///
    /// Returns `Err(Error::Truncated)` if the buffer is shorter than the header and
    /// `Err(Error::Malformed)` if the header length field is smaller than the fixed header.
    pub fn check_len(&self) -> Result<()> {
        let len = self.0.len();
        if len < HEADER_LEN {
            return Err(Error::Truncated);
        }
        let header_len = self.header_len();
        if header_len < HEADER_LEN {
            Err(Error::Malformed)
        } else if len < header_len {
            Err(Error::Truncated)
        } else {
            Ok(())
        }
    }

    /// Return the source port field.
    pub fn src_port(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::SRC_PORT])
    }

    /// Return the destination port field.
    pub fn dst_port(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::DST_PORT])
    }

    /// Return the sequence number field.
    pub fn seq_number(&self) -> SeqNumber {
        SeqNumber(NetworkEndian::read_i32(&self.0[field::SEQ_NUM]))
    }

    /// Return the acknowledgement number field.
    pub fn ack_number(&self) -> SeqNumber {
        SeqNumber(NetworkEndian::read_i32(&self.0[field::ACK_NUM]))
    }

    /// Return the header length, in octets.
    pub fn header_len(&self) -> usize {
        ((self.0[field::FLAGS.start] >> 4) as usize) * 4
    }

    /// Read all flags at once.
    pub fn flags(&self) -> Flags {
        Flags(NetworkEndian::read_u16(&self.0[field::FLAGS]) & 0x1ff)
    }

    /// Return the window size field.
    pub fn window_len(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::WIN_SIZE])
    }

    /// Return the checksum field.
    pub fn checksum(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::CHECKSUM])
    }

    /// Return the options, the bytes between the fixed header and the payload.
    pub fn options(&self) -> &[u8] {
        &self.0[HEADER_LEN..self.header_len()]
    }

    /// Find the maximum segment size option.
    ///
    /// Option kinds other than end, no-op and MSS are skipped by their length.
    pub fn max_seg_size(&self) -> Result<Option<u16>> {
        let mut options = self.options();
        while let Some((&kind, rest)) = options.split_first() {
            match kind {
                field::OPT_END => break,
                field::OPT_NOP => options = rest,
                _ => {
                    let len = *rest.first().ok_or(Error::Truncated)? as usize;
                    if len < 2 || len > options.len() {
                        return Err(Error::Malformed);
                    }
                    if kind == field::OPT_MSS {
                        if len != MSS_OPTION_LEN {
                            return Err(Error::Malformed);
                        }
                        return Ok(Some(NetworkEndian::read_u16(&options[2..4])));
                    }
                    options = &options[len..];
                },
            }
        }
        Ok(None)
    }

    /// Return the payload.
    pub fn payload_slice(&self) -> &[u8] {
        &self.0[self.header_len()..]
    }

    /// Set the checksum field.
    pub fn set_checksum(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::CHECKSUM], value)
    }
}

/// The header fields of a segment.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Repr {
    /// The source port.
    pub src_port: u16,
    /// The destination port.
    pub dst_port: u16,
    /// The sequence number of the first octet, or of the SYN.
    pub seq_number: SeqNumber,
    /// The acknowledgement number, meaningful with `Flags::ACK`.
    pub ack_number: SeqNumber,
    /// The flags.
    pub flags: Flags,
    /// The advertised window.
    pub window_len: u16,
    /// The maximum segment size option.
    pub max_seg_size: Option<u16>,
}

impl Repr {
    /// Parse the header of a segment whose length was checked.
    pub fn parse(packet: &tcp) -> Result<Repr> {
        packet.check_len()?;
        // Port 0 is reserved, a segment from or to it is never valid.
        if packet.src_port() == 0 || packet.dst_port() == 0 {
            return Err(Error::Malformed);
        }
        Ok(Repr {
            src_port: packet.src_port(),
            dst_port: packet.dst_port(),
            seq_number: packet.seq_number(),
            ack_number: packet.ack_number(),
            flags: packet.flags(),
            window_len: packet.window_len(),
            max_seg_size: packet.max_seg_size()?,
        })
    }

    /// The length of the emitted header, including options.
    pub fn header_len(&self) -> usize {
        HEADER_LEN + if self.max_seg_size.is_some() { MSS_OPTION_LEN } else { 0 }
    }

    /// Emit the header with a zero checksum and urgent pointer.
    pub fn emit(&self, packet: &mut tcp) {
        let data = &mut packet.0;
        let header_len = self.header_len();
        NetworkEndian::write_u16(&mut data[field::SRC_PORT], self.src_port);
        NetworkEndian::write_u16(&mut data[field::DST_PORT], self.dst_port);
        NetworkEndian::write_i32(&mut data[field::SEQ_NUM], self.seq_number.0);
        NetworkEndian::write_i32(&mut data[field::ACK_NUM], self.ack_number.0);
        let offset = ((header_len / 4) as u16) << 12;
        NetworkEndian::write_u16(&mut data[field::FLAGS], offset | self.flags.0);
        NetworkEndian::write_u16(&mut data[field::WIN_SIZE], self.window_len);
        NetworkEndian::write_u16(&mut data[field::CHECKSUM], 0);
        NetworkEndian::write_u16(&mut data[field::URGENT], 0);
        if let Some(mss) = self.max_seg_size {
            let option = &mut data[HEADER_LEN..HEADER_LEN + MSS_OPTION_LEN];
            option[0] = field::OPT_MSS;
            option[1] = MSS_OPTION_LEN as u8;
            NetworkEndian::write_u16(&mut option[2..4], mss);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static SYN_BYTES: [u8; 28] =
        [0xbf, 0x00, 0x00, 0x50,
         0x01, 0x23, 0x45, 0x67,
         0x00, 0x00, 0x00, 0x00,
         0x70, 0x02, 0x01, 0x23,
         0x00, 0x00, 0x00, 0x00,
         0x01, 0x03, 0x03, 0x07,
         0x02, 0x04, 0x05, 0xb4];

    #[test]
    fn seq_number_wraps() {
        let high = SeqNumber::from_u32(0xffff_fff0);
        let low = high + 0x20;
        assert_eq!(low.as_u32(), 0x10);
        assert!(low > high);
        assert_eq!(low - high, 0x20);
        assert_eq!(high - low, -0x20);
        assert_eq!(low - 0x20, high);
        assert_eq!(high.max(low), low);
        assert_eq!(high.min(low), high);
    }

    #[test]
    fn parse_syn_with_options() {
        let packet = tcp::new_checked(&SYN_BYTES[..]).unwrap();
        let repr = Repr::parse(packet).unwrap();
        assert_eq!(repr.src_port, 48896);
        assert_eq!(repr.dst_port, 80);
        assert_eq!(repr.seq_number, SeqNumber(0x0123_4567));
        assert_eq!(repr.flags, Flags::SYN);
        assert_eq!(repr.window_len, 0x0123);
        // The window scale option in front is skipped.
        assert_eq!(repr.max_seg_size, Some(1460));
        assert!(packet.payload_slice().is_empty());
    }

    #[test]
    fn emit_syn_ack() {
        let repr = Repr {
            src_port: 80,
            dst_port: 48896,
            seq_number: SeqNumber(7),
            ack_number: SeqNumber(0x0123_4568),
            flags: Flags::SYN | Flags::ACK,
            window_len: 4096,
            max_seg_size: Some(1460),
        };
        let mut bytes = [0u8; 24];
        repr.emit(tcp::new_unchecked_mut(&mut bytes[..]));
        let packet = tcp::new_checked(&bytes[..]).unwrap();
        assert_eq!(packet.header_len(), 24);
        assert_eq!(Repr::parse(packet), Ok(repr));
    }

    #[test]
    fn bad_header_len() {
        let mut bytes = SYN_BYTES;
        bytes[12] = 0x40;
        assert_eq!(tcp::new_checked(&bytes[..]), Err(Error::Malformed));
        bytes[12] = 0x80;
        assert_eq!(tcp::new_checked(&bytes[..]), Err(Error::Truncated));
    }

    #[test]
    fn flags_debug() {
        assert_eq!(format!("{:?}", Flags::SYN | Flags::ACK), "SYN|ACK");
        assert_eq!(format!("{:?}", Flags::empty()), "-");
    }
}
