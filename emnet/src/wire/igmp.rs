//! IGMPv2 messages (RFC 2236).
use byteorder::{ByteOrder, NetworkEndian};

use super::{checksum, Error, Result};
use super::ipv4::Address as Ipv4Address;

enum_with_unknown! {
    /// IGMP message type.
    pub enum Message(u8) {
        MembershipQuery = 0x11,
        V1Report = 0x12,
        V2Report = 0x16,
        V3Report = 0x22,
        Leave = 0x17,
    }
}

byte_wrapper! {
    /// A byte sequence representing an IGMPv2 message.
    #[derive(Debug, PartialEq, Eq)]
    pub struct igmp([u8]);
}

mod field {
    use crate::wire::field::Field;

    pub(crate) const TYPE:      usize = 0;
    pub(crate) const RESP_TIME: usize = 1;
    pub(crate) const CHECKSUM:  Field = 2..4;
    pub(crate) const GROUP:     Field = 4..8;
}

/// The length of an IGMPv2 message.
pub const PACKET_LEN: usize = field::GROUP.end;

impl igmp {
    /// Imbue a raw octet buffer with IGMP structure.
    pub fn new_unchecked(data: &[u8]) -> &Self {
        Self::__from_macro_new_unchecked(data)
    }

    /// Imbue a mutable octet buffer with IGMP structure.
    pub fn new_unchecked_mut(data: &mut [u8]) -> &mut Self {
        Self::__from_macro_new_unchecked_mut(data)
    }

    /// Check the length and imbue the buffer with IGMP structure.
    pub fn new_checked(data: &[u8]) -> Result<&Self> {
        if data.len() < PACKET_LEN {
            return Err(Error::Truncated);
        }
        Ok(Self::new_unchecked(data))
    }

    /// Return the message type field.
    pub fn msg_type(&self) -> Message {
        Message::from(self.0[field::TYPE])
    }

    /// Return the maximum response time, in tenths of a second.
    pub fn max_resp_time(&self) -> u8 {
        self.0[field::RESP_TIME]
    }

    /// Return the group address field.
    pub fn group_addr(&self) -> Ipv4Address {
        Ipv4Address::from_bytes(&self.0[field::GROUP])
    }

    /// Validate the checksum over the message.
    pub fn verify_checksum(&self) -> bool {
        checksum::data(&self.0[..PACKET_LEN]) == !0
    }
}

/// A high-level representation of an IGMPv2 message.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Repr {
    /// The message type.
    pub message: Message,
    /// Maximum response time of a query in tenths of a second, zero otherwise.
    pub max_resp_time: u8,
    /// The group, unspecified in general queries.
    pub group_addr: Ipv4Address,
}

impl Repr {
    /// Parse a message with a valid checksum.
    pub fn parse(packet: &igmp) -> Result<Repr> {
        if packet.0.len() < PACKET_LEN {
            return Err(Error::Truncated);
        }
        if !packet.verify_checksum() {
            return Err(Error::WrongChecksum);
        }
        Ok(Repr {
            message: packet.msg_type(),
            max_resp_time: packet.max_resp_time(),
            group_addr: packet.group_addr(),
        })
    }

    /// Emit the message including its checksum.
    pub fn emit(&self, packet: &mut igmp) {
        let data = &mut packet.0;
        data[field::TYPE] = self.message.into();
        data[field::RESP_TIME] = self.max_resp_time;
        NetworkEndian::write_u16(&mut data[field::CHECKSUM], 0);
        data[field::GROUP].copy_from_slice(self.group_addr.as_bytes());
        let checksum = !checksum::data(&data[..PACKET_LEN]);
        NetworkEndian::write_u16(&mut data[field::CHECKSUM], checksum);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_parses_back() {
        let repr = Repr {
            message: Message::V2Report,
            max_resp_time: 0,
            group_addr: Ipv4Address::new(239, 1, 2, 3),
        };
        let mut bytes = [0u8; PACKET_LEN];
        repr.emit(igmp::new_unchecked_mut(&mut bytes[..]));
        assert_eq!(bytes[0], 0x16);
        assert_eq!(Repr::parse(igmp::new_checked(&bytes[..]).unwrap()), Ok(repr));

        bytes[7] ^= 1;
        assert_eq!(Repr::parse(igmp::new_unchecked(&bytes[..])), Err(Error::WrongChecksum));
    }
}
