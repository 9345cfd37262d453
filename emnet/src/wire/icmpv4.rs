//! The ICMP echo header, the only ICMP message this stack answers.
use byteorder::{ByteOrder, NetworkEndian};

use super::{checksum, Error, Result};

enum_with_unknown! {
    /// Internet protocol control message type.
    pub enum Message(u8) {
        EchoReply = 0,
        EchoRequest = 8,
    }
}

byte_wrapper! {
    /// A byte sequence representing an ICMPv4 message.
    #[derive(Debug, PartialEq, Eq)]
    pub struct icmpv4([u8]);
}

mod field {
    use crate::wire::field::Field;

    pub(crate) const TYPE:     usize = 0;
    pub(crate) const CODE:     usize = 1;
    pub(crate) const CHECKSUM: Field = 2..4;
    pub(crate) const ECHO_ID:  Field = 4..6;
    pub(crate) const ECHO_SEQ: Field = 6..8;
}

/// The length of an echo header.
pub const ECHO_HEADER_LEN: usize = field::ECHO_SEQ.end;

impl icmpv4 {
    /// Imbue a raw octet buffer with ICMP structure.
    pub fn new_unchecked(data: &[u8]) -> &Self {
        Self::__from_macro_new_unchecked(data)
    }

    /// Imbue a mutable octet buffer with ICMP structure.
    pub fn new_unchecked_mut(data: &mut [u8]) -> &mut Self {
        Self::__from_macro_new_unchecked_mut(data)
    }

    /// Check the length and imbue the buffer with ICMP structure.
    pub fn new_checked(data: &[u8]) -> Result<&Self> {
        if data.len() < field::CHECKSUM.end {
            return Err(Error::Truncated);
        }
        Ok(Self::new_unchecked(data))
    }

    /// Return the message type field.
    pub fn msg_type(&self) -> Message {
        Message::from(self.0[field::TYPE])
    }

    /// Return the message code field.
    pub fn msg_code(&self) -> u8 {
        self.0[field::CODE]
    }

    /// Return the checksum field.
    pub fn checksum(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::CHECKSUM])
    }

    /// Return the echo identifier, if the message is long enough.
    pub fn echo_ident(&self) -> Option<u16> {
        self.0.get(field::ECHO_ID).map(NetworkEndian::read_u16)
    }

    /// Return the echo sequence number, if the message is long enough.
    pub fn echo_seq_no(&self) -> Option<u16> {
        self.0.get(field::ECHO_SEQ).map(NetworkEndian::read_u16)
    }

    /// Set the message type field.
    pub fn set_msg_type(&mut self, value: Message) {
        self.0[field::TYPE] = value.into()
    }

    /// Set the message code field.
    pub fn set_msg_code(&mut self, value: u8) {
        self.0[field::CODE] = value
    }

    /// Set the checksum field.
    pub fn set_checksum(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.0[field::CHECKSUM], value)
    }

    /// Validate the checksum over the whole message.
    pub fn verify_checksum(&self) -> bool {
        checksum::data(&self.0) == !0
    }

    /// Compute and fill in the checksum over the whole message.
    pub fn fill_checksum(&mut self) {
        self.set_checksum(0);
        let checksum = !checksum::data(&self.0);
        self.set_checksum(checksum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static ECHO_BYTES: [u8; 12] =
        [0x08, 0x00, 0x8e, 0xfe,
         0x12, 0x34, 0xab, 0xcd,
         0xaa, 0x00, 0x00, 0xff];

    #[test]
    fn echo_request() {
        let msg = icmpv4::new_checked(&ECHO_BYTES[..]).unwrap();
        assert_eq!(msg.msg_type(), Message::EchoRequest);
        assert_eq!(msg.echo_ident(), Some(0x1234));
        assert_eq!(msg.echo_seq_no(), Some(0xabcd));
        assert!(msg.verify_checksum());
    }

    #[test]
    fn turn_into_reply() {
        let mut bytes = ECHO_BYTES;
        let msg = icmpv4::new_unchecked_mut(&mut bytes[..]);
        msg.set_msg_type(Message::EchoReply);
        assert!(!msg.verify_checksum());
        msg.fill_checksum();
        assert!(msg.verify_checksum());
        assert_eq!(msg.checksum(), 0x96fe);
    }
}
