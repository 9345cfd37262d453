//! RFC 1071 internet checksum arithmetic.
//!
//! The sum is accumulated as 16-bit big-endian words, folded by repeatedly adding the carries back
//! in and finally complemented when written into a header. A header that carries a correct
//! checksum therefore sums to `0xffff`, which is what all `verify` functions check.
use byteorder::{ByteOrder, NetworkEndian};

use super::ipv4::{Address, Protocol};

fn propagate_carries(word: u32) -> u16 {
    let sum = (word >> 16) + (word & 0xffff);
    ((sum >> 16) as u16) + (sum as u16)
}

/// Compute an RFC 1071 compliant checksum (without the final complement).
pub fn data(mut data: &[u8]) -> u16 {
    let mut accum = 0;

    // Chunks of 32 bytes cannot overflow the accumulator.
    const CHUNK_SIZE: usize = 32;
    while data.len() >= CHUNK_SIZE {
        let mut d = &data[..CHUNK_SIZE];
        while d.len() >= 2 {
            accum += NetworkEndian::read_u16(d) as u32;
            d = &d[2..];
        }
        accum = propagate_carries(accum) as u32;
        data = &data[CHUNK_SIZE..];
    }

    while data.len() >= 2 {
        accum += NetworkEndian::read_u16(data) as u32;
        data = &data[2..];
    }

    // An odd trailing byte is the high half of a zero padded word.
    if let Some(&value) = data.first() {
        accum += (value as u32) << 8;
    }

    propagate_carries(accum)
}

/// Combine several RFC 1071 compliant checksums.
pub fn combine(checksums: &[u16]) -> u16 {
    let mut accum: u32 = 0;
    for &word in checksums {
        accum += word as u32;
    }
    propagate_carries(accum)
}

/// The checksum over the IPv4 pseudo header of a transport segment.
pub fn pseudo_header(src_addr: Address, dst_addr: Address, protocol: Protocol, length: u16) -> u16 {
    let mut proto_len = [0u8; 4];
    proto_len[1] = protocol.into();
    NetworkEndian::write_u16(&mut proto_len[2..4], length);

    combine(&[
        data(src_addr.as_bytes()),
        data(dst_addr.as_bytes()),
        data(&proto_len[..]),
    ])
}

/// A running checksum over data that arrives in pieces of arbitrary length.
///
/// Packets stored in buffer chains are not split on word boundaries. The accumulator remembers
/// whether the previous piece ended in the middle of a word so that the next piece continues with
/// the low byte.
#[derive(Clone, Copy, Debug, Default)]
pub struct Accumulator {
    sum: u32,
    odd: bool,
}

impl Accumulator {
    /// Start from a partial sum, such as a pseudo header.
    pub fn new(initial: u16) -> Self {
        Accumulator { sum: initial as u32, odd: false }
    }

    /// Add the next piece of the data.
    pub fn add(&mut self, mut bytes: &[u8]) {
        if self.odd {
            match bytes.split_first() {
                Some((&low, rest)) => {
                    self.sum += low as u32;
                    self.odd = false;
                    bytes = rest;
                },
                None => return,
            }
        }

        self.sum = propagate_carries(self.sum) as u32 + data(bytes) as u32;
        self.odd = bytes.len() % 2 == 1;
    }

    /// The folded sum, not yet complemented.
    pub fn sum(&self) -> u16 {
        propagate_carries(self.sum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn odd_pieces_match_contiguous() {
        let bytes: [u8; 9] = [0x45, 0x00, 0x00, 0x1c, 0xab, 0xcd, 0x40, 0x00, 0xff];
        let mut acc = Accumulator::new(0);
        acc.add(&bytes[..3]);
        acc.add(&bytes[3..4]);
        acc.add(&[]);
        acc.add(&bytes[4..]);
        assert_eq!(acc.sum(), data(&bytes));
    }

    #[test]
    fn carries_fold() {
        assert_eq!(data(&[0xff, 0xff, 0x00, 0x01]), 0x0001);
        assert_eq!(combine(&[0xffff, 0x0002]), 0x0002);
    }
}
