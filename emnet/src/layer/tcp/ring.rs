use alloc::boxed::Box;
use alloc::vec;

/// A byte ring addressed directly by sequence number.
///
/// The capacity is a power of two no larger than 2^31, so the low bits of a 32-bit sequence
/// number select the byte and wrapping the sequence space wraps the ring consistently. The ring
/// itself keeps no read or write pointer, the connection tracks which range of sequence numbers
/// is currently stored.
pub struct Ring {
    buf: Box<[u8]>,
}

impl Ring {
    /// Create a ring holding at least `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two().min(1 << 31);
        Ring { buf: vec![0; capacity].into_boxed_slice() }
    }

    /// The number of bytes the ring holds.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn mask(&self) -> usize {
        self.buf.len() - 1
    }

    /// Store `data` at the sequence position `pos`.
    ///
    /// # Panics
    /// If `data` is longer than the ring.
    pub fn write_at(&mut self, pos: u32, data: &[u8]) {
        assert!(data.len() <= self.capacity());
        let start = pos as usize & self.mask();
        let first = data.len().min(self.capacity() - start);
        self.buf[start..start + first].copy_from_slice(&data[..first]);
        self.buf[..data.len() - first].copy_from_slice(&data[first..]);
    }

    /// Load the bytes at the sequence position `pos` into `out`.
    ///
    /// # Panics
    /// If `out` is longer than the ring.
    pub fn read_at(&self, pos: u32, out: &mut [u8]) {
        assert!(out.len() <= self.capacity());
        let start = pos as usize & self.mask();
        let first = out.len().min(self.capacity() - start);
        out[..first].copy_from_slice(&self.buf[start..start + first]);
        let rest = out.len() - first;
        out[first..].copy_from_slice(&self.buf[..rest]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn capacity_rounds_up() {
        assert_eq!(Ring::with_capacity(1000).capacity(), 1024);
        assert_eq!(Ring::with_capacity(4096).capacity(), 4096);
        assert_eq!(Ring::with_capacity(0).capacity(), 1);
    }

    #[test]
    fn wraps_at_the_end() {
        let mut ring = Ring::with_capacity(8);
        ring.write_at(6, b"abcd");
        let mut out = [0; 4];
        ring.read_at(6, &mut out);
        assert_eq!(&out, b"abcd");
        // The same bytes are visible one lap of the sequence space later.
        ring.read_at(6 + 8 * 3, &mut out);
        assert_eq!(&out, b"abcd");
        let mut tail = [0; 2];
        ring.read_at(0, &mut tail);
        assert_eq!(&tail, b"cd");
    }

    #[test]
    fn wraps_with_the_sequence_space() {
        let mut ring = Ring::with_capacity(16);
        let pos = u32::max_value() - 2;
        ring.write_at(pos, b"sequence");
        let mut out = [0; 8];
        ring.read_at(pos, &mut out);
        assert_eq!(&out, b"sequence");
        let mut after = [0; 5];
        ring.read_at(pos.wrapping_add(3), &mut after);
        assert_eq!(&after, b"uence");
    }

    proptest! {
        #[test]
        fn read_returns_last_write(
            pos in any::<u32>(),
            data in proptest::collection::vec(any::<u8>(), 0..=64),
        ) {
            let mut ring = Ring::with_capacity(64);
            ring.write_at(pos, &data);
            let mut out = vec![0; data.len()];
            ring.read_at(pos, &mut out);
            prop_assert_eq!(out, data);
        }
    }
}
