use alloc::collections::VecDeque;

use super::Pbuf;

/// A FIFO of buffer fragments, reassembled into packets on the way out.
///
/// Producers push fragments as they arrive: a packet may be pushed as several chains where only
/// the last one carries the end-of-packet mark on its final node.
#[derive(Debug, Default)]
pub struct PbufQueue {
    entries: VecDeque<Pbuf>,
}

impl PbufQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        PbufQueue::default()
    }

    /// Queue a fragment.
    pub fn push(&mut self, pb: Pbuf) {
        self.entries.push_back(pb);
    }

    /// Number of queued fragments.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no fragments are queued.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes over all queued fragments.
    pub fn bytes(&self) -> usize {
        self.entries.iter().map(Pbuf::pktlen).sum()
    }

    /// Remove the fragments of the first complete packet and join them into one chain.
    ///
    /// Returns `None` while no queued fragment ends a packet.
    pub fn splice(&mut self) -> Option<Pbuf> {
        let last = self.entries.iter().position(Pbuf::is_complete)?;
        let mut packet = self.entries.pop_front()?;
        for _ in 0..last {
            match self.entries.pop_front() {
                Some(fragment) => packet.concat(fragment),
                None => break,
            }
        }
        packet.insert_flags(super::Flags::SOP);
        Some(packet)
    }

    /// Free every queued fragment.
    pub fn free_all(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::BufferPool;

    fn fragment(pool: &BufferPool, data: &[u8], last: bool) -> Pbuf {
        let mut pb = pool.alloc_from(0, data).unwrap();
        pb.set_complete(last);
        pb
    }

    #[test]
    fn splice_waits_for_end() {
        let pool = BufferPool::new(8, 8, 32);
        let mut queue = PbufQueue::new();
        assert!(queue.splice().is_none());

        queue.push(pool.alloc_from(0, b"abc").unwrap());
        queue.push(pool.alloc_from(0, b"defg").unwrap());
        assert_eq!(queue.bytes(), 7);

        let first = queue.splice().unwrap();
        assert_eq!(first.to_vec(), b"abc");
        let second = queue.splice().unwrap();
        assert_eq!(second.to_vec(), b"defg");
        assert!(queue.is_empty());
    }

    #[test]
    fn splice_joins_fragments() {
        let pool = BufferPool::new(8, 8, 32);
        let mut queue = PbufQueue::new();
        queue.push(fragment(&pool, b"hello ", false));
        queue.push(fragment(&pool, b"fragmented ", false));
        assert!(queue.splice().is_none());
        queue.push(fragment(&pool, b"world", true));
        queue.push(fragment(&pool, b"next", false));

        let packet = queue.splice().unwrap();
        assert_eq!(packet.to_vec(), b"hello fragmented world");
        assert_eq!(packet.pktlen(), 22);
        assert_eq!(packet.node_count(), 3);
        assert!(packet.flags().contains(crate::buf::Flags::SOP));
        assert!(packet.is_complete());
        assert_eq!(queue.len(), 1);
        assert!(queue.splice().is_none());
    }

    #[test]
    fn free_all_returns_buffers() {
        let pool = BufferPool::new(6, 6, 32);
        let mut queue = PbufQueue::new();
        for _ in 0..4 {
            queue.push(pool.alloc(0).unwrap());
        }
        assert_eq!(pool.available(), 2);
        queue.free_all();
        assert_eq!(pool.available(), 6);
    }
}
