use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem;
use core::fmt;

use bitflags::bitflags;

use super::pool::{Pool, RecoveryHook};
use crate::wire::checksum::Accumulator;

bitflags! {
    /// Per-node buffer flags.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Flags: u8 {
        /// First node of a packet.
        const SOP = 0x01;
        /// Last node of a packet.
        const EOP = 0x02;
        /// The packet was sent to the IPv4 broadcast address.
        const BCAST = 0x10;
        /// The packet was sent to an IPv4 multicast group.
        const MCAST = 0x20;
    }
}

/// A descriptor, one link of a buffer chain.
///
/// While a descriptor sits in the pool its segment is the empty slice.
struct Node {
    segment: Box<[u8]>,
    offset: usize,
    buflen: usize,
    /// Bytes in this node and all nodes after it.
    pktlen: usize,
    flags: Flags,
    next: Option<Box<Node>>,
}

struct Pools {
    descriptors: Pool<Box<Node>>,
    segments: Pool<Box<[u8]>>,
    segment_size: usize,
    hook: spin::Mutex<Option<RecoveryHook>>,
}

/// The shared pool of packet buffers.
///
/// Descriptors and data segments come from two separate free lists and are paired on allocation.
/// Cloning the handle is cheap, all clones refer to the same pools.
#[derive(Clone)]
pub struct BufferPool {
    pools: Arc<Pools>,
}

/// A chain of buffers holding one packet.
///
/// The value is the head node, owning every node after it. Dropping the head returns all nodes
/// and segments of the chain to the pool. Operations that may discard the packet consume the head
/// and return `None` once the chain has been freed.
pub struct Pbuf {
    head: Option<Box<Node>>,
    pools: Arc<Pools>,
}

impl BufferPool {
    /// Create a pool of `segments` data segments of `segment_size` bytes each, and `descriptors`
    /// chain descriptors.
    pub fn new(segments: usize, descriptors: usize, segment_size: usize) -> Self {
        let segments = (0..segments)
            .map(|_| alloc::vec![0u8; segment_size].into_boxed_slice())
            .collect();
        let descriptors = (0..descriptors)
            .map(|_| Box::new(Node::empty()))
            .collect();
        BufferPool {
            pools: Arc::new(Pools {
                descriptors: Pool::new(descriptors),
                segments: Pool::new(segments),
                segment_size,
                hook: spin::Mutex::new(None),
            }),
        }
    }

    /// The capacity of a single segment.
    pub fn segment_size(&self) -> usize {
        self.pools.segment_size
    }

    /// The number of complete buffers, descriptor and segment, that are free.
    pub fn available(&self) -> usize {
        self.pools.available()
    }

    /// Install the hook run when a freed buffer ends a stretch without any complete buffer.
    ///
    /// Drivers use this to re-arm receive rings that stalled for lack of buffers.
    pub fn set_recovery_hook(&self, hook: RecoveryHook) {
        *self.pools.hook.lock() = Some(hook);
    }

    /// Allocate an empty buffer with `headroom` bytes reserved for headers, without waiting.
    pub fn alloc(&self, headroom: usize) -> Option<Pbuf> {
        let node = self.pools.try_node(headroom)?;
        Some(Pbuf::from_head(node, self.pools.clone()))
    }

    /// Allocate an empty buffer, waiting for the pool to refill if it is empty.
    ///
    /// Resolves to `None` only if `headroom` exceeds the segment size.
    pub async fn alloc_wait(&self, headroom: usize) -> Option<Pbuf> {
        if headroom > self.pools.segment_size {
            return None;
        }
        let node = self.pools.descriptors.acquire().await;
        let segment = self.pools.segments.acquire().await;
        let node = Pools::assemble(node, segment, headroom);
        Some(Pbuf::from_head(node, self.pools.clone()))
    }

    /// Allocate an empty buffer, parking the current thread while the pool is empty.
    #[cfg(feature = "std")]
    pub fn alloc_blocking(&self, headroom: usize) -> Option<Pbuf> {
        crate::wait::block_on(self.alloc_wait(headroom))
    }

    /// Allocate a buffer holding a copy of `data` after `headroom` reserved bytes.
    ///
    /// Spills into further segments as needed. Fails if the pool can not hold all of it.
    pub fn alloc_from(&self, headroom: usize, data: &[u8]) -> Option<Pbuf> {
        let mut pb = self.alloc(headroom)?;
        if pb.write(data, usize::MAX) != data.len() {
            return None;
        }
        Some(pb)
    }
}

impl Pools {
    fn try_node(&self, headroom: usize) -> Option<Box<Node>> {
        if headroom > self.segment_size {
            return None;
        }
        let node = self.descriptors.try_acquire()?;
        let segment = match self.segments.try_acquire() {
            Some(segment) => segment,
            None => {
                self.descriptors.release(node);
                return None;
            },
        };
        Some(Pools::assemble(node, segment, headroom))
    }

    fn assemble(mut node: Box<Node>, segment: Box<[u8]>, headroom: usize) -> Box<Node> {
        node.segment = segment;
        node.offset = headroom;
        node.buflen = 0;
        node.pktlen = 0;
        node.flags = Flags::SOP | Flags::EOP;
        node.next = None;
        node
    }

    /// Complete buffers, descriptor and segment, on the free lists.
    fn available(&self) -> usize {
        self.descriptors.available().min(self.segments.available())
    }

    fn free_node(&self, mut node: Box<Node>) {
        let segment = mem::take(&mut node.segment);
        node.next = None;
        let exhausted = self.available() == 0;
        self.segments.release(segment);
        self.descriptors.release(node);

        if exhausted {
            let hook = self.hook.lock().clone();
            if let Some(hook) = hook {
                hook();
            }
        }
    }

    fn free_chain(&self, mut next: Option<Box<Node>>) {
        while let Some(mut node) = next {
            next = node.next.take();
            self.free_node(node);
        }
    }
}

impl Node {
    fn empty() -> Self {
        Node {
            segment: Box::default(),
            offset: 0,
            buflen: 0,
            pktlen: 0,
            flags: Flags::empty(),
            next: None,
        }
    }

    fn data(&self) -> &[u8] {
        &self.segment[self.offset..self.offset + self.buflen]
    }

    fn tailroom(&self) -> usize {
        self.segment.len() - self.offset - self.buflen
    }
}

impl Pbuf {
    fn from_head(head: Box<Node>, pools: Arc<Pools>) -> Self {
        Pbuf { head: Some(head), pools }
    }

    /// Give up ownership of the chain without freeing it.
    fn into_head(mut self) -> Option<Box<Node>> {
        self.head.take()
    }

    // The head is only taken while the buffer is consumed.
    fn head(&self) -> &Node {
        self.head.as_deref().expect("live buffer has a head")
    }

    fn head_mut(&mut self) -> &mut Node {
        self.head.as_deref_mut().expect("live buffer has a head")
    }

    /// Allocate an empty buffer from `pool`, see [`BufferPool::alloc`].
    ///
    /// [`BufferPool::alloc`]: struct.BufferPool.html#method.alloc
    pub fn alloc(pool: &BufferPool, headroom: usize) -> Option<Pbuf> {
        pool.alloc(headroom)
    }

    /// A handle to the pool this buffer came from.
    pub fn pool(&self) -> BufferPool {
        BufferPool { pools: self.pools.clone() }
    }

    /// Bytes in the whole chain.
    pub fn pktlen(&self) -> usize {
        self.head().pktlen
    }

    /// Bytes in the head node.
    pub fn buflen(&self) -> usize {
        self.head().buflen
    }

    /// Free space in front of the head node's data.
    pub fn headroom(&self) -> usize {
        self.head().offset
    }

    /// Free space behind the data of the last node.
    pub fn tailroom(&self) -> usize {
        self.last().tailroom()
    }

    /// The flags of the head node.
    pub fn flags(&self) -> Flags {
        self.head().flags
    }

    /// Set additional flags on the head node.
    pub fn insert_flags(&mut self, flags: Flags) {
        self.head_mut().flags.insert(flags)
    }

    /// Whether the last node carries the end-of-packet mark.
    pub fn is_complete(&self) -> bool {
        self.last().flags.contains(Flags::EOP)
    }

    /// Set or clear the end-of-packet mark on the last node.
    ///
    /// Drivers receiving a frame over several descriptors clear it on all but the final fragment.
    pub fn set_complete(&mut self, complete: bool) {
        let last = self.grow_all(0);
        last.flags.set(Flags::EOP, complete);
    }

    /// The number of nodes in the chain.
    pub fn node_count(&self) -> usize {
        self.nodes().count()
    }

    /// The valid bytes of the head node.
    pub fn data(&self) -> &[u8] {
        self.head().data()
    }

    /// The valid bytes of the head node, for writing.
    pub fn data_mut(&mut self) -> &mut [u8] {
        let node = self.head_mut();
        &mut node.segment[node.offset..node.offset + node.buflen]
    }

    /// Iterate over the valid bytes of each node.
    pub fn segments(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.nodes().map(Node::data)
    }

    /// Copy the whole packet into a vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut vec = Vec::with_capacity(self.pktlen());
        for segment in self.segments() {
            vec.extend_from_slice(segment);
        }
        vec
    }

    fn nodes(&self) -> Nodes<'_> {
        Nodes { next: self.head.as_deref() }
    }

    fn last(&self) -> &Node {
        let mut node: &Node = self.head();
        while let Some(next) = node.next.as_deref() {
            node = next;
        }
        node
    }

    /// Grow the chain length of every node by `n`, returning the last node.
    fn grow_all(&mut self, n: usize) -> &mut Node {
        let mut node: &mut Node = self.head_mut();
        node.pktlen += n;
        while let Some(ref mut next) = node.next {
            node = &mut **next;
            node.pktlen += n;
        }
        node
    }

    /// Claim `n` bytes of headroom in front of the data.
    ///
    /// Without sufficient headroom the packet is freed and `None` returned. Headroom must be
    /// reserved when the buffer is allocated.
    pub fn prepend(mut self, n: usize) -> Option<Pbuf> {
        let head = self.head_mut();
        if n > head.offset {
            net_debug!("pbuf: no headroom for {} bytes", n);
            return None;
        }
        head.offset -= n;
        head.buflen += n;
        head.pktlen += n;
        Some(self)
    }

    /// Claim `n` bytes of tailroom in the last node and return them.
    ///
    /// Returns `None`, leaving the chain untouched, when the last segment has no room.
    pub fn append(&mut self, n: usize) -> Option<&mut [u8]> {
        if self.tailroom() < n {
            return None;
        }
        let last = self.grow_all(n);
        let end = last.offset + last.buflen;
        last.buflen += n;
        Some(&mut last.segment[end..end + n])
    }

    /// Remove `n` bytes from the front of the head node.
    ///
    /// Frees the packet and returns `None` if the head node holds fewer than `n` bytes.
    pub fn drop_head(mut self, n: usize) -> Option<Pbuf> {
        let head = self.head_mut();
        if n > head.buflen {
            return None;
        }
        head.offset += n;
        head.buflen -= n;
        head.pktlen -= n;
        Some(self)
    }

    /// Remove `n` bytes from the end of the chain.
    ///
    /// Nodes that become empty behind the new end are returned to the pool. The head node always
    /// stays, possibly empty.
    pub fn trim(&mut self, n: usize) {
        let pools = &*self.pools;
        let mut node: &mut Node = match self.head.as_deref_mut() {
            Some(head) => head,
            None => return,
        };
        let mut keep = node.pktlen - n.min(node.pktlen);
        loop {
            node.pktlen = keep;
            if keep <= node.buflen {
                node.buflen = keep;
                pools.free_chain(node.next.take());
                node.flags.insert(Flags::EOP);
                return;
            }
            keep -= node.buflen;
            match node.next {
                Some(ref mut next) => node = &mut **next,
                None => return,
            }
        }
    }

    /// Ensure the first `n` bytes are contiguous in the head node.
    ///
    /// Scattered nodes are never coalesced. If the head node is too short the packet is freed and
    /// `None` returned, which callers treat as a dropped packet.
    pub fn pullup(self, n: usize) -> Option<Pbuf> {
        if self.buflen() >= n {
            Some(self)
        } else {
            None
        }
    }

    /// Append another chain behind this one.
    pub fn concat(&mut self, tail: Pbuf) {
        debug_assert!(Arc::ptr_eq(&self.pools, &tail.pools));
        if let Some(head) = tail.into_head() {
            self.push_node(head);
        }
    }

    fn push_node(&mut self, mut tail: Box<Node>) {
        tail.flags.remove(Flags::SOP);
        let last = self.grow_all(tail.pktlen);
        last.flags.remove(Flags::EOP);
        last.next = Some(tail);
    }

    /// Copy `data` to the end of the packet, allocating further segments as needed.
    ///
    /// No single segment receives more than `max_fill` bytes from one call. Stops early when the
    /// pool runs low and returns the number of bytes written.
    pub fn write(&mut self, mut data: &[u8], max_fill: usize) -> usize {
        if max_fill == 0 {
            return 0;
        }
        let mut written = 0;
        loop {
            let chunk = self.tailroom().min(data.len()).min(max_fill);
            if let Some(region) = self.append(chunk) {
                region.copy_from_slice(&data[..chunk]);
                data = &data[chunk..];
                written += chunk;
            }
            if data.is_empty() {
                return written;
            }
            match self.pools.try_node(0) {
                Some(node) => self.push_node(node),
                None => return written,
            }
        }
    }

    /// Copy bytes of the packet, starting at `offset`, into `out`.
    ///
    /// Returns the number of bytes copied, less than `out.len()` at the end of the packet.
    pub fn read(&self, mut offset: usize, out: &mut [u8]) -> usize {
        let mut copied = 0;
        for segment in self.segments() {
            if offset >= segment.len() {
                offset -= segment.len();
                continue;
            }
            let segment = &segment[offset..];
            offset = 0;
            let chunk = segment.len().min(out.len() - copied);
            out[copied..copied + chunk].copy_from_slice(&segment[..chunk]);
            copied += chunk;
            if copied == out.len() {
                break;
            }
        }
        copied
    }

    /// Re-frame the packet as the `len` bytes at `offset` within the head segment.
    ///
    /// All nodes after the head are freed. This turns a received packet into the buffer of an
    /// in-place reply. Returns `false`, changing nothing, if the range is outside the segment.
    pub fn reset(&mut self, offset: usize, len: usize) -> bool {
        if offset + len > self.head().segment.len() {
            return false;
        }
        let next = self.head_mut().next.take();
        self.pools.free_chain(next);
        let head = self.head_mut();
        head.offset = offset;
        head.buflen = len;
        head.pktlen = len;
        head.flags = Flags::SOP | Flags::EOP;
        true
    }

    /// The unfolded internet checksum of `len` bytes starting at `offset`, added to `initial`.
    ///
    /// Bytes beyond the end of the packet are not included.
    pub fn checksum(&self, mut offset: usize, len: usize, initial: u16) -> u16 {
        let mut acc = Accumulator::new(initial);
        let mut remaining = len;
        for segment in self.segments() {
            if remaining == 0 {
                break;
            }
            if offset >= segment.len() {
                offset -= segment.len();
                continue;
            }
            let segment = &segment[offset..];
            offset = 0;
            let chunk = segment.len().min(remaining);
            acc.add(&segment[..chunk]);
            remaining -= chunk;
        }
        acc.sum()
    }
}

impl Drop for Pbuf {
    fn drop(&mut self) {
        self.pools.free_chain(self.head.take());
    }
}

impl fmt::Debug for Pbuf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Pbuf")
            .field("pktlen", &self.pktlen())
            .field("nodes", &self.node_count())
            .field("flags", &self.flags())
            .finish()
    }
}

struct Nodes<'a> {
    next: Option<&'a Node>,
}

impl<'a> Iterator for Nodes<'a> {
    type Item = &'a Node;

    fn next(&mut self) -> Option<&'a Node> {
        let node = self.next?;
        self.next = node.next.as_deref();
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> BufferPool {
        BufferPool::new(8, 8, 64)
    }

    #[test]
    fn prepend_needs_headroom() {
        let pool = pool();
        let pb = pool.alloc(16).unwrap();
        let pb = pb.prepend(16).unwrap();
        assert_eq!(pb.pktlen(), 16);
        assert_eq!(pb.headroom(), 0);
        assert!(pb.prepend(1).is_none());
        assert_eq!(pool.available(), 8);
    }

    #[test]
    fn append_and_drop() {
        let pool = pool();
        let mut pb = pool.alloc(4).unwrap();
        pb.append(3).unwrap().copy_from_slice(b"abc");
        assert_eq!(pb.data(), b"abc");
        assert!(pb.append(61).is_none());
        let pb = pb.drop_head(1).unwrap();
        assert_eq!(pb.data(), b"bc");
        assert_eq!(pb.headroom(), 5);
        assert!(pb.drop_head(3).is_none());
        assert_eq!(pool.available(), 8);
    }

    #[test]
    fn concat_moves_the_tail_chain() {
        let pool = pool();
        let mut head = pool.alloc_from(0, b"head").unwrap();
        let tail = pool.alloc_from(0, b"tail").unwrap();
        assert_eq!(pool.available(), 6);

        head.concat(tail);
        assert_eq!(head.node_count(), 2);
        assert_eq!(head.pktlen(), 8);
        assert_eq!(head.to_vec(), b"headtail");
        assert!(head.is_complete());
        assert_eq!(pool.available(), 6);

        drop(head);
        assert_eq!(pool.available(), 8);
    }

    #[test]
    fn write_spills_into_chain() {
        let pool = pool();
        let data: Vec<u8> = (0..150u8).collect();
        let mut pb = pool.alloc(10).unwrap();
        assert_eq!(pb.write(&data, usize::MAX), 150);
        assert_eq!(pb.node_count(), 3);
        assert_eq!(pb.pktlen(), 150);
        assert_eq!(pb.to_vec(), data);
        assert!(pb.is_complete());

        let mut out = [0u8; 20];
        assert_eq!(pb.read(45, &mut out), 20);
        assert_eq!(&out[..], &data[45..65]);
        assert_eq!(pb.read(140, &mut out), 10);
    }

    #[test]
    fn write_bounds_segment_fill() {
        let pool = pool();
        let data: Vec<u8> = (0..50u8).collect();
        let mut pb = pool.alloc(10).unwrap();
        assert_eq!(pb.write(&data, 20), 50);
        assert_eq!(pb.node_count(), 3);
        assert_eq!(pb.buflen(), 20);
        assert_eq!(pb.to_vec(), data);
        assert_eq!(pb.write(&data, 0), 0);
    }

    #[test]
    fn trim_frees_tail_nodes() {
        let pool = pool();
        let data: Vec<u8> = (0..150u8).collect();
        let mut pb = pool.alloc(10).unwrap();
        pb.write(&data, usize::MAX);
        assert_eq!(pool.available(), 5);

        pb.trim(100);
        assert_eq!(pb.pktlen(), 50);
        assert_eq!(pb.node_count(), 1);
        assert_eq!(pool.available(), 7);
        assert_eq!(pb.to_vec(), &data[..50]);
        assert!(pb.is_complete());

        pb.trim(1000);
        assert_eq!(pb.pktlen(), 0);
    }

    #[test]
    fn pullup_does_not_coalesce() {
        let pool = pool();
        let mut pb = pool.alloc(60).unwrap();
        pb.write(&[1, 2, 3, 4, 5, 6], usize::MAX);
        assert_eq!(pb.buflen(), 4);
        let pb = pb.pullup(4).unwrap();
        assert!(pb.pullup(5).is_none());
        assert_eq!(pool.available(), 8);
    }

    #[test]
    fn chain_checksum_matches_contiguous() {
        let pool = pool();
        let data: Vec<u8> = (0..101u8).map(|b| b.wrapping_mul(37)).collect();
        let mut pb = pool.alloc(63).unwrap();
        pb.write(&data, usize::MAX);
        assert!(pb.node_count() > 1);
        let contiguous = crate::wire::checksum::data(&data[3..90]);
        assert_eq!(pb.checksum(3, 87, 0), contiguous);
    }

    #[test]
    fn reset_for_reply() {
        let pool = pool();
        let mut pb = pool.alloc(0).unwrap();
        pb.write(&[0u8; 100], usize::MAX);
        let pb = pb.drop_head(20).unwrap();
        let mut pb = pb;
        assert!(pb.reset(20, 8));
        assert_eq!(pb.pktlen(), 8);
        assert_eq!(pb.node_count(), 1);
        assert!(!pb.reset(60, 8));
        assert_eq!(pool.available(), 7);
    }

    #[test]
    fn exhaustion_and_recovery() {
        use core::sync::atomic::{AtomicUsize, Ordering};

        let pool = BufferPool::new(3, 3, 32);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        pool.set_recovery_hook(Arc::new(move || { counter.fetch_add(1, Ordering::SeqCst); }));

        let a = pool.alloc(0).unwrap();
        assert!(pool.alloc(0).is_some());
        let b = pool.alloc(0).unwrap();
        // The last buffer is reserved for waiting callers.
        assert!(pool.alloc(0).is_none());
        drop(a);
        drop(b);
        assert_eq!(pool.available(), 3);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    #[cfg(feature = "std")]
    fn recovery_hook_fires_once_per_exhaustion() {
        use core::sync::atomic::{AtomicUsize, Ordering};

        let pool = BufferPool::new(3, 3, 32);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        pool.set_recovery_hook(Arc::new(move || { counter.fetch_add(1, Ordering::SeqCst); }));

        // Blocking allocations drain the reserve too.
        let held: Vec<Pbuf> = (0..3)
            .map(|_| pool.alloc_blocking(0).unwrap())
            .collect();
        assert_eq!(pool.available(), 0);
        let mut held = held.into_iter();
        drop(held.next());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        drop(held);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(pool.available(), 3);
    }
}
