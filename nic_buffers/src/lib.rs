//! Defines the packet buffers that are used to move frames between NIC
//! queues and the rest of the system, and the pools that own them.
//!
//! A [`PacketBuffer`] is a preallocated payload region plus a small fixed
//! metadata header ([`PacketMetadata`]). Ownership of a buffer moves in
//! whole-buffer units: pool -> driver shadow ring -> caller on receive, and
//! caller -> driver shadow ring -> pool on transmit. Pools hand buffers out
//! and take them back only in bulk, because the fast path replenishes and
//! reclaims in batches.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use] extern crate log;
extern crate spin;

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

/// Bytes reserved at the front of every payload region, between the start
/// of the buffer and the start of frame data. The NIC is programmed with
/// the post-headroom address, so prepending headers never needs a copy.
pub const BUFFER_HEADROOM: u16 = 128;

/// A bus (DMA) address as the NIC sees it.
///
/// The queues in this workspace are driven through an identity mapping, so
/// the bus address of a payload region equals its linear address; the
/// newtype keeps the two address spaces from mixing in driver code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BusAddress(u64);

impl BusAddress {
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Receive offload status flags, as stored in `PacketMetadata::ol_flags`.
///
/// Drivers set these from their hardware completion records; upper layers
/// read them to decide which software checks can be skipped.
pub mod offload {
    /// A VLAN tag was present in the received frame.
    pub const RX_VLAN: u32 = 1 << 0;
    /// The VLAN tag was stripped by hardware and stored in `vlan_tci`.
    pub const RX_VLAN_STRIPPED: u32 = 1 << 1;
    /// `rss_hash` holds a valid receive-side-scaling hash.
    pub const RX_RSS_HASH: u32 = 1 << 2;
    /// The IP header checksum was verified and is correct.
    pub const RX_IP_CKSUM_GOOD: u32 = 1 << 3;
    /// The IP header checksum was verified and is wrong.
    pub const RX_IP_CKSUM_BAD: u32 = 1 << 4;
    /// The L4 checksum was verified and is correct.
    pub const RX_L4_CKSUM_GOOD: u32 = 1 << 5;
    /// The L4 checksum was verified and is wrong.
    pub const RX_L4_CKSUM_BAD: u32 = 1 << 6;
    /// The outer IP header checksum of a tunneled frame is wrong.
    pub const RX_OUTER_IP_CKSUM_BAD: u32 = 1 << 7;
    /// The outer L4 checksum of a tunneled frame was verified and is correct.
    pub const RX_OUTER_L4_CKSUM_GOOD: u32 = 1 << 8;
    /// The outer L4 checksum of a tunneled frame was verified and is wrong.
    pub const RX_OUTER_L4_CKSUM_BAD: u32 = 1 << 9;
}

/// Packet type tags, as stored in `PacketMetadata::packet_type`.
///
/// The tag is a set of nibble-wide fields, one per protocol layer, so a
/// classifier can OR together one value per layer and upper code can test
/// a layer with the matching mask.
pub mod ptype {
    pub const L2_MASK: u32 = 0x0000_000f;
    pub const L2_ETHER: u32 = 0x0000_0001;
    pub const L2_ETHER_VLAN: u32 = 0x0000_0002;

    pub const L3_MASK: u32 = 0x0000_00f0;
    pub const L3_IPV4: u32 = 0x0000_0010;
    pub const L3_IPV6: u32 = 0x0000_0020;

    pub const L4_MASK: u32 = 0x0000_0f00;
    pub const L4_TCP: u32 = 0x0000_0100;
    pub const L4_UDP: u32 = 0x0000_0200;
    pub const L4_ICMP: u32 = 0x0000_0300;

    pub const TUNNEL_MASK: u32 = 0x0000_f000;
    pub const TUNNEL_IP: u32 = 0x0000_1000;

    pub const INNER_L3_MASK: u32 = 0x000f_0000;
    pub const INNER_L3_IPV4: u32 = 0x0001_0000;
    pub const INNER_L3_IPV6: u32 = 0x0002_0000;

    pub const INNER_L4_MASK: u32 = 0x00f0_0000;
    pub const INNER_L4_TCP: u32 = 0x0010_0000;
    pub const INNER_L4_UDP: u32 = 0x0020_0000;
    pub const INNER_L4_ICMP: u32 = 0x0030_0000;
}

/// The fixed metadata header carried by every packet buffer.
///
/// Receive paths overwrite the whole header from a per-queue template and
/// then fill in the decoded fields, so a freshly delivered buffer never
/// leaks metadata from its previous life.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketMetadata {
    /// Offset from the start of the payload region to the frame data.
    pub data_off: u16,
    /// Number of outstanding references to this buffer. A buffer is only
    /// returned to its pool when the last reference is dropped.
    pub refcnt: u16,
    /// Port (device) the frame arrived on.
    pub port: u16,
    /// Offload status flags (`offload::RX_*`).
    pub ol_flags: u32,
    /// Packet type tag (`ptype::*`).
    pub packet_type: u32,
    /// Total frame length in bytes.
    pub pkt_len: u32,
    /// Length of the data in this buffer in bytes.
    pub data_len: u16,
    /// VLAN tag control information, valid when `RX_VLAN_STRIPPED` is set.
    pub vlan_tci: u16,
    /// Receive-side-scaling hash, valid when `RX_RSS_HASH` is set.
    pub rss_hash: u32,
}

impl PacketMetadata {
    /// The state of a buffer that carries no frame: full headroom, one
    /// reference, everything else cleared.
    pub const fn initial() -> PacketMetadata {
        PacketMetadata {
            data_off: BUFFER_HEADROOM,
            refcnt: 1,
            port: 0,
            ol_flags: 0,
            packet_type: 0,
            pkt_len: 0,
            data_len: 0,
            vlan_tci: 0,
            rss_hash: 0,
        }
    }
}

/// A pool-owned buffer holding one frame (or about to hold one).
pub struct PacketBuffer {
    data: Box<[u8]>,
    pool: &'static BufferPool,
    /// The metadata header. Public because drivers write it wholesale on
    /// the receive fast path.
    pub meta: PacketMetadata,
}

impl PacketBuffer {
    /// Bus address of the start of the payload region (before headroom).
    pub fn bus_address(&self) -> BusAddress {
        BusAddress(self.data.as_ptr() as u64)
    }

    /// The pool this buffer belongs to and must be returned to.
    pub fn pool(&self) -> &'static BufferPool {
        self.pool
    }

    /// Total size of the payload region, headroom included.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The frame data currently held, `data_len` bytes at `data_off`.
    pub fn frame(&self) -> &[u8] {
        let start = self.meta.data_off as usize;
        &self.data[start..start + self.meta.data_len as usize]
    }

    /// Mutable access to the frame data currently held.
    pub fn frame_mut(&mut self) -> &mut [u8] {
        let start = self.meta.data_off as usize;
        &mut self.data[start..start + self.meta.data_len as usize]
    }

    /// Clears the metadata header back to its just-allocated state.
    pub fn reset(&mut self) {
        self.meta = PacketMetadata::initial();
    }

    /// Drops one reference to this buffer after transmission.
    ///
    /// Returns the buffer, ready for a bulk pool return, if this was the
    /// last reference; returns `None` if the buffer is still referenced
    /// elsewhere and must not be recycled yet.
    pub fn prefree(mut self) -> Option<PacketBuffer> {
        if self.meta.refcnt > 1 {
            self.meta.refcnt -= 1;
            return None;
        }
        Some(self)
    }
}

/// A fixed population of packet buffers handed out and taken back in bulk.
///
/// Pools are created empty by the control plane, pinned (`&'static`), and
/// then populated; every buffer carries a reference back to its pool so
/// that transmit reclaim can group returns by owner.
pub struct BufferPool {
    name: &'static str,
    buf_len: usize,
    free: Mutex<Vec<PacketBuffer>>,
}

impl BufferPool {
    /// Creates an empty pool whose buffers will be `buf_len` bytes.
    ///
    /// `buf_len` must cover at least the fixed headroom reservation.
    pub fn new(name: &'static str, buf_len: usize) -> Result<BufferPool, &'static str> {
        if buf_len <= BUFFER_HEADROOM as usize {
            return Err("BufferPool::new(): buffer length does not cover the headroom");
        }
        Ok(BufferPool {
            name,
            buf_len,
            free: Mutex::new(Vec::new()),
        })
    }

    /// Fills the pool with `count` fresh buffers owned by it.
    pub fn populate(&'static self, count: usize) {
        let mut free = self.free.lock();
        free.reserve(count);
        for _ in 0..count {
            free.push(PacketBuffer {
                data: vec![0u8; self.buf_len].into_boxed_slice(),
                pool: self,
                meta: PacketMetadata::initial(),
            });
        }
        debug!("pool {}: populated {} buffers of {} bytes", self.name, count, self.buf_len);
    }

    /// Takes `count` buffers out of the pool in one operation.
    ///
    /// All-or-nothing: if the pool cannot satisfy the whole request, no
    /// buffer is taken and `None` is returned. The caller retries on its
    /// next poll rather than waiting.
    pub fn alloc_bulk(&self, count: usize) -> Option<Vec<PacketBuffer>> {
        let mut free = self.free.lock();
        if free.len() < count {
            return None;
        }
        let at = free.len() - count;
        Some(free.split_off(at))
    }

    /// Returns a batch of buffers to the pool.
    ///
    /// Every buffer must belong to this pool; callers group mixed batches
    /// by pool before returning them.
    pub fn free_bulk(&self, bufs: impl IntoIterator<Item = PacketBuffer>) {
        let mut free = self.free.lock();
        for mut buf in bufs {
            buf.reset();
            free.push(buf);
        }
    }

    /// Number of buffers currently available for allocation.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// The length of every buffer in this pool.
    pub fn buf_len(&self) -> usize {
        self.buf_len
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leak_pool(name: &'static str, count: usize) -> &'static BufferPool {
        let pool = Box::leak(Box::new(BufferPool::new(name, 2048).unwrap()));
        pool.populate(count);
        pool
    }

    #[test]
    fn alloc_bulk_is_all_or_nothing() {
        let pool = leak_pool("all-or-nothing", 4);

        assert!(pool.alloc_bulk(5).is_none());
        assert_eq!(pool.available(), 4, "failed allocation must not consume buffers");

        let bufs = pool.alloc_bulk(4).expect("4 of 4 should succeed");
        assert_eq!(bufs.len(), 4);
        assert_eq!(pool.available(), 0);
        assert!(pool.alloc_bulk(1).is_none());

        pool.free_bulk(bufs);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn free_bulk_resets_metadata() {
        let pool = leak_pool("reset", 1);

        let mut bufs = pool.alloc_bulk(1).unwrap();
        bufs[0].meta.pkt_len = 1500;
        bufs[0].meta.ol_flags = offload::RX_RSS_HASH;
        pool.free_bulk(bufs);

        let bufs = pool.alloc_bulk(1).unwrap();
        assert_eq!(bufs[0].meta, PacketMetadata::initial());
    }

    #[test]
    fn prefree_respects_shared_references() {
        let pool = leak_pool("shared", 2);
        let mut bufs = pool.alloc_bulk(2).unwrap();

        let shared = {
            let mut b = bufs.pop().unwrap();
            b.meta.refcnt = 2;
            b
        };
        assert!(shared.prefree().is_none(), "a shared buffer must not be recycled");

        let exclusive = bufs.pop().unwrap();
        let back = exclusive.prefree().expect("sole reference should be freed");
        pool.free_bulk([back]);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn frame_respects_headroom() {
        let pool = leak_pool("headroom", 1);
        let mut buf = pool.alloc_bulk(1).unwrap().pop().unwrap();

        buf.meta.data_len = 4;
        buf.frame_mut().copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(buf.frame(), &[1, 2, 3, 4]);

        let expected = buf.bus_address().value() + BUFFER_HEADROOM as u64;
        assert_eq!(buf.data.as_ptr() as u64 + buf.meta.data_off as u64, expected);
    }
}
