//! Shared fixtures for the queue tests.
//!
//! Each harness owns heap-backed ring memory and doorbell words, hands the
//! queue its software-side handles, and keeps raw device-side pointers so
//! tests can play the hardware: inspecting written descriptors and posting
//! completion records with the validity parity the device would use.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

use kestrel_ethernet::completions::{
    CompletionBase, RxCompletion, RxCompletionExt, TxCompletion, COMPLETION_TYPE_RX_PACKET,
};
use kestrel_ethernet::descriptors::{RxBufferDescriptor, TxBufferDescriptor};
use kestrel_ethernet::ring::{DescriptorRing, DoorbellRegister, DB_KEY_CMPL, DB_KEY_RX, DB_KEY_TX};
use nic_buffers::{BufferPool, PacketBuffer};

use crate::receive_queue::{RxQueue, RxQueueSetup};
use crate::transmit_queue::{TxQueue, TxQueueSetup};

/// Leaks a zero-initialized slab of `count` slots of `T`, returning the
/// device-side pointer. Zeroed memory is a valid state for every
/// hardware-shared record type.
pub fn leak_slots<T>(count: usize) -> *mut T {
    let mut slots: Vec<T> = Vec::with_capacity(count);
    unsafe {
        core::ptr::write_bytes(slots.as_mut_ptr(), 0, count);
        slots.set_len(count);
    }
    Box::leak(slots.into_boxed_slice()).as_mut_ptr()
}

pub fn leak_doorbell() -> *mut u32 {
    Box::leak(Box::new(0u32))
}

pub fn leak_pool(name: &'static str, count: usize) -> &'static BufferPool {
    let pool = Box::leak(Box::new(BufferPool::new(name, 2048).unwrap()));
    pool.populate(count);
    pool
}

/// Draws `count` buffers from `pool` dressed up as `len`-byte frames.
pub fn frames_from(pool: &'static BufferPool, count: usize, len: u16) -> VecDeque<PacketBuffer> {
    let mut frames = VecDeque::with_capacity(count);
    for mut buf in pool.alloc_bulk(count).expect("test pool underprovisioned") {
        buf.meta.data_len = len;
        buf.meta.pkt_len = len as u32;
        frames.push_back(buf);
    }
    frames
}

/// The fields of a receive completion pair a test cares about.
pub struct RxRecord {
    pub opaque: u32,
    pub len: u16,
    pub flags_type: u16,
    pub flags2: u32,
    pub metadata: u32,
    pub errors: u16,
    pub rss_hash: u32,
}

impl RxRecord {
    /// A plain frame completion for shadow slot `opaque`.
    pub fn frame(opaque: u32, len: u16) -> RxRecord {
        RxRecord {
            opaque,
            len,
            flags_type: 0,
            flags2: 0,
            metadata: 0,
            errors: 0,
            rss_hash: 0,
        }
    }
}

pub struct RxHarness {
    pub queue: RxQueue,
    pub pool: &'static BufferPool,
    desc_base: *mut RxBufferDescriptor,
    cq_base: *mut CompletionBase,
    cq_size: u16,
    rx_db: *mut u32,
    cq_db: *mut u32,
}

impl RxHarness {
    pub fn new(desc_size: u16, cq_size: u16, pool_count: usize) -> RxHarness {
        let desc_base = leak_slots::<RxBufferDescriptor>(desc_size as usize);
        let cq_base = leak_slots::<CompletionBase>(cq_size as usize);
        let rx_db = leak_doorbell();
        let cq_db = leak_doorbell();
        let pool = leak_pool("rx-test", pool_count);

        let setup = RxQueueSetup {
            descriptors: unsafe { DescriptorRing::from_raw_parts(desc_base, desc_size) }.unwrap(),
            completions: unsafe { DescriptorRing::from_raw_parts(cq_base, cq_size) }.unwrap(),
            receive_doorbell: unsafe { DoorbellRegister::new(rx_db, DB_KEY_RX) },
            completion_doorbell: unsafe { DoorbellRegister::new(cq_db, DB_KEY_CMPL) },
            pool,
            free_thresh: 4,
            port: 0,
        };
        RxHarness {
            queue: RxQueue::new(setup).unwrap(),
            pool,
            desc_base,
            cq_base,
            cq_size,
            rx_db,
            cq_db,
        }
    }

    /// Device-side view of a receive descriptor.
    pub fn descriptor(&self, index: u16) -> &RxBufferDescriptor {
        unsafe { &*self.desc_base.add(index as usize) }
    }

    pub fn rx_doorbell(&self) -> u32 {
        unsafe { core::ptr::read_volatile(self.rx_db) }
    }

    pub fn cq_doorbell(&self) -> u32 {
        unsafe { core::ptr::read_volatile(self.cq_db) }
    }

    /// Plays the hardware: writes a receive completion pair at raw ring
    /// position `raw` (always even) with the validity parity the device
    /// would use for that traversal.
    pub fn post_rx(&mut self, raw: u32, record: RxRecord) {
        let mask = (self.cq_size - 1) as u32;
        let valid = ((raw + 1) & self.cq_size as u32) == 0;
        unsafe {
            let base = &mut *(self.cq_base.add((raw & mask) as usize) as *mut RxCompletion);
            base.flags_type.write(COMPLETION_TYPE_RX_PACKET | record.flags_type);
            base.len.write(record.len);
            base.opaque.write(record.opaque);
            base.rss_hash.write(record.rss_hash);

            let ext = &mut *(self.cq_base.add(((raw + 1) & mask) as usize) as *mut RxCompletionExt);
            ext.flags2.write(record.flags2);
            ext.metadata.write(record.metadata);
            ext.errors_v2.write(record.errors | valid as u16);
        }
    }
}

pub struct TxHarness {
    pub queue: TxQueue,
    pub pool: &'static BufferPool,
    desc_base: *mut TxBufferDescriptor,
    cq_base: *mut CompletionBase,
    cq_size: u16,
    tx_db: *mut u32,
    cq_db: *mut u32,
}

impl TxHarness {
    pub fn new(desc_size: u16, cq_size: u16, pool_count: usize) -> TxHarness {
        // A threshold at the ring size keeps reclaim out of the way
        // unless a test asks for it.
        Self::with_free_thresh(desc_size, cq_size, pool_count, desc_size)
    }

    pub fn with_free_thresh(
        desc_size: u16,
        cq_size: u16,
        pool_count: usize,
        free_thresh: u16,
    ) -> TxHarness {
        let desc_base = leak_slots::<TxBufferDescriptor>(desc_size as usize);
        let cq_base = leak_slots::<CompletionBase>(cq_size as usize);
        let tx_db = leak_doorbell();
        let cq_db = leak_doorbell();
        let pool = leak_pool("tx-test", pool_count);

        let setup = TxQueueSetup {
            descriptors: unsafe { DescriptorRing::from_raw_parts(desc_base, desc_size) }.unwrap(),
            completions: unsafe { DescriptorRing::from_raw_parts(cq_base, cq_size) }.unwrap(),
            transmit_doorbell: unsafe { DoorbellRegister::new(tx_db, DB_KEY_TX) },
            completion_doorbell: unsafe { DoorbellRegister::new(cq_db, DB_KEY_CMPL) },
            free_thresh,
            port: 0,
        };
        TxHarness {
            queue: TxQueue::new(setup).unwrap(),
            pool,
            desc_base,
            cq_base,
            cq_size,
            tx_db,
            cq_db,
        }
    }

    /// Device-side view of a transmit descriptor.
    pub fn descriptor(&self, index: u16) -> &TxBufferDescriptor {
        unsafe { &*self.desc_base.add(index as usize) }
    }

    pub fn tx_doorbell(&self) -> u32 {
        unsafe { core::ptr::read_volatile(self.tx_db) }
    }

    pub fn cq_doorbell(&self) -> u32 {
        unsafe { core::ptr::read_volatile(self.cq_db) }
    }

    /// Draws `count` buffers from this harness's pool as ready frames.
    pub fn frames(&self, count: usize, len: u16) -> VecDeque<PacketBuffer> {
        frames_from(self.pool, count, len)
    }

    /// Plays the hardware: writes a transmit completion record at raw
    /// ring position `raw` with the matching validity parity.
    pub fn post_tx(&mut self, raw: u32, completion_type: u16, opaque: u32) {
        let mask = (self.cq_size - 1) as u32;
        let valid = (raw & self.cq_size as u32) == 0;
        unsafe {
            let record = &mut *(self.cq_base.add((raw & mask) as usize) as *mut TxCompletion);
            record.flags_type.write(completion_type);
            record.opaque.write(opaque);
            record.errors_v.write(valid as u32);
        }
    }
}
