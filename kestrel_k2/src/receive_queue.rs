//! The receive side of the fast path: descriptor rearm and completion
//! consumption for one receive queue.
//!
//! Hardware fills the buffers named by the receive descriptor ring and
//! reports each delivered frame as a pair of records in the completion
//! ring. Software's half of the contract is to keep the descriptor ring
//! stocked with fresh buffers (the rearm engine) and to drain the
//! completion ring without ever outrunning the validity bits (the
//! completion consumer).

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cmp;

use kestrel_ethernet::completions::CompletionBase;
use kestrel_ethernet::descriptors::{RxBufferDescriptor, RX_BD_TYPE_PACKET};
use kestrel_ethernet::ring::{DescriptorRing, DoorbellRegister};
use nic_buffers::{BufferPool, PacketBuffer, PacketMetadata, BUFFER_HEADROOM};

use crate::classify;
use crate::completion::CompletionRing;
use crate::{DESCS_PER_LOOP, MAX_RX_BURST};

/// Everything the control plane provides to assemble one receive queue.
pub struct RxQueueSetup {
    /// The hardware descriptor ring this queue produces buffers into.
    pub descriptors: DescriptorRing<RxBufferDescriptor>,
    /// The completion ring hardware reports into. Each received frame
    /// occupies two completion slots, so this ring must be at least twice
    /// the descriptor ring.
    pub completions: DescriptorRing<CompletionBase>,
    /// Doorbell advertising newly rearmed descriptors.
    pub receive_doorbell: DoorbellRegister,
    /// Doorbell acknowledging consumed completion records.
    pub completion_doorbell: DoorbellRegister,
    /// The pool this queue draws fresh buffers from.
    pub pool: &'static BufferPool,
    /// Rearm once at least this many descriptor slots are vacant.
    pub free_thresh: u16,
    /// Port (device) number, recorded in delivered packet metadata.
    pub port: u16,
}

/// Counters this queue maintains for the statistics export layer.
#[derive(Clone, Copy, Debug, Default)]
pub struct RxQueueStats {
    /// Buffers the rearm engine failed to allocate. Each failed rearm
    /// adds the whole batch it wanted; the batch is retried on a later
    /// poll, so the counter tracks allocation pressure, not frame loss.
    pub alloc_failed: u64,
}

/// One receive queue. Polled by exactly one thread.
pub struct RxQueue {
    started: bool,
    port: u16,
    rx_descs: DescriptorRing<RxBufferDescriptor>,
    /// Shadow ring: which pool buffer occupies each descriptor slot. The
    /// opaque word of a completion record indexes back into this.
    rx_bufs: Box<[Option<PacketBuffer>]>,
    /// Producer index over the descriptor ring, advanced as frames are
    /// delivered.
    rx_prod: u16,
    /// First vacant descriptor slot, always in `0..ring size`.
    rearm_start: u16,
    /// Number of vacant descriptor slots awaiting rearm.
    rearm_nb: u16,
    free_thresh: u16,
    completions: CompletionRing,
    rx_doorbell: DoorbellRegister,
    pool: &'static BufferPool,
    /// Template written over every delivered buffer's metadata header
    /// before the decoded fields are overlaid.
    meta_init: PacketMetadata,
    stats: RxQueueStats,
}

impl RxQueue {
    /// Assembles a receive queue from control-plane parts.
    ///
    /// Writes the fixed descriptor words (type, buffer length, and the
    /// opaque slot back-reference) once; the whole ring starts vacant and
    /// is stocked by the first burst's rearm.
    pub fn new(setup: RxQueueSetup) -> Result<RxQueue, &'static str> {
        let RxQueueSetup {
            mut descriptors,
            completions,
            receive_doorbell,
            completion_doorbell,
            pool,
            free_thresh,
            port,
        } = setup;

        let size = descriptors.size();
        if (completions.size() as u32) < size as u32 * 2 {
            return Err("RxQueue::new(): completion ring must hold two slots per descriptor");
        }
        if free_thresh == 0 || free_thresh > size {
            return Err("RxQueue::new(): free threshold must be within the ring");
        }

        let usable = (pool.buf_len() - BUFFER_HEADROOM as usize) as u16;
        for i in 0..size {
            let bd = descriptors.get_mut(i);
            bd.flags_type.write(RX_BD_TYPE_PACKET);
            bd.len.write(usable);
            bd.opaque.write(i as u32);
            bd.address.write(0);
        }
        debug!("rx queue {}: assembled, {} descriptors, free threshold {}", port, size, free_thresh);

        Ok(RxQueue {
            started: false,
            port,
            rx_descs: descriptors,
            rx_bufs: (0..size).map(|_| None).collect::<Vec<_>>().into_boxed_slice(),
            rx_prod: 0,
            rearm_start: 0,
            rearm_nb: size,
            free_thresh,
            completions: CompletionRing::new(completions, completion_doorbell),
            rx_doorbell: receive_doorbell,
            pool,
            meta_init: PacketMetadata { port, ..PacketMetadata::initial() },
            stats: RxQueueStats::default(),
        })
    }

    /// Lets bursts flow. Toggled by the control plane.
    pub fn start(&mut self) {
        self.started = true;
    }

    /// Stops the queue: every later burst call returns 0 until restarted.
    pub fn stop(&mut self) {
        self.started = false;
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn stats(&self) -> &RxQueueStats {
        &self.stats
    }

    /// Producer index over the descriptor ring, for the control plane's
    /// descriptor-status queries.
    pub fn producer_index(&self) -> u16 {
        self.rx_prod
    }

    /// Refills vacant descriptor slots with fresh pool buffers.
    ///
    /// Takes an even number of buffers, never past the ring end, in one
    /// all-or-nothing pool call; on allocation failure the batch is
    /// counted and left for the next poll. Each descriptor gets the
    /// buffer's bus address plus the headroom reservation; the other
    /// descriptor words stay as assembly wrote them.
    fn rearm(&mut self) {
        let ring_size = self.rx_descs.size();
        // Pairs only, and never split across the ring end.
        let nb = cmp::min(self.rearm_nb & !0x1, ring_size - self.rearm_start);
        if nb == 0 {
            return;
        }

        let bufs = match self.pool.alloc_bulk(nb as usize) {
            Some(bufs) => bufs,
            None => {
                self.stats.alloc_failed += nb as u64;
                return;
            }
        };

        let mut idx = self.rearm_start;
        let mut bufs = bufs.into_iter();
        while let (Some(buf0), Some(buf1)) = (bufs.next(), bufs.next()) {
            for buf in [buf0, buf1] {
                let address = buf.bus_address().value() + BUFFER_HEADROOM as u64;
                self.rx_descs.get_mut(idx).address.write(address);
                self.rx_bufs[idx as usize] = Some(buf);
                idx += 1;
            }
        }

        self.rearm_start += nb;
        self.rx_doorbell.ring((self.rearm_start - 1) as u32);
        if self.rearm_start >= ring_size {
            self.rearm_start = 0;
        }
        self.rearm_nb -= nb;
    }

    /// Delivers up to `nb_pkts` received frames into `rx_pkts`.
    ///
    /// Non-blocking: returns 0 when the queue is stopped, when fewer than
    /// [`DESCS_PER_LOOP`] frames were requested, or when no completions
    /// are ready. Rearms first whenever the vacant-slot count has crossed
    /// the queue's free threshold.
    pub fn receive_burst(&mut self, rx_pkts: &mut Vec<PacketBuffer>, nb_pkts: u16) -> u16 {
        if !self.started {
            return 0;
        }

        if self.rearm_nb >= self.free_thresh {
            self.rearm();
        }

        let mut nb_pkts = cmp::min(nb_pkts, MAX_RX_BURST);
        nb_pkts &= !(DESCS_PER_LOOP - 1);
        if nb_pkts == 0 {
            return 0;
        }

        let mut raw_cons = self.completions.raw_cons;
        let mut nb_rx: u16 = 0;

        for _ in 0..nb_pkts {
            // One frame is a pair of completion slots: the base record,
            // then the extended record carrying the pair's validity bit.
            // The cursor only ever moves in twos, so the pair never
            // straddles the ring end.
            let cons = raw_cons as u16;
            let (flags_type, len, opaque, rss_hash) = {
                let base = self.completions.entry(cons).as_rx();
                (base.flags_type.read(), base.len.read(), base.opaque.read(), base.rss_hash.read())
            };
            let (flags2, vlan_tci, errors_v2, valid_bit) = {
                let ext = self.completions.entry(cons + 1).as_rx_ext();
                (ext.flags2.read(), ext.vlan_tci(), ext.errors_v2.read(), ext.valid_bit())
            };

            if !self.completions.consumable(valid_bit, raw_cons + 1) {
                break;
            }
            raw_cons += 2;

            let slot = opaque as usize;
            if slot >= self.rx_bufs.len() {
                error!("rx queue {}: completion names slot {} beyond the ring", self.port, slot);
                break;
            }
            let mut mbuf = match self.rx_bufs[slot].take() {
                Some(mbuf) => mbuf,
                None => {
                    error!("rx queue {}: completion names vacant slot {}", self.port, slot);
                    break;
                }
            };

            // Scalar form of the one-pass lane extraction: length, hash,
            // VLAN, and the classifier outputs land in the metadata
            // header over the queue's template.
            mbuf.meta = self.meta_init;
            mbuf.meta.pkt_len = len as u32;
            mbuf.meta.data_len = len;
            mbuf.meta.rss_hash = rss_hash;
            mbuf.meta.vlan_tci = vlan_tci;
            mbuf.meta.packet_type = classify::resolve_packet_type(flags_type, flags2);
            mbuf.meta.ol_flags = classify::resolve_offload_flags(flags_type, flags2, errors_v2);

            rx_pkts.push(mbuf);
            nb_rx += 1;
        }

        if nb_rx > 0 {
            self.rx_prod = (self.rx_prod + nb_rx) & self.rx_descs.mask();
            self.rearm_nb += nb_rx;
            self.completions.raw_cons = raw_cons;
            self.completions.update_parity();
            self.completions.ring_doorbell();
        }

        nb_rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{self, RxHarness};
    use kestrel_ethernet::completions::{
        RX_CMPL_FLAGS_RSS_VALID, RX_CMPL_FLAGS_ITYPE_SHIFT, RX_CMPL_ITYPE_TCP,
        RX_CMPL_FLAGS2_IP_CS_CALC, RX_CMPL_FLAGS2_L4_CS_CALC, RX_CMPL_FLAGS2_META_FORMAT_VLAN,
    };
    use kestrel_ethernet::ring::{DB_KEY_CMPL, DB_KEY_RX};
    use nic_buffers::{offload, ptype};

    #[test]
    fn rearm_fills_eight_slots_and_rings_the_last_index() {
        let mut h = RxHarness::new(16, 32, 32);
        h.queue.rearm_nb = 8;

        h.queue.rearm();

        assert_eq!(h.pool.available(), 32 - 8, "exactly 8 buffers allocated");
        for slot in 0..8 {
            assert!(h.queue.rx_bufs[slot].is_some(), "slot {} filled", slot);
        }
        for slot in 8..16 {
            assert!(h.queue.rx_bufs[slot].is_none(), "slot {} untouched", slot);
        }
        assert_eq!(h.rx_doorbell(), DB_KEY_RX | 7, "doorbell rung at index 7");
        assert_eq!(h.queue.rearm_start, 8);
        assert_eq!(h.queue.rearm_nb, 0);
    }

    #[test]
    fn rearm_count_is_even_and_stops_at_the_ring_end() {
        let mut h = RxHarness::new(16, 32, 32);

        // 5 pending rounds down to 4.
        h.queue.rearm_nb = 5;
        h.queue.rearm();
        assert_eq!(h.queue.rearm_start, 4);
        assert_eq!(h.queue.rearm_nb, 1);

        // 14 pending from slot 4 is capped at the 12 slots left before
        // the ring end; the wrap is left for the next call.
        h.queue.rearm_nb = 14;
        h.queue.rearm();
        assert_eq!(h.queue.rearm_start, 0, "advanced to the end and wrapped");
        assert_eq!(h.queue.rearm_nb, 2);
        assert_eq!(h.rx_doorbell(), DB_KEY_RX | 15);
    }

    #[test]
    fn rearm_descriptor_address_adds_the_headroom_reservation() {
        let mut h = RxHarness::new(16, 32, 32);
        h.queue.rearm_nb = 2;
        h.queue.rearm();

        for slot in 0..2u16 {
            let written = h.descriptor(slot).address.read();
            let buf = h.queue.rx_bufs[slot as usize].as_ref().unwrap();
            assert_eq!(written, buf.bus_address().value() + BUFFER_HEADROOM as u64);
            // The words assembly wrote are preserved.
            assert_eq!(h.descriptor(slot).opaque.read(), slot as u32);
            assert_eq!(h.descriptor(slot).flags_type.read(), RX_BD_TYPE_PACKET);
        }
    }

    #[test]
    fn rearm_allocation_failure_is_counted_and_retried_later() {
        let mut h = RxHarness::new(16, 32, 4);
        h.queue.rearm_nb = 8;

        h.queue.rearm();
        assert_eq!(h.queue.stats().alloc_failed, 8);
        assert_eq!(h.queue.rearm_start, 0, "no slot consumed on failure");
        assert_eq!(h.queue.rearm_nb, 8);
        assert!(h.queue.rx_bufs.iter().all(|slot| slot.is_none()));

        // The next poll finds a replenished pool and succeeds.
        h.pool.populate(8);
        h.queue.rearm();
        assert_eq!(h.queue.rearm_start, 8);
        assert_eq!(h.queue.stats().alloc_failed, 8, "failure count unchanged by success");
    }

    #[test]
    fn stopped_queue_delivers_nothing() {
        let mut h = RxHarness::new(8, 16, 16);
        let mut out = Vec::new();
        assert_eq!(h.queue.receive_burst(&mut out, 8), 0);
        assert!(out.is_empty());
        assert_eq!(h.pool.available(), 16, "a stopped queue does not rearm");
    }

    #[test]
    fn short_requests_round_down_to_nothing() {
        let mut h = RxHarness::new(8, 16, 16);
        h.queue.start();
        let mut out = Vec::new();
        assert_eq!(h.queue.receive_burst(&mut out, 3), 0);
    }

    #[test]
    fn delivered_frames_carry_decoded_metadata() {
        let mut h = RxHarness::new(8, 16, 16);
        h.queue.start();

        // First poll stocks the ring; nothing has arrived yet.
        let mut out = Vec::new();
        assert_eq!(h.queue.receive_burst(&mut out, 8), 0);
        let slot0_addr = h.descriptor(0).address.read();

        let flags_type = RX_CMPL_FLAGS_RSS_VALID | (RX_CMPL_ITYPE_TCP << RX_CMPL_FLAGS_ITYPE_SHIFT);
        let flags2 = RX_CMPL_FLAGS2_IP_CS_CALC | RX_CMPL_FLAGS2_L4_CS_CALC | RX_CMPL_FLAGS2_META_FORMAT_VLAN;
        h.post_rx(0, test_support::RxRecord {
            opaque: 0,
            len: 1200,
            flags_type,
            flags2,
            metadata: 0x0123,
            errors: 0,
            rss_hash: 0xabcd_1234,
        });

        let delivered = h.queue.receive_burst(&mut out, 8);
        assert_eq!(delivered, 1);
        let mbuf = &out[0];
        assert_eq!(mbuf.meta.pkt_len, 1200);
        assert_eq!(mbuf.meta.data_len, 1200);
        assert_eq!(mbuf.meta.rss_hash, 0xabcd_1234);
        assert_eq!(mbuf.meta.vlan_tci, 0x0123);
        assert_eq!(mbuf.meta.port, 0);
        assert_eq!(
            mbuf.meta.packet_type,
            ptype::L2_ETHER_VLAN | ptype::L3_IPV4 | ptype::L4_TCP
        );
        assert_eq!(
            mbuf.meta.ol_flags,
            offload::RX_RSS_HASH | offload::RX_IP_CKSUM_GOOD | offload::RX_L4_CKSUM_GOOD
                | offload::RX_VLAN | offload::RX_VLAN_STRIPPED
        );

        // Round trip: the delivered buffer is the one that was parked in
        // shadow slot 0.
        assert_eq!(mbuf.bus_address().value() + BUFFER_HEADROOM as u64, slot0_addr);

        // Book-keeping after the burst.
        assert_eq!(h.queue.rearm_nb, 1);
        assert_eq!(h.queue.producer_index(), 1);
        assert_eq!(h.queue.completions.raw_cons, 2);
        assert_eq!(h.cq_doorbell(), DB_KEY_CMPL | 2);
    }

    #[test]
    fn burst_stops_at_the_first_unready_record() {
        let mut h = RxHarness::new(8, 16, 16);
        h.queue.start();
        let mut out = Vec::new();
        h.queue.receive_burst(&mut out, 8);

        h.post_rx(0, test_support::RxRecord::frame(0, 100));
        h.post_rx(2, test_support::RxRecord::frame(1, 200));
        // Nothing at raw slot 4: its validity bit still shows the stale
        // parity.

        assert_eq!(h.queue.receive_burst(&mut out, 8), 2);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].meta.data_len, 100);
        assert_eq!(out[1].meta.data_len, 200);
        assert_eq!(h.queue.completions.raw_cons, 4);
    }

    #[test]
    fn parity_flips_exactly_once_per_full_traversal() {
        let mut h = RxHarness::new(8, 16, 16);
        h.queue.start();
        let mut out = Vec::new();
        h.queue.receive_burst(&mut out, 8);
        assert!(!h.queue.completions.valid);

        // Eight frames fill the 16-slot completion ring exactly once.
        for i in 0..8u32 {
            h.post_rx(i * 2, test_support::RxRecord::frame(i, 64));
        }
        assert_eq!(h.queue.receive_burst(&mut out, 8), 8);
        assert_eq!(h.queue.completions.raw_cons, 16);
        assert!(h.queue.completions.valid, "parity flipped after one traversal");

        // Recycle the delivered buffers and let the rearm restock, then
        // run a second traversal; the parity flips back.
        h.pool.free_bulk(out.drain(..));
        for i in 0..8u32 {
            h.post_rx(16 + i * 2, test_support::RxRecord::frame(i, 64));
        }
        assert_eq!(h.queue.receive_burst(&mut out, 8), 8);
        assert_eq!(h.queue.completions.raw_cons, 32);
        assert!(!h.queue.completions.valid, "parity flipped back after the second");
    }
}
