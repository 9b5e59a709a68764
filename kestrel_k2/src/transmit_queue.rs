//! The transmit side of the fast path: burst enqueue and completion
//! reclaim for one transmit queue.
//!
//! Descriptors are written in bursts with completion reporting suppressed
//! on every descriptor except the last, whose opaque word carries the
//! burst size; one completion record then retires the whole burst. The
//! reclaimer drains those records, walks the shadow ring, and returns the
//! freed buffers to their owning pools in per-pool batches.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::cmp;
use core::sync::atomic::{compiler_fence, Ordering};

use kestrel_ethernet::completions::{CompletionBase, COMPLETION_TYPE_TX};
use kestrel_ethernet::descriptors::{transmit_flags, TxBufferDescriptor, TX_BD_FLAGS_NO_CMPL};
use kestrel_ethernet::ring::{DescriptorRing, DoorbellRegister};
use nic_buffers::PacketBuffer;

use crate::completion::CompletionRing;
use crate::MAX_TX_BURST;

/// Everything the control plane provides to assemble one transmit queue.
pub struct TxQueueSetup {
    /// The hardware descriptor ring this queue produces frames into.
    pub descriptors: DescriptorRing<TxBufferDescriptor>,
    /// The completion ring hardware reports into; one slot per record.
    pub completions: DescriptorRing<CompletionBase>,
    /// Doorbell advertising newly written descriptors.
    pub transmit_doorbell: DoorbellRegister,
    /// Doorbell acknowledging consumed completion records.
    pub completion_doorbell: DoorbellRegister,
    /// Reclaim completions once at least this many descriptors are
    /// outstanding.
    pub free_thresh: u16,
    /// Port (device) number, used in log messages.
    pub port: u16,
}

/// One transmit queue. Polled by exactly one thread.
pub struct TxQueue {
    started: bool,
    port: u16,
    tx_descs: DescriptorRing<TxBufferDescriptor>,
    /// Shadow ring: the buffer each in-flight descriptor slot is sending.
    tx_bufs: Box<[Option<PacketBuffer>]>,
    /// Raw producer cursor; wraps through `u16` and is masked on access.
    tx_prod: u16,
    /// Raw consumer cursor, advanced by reclaim.
    tx_cons: u16,
    free_thresh: u16,
    completions: CompletionRing,
    tx_doorbell: DoorbellRegister,
    /// Scratch batch for grouping reclaimed buffers by pool; empty
    /// between calls, kept for its capacity.
    free_batch: Vec<PacketBuffer>,
}

impl TxQueue {
    /// Assembles a transmit queue from control-plane parts.
    pub fn new(setup: TxQueueSetup) -> Result<TxQueue, &'static str> {
        let TxQueueSetup {
            descriptors,
            completions,
            transmit_doorbell,
            completion_doorbell,
            free_thresh,
            port,
        } = setup;

        let size = descriptors.size();
        if completions.size() < size {
            return Err("TxQueue::new(): completion ring must hold one slot per descriptor");
        }
        if free_thresh == 0 || free_thresh > size {
            return Err("TxQueue::new(): free threshold must be within the ring");
        }
        debug!("tx queue {}: assembled, {} descriptors, free threshold {}", port, size, free_thresh);

        Ok(TxQueue {
            started: false,
            port,
            tx_bufs: (0..size).map(|_| None).collect::<Vec<_>>().into_boxed_slice(),
            tx_descs: descriptors,
            tx_prod: 0,
            tx_cons: 0,
            free_thresh,
            completions: CompletionRing::new(completions, completion_doorbell),
            tx_doorbell: transmit_doorbell,
            free_batch: Vec::with_capacity(size as usize),
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

    /// Descriptors handed to hardware and not yet reclaimed.
    fn outstanding(&self) -> u16 {
        self.tx_prod.wrapping_sub(self.tx_cons)
    }

    /// Descriptor slots free for enqueue.
    fn available(&self) -> u16 {
        self.tx_descs.size() - self.outstanding()
    }

    /// Sends frames from the front of `pkts` until the queue fills or the
    /// deque drains, in bursts of at most [`MAX_TX_BURST`].
    ///
    /// Non-blocking: returns the number of frames enqueued, which may be
    /// fewer than were offered; unsent frames stay in `pkts` for the
    /// caller to retry after a later reclaim.
    pub fn transmit_burst(&mut self, pkts: &mut VecDeque<PacketBuffer>) -> usize {
        if !self.started {
            debug!("tx queue {}: stopped, burst refused", self.port);
            return 0;
        }

        if self.outstanding() >= self.free_thresh {
            self.handle_completions();
        }

        let mut nb_sent = 0;
        while !pkts.is_empty() {
            let num = cmp::min(pkts.len(), MAX_TX_BURST as usize);
            let sent = self.enqueue_burst(pkts, num);
            nb_sent += sent;
            if sent < num {
                break;
            }
        }
        nb_sent
    }

    /// Writes up to `nb` frames into consecutive descriptor slots and
    /// rings the doorbell once for the lot.
    fn enqueue_burst(&mut self, pkts: &mut VecDeque<PacketBuffer>, nb: usize) -> usize {
        let nb = cmp::min(nb, self.available() as usize);
        if nb == 0 {
            return 0;
        }

        let mask = self.tx_descs.mask();
        let mut prod = self.tx_prod;
        let mut last = prod & mask;

        for _ in 0..nb {
            let buf = match pkts.pop_front() {
                Some(buf) => buf,
                None => break,
            };
            let idx = prod & mask;
            let bd = self.tx_descs.get_mut(idx);
            bd.address.write(buf.bus_address().value() + buf.meta.data_off as u64);
            bd.len.write(buf.meta.data_len);
            bd.flags_type.write(transmit_flags(buf.meta.data_len, TX_BD_FLAGS_NO_CMPL));
            self.tx_bufs[idx as usize] = Some(buf);
            last = idx;
            prod = prod.wrapping_add(1);
        }

        // One completion covers the burst: request it on the last
        // descriptor and tell hardware how many frames it retires.
        let bd = self.tx_descs.get_mut(last);
        bd.opaque.write(nb as u32);
        let flags = bd.flags_type.read();
        bd.flags_type.write(flags & !TX_BD_FLAGS_NO_CMPL);

        // Every descriptor write must be visible before the doorbell
        // triggers the fetch.
        compiler_fence(Ordering::Release);
        self.tx_doorbell.ring((prod & mask) as u32);
        self.tx_prod = prod;

        nb
    }

    /// Drains ready transmit completion records and reclaims the bursts
    /// they retire.
    fn handle_completions(&mut self) {
        let cq_mask = self.completions.mask() as u32;
        let mut raw_cons = self.completions.raw_cons;
        let mut nb_tx_pkts: u32 = 0;

        loop {
            let (ctype, opaque, valid_bit) = {
                let txcmp = self.completions.entry(raw_cons as u16).as_tx();
                (txcmp.completion_type(), txcmp.opaque.read(), txcmp.valid_bit())
            };

            if !self.completions.consumable(valid_bit, raw_cons) {
                break;
            }

            if ctype == COMPLETION_TYPE_TX {
                nb_tx_pkts += opaque;
            } else {
                error!("tx queue {}: unhandled completion type {:#04x}", self.port, ctype);
            }
            raw_cons = raw_cons.wrapping_add(1);

            if nb_tx_pkts >= cq_mask {
                break;
            }
        }

        self.completions.valid = self.completions.wrapped(raw_cons);
        if nb_tx_pkts > 0 {
            self.reclaim(nb_tx_pkts);
            self.completions.raw_cons = raw_cons;
            self.completions.ring_doorbell();
        }
    }

    /// Frees `nr_pkts` sent buffers from the shadow ring, batching bulk
    /// pool returns so consecutive buffers from one pool go back in one
    /// call and no call ever mixes pools.
    fn reclaim(&mut self, nr_pkts: u32) {
        let mask = self.tx_descs.mask();
        let mut cons = self.tx_cons;

        let mut remaining = nr_pkts;
        while remaining > 0 {
            remaining -= 1;
            let slot = (cons & mask) as usize;
            cons = cons.wrapping_add(1);

            let buf = match self.tx_bufs[slot].take() {
                Some(buf) => buf,
                None => continue,
            };
            // A buffer still referenced elsewhere is not ours to recycle.
            let buf = match buf.prefree() {
                Some(buf) => buf,
                None => continue,
            };

            let pool_changed = match self.free_batch.first() {
                Some(head) => !core::ptr::eq(head.pool(), buf.pool()),
                None => false,
            };
            if pool_changed {
                self.flush_free_batch();
            }
            self.free_batch.push(buf);
        }
        self.flush_free_batch();

        self.tx_cons = cons;
    }

    /// Returns the batched buffers to their (single) owning pool.
    fn flush_free_batch(&mut self) {
        let pool = match self.free_batch.first() {
            Some(buf) => buf.pool(),
            None => return,
        };
        pool.free_bulk(self.free_batch.drain(..));
    }
}
