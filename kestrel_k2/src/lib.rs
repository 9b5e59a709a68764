//! Fast-path packet engine for Kestrel K2-series converged NICs.
//!
//! This crate moves packets between [`nic_buffers`] pools and the K2's
//! descriptor rings at line rate. It deliberately covers only the data
//! path; device bring-up, register configuration, interrupt routing, and
//! queue allocation live in the control plane, which hands each queue its
//! ring memory, doorbells, pool, and thresholds through a setup struct.
//!
//! The engine is two independent pipelines:
//!
//! * **Receive** ([`receive_queue`]): a rearm engine refills vacant
//!   descriptor slots with fresh pool buffers in even-sized batches, and a
//!   completion consumer polls the completion ring, validates each record
//!   pair against the expected wrap parity, recovers the matching buffer
//!   from the software shadow ring, and decodes length, hash, VLAN, type
//!   tag, and offload flags ([`classify`]) into the buffer's metadata
//!   header.
//! * **Transmit** ([`transmit_queue`]): an enqueue engine writes bursts of
//!   descriptors with completions suppressed on all but the last, and a
//!   reclaimer consumes the burst-level completion records, returning
//!   freed buffers to their owning pools in per-pool batches.
//!
//! Each queue is polled by exactly one thread; nothing here locks or
//! blocks. Allocation failure, ring-full, and no-completions-ready all
//! return immediately and are retried by the caller's next poll. A stopped
//! queue yields zero-count bursts until restarted.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use] extern crate log;
extern crate kestrel_ethernet;
extern crate nic_buffers;

pub mod classify;
mod completion;
pub mod receive_queue;
pub mod transmit_queue;

pub use receive_queue::{RxQueue, RxQueueSetup, RxQueueStats};
pub use transmit_queue::{TxQueue, TxQueueSetup};

/// Upper bound on packets delivered by one receive burst call.
pub const MAX_RX_BURST: u16 = 32;

/// Receive bursts are processed in groups of this many completions; a
/// burst request is rounded down to a multiple of it.
pub const DESCS_PER_LOOP: u16 = 4;

/// Upper bound on packets enqueued by one transmit ring pass; larger
/// requests are chunked.
pub const MAX_TX_BURST: u16 = 32;

#[cfg(test)]
pub(crate) mod test_support;
