//! This crate defines the layout of the memory objects that make up the
//! software interface between Kestrel K2-series converged NICs and their
//! driver, as well as functions to access the fields of these objects.
//!
//! The interface has three kinds of objects:
//! * **descriptors** ([`descriptors`]): written by software into the
//!   receive and transmit rings, consumed by hardware DMA;
//! * **completion records** ([`completions`]): written by hardware into a
//!   completion ring to report consumed descriptors, read by software;
//! * **rings and doorbells** ([`ring`]): the circular arrays the above
//!   live in, and the registers used to tell hardware how far software
//!   has progressed.
//!
//! Hardware and software share these objects without locks. The only
//! synchronization signals are the completion-record validity bit (whose
//! expected value flips on every full traversal of the completion ring)
//! and the rule that a doorbell write happens only after every descriptor
//! it advertises is visible in memory.
//!
//! All multi-byte fields are little-endian, matching the host byte order
//! of every platform this driver family targets.

#![cfg_attr(not(test), no_std)]

extern crate volatile;
extern crate bit_field;
#[macro_use] extern crate static_assertions;

pub mod completions;
pub mod descriptors;
pub mod ring;
