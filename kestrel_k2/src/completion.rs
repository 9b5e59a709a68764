//! Per-queue completion ring state: the hardware-shared record ring, the
//! raw consumer cursor, the wrap-parity flag, and the doorbell that
//! acknowledges consumed records.

use kestrel_ethernet::completions::{record_consumable, CompletionBase};
use kestrel_ethernet::ring::{DescriptorRing, DoorbellRegister};

pub(crate) struct CompletionRing {
    ring: DescriptorRing<CompletionBase>,
    /// Raw (unmasked) consumer cursor; grows monotonically and is masked
    /// into the ring on access.
    pub raw_cons: u32,
    /// Wrap parity of `raw_cons`: false while the cursor has traversed the
    /// ring an even number of times. Records written during an
    /// even-numbered traversal carry a validity bit of 1, so the expected
    /// bit value is always the inverse of this flag.
    pub valid: bool,
    doorbell: DoorbellRegister,
}

impl CompletionRing {
    pub fn new(ring: DescriptorRing<CompletionBase>, doorbell: DoorbellRegister) -> CompletionRing {
        CompletionRing { ring, raw_cons: 0, valid: false, doorbell }
    }

    pub fn mask(&self) -> u16 {
        self.ring.mask()
    }

    /// The record slot at `index`, masked into the ring.
    pub fn entry(&self, index: u16) -> &CompletionBase {
        self.ring.get(index)
    }

    /// Whether a record whose validity bit reads `valid_bit` may be
    /// consumed at raw cursor position `raw`.
    pub fn consumable(&self, valid_bit: bool, raw: u32) -> bool {
        record_consumable(valid_bit, raw, self.ring.size())
    }

    /// Wrap parity of an arbitrary raw cursor value on this ring.
    pub fn wrapped(&self, raw: u32) -> bool {
        raw & self.ring.size() as u32 != 0
    }

    /// Re-derives the parity flag from the persisted cursor.
    pub fn update_parity(&mut self) {
        self.valid = self.wrapped(self.raw_cons);
    }

    /// Acknowledges everything consumed so far to hardware.
    pub fn ring_doorbell(&self) {
        self.doorbell.ring(self.raw_cons & self.mask() as u32);
    }
}
