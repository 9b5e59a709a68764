//! Buffer descriptors: the records software writes into the receive and
//! transmit rings to hand payload memory to hardware.
//!
//! Both directions use the same 16-byte shape (flags/type word, length,
//! an opaque software word, and a 64-bit bus address). The opaque word is
//! echoed back by hardware in completion records, which is how the driver
//! finds its bookkeeping again without reading descriptors back.

use volatile::Volatile;

/// Descriptor type field, bits 0-5 of `flags_type`.
pub const BD_TYPE_MASK: u16 = 0x3f;
/// Receive packet buffer descriptor.
pub const RX_BD_TYPE_PACKET: u16 = 0x04;
/// Transmit packet buffer descriptor.
pub const TX_BD_TYPE_PACKET: u16 = 0x10;

/// This buffer ends its frame.
pub const TX_BD_FLAGS_PACKET_END: u16 = 1 << 6;
/// Do not generate a completion record for this descriptor. Set on every
/// descriptor of a burst except the last, so one record covers the burst.
pub const TX_BD_FLAGS_NO_CMPL: u16 = 1 << 7;
/// Cut short any completion coalescing timer when this descriptor retires.
pub const TX_BD_FLAGS_COAL_NOW: u16 = 1 << 8;

/// Frame length hint, bits 13-14 of `flags_type`. Hardware uses the hint
/// to pick an internal DMA strategy; an inaccurate hint is a performance
/// bug, not a correctness bug.
pub const TX_BD_FLAGS_LHINT_MASK: u16 = 0x3 << 13;
pub const TX_BD_FLAGS_LHINT_LT512: u16 = 0x0 << 13;
pub const TX_BD_FLAGS_LHINT_LT1K: u16 = 0x1 << 13;
pub const TX_BD_FLAGS_LHINT_LT2K: u16 = 0x2 << 13;
pub const TX_BD_FLAGS_LHINT_GTE2K: u16 = 0x3 << 13;

/// A receive buffer descriptor.
///
/// Software owns `address`; rearm rewrites it for every fresh buffer while
/// leaving the type, length, and opaque words it set up at assembly time
/// untouched.
#[repr(C)]
pub struct RxBufferDescriptor {
    /// Descriptor type and flags.
    pub flags_type: Volatile<u16>,
    /// Usable length of the buffer behind `address`, in bytes.
    pub len: Volatile<u16>,
    /// Software word echoed into the matching completion record. The
    /// driver stores the ring index here.
    pub opaque: Volatile<u32>,
    /// Bus address hardware will DMA the received frame to.
    pub address: Volatile<u64>,
}

const_assert_eq!(core::mem::size_of::<RxBufferDescriptor>(), 16);

/// A transmit buffer descriptor.
#[repr(C)]
pub struct TxBufferDescriptor {
    /// Descriptor type, completion suppression, and length-hint flags.
    pub flags_type: Volatile<u16>,
    /// Number of frame bytes to fetch from `address`.
    pub len: Volatile<u16>,
    /// Software word echoed into the completion record. The driver stores
    /// the burst size in the one descriptor per burst that requests a
    /// completion.
    pub opaque: Volatile<u32>,
    /// Bus address hardware will fetch the frame from.
    pub address: Volatile<u64>,
}

const_assert_eq!(core::mem::size_of::<TxBufferDescriptor>(), 16);

/// Builds the `flags_type` word for a transmit descriptor carrying a
/// whole `len`-byte frame, folding in the length hint hardware wants.
pub fn transmit_flags(len: u16, flags: u16) -> u16 {
    let lhint = if len < 512 {
        TX_BD_FLAGS_LHINT_LT512
    } else if len < 1024 {
        TX_BD_FLAGS_LHINT_LT1K
    } else if len < 2048 {
        TX_BD_FLAGS_LHINT_LT2K
    } else {
        TX_BD_FLAGS_LHINT_GTE2K
    };
    flags | lhint | TX_BD_TYPE_PACKET | TX_BD_FLAGS_PACKET_END
}

use core::fmt;
impl fmt::Debug for RxBufferDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{flags_type: {:#x}, len: {}, opaque: {}, address: {:#x}}}",
            self.flags_type.read(), self.len.read(), self.opaque.read(), self.address.read())
    }
}

impl fmt::Debug for TxBufferDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{flags_type: {:#x}, len: {}, opaque: {}, address: {:#x}}}",
            self.flags_type.read(), self.len.read(), self.opaque.read(), self.address.read())
    }
}
