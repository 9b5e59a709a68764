//! Completion records: the records hardware writes into a completion ring
//! to report work it has finished.
//!
//! Every record occupies one 16-byte completion slot. A transmit
//! completion is a single slot; a receive completion is a pair of
//! consecutive slots (a base record followed by an extended record). The
//! different record forms are overlays of the same slot layout, so a ring
//! is declared as `[CompletionBase]` and reinterpreted per record type,
//! the way the hardware interface specifies them.
//!
//! # The validity bit
//!
//! Hardware never moves a consumer index; instead, the third doubleword of
//! every record carries a validity bit. Hardware writes the bit as 1 on
//! its first pass over the ring, 0 on the second, 1 on the third, and so
//! on. Software mirrors this by expecting 1 until its raw consumer cursor
//! has traversed the ring once, then 0, and so on: a record is consumable
//! exactly when its validity bit matches the expected value for the
//! cursor position. See [`record_consumable`].

use bit_field::BitField;
use volatile::Volatile;

/// Completion type field, bits 0-5 of the first word of every record.
pub const COMPLETION_TYPE_MASK: u16 = 0x3f;
/// A transmit completion record.
pub const COMPLETION_TYPE_TX: u16 = 0x00;
/// A receive packet completion record (base slot of the pair).
pub const COMPLETION_TYPE_RX_PACKET: u16 = 0x11;

/// Validity bit, bit 0 of the third doubleword of every record form.
pub const COMPLETION_VALID: u32 = 1 << 0;

/// `RxCompletion::flags_type` bit 10: `RxCompletion::rss_hash` is valid.
pub const RX_CMPL_FLAGS_RSS_VALID: u16 = 1 << 10;
/// `RxCompletion::flags_type` bits 12-15: the item type hardware parsed.
pub const RX_CMPL_FLAGS_ITYPE_MASK: u16 = 0xf000;
pub const RX_CMPL_FLAGS_ITYPE_SHIFT: u16 = 12;

/// Item types, the values of the `ITYPE` field.
pub const RX_CMPL_ITYPE_NOT_KNOWN: u16 = 0x0;
pub const RX_CMPL_ITYPE_IP: u16 = 0x1;
pub const RX_CMPL_ITYPE_TCP: u16 = 0x2;
pub const RX_CMPL_ITYPE_UDP: u16 = 0x3;
pub const RX_CMPL_ITYPE_ICMP: u16 = 0x7;

/// `RxCompletionExt::flags2` bit 0: IP checksum was computed.
pub const RX_CMPL_FLAGS2_IP_CS_CALC: u32 = 1 << 0;
/// `RxCompletionExt::flags2` bit 1: L4 checksum was computed.
pub const RX_CMPL_FLAGS2_L4_CS_CALC: u32 = 1 << 1;
/// `RxCompletionExt::flags2` bit 2: tunnel (outer) IP checksum was computed.
pub const RX_CMPL_FLAGS2_T_IP_CS_CALC: u32 = 1 << 2;
/// `RxCompletionExt::flags2` bit 3: tunnel (outer) L4 checksum was computed.
pub const RX_CMPL_FLAGS2_T_L4_CS_CALC: u32 = 1 << 3;
/// `RxCompletionExt::flags2` bit 4: `metadata` holds a stripped VLAN tag.
pub const RX_CMPL_FLAGS2_META_FORMAT_VLAN: u32 = 1 << 4;
/// `RxCompletionExt::flags2` bit 8: the frame is IPv6 (otherwise IPv4).
pub const RX_CMPL_FLAGS2_IP_TYPE: u32 = 1 << 8;

/// The five checksum/VLAN calculation bits of `flags2` together.
pub const RX_CMPL_FLAGS2_STATUS_MASK: u32 = 0x1f;

/// `RxCompletionExt::errors_v2` bit 0: the validity bit of the pair.
pub const RX_CMPL_ERRORS_V2_VALID: u16 = 1 << 0;
/// `RxCompletionExt::errors_v2` bits 4-7: checksum error bits, aligned
/// with the low four calculation bits of `flags2` once shifted down.
pub const RX_CMPL_ERRORS_IP_CS_ERROR: u16 = 1 << 4;
pub const RX_CMPL_ERRORS_L4_CS_ERROR: u16 = 1 << 5;
pub const RX_CMPL_ERRORS_T_IP_CS_ERROR: u16 = 1 << 6;
pub const RX_CMPL_ERRORS_T_L4_CS_ERROR: u16 = 1 << 7;
pub const RX_CMPL_ERRORS_SHIFT: u16 = 4;
pub const RX_CMPL_ERRORS_MASK: u16 = 0xf;

/// The generic form of one completion slot.
///
/// Used to declare completion rings; real records are read through the
/// `as_*` overlay accessors once their type is known.
#[repr(C)]
pub struct CompletionBase {
    /// Record type (bits 0-5) and type-specific flags.
    pub flags_type: Volatile<u16>,
    pub info1: Volatile<u16>,
    pub info2: Volatile<u32>,
    /// Type-specific information plus the validity bit (bit 0).
    pub info3_v: Volatile<u32>,
    pub info4: Volatile<u32>,
}

const_assert_eq!(core::mem::size_of::<CompletionBase>(), 16);

/// Base slot of a receive completion pair.
#[repr(C)]
pub struct RxCompletion {
    /// Record type, RSS validity, and the parsed item type.
    pub flags_type: Volatile<u16>,
    /// Received frame length in bytes.
    pub len: Volatile<u16>,
    /// The opaque word of the consumed receive descriptor.
    pub opaque: Volatile<u32>,
    /// Aggregation-buffer count and the base record's validity shadow.
    pub agg_bufs_v1: Volatile<u8>,
    /// Which header tuple fed the RSS hash.
    pub rss_hash_type: Volatile<u8>,
    /// Offset of the payload within the frame, when hardware parsed it.
    pub payload_offset: Volatile<u8>,
    pub unused1: Volatile<u8>,
    /// Receive-side-scaling hash over the frame's flow tuple.
    pub rss_hash: Volatile<u32>,
}

const_assert_eq!(core::mem::size_of::<RxCompletion>(), 16);

/// Extended (second) slot of a receive completion pair.
///
/// Carries the pair's validity bit; the consumer checks this record, not
/// the base one, so a half-written pair is never acted on.
#[repr(C)]
pub struct RxCompletionExt {
    /// Checksum-calculation, VLAN, and IP-version flags.
    pub flags2: Volatile<u32>,
    /// Format depends on `flags2`: with `META_FORMAT_VLAN` set, bits 0-15
    /// are the stripped VLAN tag control information.
    pub metadata: Volatile<u32>,
    /// Checksum error bits (bits 4-7) and the pair's validity bit (bit 0).
    pub errors_v2: Volatile<u16>,
    pub cfa_code: Volatile<u16>,
    pub reorder: Volatile<u32>,
}

const_assert_eq!(core::mem::size_of::<RxCompletionExt>(), 16);

/// A transmit completion record.
#[repr(C)]
pub struct TxCompletion {
    /// Record type.
    pub flags_type: Volatile<u16>,
    pub unused0: Volatile<u16>,
    /// The opaque word of the descriptor that requested this completion;
    /// the driver stores the burst size there, so one record retires a
    /// whole burst.
    pub opaque: Volatile<u32>,
    /// Error bits plus the validity bit (bit 0).
    pub errors_v: Volatile<u32>,
    pub unused1: Volatile<u32>,
}

const_assert_eq!(core::mem::size_of::<TxCompletion>(), 16);

impl CompletionBase {
    /// The record type stored in this slot.
    pub fn completion_type(&self) -> u16 {
        self.flags_type.read() & COMPLETION_TYPE_MASK
    }

    /// This slot's validity bit.
    pub fn valid_bit(&self) -> bool {
        self.info3_v.read().get_bit(0)
    }

    /// Reinterprets this slot as the base record of a receive pair.
    pub fn as_rx(&self) -> &RxCompletion {
        // All record forms are 16-byte overlays of the same slot.
        unsafe { &*(self as *const CompletionBase as *const RxCompletion) }
    }

    /// Reinterprets this slot as the extended record of a receive pair.
    pub fn as_rx_ext(&self) -> &RxCompletionExt {
        unsafe { &*(self as *const CompletionBase as *const RxCompletionExt) }
    }

    /// Reinterprets this slot as a transmit completion.
    pub fn as_tx(&self) -> &TxCompletion {
        unsafe { &*(self as *const CompletionBase as *const TxCompletion) }
    }
}

impl RxCompletionExt {
    /// The pair's validity bit.
    pub fn valid_bit(&self) -> bool {
        self.errors_v2.read().get_bit(0)
    }

    /// The stripped VLAN tag, meaningful when `META_FORMAT_VLAN` is set.
    pub fn vlan_tci(&self) -> u16 {
        self.metadata.read().get_bits(0..16) as u16
    }
}

impl TxCompletion {
    pub fn valid_bit(&self) -> bool {
        self.errors_v.read().get_bit(0)
    }

    pub fn completion_type(&self) -> u16 {
        self.flags_type.read() & COMPLETION_TYPE_MASK
    }
}

/// Whether a record whose validity bit reads `valid_bit` is consumable at
/// raw cursor position `raw_index` of a `ring_size`-slot completion ring.
///
/// The expected value is 1 while `raw_index` has wrapped the ring an even
/// number of times and 0 otherwise; `ring_size` must be a power of two so
/// the wrap count parity is exactly the `ring_size` bit of the raw cursor.
pub fn record_consumable(valid_bit: bool, raw_index: u32, ring_size: u16) -> bool {
    valid_bit == ((raw_index & ring_size as u32) == 0)
}
