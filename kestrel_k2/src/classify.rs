//! Decodes receive completion bit fields into the packet-type tag and
//! offload-flag values of the buffer metadata header.
//!
//! All decoding is table lookups over small indexes derived from the
//! completion records, so the per-packet cost is independent of how many
//! protocol combinations the hardware can report. The tables are built at
//! compile time and shared read-only by every queue in the process.

use kestrel_ethernet::completions::{
    RX_CMPL_ERRORS_IP_CS_ERROR, RX_CMPL_ERRORS_L4_CS_ERROR, RX_CMPL_ERRORS_MASK,
    RX_CMPL_ERRORS_SHIFT, RX_CMPL_ERRORS_T_IP_CS_ERROR, RX_CMPL_ERRORS_T_L4_CS_ERROR,
    RX_CMPL_FLAGS2_IP_CS_CALC, RX_CMPL_FLAGS2_IP_TYPE, RX_CMPL_FLAGS2_L4_CS_CALC,
    RX_CMPL_FLAGS2_META_FORMAT_VLAN, RX_CMPL_FLAGS2_STATUS_MASK, RX_CMPL_FLAGS2_T_IP_CS_CALC,
    RX_CMPL_FLAGS2_T_L4_CS_CALC, RX_CMPL_FLAGS_ITYPE_MASK, RX_CMPL_FLAGS_RSS_VALID,
    RX_CMPL_ITYPE_ICMP, RX_CMPL_ITYPE_IP, RX_CMPL_ITYPE_TCP, RX_CMPL_ITYPE_UDP,
};
use nic_buffers::{offload, ptype};

/// Dimension of the packet-type table.
///
/// The index packs the tunnel-checksum bit, the IP-version bit, the VLAN
/// metadata bit, and the four item-type bits of a completion pair:
///
/// ```text
///     bit 0:    flags2 T_IP_CS_CALC (frame is tunneled)
///     bit 1:    flags2 IP_TYPE      (frame is IPv6)
///     bit 2:    flags2 META_FORMAT_VLAN
///     bits 3-6: flags_type ITYPE
/// ```
const PTYPE_TABLE_DIM: usize = 128;

const OL_FLAGS_TABLE_DIM: usize = 32;
const OL_FLAGS_ERR_TABLE_DIM: usize = 16;

static PTYPE_TABLE: [u32; PTYPE_TABLE_DIM] = build_ptype_table();
static OL_FLAGS_TABLE: [u32; OL_FLAGS_TABLE_DIM] = build_ol_flags_table();
static OL_FLAGS_ERR_TABLE: [u32; OL_FLAGS_ERR_TABLE_DIM] = build_ol_flags_err_table();

const fn build_ptype_table() -> [u32; PTYPE_TABLE_DIM] {
    let mut table = [0u32; PTYPE_TABLE_DIM];
    let mut i = 0;
    while i < PTYPE_TABLE_DIM {
        let tunneled = i & (RX_CMPL_FLAGS2_T_IP_CS_CALC >> 2) as usize != 0;
        let ip6 = i & (RX_CMPL_FLAGS2_IP_TYPE >> 7) as usize != 0;
        let vlan = i & (RX_CMPL_FLAGS2_META_FORMAT_VLAN >> 2) as usize != 0;
        let itype = ((i >> 3) & 0xf) as u16;

        let mut tag = if vlan { ptype::L2_ETHER_VLAN } else { ptype::L2_ETHER };

        let l3 = if tunneled {
            if ip6 {
                ptype::TUNNEL_IP | ptype::INNER_L3_IPV6
            } else {
                ptype::TUNNEL_IP | ptype::INNER_L3_IPV4
            }
        } else if ip6 {
            ptype::L3_IPV6
        } else {
            ptype::L3_IPV4
        };

        tag |= match itype {
            RX_CMPL_ITYPE_IP => l3,
            RX_CMPL_ITYPE_TCP => {
                l3 | if tunneled { ptype::INNER_L4_TCP } else { ptype::L4_TCP }
            }
            RX_CMPL_ITYPE_UDP => {
                l3 | if tunneled { ptype::INNER_L4_UDP } else { ptype::L4_UDP }
            }
            RX_CMPL_ITYPE_ICMP => {
                l3 | if tunneled { ptype::INNER_L4_ICMP } else { ptype::L4_ICMP }
            }
            // Item types the driver does not parse further stay L2-only.
            _ => 0,
        };

        table[i] = tag;
        i += 1;
    }
    table
}

const fn build_ol_flags_table() -> [u32; OL_FLAGS_TABLE_DIM] {
    let mut table = [0u32; OL_FLAGS_TABLE_DIM];
    let mut i = 0;
    while i < OL_FLAGS_TABLE_DIM {
        let mut flags = 0u32;
        if i & RX_CMPL_FLAGS2_IP_CS_CALC as usize != 0 {
            flags |= offload::RX_IP_CKSUM_GOOD;
        }
        if i & RX_CMPL_FLAGS2_L4_CS_CALC as usize != 0 {
            flags |= offload::RX_L4_CKSUM_GOOD;
        }
        if i & RX_CMPL_FLAGS2_T_L4_CS_CALC as usize != 0 {
            flags |= offload::RX_OUTER_L4_CKSUM_GOOD;
        }
        if i & RX_CMPL_FLAGS2_META_FORMAT_VLAN as usize != 0 {
            flags |= offload::RX_VLAN | offload::RX_VLAN_STRIPPED;
        }
        table[i] = flags;
        i += 1;
    }
    table
}

const fn build_ol_flags_err_table() -> [u32; OL_FLAGS_ERR_TABLE_DIM] {
    let mut table = [0u32; OL_FLAGS_ERR_TABLE_DIM];
    let mut i = 0;
    while i < OL_FLAGS_ERR_TABLE_DIM {
        let mut flags = 0u32;
        if i & (RX_CMPL_ERRORS_IP_CS_ERROR >> RX_CMPL_ERRORS_SHIFT) as usize != 0 {
            flags |= offload::RX_IP_CKSUM_BAD;
        }
        if i & (RX_CMPL_ERRORS_L4_CS_ERROR >> RX_CMPL_ERRORS_SHIFT) as usize != 0 {
            flags |= offload::RX_L4_CKSUM_BAD;
        }
        if i & (RX_CMPL_ERRORS_T_IP_CS_ERROR >> RX_CMPL_ERRORS_SHIFT) as usize != 0 {
            flags |= offload::RX_OUTER_IP_CKSUM_BAD;
        }
        if i & (RX_CMPL_ERRORS_T_L4_CS_ERROR >> RX_CMPL_ERRORS_SHIFT) as usize != 0 {
            flags |= offload::RX_OUTER_L4_CKSUM_BAD;
        }
        table[i] = flags;
        i += 1;
    }
    table
}

/// Resolves the packet-type tag from the `flags_type` word of the base
/// record and the `flags2` word of the extended record.
///
/// Pure over its inputs.
pub fn resolve_packet_type(flags_type: u16, flags2: u32) -> u32 {
    let index = ((flags_type & RX_CMPL_FLAGS_ITYPE_MASK) >> 9) as u32
        | ((flags2 & (RX_CMPL_FLAGS2_META_FORMAT_VLAN | RX_CMPL_FLAGS2_T_IP_CS_CALC)) >> 2)
        | ((flags2 & RX_CMPL_FLAGS2_IP_TYPE) >> 7);
    PTYPE_TABLE[index as usize]
}

/// Resolves the offload status flags from a completion pair's bit fields.
///
/// The success table is indexed with the error bits cleared out of the
/// calculation bits, and the error table with the raw error bits; the two
/// encodings are distinct in the hardware interface and must not be folded
/// into a single lookup. Pure over its inputs.
pub fn resolve_offload_flags(flags_type: u16, flags2: u32, errors_v2: u16) -> u32 {
    let flags = (flags2 & RX_CMPL_FLAGS2_STATUS_MASK) as u16;
    // An error bit only means something when the matching checksum was
    // actually computed.
    let errors = (errors_v2 >> RX_CMPL_ERRORS_SHIFT) & flags & RX_CMPL_ERRORS_MASK;

    let mut ol_flags = OL_FLAGS_TABLE[(flags & !errors) as usize];

    if flags_type & RX_CMPL_FLAGS_RSS_VALID != 0 {
        ol_flags |= offload::RX_RSS_HASH;
    }

    if errors != 0 {
        ol_flags |= OL_FLAGS_ERR_TABLE[errors as usize];
    }

    ol_flags
}
