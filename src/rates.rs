//! The device's unified rate table and rate selection.
//!
//! Firmware addresses transmit rates through a single index space covering
//! the four CCK rates, the eight OFDM rates and, via a parallel PLCP
//! column, HT MCS 0-7. Rate selection for outgoing frames follows the
//! station's negotiated capabilities unless the host pinned a fixed rate.
use crate::fwcmd::{
    RATE_MCS_ANT_A_MSK, RATE_MCS_ANT_B_MSK, RATE_MCS_CCK_MSK, RATE_MCS_HT_MSK, RATE_MCS_SGI_MSK,
};

/// PLCP value marking an index without an HT equivalent.
const HT_PLCP_INVALID: u8 = 0x20;

/// One row of the device rate table.
#[derive(Debug, Clone, Copy)]
pub struct DeviceRate {
    /// Rate in 500 kbit/s units, as carried in 802.11 rate sets.
    pub rate: u8,
    /// Legacy (CCK or OFDM) PLCP signal value.
    pub plcp: u8,
    /// HT PLCP value, [HT_PLCP_INVALID] for CCK-only rows.
    pub ht_plcp: u8,
}

const fn rate(rate: u8, plcp: u8, ht_plcp: u8) -> DeviceRate {
    DeviceRate {
        rate,
        plcp,
        ht_plcp,
    }
}

/// Indexes 0-3 are CCK, 4-11 are OFDM. HT MCS 0-7 alias onto the OFDM rows.
pub static RATE_TABLE: [DeviceRate; 12] = [
    rate(2, 10, HT_PLCP_INVALID),
    rate(4, 20, HT_PLCP_INVALID),
    rate(11, 55, HT_PLCP_INVALID),
    rate(22, 110, HT_PLCP_INVALID),
    rate(12, 0xd, 0x0),
    rate(18, 0xf, 0x1),
    rate(24, 0x5, 0x2),
    rate(36, 0x7, 0x3),
    rate(48, 0x9, 0x4),
    rate(72, 0xb, 0x5),
    rate(96, 0x1, 0x6),
    rate(108, 0x3, 0x7),
];

pub const RIDX_1MB: usize = 0;
pub const RIDX_6MB: usize = 4;
pub const RIDX_MAX: usize = RATE_TABLE.len() - 1;

/// Lowest mandatory index per band.
pub const fn min_basic_ridx(band_2ghz: bool) -> usize {
    if band_2ghz {
        RIDX_1MB
    } else {
        RIDX_6MB
    }
}

pub const fn ridx_is_cck(ridx: usize) -> bool {
    ridx < RIDX_6MB
}

/// Device rate index for an HT MCS (0-7).
pub const fn mcs_to_ridx(mcs: u8) -> usize {
    RIDX_6MB + mcs as usize
}

/// Device rate index for an 802.11 rate value in 500 kbit/s units, with the
/// basic-rate bit stripped. Unknown values fall back to the band minimum.
pub fn rval_to_ridx(rval: u8, band_2ghz: bool) -> usize {
    let rval = rval & 0x7f;
    RATE_TABLE
        .iter()
        .position(|r| r.rate == rval)
        .unwrap_or(min_basic_ridx(band_2ghz))
}

/// What the caller knows about the frame and the peer when picking a rate.
#[derive(Debug, Clone, Copy)]
pub struct RateSelection {
    pub is_data: bool,
    pub multicast: bool,
    pub band_2ghz: bool,
    /// Peer negotiated HT and CCK fallback is not forced.
    pub ht: bool,
    /// Short guard interval usable at 20 MHz.
    pub sgi20: bool,
    /// Current MCS chosen by the host rate control, when HT.
    pub txmcs: u8,
    /// Current legacy rate (500 kbit/s units) chosen by the host.
    pub txrate: u8,
    /// Host-pinned rate index, bypassing rate control.
    pub fixed_ridx: Option<usize>,
}

/// Pick the device rate index and build the firmware `rate_n_flags` word.
///
/// Management and multicast frames always go out at the band's minimum
/// basic rate so every receiver can decode them.
pub fn select_rate(sel: &RateSelection) -> (usize, u32) {
    let ridx = if !sel.is_data || sel.multicast {
        min_basic_ridx(sel.band_2ghz)
    } else if let Some(fixed) = sel.fixed_ridx {
        fixed.min(RIDX_MAX)
    } else if sel.ht {
        mcs_to_ridx(sel.txmcs.min(7))
    } else {
        rval_to_ridx(sel.txrate, sel.band_2ghz)
    };

    let row = &RATE_TABLE[ridx];
    let mut flags = RATE_MCS_ANT_A_MSK;
    if ridx_is_cck(ridx) {
        flags |= RATE_MCS_CCK_MSK;
        flags |= row.plcp as u32;
    } else if sel.ht && sel.is_data && !sel.multicast && sel.fixed_ridx.is_none() {
        flags |= RATE_MCS_HT_MSK | RATE_MCS_ANT_B_MSK;
        flags |= row.ht_plcp as u32;
        if sel.sgi20 {
            flags |= RATE_MCS_SGI_MSK;
        }
    } else {
        flags |= row.plcp as u32;
    }
    (ridx, flags)
}
