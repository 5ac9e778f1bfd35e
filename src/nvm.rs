//! Non-volatile memory access and parsing.
//!
//! The calibration data, the MAC address and the regulatory channel map
//! live in NVM sections the firmware serves over the command ring in
//! bounded chunks. Parsing tolerates a missing hardware section as long as
//! the override section carries a usable MAC address.
use alloc::{vec, vec::Vec};

use log::{debug, warn};
use zerocopy::FromBytes;

use crate::{
    cmd::{CommandLink, HostCmd, CMD_RESP_MAX, CMD_SEND_IN_RFKILL, CMD_WANT_RESP},
    fwcmd::{NvmAccessCmd, NvmAccessResp, CMD_NVM_ACCESS, NVM_READ_NOT_VALID_ADDRESS, NVM_READ_OPCODE},
    Error, Result,
};

// Section indices.
pub const SECTION_SW: u16 = 1;
pub const SECTION_REGULATORY: u16 = 3;
pub const SECTION_CALIBRATION: u16 = 4;
pub const SECTION_PRODUCTION: u16 = 5;
pub const SECTION_REGULATORY_SDP: u16 = 8;
pub const SECTION_HW: u16 = 10;
pub const SECTION_MAC_OVERRIDE: u16 = 11;
pub const SECTION_PHY_SKU: u16 = 12;
pub const NUM_SECTIONS: usize = 13;

/// Bytes requested per NVM access command.
const CHUNK_SIZE: usize = 2048;
/// Cap on a single section, in bytes.
pub const MAX_SECTION_SIZE: usize = 0x8000;

// 16-bit word offsets into the sections.
const SW_VERSION: usize = 0;
const SW_N_HW_ADDRS: usize = 3;
const PHY_SKU_RADIO_CFG: usize = 0;
const PHY_SKU_SKU: usize = 2;
/// Byte offset of the override MAC in its section.
const MAC_OVERRIDE_OFFSET: usize = 2;

pub const SKU_CAP_BAND_24GHZ: u32 = 1 << 0;
pub const SKU_CAP_BAND_52GHZ: u32 = 1 << 1;
pub const SKU_CAP_11N_ENABLE: u32 = 1 << 2;
pub const SKU_CAP_11AC_ENABLE: u32 = 1 << 3;
pub const SKU_CAP_MIMO_DISABLE: u32 = 1 << 5;

// Per-channel regulatory flags as stored in NVM.
pub const CHANNEL_VALID: u16 = 1 << 0;
pub const CHANNEL_IBSS: u16 = 1 << 1;
pub const CHANNEL_ACTIVE: u16 = 1 << 3;
pub const CHANNEL_RADAR: u16 = 1 << 4;
pub const CHANNEL_INDOOR_ONLY: u16 = 1 << 5;
pub const CHANNEL_GO_CONCURRENT: u16 = 1 << 6;
pub const CHANNEL_40MHZ: u16 = 1 << 9;

/// Channel numbers in NVM order; the first 14 are 2.4 GHz.
pub static NVM_CHANNELS: [u8; 51] = [
    1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 36, 40, 44, 48, 52, 56, 60, 64, 68, 72, 76, 80,
    84, 88, 92, 96, 100, 104, 108, 112, 116, 120, 124, 128, 132, 136, 140, 144, 149, 153, 157,
    161, 165, 169, 173, 177, 181,
];
pub const FIRST_5GHZ_CHANNEL: usize = 14;

/// Placeholder address some OEM units ship with; never usable on air.
const RESERVED_MAC: [u8; 6] = [0x02, 0xcc, 0xaa, 0xff, 0xee, 0x00];

/// One usable channel from the regulatory section.
#[derive(Debug, Clone, Copy)]
pub struct Channel {
    pub num: u8,
    pub flags: u16,
    pub band_2ghz: bool,
}

/// Parsed NVM contents.
#[derive(Debug, Clone)]
pub struct NvmData {
    pub version: u16,
    pub n_hw_addrs: u16,
    pub hw_addr: [u8; 6],
    pub sku_cap_band_24ghz: bool,
    pub sku_cap_band_52ghz: bool,
    pub sku_cap_11n_enable: bool,
    pub sku_cap_11ac_enable: bool,
    pub sku_cap_mimo_disable: bool,
    pub radio_cfg_type: u16,
    pub radio_cfg_step: u8,
    pub radio_cfg_dash: u8,
    pub radio_cfg_pnum: u8,
    pub valid_tx_ant: u8,
    pub valid_rx_ant: u8,
    pub channels: Vec<Channel>,
}

/// Read one NVM section in [CHUNK_SIZE] chunks until the device reports
/// its end.
pub async fn read_section<L: CommandLink>(
    link: &L,
    section: u16,
    max_len: usize,
) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let remain = max_len.saturating_sub(out.len());
        if remain == 0 {
            break;
        }
        let want = remain.min(CHUNK_SIZE);
        let req = NvmAccessCmd {
            offset: (out.len() as u16).into(),
            length: (want as u16).into(),
            section: section.into(),
            op_code: NVM_READ_OPCODE,
            reserved: 0,
        };
        let resp = link
            .send_cmd(HostCmd {
                id: CMD_NVM_ACCESS as u16,
                flags: CMD_WANT_RESP | CMD_SEND_IN_RFKILL,
                data: &[zerocopy::IntoBytes::as_bytes(&req)],
                resp_len: CMD_RESP_MAX,
            })
            .await?
            .ok_or(Error::BadResponse)?;
        let payload = resp.payload();
        let (hdr, data) =
            NvmAccessResp::ref_from_prefix(payload).map_err(|_| Error::BadResponse)?;
        let status = hdr.status.get();
        if status == NVM_READ_NOT_VALID_ADDRESS && !out.is_empty() {
            // Reading past the end of a section is how its length is found.
            break;
        }
        if status != 0 {
            warn!("NVM read of section {section} failed with status {status}");
            return Err(Error::NvmRead);
        }
        if hdr.offset.get() as usize != out.len() {
            return Err(Error::NvmRead);
        }
        let seglen = hdr.length.get() as usize;
        if seglen > data.len() || seglen > want {
            return Err(Error::NvmRead);
        }
        out.extend_from_slice(&data[..seglen]);
        if seglen < want {
            break;
        }
    }
    debug!("NVM section {section}: {} bytes", out.len());
    Ok(out)
}

/// Read every section the parser can use. Missing optional sections come
/// back empty.
pub async fn read_all_sections<L: CommandLink>(link: &L) -> Result<[Vec<u8>; NUM_SECTIONS]> {
    let mut sections: [Vec<u8>; NUM_SECTIONS] = Default::default();
    for &section in &[
        SECTION_SW,
        SECTION_REGULATORY,
        SECTION_CALIBRATION,
        SECTION_PRODUCTION,
        SECTION_REGULATORY_SDP,
        SECTION_HW,
        SECTION_MAC_OVERRIDE,
        SECTION_PHY_SKU,
    ] {
        match read_section(link, section, MAX_SECTION_SIZE).await {
            Ok(data) => sections[section as usize] = data,
            // Absent sections read as errors on some units; parsing
            // decides which ones are mandatory.
            Err(Error::NvmRead) => warn!("could not read NVM section {section}"),
            Err(e) => return Err(e),
        }
    }
    Ok(sections)
}

fn read_u16(section: &[u8], word: usize) -> Option<u16> {
    let off = word * 2;
    Some(u16::from_le_bytes([
        *section.get(off)?,
        *section.get(off + 1)?,
    ]))
}

fn read_u32(section: &[u8], word: usize) -> Option<u32> {
    Some(read_u16(section, word)? as u32 | (read_u16(section, word + 1)? as u32) << 16)
}

fn mac_usable(mac: &[u8; 6]) -> bool {
    mac != &[0u8; 6] && mac != &[0xff; 6] && mac != &RESERVED_MAC && mac[0] & 0x01 == 0
}

/// Derive a MAC address from the two OTP shadow words, which store it in a
/// byte-swapped layout.
pub fn mac_from_otp_words(mac0: u32, mac1: u32) -> [u8; 6] {
    let a = mac0.to_le_bytes();
    let b = mac1.to_le_bytes();
    [a[3], a[2], a[1], a[0], b[1], b[0]]
}

/// Parse the sections read from the device. `otp_mac` is the register
/// fallback used when neither section carries a usable address.
pub fn parse(sections: &[Vec<u8>; NUM_SECTIONS], otp_mac: Option<[u8; 6]>) -> Result<NvmData> {
    let sw = &sections[SECTION_SW as usize];
    let regulatory = &sections[SECTION_REGULATORY as usize];
    if sw.is_empty() {
        return Err(Error::NvmMissingSection(SECTION_SW));
    }
    if regulatory.is_empty() {
        return Err(Error::NvmMissingSection(SECTION_REGULATORY));
    }
    let hw = &sections[SECTION_HW as usize];
    let mac_override = &sections[SECTION_MAC_OVERRIDE as usize];
    if hw.is_empty() && mac_override.is_empty() {
        return Err(Error::NvmMissingSection(SECTION_HW));
    }
    let phy_sku = &sections[SECTION_PHY_SKU as usize];
    if phy_sku.is_empty() {
        return Err(Error::NvmMissingSection(SECTION_PHY_SKU));
    }

    let missing = Error::NvmMissingSection;
    let version = read_u16(sw, SW_VERSION).ok_or(missing(SECTION_SW))?;
    let n_hw_addrs = read_u16(sw, SW_N_HW_ADDRS).ok_or(missing(SECTION_SW))?;
    let radio_cfg = read_u32(phy_sku, PHY_SKU_RADIO_CFG).ok_or(missing(SECTION_PHY_SKU))?;
    let sku = read_u32(phy_sku, PHY_SKU_SKU).ok_or(missing(SECTION_PHY_SKU))?;

    let hw_addr = resolve_mac(hw, mac_override, otp_mac)?;

    let mut channels = Vec::new();
    for (i, &num) in NVM_CHANNELS.iter().enumerate() {
        let Some(flags) = read_u16(regulatory, i) else {
            break;
        };
        let band_2ghz = i < FIRST_5GHZ_CHANNEL;
        if flags & CHANNEL_VALID == 0 {
            continue;
        }
        if !band_2ghz && sku & SKU_CAP_BAND_52GHZ == 0 {
            continue;
        }
        channels.push(Channel {
            num,
            flags,
            band_2ghz,
        });
    }

    Ok(NvmData {
        version,
        n_hw_addrs,
        hw_addr,
        sku_cap_band_24ghz: sku & SKU_CAP_BAND_24GHZ != 0,
        sku_cap_band_52ghz: sku & SKU_CAP_BAND_52GHZ != 0,
        sku_cap_11n_enable: sku & SKU_CAP_11N_ENABLE != 0,
        sku_cap_11ac_enable: sku & SKU_CAP_11AC_ENABLE != 0,
        sku_cap_mimo_disable: sku & SKU_CAP_MIMO_DISABLE != 0,
        radio_cfg_type: (radio_cfg & 0xfff) as u16,
        radio_cfg_step: ((radio_cfg >> 12) & 0xf) as u8,
        radio_cfg_dash: ((radio_cfg >> 16) & 0xf) as u8,
        radio_cfg_pnum: ((radio_cfg >> 20) & 0xf) as u8,
        valid_tx_ant: ((radio_cfg >> 24) & 0xf) as u8,
        valid_rx_ant: ((radio_cfg >> 28) & 0xf) as u8,
        channels,
    })
}

fn resolve_mac(
    hw: &[u8],
    mac_override: &[u8],
    otp_mac: Option<[u8; 6]>,
) -> Result<[u8; 6]> {
    if mac_override.len() >= MAC_OVERRIDE_OFFSET + 6 {
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&mac_override[MAC_OVERRIDE_OFFSET..MAC_OVERRIDE_OFFSET + 6]);
        if mac_usable(&mac) {
            return Ok(mac);
        }
        debug!("ignoring unusable override MAC address");
    }
    if hw.len() >= 6 {
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&hw[..6]);
        if mac_usable(&mac) {
            return Ok(mac);
        }
    }
    if let Some(mac) = otp_mac {
        if mac_usable(&mac) {
            return Ok(mac);
        }
    }
    Err(Error::NvmMissingSection(SECTION_HW))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ScriptedLink;
    use core::cell::Cell;
    use embassy_futures::block_on;
    use zerocopy::IntoBytes;

    fn nvm_resp(req: &[u8], section_data: &[u8]) -> Vec<u8> {
        let req = NvmAccessCmd::ref_from_bytes(req).unwrap();
        let offset = req.offset.get() as usize;
        let want = req.length.get() as usize;
        let mut resp = NvmAccessResp {
            offset: req.offset,
            length: 0.into(),
            section: req.section,
            status: 0.into(),
        };
        let mut out;
        if offset >= section_data.len() {
            resp.status = NVM_READ_NOT_VALID_ADDRESS.into();
            out = resp.as_bytes().to_vec();
        } else {
            let end = (offset + want).min(section_data.len());
            resp.length = ((end - offset) as u16).into();
            out = resp.as_bytes().to_vec();
            out.extend_from_slice(&section_data[offset..end]);
        }
        out
    }

    #[test]
    fn chunked_read_reassembles_section() {
        // 2.5 chunks of patterned data.
        let data: Vec<u8> = (0..5120u32).map(|i| i as u8).collect();
        let section = data.clone();
        let link = ScriptedLink::new(move |_, req| Ok(nvm_resp(req, &section)));
        let out = block_on(read_section(&link, SECTION_SW, MAX_SECTION_SIZE)).unwrap();
        assert_eq!(out, data);
        // Short final chunk means no extra probe read.
        assert_eq!(link.sent.borrow().len(), 3);
    }

    #[test]
    fn chunk_aligned_section_ends_on_invalid_address() {
        let data = vec![0x11u8; 4096];
        let section = data.clone();
        let link = ScriptedLink::new(move |_, req| Ok(nvm_resp(req, &section)));
        let out = block_on(read_section(&link, SECTION_SW, MAX_SECTION_SIZE)).unwrap();
        assert_eq!(out, data);
        // Two full chunks plus the probe that hit the end.
        assert_eq!(link.sent.borrow().len(), 3);
    }

    #[test]
    fn error_status_fails_the_read() {
        let link = ScriptedLink::new(|_, req| {
            let req = NvmAccessCmd::ref_from_bytes(req).unwrap();
            let resp = NvmAccessResp {
                offset: req.offset,
                length: 0.into(),
                section: req.section,
                status: 5.into(),
            };
            Ok(resp.as_bytes().to_vec())
        });
        assert!(matches!(
            block_on(read_section(&link, SECTION_SW, MAX_SECTION_SIZE)),
            Err(Error::NvmRead)
        ));
    }

    #[test]
    fn mismatched_offset_echo_fails_the_read() {
        let calls = Cell::new(0u32);
        let link = ScriptedLink::new(move |_, req| {
            calls.set(calls.get() + 1);
            let req = NvmAccessCmd::ref_from_bytes(req).unwrap();
            let resp = NvmAccessResp {
                offset: (req.offset.get() + 2).into(),
                length: req.length,
                section: req.section,
                status: 0.into(),
            };
            let mut out = resp.as_bytes().to_vec();
            out.extend_from_slice(&vec![0u8; req.length.get() as usize]);
            Ok(out)
        });
        assert!(matches!(
            block_on(read_section(&link, SECTION_SW, MAX_SECTION_SIZE)),
            Err(Error::NvmRead)
        ));
    }

    fn words(w: &[u16]) -> Vec<u8> {
        w.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn test_sections() -> [Vec<u8>; NUM_SECTIONS] {
        let mut sections: [Vec<u8>; NUM_SECTIONS] = Default::default();
        sections[SECTION_SW as usize] = words(&[0x40a, 0, 0, 2]);
        // Channels 1-3 valid, rest invalid, one 5 GHz channel valid.
        let mut reg = vec![CHANNEL_VALID | CHANNEL_ACTIVE; 3];
        reg.resize(FIRST_5GHZ_CHANNEL, 0);
        reg.push(CHANNEL_VALID | CHANNEL_40MHZ);
        sections[SECTION_REGULATORY as usize] = words(&reg);
        sections[SECTION_HW as usize] = vec![0x00, 0x11, 0x22, 0x33, 0x44, 0x55];
        // radio cfg: type 0x105, step 1, dash 2, pnum 3, tx ant 0x3, rx ant 0x3
        let radio_cfg: u32 = 0x105 | 1 << 12 | 2 << 16 | 3 << 20 | 0x3 << 24 | 0x3 << 28;
        let sku: u32 = SKU_CAP_BAND_24GHZ | SKU_CAP_BAND_52GHZ | SKU_CAP_11N_ENABLE;
        sections[SECTION_PHY_SKU as usize] = words(&[
            radio_cfg as u16,
            (radio_cfg >> 16) as u16,
            sku as u16,
            (sku >> 16) as u16,
        ]);
        sections
    }

    #[test]
    fn parse_extracts_sku_radio_and_channels() {
        let nvm = parse(&test_sections(), None).unwrap();
        assert_eq!(nvm.version, 0x40a);
        assert_eq!(nvm.n_hw_addrs, 2);
        assert_eq!(nvm.hw_addr, [0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        assert!(nvm.sku_cap_11n_enable);
        assert!(!nvm.sku_cap_mimo_disable);
        assert_eq!(nvm.radio_cfg_type, 0x105);
        assert_eq!(nvm.radio_cfg_step, 1);
        assert_eq!(nvm.valid_tx_ant, 0x3);
        assert_eq!(nvm.channels.len(), 4);
        assert!(nvm.channels[..3].iter().all(|c| c.band_2ghz));
        assert_eq!(nvm.channels[3].num, NVM_CHANNELS[FIRST_5GHZ_CHANNEL]);
    }

    #[test]
    fn missing_mandatory_section_is_an_error() {
        let mut sections = test_sections();
        sections[SECTION_SW as usize].clear();
        assert!(matches!(
            parse(&sections, None),
            Err(Error::NvmMissingSection(SECTION_SW))
        ));

        let mut sections = test_sections();
        sections[SECTION_PHY_SKU as usize].clear();
        assert!(matches!(
            parse(&sections, None),
            Err(Error::NvmMissingSection(SECTION_PHY_SKU))
        ));
    }

    #[test]
    fn override_mac_wins_and_reserved_is_ignored() {
        let mut sections = test_sections();
        let mut over = vec![0u8; 2];
        over.extend_from_slice(&[0x0a, 0x1b, 0x2c, 0x3d, 0x4e, 0x5f]);
        sections[SECTION_MAC_OVERRIDE as usize] = over;
        let nvm = parse(&sections, None).unwrap();
        assert_eq!(nvm.hw_addr, [0x0a, 0x1b, 0x2c, 0x3d, 0x4e, 0x5f]);

        // The placeholder override falls through to the hardware section.
        let mut sections = test_sections();
        let mut over = vec![0u8; 2];
        over.extend_from_slice(&[0x02, 0xcc, 0xaa, 0xff, 0xee, 0x00]);
        sections[SECTION_MAC_OVERRIDE as usize] = over;
        let nvm = parse(&sections, None).unwrap();
        assert_eq!(nvm.hw_addr, [0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
    }

    #[test]
    fn otp_fallback_is_byte_swapped() {
        let mut sections = test_sections();
        sections[SECTION_HW as usize] = vec![0u8; 6];
        // Keep the mandatory either-or satisfied via a present but
        // unusable override section.
        sections[SECTION_MAC_OVERRIDE as usize] = vec![0u8; 8];
        let otp = mac_from_otp_words(0x0011_2233, 0x0000_4455);
        assert_eq!(otp, [0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        let nvm = parse(&sections, Some(mac_from_otp_words(0x2211_0033, 0x0000_5544))).unwrap();
        assert_eq!(nvm.hw_addr, [0x22, 0x11, 0x00, 0x33, 0x55, 0x44]);
    }

    #[test]
    fn no_usable_mac_anywhere_is_an_error() {
        let mut sections = test_sections();
        sections[SECTION_HW as usize] = vec![0xff; 6];
        assert!(parse(&sections, None).is_err());
    }
}
