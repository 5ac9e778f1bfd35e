//! Firmware image parsing.
//!
//! Firmware ships as a magic-tagged header followed by a stream of TLV
//! records. Records the driver does not know are skipped; records it does
//! know are validated strictly and a single malformed one rejects the whole
//! image. Section payloads stay in the image buffer, the parser only
//! records where they live.
use alloc::{format, string::String, vec::Vec};

use log::{debug, warn};
use zerocopy::{
    little_endian::U32, FromBytes, Immutable, KnownLayout, Unaligned,
};

use crate::{Error, Result};

/// Value of the `magic` header field ("IWL\n").
pub const UCODE_TLV_MAGIC: u32 = 0x0a4c_5749;

/// TLV record types the parser understands.
mod tlv {
    pub const PROBE_MAX_LEN: u32 = 6;
    pub const PAN: u32 = 7;
    pub const FLAGS: u32 = 18;
    pub const SEC_RT: u32 = 19;
    pub const SEC_INIT: u32 = 20;
    pub const SEC_WOWLAN: u32 = 21;
    pub const DEF_CALIB: u32 = 22;
    pub const PHY_SKU: u32 = 23;
    pub const NUM_OF_CPU: u32 = 27;
    pub const CSCHEME: u32 = 28;
    pub const API_CHANGES_SET: u32 = 29;
    pub const ENABLED_CAPABILITIES: u32 = 30;
    pub const N_SCAN_CHANNELS: u32 = 31;
    pub const PAGING: u32 = 32;
    pub const SEC_RT_USNIFFER: u32 = 34;
    pub const FW_VERSION: u32 = 36;
    pub const FW_DBG_DEST: u32 = 38;
    pub const FW_DBG_CONF: u32 = 39;
    pub const UMAC_DEBUG_ADDRS: u32 = 54;
    pub const LMAC_DEBUG_ADDRS: u32 = 55;
    pub const CMD_VERSIONS: u32 = 48;
}

/// Capability flag carried by both the PAN record and bit 0 of FLAGS.
pub const UCODE_TLV_FLAGS_PAN: u32 = 1 << 0;

/// 32-bit words in the API change bitset.
pub const API_WORDS: usize = 4;
/// 32-bit words in the enabled-capabilities bitset.
pub const CAPA_WORDS: usize = 4;

pub const DEFAULT_SCAN_CHANNELS: u32 = 40;
const MAX_SCAN_CHANNELS: u32 = 52;
const SCAN_OFFLOAD_PROBE_REQ_SIZE: u32 = 512;
const MAX_FW_SECTIONS: usize = 16;
const MAX_CMD_VERSIONS: usize = 64;
const MAX_FW_DBG_CONF: u32 = 32;
/// Debug addresses carry cache-control bits the host must strip.
const FW_ADDR_CACHE_CONTROL: u32 = 0xc000_0000;

#[derive(FromBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
struct UcodeHeader {
    zero: U32,
    magic: U32,
    ver: U32,
    build: U32,
    build_tag: U32,
}

#[derive(FromBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
struct TlvRecordHdr {
    tlv_type: U32,
    length: U32,
}

#[derive(FromBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
struct TlvCalibData {
    ucode_type: U32,
    flow_trigger: U32,
    event_trigger: U32,
}

#[derive(FromBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
struct TlvBitsetEntry {
    index: U32,
    flags: U32,
}

/// A firmware build flavor the image may carry sections for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UcodeType {
    Regular = 0,
    Init = 1,
    Wowlan = 2,
    RegularUsniffer = 3,
}

pub const UCODE_TYPE_COUNT: usize = 4;

/// One loadable firmware section. The data lives in the parsed image.
#[derive(Debug, Clone, Copy)]
pub struct FwSection {
    /// Device address the section is loaded to.
    pub dev_addr: u32,
    offset: usize,
    pub len: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CalibDefaults {
    pub flow_trigger: u32,
    pub event_trigger: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct FwCmdVersion {
    pub cmd: u8,
    pub group: u8,
    pub cmd_ver: u8,
    pub notif_ver: u8,
}

/// A parsed firmware image.
pub struct FwImage {
    raw: Vec<u8>,
    pub fw_version: String,
    pub capa_flags: u32,
    pub api_flags: [u32; API_WORDS],
    pub enabled_capa: [u32; CAPA_WORDS],
    pub phy_config: u32,
    pub num_of_cpus: u32,
    pub default_calib: [CalibDefaults; UCODE_TYPE_COUNT],
    pub n_scan_channels: u32,
    pub max_probe_len: u32,
    pub cmd_versions: Vec<FwCmdVersion>,
    pub sections: [Vec<FwSection>; UCODE_TYPE_COUNT],
    pub umac_error_event_table: Option<u32>,
    pub lmac_error_event_table: Option<u32>,
    pub paging_enabled: bool,
    pub dbg_dest_present: bool,
    pub dbg_conf_count: u32,
}

impl FwImage {
    /// Whether an API change bit is advertised.
    pub fn has_api(&self, api: u32) -> bool {
        let (word, bit) = (api as usize / 32, api % 32);
        word < API_WORDS && self.api_flags[word] & (1 << bit) != 0
    }

    /// Whether a capability bit is advertised.
    pub fn has_capa(&self, capa: u32) -> bool {
        let (word, bit) = (capa as usize / 32, capa % 32);
        word < CAPA_WORDS && self.enabled_capa[word] & (1 << bit) != 0
    }

    /// Borrow a section's payload.
    pub fn section_data(&self, section: &FwSection) -> &[u8] {
        &self.raw[section.offset..section.offset + section.len]
    }

    /// Give the raw file back, for re-parsing after a device recovery.
    pub fn into_raw(self) -> Vec<u8> {
        self.raw
    }

    /// Parse a raw firmware file.
    pub fn parse(raw: Vec<u8>) -> Result<Self> {
        let (header, mut rest_len) = {
            let (header, rest) =
                UcodeHeader::ref_from_prefix(&raw).map_err(|_| Error::FirmwareTooShort)?;
            if header.zero.get() != 0 || header.magic.get() != UCODE_TLV_MAGIC {
                return Err(Error::FirmwareFormat(0));
            }
            let ver = header.ver.get();
            debug!(
                "firmware image {}.{}.{} build {}",
                (ver & 0xff00_0000) >> 24,
                (ver & 0x00ff_0000) >> 16,
                (ver & 0x0000_ff00) >> 8,
                header.build.get()
            );
            (core::mem::size_of::<UcodeHeader>(), rest.len())
        };
        let mut image = Self {
            raw,
            fw_version: String::new(),
            capa_flags: 0,
            api_flags: [0; API_WORDS],
            enabled_capa: [0; CAPA_WORDS],
            phy_config: 0,
            num_of_cpus: 1,
            default_calib: [CalibDefaults::default(); UCODE_TYPE_COUNT],
            n_scan_channels: DEFAULT_SCAN_CHANNELS,
            max_probe_len: 0,
            cmd_versions: Vec::new(),
            sections: [Vec::new(), Vec::new(), Vec::new(), Vec::new()],
            umac_error_event_table: None,
            lmac_error_event_table: None,
            paging_enabled: false,
            dbg_dest_present: false,
            dbg_conf_count: 0,
        };
        let mut offset = header;
        while rest_len >= core::mem::size_of::<TlvRecordHdr>() {
            let (tlv_type, tlv_len) = {
                let hdr = TlvRecordHdr::ref_from_bytes(
                    &image.raw[offset..offset + core::mem::size_of::<TlvRecordHdr>()],
                )
                .map_err(|_| Error::FirmwareTooShort)?;
                (hdr.tlv_type.get(), hdr.length.get() as usize)
            };
            offset += core::mem::size_of::<TlvRecordHdr>();
            rest_len -= core::mem::size_of::<TlvRecordHdr>();
            if tlv_len > rest_len {
                return Err(Error::FirmwareTooShort);
            }
            image.parse_record(tlv_type, offset, tlv_len)?;
            // Records are padded to 32-bit boundaries.
            let advance = (tlv_len + 3) & !3;
            let advance = advance.min(rest_len);
            offset += advance;
            rest_len -= advance;
        }
        if rest_len != 0 {
            return Err(Error::FirmwareTooShort);
        }
        Ok(image)
    }

    fn parse_record(&mut self, tlv_type: u32, offset: usize, len: usize) -> Result<()> {
        let malformed = || Error::FirmwareFormat(tlv_type);
        let data = &self.raw[offset..offset + len];
        match tlv_type {
            tlv::PROBE_MAX_LEN => {
                let max = le32(data).ok_or_else(malformed)?;
                if max > SCAN_OFFLOAD_PROBE_REQ_SIZE {
                    return Err(malformed());
                }
                self.max_probe_len = max;
            }
            tlv::PAN => {
                if len != 0 {
                    return Err(malformed());
                }
                self.capa_flags |= UCODE_TLV_FLAGS_PAN;
            }
            tlv::FLAGS => {
                // A FLAGS record replaces the capability flags wholesale,
                // including a PAN bit set by an earlier PAN record.
                self.capa_flags = le32(data).ok_or_else(malformed)?;
            }
            tlv::SEC_RT => self.store_section(tlv_type, UcodeType::Regular, offset, len)?,
            tlv::SEC_INIT => self.store_section(tlv_type, UcodeType::Init, offset, len)?,
            tlv::SEC_WOWLAN => self.store_section(tlv_type, UcodeType::Wowlan, offset, len)?,
            tlv::SEC_RT_USNIFFER => {
                self.store_section(tlv_type, UcodeType::RegularUsniffer, offset, len)?
            }
            tlv::DEF_CALIB => {
                let calib = TlvCalibData::ref_from_bytes(data).map_err(|_| malformed())?;
                let ucode_type = calib.ucode_type.get() as usize;
                if ucode_type >= UCODE_TYPE_COUNT {
                    return Err(malformed());
                }
                self.default_calib[ucode_type] = CalibDefaults {
                    flow_trigger: calib.flow_trigger.get(),
                    event_trigger: calib.event_trigger.get(),
                };
            }
            tlv::PHY_SKU => {
                self.phy_config = le32(data).ok_or_else(malformed)?;
            }
            tlv::NUM_OF_CPU => {
                let num = le32(data).ok_or_else(malformed)?;
                if !(1..=2).contains(&num) {
                    return Err(malformed());
                }
                self.num_of_cpus = num;
            }
            tlv::CSCHEME => {
                // Cipher schemes are not offloaded; the record is only
                // sanity checked.
                if len < 4 || len > 0x400 {
                    return Err(malformed());
                }
            }
            tlv::API_CHANGES_SET => {
                let entry = TlvBitsetEntry::ref_from_bytes(data).map_err(|_| malformed())?;
                let idx = entry.index.get() as usize;
                if idx >= API_WORDS {
                    return Err(malformed());
                }
                self.api_flags[idx] |= entry.flags.get();
            }
            tlv::ENABLED_CAPABILITIES => {
                let entry = TlvBitsetEntry::ref_from_bytes(data).map_err(|_| malformed())?;
                let idx = entry.index.get() as usize;
                if idx >= CAPA_WORDS {
                    return Err(malformed());
                }
                self.enabled_capa[idx] |= entry.flags.get();
            }
            tlv::N_SCAN_CHANNELS => {
                let n = le32(data).ok_or_else(malformed)?;
                if n == 0 || n > MAX_SCAN_CHANNELS {
                    return Err(malformed());
                }
                self.n_scan_channels = n;
            }
            tlv::PAGING => {
                if len != 4 {
                    return Err(malformed());
                }
                self.paging_enabled = true;
            }
            tlv::FW_VERSION => {
                if len != 12 {
                    return Err(malformed());
                }
                let major = le32(&data[0..]).ok_or_else(malformed)?;
                let minor = le32(&data[4..]).ok_or_else(malformed)?;
                let patch = le32(&data[8..]).ok_or_else(malformed)?;
                self.fw_version = format!("{major}.{minor}.{patch}");
            }
            tlv::FW_DBG_DEST => {
                if data.first() != Some(&0) {
                    return Err(malformed());
                }
                // Only the first destination record counts.
                if !self.dbg_dest_present {
                    self.dbg_dest_present = true;
                }
            }
            tlv::FW_DBG_CONF => {
                if !self.dbg_dest_present {
                    return Err(malformed());
                }
                let conf_id = *data.first().ok_or_else(malformed)? as u32;
                if conf_id >= MAX_FW_DBG_CONF {
                    return Err(malformed());
                }
                self.dbg_conf_count += 1;
            }
            tlv::UMAC_DEBUG_ADDRS => {
                let addr = le32(data).ok_or_else(malformed)?;
                self.umac_error_event_table = Some(addr & !FW_ADDR_CACHE_CONTROL);
            }
            tlv::LMAC_DEBUG_ADDRS => {
                let addr = le32(data).ok_or_else(malformed)?;
                self.lmac_error_event_table = Some(addr & !FW_ADDR_CACHE_CONTROL);
            }
            tlv::CMD_VERSIONS => {
                if !self.cmd_versions.is_empty() {
                    return Err(malformed());
                }
                // Trailing partial entries are dropped, not rejected.
                let n = len / 4;
                if n > MAX_CMD_VERSIONS {
                    return Err(malformed());
                }
                for entry in data.chunks_exact(4).take(n) {
                    self.cmd_versions.push(FwCmdVersion {
                        cmd: entry[0],
                        group: entry[1],
                        cmd_ver: entry[2],
                        notif_ver: entry[3],
                    });
                }
            }
            _ => {
                warn!("skipping unknown firmware record type {tlv_type} ({len} bytes)");
            }
        }
        Ok(())
    }

    fn store_section(
        &mut self,
        tlv_type: u32,
        ucode_type: UcodeType,
        offset: usize,
        len: usize,
    ) -> Result<()> {
        let malformed = || Error::FirmwareFormat(tlv_type);
        // The payload starts with the 32-bit device load address.
        if len < 4 {
            return Err(malformed());
        }
        let sections = &mut self.sections[ucode_type as usize];
        if sections.len() >= MAX_FW_SECTIONS {
            return Err(malformed());
        }
        let dev_addr = le32(&self.raw[offset..]).ok_or_else(malformed)?;
        sections.push(FwSection {
            dev_addr,
            offset: offset + 4,
            len: len - 4,
        });
        Ok(())
    }
}

fn le32(data: &[u8]) -> Option<u32> {
    Some(u32::from_le_bytes(data.get(..4)?.try_into().ok()?))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use alloc::vec;

    pub fn header() -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&UCODE_TLV_MAGIC.to_le_bytes());
        out.extend_from_slice(&0x2e01_0000u32.to_le_bytes());
        out.extend_from_slice(&7u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out
    }

    pub fn record(tlv_type: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&tlv_type.to_le_bytes());
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(payload);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out
    }

    pub fn section_payload(dev_addr: u32, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&dev_addr.to_le_bytes());
        out.extend_from_slice(data);
        out
    }

    #[test]
    fn minimal_image_yields_one_section() {
        let mut raw = header();
        raw.extend(record(
            tlv::SEC_RT,
            &section_payload(0x0040_0000, &[0xab; 16]),
        ));
        let image = FwImage::parse(raw).unwrap();
        assert_eq!(image.sections[UcodeType::Regular as usize].len(), 1);
        let section = image.sections[UcodeType::Regular as usize][0];
        assert_eq!(section.dev_addr, 0x0040_0000);
        assert_eq!(section.len, 16);
        assert_eq!(image.section_data(&section), &[0xab; 16]);
        assert!(image.sections[UcodeType::Init as usize].is_empty());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut raw = header();
        raw[4] = 0;
        assert!(matches!(
            FwImage::parse(raw),
            Err(Error::FirmwareFormat(0))
        ));
    }

    #[test]
    fn truncated_record_is_rejected() {
        let mut raw = header();
        raw.extend(record(tlv::PHY_SKU, &10u32.to_le_bytes()));
        // Claim more payload than the file holds.
        raw.truncate(raw.len() - 2);
        assert!(matches!(
            FwImage::parse(raw),
            Err(Error::FirmwareTooShort)
        ));
    }

    #[test]
    fn unknown_records_are_skipped() {
        let mut raw = header();
        raw.extend(record(0xbeef, &[1, 2, 3, 4, 5]));
        raw.extend(record(tlv::PHY_SKU, &0x00c1_0044u32.to_le_bytes()));
        let image = FwImage::parse(raw).unwrap();
        assert_eq!(image.phy_config, 0x00c1_0044);
    }

    #[test]
    fn flags_record_overrides_pan() {
        let mut raw = header();
        raw.extend(record(tlv::PAN, &[]));
        raw.extend(record(tlv::FLAGS, &0x30u32.to_le_bytes()));
        let image = FwImage::parse(raw).unwrap();
        assert_eq!(image.capa_flags, 0x30);

        // Reverse order keeps both contributions.
        let mut raw = header();
        raw.extend(record(tlv::FLAGS, &0x30u32.to_le_bytes()));
        raw.extend(record(tlv::PAN, &[]));
        let image = FwImage::parse(raw).unwrap();
        assert_eq!(image.capa_flags, 0x30 | UCODE_TLV_FLAGS_PAN);
    }

    #[test]
    fn bitsets_accumulate_and_range_check() {
        let mut raw = header();
        let mut entry = Vec::new();
        entry.extend_from_slice(&1u32.to_le_bytes());
        entry.extend_from_slice(&0x0000_0005u32.to_le_bytes());
        raw.extend(record(tlv::API_CHANGES_SET, &entry));
        let mut entry2 = Vec::new();
        entry2.extend_from_slice(&1u32.to_le_bytes());
        entry2.extend_from_slice(&0x0000_0008u32.to_le_bytes());
        raw.extend(record(tlv::API_CHANGES_SET, &entry2));
        let image = FwImage::parse(raw).unwrap();
        assert_eq!(image.api_flags[1], 0xd);
        assert!(image.has_api(32));
        assert!(!image.has_api(33));

        let mut raw = header();
        let mut entry = Vec::new();
        entry.extend_from_slice(&(CAPA_WORDS as u32).to_le_bytes());
        entry.extend_from_slice(&1u32.to_le_bytes());
        raw.extend(record(tlv::ENABLED_CAPABILITIES, &entry));
        assert!(FwImage::parse(raw).is_err());
    }

    #[test]
    fn second_cmd_versions_record_is_rejected() {
        let mut raw = header();
        raw.extend(record(tlv::CMD_VERSIONS, &[0x18, 0, 1, 1]));
        raw.extend(record(tlv::CMD_VERSIONS, &[0x1c, 0, 1, 1]));
        assert!(matches!(
            FwImage::parse(raw),
            Err(Error::FirmwareFormat(t)) if t == tlv::CMD_VERSIONS
        ));
    }

    #[test]
    fn scan_channel_count_is_range_checked() {
        let mut raw = header();
        raw.extend(record(tlv::N_SCAN_CHANNELS, &100u32.to_le_bytes()));
        assert!(FwImage::parse(raw).is_err());

        let mut raw = header();
        raw.extend(record(tlv::N_SCAN_CHANNELS, &44u32.to_le_bytes()));
        assert_eq!(FwImage::parse(raw).unwrap().n_scan_channels, 44);
    }

    #[test]
    fn dbg_conf_requires_dest() {
        let mut raw = header();
        raw.extend(record(tlv::FW_DBG_CONF, &[0, 0, 0, 0]));
        assert!(FwImage::parse(raw).is_err());
    }

    #[test]
    fn version_record_formats() {
        let mut raw = header();
        let mut ver = Vec::new();
        ver.extend_from_slice(&46u32.to_le_bytes());
        ver.extend_from_slice(&3u32.to_le_bytes());
        ver.extend_from_slice(&102u32.to_le_bytes());
        raw.extend(record(tlv::FW_VERSION, &ver));
        assert_eq!(FwImage::parse(raw).unwrap().fw_version, "46.3.102");
    }
}
