//! Host-to-firmware command wire format.
//!
//! Every structure crossing the command ring is little endian and packed by
//! construction (no implicit padding), so the types derive the zerocopy
//! traits and are written into DMA memory byte for byte.
use macro_bits::bit;
use zerocopy::{
    little_endian::{U16, U32},
    FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned,
};

// Legacy group opcodes.
pub const CMD_ALIVE: u8 = 0x01;
pub const CMD_REPLY_ERROR: u8 = 0x02;
pub const CMD_INIT_COMPLETE_NOTIF: u8 = 0x04;
pub const CMD_PHY_CONTEXT: u8 = 0x08;
pub const CMD_ADD_STA: u8 = 0x18;
pub const CMD_REMOVE_STA: u8 = 0x19;
pub const CMD_TX: u8 = 0x1c;
pub const CMD_SCD_QUEUE_CFG: u8 = 0x1d;
pub const CMD_TXPATH_FLUSH: u8 = 0x1e;
pub const CMD_MAC_CONTEXT: u8 = 0x28;
pub const CMD_TIME_EVENT: u8 = 0x29;
pub const CMD_TIME_EVENT_NOTIFICATION: u8 = 0x2a;
pub const CMD_BINDING_CONTEXT: u8 = 0x2b;
pub const CMD_TIME_QUOTA: u8 = 0x2c;
pub const CMD_PHY_CONFIGURATION: u8 = 0x6a;
pub const CMD_POWER_TABLE: u8 = 0x77;
pub const CMD_NVM_ACCESS: u8 = 0x88;
pub const CMD_TX_ANT_CONFIGURATION: u8 = 0x98;
pub const CMD_BT_CONFIG: u8 = 0x9b;
pub const CMD_STATISTICS_NOTIFICATION: u8 = 0x9d;
pub const CMD_MISSED_BEACONS_NOTIFICATION: u8 = 0xa2;
pub const CMD_MAC_PM_POWER_TABLE: u8 = 0xa9;
pub const CMD_MFUART_LOAD_NOTIFICATION: u8 = 0xb1;
pub const CMD_SCAN_ITERATION_COMPLETE: u8 = 0xb5;
pub const CMD_RX_PHY_NOTIFICATION: u8 = 0xc0;
pub const CMD_RX_MPDU: u8 = 0xc1;
pub const CMD_MCC_UPDATE: u8 = 0xc8;
pub const CMD_MCAST_FILTER: u8 = 0xd0;
pub const CMD_SF_CFG: u8 = 0xd1;
pub const CMD_BEACON_FILTERING: u8 = 0xd2;
pub const CMD_LTR_CONFIG: u8 = 0xee;
pub const CMD_SCAN_COMPLETE_UMAC: u8 = 0xf5;
pub const CMD_DEBUG_LOG_MSG: u8 = 0xf7;

// Command groups.
pub const GROUP_LEGACY: u8 = 0x0;
pub const GROUP_LONG: u8 = 0x1;
pub const GROUP_SYSTEM: u8 = 0x2;
pub const GROUP_MAC_CONF: u8 = 0x3;
pub const GROUP_PHY_OPS: u8 = 0x4;
pub const GROUP_DATA_PATH: u8 = 0x5;
pub const GROUP_REGULATORY_AND_NVM: u8 = 0xc;

// Long group.
pub const CMD_SCAN_CFG: u8 = 0xc;
pub const CMD_SCAN_REQ_UMAC: u8 = 0xd;
pub const CMD_SCAN_ABORT_UMAC: u8 = 0xe;

// System group.
pub const CMD_SHARED_MEM_CFG: u8 = 0x00;
pub const CMD_INIT_EXTENDED_CFG: u8 = 0x03;
pub const CMD_FSEQ_VER_MISMATCH_NOTIF: u8 = 0xff;

// Data path group.
pub const CMD_DQA_ENABLE: u8 = 0x00;

// Regulatory/NVM group.
pub const CMD_NVM_ACCESS_COMPLETE: u8 = 0x00;

/// Compose a 16-bit command id from group and opcode. Legacy commands have
/// group zero, so their wide id equals the bare opcode.
pub const fn wide_id(group: u8, opcode: u8) -> u16 {
    ((group as u16) << 8) | opcode as u16
}

pub const fn cmd_group(id: u16) -> u8 {
    (id >> 8) as u8
}

pub const fn cmd_opcode(id: u16) -> u8 {
    id as u8
}

/// Header preceding every command and every received packet payload.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct CmdHeader {
    pub code: u8,
    pub flags: u8,
    pub idx: u8,
    pub qid: u8,
}

/// Extended header used for commands outside the legacy group.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct CmdHeaderWide {
    pub opcode: u8,
    pub group_id: u8,
    pub idx: u8,
    pub qid: u8,
    pub length: U16,
    pub reserved: u8,
    pub version: u8,
}

/// Leading words of every packet in an RX buffer.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct RxPacketHdr {
    pub len_n_flags: U32,
    pub hdr: CmdHeader,
}

/// `len_n_flags` carries the payload length in the low bits.
pub const FRAME_SIZE_MSK: u32 = 0x3fff;
/// Pattern the device writes into exhausted buffer space.
pub const FRAME_INVALID: u32 = 0x5555_0000;
/// Packets within one RX buffer start at multiples of this.
pub const FRAME_ALIGN: usize = 0x40;
/// Set in the response header when the firmware rejected the command.
pub const CMD_FAILED_MSK: u8 = 0x40;
/// Set in the packet qid for firmware-originated notifications.
pub const QID_NOTIFICATION_MSK: u8 = 0x80;

/// One transfer buffer descriptor pointing at host memory.
///
/// The address is stored as raw little-endian bytes to keep the struct free
/// of alignment padding.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct TfhTb {
    pub tb_len: U16,
    addr: [u8; 8],
}

impl TfhTb {
    pub fn new(len: u16, addr: u64) -> Self {
        Self {
            tb_len: U16::new(len),
            addr: addr.to_le_bytes(),
        }
    }
    pub fn addr(&self) -> u64 {
        u64::from_le_bytes(self.addr)
    }
}

/// Maximum scatter entries per frame descriptor.
pub const TFH_NUM_TBS: usize = 25;
/// Bytes of the command covered by the mandatory first transfer buffer.
pub const FIRST_TB_SIZE: usize = 20;

/// Transmit frame descriptor, one ring slot.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct TfhTfd {
    pub num_tbs: U16,
    pub tbs: [TfhTb; TFH_NUM_TBS],
}

impl TfhTfd {
    /// An empty descriptor; all-zero is valid on the wire.
    pub fn zeroed() -> Self {
        Self::new_zeroed()
    }
}

// Context action values shared by PHY/MAC/binding commands.
pub const FW_CTXT_ACTION_ADD: u32 = 1;
pub const FW_CTXT_ACTION_MODIFY: u32 = 2;
pub const FW_CTXT_ACTION_REMOVE: u32 = 3;

pub const fn fw_ctxt_id_and_color(id: u32, color: u32) -> u32 {
    (id & 0xff) | (color << 8)
}

/// NVM access request, read direction only.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct NvmAccessCmd {
    pub offset: U16,
    pub length: U16,
    pub section: U16,
    pub op_code: u8,
    pub reserved: u8,
}

pub const NVM_READ_OPCODE: u8 = 0;
/// Status for a read past the end of a section.
pub const NVM_READ_NOT_VALID_ADDRESS: u16 = 1;

/// NVM access response, followed by `length` data bytes.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct NvmAccessResp {
    pub offset: U16,
    pub length: U16,
    pub section: U16,
    pub status: U16,
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct FwChannelInfo {
    pub band: u8,
    pub channel: u8,
    pub width: u8,
    pub ctrl_pos: u8,
}

pub const PHY_BAND_5: u8 = 0;
pub const PHY_BAND_24: u8 = 1;
pub const PHY_VHT_CHANNEL_MODE20: u8 = 0;

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct PhyContextCmd {
    pub id_and_color: U32,
    pub action: U32,
    pub apply_time: U32,
    pub tx_param_color: U32,
    pub ci: FwChannelInfo,
    pub txchain_info: U32,
    pub rxchain_info: U32,
    pub acquisition_data: U32,
    pub dsp_cfg_flags: U32,
}

pub const MAX_MACS_IN_BINDING: usize = 3;

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct BindingCmd {
    pub id_and_color: U32,
    pub action: U32,
    pub macs: [U32; MAX_MACS_IN_BINDING],
    pub phy: U32,
}

/// Unused entries in a binding's MAC list.
pub const FW_CTXT_INVALID: u32 = 0xffff_ffff;

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct MacQosParam {
    pub cw_min: U16,
    pub cw_max: U16,
    pub aifsn: u8,
    pub fifos_mask: u8,
    pub edca_txop: U16,
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct MacDataSta {
    pub is_assoc: U32,
    pub dtim_time: U32,
    pub dtim_tsf: [u8; 8],
    pub bi: U32,
    pub bi_reciprocal: U32,
    pub dtim_interval: U32,
    pub dtim_reciprocal: U32,
    pub mcast_qid: U32,
    pub beacon_template: U32,
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct MacContextCmd {
    pub id_and_color: U32,
    pub action: U32,
    pub mac_type: U32,
    pub tsf_id: U32,
    pub node_addr: [u8; 6],
    pub reserved1: [u8; 2],
    pub bssid_addr: [u8; 6],
    pub reserved2: [u8; 2],
    pub cck_rates: U32,
    pub ofdm_rates: U32,
    pub protection_flags: U32,
    pub cck_short_preamble: U32,
    pub short_slot: U32,
    pub filter_flags: U32,
    pub qos_flags: U32,
    pub ac: [MacQosParam; 4],
    pub sta: MacDataSta,
}

pub const MAC_TYPE_BSS_STA: u32 = 5;
pub const MAC_FILTER_IN_BEACON: u32 = bit!(6);
pub const MAC_FILTER_ACCEPT_GRP: u32 = bit!(2);
pub const MAC_PROT_FLG_TGG_PROTECT: u32 = bit!(3);
pub const MAC_QOS_FLG_UPDATE_EDCA: u32 = bit!(0);

pub const ADD_STA_MODE_ADD: u8 = 0;
pub const ADD_STA_MODE_MODIFY: u8 = 1;
pub const ADD_STA_SUCCESS: u32 = 0;
pub const ADD_STA_STATUS_MASK: u32 = 0xff;
pub const STATION_ID: u8 = 0;
/// Internal station the scanner transmits probe requests from.
pub const AUX_STATION_ID: u8 = 1;
/// Firmware MAC index the auxiliary station binds to.
pub const MAC_INDEX_AUX: u32 = 4;

// Channel-width and MIMO fields in `station_flags`; the 20 MHz and SISO
// settings are the zero encoding within their mask.
pub const STA_FLG_FAT_EN_20MHZ: u32 = 0;
pub const STA_FLG_FAT_EN_MSK: u32 = 3 << 26;
pub const STA_FLG_MIMO_EN_SISO: u32 = 0;
pub const STA_FLG_MIMO_EN_MSK: u32 = 3 << 28;
pub const STA_MODIFY_ADD_BA_TID: u8 = bit!(3);
pub const STA_MODIFY_REMOVE_BA_TID: u8 = bit!(4);
pub const STA_MODIFY_QUEUES: u8 = bit!(7);

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct AddStaCmd {
    pub add_modify: u8,
    pub awake_acs: u8,
    pub tid_disable_tx: U16,
    pub mac_id_n_color: U32,
    pub addr: [u8; 6],
    pub reserved1: U16,
    pub sta_id: u8,
    pub modify_mask: u8,
    pub reserved2: U16,
    pub station_flags: U32,
    pub station_flags_msk: U32,
    pub add_immediate_ba_tid: u8,
    pub remove_immediate_ba_tid: u8,
    pub add_immediate_ba_ssn: U16,
    pub sleep_tx_count: U16,
    pub sleep_state_flags: U16,
    pub assoc_id: U16,
    pub beamform_flags: U16,
    pub tfd_queue_msk: U32,
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct RemoveStaCmd {
    pub sta_id: u8,
    pub reserved: [u8; 3],
}

// Session protection time events.
pub const TE_BSS_STA_AGGRESSIVE_ASSOC: u32 = 9;
pub const TE_V2_FRAG_NONE: u8 = 0;
pub const TE_V2_NOTIF_HOST_EVENT_START: u16 = bit!(0);
pub const TE_V2_NOTIF_HOST_EVENT_END: u16 = bit!(1);
pub const TE_V2_START_IMMEDIATELY: u16 = bit!(11);

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct TimeEventCmd {
    pub id_and_color: U32,
    pub action: U32,
    pub id: U32,
    pub apply_time: U32,
    pub max_delay: U32,
    pub depends_on: U32,
    pub interval: U32,
    pub duration: U32,
    pub repeat: u8,
    pub max_frags: u8,
    pub policy: U16,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct TimeEventResp {
    pub status: U32,
    pub id: U32,
    pub unique_id: U32,
    pub id_and_color: U32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct TimeEventNotif {
    pub timestamp: U32,
    pub session_id: U32,
    pub unique_id: U32,
    pub id_and_color: U32,
    pub action: U32,
    pub status: U32,
}

pub const TE_V2_NOTIF_ACTION_END: u32 = 2;

pub const MAX_BINDINGS: usize = 4;

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct TimeQuotaData {
    pub id_and_color: U32,
    pub quota: U32,
    pub max_duration: U32,
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct TimeQuotaCmd {
    pub quotas: [TimeQuotaData; MAX_BINDINGS],
}

// Transmit command, second-generation layout.
pub const TX_FLAGS_CMD_RATE: u32 = bit!(0);
pub const TX_FLAGS_ENCRYPT_DIS: u32 = bit!(1);
/// `offload_assist` bit requesting header padding to a dword boundary.
pub const TX_CMD_OFFLD_PAD: u16 = bit!(13);

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct TxCmdGen2 {
    pub len: U16,
    pub offload_assist: U16,
    pub flags: U32,
    pub dram_info: [u8; 16],
    pub rate_n_flags: U32,
    // The 802.11 header follows inline.
}

pub const RATE_MCS_HT_MSK: u32 = bit!(8);
pub const RATE_MCS_CCK_MSK: u32 = bit!(9);
pub const RATE_MCS_SGI_MSK: u32 = bit!(13);
pub const RATE_MCS_ANT_A_MSK: u32 = bit!(14);
pub const RATE_MCS_ANT_B_MSK: u32 = bit!(15);
pub const RATE_MCS_ANT_AB_MSK: u32 = RATE_MCS_ANT_A_MSK | RATE_MCS_ANT_B_MSK;

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct TxResp {
    pub frame_count: u8,
    pub bt_kill_count: u8,
    pub failure_rts: U16,
    pub failure_frame: U16,
    pub initial_rate: U32,
    pub wireless_media_time: U16,
    pub reserved1: [u8; 2],
    pub status: U16,
    pub reserved2: [u8; 2],
}

pub const TX_STATUS_MSK: u16 = 0xff;
pub const TX_STATUS_SUCCESS: u16 = 0x01;
pub const TX_STATUS_DIRECT_DONE: u16 = 0x02;

/// `mac_flags2` bit: the device inserted 2 bytes between the 802.11
/// header and the body to dword-align the payload.
pub const RX_MPDU_MFLG2_PAD: u8 = bit!(5);

/// Per-MPDU metadata preceding a received frame.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct RxMpduDesc {
    pub mpdu_len: U16,
    pub mac_flags1: u8,
    pub mac_flags2: u8,
    pub amsdu_info: u8,
    pub phy_info: u8,
    pub mac_phy_idx: u8,
    pub toggle: u8,
    pub status: U16,
    pub hash_filter: U16,
    pub sta_id_flags: U32,
    pub reorder_data: U32,
    pub rss_hash: U32,
    pub filter_match: U32,
    pub phy_data: [u8; 8],
    /// Raw energy measurements per antenna, negated dBm, zero if unused.
    pub energy_a: u8,
    pub energy_b: u8,
    pub channel: u8,
    pub mac_context: u8,
    pub gp2_on_air_rise: U32,
    pub reserved: [u8; 4],
}

pub const RX_MPDU_STATUS_CRC_OK: u16 = bit!(0);
pub const RX_MPDU_STATUS_OVERRUN_OK: u16 = bit!(1);

/// Queue allocation command, second-generation layout.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct TxQueueCfgCmd {
    pub flags: U32,
    pub sta_id: u8,
    pub tid: u8,
    pub reserved: [u8; 2],
    pub cb_size: U32,
    pub byte_cnt_addr: [u8; 8],
    pub tfdq_addr: [u8; 8],
}

pub const TX_QUEUE_CFG_ENABLE_QUEUE: u32 = bit!(0);

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct TxQueueCfgResp {
    pub queue_number: U16,
    pub flags: U16,
    pub write_pointer: U16,
    pub reserved: U16,
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct TxPathFlushCmd {
    pub sta_id: U32,
    pub tid_mask: U16,
    pub reserved: [u8; 2],
}

// Scan, UMAC flavor, reduced to the fields a connect scan needs.
pub const SCAN_GENERAL_FLAGS_PASS_ALL: u32 = bit!(0);
pub const SCAN_GENERAL_FLAGS_ITER_COMPLETE: u32 = bit!(5);
pub const SCAN_CHANNEL_FLAG_EBS: u32 = bit!(0);
pub const SCAN_CHANNEL_FLAG_EBS_ACCURATE: u32 = bit!(1);

pub const SCAN_CONFIG_FLAG_ACTIVATE: u32 = bit!(2);
pub const SCAN_CONFIG_FLAG_SET_TX_CHAINS: u32 = bit!(8);
pub const SCAN_CONFIG_FLAG_SET_RX_CHAINS: u32 = bit!(9);
pub const SCAN_CONFIG_FLAG_SET_AUX_STA_ID: u32 = bit!(10);
pub const SCAN_CONFIG_FLAG_SET_ALL_TIMES: u32 = bit!(11);
pub const SCAN_CONFIG_FLAG_SET_CHANNEL_FLAGS: u32 = bit!(13);
pub const SCAN_CONFIG_FLAG_SET_LEGACY_RATES: u32 = bit!(14);
pub const SCAN_CONFIG_FLAG_SET_MAC_ADDR: u32 = bit!(15);

/// One-time scan engine configuration. One channel number per supported
/// channel follows on the wire.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct ScanConfigCmd {
    pub flags: U32,
    pub tx_chains: U32,
    pub rx_chains: U32,
    pub legacy_rates: U32,
    pub out_of_channel_time: [U32; 2],
    pub suspend_time: [U32; 2],
    pub mac_addr: [u8; 6],
    pub bcast_sta_id: u8,
    pub channel_flags: u8,
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct ScanReqUmac {
    pub uid: U32,
    pub ooc_priority: U32,
    pub general_flags: U32,
    pub extended_dwell: u8,
    pub active_dwell: u8,
    pub passive_dwell: u8,
    pub fragmented_dwell: u8,
    pub max_out_time: U32,
    pub suspend_time: U32,
    pub scan_priority: U32,
    pub channel_flags: u8,
    pub n_channels: u8,
    pub reserved: U16,
    // Per-channel configs and the probe template follow.
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct ScanChannelCfgUmac {
    pub flags: U32,
    pub channel_num: u8,
    pub iter_count: u8,
    pub iter_interval: U16,
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct ScanAbortUmac {
    pub uid: U32,
    pub flags: U32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct ScanCompleteUmac {
    pub uid: U32,
    pub last_schedule: u8,
    pub last_iter: u8,
    pub status: u8,
    pub ebs_status: u8,
    pub time_from_last_iter: U32,
    pub reserved: U32,
}

pub const SCAN_OFFLOAD_COMPLETED: u8 = 1;
pub const SCAN_OFFLOAD_ABORTED: u8 = 2;

/// Boot handshake, reduced to the fields the driver records.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct AliveResp {
    pub status: U16,
    pub flags: U16,
    pub lmac_error_event_table: [U32; 2],
    pub log_event_table: U32,
    pub umac_error_event_table: U32,
    pub scd_base_ptr: U32,
}

pub const ALIVE_STATUS_OK: u16 = 0xcafe;

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct ErrorResp {
    pub error_type: U32,
    pub cmd_id: u8,
    pub reserved1: u8,
    pub bad_cmd_seq_num: U16,
    pub error_service: U32,
    pub timestamp: [u8; 8],
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct MissedBeaconsNotif {
    pub mac_id: U32,
    pub consec_missed_beacons_since_last_rx: U32,
    pub consec_missed_beacons: U32,
    pub num_expected_beacons: U32,
    pub num_recvd_beacons: U32,
}

/// The slice of the statistics notification used for noise tracking.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct StatisticsNotif {
    pub flag: U32,
    pub beacon_silence_rssi: [U32; 3],
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct CalibCtrl {
    pub flow_trigger: U32,
    pub event_trigger: U32,
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct PhyCfgCmd {
    pub phy_cfg: U32,
    pub calib_control: CalibCtrl,
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct TxAntCfgCmd {
    pub valid: U32,
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct DqaEnableCmd {
    pub cmd_queue: U32,
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct McastFilterCmd {
    pub filter_own: u8,
    pub port_id: u8,
    pub count: u8,
    pub pass_all: u8,
    pub bssid: [u8; 6],
    pub reserved: [u8; 2],
}

/// All-zero disables beacon filtering entirely; the host wants to see
/// every beacon itself.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct BeaconFilterCmd {
    pub bf_enable_beacon_filter: U32,
    pub bf_debug_flag: U32,
    pub bf_escape_timer: U32,
    pub ba_escape_timer: U32,
    pub ba_enable_beacon_abort: U32,
}

/// Coexistence arbitration fully in favor of Wi-Fi.
pub const BT_COEX_WIFI: u32 = 3;

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct BtCoexCmd {
    pub mode: U32,
    pub enabled_modules: U32,
}

/// The world regulatory domain, used until a real country code is known.
pub const MCC_WORLD: u16 = u16::from_be_bytes(*b"ZZ");

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct MccUpdateCmd {
    pub mcc: U16,
    pub source_id: u8,
    pub reserved: u8,
    pub key: U32,
    pub reserved2: [U32; 5],
}

pub const SF_FULL_ON: u32 = 1;

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct SfCfgCmd {
    pub state: U32,
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct MacPowerCmd {
    pub id_and_color: U32,
    pub flags: U16,
    pub keep_alive_seconds: U16,
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct DevicePowerCmd {
    pub flags: U16,
    pub reserved: U16,
}

pub const LTR_CFG_FLAG_FEATURE_ENABLE: u32 = bit!(0);

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct LtrConfigCmd {
    pub flags: U32,
    pub static_long: U32,
    pub static_short: U32,
}

#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct InitExtendedCfgCmd {
    pub init_flags: U32,
}

pub const INIT_NVM: u32 = bit!(1);
