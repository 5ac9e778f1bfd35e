//! Link state machine.
//!
//! Connecting to a network is a ladder of firmware contexts: PHY context,
//! MAC context, binding, station, session protection. The machine walks
//! the ladder one rung at a time, tearing rungs down in reverse order on
//! the way back. State changes are requested by the host and by firmware
//! notifications and executed from a single worker call, so requests made
//! while a transition is in flight coalesce into the latest target.
use core::cell::RefCell;

use alloc::vec::Vec;
use embassy_sync::blocking_mutex;
use log::{debug, info, warn};
use portable_atomic::{AtomicU32, AtomicU8, Ordering};
use zerocopy::{FromBytes, FromZeros, IntoBytes};

use crate::{
    cmd::{CommandLink, HostCmd, CMD_RESP_MAX, CMD_WANT_RESP},
    fwcmd::{
        fw_ctxt_id_and_color, wide_id, AddStaCmd, BindingCmd, DevicePowerCmd, FwChannelInfo,
        MacContextCmd, MacDataSta, MacPowerCmd, MacQosParam, McastFilterCmd, RemoveStaCmd,
        ScanAbortUmac, ScanChannelCfgUmac, ScanConfigCmd, ScanReqUmac, TimeEventCmd,
        TimeEventNotif, TimeEventResp, TimeQuotaCmd, TimeQuotaData, TxPathFlushCmd,
        ADD_STA_MODE_ADD, ADD_STA_MODE_MODIFY, ADD_STA_STATUS_MASK, ADD_STA_SUCCESS,
        AUX_STATION_ID, CMD_ADD_STA, CMD_BINDING_CONTEXT, CMD_MAC_CONTEXT,
        CMD_MAC_PM_POWER_TABLE, CMD_MCAST_FILTER, CMD_PHY_CONTEXT, CMD_POWER_TABLE,
        CMD_REMOVE_STA, CMD_SCAN_ABORT_UMAC, CMD_SCAN_CFG, CMD_SCAN_REQ_UMAC, CMD_TIME_EVENT,
        CMD_TIME_QUOTA, CMD_TXPATH_FLUSH, FW_CTXT_ACTION_ADD, FW_CTXT_ACTION_MODIFY,
        FW_CTXT_ACTION_REMOVE, FW_CTXT_INVALID, GROUP_LONG, MAC_FILTER_ACCEPT_GRP,
        MAC_FILTER_IN_BEACON, MAC_INDEX_AUX, MAC_PROT_FLG_TGG_PROTECT, MAC_QOS_FLG_UPDATE_EDCA,
        MAC_TYPE_BSS_STA, PHY_BAND_24, PHY_BAND_5, PHY_VHT_CHANNEL_MODE20,
        SCAN_CHANNEL_FLAG_EBS, SCAN_CHANNEL_FLAG_EBS_ACCURATE, SCAN_CONFIG_FLAG_ACTIVATE,
        SCAN_CONFIG_FLAG_SET_ALL_TIMES, SCAN_CONFIG_FLAG_SET_AUX_STA_ID,
        SCAN_CONFIG_FLAG_SET_CHANNEL_FLAGS, SCAN_CONFIG_FLAG_SET_LEGACY_RATES,
        SCAN_CONFIG_FLAG_SET_MAC_ADDR, SCAN_CONFIG_FLAG_SET_RX_CHAINS,
        SCAN_CONFIG_FLAG_SET_TX_CHAINS, SCAN_GENERAL_FLAGS_ITER_COMPLETE,
        SCAN_GENERAL_FLAGS_PASS_ALL, STATION_ID, STA_FLG_FAT_EN_20MHZ, STA_FLG_FAT_EN_MSK,
        STA_FLG_MIMO_EN_MSK, STA_FLG_MIMO_EN_SISO, STA_MODIFY_ADD_BA_TID,
        STA_MODIFY_QUEUES, STA_MODIFY_REMOVE_BA_TID, TE_BSS_STA_AGGRESSIVE_ASSOC,
        TE_V2_FRAG_NONE, TE_V2_NOTIF_ACTION_END, TE_V2_NOTIF_HOST_EVENT_END,
        TE_V2_NOTIF_HOST_EVENT_START, TE_V2_START_IMMEDIATELY,
    },
    tx::{AC_COUNT, DQA_FIRST_DATA_QUEUE},
    DefaultRawMutex, Error, Result,
};

/// The rungs of the connection ladder, in climbing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LinkState {
    Init = 0,
    Scan = 1,
    Auth = 2,
    Assoc = 3,
    Run = 4,
}

impl LinkState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Scan,
            2 => Self::Auth,
            3 => Self::Assoc,
            4 => Self::Run,
            _ => Self::Init,
        }
    }
}

const FLAG_MAC_ACTIVE: u32 = 1 << 0;
const FLAG_BINDING_ACTIVE: u32 = 1 << 1;
const FLAG_STA_ACTIVE: u32 = 1 << 2;
const FLAG_TE_ACTIVE: u32 = 1 << 3;
const FLAG_SCANNING: u32 = 1 << 4;
const FLAG_SHUTDOWN: u32 = 1 << 5;
const FLAG_BGSCAN: u32 = 1 << 6;
const FLAG_PHY_ACTIVE: u32 = 1 << 7;
const FLAG_USE_PROTECTION: u32 = 1 << 8;
const FLAG_SCAN_CONFIGURED: u32 = 1 << 9;

/// Firmware keep-alive period while power management is off.
const POWER_KEEP_ALIVE_SEC: u16 = 25;

/// What firmware advertised that changes the machine's behavior.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkCaps {
    /// Firmware balances airtime itself; no quota command needed.
    pub dynamic_quota: bool,
}

/// Everything the machine needs to know about the network it joins.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub own_addr: [u8; 6],
    pub bssid: [u8; 6],
    pub channel: u8,
    pub band_2ghz: bool,
    pub beacon_interval: u16,
    pub assoc_id: u16,
    pub ht: bool,
    pub cck_rates: u32,
    pub ofdm_rates: u32,
    /// Channels scanned when looking for the network.
    pub scan_channels: Vec<u8>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            own_addr: [0; 6],
            bssid: [0; 6],
            channel: 1,
            band_2ghz: true,
            beacon_interval: 100,
            assoc_id: 0,
            ht: false,
            cck_rates: 0x0f,
            ofdm_rates: 0xff,
            scan_channels: Vec::new(),
        }
    }
}

pub struct LinkStateMachine {
    state: AtomicU8,
    requested: blocking_mutex::Mutex<DefaultRawMutex, RefCell<Option<LinkState>>>,
    config: blocking_mutex::Mutex<DefaultRawMutex, RefCell<LinkConfig>>,
    flags: AtomicU32,
    caps: LinkCaps,
    scan_uid: AtomicU32,
    te_uid: AtomicU32,
}

impl LinkStateMachine {
    pub fn new(caps: LinkCaps) -> Self {
        Self {
            state: AtomicU8::new(LinkState::Init as u8),
            requested: blocking_mutex::Mutex::new(RefCell::new(None)),
            config: blocking_mutex::Mutex::new(RefCell::new(LinkConfig::default())),
            flags: AtomicU32::new(0),
            caps,
            scan_uid: AtomicU32::new(0),
            te_uid: AtomicU32::new(0),
        }
    }

    pub fn state(&self) -> LinkState {
        LinkState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: LinkState) {
        info!("link state -> {state:?}");
        self.state.store(state as u8, Ordering::Release);
    }

    fn flag(&self, flag: u32) -> bool {
        self.flags.load(Ordering::Acquire) & flag != 0
    }

    fn set_flag(&self, flag: u32) {
        self.flags.fetch_or(flag, Ordering::AcqRel);
    }

    fn clear_flag(&self, flag: u32) {
        self.flags.fetch_and(!flag, Ordering::AcqRel);
    }

    /// Describe the network before climbing past [LinkState::Scan].
    pub fn set_config(&self, config: LinkConfig) {
        self.config.lock(|rc| *rc.borrow_mut() = config);
    }

    /// A copy of the current network description.
    pub fn config(&self) -> LinkConfig {
        self.config.lock(|rc| rc.borrow().clone())
    }

    /// Request a transition. Later requests override earlier ones that
    /// have not been executed yet; the worker picks up the latest.
    pub fn request(&self, target: LinkState) {
        debug!("link state {:?} requested", target);
        self.requested.lock(|rc| *rc.borrow_mut() = Some(target));
    }

    fn target(&self) -> Option<LinkState> {
        self.requested.lock(|rc| *rc.borrow())
    }

    /// Stop executing transitions; used while the device is going down.
    pub fn shutdown(&self) {
        self.set_flag(FLAG_SHUTDOWN);
    }

    /// Reset to a fresh machine after a device reset.
    pub fn reset(&self) {
        self.flags.store(0, Ordering::Release);
        self.requested.lock(|rc| *rc.borrow_mut() = None);
        self.set_state(LinkState::Init);
    }

    /// The scan finished or was aborted by the device.
    pub fn notify_scan_complete(&self) {
        self.clear_flag(FLAG_SCANNING | FLAG_BGSCAN);
    }

    /// Scan for roaming candidates without leaving the network. A no-op
    /// unless the machine sits in [LinkState::Run] with no scan in flight.
    pub async fn bgscan<L: CommandLink>(&self, link: &L) -> Result<()> {
        if self.state() != LinkState::Run
            || self.flag(FLAG_SHUTDOWN)
            || self.flag(FLAG_SCANNING)
        {
            return Ok(());
        }
        self.start_scan(link).await?;
        self.set_flag(FLAG_BGSCAN);
        Ok(())
    }

    /// A time event notification arrived.
    pub fn notify_time_event(&self, notif: &TimeEventNotif) {
        if notif.action.get() & TE_V2_NOTIF_ACTION_END != 0
            && notif.unique_id.get() == self.te_uid.load(Ordering::Acquire)
        {
            self.clear_flag(FLAG_TE_ACTIVE);
        }
    }

    /// Execute pending transitions, stepping one rung at a time toward the
    /// most recently requested state. Returns early without error when a
    /// step has to wait for a firmware notification; the notification's
    /// handler re-arms the worker.
    pub async fn process_pending<L: CommandLink>(&self, link: &L) -> Result<()> {
        loop {
            if self.flag(FLAG_SHUTDOWN) {
                return Ok(());
            }
            let Some(target) = self.target() else {
                return Ok(());
            };
            let current = self.state();
            if current == target {
                self.requested.lock(|rc| {
                    let mut req = rc.borrow_mut();
                    // A new target may have been requested meanwhile.
                    if *req == Some(target) {
                        *req = None;
                    }
                });
                if self.target().is_none() {
                    return Ok(());
                }
                continue;
            }
            if target > current {
                match current {
                    LinkState::Init => {
                        self.start_scan(link).await?;
                        self.set_state(LinkState::Scan);
                        // Climbing continues once the scan completes.
                        return Ok(());
                    }
                    LinkState::Scan => {
                        if self.flag(FLAG_SCANNING) {
                            return Ok(());
                        }
                        self.auth(link).await?;
                        self.set_state(LinkState::Auth);
                    }
                    LinkState::Auth => {
                        self.assoc(link).await?;
                        self.set_state(LinkState::Assoc);
                    }
                    LinkState::Assoc => {
                        self.run(link).await?;
                        self.set_state(LinkState::Run);
                    }
                    LinkState::Run => {}
                }
            } else {
                match current {
                    LinkState::Run => {
                        self.run_stop(link).await?;
                        self.set_state(LinkState::Assoc);
                    }
                    LinkState::Assoc => {
                        self.disassoc(link).await?;
                        self.set_state(LinkState::Auth);
                    }
                    LinkState::Auth => {
                        self.deauth(link).await?;
                        self.set_state(LinkState::Scan);
                    }
                    LinkState::Scan => {
                        if self.flag(FLAG_SCANNING) {
                            self.abort_scan(link).await?;
                        }
                        self.set_state(LinkState::Init);
                    }
                    LinkState::Init => {}
                }
            }
        }
    }

    /// One-time scanner setup: the auxiliary station the scanner transmits
    /// probe requests from, then the engine configuration with the channel
    /// list. Repeated only after a device reset.
    async fn configure_scan<L: CommandLink>(&self, link: &L) -> Result<()> {
        let config = self.config();
        let aux = AddStaCmd {
            add_modify: ADD_STA_MODE_ADD,
            mac_id_n_color: fw_ctxt_id_and_color(MAC_INDEX_AUX, 0).into(),
            sta_id: AUX_STATION_ID,
            ..AddStaCmd::new_zeroed()
        };
        let status = link
            .send_cmd_status(CMD_ADD_STA as u16, aux.as_bytes())
            .await?;
        if status & ADD_STA_STATUS_MASK != ADD_STA_SUCCESS {
            return Err(Error::DeviceRejected(status));
        }

        let cfg = ScanConfigCmd {
            flags: (SCAN_CONFIG_FLAG_ACTIVATE
                | SCAN_CONFIG_FLAG_SET_TX_CHAINS
                | SCAN_CONFIG_FLAG_SET_RX_CHAINS
                | SCAN_CONFIG_FLAG_SET_AUX_STA_ID
                | SCAN_CONFIG_FLAG_SET_ALL_TIMES
                | SCAN_CONFIG_FLAG_SET_CHANNEL_FLAGS
                | SCAN_CONFIG_FLAG_SET_LEGACY_RATES
                | SCAN_CONFIG_FLAG_SET_MAC_ADDR)
                .into(),
            tx_chains: (1 << 1).into(),
            rx_chains: (1 << 1).into(),
            // CCK in the low byte, OFDM above it.
            legacy_rates: ((config.ofdm_rates << 8) | config.cck_rates).into(),
            out_of_channel_time: [0.into(); 2],
            suspend_time: [0.into(); 2],
            mac_addr: config.own_addr,
            bcast_sta_id: AUX_STATION_ID,
            channel_flags: (SCAN_CHANNEL_FLAG_EBS | SCAN_CHANNEL_FLAG_EBS_ACCURATE) as u8,
        };
        let mut payload = cfg.as_bytes().to_vec();
        payload.extend_from_slice(&config.scan_channels);
        link.send_cmd_pdu(wide_id(GROUP_LONG, CMD_SCAN_CFG), &payload)
            .await
    }

    async fn start_scan<L: CommandLink>(&self, link: &L) -> Result<()> {
        if !self.flag(FLAG_SCAN_CONFIGURED) {
            self.configure_scan(link).await?;
            self.set_flag(FLAG_SCAN_CONFIGURED);
        }
        let config = self.config();
        let uid = self.scan_uid.fetch_add(1, Ordering::AcqRel);
        let req = ScanReqUmac {
            uid: uid.into(),
            ooc_priority: 0.into(),
            general_flags: (SCAN_GENERAL_FLAGS_PASS_ALL | SCAN_GENERAL_FLAGS_ITER_COMPLETE)
                .into(),
            extended_dwell: 0,
            active_dwell: 10,
            passive_dwell: 110,
            fragmented_dwell: 44,
            max_out_time: 0.into(),
            suspend_time: 0.into(),
            scan_priority: 0.into(),
            channel_flags: 0,
            n_channels: config.scan_channels.len() as u8,
            reserved: 0.into(),
        };
        let mut payload = req.as_bytes().to_vec();
        for &num in &config.scan_channels {
            let chan = ScanChannelCfgUmac {
                flags: 1.into(),
                channel_num: num,
                iter_count: 1,
                iter_interval: 0.into(),
            };
            payload.extend_from_slice(chan.as_bytes());
        }
        link.send_cmd_pdu(wide_id(GROUP_LONG, CMD_SCAN_REQ_UMAC), &payload)
            .await?;
        self.set_flag(FLAG_SCANNING);
        Ok(())
    }

    async fn abort_scan<L: CommandLink>(&self, link: &L) -> Result<()> {
        let abort = ScanAbortUmac {
            uid: self
                .scan_uid
                .load(Ordering::Acquire)
                .wrapping_sub(1)
                .into(),
            flags: 0.into(),
        };
        link.send_cmd_pdu(wide_id(GROUP_LONG, CMD_SCAN_ABORT_UMAC), abort.as_bytes())
            .await?;
        self.clear_flag(FLAG_SCANNING | FLAG_BGSCAN);
        Ok(())
    }

    async fn phy_ctxt<L: CommandLink>(&self, link: &L, action: u32) -> Result<()> {
        let config = self.config();
        let cmd = crate::fwcmd::PhyContextCmd {
            id_and_color: fw_ctxt_id_and_color(0, 0).into(),
            action: action.into(),
            apply_time: 0.into(),
            tx_param_color: 0.into(),
            ci: FwChannelInfo {
                band: if config.band_2ghz {
                    PHY_BAND_24
                } else {
                    PHY_BAND_5
                },
                channel: config.channel,
                width: PHY_VHT_CHANNEL_MODE20,
                ctrl_pos: 0,
            },
            txchain_info: (1 << 1).into(),
            rxchain_info: (1 << 1 | 1 << 10 | 1 << 12).into(),
            acquisition_data: 0.into(),
            dsp_cfg_flags: 0.into(),
        };
        link.send_cmd_pdu(CMD_PHY_CONTEXT as u16, cmd.as_bytes())
            .await
    }

    fn mac_ctxt_cmd(&self, action: u32, assoc: bool) -> MacContextCmd {
        let config = self.config();
        let mut cmd = MacContextCmd {
            id_and_color: fw_ctxt_id_and_color(0, 0).into(),
            action: action.into(),
            mac_type: MAC_TYPE_BSS_STA.into(),
            tsf_id: 0.into(),
            node_addr: config.own_addr,
            bssid_addr: config.bssid,
            cck_rates: config.cck_rates.into(),
            ofdm_rates: config.ofdm_rates.into(),
            cck_short_preamble: 0.into(),
            short_slot: (!config.band_2ghz as u32).into(),
            filter_flags: MAC_FILTER_ACCEPT_GRP.into(),
            qos_flags: MAC_QOS_FLG_UPDATE_EDCA.into(),
            ..MacContextCmd::new_zeroed()
        };
        if self.flag(FLAG_USE_PROTECTION) {
            cmd.protection_flags = MAC_PROT_FLG_TGG_PROTECT.into();
        }
        // Default EDCA parameters until the network's own arrive.
        for (i, ac) in cmd.ac.iter_mut().enumerate() {
            *ac = MacQosParam {
                cw_min: 15.into(),
                cw_max: 1023.into(),
                aifsn: 2 + i as u8,
                fifos_mask: 1 << i,
                edca_txop: 0.into(),
            };
        }
        if assoc {
            cmd.filter_flags = (MAC_FILTER_ACCEPT_GRP | MAC_FILTER_IN_BEACON).into();
            cmd.sta = MacDataSta {
                is_assoc: 1.into(),
                bi: (config.beacon_interval as u32).into(),
                bi_reciprocal: reciprocal(config.beacon_interval as u32).into(),
                dtim_interval: ((config.beacon_interval as u32) * 3).into(),
                dtim_reciprocal: reciprocal((config.beacon_interval as u32) * 3).into(),
                mcast_qid: (DQA_FIRST_DATA_QUEUE as u32 + 1).into(),
                ..MacDataSta::new_zeroed()
            };
        }
        cmd
    }

    async fn add_sta<L: CommandLink>(&self, link: &L, update: bool) -> Result<()> {
        let config = self.config();
        let mut queue_msk = 0u32;
        for ac in 0..AC_COUNT {
            queue_msk |= 1 << (DQA_FIRST_DATA_QUEUE as usize + ac);
        }
        let mut cmd = AddStaCmd {
            add_modify: if update {
                ADD_STA_MODE_MODIFY
            } else {
                ADD_STA_MODE_ADD
            },
            mac_id_n_color: fw_ctxt_id_and_color(0, 0).into(),
            addr: config.bssid,
            sta_id: STATION_ID,
            modify_mask: if update { STA_MODIFY_QUEUES } else { 0 },
            assoc_id: config.assoc_id.into(),
            tfd_queue_msk: queue_msk.into(),
            ..AddStaCmd::new_zeroed()
        };
        if config.ht {
            // Single stream on a 20 MHz channel; wider modes need the
            // peer's HT operation element, which the host does not relay.
            cmd.station_flags = (STA_FLG_FAT_EN_20MHZ | STA_FLG_MIMO_EN_SISO).into();
            cmd.station_flags_msk = (STA_FLG_FAT_EN_MSK | STA_FLG_MIMO_EN_MSK).into();
        }
        let status = link
            .send_cmd_status(CMD_ADD_STA as u16, cmd.as_bytes())
            .await?;
        if status & ADD_STA_STATUS_MASK != ADD_STA_SUCCESS {
            return Err(Error::DeviceRejected(status));
        }
        Ok(())
    }

    async fn remove_sta<L: CommandLink>(&self, link: &L) -> Result<()> {
        let flush = TxPathFlushCmd {
            sta_id: (STATION_ID as u32).into(),
            tid_mask: 0xffff.into(),
            reserved: [0; 2],
        };
        link.send_cmd_pdu(CMD_TXPATH_FLUSH as u16, flush.as_bytes())
            .await?;
        let cmd = RemoveStaCmd {
            sta_id: STATION_ID,
            reserved: [0; 3],
        };
        link.send_cmd_ok(CMD_REMOVE_STA as u16, cmd.as_bytes())
            .await
    }

    async fn binding<L: CommandLink>(&self, link: &L, action: u32) -> Result<()> {
        let mut macs = [U32_INVALID; crate::fwcmd::MAX_MACS_IN_BINDING];
        macs[0] = fw_ctxt_id_and_color(0, 0).into();
        let cmd = BindingCmd {
            id_and_color: fw_ctxt_id_and_color(0, 0).into(),
            action: action.into(),
            macs,
            phy: fw_ctxt_id_and_color(0, 0).into(),
        };
        link.send_cmd_ok(CMD_BINDING_CONTEXT as u16, cmd.as_bytes())
            .await
    }

    /// Shield the association handshake from channel hopping: ask the
    /// firmware for an aggressive-association time event spanning a few
    /// beacon intervals.
    async fn protect_session<L: CommandLink>(&self, link: &L) -> Result<()> {
        let config = self.config();
        let duration = (config.beacon_interval as u32).max(100) * 2;
        let cmd = TimeEventCmd {
            id_and_color: fw_ctxt_id_and_color(0, 0).into(),
            action: FW_CTXT_ACTION_ADD.into(),
            id: TE_BSS_STA_AGGRESSIVE_ASSOC.into(),
            apply_time: 0.into(),
            max_delay: ((config.beacon_interval as u32) / 2).into(),
            depends_on: 0.into(),
            interval: 1.into(),
            duration: duration.into(),
            repeat: 1,
            max_frags: TE_V2_FRAG_NONE,
            policy: (TE_V2_NOTIF_HOST_EVENT_START
                | TE_V2_NOTIF_HOST_EVENT_END
                | TE_V2_START_IMMEDIATELY)
                .into(),
        };
        let resp = link
            .send_cmd(HostCmd {
                id: CMD_TIME_EVENT as u16,
                flags: CMD_WANT_RESP,
                data: &[cmd.as_bytes()],
                resp_len: CMD_RESP_MAX,
            })
            .await?
            .ok_or(Error::BadResponse)?;
        let (te, _) =
            TimeEventResp::ref_from_prefix(resp.payload()).map_err(|_| Error::BadResponse)?;
        if te.status.get() != 0 {
            return Err(Error::DeviceRejected(te.status.get()));
        }
        self.te_uid.store(te.unique_id.get(), Ordering::Release);
        self.set_flag(FLAG_TE_ACTIVE);
        Ok(())
    }

    async fn unprotect_session<L: CommandLink>(&self, link: &L) -> Result<()> {
        if !self.flag(FLAG_TE_ACTIVE) {
            return Ok(());
        }
        let cmd = TimeEventCmd {
            id_and_color: fw_ctxt_id_and_color(0, 0).into(),
            action: FW_CTXT_ACTION_REMOVE.into(),
            id: TE_BSS_STA_AGGRESSIVE_ASSOC.into(),
            ..TimeEventCmd::new_zeroed()
        };
        link.send_cmd_pdu(CMD_TIME_EVENT as u16, cmd.as_bytes())
            .await?;
        self.clear_flag(FLAG_TE_ACTIVE);
        Ok(())
    }

    async fn quota<L: CommandLink>(&self, link: &L, enabled: bool) -> Result<()> {
        if self.caps.dynamic_quota {
            return Ok(());
        }
        let mut cmd = TimeQuotaCmd::new_zeroed();
        cmd.quotas[0] = TimeQuotaData {
            id_and_color: fw_ctxt_id_and_color(0, 0).into(),
            quota: if enabled { 128 } else { 0 }.into(),
            max_duration: 0.into(),
        };
        for quota in cmd.quotas[1..].iter_mut() {
            quota.id_and_color = FW_CTXT_INVALID.into();
        }
        link.send_cmd_pdu(CMD_TIME_QUOTA as u16, cmd.as_bytes())
            .await
    }

    /// Climb from a completed scan to an authenticated station. Contexts
    /// already established are rolled back when a later rung fails, unless
    /// the device was reset underneath us.
    async fn auth<L: CommandLink>(&self, link: &L) -> Result<()> {
        let generation = link.generation();
        // The PHY context exists from the first climb until the next device
        // reset; firmware offers no way to remove one.
        if self.flag(FLAG_PHY_ACTIVE) {
            self.phy_ctxt(link, FW_CTXT_ACTION_MODIFY).await?;
        } else {
            self.phy_ctxt(link, FW_CTXT_ACTION_ADD).await?;
            self.set_flag(FLAG_PHY_ACTIVE);
        }

        let mac = self.mac_ctxt_cmd(FW_CTXT_ACTION_ADD, false);
        link.send_cmd_pdu(CMD_MAC_CONTEXT as u16, mac.as_bytes())
            .await?;
        self.set_flag(FLAG_MAC_ACTIVE);

        if let Err(e) = self.binding(link, FW_CTXT_ACTION_ADD).await {
            self.rollback(link, generation).await;
            return Err(e);
        }
        self.set_flag(FLAG_BINDING_ACTIVE);

        if let Err(e) = self.add_sta(link, false).await {
            self.rollback(link, generation).await;
            return Err(e);
        }
        self.set_flag(FLAG_STA_ACTIVE);

        if let Err(e) = self.protect_session(link).await {
            self.rollback(link, generation).await;
            return Err(e);
        }
        Ok(())
    }

    /// Undo whatever `auth` established, newest context first. Skipped
    /// entirely when the device generation moved on: the contexts died
    /// with the old firmware instance.
    async fn rollback<L: CommandLink>(&self, link: &L, generation: u32) {
        if link.generation() != generation {
            warn!("device reset during auth; skipping context rollback");
            self.flags.fetch_and(
                !(FLAG_MAC_ACTIVE
                    | FLAG_BINDING_ACTIVE
                    | FLAG_STA_ACTIVE
                    | FLAG_TE_ACTIVE
                    | FLAG_PHY_ACTIVE
                    | FLAG_SCAN_CONFIGURED),
                Ordering::AcqRel,
            );
            return;
        }
        if self.flag(FLAG_STA_ACTIVE) {
            if let Err(e) = self.remove_sta(link).await {
                warn!("station rollback failed: {e:?}");
            }
            self.clear_flag(FLAG_STA_ACTIVE);
        }
        if self.flag(FLAG_BINDING_ACTIVE) {
            if let Err(e) = self.binding(link, FW_CTXT_ACTION_REMOVE).await {
                warn!("binding rollback failed: {e:?}");
            }
            self.clear_flag(FLAG_BINDING_ACTIVE);
        }
        if self.flag(FLAG_MAC_ACTIVE) {
            let mac = self.mac_ctxt_cmd(FW_CTXT_ACTION_REMOVE, false);
            if let Err(e) = link
                .send_cmd_pdu(CMD_MAC_CONTEXT as u16, mac.as_bytes())
                .await
            {
                warn!("MAC context rollback failed: {e:?}");
            }
            self.clear_flag(FLAG_MAC_ACTIVE);
        }
    }

    /// Accept group-addressed frames from our BSS only.
    async fn mcast_filter<L: CommandLink>(&self, link: &L) -> Result<()> {
        let config = self.config();
        let cmd = McastFilterCmd {
            filter_own: 1,
            port_id: 0,
            count: 0,
            pass_all: 1,
            bssid: config.bssid,
            reserved: [0; 2],
        };
        link.send_cmd_pdu(CMD_MCAST_FILTER as u16, cmd.as_bytes())
            .await
    }

    /// Power saving stays off, but the firmware still wants both power
    /// tables once the station runs.
    async fn update_power<L: CommandLink>(&self, link: &L) -> Result<()> {
        let device = DevicePowerCmd {
            flags: 0.into(),
            reserved: 0.into(),
        };
        link.send_cmd_pdu(CMD_POWER_TABLE as u16, device.as_bytes())
            .await?;
        let mac = MacPowerCmd {
            id_and_color: fw_ctxt_id_and_color(0, 0).into(),
            flags: 0.into(),
            keep_alive_seconds: POWER_KEEP_ALIVE_SEC.into(),
        };
        link.send_cmd_pdu(CMD_MAC_PM_POWER_TABLE as u16, mac.as_bytes())
            .await
    }

    /// The network's ERP protection requirement changed; refresh the MAC
    /// context so the firmware starts or stops protecting transmissions.
    pub async fn update_ht_protection<L: CommandLink>(
        &self,
        link: &L,
        protect: bool,
    ) -> Result<()> {
        if protect {
            self.set_flag(FLAG_USE_PROTECTION);
        } else {
            self.clear_flag(FLAG_USE_PROTECTION);
        }
        if !self.flag(FLAG_MAC_ACTIVE) {
            return Ok(());
        }
        let assoc = self.state() >= LinkState::Run;
        let mac = self.mac_ctxt_cmd(FW_CTXT_ACTION_MODIFY, assoc);
        link.send_cmd_pdu(CMD_MAC_CONTEXT as u16, mac.as_bytes())
            .await
    }

    /// Open a receive block-ack session the peer negotiated for `tid`,
    /// starting at sequence number `ssn`.
    pub async fn ampdu_rx_start<L: CommandLink>(&self, link: &L, tid: u8, ssn: u16) -> Result<()> {
        self.sta_rx_agg(link, tid, ssn, true).await
    }

    /// Tear down the receive block-ack session on `tid`.
    pub async fn ampdu_rx_stop<L: CommandLink>(&self, link: &L, tid: u8) -> Result<()> {
        self.sta_rx_agg(link, tid, 0, false).await
    }

    async fn sta_rx_agg<L: CommandLink>(
        &self,
        link: &L,
        tid: u8,
        ssn: u16,
        start: bool,
    ) -> Result<()> {
        if !self.flag(FLAG_STA_ACTIVE) {
            debug!("no station for block-ack on tid {tid}");
            return Ok(());
        }
        let config = self.config();
        let mut cmd = AddStaCmd {
            add_modify: ADD_STA_MODE_MODIFY,
            mac_id_n_color: fw_ctxt_id_and_color(0, 0).into(),
            addr: config.bssid,
            sta_id: STATION_ID,
            modify_mask: if start {
                STA_MODIFY_ADD_BA_TID
            } else {
                STA_MODIFY_REMOVE_BA_TID
            },
            ..AddStaCmd::new_zeroed()
        };
        if start {
            cmd.add_immediate_ba_tid = tid;
            cmd.add_immediate_ba_ssn = ssn.into();
        } else {
            cmd.remove_immediate_ba_tid = tid;
        }
        let status = link
            .send_cmd_status(CMD_ADD_STA as u16, cmd.as_bytes())
            .await?;
        if status & ADD_STA_STATUS_MASK != ADD_STA_SUCCESS {
            return Err(Error::DeviceRejected(status));
        }
        Ok(())
    }

    async fn assoc<L: CommandLink>(&self, link: &L) -> Result<()> {
        self.add_sta(link, true).await
    }

    async fn run<L: CommandLink>(&self, link: &L) -> Result<()> {
        // Firmware wants the PHY context refreshed once the association
        // parameters are final.
        self.phy_ctxt(link, FW_CTXT_ACTION_MODIFY).await?;
        let mac = self.mac_ctxt_cmd(FW_CTXT_ACTION_MODIFY, true);
        link.send_cmd_pdu(CMD_MAC_CONTEXT as u16, mac.as_bytes())
            .await?;
        self.mcast_filter(link).await?;
        self.update_power(link).await?;
        self.quota(link, true).await?;
        self.unprotect_session(link).await?;
        Ok(())
    }

    async fn run_stop<L: CommandLink>(&self, link: &L) -> Result<()> {
        self.quota(link, false).await?;
        let mac = self.mac_ctxt_cmd(FW_CTXT_ACTION_MODIFY, false);
        link.send_cmd_pdu(CMD_MAC_CONTEXT as u16, mac.as_bytes())
            .await
    }

    async fn disassoc<L: CommandLink>(&self, link: &L) -> Result<()> {
        if self.flag(FLAG_STA_ACTIVE) {
            self.remove_sta(link).await?;
            self.clear_flag(FLAG_STA_ACTIVE);
        }
        Ok(())
    }

    async fn deauth<L: CommandLink>(&self, link: &L) -> Result<()> {
        if self.flag(FLAG_STA_ACTIVE) {
            self.remove_sta(link).await?;
            self.clear_flag(FLAG_STA_ACTIVE);
        }
        self.unprotect_session(link).await?;
        if self.flag(FLAG_BINDING_ACTIVE) {
            self.binding(link, FW_CTXT_ACTION_REMOVE).await?;
            self.clear_flag(FLAG_BINDING_ACTIVE);
        }
        if self.flag(FLAG_MAC_ACTIVE) {
            let mac = self.mac_ctxt_cmd(FW_CTXT_ACTION_REMOVE, false);
            link.send_cmd_pdu(CMD_MAC_CONTEXT as u16, mac.as_bytes())
                .await?;
            self.clear_flag(FLAG_MAC_ACTIVE);
        }
        Ok(())
    }
}

const U32_INVALID: zerocopy::little_endian::U32 =
    zerocopy::little_endian::U32::new(FW_CTXT_INVALID);

/// The firmware's fixed-point reciprocal helper for beacon arithmetic.
fn reciprocal(v: u32) -> u32 {
    if v == 0 {
        0
    } else {
        0xffff_ffff / v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ScriptedLink;
    use alloc::vec;
    use embassy_futures::block_on;
    use zerocopy::FromZeros;

    /// A firmware that acknowledges everything, including a well-formed
    /// time event response.
    fn agreeable_fw() -> ScriptedLink {
        ScriptedLink::new(|id, _| {
            if id == CMD_TIME_EVENT as u16 {
                let resp = TimeEventResp {
                    status: 0.into(),
                    id: TE_BSS_STA_AGGRESSIVE_ASSOC.into(),
                    unique_id: 0x1234.into(),
                    id_and_color: 0.into(),
                };
                Ok(resp.as_bytes().to_vec())
            } else {
                Ok(0u32.to_le_bytes().to_vec())
            }
        })
    }

    fn machine() -> LinkStateMachine {
        let sm = LinkStateMachine::new(LinkCaps::default());
        sm.set_config(LinkConfig {
            own_addr: [2, 0, 0, 0, 0, 1],
            bssid: [2, 0, 0, 0, 0, 2],
            channel: 6,
            beacon_interval: 102,
            assoc_id: 5,
            scan_channels: vec![1, 6, 11],
            ..LinkConfig::default()
        });
        sm
    }

    #[test]
    fn climb_to_run_executes_every_rung_in_order() {
        let sm = machine();
        let fw = agreeable_fw();
        sm.request(LinkState::Run);

        block_on(sm.process_pending(&fw)).unwrap();
        assert_eq!(sm.state(), LinkState::Scan);
        // The first scan sets the scanner up: aux station, then config.
        assert_eq!(
            fw.sent_ids(),
            vec![
                CMD_ADD_STA as u16,
                wide_id(GROUP_LONG, CMD_SCAN_CFG),
                wide_id(GROUP_LONG, CMD_SCAN_REQ_UMAC),
            ]
        );

        // Still waiting for the scan; another worker pass is a no-op.
        block_on(sm.process_pending(&fw)).unwrap();
        assert_eq!(fw.sent.borrow().len(), 3);

        sm.notify_scan_complete();
        block_on(sm.process_pending(&fw)).unwrap();
        assert_eq!(sm.state(), LinkState::Run);
        assert_eq!(sm.target(), None);

        let ids = fw.sent_ids();
        assert_eq!(
            &ids[3..],
            &[
                CMD_PHY_CONTEXT as u16,
                CMD_MAC_CONTEXT as u16,
                CMD_BINDING_CONTEXT as u16,
                CMD_ADD_STA as u16,
                CMD_TIME_EVENT as u16,
                CMD_ADD_STA as u16,
                CMD_PHY_CONTEXT as u16,
                CMD_MAC_CONTEXT as u16,
                CMD_MCAST_FILTER as u16,
                CMD_POWER_TABLE as u16,
                CMD_MAC_PM_POWER_TABLE as u16,
                CMD_TIME_QUOTA as u16,
                CMD_TIME_EVENT as u16, // session protection released
            ]
        );
        // Session protection ends when the association completes.
        assert!(!sm.flag(FLAG_TE_ACTIVE));
        assert_eq!(sm.te_uid.load(Ordering::Relaxed), 0x1234);
    }

    #[test]
    fn teardown_cascades_to_init() {
        let sm = machine();
        let fw = agreeable_fw();
        sm.request(LinkState::Run);
        block_on(sm.process_pending(&fw)).unwrap();
        sm.notify_scan_complete();
        block_on(sm.process_pending(&fw)).unwrap();
        assert_eq!(sm.state(), LinkState::Run);
        fw.sent.borrow_mut().clear();

        sm.request(LinkState::Init);
        block_on(sm.process_pending(&fw)).unwrap();
        assert_eq!(sm.state(), LinkState::Init);
        let ids = fw.sent_ids();
        assert_eq!(
            ids,
            vec![
                CMD_TIME_QUOTA as u16,
                CMD_MAC_CONTEXT as u16,   // association dropped
                CMD_TXPATH_FLUSH as u16,  // station removal flushes first
                CMD_REMOVE_STA as u16,
                CMD_BINDING_CONTEXT as u16,
                CMD_MAC_CONTEXT as u16,   // context removed
            ]
        );
        assert!(!sm.flag(FLAG_MAC_ACTIVE));
        assert!(!sm.flag(FLAG_BINDING_ACTIVE));
        assert!(!sm.flag(FLAG_STA_ACTIVE));
    }

    #[test]
    fn station_failure_rolls_back_binding_and_mac() {
        let sm = machine();
        let fw = ScriptedLink::new(|id, payload| {
            // Firmware refuses the BSS station entry; the aux station
            // added for scanning goes through.
            if id == CMD_ADD_STA as u16 && payload[16] == STATION_ID {
                Ok(2u32.to_le_bytes().to_vec())
            } else {
                Ok(0u32.to_le_bytes().to_vec())
            }
        });
        sm.request(LinkState::Auth);
        block_on(sm.process_pending(&fw)).unwrap();
        sm.notify_scan_complete();
        let res = block_on(sm.process_pending(&fw));
        assert!(matches!(res, Err(Error::DeviceRejected(2))));
        assert_eq!(sm.state(), LinkState::Scan);

        let ids = fw.sent_ids();
        assert_eq!(
            &ids[3..],
            &[
                CMD_PHY_CONTEXT as u16,
                CMD_MAC_CONTEXT as u16,
                CMD_BINDING_CONTEXT as u16,
                CMD_ADD_STA as u16,
                // Rollback, newest first. No station to remove.
                CMD_BINDING_CONTEXT as u16,
                CMD_MAC_CONTEXT as u16,
            ]
        );
        assert!(!sm.flag(FLAG_MAC_ACTIVE));
        assert!(!sm.flag(FLAG_BINDING_ACTIVE));
    }

    #[test]
    fn rollback_is_skipped_across_generations() {
        let sm = machine();
        let fw = ScriptedLink::new(|id, _| {
            if id == CMD_BINDING_CONTEXT as u16 {
                Err(Error::DeviceReset)
            } else {
                Ok(0u32.to_le_bytes().to_vec())
            }
        });
        sm.request(LinkState::Auth);
        block_on(sm.process_pending(&fw)).unwrap();
        sm.notify_scan_complete();
        // The device resets right as the binding command fails.
        fw.reset_on.set(Some(CMD_BINDING_CONTEXT as u16));
        let res = block_on(sm.process_pending(&fw));
        assert!(res.is_err());
        // Nothing was sent after the failing binding command.
        let ids = fw.sent_ids();
        assert_eq!(*ids.last().unwrap(), CMD_BINDING_CONTEXT as u16);
        assert!(!sm.flag(FLAG_MAC_ACTIVE));
    }

    #[test]
    fn shutdown_stops_the_worker() {
        let sm = machine();
        let fw = agreeable_fw();
        sm.request(LinkState::Run);
        sm.shutdown();
        block_on(sm.process_pending(&fw)).unwrap();
        assert!(fw.sent.borrow().is_empty());
        assert_eq!(sm.state(), LinkState::Init);
    }

    #[test]
    fn later_requests_coalesce() {
        let sm = machine();
        let fw = agreeable_fw();
        sm.request(LinkState::Run);
        sm.request(LinkState::Auth);
        block_on(sm.process_pending(&fw)).unwrap();
        sm.notify_scan_complete();
        block_on(sm.process_pending(&fw)).unwrap();
        // Only the latest target was executed.
        assert_eq!(sm.state(), LinkState::Auth);
        assert!(!fw.sent_ids().contains(&(CMD_TIME_QUOTA as u16)));
    }

    #[test]
    fn bgscan_fires_only_when_running() {
        let sm = machine();
        let fw = agreeable_fw();
        // Not associated yet; nothing goes out.
        block_on(sm.bgscan(&fw)).unwrap();
        assert!(fw.sent.borrow().is_empty());

        sm.request(LinkState::Run);
        block_on(sm.process_pending(&fw)).unwrap();
        sm.notify_scan_complete();
        block_on(sm.process_pending(&fw)).unwrap();
        assert_eq!(sm.state(), LinkState::Run);
        fw.sent.borrow_mut().clear();

        block_on(sm.bgscan(&fw)).unwrap();
        assert_eq!(fw.sent_ids(), vec![wide_id(GROUP_LONG, CMD_SCAN_REQ_UMAC)]);
        assert!(sm.flag(FLAG_BGSCAN));
        // A second request while one is in flight is a no-op.
        block_on(sm.bgscan(&fw)).unwrap();
        assert_eq!(fw.sent.borrow().len(), 1);

        sm.notify_scan_complete();
        assert!(!sm.flag(FLAG_BGSCAN));
        assert_eq!(sm.state(), LinkState::Run);
    }

    #[test]
    fn scanner_setup_happens_once_per_firmware_life() {
        let sm = machine();
        let fw = agreeable_fw();
        sm.request(LinkState::Scan);
        block_on(sm.process_pending(&fw)).unwrap();
        {
            let sent = fw.sent.borrow();
            let (aux, _) = AddStaCmd::ref_from_prefix(&sent[0].1).unwrap();
            assert_eq!(aux.sta_id, AUX_STATION_ID);
            assert_eq!(aux.add_modify, ADD_STA_MODE_ADD);
            // The channel list trails the engine configuration.
            let (_, channels) = ScanConfigCmd::ref_from_prefix(&sent[1].1).unwrap();
            assert_eq!(channels, &[1u8, 6, 11][..]);
        }

        // A second scan reuses the configuration.
        sm.notify_scan_complete();
        sm.request(LinkState::Init);
        block_on(sm.process_pending(&fw)).unwrap();
        sm.request(LinkState::Scan);
        block_on(sm.process_pending(&fw)).unwrap();
        let cfgs = fw
            .sent_ids()
            .iter()
            .filter(|&&id| id == wide_id(GROUP_LONG, CMD_SCAN_CFG))
            .count();
        assert_eq!(cfgs, 1);

        // A device reset throws the configuration away with the firmware.
        sm.reset();
        assert!(!sm.flag(FLAG_SCAN_CONFIGURED));
    }

    #[test]
    fn phy_context_is_added_once_then_modified() {
        use crate::fwcmd::PhyContextCmd;
        let sm = machine();
        let fw = agreeable_fw();
        sm.request(LinkState::Auth);
        block_on(sm.process_pending(&fw)).unwrap();
        sm.notify_scan_complete();
        block_on(sm.process_pending(&fw)).unwrap();
        assert_eq!(sm.state(), LinkState::Auth);

        // Down to Scan and back up; the context survives the descent.
        sm.request(LinkState::Scan);
        block_on(sm.process_pending(&fw)).unwrap();
        sm.request(LinkState::Auth);
        block_on(sm.process_pending(&fw)).unwrap();
        assert_eq!(sm.state(), LinkState::Auth);

        let actions: Vec<u32> = fw
            .sent
            .borrow()
            .iter()
            .filter(|(id, _)| *id == CMD_PHY_CONTEXT as u16)
            .map(|(_, payload)| {
                PhyContextCmd::ref_from_prefix(payload)
                    .unwrap()
                    .0
                    .action
                    .get()
            })
            .collect();
        assert_eq!(actions, vec![FW_CTXT_ACTION_ADD, FW_CTXT_ACTION_MODIFY]);
    }

    #[test]
    fn ht_protection_updates_the_mac_context() {
        let sm = machine();
        let fw = agreeable_fw();
        // No MAC context yet; only the flag is recorded.
        block_on(sm.update_ht_protection(&fw, true)).unwrap();
        assert!(fw.sent.borrow().is_empty());

        sm.request(LinkState::Auth);
        block_on(sm.process_pending(&fw)).unwrap();
        sm.notify_scan_complete();
        block_on(sm.process_pending(&fw)).unwrap();
        fw.sent.borrow_mut().clear();

        block_on(sm.update_ht_protection(&fw, false)).unwrap();
        block_on(sm.update_ht_protection(&fw, true)).unwrap();
        let sent = fw.sent.borrow();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|(id, _)| *id == CMD_MAC_CONTEXT as u16));
        let (off, _) = MacContextCmd::ref_from_prefix(&sent[0].1).unwrap();
        assert_eq!(off.protection_flags.get(), 0);
        let (on, _) = MacContextCmd::ref_from_prefix(&sent[1].1).unwrap();
        assert_eq!(on.action.get(), FW_CTXT_ACTION_MODIFY);
        assert_eq!(on.protection_flags.get(), MAC_PROT_FLG_TGG_PROTECT);
    }

    #[test]
    fn block_ack_sessions_modify_the_station() {
        let sm = machine();
        let fw = agreeable_fw();
        // No station yet; nothing goes out.
        block_on(sm.ampdu_rx_start(&fw, 5, 0x321)).unwrap();
        assert!(fw.sent.borrow().is_empty());

        sm.request(LinkState::Auth);
        block_on(sm.process_pending(&fw)).unwrap();
        sm.notify_scan_complete();
        block_on(sm.process_pending(&fw)).unwrap();
        fw.sent.borrow_mut().clear();

        block_on(sm.ampdu_rx_start(&fw, 5, 0x321)).unwrap();
        block_on(sm.ampdu_rx_stop(&fw, 5)).unwrap();
        let sent = fw.sent.borrow();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|(id, _)| *id == CMD_ADD_STA as u16));
        let (start, _) = AddStaCmd::ref_from_prefix(&sent[0].1).unwrap();
        assert_eq!(start.add_modify, ADD_STA_MODE_MODIFY);
        assert_eq!(start.modify_mask, STA_MODIFY_ADD_BA_TID);
        assert_eq!(start.add_immediate_ba_tid, 5);
        assert_eq!(start.add_immediate_ba_ssn.get(), 0x321);
        let (stop, _) = AddStaCmd::ref_from_prefix(&sent[1].1).unwrap();
        assert_eq!(stop.modify_mask, STA_MODIFY_REMOVE_BA_TID);
        assert_eq!(stop.remove_immediate_ba_tid, 5);
    }

    #[test]
    fn time_event_notifications_clear_protection_by_uid() {
        let sm = machine();
        sm.te_uid.store(0x77, Ordering::Release);
        sm.set_flag(FLAG_TE_ACTIVE);
        let mut notif = TimeEventNotif::new_zeroed();
        notif.unique_id = 0x88.into();
        notif.action = TE_V2_NOTIF_ACTION_END.into();
        sm.notify_time_event(&notif);
        assert!(sm.flag(FLAG_TE_ACTIVE));
        notif.unique_id = 0x77.into();
        sm.notify_time_event(&notif);
        assert!(!sm.flag(FLAG_TE_ACTIVE));
    }
}
