//! The driver proper: device bring-up, interrupt handling, the receive
//! demultiplexer and the transmit entry point.
use core::cell::RefCell;

use alloc::vec::Vec;
use embassy_sync::blocking_mutex;
use embassy_time::{with_timeout, Duration};
use log::{debug, error, info, trace, warn};
use portable_atomic::{AtomicI32, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use zerocopy::{FromBytes, FromZeros, IntoBytes};

use crate::{
    cmd::{CmdRing, CommandLink, HostCmd, RespPacket, DQA_CMD_QUEUE},
    fw::{FwImage, UcodeType},
    fwcmd::{
        self, wide_id, AliveResp, BeaconFilterCmd, BtCoexCmd, DqaEnableCmd, ErrorResp,
        InitExtendedCfgCmd, LtrConfigCmd, MccUpdateCmd, MissedBeaconsNotif,
        PhyCfgCmd, RxMpduDesc, ScanCompleteUmac, SfCfgCmd, StatisticsNotif, TimeEventNotif,
        TxAntCfgCmd, TxQueueCfgCmd, TxResp, ALIVE_STATUS_OK, BT_COEX_WIFI, INIT_NVM,
        RX_MPDU_MFLG2_PAD, RX_MPDU_STATUS_CRC_OK, RX_MPDU_STATUS_OVERRUN_OK,
        SCAN_OFFLOAD_ABORTED, SCAN_OFFLOAD_COMPLETED, SF_FULL_ON, TX_QUEUE_CFG_ENABLE_QUEUE, TX_STATUS_DIRECT_DONE,
        TX_STATUS_MSK, TX_STATUS_SUCCESS,
    },
    hal::{DmaRegion, IwxHal, Mmio},
    link::{LinkCaps, LinkStateMachine},
    nvm::{self, NvmData},
    rates::{select_rate, RateSelection},
    regs::{
        Nic, CSR_CTXT_INFO_ADDR, CSR_INT, CSR_INT_FH_RX, CSR_INT_FH_TX, CSR_INT_HW_ERR,
        CSR_INT_MASK, CSR_INT_RF_KILL, CSR_INT_SW_ERR, CSR_INT_SW_RX, CSR_GP_CNTRL,
        CSR_GP_CNTRL_HW_RF_KILL_SW, UREG_CPU_INIT_RUN, WFMP_MAC_ADDR_0, WFMP_MAC_ADDR_1,
    },
    rx::{frame_hdrlen, noise_floor, signal_dbm, PacketIter, RxRing},
    sync::{DropGuard, EventSignal, SignalQueue},
    tx::{OutFrame, TxCompletion, TxRing, AC_COUNT, DQA_FIRST_DATA_QUEUE},
    DefaultRawMutex, Error, Result,
};

const ALIVE_TIMEOUT: Duration = Duration::from_secs(2);
const INIT_COMPLETE_TIMEOUT: Duration = Duration::from_secs(2);

const FLAG_HW_ERR: u32 = 1 << 0;
const FLAG_RFKILL: u32 = 1 << 1;
const FLAG_RUNNING: u32 = 1 << 2;

/// No host-pinned rate index.
const FIXED_RIDX_NONE: usize = usize::MAX;

/// What the driver surfaces to the host stack.
#[derive(Debug)]
pub enum DeviceEvent {
    /// A received frame with its radio metadata.
    Frame {
        data: Vec<u8>,
        rssi_dbm: i32,
        channel: u8,
    },
    /// A transmitted frame finished, successfully or not.
    TxDone(TxCompletion),
    /// A previously full transmit queue drained below its low water mark.
    TxQueueAvailable(u8),
    ScanComplete,
    /// The access point went quiet.
    BeaconsMissed(u32),
    /// The firmware reported a command or internal error.
    FirmwareError { error_type: u32, cmd_id: u8 },
    RadioKillToggled(bool),
    /// Fatal; the host should tear the device down and restart it.
    HardwareError,
}

/// Firmware sections staged in DMA memory for the device to fetch, plus
/// the descriptor table pointing at them.
struct FwMemory<H: IwxHal> {
    _table: DmaRegion<H>,
    _sections: Vec<DmaRegion<H>>,
}

/// Error table pointers reported by the boot handshake.
#[derive(Default, Clone, Copy)]
struct UcodeStatus {
    alive_ok: bool,
    lmac_error_event_table: u32,
    umac_error_event_table: u32,
}

pub struct IwxDriver<M: Mmio, H: IwxHal> {
    mmio: M,
    nic_locks: AtomicU32,
    flags: AtomicU32,
    cmd_ring: CmdRing<H>,
    rx_ring: RxRing<H>,
    tx_rings: [TxRing<H>; AC_COUNT],
    tx_full_msk: AtomicU32,
    pub link: LinkStateMachine,
    rx_signal: SignalQueue,
    alive: EventSignal,
    init_complete: EventSignal,
    uc_status: blocking_mutex::Mutex<DefaultRawMutex, RefCell<UcodeStatus>>,
    fw: blocking_mutex::Mutex<DefaultRawMutex, RefCell<Option<FwImage>>>,
    fw_mem: blocking_mutex::Mutex<DefaultRawMutex, RefCell<Option<FwMemory<H>>>>,
    nvm: blocking_mutex::Mutex<DefaultRawMutex, RefCell<Option<NvmData>>>,
    noise_dbm: AtomicI32,
    txmcs: AtomicU8,
    txrate: AtomicU8,
    fixed_ridx: AtomicUsize,
}

impl<M: Mmio, H: IwxHal> IwxDriver<M, H> {
    /// Allocate the rings and build an idle driver. Nothing touches the
    /// device until [Self::start].
    pub fn new(mmio: M) -> Result<Self> {
        Ok(Self {
            mmio,
            nic_locks: AtomicU32::new(0),
            flags: AtomicU32::new(0),
            cmd_ring: CmdRing::new()?,
            rx_ring: RxRing::new()?,
            tx_rings: [
                TxRing::new(DQA_FIRST_DATA_QUEUE)?,
                TxRing::new(DQA_FIRST_DATA_QUEUE + 1)?,
                TxRing::new(DQA_FIRST_DATA_QUEUE + 2)?,
                TxRing::new(DQA_FIRST_DATA_QUEUE + 3)?,
            ],
            tx_full_msk: AtomicU32::new(0),
            link: LinkStateMachine::new(LinkCaps::default()),
            rx_signal: SignalQueue::new(),
            alive: EventSignal::new(),
            init_complete: EventSignal::new(),
            uc_status: blocking_mutex::Mutex::new(RefCell::new(UcodeStatus::default())),
            fw: blocking_mutex::Mutex::new(RefCell::new(None)),
            fw_mem: blocking_mutex::Mutex::new(RefCell::new(None)),
            nvm: blocking_mutex::Mutex::new(RefCell::new(None)),
            noise_dbm: AtomicI32::new(-127),
            txmcs: AtomicU8::new(0),
            txrate: AtomicU8::new(12),
            fixed_ridx: AtomicUsize::new(FIXED_RIDX_NONE),
        })
    }

    fn nic(&self) -> Nic<'_, M> {
        Nic::new(&self.mmio, &self.nic_locks)
    }

    pub fn nvm_data(&self) -> Option<NvmData> {
        self.nvm.lock(|rc| rc.borrow().clone())
    }

    pub fn noise_dbm(&self) -> i32 {
        self.noise_dbm.load(Ordering::Relaxed)
    }

    /// Whether [Self::start] completed and no fatal error hit since.
    pub fn is_running(&self) -> bool {
        let flags = self.flags.load(Ordering::Acquire);
        flags & FLAG_RUNNING != 0 && flags & FLAG_HW_ERR == 0
    }

    /// Firmware error table pointers from the last boot handshake, for
    /// post-mortem dumps.
    pub fn error_event_tables(&self) -> (u32, u32) {
        self.uc_status.lock(|rc| {
            let status = rc.borrow();
            (
                status.lmac_error_event_table,
                status.umac_error_event_table,
            )
        })
    }

    /// Pin the transmit rate to a fixed device rate index, or un-pin it.
    pub fn set_fixed_rate(&self, ridx: Option<usize>) {
        self.fixed_ridx
            .store(ridx.unwrap_or(FIXED_RIDX_NONE), Ordering::Relaxed);
    }

    /// Feed the host's rate control decision for subsequent data frames.
    pub fn set_tx_rate(&self, mcs: u8, legacy_rate: u8) {
        self.txmcs.store(mcs, Ordering::Relaxed);
        self.txrate.store(legacy_rate, Ordering::Relaxed);
    }

    /// Top half. Acknowledges the interrupt causes and defers all real
    /// work; cheap enough for a hard interrupt context.
    pub fn handle_interrupt(&self) -> Option<DeviceEvent> {
        let causes = self.mmio.read32(CSR_INT);
        if causes == 0 || causes == u32::MAX {
            return None;
        }
        self.mmio.write32(CSR_INT, causes);
        if causes & (CSR_INT_HW_ERR | CSR_INT_SW_ERR) != 0 {
            error!("fatal interrupt, causes {causes:#010x}");
            self.flags.fetch_or(FLAG_HW_ERR, Ordering::AcqRel);
            return Some(DeviceEvent::HardwareError);
        }
        if causes & CSR_INT_RF_KILL != 0 {
            let killed =
                self.mmio.read32(CSR_GP_CNTRL) & CSR_GP_CNTRL_HW_RF_KILL_SW == 0;
            if killed {
                self.flags.fetch_or(FLAG_RFKILL, Ordering::AcqRel);
            } else {
                self.flags.fetch_and(!FLAG_RFKILL, Ordering::AcqRel);
            }
            return Some(DeviceEvent::RadioKillToggled(killed));
        }
        if causes & (CSR_INT_FH_RX | CSR_INT_SW_RX | CSR_INT_FH_TX) != 0 {
            self.rx_signal.put();
        }
        None
    }

    /// Stage the firmware sections in DMA memory, hand the device the
    /// descriptor table and kick its init CPU.
    fn load_firmware(&self, fw: &FwImage) -> Result<()> {
        let sections = &fw.sections[UcodeType::Regular as usize];
        if sections.is_empty() {
            return Err(Error::FirmwareTooShort);
        }
        // Descriptor table entries: device address, length, host physical
        // address; terminated by an all-zero entry.
        let mut table = DmaRegion::zeroed((sections.len() + 1) * 16, 256)?;
        let mut staged = Vec::with_capacity(sections.len());
        for (i, section) in sections.iter().enumerate() {
            let mut mem = DmaRegion::zeroed(section.len.max(1), 4096)?;
            mem.as_mut_slice()[..section.len].copy_from_slice(fw.section_data(section));
            let entry = table.as_mut_slice();
            entry[i * 16..i * 16 + 4].copy_from_slice(&section.dev_addr.to_le_bytes());
            entry[i * 16 + 4..i * 16 + 8].copy_from_slice(&(section.len as u32).to_le_bytes());
            entry[i * 16 + 8..i * 16 + 16].copy_from_slice(&mem.paddr().to_le_bytes());
            staged.push(mem);
        }
        let paddr = table.paddr();
        self.fw_mem.lock(|rc| {
            *rc.borrow_mut() = Some(FwMemory {
                _table: table,
                _sections: staged,
            })
        });

        let nic = self.nic();
        nic.write32(CSR_CTXT_INFO_ADDR, paddr as u32);
        nic.write32(CSR_CTXT_INFO_ADDR + 4, (paddr >> 32) as u32);
        nic.write32(
            CSR_INT_MASK,
            CSR_INT_FH_RX | CSR_INT_SW_RX | CSR_INT_FH_TX | CSR_INT_HW_ERR | CSR_INT_SW_ERR
                | CSR_INT_RF_KILL,
        );
        let lock = nic.lock()?;
        lock.write_prph(UREG_CPU_INIT_RUN, 1);
        info!(
            "firmware {} staged, {} sections",
            if fw.fw_version.is_empty() {
                "(unversioned)"
            } else {
                fw.fw_version.as_str()
            },
            sections.len()
        );
        Ok(())
    }

    /// The MAC address shadow registers, used as a last-resort fallback
    /// when no NVM section carries a usable address.
    fn otp_mac(&self) -> Option<[u8; 6]> {
        let nic = self.nic();
        let lock = nic.lock().ok()?;
        let mac0 = lock.read_prph(WFMP_MAC_ADDR_0);
        let mac1 = lock.read_prph(WFMP_MAC_ADDR_1);
        Some(nvm::mac_from_otp_words(mac0, mac1))
    }

    /// Bring the device up: load firmware, complete the boot handshake,
    /// read and parse NVM, then configure the data path.
    pub async fn start(&self, fw_bytes: Vec<u8>) -> Result<()> {
        let fw = FwImage::parse(fw_bytes)?;
        self.alive.reset();
        self.init_complete.reset();
        self.load_firmware(&fw)?;
        // Unstage the firmware memory again if bring-up fails below.
        let unstage = DropGuard::new(|| self.fw_mem.lock(|rc| *rc.borrow_mut() = None));
        if with_timeout(ALIVE_TIMEOUT, self.alive.wait()).await.is_err() {
            error!("firmware never reported alive");
            return Err(Error::Timeout);
        }
        if !self.uc_status.lock(|rc| rc.borrow().alive_ok) {
            return Err(Error::HwError);
        }

        let init = InitExtendedCfgCmd {
            init_flags: INIT_NVM.into(),
        };
        self.send_cmd_pdu(
            wide_id(fwcmd::GROUP_SYSTEM, fwcmd::CMD_INIT_EXTENDED_CFG),
            init.as_bytes(),
        )
        .await?;

        let sections = nvm::read_all_sections(self).await?;
        let nvm_data = nvm::parse(&sections, self.otp_mac())?;
        info!(
            "NVM version {:#x}, MAC {:02x?}, {} channels",
            nvm_data.version,
            nvm_data.hw_addr,
            nvm_data.channels.len()
        );
        self.send_cmd_pdu(
            wide_id(fwcmd::GROUP_REGULATORY_AND_NVM, fwcmd::CMD_NVM_ACCESS_COMPLETE),
            &[],
        )
        .await?;
        if with_timeout(INIT_COMPLETE_TIMEOUT, self.init_complete.wait())
            .await
            .is_err()
        {
            return Err(Error::Timeout);
        }

        self.configure(&fw, &nvm_data).await?;
        unstage.defuse();
        self.fw.lock(|rc| *rc.borrow_mut() = Some(fw));
        self.nvm.lock(|rc| *rc.borrow_mut() = Some(nvm_data));
        self.flags.fetch_or(FLAG_RUNNING, Ordering::AcqRel);
        Ok(())
    }

    /// Post-boot datapath configuration.
    async fn configure(&self, fw: &FwImage, nvm_data: &NvmData) -> Result<()> {
        // Let the PCIe root complex know our latency tolerance.
        let ltr = LtrConfigCmd {
            flags: fwcmd::LTR_CFG_FLAG_FEATURE_ENABLE.into(),
            static_long: 0.into(),
            static_short: 0.into(),
        };
        self.send_cmd_pdu(fwcmd::CMD_LTR_CONFIG as u16, ltr.as_bytes())
            .await?;

        let bt = BtCoexCmd {
            mode: BT_COEX_WIFI.into(),
            enabled_modules: 0.into(),
        };
        self.send_cmd_pdu(fwcmd::CMD_BT_CONFIG as u16, bt.as_bytes())
            .await?;

        let ant = TxAntCfgCmd {
            valid: (nvm_data.valid_tx_ant as u32).into(),
        };
        self.send_cmd_pdu(fwcmd::CMD_TX_ANT_CONFIGURATION as u16, ant.as_bytes())
            .await?;

        let phy = PhyCfgCmd {
            phy_cfg: fw.phy_config.into(),
            calib_control: fwcmd::CalibCtrl {
                flow_trigger: fw.default_calib[UcodeType::Regular as usize]
                    .flow_trigger
                    .into(),
                event_trigger: fw.default_calib[UcodeType::Regular as usize]
                    .event_trigger
                    .into(),
            },
        };
        self.send_cmd_pdu(fwcmd::CMD_PHY_CONFIGURATION as u16, phy.as_bytes())
            .await?;

        // World regulatory domain until the host supplies a country.
        let mcc = MccUpdateCmd {
            mcc: fwcmd::MCC_WORLD.into(),
            ..MccUpdateCmd::new_zeroed()
        };
        self.send_cmd_pdu(fwcmd::CMD_MCC_UPDATE as u16, mcc.as_bytes())
            .await?;

        let dqa = DqaEnableCmd {
            cmd_queue: (DQA_CMD_QUEUE as u32).into(),
        };
        self.send_cmd_pdu(
            wide_id(fwcmd::GROUP_DATA_PATH, fwcmd::CMD_DQA_ENABLE),
            dqa.as_bytes(),
        )
        .await?;

        for (ac, ring) in self.tx_rings.iter().enumerate() {
            let cfg = TxQueueCfgCmd {
                flags: TX_QUEUE_CFG_ENABLE_QUEUE.into(),
                sta_id: fwcmd::STATION_ID,
                tid: ac as u8,
                cb_size: (crate::tx::TX_RING_COUNT as u32).into(),
                tfdq_addr: ring.desc_paddr().to_le_bytes(),
                ..TxQueueCfgCmd::new_zeroed()
            };
            let resp = self
                .send_cmd(HostCmd::with_resp(
                    fwcmd::CMD_SCD_QUEUE_CFG as u16,
                    &[cfg.as_bytes()],
                    crate::cmd::CMD_RESP_MAX,
                ))
                .await?
                .ok_or(Error::BadResponse)?;
            let (queue, _) = fwcmd::TxQueueCfgResp::ref_from_prefix(resp.payload())
                .map_err(|_| Error::BadResponse)?;
            // Firmware is free to hand out a different queue; this driver
            // requires the identity mapping its rings were built around.
            if queue.queue_number.get() != ring.qid() as u16 {
                error!(
                    "firmware assigned queue {} where {} was requested",
                    queue.queue_number.get(),
                    ring.qid()
                );
                return Err(Error::BadResponse);
            }
        }

        let sf = SfCfgCmd {
            state: SF_FULL_ON.into(),
        };
        self.send_cmd_pdu(fwcmd::CMD_SF_CFG as u16, sf.as_bytes())
            .await?;

        // Beacon filtering off: the association logic reads beacons itself.
        let bf = BeaconFilterCmd::new_zeroed();
        self.send_cmd_pdu(fwcmd::CMD_BEACON_FILTERING as u16, bf.as_bytes())
            .await?;
        self.rx_ring.restock(&self.mmio);
        Ok(())
    }

    /// Tear the device down: fail in-flight waiters, drain the rings and
    /// return to the idle state. Safe to call on an already stopped
    /// device.
    pub fn stop(&self) -> Vec<TxCompletion> {
        self.link.shutdown();
        self.cmd_ring.reset();
        let mut dropped = Vec::new();
        for ring in &self.tx_rings {
            dropped.extend(ring.reset());
        }
        self.tx_full_msk.store(0, Ordering::Release);
        self.rx_signal.reset();
        self.link.reset();
        self.uc_status
            .lock(|rc| *rc.borrow_mut() = UcodeStatus::default());
        self.fw_mem.lock(|rc| *rc.borrow_mut() = None);
        self.flags
            .fetch_and(!(FLAG_RUNNING | FLAG_HW_ERR), Ordering::AcqRel);
        dropped
    }

    /// Restart the device after a fatal firmware or hardware error,
    /// reusing the firmware image from the previous [Self::start].
    /// Returns the frames that were queued when the error hit.
    pub async fn recover(&self) -> Result<Vec<TxCompletion>> {
        let dropped = self.stop();
        let fw = self
            .fw
            .lock(|rc| rc.borrow_mut().take())
            .ok_or(Error::HwError)?;
        self.start(fw.into_raw()).await?;
        Ok(dropped)
    }

    /// Queue a data frame on the access class's ring.
    pub fn transmit(
        &self,
        frame: &OutFrame<'_>,
        ac: usize,
        is_data: bool,
        multicast: bool,
    ) -> Result<()> {
        let ac = ac.min(AC_COUNT - 1);
        if self.flags.load(Ordering::Acquire) & FLAG_HW_ERR != 0 {
            return Err(Error::HwError);
        }
        if self.tx_full_msk.load(Ordering::Acquire) & (1 << ac) != 0 {
            return Err(Error::RingFull);
        }
        let config = self.link.config();
        let fixed = self.fixed_ridx.load(Ordering::Relaxed);
        let sel = RateSelection {
            is_data,
            multicast,
            band_2ghz: config.band_2ghz,
            ht: config.ht,
            sgi20: false,
            txmcs: self.txmcs.load(Ordering::Relaxed),
            txrate: self.txrate.load(Ordering::Relaxed),
            fixed_ridx: (fixed != FIXED_RIDX_NONE).then_some(fixed),
        };
        let (_ridx, rate_n_flags) = select_rate(&sel);
        let full = self.tx_rings[ac].enqueue(&self.mmio, frame, rate_n_flags)?;
        if full {
            self.tx_full_msk.fetch_or(1 << ac, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Bottom half: wait for the interrupt handler's signal, then drain
    /// the RX ring and dispatch every packet in every filled buffer.
    pub async fn process_rx(&self, events: &mut impl FnMut(DeviceEvent)) -> Result<()> {
        self.rx_signal.next().await;
        self.drain_rx(events)
    }

    /// Drain the RX ring without waiting; the synchronous half of
    /// [Self::process_rx].
    pub fn drain_rx(&self, events: &mut impl FnMut(DeviceEvent)) -> Result<()> {
        let closed = self.rx_ring.closed_index();
        let mut cur = self.rx_ring.current_index();
        let mut handled = 0;
        while cur != closed {
            let buf = self.rx_ring.exchange(cur)?;
            for pkt in PacketIter::new(buf.as_slice()) {
                self.handle_packet(pkt.code, pkt.qid, pkt.idx, pkt.notification, pkt.payload, events);
                if !pkt.notification && pkt.qid == DQA_CMD_QUEUE {
                    self.cmd_ring.file_response(pkt.idx as usize, pkt.raw);
                    self.cmd_ring.complete(pkt.idx as usize);
                }
                handled += 1;
            }
            cur = self.rx_ring.current_index();
        }
        if handled > 0 {
            trace!("handled {handled} packets");
            self.rx_ring.restock(&self.mmio);
        }
        Ok(())
    }

    fn handle_packet(
        &self,
        code: u16,
        qid: u8,
        idx: u8,
        notification: bool,
        payload: &[u8],
        events: &mut impl FnMut(DeviceEvent),
    ) {
        match code {
            c if c == fwcmd::CMD_RX_MPDU as u16 => self.rx_frame(payload, events),
            c if c == fwcmd::CMD_TX as u16 && notification => {
                self.tx_done(qid, idx, payload, events)
            }
            c if c == fwcmd::CMD_ALIVE as u16 => self.alive_notif(payload),
            c if c == fwcmd::CMD_INIT_COMPLETE_NOTIF as u16 => self.init_complete.signal(),
            c if c == fwcmd::CMD_TIME_EVENT_NOTIFICATION as u16 => {
                if let Ok((notif, _)) = TimeEventNotif::ref_from_prefix(payload) {
                    self.link.notify_time_event(notif);
                }
            }
            c if c == fwcmd::CMD_SCAN_COMPLETE_UMAC as u16
                || c == fwcmd::CMD_SCAN_ITERATION_COMPLETE as u16 =>
            {
                if let Ok((complete, _)) = ScanCompleteUmac::ref_from_prefix(payload) {
                    match complete.status {
                        SCAN_OFFLOAD_COMPLETED => debug!("scan {} finished", complete.uid.get()),
                        SCAN_OFFLOAD_ABORTED => debug!("scan {} aborted", complete.uid.get()),
                        s => debug!("scan {} status {s}", complete.uid.get()),
                    }
                }
                if code == fwcmd::CMD_SCAN_COMPLETE_UMAC as u16 {
                    self.link.notify_scan_complete();
                    events(DeviceEvent::ScanComplete);
                }
            }
            c if c == fwcmd::CMD_MISSED_BEACONS_NOTIFICATION as u16 => {
                if let Ok((missed, _)) = MissedBeaconsNotif::ref_from_prefix(payload) {
                    let n = missed.consec_missed_beacons_since_last_rx.get();
                    warn!("{n} consecutive beacons missed");
                    events(DeviceEvent::BeaconsMissed(n));
                }
            }
            c if c == fwcmd::CMD_STATISTICS_NOTIFICATION as u16 => {
                if let Ok((stats, _)) = StatisticsNotif::ref_from_prefix(payload) {
                    let mut silence = [0u32; 3];
                    for (out, val) in silence.iter_mut().zip(stats.beacon_silence_rssi) {
                        *out = val.get();
                    }
                    self.noise_dbm
                        .store(noise_floor(&silence), Ordering::Relaxed);
                }
            }
            c if c == fwcmd::CMD_REPLY_ERROR as u16 => {
                if let Ok((err, _)) = ErrorResp::ref_from_prefix(payload) {
                    error!(
                        "firmware error {:#x} for command {:#x}",
                        err.error_type.get(),
                        err.cmd_id
                    );
                    events(DeviceEvent::FirmwareError {
                        error_type: err.error_type.get(),
                        cmd_id: err.cmd_id,
                    });
                }
            }
            // Chatty but uninteresting firmware notifications.
            c if c == fwcmd::CMD_RX_PHY_NOTIFICATION as u16
                || c == fwcmd::CMD_MFUART_LOAD_NOTIFICATION as u16
                || c == fwcmd::CMD_DEBUG_LOG_MSG as u16
                || c == wide_id(fwcmd::GROUP_SYSTEM, fwcmd::CMD_FSEQ_VER_MISMATCH_NOTIF) => {}
            _ => {
                if notification {
                    debug!("unhandled notification {code:#x}");
                }
            }
        }
    }

    fn rx_frame(&self, payload: &[u8], events: &mut impl FnMut(DeviceEvent)) {
        let Ok((desc, body)) = RxMpduDesc::ref_from_prefix(payload) else {
            return;
        };
        let status = desc.status.get();
        if status & RX_MPDU_STATUS_CRC_OK == 0 || status & RX_MPDU_STATUS_OVERRUN_OK == 0 {
            trace!("dropping frame with bad status {status:#06x}");
            return;
        }
        let len = desc.mpdu_len.get() as usize;
        if len > body.len() {
            return;
        }
        let body = &body[..len];
        let data = if desc.mac_flags2 & RX_MPDU_MFLG2_PAD != 0 {
            // The device dword-aligned the payload by inserting 2 bytes
            // after the MAC header; splice them back out.
            let hdrlen = frame_hdrlen(body);
            if body.len() < hdrlen + 2 {
                return;
            }
            let mut data = Vec::with_capacity(body.len() - 2);
            data.extend_from_slice(&body[..hdrlen]);
            data.extend_from_slice(&body[hdrlen + 2..]);
            data
        } else {
            body.to_vec()
        };
        let rssi_dbm = signal_dbm(desc.energy_a, desc.energy_b).min(0);
        events(DeviceEvent::Frame {
            data,
            rssi_dbm,
            channel: desc.channel,
        });
    }

    fn tx_done(&self, qid: u8, idx: u8, payload: &[u8], events: &mut impl FnMut(DeviceEvent)) {
        let Some(ring) = self
            .tx_rings
            .get(qid.wrapping_sub(DQA_FIRST_DATA_QUEUE) as usize)
        else {
            return;
        };
        let Ok((resp, _)) = TxResp::ref_from_prefix(payload) else {
            return;
        };
        let status = resp.status.get() & TX_STATUS_MSK;
        let acked = status == TX_STATUS_SUCCESS || status == TX_STATUS_DIRECT_DONE;
        let retries = resp.failure_frame.get().min(u8::MAX as u16) as u8;
        let (done, below_lomark) = ring.reclaim(idx as usize, acked, retries);
        for completion in done {
            events(DeviceEvent::TxDone(completion));
        }
        let ac = (qid - DQA_FIRST_DATA_QUEUE) as u32;
        if below_lomark && self.tx_full_msk.fetch_and(!(1 << ac), Ordering::AcqRel) & (1 << ac) != 0
        {
            events(DeviceEvent::TxQueueAvailable(qid));
        }
    }

    fn alive_notif(&self, payload: &[u8]) {
        let Ok((alive, _)) = AliveResp::ref_from_prefix(payload) else {
            warn!("short alive notification");
            return;
        };
        let ok = alive.status.get() == ALIVE_STATUS_OK;
        if !ok {
            error!("firmware alive status {:#06x}", alive.status.get());
        }
        self.uc_status.lock(|rc| {
            *rc.borrow_mut() = UcodeStatus {
                alive_ok: ok,
                lmac_error_event_table: alive.lmac_error_event_table[0].get(),
                umac_error_event_table: alive.umac_error_event_table.get(),
            }
        });
        self.alive.signal();
    }
}

impl<M: Mmio, H: IwxHal> CommandLink for IwxDriver<M, H> {
    async fn send_cmd(&self, cmd: HostCmd<'_>) -> Result<Option<RespPacket>> {
        if self.flags.load(Ordering::Acquire) & FLAG_RFKILL != 0
            && cmd.flags & crate::cmd::CMD_SEND_IN_RFKILL == 0
        {
            return Err(Error::RadioKilled);
        }
        self.cmd_ring.send(&self.mmio, cmd).await
    }

    fn generation(&self) -> u32 {
        self.cmd_ring.generation()
    }
}
