//! Host command ring.
//!
//! Queue 0 is reserved for host commands. Every command occupies one of 32
//! slots; a small per-slot buffer inside the ring's DMA block holds the
//! serialized command, with a one-off DMA allocation for oversized
//! payloads. Synchronous commands park on a per-slot signal until the
//! response demultiplexer hands the reply back, bounded by a timeout.
use core::cell::RefCell;

use alloc::{vec, vec::Vec};
use embassy_sync::blocking_mutex;
use embassy_time::{with_timeout, Duration};
use log::{debug, trace, warn};
use portable_atomic::{AtomicU32, Ordering};
use zerocopy::{FromBytes, FromZeros, IntoBytes};

use crate::{
    fwcmd::{
        cmd_group, cmd_opcode, wide_id, CmdHeader, CmdHeaderWide, RxPacketHdr, TfhTb, TfhTfd,
        CMD_FAILED_MSK, FRAME_SIZE_MSK, GROUP_LEGACY,
    },
    hal::{DmaRegion, IwxHal, Mmio},
    regs::{TxDoorbell, HBUS_TARG_WRPTR},
    sync::EventSignal,
    DefaultRawMutex, Error, Result,
};

/// Slots in the command queue.
pub const CMD_QUEUE_SIZE: usize = 32;
/// Queue id of the command queue under dynamic queue allocation.
pub const DQA_CMD_QUEUE: u8 = 0;
/// Payload bytes available in a slot's resident buffer.
const DEF_CMD_PAYLOAD_SIZE: usize = 320;
/// Slot buffer: worst-case header plus resident payload.
const SLOT_BUF_SIZE: usize = 328;
/// Hard ceiling for payloads spilled into a dedicated DMA buffer.
const MAX_CMD_PAYLOAD_SIZE: usize = 4096 - 8;
/// Default response buffer size, enough for any packet the device emits.
pub const CMD_RESP_MAX: usize = 4096;

const CMD_TIMEOUT: Duration = Duration::from_secs(1);

pub const CMD_ASYNC: u8 = 1 << 0;
pub const CMD_WANT_RESP: u8 = 1 << 1;
pub const CMD_SEND_IN_RFKILL: u8 = 1 << 2;

/// A command to be sent, borrowed from the caller.
pub struct HostCmd<'a> {
    pub id: u16,
    pub flags: u8,
    /// Payload fragments, concatenated on the wire.
    pub data: &'a [&'a [u8]],
    /// Response buffer size for [CMD_WANT_RESP] commands.
    pub resp_len: usize,
}

impl<'a> HostCmd<'a> {
    pub fn pdu(id: u16, data: &'a [&'a [u8]]) -> Self {
        Self {
            id,
            flags: 0,
            data,
            resp_len: 0,
        }
    }

    pub fn with_resp(id: u16, data: &'a [&'a [u8]], resp_len: usize) -> Self {
        Self {
            id,
            flags: CMD_WANT_RESP,
            data,
            resp_len,
        }
    }

    fn payload_len(&self) -> usize {
        self.data.iter().map(|frag| frag.len()).sum()
    }
}

/// An owned response packet handed back to the command's sender.
pub struct RespPacket {
    buf: Vec<u8>,
}

impl RespPacket {
    pub(crate) fn new(buf: Vec<u8>) -> Result<Self> {
        if buf.len() < core::mem::size_of::<RxPacketHdr>() {
            return Err(Error::BadResponse);
        }
        Ok(Self { buf })
    }

    pub fn hdr(&self) -> CmdHeader {
        let pkt = RxPacketHdr::ref_from_prefix(&self.buf)
            .map(|(hdr, _)| *hdr)
            .unwrap_or_else(|_| RxPacketHdr::new_zeroed());
        pkt.hdr
    }

    /// The packet payload after the command header, bounded by the length
    /// the device reported.
    pub fn payload(&self) -> &[u8] {
        let Ok((pkt, rest)) = RxPacketHdr::ref_from_prefix(&self.buf) else {
            return &[];
        };
        let len = (pkt.len_n_flags.get() & FRAME_SIZE_MSK) as usize;
        let payload_len = len.saturating_sub(core::mem::size_of::<CmdHeader>());
        &rest[..payload_len.min(rest.len())]
    }
}

/// The seam between command producers and the ring.
///
/// Higher layers (NVM access, the link state machine, device bring-up) are
/// written against this trait so they can run against a scripted firmware
/// in tests.
#[allow(async_fn_in_trait)]
pub trait CommandLink {
    /// Submit a command. Returns the response packet for commands carrying
    /// [CMD_WANT_RESP], [None] otherwise.
    async fn send_cmd(&self, cmd: HostCmd<'_>) -> Result<Option<RespPacket>>;

    /// The device generation the link currently serves. Bumped on every
    /// reset; replies from a previous generation are worthless.
    fn generation(&self) -> u32;

    /// Fire-and-forget command with a single payload.
    async fn send_cmd_pdu(&self, id: u16, data: &[u8]) -> Result<()> {
        self.send_cmd(HostCmd::pdu(id, &[data])).await.map(|_| ())
    }

    /// Send a command whose response is a bare 32-bit status word.
    async fn send_cmd_status(&self, id: u16, data: &[u8]) -> Result<u32> {
        let resp = self
            .send_cmd(HostCmd::with_resp(id, &[data], CMD_RESP_MAX))
            .await?
            .ok_or(Error::BadResponse)?;
        let payload = resp.payload();
        if payload.len() != 4 {
            return Err(Error::BadResponse);
        }
        Ok(u32::from_le_bytes([
            payload[0], payload[1], payload[2], payload[3],
        ]))
    }

    /// Like [Self::send_cmd_status], mapping any non-zero status to an
    /// error carrying the device's code.
    async fn send_cmd_ok(&self, id: u16, data: &[u8]) -> Result<()> {
        match self.send_cmd_status(id, data).await? {
            0 => Ok(()),
            status => Err(Error::DeviceRejected(status)),
        }
    }
}

struct CmdSlot<H: IwxHal> {
    /// Response buffer registered by a waiting sender, filled by the
    /// demultiplexer. [None] while the slot is free.
    resp: Option<Vec<u8>>,
    /// Wide id of the command occupying the slot; responses carrying a
    /// different id are stale and must not be filed.
    id: u16,
    /// Spill buffer for oversized commands, freed on completion.
    oversize: Option<DmaRegion<H>>,
}

struct RingState<H: IwxHal> {
    /// Frame descriptors, one per slot.
    desc: DmaRegion<H>,
    /// Resident command buffers, [SLOT_BUF_SIZE] bytes per slot.
    buf: DmaRegion<H>,
    slots: [CmdSlot<H>; CMD_QUEUE_SIZE],
    cur: usize,
    queued: usize,
}

/// The command queue state plus the per-slot completion signals.
pub struct CmdRing<H: IwxHal> {
    state: blocking_mutex::Mutex<DefaultRawMutex, RefCell<RingState<H>>>,
    signals: [EventSignal; CMD_QUEUE_SIZE],
    generation: AtomicU32,
}

impl<H: IwxHal> CmdRing<H> {
    pub fn new() -> Result<Self> {
        const SIGNAL: EventSignal = EventSignal::new();
        let desc = DmaRegion::zeroed(CMD_QUEUE_SIZE * core::mem::size_of::<TfhTfd>(), 256)?;
        let buf = DmaRegion::zeroed(CMD_QUEUE_SIZE * SLOT_BUF_SIZE, 16)?;
        Ok(Self {
            state: blocking_mutex::Mutex::new(RefCell::new(RingState {
                desc,
                buf,
                slots: core::array::from_fn(|_| CmdSlot {
                    resp: None,
                    id: 0,
                    oversize: None,
                }),
                cur: 0,
                queued: 0,
            })),
            signals: [SIGNAL; CMD_QUEUE_SIZE],
            generation: AtomicU32::new(0),
        })
    }

    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    /// Physical address of the descriptor array, for queue configuration.
    pub fn desc_paddr(&self) -> u64 {
        self.state.lock(|rc| rc.borrow().desc.paddr())
    }

    /// Submit a command and, for synchronous commands, wait for its
    /// completion.
    pub async fn send(&self, mmio: &impl Mmio, cmd: HostCmd<'_>) -> Result<Option<RespPacket>> {
        let want_resp = cmd.flags & CMD_WANT_RESP != 0;
        let sync = cmd.flags & CMD_ASYNC == 0;
        let generation = self.generation.load(Ordering::Acquire);

        let idx = self.state.lock(|rc| {
            let mut state = rc.borrow_mut();
            let idx = state.cur;
            if want_resp && state.slots[idx].resp.is_some() {
                // An earlier command timed out and still owns this slot.
                return Err(Error::CommandSlotBusy);
            }
            let paylen = cmd.payload_len();
            let group = cmd_group(cmd.id);
            let hdrlen = if group == GROUP_LEGACY {
                core::mem::size_of::<CmdHeader>()
            } else {
                core::mem::size_of::<CmdHeaderWide>()
            };
            let total = hdrlen + paylen;

            let mut serialized = vec![0u8; total];
            if group == GROUP_LEGACY {
                let hdr = CmdHeader {
                    code: cmd_opcode(cmd.id),
                    flags: 0,
                    idx: idx as u8,
                    qid: DQA_CMD_QUEUE,
                };
                serialized[..hdrlen].copy_from_slice(hdr.as_bytes());
            } else {
                let hdr = CmdHeaderWide {
                    opcode: cmd_opcode(cmd.id),
                    group_id: group,
                    idx: idx as u8,
                    qid: DQA_CMD_QUEUE,
                    length: (paylen as u16).into(),
                    reserved: 0,
                    version: 0,
                };
                serialized[..hdrlen].copy_from_slice(hdr.as_bytes());
            }
            let mut off = hdrlen;
            for frag in cmd.data {
                serialized[off..off + frag.len()].copy_from_slice(frag);
                off += frag.len();
            }

            let paddr = if paylen > SLOT_BUF_SIZE - hdrlen {
                if paylen > MAX_CMD_PAYLOAD_SIZE {
                    return Err(Error::CommandTooLarge);
                }
                let mut spill = DmaRegion::zeroed(total, 16)?;
                spill.as_mut_slice()[..total].copy_from_slice(&serialized);
                let paddr = spill.paddr();
                state.slots[idx].oversize = Some(spill);
                paddr
            } else {
                let slot_off = idx * SLOT_BUF_SIZE;
                let base = state.buf.paddr();
                state.buf.as_mut_slice()[slot_off..slot_off + total].copy_from_slice(&serialized);
                base + slot_off as u64
            };

            if want_resp {
                state.slots[idx].resp = Some(vec![0u8; cmd.resp_len.max(8)]);
                state.slots[idx].id = cmd.id;
            }

            let mut tfd = TfhTfd::zeroed();
            tfd.num_tbs = (1u16).into();
            tfd.tbs[0] = TfhTb::new(total as u16, paddr);
            let desc_off = idx * core::mem::size_of::<TfhTfd>();
            state.desc.as_mut_slice()[desc_off..desc_off + core::mem::size_of::<TfhTfd>()]
                .copy_from_slice(tfd.as_bytes());

            self.signals[idx].reset();
            state.cur = (state.cur + 1) % CMD_QUEUE_SIZE;
            state.queued += 1;
            trace!(
                "command {:#x} in slot {idx}, {paylen} payload bytes",
                cmd.id
            );
            mmio.write32(
                HBUS_TARG_WRPTR,
                TxDoorbell::new()
                    .with_qid(DQA_CMD_QUEUE)
                    .with_write_index(state.cur as u16)
                    .into_bits(),
            );
            Ok(idx)
        })?;

        if !sync {
            return Ok(None);
        }

        if with_timeout(CMD_TIMEOUT, self.signals[idx].wait())
            .await
            .is_err()
        {
            if self.generation.load(Ordering::Acquire) != generation {
                return Err(Error::DeviceReset);
            }
            warn!("command {:#x} in slot {idx} timed out", cmd.id);
            // The slot keeps its response buffer; a late completion will
            // still be filed and the slot recycled on wrap-around.
            return Err(Error::CommandTimeout);
        }
        if self.generation.load(Ordering::Acquire) != generation {
            return Err(Error::DeviceReset);
        }
        if !want_resp {
            return Ok(None);
        }
        let resp = self
            .state
            .lock(|rc| rc.borrow_mut().slots[idx].resp.take())
            .ok_or(Error::BadResponse)?;
        Ok(Some(RespPacket::new(resp)?))
    }

    /// File a response packet for the slot that produced it. Called by the
    /// receive demultiplexer for packets addressed to the command queue.
    pub fn file_response(&self, idx: usize, pkt: &[u8]) {
        if idx >= CMD_QUEUE_SIZE {
            return;
        }
        self.state.lock(|rc| {
            let mut state = rc.borrow_mut();
            let expected = state.slots[idx].id;
            let Some(resp) = state.slots[idx].resp.as_mut() else {
                return;
            };
            let failed = pkt
                .get(5)
                .map(|&flags| flags & CMD_FAILED_MSK != 0)
                .unwrap_or(true);
            // The packet must answer the command the slot actually holds;
            // anything else is a stale reply from a recycled slot.
            let id = pkt
                .get(4)
                .zip(pkt.get(5))
                .map(|(&code, &flags)| wide_id(flags & 0xf, code));
            if failed || id != Some(expected) || pkt.len() > resp.len() {
                debug!(
                    "dropping response {id:?} for slot {idx} (expected {expected:#x}, \
                     failed: {failed}, {} bytes)",
                    pkt.len()
                );
                state.slots[idx].resp = None;
                return;
            }
            resp[..pkt.len()].copy_from_slice(pkt);
        });
    }

    /// Release a slot after the firmware consumed its command, waking the
    /// sender if one is parked on it.
    pub fn complete(&self, idx: usize) {
        if idx >= CMD_QUEUE_SIZE {
            return;
        }
        self.state.lock(|rc| {
            let mut state = rc.borrow_mut();
            state.slots[idx].oversize = None;
            if state.queued > 0 {
                state.queued -= 1;
            }
        });
        self.signals[idx].signal();
    }

    /// Drop all in-flight commands and invalidate outstanding waits.
    /// Part of device reset.
    pub fn reset(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.state.lock(|rc| {
            let mut state = rc.borrow_mut();
            for slot in state.slots.iter_mut() {
                slot.resp = None;
                slot.oversize = None;
            }
            state.cur = 0;
            state.queued = 0;
        });
        for signal in &self.signals {
            signal.signal();
        }
    }
}
