//! Transmit rings.
//!
//! One ring per access class. Each slot pairs a frame descriptor with a
//! resident command buffer holding the transmit command and the 802.11
//! header; the frame body stays in host memory and is referenced by
//! scatter entries. Completions may skip slots, so reclaim force-frees
//! everything between the ring tail and the acknowledged index.
use core::cell::RefCell;

use alloc::vec::Vec;
use embassy_sync::blocking_mutex;
use log::{debug, trace};
use zerocopy::IntoBytes;

use crate::{
    fwcmd::{
        CmdHeader, TfhTb, TfhTfd, TxCmdGen2, CMD_TX, FIRST_TB_SIZE, TFH_NUM_TBS,
        TX_CMD_OFFLD_PAD, TX_FLAGS_CMD_RATE, TX_FLAGS_ENCRYPT_DIS,
    },
    hal::{DmaRegion, IwxHal, Mmio},
    regs::{TxDoorbell, HBUS_TARG_WRPTR},
    DefaultRawMutex, Error, Result,
};

/// Slots per transmit ring.
pub const TX_RING_COUNT: usize = 256;
/// Occupancy at which a ring reports itself full.
pub const TX_RING_HIMARK: usize = 224;
/// Occupancy at which a full ring opens up again.
pub const TX_RING_LOMARK: usize = 192;
/// First data queue id under dynamic queue allocation; one queue per
/// access class follows.
pub const DQA_FIRST_DATA_QUEUE: u8 = 2;
/// Access classes.
pub const AC_COUNT: usize = 4;

/// Scatter entries available for the frame body: the descriptor minus the
/// two entries spent on the command buffer.
pub const MAX_PAYLOAD_SEGS: usize = TFH_NUM_TBS - 2;

/// Slot buffer: command header, transmit command, worst-case 802.11
/// header plus padding.
const TX_SLOT_BUF_SIZE: usize = 128;
/// Longest 802.11 header the slot buffer accommodates.
const MAX_HDR_LEN: usize =
    TX_SLOT_BUF_SIZE - core::mem::size_of::<CmdHeader>() - core::mem::size_of::<TxCmdGen2>();

/// One host-memory fragment of a frame body.
#[derive(Debug, Clone, Copy)]
pub struct TxSeg {
    pub paddr: u64,
    pub len: u16,
}

/// A frame handed to a ring: the 802.11 header by value, the body by
/// reference.
pub struct OutFrame<'a> {
    pub hdr: &'a [u8],
    pub segs: &'a [TxSeg],
    /// Host cookie returned with the frame's completion.
    pub cookie: u32,
}

/// The host-visible outcome of one transmitted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxCompletion {
    pub cookie: u32,
    /// False for frames force-freed without a device acknowledgment.
    pub acked: bool,
    pub retries: u8,
}

#[derive(Clone, Copy)]
struct TxSlot {
    cookie: u32,
}

struct TxRingState<H: IwxHal> {
    desc: DmaRegion<H>,
    buf: DmaRegion<H>,
    slots: [Option<TxSlot>; TX_RING_COUNT],
    cur: usize,
    tail: usize,
    queued: usize,
}

/// A data transmit ring bound to one device queue.
pub struct TxRing<H: IwxHal> {
    qid: u8,
    state: blocking_mutex::Mutex<DefaultRawMutex, RefCell<TxRingState<H>>>,
}

impl<H: IwxHal> TxRing<H> {
    pub fn new(qid: u8) -> Result<Self> {
        let desc = DmaRegion::zeroed(TX_RING_COUNT * core::mem::size_of::<TfhTfd>(), 256)?;
        let buf = DmaRegion::zeroed(TX_RING_COUNT * TX_SLOT_BUF_SIZE, 16)?;
        Ok(Self {
            qid,
            state: blocking_mutex::Mutex::new(RefCell::new(TxRingState {
                desc,
                buf,
                slots: [None; TX_RING_COUNT],
                cur: 0,
                tail: 0,
                queued: 0,
            })),
        })
    }

    pub fn qid(&self) -> u8 {
        self.qid
    }

    pub fn desc_paddr(&self) -> u64 {
        self.state.lock(|rc| rc.borrow().desc.paddr())
    }

    pub fn queued(&self) -> usize {
        self.state.lock(|rc| rc.borrow().queued)
    }

    /// Queue a frame. Returns true if the ring crossed its high water mark
    /// and the host should stop feeding it.
    pub fn enqueue(
        &self,
        mmio: &impl Mmio,
        frame: &OutFrame<'_>,
        rate_n_flags: u32,
    ) -> Result<bool> {
        if frame.segs.len() > MAX_PAYLOAD_SEGS {
            return Err(Error::TooManySegments);
        }
        if frame.hdr.len() > MAX_HDR_LEN {
            return Err(Error::TooManySegments);
        }
        self.state.lock(|rc| {
            let mut state = rc.borrow_mut();
            if state.queued >= TX_RING_COUNT - 1 {
                return Err(Error::RingFull);
            }
            let idx = state.cur;

            let hdrlen = frame.hdr.len();
            let pad = (4 - hdrlen % 4) % 4;
            let body_len: usize = frame.segs.iter().map(|s| s.len as usize).sum();
            let cmd = TxCmdGen2 {
                len: ((hdrlen + body_len) as u16).into(),
                offload_assist: (if pad != 0 { TX_CMD_OFFLD_PAD } else { 0 }).into(),
                // The rate below is authoritative and encryption was done
                // by the host.
                flags: (TX_FLAGS_CMD_RATE | TX_FLAGS_ENCRYPT_DIS).into(),
                dram_info: [0; 16],
                rate_n_flags: rate_n_flags.into(),
            };
            let hdr = CmdHeader {
                code: CMD_TX,
                flags: 0,
                idx: idx as u8,
                qid: self.qid,
            };
            let slot_off = idx * TX_SLOT_BUF_SIZE;
            let cmd_len =
                core::mem::size_of::<CmdHeader>() + core::mem::size_of::<TxCmdGen2>() + hdrlen + pad;
            let base = state.buf.paddr() + slot_off as u64;
            {
                let slot = &mut state.buf.as_mut_slice()[slot_off..slot_off + TX_SLOT_BUF_SIZE];
                slot.fill(0);
                let mut off = 0;
                slot[off..off + 4].copy_from_slice(hdr.as_bytes());
                off += 4;
                slot[off..off + core::mem::size_of::<TxCmdGen2>()].copy_from_slice(cmd.as_bytes());
                off += core::mem::size_of::<TxCmdGen2>();
                slot[off..off + hdrlen].copy_from_slice(frame.hdr);
            }

            let mut tfd = TfhTfd::zeroed();
            tfd.tbs[0] = TfhTb::new(FIRST_TB_SIZE as u16, base);
            tfd.tbs[1] = TfhTb::new((cmd_len - FIRST_TB_SIZE) as u16, base + FIRST_TB_SIZE as u64);
            let mut num_tbs = 2;
            for seg in frame.segs {
                tfd.tbs[num_tbs] = TfhTb::new(seg.len, seg.paddr);
                num_tbs += 1;
            }
            tfd.num_tbs = (num_tbs as u16).into();
            let desc_off = idx * core::mem::size_of::<TfhTfd>();
            state.desc.as_mut_slice()[desc_off..desc_off + core::mem::size_of::<TfhTfd>()]
                .copy_from_slice(tfd.as_bytes());

            state.slots[idx] = Some(TxSlot {
                cookie: frame.cookie,
            });
            state.cur = (state.cur + 1) % TX_RING_COUNT;
            state.queued += 1;
            trace!(
                "queue {}: frame {:#x} in slot {idx}, {} body bytes",
                self.qid,
                frame.cookie,
                body_len
            );
            mmio.write32(
                HBUS_TARG_WRPTR,
                TxDoorbell::new()
                    .with_qid(self.qid)
                    .with_write_index(state.cur as u16)
                    .into_bits(),
            );
            Ok(state.queued >= TX_RING_HIMARK)
        })
    }

    /// Process a completion for slot `idx`. Slots between the ring tail
    /// and `idx` whose completions never arrived are force-freed first.
    /// Returns the finished frames and whether the ring dropped back below
    /// its low water mark.
    pub fn reclaim(&self, idx: usize, acked: bool, retries: u8) -> (Vec<TxCompletion>, bool) {
        self.state.lock(|rc| {
            let mut state = rc.borrow_mut();
            let mut done = Vec::new();
            if idx >= TX_RING_COUNT || state.slots[idx].is_none() {
                return (done, false);
            }
            let mut tail = state.tail;
            while tail != idx {
                if let Some(slot) = state.slots[tail].take() {
                    debug!(
                        "queue {}: slot {tail} freed without a completion",
                        self.qid
                    );
                    done.push(TxCompletion {
                        cookie: slot.cookie,
                        acked: false,
                        retries: 0,
                    });
                    state.queued = state.queued.saturating_sub(1);
                }
                tail = (tail + 1) % TX_RING_COUNT;
            }
            if let Some(slot) = state.slots[idx].take() {
                done.push(TxCompletion {
                    cookie: slot.cookie,
                    acked,
                    retries,
                });
                state.queued = state.queued.saturating_sub(1);
            }
            state.tail = (idx + 1) % TX_RING_COUNT;
            (done, state.queued < TX_RING_LOMARK)
        })
    }

    /// Drop every queued frame. Part of device reset.
    pub fn reset(&self) -> Vec<TxCompletion> {
        self.state.lock(|rc| {
            let mut state = rc.borrow_mut();
            let mut done = Vec::new();
            for slot in state.slots.iter_mut() {
                if let Some(slot) = slot.take() {
                    done.push(TxCompletion {
                        cookie: slot.cookie,
                        acked: false,
                        retries: 0,
                    });
                }
            }
            state.cur = 0;
            state.tail = 0;
            state.queued = 0;
            done
        })
    }
}
