//! Receive path: the multi-queue RX ring and the packet walk.
//!
//! The device hands back 4 KiB buffers that may hold several packets, each
//! aligned to a 64-byte stride. [PacketIter] walks one buffer and stops at
//! the first slot the firmware never wrote. Signal strength and noise
//! bookkeeping live here as well.
use core::cell::RefCell;

use alloc::vec::Vec;
use embassy_sync::blocking_mutex;
use log::trace;
use zerocopy::FromBytes;

use crate::{
    fwcmd::{
        cmd_group, wide_id, RxPacketHdr, FRAME_ALIGN, FRAME_INVALID, FRAME_SIZE_MSK,
        QID_NOTIFICATION_MSK,
    },
    hal::{DmaRegion, IwxHal, Mmio},
    regs::RFH_Q0_FRBDCB_WIDX_TRG,
    DefaultRawMutex, Result,
};

/// Entries in the RX free-buffer ring.
pub const RX_RING_COUNT: usize = 512;
/// Size of one receive buffer.
pub const RX_BUF_SIZE: usize = 4096;

/// One packet in a receive buffer.
pub struct RxPacket<'a> {
    /// Originating queue, notification bit stripped.
    pub qid: u8,
    /// Slot index on the originating queue.
    pub idx: u8,
    /// Wide command id of the packet.
    pub code: u16,
    /// True for firmware-originated notifications, false for command
    /// responses.
    pub notification: bool,
    /// Packet payload past the command header.
    pub payload: &'a [u8],
    /// The whole packet including the length word, as filed for waiters.
    pub raw: &'a [u8],
}

/// Iterator over the packets packed into one receive buffer.
pub struct PacketIter<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> PacketIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }
}

impl<'a> Iterator for PacketIter<'a> {
    type Item = RxPacket<'a>;

    fn next(&mut self) -> Option<RxPacket<'a>> {
        let remaining = self.buf.get(self.offset..)?;
        let (pkt, _) = RxPacketHdr::ref_from_prefix(remaining).ok()?;
        let len_n_flags = pkt.len_n_flags.get();
        // An unwritten slot is either still zeroed or carries the
        // tombstone pattern.
        if len_n_flags == FRAME_INVALID {
            return None;
        }
        if len_n_flags == 0 && pkt.hdr.code == 0 && pkt.hdr.idx == 0 && pkt.hdr.qid == 0 {
            return None;
        }
        let len = (len_n_flags & FRAME_SIZE_MSK) as usize;
        let total = len + 4;
        if len < core::mem::size_of::<RxPacketHdr>() - 4 || total > remaining.len() {
            return None;
        }
        let raw = &remaining[..total];
        let packet = RxPacket {
            qid: pkt.hdr.qid & !QID_NOTIFICATION_MSK,
            idx: pkt.hdr.idx,
            code: wide_id(pkt.hdr.flags & 0xf, pkt.hdr.code),
            notification: pkt.hdr.qid & QID_NOTIFICATION_MSK != 0,
            payload: &raw[core::mem::size_of::<RxPacketHdr>()..],
            raw,
        };
        self.offset += total.div_ceil(FRAME_ALIGN) * FRAME_ALIGN;
        Some(packet)
    }
}

/// Signal strength of a frame from the per-antenna energy fields, which
/// hold the negated dBm value, zero meaning "antenna unused".
pub fn signal_dbm(energy_a: u8, energy_b: u8) -> i32 {
    let a = if energy_a == 0 { -256 } else { -(energy_a as i32) };
    let b = if energy_b == 0 { -256 } else { -(energy_b as i32) };
    a.max(b)
}

/// 802.11 MAC header length from the frame control field. Data frames
/// grow with a fourth address (both DS bits) and a QoS control field.
pub fn frame_hdrlen(frame: &[u8]) -> usize {
    if frame.len() < 2 {
        return frame.len();
    }
    let fc = u16::from_le_bytes([frame[0], frame[1]]);
    match (fc >> 2) & 0x3 {
        // Control frames carry one or two addresses, never a body.
        1 => match (fc >> 4) & 0xf {
            0xa | 0xb | 0xe => 16,
            _ => 10,
        },
        2 => {
            let mut len = 24;
            if fc & 0x0300 == 0x0300 {
                len += 6;
            }
            if fc & 0x0080 != 0 {
                len += 2;
            }
            len
        }
        _ => 24,
    }
}

/// Noise floor estimate from the beacon silence measurements in a
/// statistics notification. Unmeasured antennas report zero.
pub fn noise_floor(beacon_silence_rssi: &[u32; 3]) -> i32 {
    let mut total = 0i32;
    let mut antennas = 0i32;
    for &silence in beacon_silence_rssi {
        let val = (silence & 0xff) as i32;
        if val != 0 {
            total += val;
            antennas += 1;
        }
    }
    if antennas > 0 {
        (total / antennas) - 107
    } else {
        -127
    }
}

struct RxRingState<H: IwxHal> {
    /// Free buffer descriptors: one 64-bit address per entry.
    free_desc: DmaRegion<H>,
    /// Used-buffer status written back by the device; the closed index
    /// lives in its first 16-bit word.
    status: DmaRegion<H>,
    bufs: Vec<DmaRegion<H>>,
    cur: usize,
}

/// The default receive queue.
pub struct RxRing<H: IwxHal> {
    state: blocking_mutex::Mutex<DefaultRawMutex, RefCell<RxRingState<H>>>,
}

impl<H: IwxHal> RxRing<H> {
    pub fn new() -> Result<Self> {
        let free_desc = DmaRegion::zeroed(RX_RING_COUNT * 8, 256)?;
        let status = DmaRegion::zeroed(16, 16)?;
        let mut bufs = Vec::with_capacity(RX_RING_COUNT);
        for _ in 0..RX_RING_COUNT {
            bufs.push(DmaRegion::zeroed(RX_BUF_SIZE, 256)?);
        }
        let ring = Self {
            state: blocking_mutex::Mutex::new(RefCell::new(RxRingState {
                free_desc,
                status,
                bufs,
                cur: 0,
            })),
        };
        ring.state.lock(|rc| {
            let mut state = rc.borrow_mut();
            for i in 0..RX_RING_COUNT {
                let paddr = state.bufs[i].paddr();
                state.free_desc.as_mut_slice()[i * 8..i * 8 + 8]
                    .copy_from_slice(&paddr.to_le_bytes());
            }
        });
        Ok(ring)
    }

    pub fn desc_paddr(&self) -> u64 {
        self.state.lock(|rc| rc.borrow().free_desc.paddr())
    }

    pub fn status_paddr(&self) -> u64 {
        self.state.lock(|rc| rc.borrow().status.paddr())
    }

    /// Index after the last buffer the device has filled.
    pub fn closed_index(&self) -> usize {
        self.state.lock(|rc| {
            let state = rc.borrow();
            let status = state.status.as_slice();
            (u16::from_le_bytes([status[0], status[1]]) as usize & 0xfff) % RX_RING_COUNT
        })
    }

    pub fn current_index(&self) -> usize {
        self.state.lock(|rc| rc.borrow().cur)
    }

    /// Take the filled buffer at `idx`, replacing it with a fresh one so
    /// the slot is immediately usable by the device again.
    pub fn exchange(&self, idx: usize) -> Result<DmaRegion<H>> {
        let fresh = DmaRegion::zeroed(RX_BUF_SIZE, 256)?;
        Ok(self.state.lock(|rc| {
            let mut state = rc.borrow_mut();
            let paddr = fresh.paddr();
            let full = core::mem::replace(&mut state.bufs[idx], fresh);
            state.free_desc.as_mut_slice()[idx * 8..idx * 8 + 8]
                .copy_from_slice(&paddr.to_le_bytes());
            state.cur = (idx + 1) % RX_RING_COUNT;
            full
        }))
    }

    /// Publish the refilled slots back to the device.
    pub fn restock(&self, mmio: &impl Mmio) {
        let cur = self.current_index();
        let hw = if cur == 0 { RX_RING_COUNT - 1 } else { cur - 1 };
        // The device requires the write index in multiples of eight.
        trace!("restocking RX ring, write index {hw}");
        mmio.write32(RFH_Q0_FRBDCB_WIDX_TRG, (hw & !7) as u32);
    }

    #[cfg(test)]
    pub(crate) fn fake_fill(&self, idx: usize, data: &[u8]) {
        self.state.lock(|rc| {
            let mut state = rc.borrow_mut();
            state.bufs[idx].as_mut_slice()[..data.len()].copy_from_slice(data);
            let closed = ((idx + 1) % RX_RING_COUNT) as u16;
            state.status.as_mut_slice()[..2].copy_from_slice(&closed.to_le_bytes());
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fwcmd::{CMD_RX_MPDU, CMD_SCAN_COMPLETE_UMAC},
        testutil::{respond, MockMmio, TestHal},
    };
    use alloc::vec;

    fn packed_buffer(pkts: &[Vec<u8>]) -> Vec<u8> {
        let mut buf = Vec::new();
        for pkt in pkts {
            buf.extend_from_slice(pkt);
            while buf.len() % FRAME_ALIGN != 0 {
                buf.push(0);
            }
        }
        buf.resize(RX_BUF_SIZE, 0);
        buf
    }

    #[test]
    fn iterator_walks_packed_packets() {
        let buf = packed_buffer(&[
            respond(CMD_RX_MPDU, 0, QID_NOTIFICATION_MSK, &[0x11; 90]),
            respond(CMD_SCAN_COMPLETE_UMAC, 3, QID_NOTIFICATION_MSK, &[0x22; 8]),
            respond(CMD_RX_MPDU, 1, 0, &[0x33; 10]),
        ]);
        let pkts: Vec<_> = PacketIter::new(&buf).collect();
        assert_eq!(pkts.len(), 3);
        assert_eq!(pkts[0].code, CMD_RX_MPDU as u16);
        assert!(pkts[0].notification);
        assert_eq!(pkts[0].payload, &[0x11; 90]);
        assert_eq!(pkts[1].idx, 3);
        assert_eq!(pkts[1].payload.len(), 8);
        assert!(!pkts[2].notification);
        assert_eq!(pkts[2].qid, 0);
    }

    #[test]
    fn iterator_stops_at_tombstone_and_zero() {
        let mut buf = packed_buffer(&[respond(CMD_RX_MPDU, 0, QID_NOTIFICATION_MSK, &[1, 2, 3, 4])]);
        buf[FRAME_ALIGN..FRAME_ALIGN + 4].copy_from_slice(&FRAME_INVALID.to_le_bytes());
        assert_eq!(PacketIter::new(&buf).count(), 1);

        let buf = packed_buffer(&[]);
        assert_eq!(PacketIter::new(&buf).count(), 0);
    }

    #[test]
    fn iterator_rejects_overlong_length() {
        let mut pkt = respond(CMD_RX_MPDU, 0, 0, &[0u8; 4]);
        let bogus = (FRAME_SIZE_MSK - 1).to_le_bytes();
        pkt[..4].copy_from_slice(&bogus);
        let buf = packed_buffer(&[pkt]);
        assert_eq!(PacketIter::new(&buf).count(), 0);
    }

    #[test]
    fn signal_strength_prefers_the_stronger_antenna() {
        assert_eq!(signal_dbm(40, 60), -40);
        assert_eq!(signal_dbm(0, 60), -60);
        assert_eq!(signal_dbm(0, 0), -256);
    }

    #[test]
    fn header_length_follows_frame_control() {
        // Management (beacon) and plain data.
        assert_eq!(frame_hdrlen(&[0x80, 0x00, 0, 0]), 24);
        assert_eq!(frame_hdrlen(&[0x08, 0x00, 0, 0]), 24);
        // QoS data, QoS data with both DS bits set.
        assert_eq!(frame_hdrlen(&[0x88, 0x01, 0, 0]), 26);
        assert_eq!(frame_hdrlen(&[0x88, 0x03, 0, 0]), 32);
        // RTS and ACK control frames.
        assert_eq!(frame_hdrlen(&[0xb4, 0x00]), 16);
        assert_eq!(frame_hdrlen(&[0xd4, 0x00]), 10);
        assert_eq!(frame_hdrlen(&[0x80]), 1);
    }

    #[test]
    fn noise_floor_averages_active_antennas() {
        assert_eq!(noise_floor(&[50, 60, 0]), 55 - 107);
        assert_eq!(noise_floor(&[0, 0, 0]), -127);
    }

    #[test]
    fn exchange_refills_the_slot() {
        let ring = RxRing::<TestHal>::new().unwrap();
        let pkt = respond(CMD_RX_MPDU, 0, QID_NOTIFICATION_MSK, &[0xaa; 16]);
        ring.fake_fill(0, &packed_buffer(&[pkt]));
        assert_eq!(ring.closed_index(), 1);

        let full = ring.exchange(0).unwrap();
        assert_eq!(PacketIter::new(full.as_slice()).count(), 1);
        ring.state.lock(|rc| {
            let state = rc.borrow();
            // The descriptor now points at the fresh buffer.
            let desc = u64::from_le_bytes(state.free_desc.as_slice()[..8].try_into().unwrap());
            assert_eq!(desc, state.bufs[0].paddr());
            assert!(state.bufs[0].as_slice().iter().all(|&b| b == 0));
        });

        let mmio = MockMmio::new();
        ring.restock(&mmio);
        assert_eq!(mmio.get(RFH_Q0_FRBDCB_WIDX_TRG), 0);

        // After eight slots the hardware index moves.
        for i in 1..=8 {
            let pkt = respond(CMD_RX_MPDU, 0, QID_NOTIFICATION_MSK, &[0xbb; 8]);
            ring.fake_fill(i, &packed_buffer(&[pkt]));
            ring.exchange(i).unwrap();
        }
        ring.restock(&mmio);
        assert_eq!(mmio.get(RFH_Q0_FRBDCB_WIDX_TRG), 8);
    }
}
