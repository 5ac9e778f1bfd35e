//! Register map and low level device access.
//!
//! Covers the CSR block the driver core uses, the indirect periphery
//! register window, and the ref-counted MAC clock request that keeps the
//! device awake while the host is accessing it.
use bitfield_struct::bitfield;
use portable_atomic::{AtomicU32, Ordering};

use crate::{hal::Mmio, Error, Result};

pub const CSR_HW_IF_CONFIG: u32 = 0x000;
pub const CSR_INT: u32 = 0x008;
pub const CSR_INT_MASK: u32 = 0x00c;
pub const CSR_RESET: u32 = 0x020;
pub const CSR_GP_CNTRL: u32 = 0x024;
pub const CSR_HW_REV: u32 = 0x028;
pub const CSR_FUNC_SCRATCH: u32 = 0x02c;
pub const CSR_CTXT_INFO_ADDR: u32 = 0x118;

pub const CSR_RESET_SW_RESET: u32 = 1 << 7;

pub const CSR_GP_CNTRL_MAC_CLOCK_READY: u32 = 1 << 0;
pub const CSR_GP_CNTRL_INIT_DONE: u32 = 1 << 2;
pub const CSR_GP_CNTRL_MAC_ACCESS_REQ: u32 = 1 << 3;
pub const CSR_GP_CNTRL_GOING_TO_SLEEP: u32 = 1 << 4;
pub const CSR_GP_CNTRL_HW_RF_KILL_SW: u32 = 1 << 27;

pub const CSR_INT_ALIVE: u32 = 1 << 0;
pub const CSR_INT_WAKEUP: u32 = 1 << 1;
pub const CSR_INT_SW_RX: u32 = 1 << 3;
pub const CSR_INT_CT_KILL: u32 = 1 << 6;
pub const CSR_INT_RF_KILL: u32 = 1 << 7;
pub const CSR_INT_SW_ERR: u32 = 1 << 25;
pub const CSR_INT_FH_TX: u32 = 1 << 27;
pub const CSR_INT_HW_ERR: u32 = 1 << 29;
pub const CSR_INT_FH_RX: u32 = 1 << 31;

/// Transmit ring doorbell.
pub const HBUS_TARG_WRPTR: u32 = 0x460;

/// Layout of the value written to [HBUS_TARG_WRPTR].
#[bitfield(u32)]
pub struct TxDoorbell {
    pub write_index: u16,
    pub qid: u8,
    #[bits(8)]
    __: u8,
}
pub const HBUS_TARG_PRPH_WADDR: u32 = 0x444;
pub const HBUS_TARG_PRPH_WDAT: u32 = 0x448;
pub const HBUS_TARG_PRPH_RADDR: u32 = 0x44c;
pub const HBUS_TARG_PRPH_RDAT: u32 = 0x450;

/// RX free-buffer write index doorbell, default queue.
pub const RFH_Q0_FRBDCB_WIDX_TRG: u32 = 0x1c80;

/// Periphery space: init-time CPU kick and the OTP copy of the MAC address.
pub const UREG_CPU_INIT_RUN: u32 = 0xa05c44;
pub const WFMP_MAC_ADDR_0: u32 = 0xa03080;
pub const WFMP_MAC_ADDR_1: u32 = 0xa03084;

const PRPH_READ_ENABLE: u32 = 3 << 24;

/// Bounded register access on top of [Mmio], plus the shared MAC access
/// refcount. Cheap to construct; the driver builds one per call site.
pub struct Nic<'a, M: Mmio> {
    mmio: &'a M,
    locks: &'a AtomicU32,
}

impl<'a, M: Mmio> Nic<'a, M> {
    pub fn new(mmio: &'a M, locks: &'a AtomicU32) -> Self {
        Self { mmio, locks }
    }

    pub fn read32(&self, reg: u32) -> u32 {
        self.mmio.read32(reg)
    }

    pub fn write32(&self, reg: u32, val: u32) {
        self.mmio.write32(reg, val)
    }

    pub fn set_bits(&self, reg: u32, bits: u32) {
        self.write32(reg, self.read32(reg) | bits);
    }

    pub fn clear_bits(&self, reg: u32, bits: u32) {
        self.write32(reg, self.read32(reg) & !bits);
    }

    /// Spin until `reg & mask == bits`, for at most `spins` reads.
    pub fn poll_bits(&self, reg: u32, bits: u32, mask: u32, spins: u32) -> Result<()> {
        for _ in 0..spins {
            if self.read32(reg) & mask == bits {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(Error::Timeout)
    }

    /// Request the MAC clock and hold it until the guard drops.
    ///
    /// The request is ref-counted; only the first acquisition touches the
    /// device and only the last release drops the request bit.
    pub fn lock(&self) -> Result<NicLock<'a, M>> {
        if self.locks.fetch_add(1, Ordering::AcqRel) == 0 {
            self.set_bits(CSR_GP_CNTRL, CSR_GP_CNTRL_MAC_ACCESS_REQ);
            if self
                .poll_bits(
                    CSR_GP_CNTRL,
                    CSR_GP_CNTRL_MAC_CLOCK_READY,
                    CSR_GP_CNTRL_MAC_CLOCK_READY | CSR_GP_CNTRL_GOING_TO_SLEEP,
                    150_000,
                )
                .is_err()
            {
                self.locks.fetch_sub(1, Ordering::AcqRel);
                self.clear_bits(CSR_GP_CNTRL, CSR_GP_CNTRL_MAC_ACCESS_REQ);
                return Err(Error::NicLock);
            }
        }
        Ok(NicLock {
            mmio: self.mmio,
            locks: self.locks,
        })
    }
}

/// Proof of MAC clock ownership. Grants indirect periphery access.
pub struct NicLock<'a, M: Mmio> {
    mmio: &'a M,
    locks: &'a AtomicU32,
}

impl<M: Mmio> NicLock<'_, M> {
    pub fn read_prph(&self, addr: u32) -> u32 {
        self.mmio
            .write32(HBUS_TARG_PRPH_RADDR, (addr & 0x000f_ffff) | PRPH_READ_ENABLE);
        self.mmio.read32(HBUS_TARG_PRPH_RDAT)
    }

    pub fn write_prph(&self, addr: u32, val: u32) {
        self.mmio
            .write32(HBUS_TARG_PRPH_WADDR, (addr & 0x000f_ffff) | PRPH_READ_ENABLE);
        self.mmio.write32(HBUS_TARG_PRPH_WDAT, val);
    }
}

impl<M: Mmio> Drop for NicLock<'_, M> {
    fn drop(&mut self) {
        if self.locks.fetch_sub(1, Ordering::AcqRel) == 1 {
            let val = self.mmio.read32(CSR_GP_CNTRL);
            self.mmio
                .write32(CSR_GP_CNTRL, val & !CSR_GP_CNTRL_MAC_ACCESS_REQ);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockMmio;

    #[test]
    fn nic_lock_is_refcounted() {
        let mmio = MockMmio::new();
        // Report the clock as ready immediately.
        mmio.preset(CSR_GP_CNTRL, CSR_GP_CNTRL_MAC_CLOCK_READY);
        let locks = AtomicU32::new(0);
        let nic = Nic::new(&mmio, &locks);

        let outer = nic.lock().unwrap();
        assert_ne!(mmio.get(CSR_GP_CNTRL) & CSR_GP_CNTRL_MAC_ACCESS_REQ, 0);
        let inner = nic.lock().unwrap();
        drop(inner);
        // Still held by the outer guard.
        assert_ne!(mmio.get(CSR_GP_CNTRL) & CSR_GP_CNTRL_MAC_ACCESS_REQ, 0);
        drop(outer);
        assert_eq!(mmio.get(CSR_GP_CNTRL) & CSR_GP_CNTRL_MAC_ACCESS_REQ, 0);
    }

    #[test]
    fn lock_fails_when_clock_never_comes_up() {
        let mmio = MockMmio::new();
        let locks = AtomicU32::new(0);
        let nic = Nic::new(&mmio, &locks);
        assert!(matches!(nic.lock(), Err(Error::NicLock)));
        assert_eq!(locks.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn prph_access_goes_through_the_window() {
        let mmio = MockMmio::new();
        mmio.preset(CSR_GP_CNTRL, CSR_GP_CNTRL_MAC_CLOCK_READY);
        let locks = AtomicU32::new(0);
        let nic = Nic::new(&mmio, &locks);
        let lock = nic.lock().unwrap();
        lock.write_prph(WFMP_MAC_ADDR_0, 0xdead_beef);
        assert_eq!(
            mmio.get(HBUS_TARG_PRPH_WADDR),
            (WFMP_MAC_ADDR_0 & 0x000f_ffff) | (3 << 24)
        );
        assert_eq!(mmio.get(HBUS_TARG_PRPH_WDAT), 0xdead_beef);
    }
}
