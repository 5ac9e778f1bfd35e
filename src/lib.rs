#![no_std]
//! A host-side driver core for Intel iwx-family PCIe Wi-Fi adapters.
//!
//! The crate covers everything between the bus and the host's 802.11
//! stack: firmware image parsing and load, the host command ring, the
//! DMA receive and transmit rings, NVM reading, and the state machine
//! that walks a station association through the firmware's context
//! ladder.
//!
//! ## Integration
//! The crate is platform agnostic. An integrator provides two traits:
//! [Mmio] for 32-bit register access to the device's BAR, and [IwxHal]
//! for DMA-capable memory. Everything else is host memory and async
//! executors; [embassy_time] supplies timeouts, so a time driver must be
//! present.
//!
//! ## Structure
//! [IwxDriver] owns the rings and the link state machine and is the only
//! type most integrators touch. `handle_interrupt` is the cheap top half
//! to call from the interrupt context; `process_rx` is the bottom half
//! that drains the receive ring and dispatches firmware packets. The
//! [CommandLink] trait is the seam between command producers and the
//! ring, which keeps the NVM reader and the link state machine testable
//! against a scripted firmware.
extern crate alloc;
#[cfg(test)]
extern crate std;

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(feature = "critical_section")] {
        pub(crate) type DefaultRawMutex = embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
    } else {
        pub(crate) type DefaultRawMutex = embassy_sync::blocking_mutex::raw::NoopRawMutex;
    }
}

pub mod cmd;
pub mod driver;
pub mod fw;
pub mod fwcmd;
pub mod hal;
pub mod link;
pub mod nvm;
pub mod rates;
pub mod regs;
pub mod rx;
pub mod sync;
#[cfg(test)]
pub(crate) mod testutil;
pub mod tx;

pub use cmd::{CommandLink, HostCmd, RespPacket};
pub use driver::{DeviceEvent, IwxDriver};
pub use fw::{FwImage, UcodeType};
pub use hal::{DmaRegion, IwxHal, Mmio};
pub use link::{LinkCaps, LinkConfig, LinkState, LinkStateMachine};
pub use nvm::{Channel, NvmData};
pub use tx::{OutFrame, TxCompletion, TxSeg};

/// Errors returned by the driver core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A DMA allocation failed.
    NoMemory,
    /// A register poll ran out of spins.
    Timeout,
    /// The MAC clock never came up while requesting device access.
    NicLock,
    /// The radio is disabled by the kill switch.
    RadioKilled,
    /// The firmware reported a fatal condition.
    HwError,
    /// A firmware image record is malformed; carries the record type.
    FirmwareFormat(u32),
    /// The firmware image ends mid-structure.
    FirmwareTooShort,
    /// An NVM read failed or returned inconsistent data.
    NvmRead,
    /// A mandatory NVM section is absent; carries the section id.
    NvmMissingSection(u16),
    /// The next command slot is still owned by a timed-out command.
    CommandSlotBusy,
    /// The command payload exceeds what a single slot can carry.
    CommandTooLarge,
    /// The firmware never answered a synchronous command.
    CommandTimeout,
    /// The device was reset while the operation was in flight.
    DeviceReset,
    /// The firmware rejected the request; carries its status code.
    DeviceRejected(u32),
    /// A response packet is missing or does not parse.
    BadResponse,
    /// The transmit ring has no free slot.
    RingFull,
    /// The frame body has more fragments than a descriptor can point at.
    TooManySegments,
}

pub type Result<T> = core::result::Result<T, Error>;
