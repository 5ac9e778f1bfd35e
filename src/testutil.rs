//! Shared fixtures: a register file backed by a map, a host allocator
//! backed by the global allocator, and a scripted command link.
use core::cell::RefCell;
use core::ptr::NonNull;

use alloc::{boxed::Box, collections::BTreeMap, vec::Vec};
use portable_atomic::{AtomicU32, Ordering};

use crate::{
    cmd::{CommandLink, HostCmd, RespPacket, CMD_WANT_RESP},
    fwcmd::cmd_opcode,
    hal::{IwxHal, Mmio},
    Result,
};

/// A register file that remembers every write and hands back presets.
pub struct MockMmio {
    regs: RefCell<BTreeMap<u32, u32>>,
}

impl MockMmio {
    pub fn new() -> Self {
        Self {
            regs: RefCell::new(BTreeMap::new()),
        }
    }

    pub fn preset(&self, reg: u32, val: u32) {
        self.regs.borrow_mut().insert(reg, val);
    }

    pub fn get(&self, reg: u32) -> u32 {
        self.regs.borrow().get(&reg).copied().unwrap_or(0)
    }
}

impl Mmio for MockMmio {
    fn read32(&self, offset: u32) -> u32 {
        self.get(offset)
    }
    fn write32(&self, offset: u32, val: u32) {
        self.regs.borrow_mut().insert(offset, val);
    }
}

/// Host allocator delegating to the global allocator; the "physical"
/// address is simply the pointer value.
pub struct TestHal;

impl IwxHal for TestHal {
    fn dma_alloc(len: usize, align: usize) -> Option<(u64, NonNull<u8>)> {
        let layout = core::alloc::Layout::from_size_align(len.max(1), align.max(8)).ok()?;
        let ptr = unsafe { alloc::alloc::alloc(layout) };
        let ptr = NonNull::new(ptr)?;
        Some((ptr.as_ptr() as u64, ptr))
    }

    unsafe fn dma_dealloc(_paddr: u64, ptr: NonNull<u8>, len: usize, align: usize) {
        let layout = core::alloc::Layout::from_size_align(len.max(1), align.max(8)).unwrap();
        alloc::alloc::dealloc(ptr.as_ptr(), layout)
    }
}

/// Build a response packet the way the device lays it out: length word,
/// command header, payload.
pub fn respond(code: u8, idx: u8, qid: u8, payload: &[u8]) -> Vec<u8> {
    let mut pkt = Vec::new();
    pkt.extend_from_slice(&((payload.len() as u32) + 4).to_le_bytes());
    pkt.push(code);
    pkt.push(0); // flags
    pkt.push(idx);
    pkt.push(qid);
    pkt.extend_from_slice(payload);
    pkt
}

type Responder = Box<dyn Fn(u16, &[u8]) -> Result<Vec<u8>>>;

/// A command link whose firmware side is a closure mapping (command id,
/// payload) to a response payload.
pub struct ScriptedLink {
    responder: Responder,
    /// Every command sent, in order.
    pub sent: RefCell<Vec<(u16, Vec<u8>)>>,
    /// Simulate a device reset right before this command id is handled.
    pub reset_on: core::cell::Cell<Option<u16>>,
    generation: AtomicU32,
}

impl ScriptedLink {
    pub fn new(responder: impl Fn(u16, &[u8]) -> Result<Vec<u8>> + 'static) -> Self {
        Self {
            responder: Box::new(responder),
            sent: RefCell::new(Vec::new()),
            reset_on: core::cell::Cell::new(None),
            generation: AtomicU32::new(0),
        }
    }

    pub fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn sent_ids(&self) -> Vec<u16> {
        self.sent.borrow().iter().map(|(id, _)| *id).collect()
    }
}

impl CommandLink for ScriptedLink {
    async fn send_cmd(&self, cmd: HostCmd<'_>) -> Result<Option<RespPacket>> {
        let mut payload = Vec::new();
        for frag in cmd.data {
            payload.extend_from_slice(frag);
        }
        self.sent.borrow_mut().push((cmd.id, payload.clone()));
        if self.reset_on.get() == Some(cmd.id) {
            self.reset_on.set(None);
            self.bump_generation();
        }
        let resp = (self.responder)(cmd.id, &payload)?;
        if cmd.flags & CMD_WANT_RESP != 0 {
            let pkt = respond(cmd_opcode(cmd.id), 0, 0, &resp);
            Ok(Some(RespPacket::new(pkt)?))
        } else {
            Ok(None)
        }
    }

    fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }
}
