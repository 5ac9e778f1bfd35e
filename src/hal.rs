//! Host-environment traits.
//!
//! The driver core never touches PCI config space, interrupt controllers or
//! the platform allocator directly. Everything it needs from the host is
//! expressed through the two traits in this module, which keeps the core
//! testable against mock implementations.
use core::{marker::PhantomData, ptr::NonNull};

use crate::{Error, Result};

/// Access to the adapter's memory-mapped register file.
///
/// Offsets are byte offsets into BAR0. Implementations must perform real
/// 32-bit volatile accesses; the device decodes register width.
pub trait Mmio {
    /// Read a 32-bit register.
    fn read32(&self, offset: u32) -> u32;
    /// Write a 32-bit register.
    fn write32(&self, offset: u32, val: u32);
}

/// Platform DMA allocator.
///
/// Regions handed out must be physically contiguous, cache-coherent (or
/// cache-inhibited) and keep a stable virtual/physical address pair until
/// deallocated. Sizes range from tens of bytes (response buffers) to
/// hundreds of kilobytes (firmware sections).
pub trait IwxHal {
    /// Allocate a DMA-capable region. Returns the physical address and a
    /// pointer to the mapped memory, or [None] if the platform is out of
    /// suitable memory.
    fn dma_alloc(len: usize, align: usize) -> Option<(u64, NonNull<u8>)>;
    /// Release a region previously returned by [Self::dma_alloc].
    ///
    /// # Safety
    /// The arguments must come from a single `dma_alloc` call and the
    /// region must not be used afterwards.
    unsafe fn dma_dealloc(paddr: u64, ptr: NonNull<u8>, len: usize, align: usize);
}

/// An owned, physically-contiguous DMA region.
///
/// The virtual/physical pair is fixed for the lifetime of the value and the
/// backing memory is released exactly once, on drop.
pub struct DmaRegion<H: IwxHal> {
    ptr: NonNull<u8>,
    paddr: u64,
    len: usize,
    align: usize,
    _hal: PhantomData<H>,
}

impl<H: IwxHal> DmaRegion<H> {
    /// Allocate a zeroed region of `len` bytes.
    pub fn zeroed(len: usize, align: usize) -> Result<Self> {
        let (paddr, ptr) = H::dma_alloc(len, align).ok_or(Error::NoMemory)?;
        // The allocator contract does not promise zeroed memory.
        unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0, len) };
        Ok(Self {
            ptr,
            paddr,
            len,
            align,
            _hal: PhantomData,
        })
    }
    /// The region's physical (bus) address.
    pub fn paddr(&self) -> u64 {
        self.paddr
    }
    /// The region's length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }
    /// Whether the region is zero-sized.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    /// Borrow the region's memory.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
    /// Mutably borrow the region's memory.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<H: IwxHal> Drop for DmaRegion<H> {
    fn drop(&mut self) {
        unsafe { H::dma_dealloc(self.paddr, self.ptr, self.len, self.align) };
    }
}

// The region is plain memory; the single-writer discipline is enforced by
// the rings that own it.
unsafe impl<H: IwxHal> Send for DmaRegion<H> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestHal;

    #[test]
    fn region_is_zeroed_and_stable() {
        let mut region = DmaRegion::<TestHal>::zeroed(64, 16).unwrap();
        assert_eq!(region.len(), 64);
        assert!(region.as_slice().iter().all(|&b| b == 0));
        let paddr = region.paddr();
        region.as_mut_slice()[0] = 0xa5;
        assert_eq!(region.paddr(), paddr);
        assert_eq!(region.as_slice()[0], 0xa5);
    }
}
