//! Physical memory services consumed by the HAL.
//!
//! The kernel owns page tables and the frame allocator; the HAL only
//! asks it to map device windows and to hand out physically contiguous
//! DMA memory.

use core::fmt;

use crate::error::Result;
use crate::mmio::Region;

/// Mapping and DMA allocation, provided by the kernel memory manager.
pub trait MemoryServices: Send + Sync {
    /// Map `len` bytes at physical address `phys` (uncached for MMIO).
    fn map(&self, phys: u64, len: usize) -> Result<Region>;

    /// Allocate `len` bytes of zeroed, physically contiguous memory
    /// that stays resident until handed back through `free_dma`.
    fn allocate_dma(&self, len: usize) -> Result<DmaBuffer>;

    /// Return a buffer obtained from `allocate_dma`.
    fn free_dma(&self, buffer: DmaBuffer);
}

/// A physically contiguous buffer visible to devices.
///
/// Not `Clone`: exactly one owner may hand the buffer to a device or
/// back to the allocator.
pub struct DmaBuffer {
    region: Region,
    phys: u64,
}

impl DmaBuffer {
    /// Pair a mapped region with its physical address.
    ///
    /// # Safety
    ///
    /// `region` must map exactly the physical range starting at `phys`,
    /// and that range must be contiguous.
    pub unsafe fn new(region: Region, phys: u64) -> Self {
        DmaBuffer { region, phys }
    }

    /// CPU view of the buffer.
    pub fn region(&self) -> &Region {
        &self.region
    }

    /// Device-visible address of the first byte.
    pub fn phys(&self) -> u64 {
        self.phys
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.region.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }

    /// Copy out the contents.
    pub fn read(&self, out: &mut [u8]) -> Result<()> {
        self.region.read_bytes(0, out)
    }

    /// Overwrite the start of the buffer.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        self.region.write_bytes(0, data)
    }
}

impl fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("phys", &format_args!("{:#x}", self.phys))
            .field("len", &self.len())
            .finish()
    }
}

/// Round `value` up to a multiple of `align` (a power of two).
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 4096), 0);
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_up(4166, 4), 4168);
    }
}
