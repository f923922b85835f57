//! Typed views over mapped memory.
//!
//! A [`Region`] is a bounded window of mapped bytes (device registers,
//! firmware tables or DMA memory). [`Field`] and [`FieldArray`] are
//! fixed-offset typed views carved out of a region. Bounds and
//! alignment are validated once, when the view is created; every
//! later access is a single volatile load or store of exactly
//! `size_of::<T>()` bytes at the resolved address.
//!
//! ```text
//! Region [base, base+len)
//!   ├── sub(off, len)      -> Region   (nested window)
//!   ├── field::<u16>(off)  -> Field    (one register)
//!   └── array::<T>(off, n) -> FieldArray (register file / ring)
//! ```

use core::fmt;
use core::mem::{align_of, size_of};
use core::ptr::{self, NonNull};

use crate::error::{HalError, Result};

/// Values that can be moved through a register view.
///
/// # Safety
///
/// Implementors must be plain data: `Copy`, `repr(C)` or primitive,
/// and valid for every bit pattern the hardware may produce.
pub unsafe trait Register: Copy + 'static {}

unsafe impl Register for u8 {}
unsafe impl Register for u16 {}
unsafe impl Register for u32 {}
unsafe impl Register for u64 {}

/// A bounded window `[base, base + len)` of mapped memory.
#[derive(Clone)]
pub struct Region {
    base: NonNull<u8>,
    len: usize,
}

// A region is a view of memory-mapped hardware or DMA memory that the
// kernel keeps mapped for the process lifetime.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Wrap an already-mapped range.
    ///
    /// # Safety
    ///
    /// `base..base + len` must be mapped, readable and writable, and
    /// stay mapped for as long as this region or any view carved from
    /// it is alive.
    pub unsafe fn from_raw(base: NonNull<u8>, len: usize) -> Self {
        Region { base, len }
    }

    /// Length of the region in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Virtual address of the first byte.
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    fn check(&self, offset: usize, size: usize) -> Result<()> {
        match offset.checked_add(size) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(HalError::OutOfBounds {
                offset,
                size,
                limit: self.len,
            }),
        }
    }

    fn resolve(&self, offset: usize) -> NonNull<u8> {
        // SAFETY: callers check `offset <= len` first, so the result
        // stays inside (or one past) the mapped range.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) }
    }

    /// Carve a nested region `[offset, offset + len)`.
    pub fn sub(&self, offset: usize, len: usize) -> Result<Region> {
        self.check(offset, len)?;
        Ok(Region {
            base: self.resolve(offset),
            len,
        })
    }

    /// Create a register view of `T` at `offset`.
    pub fn field<T: Register>(&self, offset: usize) -> Result<Field<T>> {
        self.check(offset, size_of::<T>())?;
        let ptr = self.resolve(offset);
        if ptr.as_ptr() as usize % align_of::<T>() != 0 {
            return Err(HalError::Misaligned {
                offset,
                align: align_of::<T>(),
            });
        }
        Ok(Field { ptr: ptr.cast() })
    }

    /// Create a view of `count` consecutive `T` registers at `offset`.
    pub fn array<T: Register>(&self, offset: usize, count: usize) -> Result<FieldArray<T>> {
        let bytes = count
            .checked_mul(size_of::<T>())
            .ok_or(HalError::OutOfBounds {
                offset,
                size: usize::MAX,
                limit: self.len,
            })?;
        self.check(offset, bytes)?;
        let ptr = self.resolve(offset);
        if ptr.as_ptr() as usize % align_of::<T>() != 0 {
            return Err(HalError::Misaligned {
                offset,
                align: align_of::<T>(),
            });
        }
        Ok(FieldArray {
            ptr: ptr.cast(),
            len: count,
        })
    }

    /// Copy a `T` out of the region, without alignment requirements.
    ///
    /// Used for firmware tables, whose packed layouts put wide fields
    /// at odd offsets.
    pub fn load<T: Register>(&self, offset: usize) -> Result<T> {
        self.check(offset, size_of::<T>())?;
        // SAFETY: bounds checked above; `T: Register` is valid for any bits.
        Ok(unsafe { ptr::read_unaligned(self.resolve(offset).cast::<T>().as_ptr()) })
    }

    /// Store a `T` into the region, without alignment requirements.
    pub fn store<T: Register>(&self, offset: usize, value: T) -> Result<()> {
        self.check(offset, size_of::<T>())?;
        // SAFETY: bounds checked above.
        unsafe { ptr::write_unaligned(self.resolve(offset).cast::<T>().as_ptr(), value) };
        Ok(())
    }

    /// Copy bytes out of the region.
    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        self.check(offset, out.len())?;
        // SAFETY: bounds checked; the destination is a distinct Rust slice.
        unsafe {
            ptr::copy_nonoverlapping(self.resolve(offset).as_ptr(), out.as_mut_ptr(), out.len())
        };
        Ok(())
    }

    /// Copy bytes into the region.
    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check(offset, data.len())?;
        // SAFETY: bounds checked; the source is a distinct Rust slice.
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), self.resolve(offset).as_ptr(), data.len()) };
        Ok(())
    }

    /// Set every byte of the region to `value`.
    pub fn fill(&self, value: u8) {
        // SAFETY: the whole region is mapped by construction.
        unsafe { ptr::write_bytes(self.base.as_ptr(), value, self.len) };
    }

    /// Wrapping byte sum over the whole region (ACPI checksum rule).
    pub fn checksum(&self) -> u8 {
        (0..self.len).fold(0u8, |acc, i| {
            // SAFETY: `i < len`.
            acc.wrapping_add(unsafe { ptr::read_volatile(self.base.as_ptr().add(i)) })
        })
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("base", &self.base.as_ptr())
            .field("len", &self.len)
            .finish()
    }
}

/// A live, fixed-offset view of one hardware register.
///
/// Holds the resolved address; reads and writes go straight to the
/// hardware with volatile semantics.
#[derive(Clone, Copy)]
pub struct Field<T: Register> {
    ptr: NonNull<T>,
}

unsafe impl<T: Register> Send for Field<T> {}
unsafe impl<T: Register> Sync for Field<T> {}

impl<T: Register> Field<T> {
    /// Volatile read of the register.
    #[inline]
    pub fn read(&self) -> T {
        // SAFETY: bounds and alignment were validated by `Region::field`.
        unsafe { ptr::read_volatile(self.ptr.as_ptr()) }
    }

    /// Volatile write of the register.
    #[inline]
    pub fn write(&self, value: T) {
        // SAFETY: bounds and alignment were validated by `Region::field`.
        unsafe { ptr::write_volatile(self.ptr.as_ptr(), value) }
    }

    /// Read-modify-write.
    #[inline]
    pub fn update(&self, f: impl FnOnce(T) -> T) {
        self.write(f(self.read()));
    }

    /// Virtual address of the register.
    pub fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }
}

impl<T: Register + fmt::Debug> fmt::Debug for Field<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Field@{:#x}({:?})", self.address(), self.read())
    }
}

/// A fixed-length run of `T` registers (descriptor tables, rings).
#[derive(Clone, Copy)]
pub struct FieldArray<T: Register> {
    ptr: NonNull<T>,
    len: usize,
}

unsafe impl<T: Register> Send for FieldArray<T> {}
unsafe impl<T: Register> Sync for FieldArray<T> {}

impl<T: Register> FieldArray<T> {
    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the array is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// View of element `index`.
    pub fn at(&self, index: usize) -> Result<Field<T>> {
        if index >= self.len {
            return Err(HalError::OutOfBounds {
                offset: index.saturating_mul(size_of::<T>()),
                size: size_of::<T>(),
                limit: self.len * size_of::<T>(),
            });
        }
        // SAFETY: `index < len` and the array was validated at creation.
        Ok(Field {
            ptr: unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(index)) },
        })
    }

    /// Volatile read of element `index`.
    pub fn read(&self, index: usize) -> Result<T> {
        Ok(self.at(index)?.read())
    }

    /// Volatile write of element `index`.
    pub fn write(&self, index: usize, value: T) -> Result<()> {
        self.at(index)?.write(value);
        Ok(())
    }

    /// Virtual address of element 0.
    pub fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn region_over(buf: &mut [u64]) -> Region {
        let len = buf.len() * 8;
        unsafe { Region::from_raw(NonNull::new(buf.as_mut_ptr() as *mut u8).unwrap(), len) }
    }

    #[test]
    fn test_sub_region_bounds() {
        let mut buf = vec![0u64; 8];
        let r = region_over(&mut buf);
        assert!(r.sub(0, 64).is_ok());
        assert!(r.sub(32, 32).is_ok());
        assert_eq!(
            r.sub(40, 32).unwrap_err(),
            HalError::OutOfBounds {
                offset: 40,
                size: 32,
                limit: 64
            }
        );
        assert!(r.sub(usize::MAX, 2).is_err());
    }

    #[test]
    fn test_field_bounds_and_alignment() {
        let mut buf = vec![0u64; 2];
        let r = region_over(&mut buf);
        assert!(r.field::<u64>(8).is_ok());
        assert!(r.field::<u64>(12).is_err());
        assert!(r.field::<u8>(15).is_ok());
        assert!(r.field::<u16>(16).is_err());
        assert_eq!(
            r.field::<u32>(2).unwrap_err(),
            HalError::Misaligned { offset: 2, align: 4 }
        );
    }

    #[test]
    fn test_field_reads_and_writes_backing_memory() {
        let mut buf = vec![0u64; 2];
        let r = region_over(&mut buf);
        let lo = r.field::<u32>(0).unwrap();
        let hi = r.field::<u32>(4).unwrap();
        lo.write(0xDEAD_BEEF);
        hi.write(0x0123_4567);
        assert_eq!(r.field::<u64>(0).unwrap().read(), 0x0123_4567_DEAD_BEEF);
        lo.update(|v| v & 0xFFFF);
        assert_eq!(lo.read(), 0xBEEF);
        drop(r);
        assert_eq!(buf[0], 0x0123_4567_0000_BEEF);
    }

    #[test]
    fn test_nested_regions_resolve_absolute_addresses() {
        let mut buf = vec![0u64; 4];
        let r = region_over(&mut buf);
        let inner = r.sub(8, 16).unwrap();
        inner.field::<u16>(4).unwrap().write(0xABCD);
        assert_eq!(r.load::<u16>(12).unwrap(), 0xABCD);
        assert_eq!(inner.field::<u16>(4).unwrap().address(), r.as_ptr() as usize + 12);
        assert!(inner.field::<u64>(16).is_err());
    }

    #[test]
    fn test_unaligned_load_store() {
        let mut buf = vec![0u64; 2];
        let r = region_over(&mut buf);
        r.store::<u32>(3, 0x1122_3344).unwrap();
        assert_eq!(r.load::<u32>(3).unwrap(), 0x1122_3344);
        assert_eq!(r.load::<u8>(3).unwrap(), 0x44);
        assert!(r.load::<u64>(9).is_err());
    }

    #[test]
    fn test_array_index_checks() {
        let mut buf = vec![0u64; 2];
        let r = region_over(&mut buf);
        let a = r.array::<u16>(4, 4).unwrap();
        a.write(3, 7).unwrap();
        assert_eq!(a.read(3).unwrap(), 7);
        assert!(a.read(4).is_err());
        assert!(r.array::<u16>(4, 7).is_err());
    }

    #[test]
    fn test_checksum() {
        let mut buf = vec![0u64; 1];
        let r = region_over(&mut buf);
        r.write_bytes(0, &[1, 2, 3, 0xFA]).unwrap();
        assert_eq!(r.checksum(), 0);
    }
}
