//! Access to physical memory through the kernel's direct map.
//!
//! The kernel keeps every physical frame mapped at a fixed offset in its own address
//! space. Everything in this crate that has to touch the contents of a frame (the
//! allocator bitmap, page-table nodes, loaded segments) goes through a [`DirectMap`]
//! instead of doing the offset arithmetic itself, so the same code runs against real
//! memory and against an [`EmulatedMemory`] buffer in tests.

use crate::{PAGE_SIZE, PhysicalAddress};

/// Translates physical addresses into pointers the kernel can dereference.
pub trait DirectMap {
    /// Returns a pointer to the byte at `phys` in the direct map.
    fn phys_to_ptr(&self, phys: PhysicalAddress) -> *mut u8;

    /// Fills `count` frames starting at `base` with zeros.
    fn zero_frames(&self, base: PhysicalAddress, count: usize) {
        // SAFETY: implementors guarantee the direct map covers the frame range handed
        // out by the frame allocator.
        unsafe { core::ptr::write_bytes(self.phys_to_ptr(base), 0, count * PAGE_SIZE) }
    }

    /// Copies `bytes` into physical memory starting at `phys`.
    fn copy_to(&self, phys: PhysicalAddress, bytes: &[u8]) {
        // SAFETY: the destination lies in frames owned by the caller and cannot overlap
        // a borrowed host slice.
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.phys_to_ptr(phys), bytes.len())
        }
    }

    /// Reads the 64-bit little-endian word at `phys`, which must be 8-byte aligned.
    fn read_u64(&self, phys: PhysicalAddress) -> u64 {
        debug_assert!(phys.is_aligned(8), "unaligned page table access");
        // SAFETY: page-table nodes are whole frames reachable through the direct map.
        unsafe { u64::from_le(core::ptr::read_volatile(self.phys_to_ptr(phys).cast::<u64>())) }
    }

    /// Writes the 64-bit little-endian word at `phys`, which must be 8-byte aligned.
    fn write_u64(&self, phys: PhysicalAddress, value: u64) {
        debug_assert!(phys.is_aligned(8), "unaligned page table access");
        // SAFETY: see `read_u64`.
        unsafe {
            core::ptr::write_volatile(self.phys_to_ptr(phys).cast::<u64>(), value.to_le())
        }
    }
}

impl<D: DirectMap + ?Sized> DirectMap for &D {
    fn phys_to_ptr(&self, phys: PhysicalAddress) -> *mut u8 {
        (**self).phys_to_ptr(phys)
    }
}

/// Hardware direct map: physical memory appears at a fixed virtual offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetDirectMap {
    offset: usize,
}

impl OffsetDirectMap {
    /// Creates a direct map at the given offset, as reported by the boot protocol.
    pub const fn new(offset: usize) -> Self {
        Self { offset }
    }

    pub const fn offset(&self) -> usize {
        self.offset
    }
}

impl DirectMap for OffsetDirectMap {
    fn phys_to_ptr(&self, phys: PhysicalAddress) -> *mut u8 {
        phys.as_usize().wrapping_add(self.offset) as *mut u8
    }
}

#[cfg(any(test, feature = "software-emulation"))]
pub use emulated::EmulatedMemory;

#[cfg(any(test, feature = "software-emulation"))]
mod emulated {
    use std::boxed::Box;
    use std::cell::UnsafeCell;

    use super::DirectMap;
    use crate::{PAGE_SIZE, PhysicalAddress};

    #[repr(C, align(4096))]
    struct Page(UnsafeCell<[u8; PAGE_SIZE]>);

    /// Emulated physical memory for host-side testing.
    ///
    /// Backs the physical range `[base, base + len)` with page-aligned host memory,
    /// zero-filled on creation. Translating an address outside that range panics.
    pub struct EmulatedMemory {
        base: PhysicalAddress,
        pages: Box<[Page]>,
    }

    // SAFETY: the pages are plain bytes; callers synchronize the way they would on
    // real physical memory (the frame allocator lock, one owner per address space).
    unsafe impl Sync for EmulatedMemory {}

    impl EmulatedMemory {
        /// Creates emulated memory covering `[base, base + len)`.
        ///
        /// # Panics
        ///
        /// Panics if `base` or `len` is not page-aligned.
        pub fn new(base: PhysicalAddress, len: usize) -> Self {
            assert!(base.is_aligned(PAGE_SIZE), "emulated memory base must be page-aligned");
            assert!(len % PAGE_SIZE == 0, "emulated memory length must be page-aligned");
            let pages = (0..len / PAGE_SIZE)
                .map(|_| Page(UnsafeCell::new([0; PAGE_SIZE])))
                .collect();
            Self { base, pages }
        }

        pub fn base(&self) -> PhysicalAddress {
            self.base
        }

        /// Returns the size of the emulated region in bytes.
        pub fn size(&self) -> usize {
            self.pages.len() * PAGE_SIZE
        }

        /// Copies `len` bytes out of emulated memory starting at `phys`.
        pub fn read(&self, phys: PhysicalAddress, len: usize) -> Vec<u8> {
            let mut out = vec![0u8; len];
            // SAFETY: `phys_to_ptr` checks that `phys` is inside the buffer; the
            // range end is checked below.
            unsafe {
                let src = self.phys_to_ptr(phys);
                assert!(phys.as_usize() + len <= self.base.as_usize() + self.size());
                core::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), len);
            }
            out
        }
    }

    impl DirectMap for EmulatedMemory {
        fn phys_to_ptr(&self, phys: PhysicalAddress) -> *mut u8 {
            let offset = phys
                .as_usize()
                .checked_sub(self.base.as_usize())
                .filter(|offset| *offset < self.size())
                .unwrap_or_else(|| panic!("{phys:?} is outside emulated memory"));
            // SAFETY: the pages are contiguous and `offset` is below their total size.
            // Writes go through the `UnsafeCell` in each page.
            unsafe {
                let first = self.pages.as_ptr().cast::<UnsafeCell<[u8; PAGE_SIZE]>>();
                UnsafeCell::raw_get(first).cast::<u8>().add(offset)
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn translates_inside_range() {
            let memory = EmulatedMemory::new(PhysicalAddress::new(0x100000), 2 * PAGE_SIZE);
            memory.copy_to(PhysicalAddress::new(0x100ffe), &[1, 2, 3, 4]);
            assert_eq!(memory.read(PhysicalAddress::new(0x100ffe), 4), vec![1, 2, 3, 4]);
        }

        #[test]
        fn words_round_trip() {
            let memory = EmulatedMemory::new(PhysicalAddress::new(0), PAGE_SIZE);
            memory.write_u64(PhysicalAddress::new(8), 0x8000_0000_0020_0007);
            assert_eq!(memory.read_u64(PhysicalAddress::new(8)), 0x8000_0000_0020_0007);
            assert_eq!(memory.read(PhysicalAddress::new(8), 1), vec![0x07]);
        }

        #[test]
        #[should_panic(expected = "outside emulated memory")]
        fn rejects_addresses_below_base() {
            let memory = EmulatedMemory::new(PhysicalAddress::new(0x1000), PAGE_SIZE);
            memory.phys_to_ptr(PhysicalAddress::new(0));
        }
    }
}
