//! Bitmap physical frame allocator.
//!
//! One bit tracks each 4 KiB frame between the lowest and highest usable address in
//! the boot memory map: `1` means allocated (or not usable at all), `0` means free.
//! Allocation is next-fit: the scan resumes from where the previous allocation ended,
//! and when it runs off the end the cursor rewinds to the start for exactly one more
//! scan. The bitmap and cursor live behind a single spin lock, so `alloc`, `free` and
//! `reserve` may be called from any context.
//!
//! # Initialization
//!
//! ```
//! use mm::{FrameAllocator, MemoryKind, MemoryMapEntry, MemoryProbe, PhysicalAddress};
//!
//! let map = [MemoryMapEntry::new(PhysicalAddress::new(0x100000), 0x100000, MemoryKind::Usable)];
//! let probe = MemoryProbe::scan(&map).unwrap();
//! let mut storage = vec![0u8; probe.bitmap_size()];
//!
//! let frames = FrameAllocator::with_storage(&map, &mut storage).unwrap();
//! assert_eq!(frames.alloc(1).unwrap(), PhysicalAddress::new(0x100000));
//! ```

use crate::{
    DirectMap, FrameNumber, HumanSize, MemoryMapSource, PAGE_SIZE, PhysicalAddress, align_down,
    align_up,
};

/// Errors returned by [`FrameAllocator::alloc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("frame count must be positive")]
    InvalidCount,
}

/// Errors raised while building a [`FrameAllocator`] from the memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InitError {
    #[error("memory map contains no usable memory")]
    NoUsableMemory,
    #[error("no usable region can hold a {0}-byte frame bitmap")]
    NoBitmapStorage(usize),
    #[error("bitmap storage holds {provided} bytes, {required} required")]
    BitmapTooSmall { required: usize, provided: usize },
}

/// Summary of the usable memory described by a memory map.
///
/// `usable_total` is the raw byte sum of the usable entries. The bounds only count whole
/// pages: each usable entry is shrunk inwards to page boundaries and entries that do not
/// contain a full page are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryProbe {
    /// Total bytes in usable entries.
    pub usable_total: usize,
    /// Lowest usable page address.
    pub usable_base: PhysicalAddress,
    /// One past the highest usable page.
    pub usable_top: PhysicalAddress,
}

impl MemoryProbe {
    /// Scans every entry of `map`, summing usable bytes and recording the usable bounds.
    pub fn scan<M: MemoryMapSource + ?Sized>(map: &M) -> Result<Self, InitError> {
        let usable_total = map
            .entries()
            .filter(|entry| entry.is_usable())
            .map(|entry| entry.length)
            .sum();

        let mut usable_base = usize::MAX;
        let mut usable_top = 0;
        for (start, end) in usable_ranges(map) {
            usable_base = usable_base.min(start);
            usable_top = usable_top.max(end);
        }

        if usable_top == 0 {
            return Err(InitError::NoUsableMemory);
        }

        let probe = Self {
            usable_total,
            usable_base: PhysicalAddress::new(usable_base),
            usable_top: PhysicalAddress::new(usable_top),
        };
        log::debug!(
            "usable memory: {} in [{}, {}), bitmap {}",
            HumanSize(usable_total),
            probe.usable_base,
            probe.usable_top,
            HumanSize(probe.bitmap_size())
        );
        Ok(probe)
    }

    /// Number of frames the bitmap must track (holes between usable entries included).
    pub fn frame_count(&self) -> usize {
        (self.usable_top - self.usable_base) / PAGE_SIZE
    }

    /// Size of the bitmap in bytes.
    pub fn bitmap_size(&self) -> usize {
        self.frame_count().div_ceil(8)
    }

    /// Finds the first usable entry with room for the bitmap and returns where the
    /// bitmap should go.
    pub fn bitmap_location<M: MemoryMapSource + ?Sized>(
        &self,
        map: &M,
    ) -> Result<PhysicalAddress, InitError> {
        let required = align_up(self.bitmap_size(), PAGE_SIZE);
        usable_ranges(map)
            .find(|(start, end)| end - start >= required)
            .map(|(start, _)| PhysicalAddress::new(start))
            .ok_or(InitError::NoBitmapStorage(self.bitmap_size()))
    }
}

/// Yields the page-aligned interior `[start, end)` of every usable entry with at least one page.
fn usable_ranges<M>(map: &M) -> impl Iterator<Item = (usize, usize)> + '_
where
    M: MemoryMapSource + ?Sized,
{
    map.entries()
        .filter(|entry| entry.is_usable())
        .map(|entry| {
            (
                align_up(entry.base.as_usize(), PAGE_SIZE),
                align_down(entry.end().as_usize(), PAGE_SIZE),
            )
        })
        .filter(|(start, end)| start < end)
}

struct BitmapState<'a> {
    bits: &'a mut [u8],
    base_frame: FrameNumber,
    frame_count: usize,
    last_bit: usize,
}

impl BitmapState<'_> {
    fn test(&self, bit: usize) -> bool {
        self.bits[bit / 8] & (1 << (bit % 8)) != 0
    }

    fn set_range(&mut self, start: usize, count: usize, allocated: bool) {
        for bit in start..start + count {
            if allocated {
                self.bits[bit / 8] |= 1 << (bit % 8);
            } else {
                self.bits[bit / 8] &= !(1 << (bit % 8));
            }
        }
    }

    /// Finds `count` contiguous free bits at or after `from`.
    fn find_run(&self, from: usize, count: usize) -> Option<usize> {
        let mut start = from;
        let mut run = 0;
        for bit in from..self.frame_count {
            if self.test(bit) {
                run = 0;
                start = bit + 1;
            } else {
                run += 1;
                if run == count {
                    return Some(start);
                }
            }
        }
        None
    }

    /// Converts a frame range to a bit range, clipped to the tracked frames.
    fn bit_range(&self, base: PhysicalAddress, count: usize) -> Option<(usize, usize)> {
        let first = base.frame_number().as_usize();
        let base_frame = self.base_frame.as_usize();
        let start = first.max(base_frame);
        let end = (first + count).min(base_frame + self.frame_count);
        (start < end).then(|| (start - base_frame, end - start))
    }
}

/// A bitmap frame allocator.
///
/// The allocator borrows its bitmap storage for `'a`: either a caller-provided slice
/// ([`FrameAllocator::with_storage`]) or frames inside the memory it manages, reached
/// through the direct map ([`FrameAllocator::new`]).
pub struct FrameAllocator<'a> {
    state: spin::Mutex<BitmapState<'a>>,
}

impl<'a> FrameAllocator<'a> {
    /// Builds an allocator whose bitmap lives in usable memory it describes.
    ///
    /// The bitmap is placed at the start of the first usable entry large enough to hold
    /// it, and its own frames are marked allocated after the usable ranges are cleared.
    ///
    /// # Safety
    ///
    /// The usable memory described by `map` must be unused, reachable through
    /// `direct_map`, and not managed by any other allocator.
    pub unsafe fn new<M, D>(map: &M, direct_map: &'a D) -> Result<Self, InitError>
    where
        M: MemoryMapSource + ?Sized,
        D: DirectMap + ?Sized,
    {
        let probe = MemoryProbe::scan(map)?;
        let size = probe.bitmap_size();
        let location = probe.bitmap_location(map)?;

        // SAFETY: `location` starts a usable range of at least `size` bytes that the
        // caller guarantees nothing else owns. The range is marked allocated below
        // before the allocator is handed out.
        let storage =
            unsafe { core::slice::from_raw_parts_mut(direct_map.phys_to_ptr(location), size) };

        let allocator = Self::build(map, &probe, storage);
        allocator.reserve(location, align_up(size, PAGE_SIZE) / PAGE_SIZE);
        log::info!(
            "frame allocator: {} frames tracked, bitmap at {}",
            probe.frame_count(),
            location
        );
        Ok(allocator)
    }

    /// Builds an allocator over caller-provided bitmap storage.
    ///
    /// The storage must not lie in usable memory, or it must be excluded with
    /// [`FrameAllocator::reserve`] before anything else allocates.
    pub fn with_storage<M>(map: &M, storage: &'a mut [u8]) -> Result<Self, InitError>
    where
        M: MemoryMapSource + ?Sized,
    {
        let probe = MemoryProbe::scan(map)?;
        let required = probe.bitmap_size();
        if storage.len() < required {
            return Err(InitError::BitmapTooSmall {
                required,
                provided: storage.len(),
            });
        }

        Ok(Self::build(map, &probe, &mut storage[..required]))
    }

    fn build<M>(map: &M, probe: &MemoryProbe, bits: &'a mut [u8]) -> Self
    where
        M: MemoryMapSource + ?Sized,
    {
        bits.fill(0xFF);

        let mut state = BitmapState {
            bits,
            base_frame: probe.usable_base.frame_number(),
            frame_count: probe.frame_count(),
            last_bit: 0,
        };

        for (start, end) in usable_ranges(map) {
            let first = (start - probe.usable_base.as_usize()) / PAGE_SIZE;
            state.set_range(first, (end - start) / PAGE_SIZE, false);
        }

        // Frame 0 would be indistinguishable from a null pointer.
        if state.base_frame.as_usize() == 0 && !state.test(0) {
            log::warn!("physical frame 0 is usable, reserving it");
            state.set_range(0, 1, true);
        }

        Self {
            state: spin::Mutex::new(state),
        }
    }

    /// Allocates `count` physically contiguous frames and returns the first one's address.
    pub fn alloc(&self, count: usize) -> Result<PhysicalAddress, AllocError> {
        if count == 0 {
            return Err(AllocError::InvalidCount);
        }

        let mut state = self.state.lock();
        let from = state.last_bit;
        let start = match state.find_run(from, count) {
            Some(start) => start,
            None => {
                state.last_bit = 0;
                state.find_run(0, count).ok_or_else(|| {
                    log::warn!("out of memory: failed to allocate {} frames", count);
                    AllocError::OutOfMemory
                })?
            }
        };

        state.set_range(start, count, true);
        state.last_bit = start + count;

        let base = (state.base_frame + start).start();
        log::trace!("allocated {} frames at {}", count, base);
        Ok(base)
    }

    /// Returns `count` frames starting at `base` to the free pool.
    ///
    /// The range is not checked against prior allocations: freeing a free frame is a
    /// silent no-op. Frames outside the tracked range are ignored.
    pub fn free(&self, base: PhysicalAddress, count: usize) {
        debug_assert!(base.is_aligned(PAGE_SIZE), "freeing unaligned frame {base:?}");
        let mut state = self.state.lock();
        if let Some((start, count)) = state.bit_range(base, count) {
            state.set_range(start, count, false);
        }
        log::trace!("freed {} frames at {}", count, base);
    }

    /// Marks `count` frames starting at `base` allocated without going through the scan.
    pub fn reserve(&self, base: PhysicalAddress, count: usize) {
        let mut state = self.state.lock();
        if let Some((start, count)) = state.bit_range(base.align_down(PAGE_SIZE), count) {
            state.set_range(start, count, true);
        }
    }

    /// Number of frames covered by the bitmap, including holes between usable entries.
    pub fn total_frames(&self) -> usize {
        self.state.lock().frame_count
    }

    pub fn free_frames(&self) -> usize {
        let state = self.state.lock();
        (0..state.frame_count).filter(|bit| !state.test(*bit)).count()
    }

    /// Returns true if the frame containing `addr` is allocated or outside usable memory.
    pub fn is_allocated(&self, addr: PhysicalAddress) -> bool {
        let state = self.state.lock();
        match state.bit_range(addr.align_down(PAGE_SIZE), 1) {
            Some((bit, _)) => state.test(bit),
            None => true,
        }
    }
}
