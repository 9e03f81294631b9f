//! ELF executable loading.
//!
//! [`load`] materializes the `PT_LOAD` segments of an ELF64 executable in an address
//! space: each segment gets freshly allocated frames, mapped user-accessible at the
//! segment's virtual address, and is filled through the kernel's direct map rather
//! than through the target space. The whole image is validated before the space is
//! touched; once mapping starts, a failure leaves earlier segments in place.

use elf::ElfBytes;
use elf::abi::{ELFMAG0, ELFMAG1, ELFMAG2, ELFMAG3, ET_EXEC, EV_CURRENT, PF_W, PF_X, PT_LOAD};
use elf::endian::AnyEndian;
use elf::parse::ParseError;
use elf::segment::ProgramHeader;

use crate::{
    AddressSpace, DirectMap, MachineTopology, MapError, PAGE_SIZE, PageMapper, Protection,
    Region, VirtualAddress, align_up,
};

const ELF_MAGIC: [u8; 4] = [ELFMAG0, ELFMAG1, ELFMAG2, ELFMAG3];

/// Reasons an image is rejected before anything is mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ImageError {
    #[error("missing ELF magic")]
    BadMagic,
    #[error("malformed ELF header or program header table")]
    Malformed,
    #[error("ELF type {0} is not an executable")]
    NotExecutable(u16),
    #[error("unsupported ELF version")]
    UnsupportedVersion,
    #[error("segment {index} lies outside the image")]
    SegmentOutOfBounds { index: usize },
    #[error("segment {index} has a non-canonical address range")]
    BadSegmentAddress { index: usize },
}

/// Errors returned by [`load`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    #[error("invalid image: {0}")]
    InvalidImage(#[from] ImageError),
    #[error("failed to map segment: {0}")]
    SegmentMapFailed(#[from] MapError),
}

/// What the caller needs to start a loaded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedImage {
    pub entry: VirtualAddress,
}

/// Loads the executable `image` into `space` and returns its entry point.
///
/// Segment frames are zeroed, then the segment's file bytes are copied to the same
/// offset within the page as the segment's virtual address. Bytes between the file
/// size and the memory size stay zero.
pub fn load<D, T>(
    mapper: &PageMapper<'_, '_, D, T>,
    space: &mut AddressSpace,
    image: &[u8],
) -> Result<LoadedImage, LoadError>
where
    D: DirectMap,
    T: MachineTopology,
{
    if image.get(..ELF_MAGIC.len()) != Some(ELF_MAGIC.as_slice()) {
        return Err(ImageError::BadMagic.into());
    }

    let file = ElfBytes::<AnyEndian>::minimal_parse(image).map_err(|err| match err {
        ParseError::BadMagic(_) => ImageError::BadMagic,
        ParseError::UnsupportedVersion(_) => ImageError::UnsupportedVersion,
        _ => ImageError::Malformed,
    })?;

    if file.ehdr.e_type != ET_EXEC {
        return Err(ImageError::NotExecutable(file.ehdr.e_type).into());
    }
    if file.ehdr.version != u32::from(EV_CURRENT) {
        return Err(ImageError::UnsupportedVersion.into());
    }

    let segments = file.segments();
    let loadable = || {
        segments
            .iter()
            .flat_map(|table| table.iter())
            .enumerate()
            .filter(|(_, ph)| ph.p_type == PT_LOAD && ph.p_memsz != 0)
    };

    for (index, ph) in loadable() {
        if file_bytes(image, &ph).is_none() {
            return Err(ImageError::SegmentOutOfBounds { index }.into());
        }
        if !has_canonical_range(&ph) {
            return Err(ImageError::BadSegmentAddress { index }.into());
        }
    }

    for (index, ph) in loadable() {
        load_segment(mapper, space, image, index, &ph)?;
    }

    Ok(LoadedImage {
        entry: VirtualAddress::from(file.ehdr.e_entry),
    })
}

fn load_segment<D: DirectMap, T: MachineTopology>(
    mapper: &PageMapper<'_, '_, D, T>,
    space: &mut AddressSpace,
    image: &[u8],
    index: usize,
    ph: &ProgramHeader,
) -> Result<(), LoadError> {
    let mut protection = Protection::READ | Protection::USER;
    if ph.p_flags & PF_W != 0 {
        protection |= Protection::WRITE;
    }
    if ph.p_flags & PF_X != 0 {
        protection |= Protection::EXECUTE;
    }

    // Both were range-checked before any segment was loaded.
    let bytes = file_bytes(image, ph).ok_or(ImageError::SegmentOutOfBounds { index })?;
    let virt = VirtualAddress::from(ph.p_vaddr);
    let misalignment = virt.page_offset();
    let length = align_up(ph.p_memsz as usize + misalignment, PAGE_SIZE);
    let pages = length / PAGE_SIZE;

    let frames = mapper.frames().alloc(pages).map_err(MapError::from)?;
    let region = Region::new(virt.align_down(PAGE_SIZE), frames, length);
    log::debug!(
        "segment {}: {} ({:#x} bytes) -> {} {:?}",
        index,
        virt,
        ph.p_memsz,
        frames,
        protection
    );
    mapper.map_region(space, &region, protection)?;

    let direct_map = mapper.direct_map();
    direct_map.zero_frames(frames, pages);
    direct_map.copy_to(frames + misalignment, bytes);
    Ok(())
}

/// Returns the bytes a segment initializes from the file, or `None` if they lie
/// outside the image. File bytes beyond the memory size are ignored.
fn file_bytes<'d>(image: &'d [u8], ph: &ProgramHeader) -> Option<&'d [u8]> {
    let start = usize::try_from(ph.p_offset).ok()?;
    let len = usize::try_from(ph.p_filesz.min(ph.p_memsz)).ok()?;
    image.get(start..start.checked_add(len)?)
}

/// Returns true if the segment's whole virtual range is canonical and in one half.
fn has_canonical_range(ph: &ProgramHeader) -> bool {
    let Some(last) = ph.p_vaddr.checked_add(ph.p_memsz - 1) else {
        return false;
    };
    let first = VirtualAddress::from(ph.p_vaddr);
    let last = VirtualAddress::from(last);
    first.is_canonical()
        && last.is_canonical()
        && first.as_usize() >> 47 == last.as_usize() >> 47
}
