use std::fs::File;
use std::io::{self, Read, Seek};
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;
use std::process::ExitCode;

use thiserror::Error;

use crate::elf::*;
use crate::guest_space::*;
use crate::mmu::Mmu;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("I/O: {0}")]
    Io(#[from] io::Error),
    #[error("ELF: {0}")]
    Elf(#[from] ElfError),
    #[error("placement failure: {0}")]
    Placement(#[from] MapError),
    #[error("segment at {vaddr:#x}: memsz {memsz:#x} < filesz {filesz:#x}")]
    InvalidSegment { vaddr: u64, filesz: u64, memsz: u64 },
    #[error(
        "segment at {vaddr:#x}: file offset {offset:#x} not congruent \
         modulo page size"
    )]
    MisalignedSegment { vaddr: u64, offset: u64 },
    #[error(
        "segment at {vaddr:#x}: memsz {memsz:#x} overflows the \
         address space"
    )]
    SegmentOverflow { vaddr: u64, memsz: u64 },
    #[error("no PT_LOAD segment")]
    NoLoadSegment,
}

impl LoadError {
    /// Process exit code for the CLI.
    ///
    /// - `1`: the image itself cannot be loaded
    /// - `2`: the host could not provide what loading needed
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::Elf(ElfError::Io(_)) | Self::Io(_) | Self::Placement(_) => {
                ExitCode::from(2)
            }
            Self::Elf(_)
            | Self::InvalidSegment { .. }
            | Self::MisalignedSegment { .. }
            | Self::SegmentOverflow { .. }
            | Self::NoLoadSegment => ExitCode::from(1),
        }
    }
}

/// Page-granular placement of one `PT_LOAD` segment, in guest terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLayout {
    /// Page-aligned guest address of the first mapped page.
    pub start: u64,
    /// Offset of `p_vaddr` within its first page.
    pub delta: u64,
    /// Page-aligned file offset backing `start`.
    pub file_offset: u64,
    /// Bytes mapped from the file, whole pages.
    pub file_len: u64,
    /// Anonymous zero pages following the file mapping.
    pub bss_len: u64,
    /// Bytes of the last file page past `p_filesz` that belong to the
    /// segment's memory image and must read as zero.
    pub zero_tail: u64,
}

impl SegmentLayout {
    pub fn compute(ph: &Elf64Phdr, page_size: u64) -> Result<Self, LoadError> {
        let overflow = || LoadError::SegmentOverflow {
            vaddr: ph.p_vaddr,
            memsz: ph.p_memsz,
        };
        if ph.p_memsz < ph.p_filesz {
            return Err(LoadError::InvalidSegment {
                vaddr: ph.p_vaddr,
                filesz: ph.p_filesz,
                memsz: ph.p_memsz,
            });
        }
        let mask = page_size - 1;
        if ph.p_offset & mask != ph.p_vaddr & mask {
            return Err(LoadError::MisalignedSegment {
                vaddr: ph.p_vaddr,
                offset: ph.p_offset,
            });
        }
        let align_up = |v: u64| v.checked_add(mask).map(|v| v & !mask);

        let start = ph.p_vaddr & !mask;
        let delta = ph.p_vaddr - start;
        let file_span = ph.p_filesz + delta;
        let mem_span = ph.p_memsz.checked_add(delta).ok_or_else(overflow)?;
        let file_len = align_up(file_span).ok_or_else(overflow)?;
        let mem_len = align_up(mem_span).ok_or_else(overflow)?;
        start.checked_add(mem_len).ok_or_else(overflow)?;

        Ok(Self {
            start,
            delta,
            file_offset: ph.p_offset & !mask,
            file_len,
            bss_len: mem_len - file_len,
            zero_tail: mem_span.min(file_len) - file_span,
        })
    }

    /// One past the last mapped guest byte.
    #[inline]
    pub fn end(&self) -> u64 {
        self.start + self.file_len + self.bss_len
    }
}

/// Convert ELF p_flags to mmap prot flags.
pub fn elf_to_prot(flags: u32) -> i32 {
    let mut prot = libc::PROT_NONE;
    if flags & PF_R != 0 {
        prot |= libc::PROT_READ;
    }
    if flags & PF_W != 0 {
        prot |= libc::PROT_WRITE;
    }
    if flags & PF_X != 0 {
        prot |= libc::PROT_EXEC;
    }
    prot
}

/// Map one `PT_LOAD` segment from `fd` and raise the high-water mark.
///
/// The file pages are mapped with their final protection. Zeroing the
/// tail of the last file page is left to [`zero_tails`], which must run
/// once every segment is mapped: a later segment sharing that page
/// replaces it with fresh file contents.
pub fn load_segment(
    space: &GuestSpace,
    mmu: &mut Mmu,
    ph: &Elf64Phdr,
    fd: RawFd,
) -> Result<SegmentLayout, LoadError> {
    let layout = SegmentLayout::compute(ph, page_size() as u64)?;
    let len = layout.end() - layout.start;
    // Refuse before touching the address space.
    let host_start =
        space
            .try_g2h(layout.start, len)
            .ok_or(MapError::OutOfRange {
                addr: layout.start,
                len,
                size: space.size(),
            })?;

    let prot = elf_to_prot(ph.p_flags);
    if layout.file_len > 0 {
        space.mmap_file_fixed(
            layout.start,
            layout.file_len as usize,
            prot,
            fd,
            layout.file_offset,
        )?;
    }
    // .bss
    if layout.bss_len > 0 {
        space.mmap_fixed(
            layout.start + layout.file_len,
            layout.bss_len as usize,
            prot,
        )?;
    }
    log::debug!(
        "PT_LOAD vaddr={:#x} file={:#x}+{:#x} bss={:#x} prot={:#x}",
        ph.p_vaddr,
        layout.file_offset,
        layout.file_len,
        layout.bss_len,
        prot,
    );

    mmu.host_alloc = mmu.host_alloc.max(host_start as u64 + len);
    mmu.base = space.h2g(mmu.host_alloc as *const u8);
    mmu.alloc = mmu.base;
    Ok(layout)
}

/// Zero `[p_filesz, p_memsz)` inside the last file page of every
/// segment in `mapped`, in load order.
///
/// The page keeps the protection of the last segment mapped over it;
/// it is writable only while being cleared.
pub fn zero_tails(
    space: &GuestSpace,
    mapped: &[(Elf64Phdr, SegmentLayout)],
) -> Result<(), LoadError> {
    let page = page_size() as u64;
    for (ph, layout) in mapped.iter().filter(|(_, l)| l.zero_tail > 0) {
        let tail = ph.p_vaddr + ph.p_filesz;
        let tail_page = page_align_down(tail);
        let prot = mapped
            .iter()
            .rev()
            .find(|(_, l)| l.start <= tail_page && tail_page < l.end())
            .map_or(libc::PROT_NONE, |(ph, _)| elf_to_prot(ph.p_flags));
        let rw = libc::PROT_READ | libc::PROT_WRITE;

        space.mprotect(tail_page, page as usize, prot | rw)?;
        // SAFETY: the page is inside the segment and writable just above.
        unsafe { space.fill_zero(tail, layout.zero_tail as usize) };
        space.mprotect(tail_page, page as usize, prot)?;
    }
    Ok(())
}

/// Load a static RISC-V 64-bit ELF executable from an open stream.
///
/// `file` must be positioned at the start of the image; its descriptor
/// backs the file mappings. Returns the populated memory state.
pub fn load_elf<F>(file: &mut F, space: &GuestSpace) -> Result<Mmu, LoadError>
where
    F: Read + Seek + AsRawFd,
{
    let fd = file.as_raw_fd();
    let mut reader = ElfReader::new(file)?;
    let image_len = reader.stream_len()?;

    let mut mmu = Mmu {
        entry: reader.entry(),
        ..Mmu::default()
    };
    let mut mapped = Vec::new();

    for ph in reader.program_headers() {
        let ph = ph?;
        if !ph.is_load() {
            log::trace!("skip phdr type {:#x} at {:#x}", ph.p_type, ph.p_vaddr);
            continue;
        }
        let file_end = ph.p_offset.checked_add(ph.p_filesz);
        if file_end.map_or(true, |end| end > image_len) {
            return Err(ElfError::TruncatedInput.into());
        }
        let layout = load_segment(space, &mut mmu, &ph, fd)?;
        mapped.push((ph, layout));
    }

    if mapped.is_empty() {
        return Err(LoadError::NoLoadSegment);
    }
    zero_tails(space, &mapped)?;

    log::info!("entry {:#x}, alloc base {:#x}", mmu.entry, mmu.base);
    Ok(mmu)
}

/// Open `path` and load it with [`load_elf`].
pub fn load_program(path: &Path, space: &GuestSpace) -> Result<Mmu, LoadError> {
    let mut file = File::open(path)?;
    load_elf(&mut file, space)
}
