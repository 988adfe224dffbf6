//! Guest memory state left behind by the loader.

use thiserror::Error;

use crate::guest_space::{
    checked_page_align_up, page_align_up, GuestSpace, MapError,
};

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("break {requested:#x} below allocation base {base:#x}")]
    Underflow { requested: i128, base: u64 },
    #[error(transparent)]
    Map(#[from] MapError),
}

/// Memory state of a loaded image.
///
/// Starts zeroed, filled in by the loader one segment at a time, then
/// handed back to the caller. After loading only [`Mmu::alloc`] moves
/// the break.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Mmu {
    /// Program entry point (guest address).
    pub entry: u64,
    /// End of the highest mapping (host address).
    pub host_alloc: u64,
    /// First guest address available for dynamic allocation.
    pub base: u64,
    /// Current break (guest address).
    pub alloc: u64,
}

impl Mmu {
    /// Host high-water mark translated to a guest address.
    #[inline]
    pub fn host_alloc_guest(&self, space: &GuestSpace) -> Option<u64> {
        space.try_h2g(self.host_alloc as *const u8)
    }

    /// Move the break by `delta` bytes and return the old break.
    ///
    /// Growing maps fresh zeroed RW pages past the high-water mark;
    /// shrinking gives whole pages above the new break back to the
    /// reservation.
    pub fn alloc(
        &mut self,
        space: &GuestSpace,
        delta: i64,
    ) -> Result<u64, AllocError> {
        let old = self.alloc;
        let requested = old as i128 + delta as i128;
        if requested < self.base as i128 {
            return Err(AllocError::Underflow {
                requested,
                base: self.base,
            });
        }
        let new = u64::try_from(requested).map_err(|_| {
            MapError::OutOfRange {
                addr: old,
                len: delta.unsigned_abs(),
                size: space.size(),
            }
        })?;
        let mapped_end =
            self.host_alloc_guest(space).ok_or(MapError::OutOfRange {
                addr: self.host_alloc,
                len: 0,
                size: space.size(),
            })?;

        if new > mapped_end {
            let end = checked_page_align_up(new).ok_or(MapError::OutOfRange {
                addr: mapped_end,
                len: new - mapped_end,
                size: space.size(),
            })?;
            let len = (end - mapped_end) as usize;
            space.mmap_fixed(
                mapped_end,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
            )?;
            self.host_alloc = space.g2h(end) as u64;
            log::debug!("brk grow {mapped_end:#x}..{end:#x}");
        } else if delta < 0 {
            let end = page_align_up(new);
            if end < mapped_end {
                space.release(end, (mapped_end - end) as usize)?;
                self.host_alloc = space.g2h(end) as u64;
                log::debug!("brk shrink {end:#x}..{mapped_end:#x}");
            }
        }

        self.alloc = new;
        Ok(old)
    }

    /// Copy `data` to guest memory at `addr`.
    ///
    /// # Safety
    /// The range must be mapped writable, e.g. returned by
    /// [`Mmu::alloc`].
    pub unsafe fn write(
        &self,
        space: &GuestSpace,
        addr: u64,
        data: &[u8],
    ) {
        space.write_bytes(addr, data)
    }

    /// Copy guest memory at `addr` into `buf`.
    ///
    /// # Safety
    /// The range must be mapped readable.
    pub unsafe fn read(
        &self,
        space: &GuestSpace,
        addr: u64,
        buf: &mut [u8],
    ) {
        space.read_bytes(addr, buf)
    }
}
