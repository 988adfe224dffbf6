use std::io;
use std::os::fd::RawFd;
use std::ptr;

use thiserror::Error;

/// Guest address space size: 1 GiB.
pub const GUEST_SPACE_SIZE: usize = 1 << 30;

/// A mapping could not be placed where it was asked to go.
#[derive(Debug, Error)]
pub enum MapError {
    #[error(
        "guest range {addr:#x}+{len:#x} outside reserved region \
         of {size:#x} bytes"
    )]
    OutOfRange { addr: u64, len: u64, size: usize },
    #[error("mmap at guest {addr:#x} failed: {source}")]
    Os {
        addr: u64,
        #[source]
        source: io::Error,
    },
    #[error("mmap at guest {addr:#x} landed at host {got:#x}")]
    Misplaced { addr: u64, got: usize },
}

/// mmap-based guest address space.
///
/// Reserves a contiguous region of host memory and maps
/// guest addresses as offsets within it. Every mapping the
/// loader makes goes through here and stays inside the
/// reservation.
pub struct GuestSpace {
    base: *mut u8,
    size: usize,
}

// SAFETY: GuestSpace owns its mmap'd memory exclusively.
unsafe impl Send for GuestSpace {}

impl GuestSpace {
    /// Reserve a 1 GiB guest address space.
    pub fn new() -> io::Result<Self> {
        Self::with_size(GUEST_SPACE_SIZE)
    }

    /// Reserve `size` bytes (rounded up to whole pages).
    pub fn with_size(size: usize) -> io::Result<Self> {
        let size = checked_page_align_up(size as u64)
            .and_then(|size| usize::try_from(size).ok())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "guest space too large",
                )
            })?;
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty guest space",
            ));
        }
        // SAFETY: PROT_NONE reservation, no file backing.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        log::debug!("reserved guest space {size:#x} bytes at {ptr:p}");
        Ok(Self {
            base: ptr as *mut u8,
            size,
        })
    }

    /// Size of the reservation in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Translate `[guest_addr, guest_addr + len)` to a host pointer,
    /// or `None` if any part falls outside the reservation.
    #[inline]
    pub fn try_g2h(&self, guest_addr: u64, len: u64) -> Option<*mut u8> {
        let end = guest_addr.checked_add(len)?;
        if end > self.size as u64 {
            return None;
        }
        // SAFETY: guest_addr <= size, at most one past the end.
        Some(unsafe { self.base.add(guest_addr as usize) })
    }

    /// Translate a host pointer back to a guest address, or `None` if
    /// it lies outside the reservation. The one-past-the-end pointer
    /// maps to `size`.
    #[inline]
    pub fn try_h2g(&self, host_ptr: *const u8) -> Option<u64> {
        let off = (host_ptr as usize).checked_sub(self.base as usize)?;
        (off <= self.size).then_some(off as u64)
    }

    /// Translate guest address to host pointer.
    #[inline]
    pub fn g2h(&self, guest_addr: u64) -> *mut u8 {
        match self.try_g2h(guest_addr, 0) {
            Some(p) => p,
            None => panic!("guest addr {guest_addr:#x} out of range"),
        }
    }

    /// Translate host pointer to guest address.
    #[inline]
    pub fn h2g(&self, host_ptr: *const u8) -> u64 {
        match self.try_h2g(host_ptr) {
            Some(g) => g,
            None => panic!("host pointer {host_ptr:p} not in guest space"),
        }
    }

    /// Base pointer for guest instruction fetch.
    #[inline]
    pub fn guest_base(&self) -> *const u8 {
        self.base as *const u8
    }

    fn range(&self, guest_addr: u64, len: usize) -> Result<*mut u8, MapError> {
        self.try_g2h(guest_addr, len as u64)
            .ok_or(MapError::OutOfRange {
                addr: guest_addr,
                len: len as u64,
                size: self.size,
            })
    }

    fn place(
        &self,
        guest_addr: u64,
        size: usize,
        prot: i32,
        flags: i32,
        fd: RawFd,
        offset: u64,
    ) -> Result<(), MapError> {
        let host = self.range(guest_addr, size)?;
        let offset =
            libc::off_t::try_from(offset).map_err(|_| MapError::Os {
                addr: guest_addr,
                source: io::Error::from_raw_os_error(libc::EOVERFLOW),
            })?;
        // SAFETY: within our reserved region, which we own.
        let ret = unsafe {
            libc::mmap(
                host as *mut libc::c_void,
                size,
                prot,
                flags | libc::MAP_PRIVATE | libc::MAP_FIXED,
                fd,
                offset,
            )
        };
        if ret == libc::MAP_FAILED {
            return Err(MapError::Os {
                addr: guest_addr,
                source: io::Error::last_os_error(),
            });
        }
        if ret as *mut u8 != host {
            return Err(MapError::Misplaced {
                addr: guest_addr,
                got: ret as usize,
            });
        }
        Ok(())
    }

    /// Map a fixed anonymous, zero-filled region within the guest space.
    pub fn mmap_fixed(
        &self,
        guest_addr: u64,
        size: usize,
        prot: i32,
    ) -> Result<(), MapError> {
        self.place(guest_addr, size, prot, libc::MAP_ANONYMOUS, -1, 0)
    }

    /// Map `size` bytes of `fd` starting at page-aligned `offset`,
    /// copy-on-write, at a fixed guest address.
    pub fn mmap_file_fixed(
        &self,
        guest_addr: u64,
        size: usize,
        prot: i32,
        fd: RawFd,
        offset: u64,
    ) -> Result<(), MapError> {
        self.place(guest_addr, size, prot, 0, fd, offset)
    }

    /// Give a region back to the reservation (inaccessible again).
    pub fn release(
        &self,
        guest_addr: u64,
        size: usize,
    ) -> Result<(), MapError> {
        self.place(
            guest_addr,
            size,
            libc::PROT_NONE,
            libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    }

    /// Change protection on a guest region.
    pub fn mprotect(
        &self,
        guest_addr: u64,
        size: usize,
        prot: i32,
    ) -> Result<(), MapError> {
        let host = self.range(guest_addr, size)?;
        // SAFETY: within our reserved region.
        let ret =
            unsafe { libc::mprotect(host as *mut libc::c_void, size, prot) };
        if ret != 0 {
            Err(MapError::Os {
                addr: guest_addr,
                source: io::Error::last_os_error(),
            })
        } else {
            Ok(())
        }
    }

    /// Write bytes at a guest address.
    ///
    /// # Safety
    /// The guest region must be mapped writable.
    pub unsafe fn write_bytes(&self, guest_addr: u64, data: &[u8]) {
        let dst = self.g2h(guest_addr);
        assert!(self.try_g2h(guest_addr, data.len() as u64).is_some());
        ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
    }

    /// Read bytes from a guest address into `buf`.
    ///
    /// # Safety
    /// The guest region must be mapped readable.
    pub unsafe fn read_bytes(&self, guest_addr: u64, buf: &mut [u8]) {
        let src = self.g2h(guest_addr);
        assert!(self.try_g2h(guest_addr, buf.len() as u64).is_some());
        ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len());
    }

    /// Zero `len` bytes at a guest address.
    ///
    /// # Safety
    /// The guest region must be mapped writable.
    pub unsafe fn fill_zero(&self, guest_addr: u64, len: usize) {
        let dst = self.g2h(guest_addr);
        assert!(self.try_g2h(guest_addr, len as u64).is_some());
        ptr::write_bytes(dst, 0, len);
    }

    /// Write a u64 at a guest address (LE).
    ///
    /// # Safety
    /// The guest region must be mapped writable.
    pub unsafe fn write_u64(&self, guest_addr: u64, val: u64) {
        self.write_bytes(guest_addr, &val.to_le_bytes());
    }

    /// Read a u64 from a guest address (LE).
    ///
    /// # Safety
    /// The guest region must be mapped readable.
    pub unsafe fn read_u64(&self, guest_addr: u64) -> u64 {
        let mut buf = [0u8; 8];
        self.read_bytes(guest_addr, &mut buf);
        u64::from_le_bytes(buf)
    }
}

impl Drop for GuestSpace {
    fn drop(&mut self) {
        if !self.base.is_null() {
            unsafe {
                libc::munmap(self.base as *mut libc::c_void, self.size);
            }
        }
    }
}

pub fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

pub fn page_align_up(addr: u64) -> u64 {
    let ps = page_size() as u64;
    (addr + ps - 1) & !(ps - 1)
}

/// `page_align_up` that reports overflow instead of wrapping.
pub fn checked_page_align_up(addr: u64) -> Option<u64> {
    let ps = page_size() as u64;
    addr.checked_add(ps - 1).map(|a| a & !(ps - 1))
}

pub fn page_align_down(addr: u64) -> u64 {
    let ps = page_size() as u64;
    addr & !(ps - 1)
}
