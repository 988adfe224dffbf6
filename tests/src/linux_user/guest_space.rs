use rvemu_linux_user::guest_space::{
    page_align_down, page_align_up, page_size, GuestSpace, MapError,
};

#[test]
fn test_create_and_drop() {
    let space = GuestSpace::new().unwrap();
    assert!(!space.guest_base().is_null());
    drop(space);
}

#[test]
fn test_g2h_h2g_roundtrip() {
    let space = GuestSpace::with_size(4 << 20).unwrap();
    let addr: u64 = 0x1000;
    let host = space.g2h(addr);
    assert_eq!(host as usize - space.guest_base() as usize, 0x1000);
    assert_eq!(space.h2g(host), addr);
}

#[test]
fn test_mmap_fixed_and_write() {
    let space = GuestSpace::with_size(4 << 20).unwrap();
    let addr: u64 = 0x10000;
    let size = page_size();
    space
        .mmap_fixed(addr, size, libc::PROT_READ | libc::PROT_WRITE)
        .unwrap();

    let data = b"hello guest";
    unsafe {
        space.write_bytes(addr, data);
    }

    let host = space.g2h(addr);
    let readback =
        unsafe { std::slice::from_raw_parts(host as *const u8, data.len()) };
    assert_eq!(readback, data);
}

#[test]
fn test_mmap_straddling_end_rejected() {
    let space = GuestSpace::with_size(4 << 20).unwrap();
    let ps = page_size();
    let addr = (space.size() - ps) as u64;
    let err = space
        .mmap_fixed(addr, 2 * ps, libc::PROT_READ)
        .unwrap_err();
    match err {
        MapError::OutOfRange { addr: a, len, size } => {
            assert_eq!(a, addr);
            assert_eq!(len, 2 * ps as u64);
            assert_eq!(size, space.size());
        }
        other => panic!("unexpected {other:?}"),
    }
    // The last page itself is fine.
    space.mmap_fixed(addr, ps, libc::PROT_READ).unwrap();
}

#[test]
fn test_file_mapping_is_private() {
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::os::fd::AsRawFd;

    let ps = page_size();
    let mut file = tempfile::tempfile().unwrap();
    file.write_all(&vec![0x5a; ps]).unwrap();

    let space = GuestSpace::with_size(4 << 20).unwrap();
    let addr = 2 * ps as u64;
    space
        .mmap_file_fixed(
            addr,
            ps,
            libc::PROT_READ | libc::PROT_WRITE,
            file.as_raw_fd(),
            0,
        )
        .unwrap();
    assert_eq!(unsafe { space.read_u64(addr) }, 0x5a5a_5a5a_5a5a_5a5a);
    unsafe { space.write_u64(addr, 0) };

    let mut first = [0u8; 8];
    file.seek(SeekFrom::Start(0)).unwrap();
    file.read_exact(&mut first).unwrap();
    assert_eq!(first, [0x5a; 8]);
}

#[test]
fn test_page_align() {
    let ps = page_size() as u64;
    assert_eq!(page_align_up(0), 0);
    assert_eq!(page_align_up(1), ps);
    assert_eq!(page_align_up(ps), ps);
    assert_eq!(page_align_up(ps + 1), ps * 2);
    assert_eq!(page_align_down(ps - 1), 0);
    assert_eq!(page_align_down(ps), ps);
}
