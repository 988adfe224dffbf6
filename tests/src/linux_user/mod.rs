mod guest_space;

use std::fs::File;
use std::io::{Seek, Write};

use rvemu_linux_user::elf::{
    ELFCLASS64, ELFDATA2LSB, ELF_MAGIC, EHDR_SIZE, EM_RISCV, ET_EXEC,
    EV_CURRENT, PHDR_SIZE, PT_LOAD,
};

/// A program header to emit; `data` is placed in the file at `offset`.
struct Seg {
    p_type: u32,
    flags: u32,
    vaddr: u64,
    offset: u64,
    data: Vec<u8>,
    filesz: u64,
    memsz: u64,
}

impl Seg {
    fn load(
        vaddr: u64,
        offset: u64,
        data: &[u8],
        memsz: u64,
        flags: u32,
    ) -> Self {
        Self {
            p_type: PT_LOAD,
            flags,
            vaddr,
            offset,
            data: data.to_vec(),
            filesz: data.len() as u64,
            memsz,
        }
    }

    /// PT_LOAD over bytes already in the image (e.g. the headers).
    fn covering(
        vaddr: u64,
        offset: u64,
        filesz: u64,
        memsz: u64,
        flags: u32,
    ) -> Self {
        Self {
            p_type: PT_LOAD,
            flags,
            vaddr,
            offset,
            data: Vec::new(),
            filesz,
            memsz,
        }
    }

    fn other(p_type: u32, vaddr: u64) -> Self {
        Self {
            p_type,
            flags: 0,
            vaddr,
            offset: 0,
            data: Vec::new(),
            filesz: 0,
            memsz: 0,
        }
    }
}

/// Builds RISC-V ELF64 images byte by byte.
struct ImageBuilder {
    entry: u64,
    machine: u16,
    class: u8,
    phoff: u64,
    segs: Vec<Seg>,
}

impl ImageBuilder {
    fn new(entry: u64) -> Self {
        Self {
            entry,
            machine: EM_RISCV,
            class: ELFCLASS64,
            phoff: EHDR_SIZE as u64,
            segs: Vec::new(),
        }
    }

    fn machine(mut self, machine: u16) -> Self {
        self.machine = machine;
        self
    }

    fn class(mut self, class: u8) -> Self {
        self.class = class;
        self
    }

    fn phoff(mut self, phoff: u64) -> Self {
        self.phoff = phoff;
        self
    }

    fn seg(mut self, seg: Seg) -> Self {
        self.segs.push(seg);
        self
    }

    fn build(&self) -> Vec<u8> {
        let table_end = self.phoff as usize + self.segs.len() * PHDR_SIZE;
        let data_end = self
            .segs
            .iter()
            .map(|s| s.offset as usize + s.filesz as usize)
            .max()
            .unwrap_or(0);
        let mut buf = vec![0u8; table_end.max(data_end).max(EHDR_SIZE)];

        buf[0..4].copy_from_slice(&ELF_MAGIC);
        buf[4] = self.class;
        buf[5] = ELFDATA2LSB;
        buf[6] = EV_CURRENT;
        buf[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        buf[18..20].copy_from_slice(&self.machine.to_le_bytes());
        buf[20..24].copy_from_slice(&1u32.to_le_bytes());
        buf[24..32].copy_from_slice(&self.entry.to_le_bytes());
        buf[32..40].copy_from_slice(&self.phoff.to_le_bytes());
        buf[52..54].copy_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
        buf[54..56].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        buf[56..58].copy_from_slice(&(self.segs.len() as u16).to_le_bytes());

        for (i, s) in self.segs.iter().enumerate() {
            let off = self.phoff as usize + i * PHDR_SIZE;
            let ph = &mut buf[off..off + PHDR_SIZE];
            ph[0..4].copy_from_slice(&s.p_type.to_le_bytes());
            ph[4..8].copy_from_slice(&s.flags.to_le_bytes());
            ph[8..16].copy_from_slice(&s.offset.to_le_bytes());
            ph[16..24].copy_from_slice(&s.vaddr.to_le_bytes());
            ph[24..32].copy_from_slice(&s.vaddr.to_le_bytes());
            ph[32..40].copy_from_slice(&s.filesz.to_le_bytes());
            ph[40..48].copy_from_slice(&s.memsz.to_le_bytes());
            ph[48..56].copy_from_slice(&4096u64.to_le_bytes());
        }
        // Contents must not overlap the headers.
        for s in &self.segs {
            let off = s.offset as usize;
            buf[off..off + s.data.len()].copy_from_slice(&s.data);
        }
        buf
    }
}

/// Write `data` to an unlinked temp file, rewound to the start.
fn image_file(data: &[u8]) -> File {
    let mut f = tempfile::tempfile().expect("create tmpfile");
    f.write_all(data).expect("write image");
    f.rewind().expect("rewind");
    f
}

/// Permission string ("r-xp", "---p", ...) of the host mapping that
/// contains `addr`, from /proc/self/maps.
fn host_perms(addr: usize) -> Option<String> {
    let maps = std::fs::read_to_string("/proc/self/maps").ok()?;
    maps.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let (lo, hi) = fields.next()?.split_once('-')?;
        let lo = usize::from_str_radix(lo, 16).ok()?;
        let hi = usize::from_str_radix(hi, 16).ok()?;
        (lo <= addr && addr < hi).then(|| fields.next().map(str::to_owned))?
    })
}
