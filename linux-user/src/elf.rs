use std::io::{self, Read, Seek, SeekFrom};

use thiserror::Error;

// ELF identification
pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
pub const ELFCLASS64: u8 = 2;
pub const ELFDATA2LSB: u8 = 1;
pub const EV_CURRENT: u8 = 1;

const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const EI_VERSION: usize = 6;

// ELF types
pub const ET_EXEC: u16 = 2;

// Machine types
pub const EM_RISCV: u16 = 243;

// Program header types
pub const PT_LOAD: u32 = 1;
pub const PT_PHDR: u32 = 6;

// Program header flags
pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

/// On-disk size of `Elf64Ehdr`.
pub const EHDR_SIZE: usize = 64;
/// On-disk size of `Elf64Phdr`.
pub const PHDR_SIZE: usize = 56;

/// Which part of the header ruled out the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetMismatch {
    Class(u8),
    Encoding(u8),
    Version(u8),
    Machine(u16),
    Type(u16),
}

impl std::fmt::Display for TargetMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Class(c) => write!(f, "not ELF64 (class {c})"),
            Self::Encoding(d) => write!(f, "not little-endian (data {d})"),
            Self::Version(v) => write!(f, "unknown ELF version {v}"),
            Self::Machine(m) => write!(f, "not RISC-V (machine {m})"),
            Self::Type(t) => write!(f, "not ET_EXEC (type {t})"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ElfError {
    #[error("file too small")]
    TruncatedInput,
    #[error("invalid ELF magic")]
    BadSignature,
    #[error("only riscv64 ELF executables are supported: {0}")]
    UnsupportedTarget(TargetMismatch),
    #[error("program header entry size {0} too small")]
    BadProgramHeaderSize(u16),
    #[error("read failed: {0}")]
    Io(#[source] io::Error),
}

impl From<io::Error> for ElfError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Self::TruncatedInput
        } else {
            Self::Io(e)
        }
    }
}

#[inline]
fn le_u16(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

#[inline]
fn le_u32(b: &[u8], off: usize) -> u32 {
    let mut v = [0u8; 4];
    v.copy_from_slice(&b[off..off + 4]);
    u32::from_le_bytes(v)
}

#[inline]
fn le_u64(b: &[u8], off: usize) -> u64 {
    let mut v = [0u8; 8];
    v.copy_from_slice(&b[off..off + 8]);
    u64::from_le_bytes(v)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elf64Ehdr {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elf64Phdr {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

impl Elf64Ehdr {
    /// Decode a header from its little-endian on-disk form.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ElfError> {
        if data.len() < EHDR_SIZE {
            return Err(ElfError::TruncatedInput);
        }
        let mut e_ident = [0u8; 16];
        e_ident.copy_from_slice(&data[0..16]);
        Ok(Self {
            e_ident,
            e_type: le_u16(data, 16),
            e_machine: le_u16(data, 18),
            e_version: le_u32(data, 20),
            e_entry: le_u64(data, 24),
            e_phoff: le_u64(data, 32),
            e_shoff: le_u64(data, 40),
            e_flags: le_u32(data, 48),
            e_ehsize: le_u16(data, 52),
            e_phentsize: le_u16(data, 54),
            e_phnum: le_u16(data, 56),
            e_shentsize: le_u16(data, 58),
            e_shnum: le_u16(data, 60),
            e_shstrndx: le_u16(data, 62),
        })
    }

    pub fn validate_riscv64(&self) -> Result<(), ElfError> {
        use TargetMismatch::*;

        if self.e_ident[0..4] != ELF_MAGIC {
            return Err(ElfError::BadSignature);
        }
        let class = self.e_ident[EI_CLASS];
        if class != ELFCLASS64 {
            return Err(ElfError::UnsupportedTarget(Class(class)));
        }
        let data = self.e_ident[EI_DATA];
        if data != ELFDATA2LSB {
            return Err(ElfError::UnsupportedTarget(Encoding(data)));
        }
        let version = self.e_ident[EI_VERSION];
        if version != EV_CURRENT {
            return Err(ElfError::UnsupportedTarget(Version(version)));
        }
        if self.e_machine != EM_RISCV {
            return Err(ElfError::UnsupportedTarget(Machine(self.e_machine)));
        }
        if self.e_type != ET_EXEC {
            return Err(ElfError::UnsupportedTarget(Type(self.e_type)));
        }
        if self.e_phnum > 0 && (self.e_phentsize as usize) < PHDR_SIZE {
            return Err(ElfError::BadProgramHeaderSize(self.e_phentsize));
        }
        Ok(())
    }
}

impl Elf64Phdr {
    /// Decode a program header; trailing bytes past `PHDR_SIZE` are
    /// ignored.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ElfError> {
        if data.len() < PHDR_SIZE {
            return Err(ElfError::TruncatedInput);
        }
        Ok(Self {
            p_type: le_u32(data, 0),
            p_flags: le_u32(data, 4),
            p_offset: le_u64(data, 8),
            p_vaddr: le_u64(data, 16),
            p_paddr: le_u64(data, 24),
            p_filesz: le_u64(data, 32),
            p_memsz: le_u64(data, 40),
            p_align: le_u64(data, 48),
        })
    }

    #[inline]
    pub fn is_load(&self) -> bool {
        self.p_type == PT_LOAD
    }
}

/// Streaming ELF reader.
///
/// The header is read and validated once in [`ElfReader::new`]; program
/// headers are fetched on demand by [`ElfReader::program_headers`].
pub struct ElfReader<R> {
    inner: R,
    ehdr: Elf64Ehdr,
}

impl<R: Read + Seek> ElfReader<R> {
    /// Read and validate the header. The stream must be positioned at the
    /// start of the image.
    pub fn new(mut inner: R) -> Result<Self, ElfError> {
        let mut buf = [0u8; EHDR_SIZE];
        inner.read_exact(&mut buf)?;
        let ehdr = Elf64Ehdr::from_bytes(&buf)?;
        ehdr.validate_riscv64()?;
        Ok(Self { inner, ehdr })
    }

    #[inline]
    pub fn header(&self) -> &Elf64Ehdr {
        &self.ehdr
    }

    #[inline]
    pub fn entry(&self) -> u64 {
        self.ehdr.e_entry
    }

    /// Total length of the underlying stream.
    pub fn stream_len(&mut self) -> Result<u64, ElfError> {
        Ok(self.inner.seek(SeekFrom::End(0))?)
    }

    /// Lazily read the program header table, one entry per step.
    pub fn program_headers(&mut self) -> ProgramHeaders<'_, R> {
        ProgramHeaders {
            inner: &mut self.inner,
            phoff: self.ehdr.e_phoff,
            entsize: self.ehdr.e_phentsize,
            count: self.ehdr.e_phnum,
            index: 0,
            buf: vec![0u8; self.ehdr.e_phentsize as usize],
        }
    }
}

/// Iterator over program headers, see [`ElfReader::program_headers`].
///
/// Stops after the first error.
pub struct ProgramHeaders<'a, R> {
    inner: &'a mut R,
    phoff: u64,
    entsize: u16,
    count: u16,
    index: u16,
    buf: Vec<u8>,
}

impl<R: Read + Seek> ProgramHeaders<'_, R> {
    fn read_entry(&mut self, index: u16) -> Result<Elf64Phdr, ElfError> {
        let pos = (index as u64)
            .checked_mul(self.entsize as u64)
            .and_then(|off| off.checked_add(self.phoff))
            .ok_or(ElfError::TruncatedInput)?;
        self.inner.seek(SeekFrom::Start(pos))?;
        self.inner.read_exact(&mut self.buf)?;
        Elf64Phdr::from_bytes(&self.buf)
    }
}

impl<R: Read + Seek> Iterator for ProgramHeaders<'_, R> {
    type Item = Result<Elf64Phdr, ElfError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.count {
            return None;
        }
        let index = self.index;
        let res = self.read_entry(index);
        self.index = if res.is_ok() { index + 1 } else { self.count };
        Some(res)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some((self.count - self.index) as usize))
    }
}
