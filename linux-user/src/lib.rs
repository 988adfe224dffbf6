//! RISC-V ELF64 loader for the user-mode emulator.
//!
//! Parses a static executable and maps its `PT_LOAD` segments into a
//! reserved region of the host address space that serves as guest
//! memory. Guest address `g` lives at host address `guest_base + g`.

pub mod elf;
pub mod guest_space;
pub mod loader;
pub mod mmu;

pub use elf::{
    Elf64Ehdr, Elf64Phdr, ElfError, ElfReader, TargetMismatch, EM_RISCV,
    ET_EXEC, PF_R, PF_W, PF_X, PT_LOAD, PT_PHDR,
};
pub use guest_space::{GuestSpace, MapError};
pub use loader::{load_elf, load_program, LoadError, SegmentLayout};
pub use mmu::{AllocError, Mmu};
