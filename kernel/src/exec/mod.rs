//! Program execution: the ELF64 loader.

pub mod elf;
