// =============================================================================
// Helios — ELF64 Loader
// =============================================================================
//
// Parses ELF64 objects from a borrowed byte slice and loads their PT_LOAD
// segments into an address space. Supports ET_EXEC and (with a caller-
// supplied base) ET_DYN images, section-header parsing, and symbol
// resolution through SYMTAB/STRTAB.
//
// Every offset computation uses checked arithmetic against the slice
// length — the file is untrusted input. Loading allocates one frame per
// page (never assuming physical contiguity), zeroes it, copies the file
// bytes that land in that page and maps it with permissions derived from
// the segment flags:
//
//   PRESENT  always
//   WRITABLE iff PF_W
//   NX       iff not PF_X
//   USER     iff the destination address is in the lower half
//
// On a failed load the caller destroys the partially populated address
// space, which reclaims every mapped frame; only the frame in flight is
// freed here.
//
// =============================================================================

use bitflags::bitflags;

use crate::memory::address::{PAGE_SIZE, PhysAddr, VirtAddr};
use crate::memory::paging::{self, FrameSource, PageTableFlags};

/// ELF magic: 0x7F 'E' 'L' 'F'.
const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
/// 64-bit class.
const ELFCLASS64: u8 = 2;
/// Little-endian data encoding.
const ELFDATA2LSB: u8 = 1;
/// x86_64 machine.
const EM_X86_64: u16 = 62;
/// Executable object.
pub const ET_EXEC: u16 = 2;
/// Shared (position-independent) object.
pub const ET_DYN: u16 = 3;
/// Loadable program header.
const PT_LOAD: u32 = 1;
/// Symbol table section.
const SHT_SYMTAB: u32 = 2;
/// String table section.
const SHT_STRTAB: u32 = 3;

bitflags! {
    /// Program header permission flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentFlags: u32 {
        const EXECUTE = 1;
        const WRITE   = 2;
        const READ    = 4;
    }
}

// =============================================================================
// File structures (System V gABI, x86_64)
// =============================================================================

/// ELF64 file header: 16 identification bytes plus a 48-byte body.
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
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

/// ELF64 program header (56 bytes).
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
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

/// ELF64 section header (64 bytes).
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct Elf64Shdr {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: u64,
    pub sh_addr: u64,
    pub sh_offset: u64,
    pub sh_size: u64,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u64,
    pub sh_entsize: u64,
}

/// ELF64 symbol table entry (24 bytes).
#[derive(Debug, Clone, Copy)]
#[repr(C, packed)]
pub struct Elf64Sym {
    pub st_name: u32,
    pub st_info: u8,
    pub st_other: u8,
    pub st_shndx: u16,
    pub st_value: u64,
    pub st_size: u64,
}

/// Why an image was rejected or a load failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    TooSmall,
    BadMagic,
    NotClass64,
    NotLittleEndian,
    NotX86_64,
    NotExecutable,
    BadHeaderSize,
    OutOfBounds,
    OutOfMemory,
    MapFailed,
}

// =============================================================================
// Parsed image
// =============================================================================

/// A validated view over an ELF64 image. Borrows the file bytes; nothing
/// is copied until `load_into`.
#[derive(Debug)]
pub struct ElfImage<'a> {
    data: &'a [u8],
    header: Elf64Ehdr,
    phdrs: &'a [Elf64Phdr],
    shdrs: &'a [Elf64Shdr],
    symtab: &'a [Elf64Sym],
    strtab: &'a [u8],
}

/// What a successful load produced.
#[derive(Debug, Clone, Copy)]
pub struct LoadedImage {
    /// Runtime entry point (relocation base already applied).
    pub entry: u64,
    /// Highest virtual address any segment occupies; the program break
    /// starts at the next page boundary.
    pub top_addr: u64,
    /// The relocation base the image was loaded with (0 for ET_EXEC).
    pub base: u64,
}

impl<'a> ElfImage<'a> {
    /// Validates `data` as an x86_64 ELF64 executable or shared object
    /// and indexes its header tables.
    pub fn parse(data: &'a [u8]) -> Result<Self, ElfError> {
        if data.len() < size_of::<Elf64Ehdr>() {
            return Err(ElfError::TooSmall);
        }

        // SAFETY: length checked; the struct is packed, so alignment is 1.
        let header = unsafe { *(data.as_ptr() as *const Elf64Ehdr) };

        if header.e_ident[0..4] != ELF_MAGIC {
            return Err(ElfError::BadMagic);
        }
        if header.e_ident[4] != ELFCLASS64 {
            return Err(ElfError::NotClass64);
        }
        if header.e_ident[5] != ELFDATA2LSB {
            return Err(ElfError::NotLittleEndian);
        }
        if header.e_machine != EM_X86_64 {
            return Err(ElfError::NotX86_64);
        }
        if header.e_type != ET_EXEC && header.e_type != ET_DYN {
            return Err(ElfError::NotExecutable);
        }

        let phdrs = if header.e_phnum > 0 {
            if header.e_phentsize as usize != size_of::<Elf64Phdr>() {
                return Err(ElfError::BadHeaderSize);
            }
            table::<Elf64Phdr>(data, header.e_phoff, header.e_phnum as usize)?
        } else {
            &[]
        };

        let shdrs = if header.e_shnum > 0 {
            if header.e_shentsize as usize != size_of::<Elf64Shdr>() {
                return Err(ElfError::BadHeaderSize);
            }
            table::<Elf64Shdr>(data, header.e_shoff, header.e_shnum as usize)?
        } else {
            &[]
        };

        let mut image = Self {
            data,
            header,
            phdrs,
            shdrs,
            symtab: &[],
            strtab: &[],
        };
        image.index_symbols()?;
        Ok(image)
    }

    /// Locates SYMTAB and its linked STRTAB, if the image carries them.
    fn index_symbols(&mut self) -> Result<(), ElfError> {
        for section in self.shdrs {
            if section.sh_type != SHT_SYMTAB {
                continue;
            }
            if section.sh_size as usize % size_of::<Elf64Sym>() != 0 {
                return Err(ElfError::BadHeaderSize);
            }
            let count = section.sh_size as usize / size_of::<Elf64Sym>();
            self.symtab = table::<Elf64Sym>(self.data, section.sh_offset, count)?;

            let link = section.sh_link as usize;
            if link < self.shdrs.len() {
                let strtab = self.shdrs[link];
                if strtab.sh_type == SHT_STRTAB {
                    self.strtab = bytes(self.data, strtab.sh_offset, strtab.sh_size)?;
                }
            }
        }
        Ok(())
    }

    #[allow(dead_code)]
    pub fn header(&self) -> &Elf64Ehdr {
        &self.header
    }

    #[allow(dead_code)]
    pub fn program_headers(&self) -> &[Elf64Phdr] {
        self.phdrs
    }

    #[allow(dead_code)]
    pub fn section_headers(&self) -> &[Elf64Shdr] {
        self.shdrs
    }

    /// The entry point before relocation.
    #[allow(dead_code)]
    pub fn entry(&self) -> u64 {
        self.header.e_entry
    }

    /// Whether the image requires a relocation base.
    pub fn is_relocatable(&self) -> bool {
        self.header.e_type == ET_DYN
    }

    /// A section's name from the section-header string table.
    #[allow(dead_code)]
    pub fn section_name(&self, section: &Elf64Shdr) -> Option<&'a str> {
        let idx = self.header.e_shstrndx as usize;
        if idx >= self.shdrs.len() {
            return None;
        }
        let shstrtab = self.shdrs[idx];
        let strings = bytes(self.data, shstrtab.sh_offset, shstrtab.sh_size).ok()?;
        c_str_at(strings, section.sh_name as usize)
    }

    /// Resolves a symbol name to its runtime address, applying `base` for
    /// relocatable images.
    #[allow(dead_code)]
    pub fn symbol_address(&self, name: &str, base: u64) -> Option<u64> {
        for sym in self.symtab {
            let sym_name = c_str_at(self.strtab, sym.st_name as usize)?;
            if sym_name == name {
                let reloc = if self.is_relocatable() { base } else { 0 };
                return Some(sym.st_value.wrapping_add(reloc));
            }
        }
        None
    }

    // =========================================================================
    // Loading
    // =========================================================================

    /// Loads every PT_LOAD segment into the address space rooted at
    /// `pml4`, one fresh zeroed frame per page.
    ///
    /// `base` is added to segment addresses and the entry point for
    /// ET_DYN images and ignored for ET_EXEC.
    ///
    /// On failure the address space is left partially mapped and the
    /// caller must destroy it (destruction reclaims the mapped frames).
    ///
    /// # Safety
    /// `pml4` must root a live address space reachable through `hhdm`,
    /// and no CPU may be executing from it.
    pub unsafe fn load_into(
        &self,
        hhdm: u64,
        pml4: PhysAddr,
        base: u64,
        nx_supported: bool,
        frames: &mut dyn FrameSource,
    ) -> Result<LoadedImage, ElfError> {
        let reloc = if self.is_relocatable() { base } else { 0 };
        let mut top_addr = 0u64;

        for phdr in self.phdrs {
            if phdr.p_type != PT_LOAD {
                continue;
            }

            let vaddr = phdr.p_vaddr.wrapping_add(reloc);
            let memsz = phdr.p_memsz;
            let filesz = phdr.p_filesz;
            if filesz > memsz {
                return Err(ElfError::OutOfBounds);
            }
            // The whole file window must lie inside the image.
            let file_end = phdr
                .p_offset
                .checked_add(filesz)
                .ok_or(ElfError::OutOfBounds)?;
            if file_end > self.data.len() as u64 {
                return Err(ElfError::OutOfBounds);
            }

            let page_start = vaddr & !(PAGE_SIZE - 1);
            let span = (vaddr - page_start)
                .checked_add(memsz)
                .ok_or(ElfError::OutOfBounds)?;
            let pages = span.div_ceil(PAGE_SIZE);

            let flags = segment_page_flags(
                SegmentFlags::from_bits_truncate(phdr.p_flags),
                VirtAddr::new(page_start),
            );

            for page in 0..pages {
                let page_virt = page_start + page * PAGE_SIZE;
                let frame = frames.alloc_frame().ok_or(ElfError::OutOfMemory)?;

                // Zero the whole frame, then lay in the slice of file
                // bytes that falls inside this page. `p_filesz < p_memsz`
                // tails stay zero for free.
                unsafe {
                    core::ptr::write_bytes(
                        frame.to_virt(hhdm).as_mut_ptr::<u8>(),
                        0,
                        PAGE_SIZE as usize,
                    );
                }
                let copy_start = vaddr.max(page_virt);
                let copy_end = (vaddr + filesz).min(page_virt + PAGE_SIZE);
                if copy_start < copy_end {
                    let len = (copy_end - copy_start) as usize;
                    let src_off = (phdr.p_offset + (copy_start - vaddr)) as usize;
                    let dst_off = (copy_start - page_virt) as usize;
                    unsafe {
                        core::ptr::copy_nonoverlapping(
                            self.data.as_ptr().add(src_off),
                            frame.to_virt(hhdm).as_mut_ptr::<u8>().add(dst_off),
                            len,
                        );
                    }
                }

                let mapped = unsafe {
                    paging::map_page_in(
                        hhdm,
                        pml4,
                        VirtAddr::new(page_virt),
                        frame,
                        flags,
                        nx_supported,
                        frames,
                    )
                };
                if mapped.is_err() {
                    frames.free_frame(frame);
                    return Err(ElfError::MapFailed);
                }
            }

            top_addr = top_addr.max(vaddr + memsz);
        }

        Ok(LoadedImage {
            entry: self.header.e_entry.wrapping_add(reloc),
            top_addr,
            base: reloc,
        })
    }

    /// Reverses `load_into`: unmaps every PT_LOAD page and frees the
    /// frame behind it, page by page — no contiguity assumptions.
    ///
    /// # Safety
    /// As for `load_into`; the image must have been loaded into `pml4`
    /// with the same `base`.
    #[allow(dead_code)]
    pub unsafe fn unload_from(
        &self,
        hhdm: u64,
        pml4: PhysAddr,
        base: u64,
        frames: &mut dyn FrameSource,
    ) {
        let reloc = if self.is_relocatable() { base } else { 0 };
        for phdr in self.phdrs {
            if phdr.p_type != PT_LOAD {
                continue;
            }
            let vaddr = phdr.p_vaddr.wrapping_add(reloc);
            let page_start = vaddr & !(PAGE_SIZE - 1);
            let pages = ((vaddr - page_start) + phdr.p_memsz).div_ceil(PAGE_SIZE);

            for page in 0..pages {
                let page_virt = VirtAddr::new(page_start + page * PAGE_SIZE);
                if let Ok(frame) = unsafe { paging::unmap_page_in(hhdm, pml4, page_virt) } {
                    frames.free_frame(frame.page_align_down());
                }
            }
        }
    }
}

/// Page table flags for a segment: writable iff PF_W, no-execute iff not
/// PF_X, user iff the destination is in the lower half.
fn segment_page_flags(seg: SegmentFlags, dest: VirtAddr) -> PageTableFlags {
    let mut flags = PageTableFlags::PRESENT;
    if seg.contains(SegmentFlags::WRITE) {
        flags |= PageTableFlags::WRITABLE;
    }
    if !seg.contains(SegmentFlags::EXECUTE) {
        flags |= PageTableFlags::NO_EXECUTE;
    }
    if dest.is_user() {
        flags |= PageTableFlags::USER;
    }
    flags
}

// =============================================================================
// Bounds-checked slice access
// =============================================================================

/// A `count`-element table of `T` at byte offset `off`, if it lies fully
/// inside `data`.
fn table<T>(data: &[u8], off: u64, count: usize) -> Result<&[T], ElfError> {
    let bytes_needed = (count as u64)
        .checked_mul(size_of::<T>() as u64)
        .ok_or(ElfError::OutOfBounds)?;
    let end = off.checked_add(bytes_needed).ok_or(ElfError::OutOfBounds)?;
    if end > data.len() as u64 {
        return Err(ElfError::OutOfBounds);
    }
    // SAFETY: range checked above; T is packed (align 1), so any offset
    // is aligned.
    Ok(unsafe { core::slice::from_raw_parts(data.as_ptr().add(off as usize) as *const T, count) })
}

/// The byte range `[off, off+len)` of `data`, bounds checked.
fn bytes(data: &[u8], off: u64, len: u64) -> Result<&[u8], ElfError> {
    let end = off.checked_add(len).ok_or(ElfError::OutOfBounds)?;
    if end > data.len() as u64 {
        return Err(ElfError::OutOfBounds);
    }
    Ok(&data[off as usize..end as usize])
}

/// The NUL-terminated string starting at `off` in a string table.
fn c_str_at(strings: &[u8], off: usize) -> Option<&str> {
    if off >= strings.len() {
        return None;
    }
    let tail = &strings[off..];
    let len = tail.iter().position(|&b| b == 0)?;
    core::str::from_utf8(&tail[..len]).ok()
}

// =============================================================================
// Host tests: hand-crafted images loaded into fake address spaces
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::paging::{leaf_entry_in, translate_in};
    use std::alloc::{Layout, alloc_zeroed, dealloc};

    const HHDM: u64 = 0;

    struct TestFrames {
        live: Vec<u64>,
        freed: Vec<u64>,
    }

    impl TestFrames {
        fn new() -> Self {
            Self {
                live: Vec::new(),
                freed: Vec::new(),
            }
        }

        fn layout() -> Layout {
            Layout::from_size_align(PAGE_SIZE as usize, PAGE_SIZE as usize).unwrap()
        }
    }

    impl FrameSource for TestFrames {
        fn alloc_frame(&mut self) -> Option<PhysAddr> {
            let ptr = unsafe { alloc_zeroed(Self::layout()) };
            assert!(!ptr.is_null());
            self.live.push(ptr as u64);
            Some(PhysAddr::new(ptr as u64))
        }

        fn free_frame(&mut self, frame: PhysAddr) {
            self.freed.push(frame.as_u64());
            if let Some(pos) = self.live.iter().position(|&p| p == frame.as_u64()) {
                self.live.swap_remove(pos);
                unsafe { dealloc(frame.as_u64() as *mut u8, Self::layout()) };
            }
        }
    }

    impl Drop for TestFrames {
        fn drop(&mut self) {
            for &ptr in &self.live {
                unsafe { dealloc(ptr as *mut u8, Self::layout()) };
            }
        }
    }

    fn struct_bytes<T>(value: &T) -> Vec<u8> {
        unsafe {
            core::slice::from_raw_parts(value as *const T as *const u8, size_of::<T>()).to_vec()
        }
    }

    fn ehdr(e_type: u16, phnum: u16, shoff: u64, shnum: u16) -> Elf64Ehdr {
        let mut ident = [0u8; 16];
        ident[0..4].copy_from_slice(&ELF_MAGIC);
        ident[4] = ELFCLASS64;
        ident[5] = ELFDATA2LSB;
        ident[6] = 1; // EV_CURRENT
        Elf64Ehdr {
            e_ident: ident,
            e_type,
            e_machine: EM_X86_64,
            e_version: 1,
            e_entry: 0x40_0000,
            e_phoff: 64,
            e_shoff: shoff,
            e_flags: 0,
            e_ehsize: 64,
            e_phentsize: 56,
            e_phnum: phnum,
            e_shentsize: 64,
            e_shnum: shnum,
            e_shstrndx: 0,
        }
    }

    /// One ET_EXEC image: a single R+X PT_LOAD at 0x400000 with 16 bytes
    /// of file data and a 4096-byte memory image.
    fn small_exec() -> Vec<u8> {
        let mut image = struct_bytes(&ehdr(ET_EXEC, 1, 0, 0));
        let data_off = 64 + 56; // right after the program header
        let phdr = Elf64Phdr {
            p_type: PT_LOAD,
            p_flags: (SegmentFlags::READ | SegmentFlags::EXECUTE).bits(),
            p_offset: data_off as u64,
            p_vaddr: 0x40_0000,
            p_paddr: 0,
            p_filesz: 16,
            p_memsz: 4096,
            p_align: 0x1000,
        };
        image.extend_from_slice(&struct_bytes(&phdr));
        image.extend_from_slice(&[0xA5u8; 16]);
        image
    }

    fn new_space(frames: &mut TestFrames) -> PhysAddr {
        let pml4 = frames.alloc_frame().unwrap();
        pml4
    }

    #[test]
    fn parse_accepts_valid_image() {
        let image = small_exec();
        let elf = ElfImage::parse(&image).unwrap();
        assert_eq!(elf.entry(), 0x40_0000);
        assert_eq!(elf.program_headers().len(), 1);
        assert!(!elf.is_relocatable());
    }

    #[test]
    fn parse_is_idempotent() {
        let image = small_exec();
        let a = ElfImage::parse(&image).unwrap();
        let b = ElfImage::parse(&image).unwrap();
        assert_eq!(a.entry(), b.entry());
        assert_eq!(a.program_headers().len(), b.program_headers().len());
        let pa = a.program_headers()[0];
        let pb = b.program_headers()[0];
        assert_eq!({ pa.p_vaddr }, { pb.p_vaddr });
        assert_eq!({ pa.p_memsz }, { pb.p_memsz });
    }

    #[test]
    fn parse_rejects_malformed_headers() {
        let good = small_exec();

        let mut bad = good.clone();
        bad[0] = 0x7E;
        assert_eq!(ElfImage::parse(&bad).unwrap_err(), ElfError::BadMagic);

        let mut bad = good.clone();
        bad[4] = 1; // 32-bit class
        assert_eq!(ElfImage::parse(&bad).unwrap_err(), ElfError::NotClass64);

        let mut bad = good.clone();
        bad[5] = 2; // big-endian
        assert_eq!(ElfImage::parse(&bad).unwrap_err(), ElfError::NotLittleEndian);

        let mut bad = good.clone();
        bad[18] = 0x28; // e_machine = aarch64
        assert_eq!(ElfImage::parse(&bad).unwrap_err(), ElfError::NotX86_64);

        let mut bad = good.clone();
        bad[16] = 1; // ET_REL
        assert_eq!(ElfImage::parse(&bad).unwrap_err(), ElfError::NotExecutable);

        assert_eq!(ElfImage::parse(&good[..32]).unwrap_err(), ElfError::TooSmall);

        // Program header table reaching past the file (e_phnum is at
        // byte offset 56 of the header).
        let mut bad = good.clone();
        bad[56..58].copy_from_slice(&1000u16.to_le_bytes());
        assert_eq!(ElfImage::parse(&bad).unwrap_err(), ElfError::OutOfBounds);
    }

    #[test]
    fn load_copies_file_bytes_and_zero_fills() {
        let image = small_exec();
        let elf = ElfImage::parse(&image).unwrap();
        let mut frames = TestFrames::new();
        let pml4 = new_space(&mut frames);

        let loaded = unsafe { elf.load_into(HHDM, pml4, 0, true, &mut frames) }.unwrap();
        assert_eq!(loaded.entry, 0x40_0000);
        assert_eq!(loaded.top_addr, 0x40_1000);

        let phys = unsafe { translate_in(HHDM, pml4, VirtAddr::new(0x40_0000)) }.unwrap();
        let page = unsafe { core::slice::from_raw_parts(phys.as_u64() as *const u8, 4096) };
        assert!(page[..16].iter().all(|&b| b == 0xA5));
        assert!(page[16..].iter().all(|&b| b == 0));
    }

    #[test]
    fn segment_permissions_reach_the_leaf_entry() {
        let image = small_exec();
        let elf = ElfImage::parse(&image).unwrap();
        let mut frames = TestFrames::new();
        let pml4 = new_space(&mut frames);

        unsafe { elf.load_into(HHDM, pml4, 0, true, &mut frames) }.unwrap();
        let raw = unsafe { leaf_entry_in(HHDM, pml4, VirtAddr::new(0x40_0000)) }.unwrap();

        // R+X in the lower half: user, not writable, executable.
        assert_ne!(raw & PageTableFlags::USER.bits(), 0);
        assert_eq!(raw & PageTableFlags::WRITABLE.bits(), 0);
        assert_eq!(raw & PageTableFlags::NO_EXECUTE.bits(), 0);
    }

    #[test]
    fn et_dyn_applies_the_base() {
        let mut image = struct_bytes(&ehdr(ET_DYN, 1, 0, 0));
        let phdr = Elf64Phdr {
            p_type: PT_LOAD,
            p_flags: SegmentFlags::READ.bits(),
            p_offset: 120,
            p_vaddr: 0x1000,
            p_paddr: 0,
            p_filesz: 8,
            p_memsz: 8,
            p_align: 0x1000,
        };
        image.extend_from_slice(&struct_bytes(&phdr));
        image.extend_from_slice(&[0x11u8; 8]);
        // Fix the entry to sit inside the segment.
        image[24..32].copy_from_slice(&0x1000u64.to_le_bytes());

        let elf = ElfImage::parse(&image).unwrap();
        let mut frames = TestFrames::new();
        let pml4 = new_space(&mut frames);

        let base = 0x50_0000u64;
        let loaded = unsafe { elf.load_into(HHDM, pml4, base, true, &mut frames) }.unwrap();
        assert_eq!(loaded.entry, base + 0x1000);
        assert!(
            unsafe { translate_in(HHDM, pml4, VirtAddr::new(base + 0x1000)) }.is_some()
        );
    }

    #[test]
    fn unload_frees_every_mapped_frame() {
        let image = small_exec();
        let elf = ElfImage::parse(&image).unwrap();
        let mut frames = TestFrames::new();
        let pml4 = new_space(&mut frames);

        unsafe { elf.load_into(HHDM, pml4, 0, true, &mut frames) }.unwrap();
        let phys = unsafe { translate_in(HHDM, pml4, VirtAddr::new(0x40_0000)) }.unwrap();

        unsafe { elf.unload_from(HHDM, pml4, 0, &mut frames) };
        assert!(frames.freed.contains(&phys.as_u64()));
        assert!(unsafe { translate_in(HHDM, pml4, VirtAddr::new(0x40_0000)) }.is_none());
    }

    #[test]
    fn symbols_resolve_through_strtab() {
        // Layout: ehdr | phdr-less | shdrs(3) | symtab(2) | strtab
        let shoff = 64u64;
        let symtab_off = shoff + 3 * 64;
        let strtab_off = symtab_off + 2 * 24;
        let strtab: &[u8] = b"\0main\0";

        let mut image = struct_bytes(&ehdr(ET_EXEC, 0, shoff, 3));
        let null_shdr = Elf64Shdr {
            sh_name: 0,
            sh_type: 0,
            sh_flags: 0,
            sh_addr: 0,
            sh_offset: 0,
            sh_size: 0,
            sh_link: 0,
            sh_info: 0,
            sh_addralign: 0,
            sh_entsize: 0,
        };
        let symtab_shdr = Elf64Shdr {
            sh_type: SHT_SYMTAB,
            sh_offset: symtab_off,
            sh_size: 2 * 24,
            sh_link: 2,
            sh_entsize: 24,
            ..null_shdr
        };
        let strtab_shdr = Elf64Shdr {
            sh_type: SHT_STRTAB,
            sh_offset: strtab_off,
            sh_size: strtab.len() as u64,
            ..null_shdr
        };
        image.extend_from_slice(&struct_bytes(&null_shdr));
        image.extend_from_slice(&struct_bytes(&symtab_shdr));
        image.extend_from_slice(&struct_bytes(&strtab_shdr));

        let null_sym = Elf64Sym {
            st_name: 0,
            st_info: 0,
            st_other: 0,
            st_shndx: 0,
            st_value: 0,
            st_size: 0,
        };
        let main_sym = Elf64Sym {
            st_name: 1,
            st_value: 0x40_1234,
            ..null_sym
        };
        image.extend_from_slice(&struct_bytes(&null_sym));
        image.extend_from_slice(&struct_bytes(&main_sym));
        image.extend_from_slice(strtab);

        let elf = ElfImage::parse(&image).unwrap();
        assert_eq!(elf.symbol_address("main", 0), Some(0x40_1234));
        assert_eq!(elf.symbol_address("missing", 0), None);
    }
}
